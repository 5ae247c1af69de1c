//! Master tethering state machine.
//!
//! The master owns everything global: the IP-forwarding switch, the DHCP
//! range lifecycle, DNS forwarder programming, upstream selection, and
//! error recovery. It lives inside the [`TetheringDriver`](crate::TetheringDriver)
//! and exchanges messages with the per-interface machines through the
//! driver's internal queue.

mod driver;

pub use driver::TetheringDriver;
pub(crate) use driver::Command;

use crate::{
    iface::MachineId,
    types::{ErrorCode, NetworkState},
    upstream::UpstreamEventKind,
};

/// How long to let the upstream situation settle before retrying selection
/// when no candidate was found and cellular was not tried.
pub(crate) const UPSTREAM_SETTLE_TIME_MS: u64 = 10_000;

/// Messages consumed by the master machine.
#[derive(Debug, Clone)]
pub(crate) enum MasterMessage {
    /// An interface machine wants tether mode.
    TetherModeRequested(MachineId),
    /// An interface machine no longer wants tether mode.
    TetherModeUnrequested(MachineId),
    /// Connectivity changed; re-run upstream selection.
    UpstreamChanged,
    /// Delayed re-selection after no upstream was found.
    RetryUpstream,
    /// A transition observed by the upstream monitor.
    UpstreamEvent(UpstreamEventKind, NetworkState),
    /// Leave the current error state and return to initial.
    ClearError,
}

/// Which master operation failed. One error state, discriminated by kind,
/// rather than one state per failing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    EnableForwarding,
    DisableForwarding,
    StartTethering,
    StopTethering,
    SetDnsForwarders,
}

impl ErrorKind {
    /// The code broadcast to interface machines when this error is entered.
    pub(crate) fn error_code(self) -> ErrorCode {
        match self {
            Self::EnableForwarding => ErrorCode::IpForwardingEnableError,
            Self::DisableForwarding => ErrorCode::IpForwardingDisableError,
            Self::StartTethering => ErrorCode::StartTetheringError,
            Self::StopTethering => ErrorCode::StopTetheringError,
            Self::SetDnsForwarders => ErrorCode::SetDnsForwardersError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MasterState {
    Initial,
    TetherModeAlive,
    Error(ErrorKind),
}

/// The master machine's bookkeeping: its state, the request list, and the
/// upstream selection context.
pub(crate) struct MasterMachine {
    pub state: MasterState,
    /// Machines that have requested tether mode and not yet unrequested.
    /// Deliberately independent of the registry: a machine stays here
    /// through teardown even after its interface was removed.
    request_list: Vec<MachineId>,
    /// Which way the next scheduled retry leans: try cellular or not.
    pub try_cell: bool,
    /// Interface name of the selected upstream, if one with an IPv4 default
    /// route was found.
    pub current_upstream_iface: Option<String>,
    /// The code recorded on error entry, replayed to late requesters.
    pub error_code: ErrorCode,
}

impl MasterMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: MasterState::Initial,
            request_list: Vec::new(),
            try_cell: true,
            current_upstream_iface: None,
            error_code: ErrorCode::NoError,
        }
    }

    /// Appends `id` to the request list. Returns `false` (and leaves the
    /// list unchanged) if it is already present.
    pub(crate) fn add_request(&mut self, id: MachineId) -> bool {
        if self.request_list.contains(&id) {
            return false;
        }
        self.request_list.push(id);
        true
    }

    /// Removes `id` from the request list. Returns `false` if it was not
    /// present.
    pub(crate) fn remove_request(&mut self, id: MachineId) -> bool {
        let before = self.request_list.len();
        self.request_list.retain(|other| *other != id);
        self.request_list.len() != before
    }

    pub(crate) fn request_list(&self) -> &[MachineId] {
        &self.request_list
    }

    pub(crate) fn has_requests(&self) -> bool {
        !self.request_list.is_empty()
    }
}
