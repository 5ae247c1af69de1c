//! Per-downstream-interface state machine.
//!
//! One machine per tetherable interface the OS reports. Machines are owned
//! by the driver and addressed by [`MachineId`] handles; the registry and
//! the master's request list only ever store handles, never the machines
//! themselves.

mod machine;

pub(crate) use machine::{InterfaceMachine, MachineCtx, MachineStatus};

use std::fmt;

use crate::types::{ErrorCode, InterfaceState};

/// Opaque handle of an interface state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineId(pub(crate) u64);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iface-sm-{}", self.0)
    }
}

/// Messages delivered to an interface state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IfaceMessage {
    /// A caller asked for this interface to be tethered.
    TetherRequested,
    /// A caller asked for this interface to stop being tethered.
    TetherUnrequested,
    /// The interface went away; tear down and terminate.
    InterfaceDown,
    /// The master's answer to a tether-mode request, and every subsequent
    /// upstream change: the upstream interface to forward through, or
    /// `None` when there is none right now.
    ConnectionChanged(Option<String>),
    /// A master error notification, carrying the specific code.
    Error(ErrorCode),
}

/// A machine's state/error report, consumed by the driver: it updates the
/// registry, couples the machine to the master request list, and triggers
/// the state broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StateReport {
    pub iface: String,
    pub machine: MachineId,
    pub state: InterfaceState,
    pub error: ErrorCode,
}
