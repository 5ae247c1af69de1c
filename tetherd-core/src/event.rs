//! Broadcast adapter: normalizes OS-delivered broadcasts into the typed
//! events the driver consumes.
//!
//! The [`EventBus`] is the single component platform glue feeds raw
//! broadcasts into. It owns the normalization rules (e.g. dropping FAILED
//! connectivity changes, compiling configuration snapshots) so the driver
//! only ever sees well-formed [`OsEvent`]s. Dropping the last `EventBus`
//! clone closes the event stream, which is how subscriptions are guaranteed
//! to end on shutdown.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::config::{ConfigError, TetheringConfig, TetheringSettings};

/// Buffer for OS events on their way to the driver.
pub(crate) const EVENT_BUFFER_SIZE: usize = 256;

/// Soft-AP lifecycle states as reported by the Wi-Fi subsystem.
///
/// `Enabling` is not a promise: the radio may go straight to `Disabled` or
/// `Failed` without ever reaching `Enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiApState {
    Enabling,
    Enabled,
    Disabling,
    Disabled,
    Failed,
}

/// Detailed connectivity state from a connectivity-change broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailedState {
    Connecting,
    Connected,
    Suspended,
    Disconnecting,
    Disconnected,
    Failed,
}

/// SIM card state as carried by the telephony broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    Absent,
    NotReady,
    Loaded,
    Unknown,
}

impl SimState {
    /// Maps the raw broadcast string onto a state tag.
    pub fn from_announcement(state: &str) -> Self {
        match state {
            "LOADED" => Self::Loaded,
            "ABSENT" => Self::Absent,
            "NOT_READY" => Self::NotReady,
            _ => Self::Unknown,
        }
    }

    pub const fn is_loaded(self) -> bool {
        matches!(self, Self::Loaded)
    }
}

/// A normalized OS broadcast.
#[derive(Debug, Clone)]
pub(crate) enum OsEvent {
    UsbState { connected: bool, rndis_enabled: bool },
    ConnectivityChanged,
    WifiApState(WifiApState),
    ConfigChanged(Arc<TetheringConfig>),
    SimState(SimState),
    InterfaceAdded(String),
    InterfaceRemoved(String),
    InterfaceStatusChanged { iface: String, up: bool },
}

/// Handle the platform glue uses to feed broadcasts into the control plane.
///
/// Cheap to clone; every source (USB, connectivity, Wi-Fi, telephony,
/// netlink watcher) can hold its own copy.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<OsEvent>,
}

impl EventBus {
    pub(crate) fn new() -> (Self, mpsc::Receiver<OsEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        (Self { tx }, rx)
    }

    /// A bus with no consumer. Every event is dropped; only useful for
    /// exercising event sources in isolation.
    #[doc(hidden)]
    pub fn detached() -> Self {
        let (bus, _rx) = Self::new();
        bus
    }

    fn push(&self, event: OsEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("dropping OS event: {e}");
        }
    }

    /// USB state broadcast: cable attach state and whether the RNDIS
    /// function is currently active.
    pub fn usb_state(&self, connected: bool, rndis_enabled: bool) {
        self.push(OsEvent::UsbState { connected, rndis_enabled });
    }

    /// Connectivity-change broadcast. `Failed` states are filtered here and
    /// never reach the driver.
    pub fn connectivity_changed(&self, state: DetailedState) {
        if state == DetailedState::Failed {
            return;
        }
        self.push(OsEvent::ConnectivityChanged);
    }

    pub fn wifi_ap_state(&self, state: WifiApState) {
        self.push(OsEvent::WifiApState(state));
    }

    /// Configuration-change broadcast. Compiles the new settings into a
    /// snapshot; the old snapshot stays live if compilation fails.
    pub fn config_changed(&self, settings: TetheringSettings) -> Result<(), ConfigError> {
        let config = settings.compile()?;
        self.push(OsEvent::ConfigChanged(Arc::new(config)));
        Ok(())
    }

    /// SIM state broadcast, as the raw state string.
    pub fn sim_state(&self, state: &str) {
        self.push(OsEvent::SimState(SimState::from_announcement(state)));
    }

    pub fn interface_added(&self, iface: &str) {
        self.push(OsEvent::InterfaceAdded(iface.to_string()));
    }

    pub fn interface_removed(&self, iface: &str) {
        self.push(OsEvent::InterfaceRemoved(iface.to_string()));
    }

    pub fn interface_status_changed(&self, iface: &str, up: bool) {
        self.push(OsEvent::InterfaceStatusChanged { iface: iface.to_string(), up });
    }

    /// Link state changes are reported the same way as status changes.
    pub fn interface_link_state_changed(&self, iface: &str, up: bool) {
        self.interface_status_changed(iface, up);
    }
}
