//! Interfaces to the external collaborators the control plane drives.
//!
//! The orchestrator never forwards a packet, owns a NAT table, or talks to a
//! radio itself; it issues bounded, synchronous calls against these traits
//! and reacts to the events they produce. Implementations must not block
//! indefinitely: a slow collaborator stalls the whole event loop, and a
//! failing one is expected to return an error, not panic.

use std::{net::IpAddr, sync::Arc};

use thiserror::Error;

use crate::types::{ErrorCode, InterfaceType, LinkProperties, NetworkId, NetworkState};

/// Failure of a network-management service call.
#[derive(Debug, Error)]
pub enum NmsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command failed: {0}")]
    Command(String),
    #[error("service unavailable")]
    Unavailable,
}

/// The low-level network-management service: the collaborator that actually
/// flips IP forwarding and configures NAT, DHCP, and DNS forwarding.
pub trait NetworkManager: Send + Sync {
    fn set_ip_forwarding_enabled(&self, enabled: bool) -> Result<(), NmsError>;

    /// Starts the tethering service with the given DHCP pools, passed as
    /// start/end address pairs.
    fn start_tethering(&self, dhcp_ranges: &[String]) -> Result<(), NmsError>;

    fn stop_tethering(&self) -> Result<(), NmsError>;

    /// Points the DNS forwarders at `dns`, resolving through `network`.
    fn set_dns_forwarders(&self, network: Option<NetworkId>, dns: &[IpAddr]) -> Result<(), NmsError>;

    /// Names of all interfaces currently known to the service.
    fn list_interfaces(&self) -> Result<Vec<String>, NmsError>;

    /// Adds `iface` to the set of tethered downstreams.
    fn tether_interface(&self, iface: &str) -> Result<(), NmsError>;

    /// Removes `iface` from the set of tethered downstreams.
    fn untether_interface(&self, iface: &str) -> Result<(), NmsError>;

    /// Installs forwarding/NAT between a downstream and the upstream.
    fn enable_nat(&self, downstream: &str, upstream: &str) -> Result<(), NmsError>;

    fn disable_nat(&self, downstream: &str, upstream: &str) -> Result<(), NmsError>;
}

/// Thin control surface of the USB subsystem.
pub trait UsbControl: Send + Sync {
    /// Selects the active USB function; `Some("rndis")` exposes the device
    /// as a USB NIC, `None` restores the default function set.
    fn set_current_function(&self, function: Option<&str>);
}

/// Thin control surface of the Wi-Fi subsystem.
pub trait WifiControl: Send + Sync {
    /// Asks the radio to bring the soft-AP up or down. Returns `false` if
    /// the request could not even be issued; the actual outcome arrives
    /// later as an AP-state event.
    fn set_wifi_ap_enabled(&self, enabled: bool) -> bool;
}

/// Thin control surface of the Bluetooth PAN profile.
pub trait BluetoothPan: Send + Sync {
    /// Whether the Bluetooth adapter is present and enabled.
    fn is_adapter_enabled(&self) -> bool;

    fn set_bluetooth_tethering(&self, enable: bool);

    /// Current PAN tethering state. May lag a just-issued
    /// [`set_bluetooth_tethering`](Self::set_bluetooth_tethering) call.
    fn is_tethering_on(&self) -> bool;
}

/// Carrier provisioning service: entitlement checks and their periodic
/// rechecks. Scheduling is external (platform alarms), not in-core timers.
pub trait Provisioner: Send + Sync {
    /// Whether the current carrier configuration demands entitlement checks.
    fn entitlement_checks_required(&self) -> bool;

    /// Runs the interactive provisioning flow; the outcome is delivered to
    /// `sink`.
    fn run_ui_provisioning(&self, ty: InterfaceType, sink: Box<dyn ResultSink>);

    /// Runs the background provisioning flow; the outcome is delivered to
    /// `sink`.
    fn run_silent_provisioning(&self, ty: InterfaceType, sink: Box<dyn ResultSink>);

    fn schedule_rechecks(&self, ty: InterfaceType);

    fn cancel_rechecks(&self, ty: InterfaceType);
}

/// Hardware-offload controller. Lifecycle-tied to tether mode, otherwise
/// opaque to the control plane.
pub trait OffloadControl: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn set_upstream_link_properties(&self, lp: Option<&LinkProperties>);
}

/// Hook for the stack-specific IPv6 tethering coordination.
pub trait Ipv6Coordinator: Send + Sync {
    fn update_upstream_network_state(&self, ns: Option<&NetworkState>);
    fn add_active_downstream(&self, iface: &str);
    fn remove_active_downstream(&self, iface: &str);
}

/// Receives the tether-state broadcast on every significant change.
/// Delivery to the rest of the system (sticky broadcasts, notifications) is
/// the implementor's business.
pub trait StateSink: Send + Sync {
    fn on_tether_state_changed(&self, snapshot: &crate::tethering::TetherStateSnapshot);
}

/// A one-way result capability: the caller of an asynchronous operation
/// hands one in and eventually receives exactly one code through it.
pub trait ResultSink: Send {
    fn send(self: Box<Self>, code: ErrorCode);
}

impl<F> ResultSink for F
where
    F: FnOnce(ErrorCode) + Send,
{
    fn send(self: Box<Self>, code: ErrorCode) {
        self(code)
    }
}

/// No-op offload controller for devices without offload hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOffload;

impl OffloadControl for NoOffload {
    fn start(&self) {}
    fn stop(&self) {}
    fn set_upstream_link_properties(&self, _lp: Option<&LinkProperties>) {}
}

/// No-op IPv6 coordinator for IPv4-only deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIpv6;

impl Ipv6Coordinator for NoIpv6 {
    fn update_upstream_network_state(&self, _ns: Option<&NetworkState>) {}
    fn add_active_downstream(&self, _iface: &str) {}
    fn remove_active_downstream(&self, _iface: &str) {}
}

/// The full collaborator set handed to the orchestrator at construction.
#[derive(Clone)]
pub struct Services {
    pub nms: Arc<dyn NetworkManager>,
    pub usb: Arc<dyn UsbControl>,
    pub wifi: Arc<dyn WifiControl>,
    pub bluetooth: Arc<dyn BluetoothPan>,
    pub provisioner: Arc<dyn Provisioner>,
    pub state_sink: Arc<dyn StateSink>,
    pub offload: Arc<dyn OffloadControl>,
    pub ipv6: Arc<dyn Ipv6Coordinator>,
}

impl Services {
    /// Builds the collaborator set with no-op offload and IPv6 hooks.
    pub fn new(
        nms: Arc<dyn NetworkManager>,
        usb: Arc<dyn UsbControl>,
        wifi: Arc<dyn WifiControl>,
        bluetooth: Arc<dyn BluetoothPan>,
        provisioner: Arc<dyn Provisioner>,
        state_sink: Arc<dyn StateSink>,
    ) -> Self {
        Self {
            nms,
            usb,
            wifi,
            bluetooth,
            provisioner,
            state_sink,
            offload: Arc::new(NoOffload),
            ipv6: Arc::new(NoIpv6),
        }
    }

    /// Attaches a hardware-offload controller.
    pub fn with_offload(mut self, offload: Arc<dyn OffloadControl>) -> Self {
        self.offload = offload;
        self
    }

    /// Attaches the IPv6 tethering coordination hook.
    pub fn with_ipv6(mut self, ipv6: Arc<dyn Ipv6Coordinator>) -> Self {
        self.ipv6 = ipv6;
        self
    }
}
