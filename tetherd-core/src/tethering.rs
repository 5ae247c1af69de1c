//! Orchestrator facade.
//!
//! [`Tethering`] is the public, thread-safe entry point. Its methods only
//! ever touch the registry mutex and the command channel; all state-machine
//! work happens on the [`TetheringDriver`] task the constructor hands back.

use std::{fmt::Write as _, sync::Arc};

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::{
    config::TetheringConfig,
    event::EventBus,
    master::{Command, TetheringDriver},
    provision::is_provisioning_required,
    registry::TetherStateRegistry,
    services::{ResultSink, Services},
    types::{ErrorCode, InterfaceState, InterfaceType},
    upstream::{ConnectivityPort, UpstreamMonitor, CONNECTIVITY_BUFFER_SIZE},
};

const COMMAND_BUFFER_SIZE: usize = 64;

/// The USB function that exposes the device as an Ethernet NIC.
const RNDIS_FUNCTION: &str = "rndis";

/// Errors returned synchronously from the facade.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("unknown interface: {0}")]
    UnknownIface(String),
    #[error("interface not in a usable state: {0}")]
    UnavailIface(String),
    #[error("required service unavailable")]
    ServiceUnavail,
    #[error("tethering control plane is not running")]
    NotRunning,
}

impl TetherError {
    /// The stable error code this maps to on the status surface.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnknownIface(_) => ErrorCode::UnknownIface,
            Self::UnavailIface(_) => ErrorCode::UnavailIface,
            Self::ServiceUnavail | Self::NotRunning => ErrorCode::ServiceUnavail,
        }
    }
}

/// Derived notification class of a state broadcast: which downstream
/// classes are actively tethered.
///
/// Wi-Fi-only tethering maps to [`None`](Self::None): the platform's own
/// status surface already covers the soft-AP, so no notification is raised
/// for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationClass {
    /// Nothing to show.
    #[default]
    None,
    Usb,
    Bluetooth,
    /// More than one downstream class active.
    General,
}

/// The state broadcast emitted on every significant change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TetherStateSnapshot {
    pub available: Vec<String>,
    pub active: Vec<String>,
    pub errored: Vec<String>,
    pub notification: NotificationClass,
}

/// State shared between the facade handles and the driver: the registry
/// (plus subsystem flags, under the same mutex), the configuration
/// snapshot, the collaborators, and the command channel into the driver.
pub(crate) struct SharedState {
    pub(crate) registry: TetherStateRegistry,
    pub(crate) config: ArcSwap<TetheringConfig>,
    pub(crate) services: Services,
    cmd_tx: mpsc::Sender<Command>,
}

impl SharedState {
    pub(crate) fn send_command(&self, cmd: Command) -> Result<(), TetherError> {
        self.cmd_tx.try_send(cmd).map_err(|e| {
            error!("failed to issue command to the driver: {e}");
            TetherError::NotRunning
        })
    }

    /// Requests tether mode for `iface`. The interface must be tracked and
    /// available; past errors on it are ignored, they refer to previous
    /// attempts.
    pub(crate) fn tether(&self, iface: &str) -> Result<(), TetherError> {
        debug!(%iface, "tether requested");
        let entry =
            self.registry.get(iface).ok_or_else(|| TetherError::UnknownIface(iface.to_string()))?;
        if entry.last_state != InterfaceState::Available {
            warn!(%iface, state = ?entry.last_state, "tried to tether an unavailable interface");
            return Err(TetherError::UnavailIface(iface.to_string()));
        }
        self.send_command(Command::Tether { iface: iface.to_string() })
    }

    pub(crate) fn untether(&self, iface: &str) -> Result<(), TetherError> {
        debug!(%iface, "untether requested");
        let entry =
            self.registry.get(iface).ok_or_else(|| TetherError::UnknownIface(iface.to_string()))?;
        if entry.last_state != InterfaceState::Tethered {
            warn!(%iface, state = ?entry.last_state, "tried to untether an untethered interface");
            return Err(TetherError::UnavailIface(iface.to_string()));
        }
        self.send_command(Command::Untether { iface: iface.to_string() })
    }

    /// Finds the first known interface of the given class and tethers or
    /// untethers it.
    pub(crate) fn tether_matching_interfaces(&self, enable: bool, ty: InterfaceType) {
        debug!(enable, %ty, "looking for a matching interface");

        let ifaces = match self.services.nms.list_interfaces() {
            Ok(ifaces) => ifaces,
            Err(e) => {
                error!("error listing interfaces: {e}");
                return;
            }
        };

        let config = self.config.load();
        let Some(chosen) = ifaces.into_iter().find(|iface| config.classify(iface) == Some(ty)) else {
            error!(%ty, "could not find an interface to tether");
            return;
        };

        let result = if enable { self.tether(&chosen) } else { self.untether(&chosen) };
        if let Err(e) = result {
            error!(iface = %chosen, "unable to start or stop tethering: {e}");
        }
    }

    /// Builds and publishes the {available, active, errored} broadcast with
    /// its derived notification class.
    pub(crate) fn send_state_broadcast(&self) {
        let config = self.config.load();

        let mut available = Vec::new();
        let mut active = Vec::new();
        let mut errored = Vec::new();
        let (mut usb, mut wifi, mut bluetooth) = (false, false, false);

        for (iface, entry) in self.registry.snapshot() {
            if entry.last_error.is_error() {
                errored.push(iface);
            } else if entry.last_state == InterfaceState::Available {
                available.push(iface);
            } else if entry.last_state == InterfaceState::Tethered {
                match config.classify(&iface) {
                    Some(InterfaceType::Usb) => usb = true,
                    Some(InterfaceType::Wifi) => wifi = true,
                    Some(InterfaceType::Bluetooth) => bluetooth = true,
                    None => {}
                }
                active.push(iface);
            }
        }

        available.sort();
        active.sort();
        errored.sort();

        let notification = match (usb, wifi, bluetooth) {
            (true, false, false) => NotificationClass::Usb,
            (false, false, true) => NotificationClass::Bluetooth,
            // Wi-Fi tethering has a status-bar icon of its own; drop the
            // notification rather than raising a Wi-Fi class.
            (false, true, false) | (false, false, false) => NotificationClass::None,
            _ => NotificationClass::General,
        };

        let snapshot = TetherStateSnapshot { available, active, errored, notification };
        debug!(
            available = ?snapshot.available,
            active = ?snapshot.active,
            errored = ?snapshot.errored,
            "tether state changed"
        );
        self.services.state_sink.on_tether_state_changed(&snapshot);
    }
}

/// Public handle of the tethering control plane. Cheap to clone and safe to
/// call from any thread.
#[derive(Clone)]
pub struct Tethering {
    shared: Arc<SharedState>,
}

impl Tethering {
    /// Wires up the control plane.
    ///
    /// Returns the facade, the driver future (spawn it on the runtime), the
    /// event bus for platform broadcasts, and the platform-facing endpoint
    /// of the connectivity channel.
    pub fn new(
        config: TetheringConfig,
        services: Services,
    ) -> (Self, TetheringDriver, EventBus, ConnectivityPort) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (bus, events_rx) = EventBus::new();
        let (monitor_port, platform_port) =
            tetherd_common::channel(CONNECTIVITY_BUFFER_SIZE, CONNECTIVITY_BUFFER_SIZE);

        let shared = Arc::new(SharedState {
            registry: TetherStateRegistry::new(),
            config: ArcSwap::from_pointee(config),
            services,
            cmd_tx,
        });

        let driver = TetheringDriver::new(
            Arc::clone(&shared),
            cmd_rx,
            events_rx,
            UpstreamMonitor::new(monitor_port),
        );

        (Self { shared }, driver, bus, platform_port)
    }

    /// Starts tethering of the given class, passing through carrier
    /// provisioning first when required. The outcome is delivered to
    /// `sink`.
    pub fn start_tethering(&self, ty: InterfaceType, sink: Box<dyn ResultSink>, show_ui: bool) {
        if !self.provisioning_required() {
            self.enable_tethering_internal(ty, true, Some(sink));
            return;
        }

        let proxy = self.provision_proxy(ty, sink);
        if show_ui {
            self.shared.services.provisioner.run_ui_provisioning(ty, proxy);
        } else {
            self.shared.services.provisioner.run_silent_provisioning(ty, proxy);
        }
    }

    /// Stops tethering of the given class and cancels any pending
    /// provisioning rechecks for it.
    pub fn stop_tethering(&self, ty: InterfaceType) {
        self.enable_tethering_internal(ty, false, None);
        if self.provisioning_required() {
            self.shared.services.provisioner.cancel_rechecks(ty);
        }
    }

    /// A result sink that enables tethering when provisioning succeeded and
    /// forwards the failure code otherwise.
    fn provision_proxy(&self, ty: InterfaceType, sink: Box<dyn ResultSink>) -> Box<dyn ResultSink> {
        let this = self.clone();
        Box::new(move |code: ErrorCode| {
            if code == ErrorCode::NoError {
                this.enable_tethering_internal(ty, true, Some(sink));
            } else {
                sink.send(code);
            }
        })
    }

    fn enable_tethering_internal(
        &self,
        ty: InterfaceType,
        enable: bool,
        sink: Option<Box<dyn ResultSink>>,
    ) {
        let schedule_rechecks = enable && self.provisioning_required();

        match ty {
            InterfaceType::Wifi => {
                let result = self.set_wifi_tethering(enable);
                if schedule_rechecks && result == ErrorCode::NoError {
                    self.shared.services.provisioner.schedule_rechecks(ty);
                }
                if let Some(sink) = sink {
                    sink.send(result);
                }
            }
            InterfaceType::Usb => {
                let result = self.set_usb_tethering(enable);
                if schedule_rechecks && result == ErrorCode::NoError {
                    self.shared.services.provisioner.schedule_rechecks(ty);
                }
                if let Some(sink) = sink {
                    sink.send(result);
                }
            }
            InterfaceType::Bluetooth => self.set_bluetooth_tethering(enable, sink),
        }
    }

    fn set_wifi_tethering(&self, enable: bool) -> ErrorCode {
        debug!(enable, "set Wi-Fi tethering");
        self.shared.registry.with_flags(|flags| flags.wifi_tether_requested = enable);
        if self.shared.services.wifi.set_wifi_ap_enabled(enable) {
            ErrorCode::NoError
        } else {
            ErrorCode::MasterError
        }
    }

    /// Enables or disables USB tethering.
    ///
    /// Enabling with RNDIS already up tethers the matching interface right
    /// away; otherwise the request is parked and the USB broadcast handler
    /// completes it once RNDIS comes up.
    pub fn set_usb_tethering(&self, enable: bool) -> ErrorCode {
        debug!(enable, "set USB tethering");

        if enable {
            let rndis_up = self.shared.registry.with_flags(|flags| {
                if flags.rndis_enabled {
                    true
                } else {
                    flags.usb_tether_requested = true;
                    false
                }
            });

            if rndis_up {
                self.shared.tether_matching_interfaces(true, InterfaceType::Usb);
            } else {
                self.shared.services.usb.set_current_function(Some(RNDIS_FUNCTION));
            }
        } else {
            self.shared.tether_matching_interfaces(false, InterfaceType::Usb);
            let rndis_up = self.shared.registry.with_flags(|flags| {
                flags.usb_tether_requested = false;
                flags.rndis_enabled
            });
            if rndis_up {
                self.shared.services.usb.set_current_function(None);
            }
        }

        ErrorCode::NoError
    }

    fn set_bluetooth_tethering(&self, enable: bool, sink: Option<Box<dyn ResultSink>>) {
        let bluetooth = &self.shared.services.bluetooth;
        if !bluetooth.is_adapter_enabled() {
            warn!("tried to toggle bluetooth tethering with the adapter down");
            if let Some(sink) = sink {
                sink.send(ErrorCode::ServiceUnavail);
            }
            return;
        }

        bluetooth.set_bluetooth_tethering(enable);
        // The readback can be stale when the PAN profile applies the change
        // asynchronously; the result mirrors what the profile reports right
        // now.
        let result = if bluetooth.is_tethering_on() == enable {
            ErrorCode::NoError
        } else {
            ErrorCode::MasterError
        };
        if let Some(sink) = sink {
            sink.send(result);
        }

        if enable && self.provisioning_required() {
            self.shared.services.provisioner.schedule_rechecks(InterfaceType::Bluetooth);
        }
    }

    /// Requests tether mode for a tracked, available interface.
    pub fn tether(&self, iface: &str) -> Result<(), TetherError> {
        self.shared.tether(iface)
    }

    /// Releases tether mode for a tethered interface.
    pub fn untether(&self, iface: &str) -> Result<(), TetherError> {
        self.shared.untether(iface)
    }

    /// Stops tethering of every class.
    pub fn untether_all(&self) {
        self.stop_tethering(InterfaceType::Wifi);
        self.stop_tethering(InterfaceType::Usb);
        self.stop_tethering(InterfaceType::Bluetooth);
    }

    /// Clears a master error state back to initial.
    pub fn clear_master_error(&self) -> Result<(), TetherError> {
        self.shared.send_command(Command::ClearError)
    }

    pub fn tethered_ifaces(&self) -> Vec<String> {
        self.shared.registry.ifaces_in_state(InterfaceState::Tethered)
    }

    pub fn tetherable_ifaces(&self) -> Vec<String> {
        self.shared.registry.ifaces_in_state(InterfaceState::Available)
    }

    pub fn errored_ifaces(&self) -> Vec<String> {
        self.shared.registry.errored_ifaces()
    }

    /// The sticky error recorded for an interface.
    pub fn last_tether_error(&self, iface: &str) -> Result<ErrorCode, TetherError> {
        self.shared
            .registry
            .get(iface)
            .map(|entry| entry.last_error)
            .ok_or_else(|| TetherError::UnknownIface(iface.to_string()))
    }

    pub fn tetherable_usb_regexs(&self) -> Vec<String> {
        self.shared.config.load().tetherable_usb_regexs().to_vec()
    }

    pub fn tetherable_wifi_regexs(&self) -> Vec<String> {
        self.shared.config.load().tetherable_wifi_regexs().to_vec()
    }

    pub fn tetherable_bluetooth_regexs(&self) -> Vec<String> {
        self.shared.config.load().tetherable_bluetooth_regexs().to_vec()
    }

    pub fn tethered_dhcp_ranges(&self) -> Vec<String> {
        self.shared.config.load().dhcp_ranges().to_vec()
    }

    /// Whether both a downstream class and an upstream preference are
    /// configured.
    pub fn has_tetherable_configuration(&self) -> bool {
        self.shared.config.load().has_tetherable_configuration()
    }

    /// A human-readable status report for operator logging.
    pub fn status_report(&self) -> String {
        let config = self.shared.config.load();
        let mut out = String::from("Tethering:\n");

        let _ = writeln!(out, "  preferred upstreams: {:?}", config.preferred_upstream_types());
        let _ = writeln!(out, "  dun required: {}", config.is_dun_required());

        let mut entries = self.shared.registry.snapshot();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (iface, entry) in entries {
            let _ = writeln!(
                out,
                "  {iface} - {:?} - lastError = {}",
                entry.last_state,
                entry.last_error.code()
            );
        }
        out
    }

    fn provisioning_required(&self) -> bool {
        let config = self.shared.config.load();
        is_provisioning_required(&config, &*self.shared.services.provisioner)
    }
}
