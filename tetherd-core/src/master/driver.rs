use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::{Future, FutureExt};
use rustc_hash::FxHashMap;
use tokio::{
    sync::mpsc,
    time::{sleep, Sleep},
};
use tracing::{debug, error, info, warn};

use super::{ErrorKind, MasterMachine, MasterMessage, MasterState, UPSTREAM_SETTLE_TIME_MS};
use crate::{
    event::{OsEvent, SimState, WifiApState},
    iface::{IfaceMessage, InterfaceMachine, MachineCtx, MachineId, MachineStatus, StateReport},
    provision::SimChangeTracker,
    tethering::SharedState,
    types::{ErrorCode, InterfaceState, InterfaceType, LinkProperties, NetworkId, NetworkState, UpstreamType},
    upstream::{UpstreamEventKind, UpstreamMonitor},
};

/// Commands from the facade to the driver.
#[derive(Debug, Clone)]
pub(crate) enum Command {
    Tether { iface: String },
    Untether { iface: String },
    ClearError,
}

/// An internal message delivery: either to the master or to one interface
/// machine. Queued and processed in order on the driver task, so delivery
/// order from any one sender is preserved.
pub(crate) enum Envelope {
    Master(MasterMessage),
    Machine(MachineId, IfaceMessage),
}

/// The event loop of the control plane.
///
/// Owns the master machine, every interface machine, and the upstream
/// monitor, and multiplexes their inputs: facade commands, normalized OS
/// events, connectivity callbacks, and the delayed upstream retry. All
/// handlers run on this single task and never block; external calls are
/// bounded and synchronous.
///
/// The driver finishes once every clone of the event bus has been dropped;
/// facade commands issued after that fail with a not-running error.
pub struct TetheringDriver {
    shared: Arc<SharedState>,
    from_facade: mpsc::Receiver<Command>,
    events: mpsc::Receiver<OsEvent>,
    monitor: UpstreamMonitor,
    master: MasterMachine,
    machines: FxHashMap<MachineId, InterfaceMachine>,
    /// Pending internal deliveries, drained before any external source is
    /// polled.
    inbox: VecDeque<Envelope>,
    /// The single delayed upstream-retry message, when scheduled.
    retry_timer: Option<Pin<Box<Sleep>>>,
    sim: SimChangeTracker,
    next_machine_id: u64,
    facade_closed: bool,
    events_closed: bool,
}

impl TetheringDriver {
    pub(crate) fn new(
        shared: Arc<SharedState>,
        from_facade: mpsc::Receiver<Command>,
        events: mpsc::Receiver<OsEvent>,
        monitor: UpstreamMonitor,
    ) -> Self {
        Self {
            shared,
            from_facade,
            events,
            monitor,
            master: MasterMachine::new(),
            machines: FxHashMap::default(),
            inbox: VecDeque::new(),
            retry_timer: None,
            sim: SimChangeTracker::default(),
            next_machine_id: 0,
            facade_closed: false,
            events_closed: false,
        }
    }
}

impl Future for TetheringDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            // Internal deliveries first, so machine/master exchanges settle
            // before new external input is admitted.
            if let Some(envelope) = this.inbox.pop_front() {
                this.dispatch(envelope);
                continue;
            }

            if !this.facade_closed {
                if let Poll::Ready(cmd) = this.from_facade.poll_recv(cx) {
                    match cmd {
                        Some(cmd) => this.on_command(cmd),
                        None => this.facade_closed = true,
                    }
                    continue;
                }
            }

            if !this.events_closed {
                if let Poll::Ready(event) = this.events.poll_recv(cx) {
                    match event {
                        Some(event) => this.on_os_event(event),
                        None => this.events_closed = true,
                    }
                    continue;
                }
            }

            if let Poll::Ready(Some((kind, state))) = this.monitor.poll_event(cx) {
                this.handle_master(MasterMessage::UpstreamEvent(kind, state));
                continue;
            }

            if let Some(timer) = this.retry_timer.as_mut() {
                if timer.poll_unpin(cx).is_ready() {
                    this.retry_timer = None;
                    this.handle_master(MasterMessage::RetryUpstream);
                    continue;
                }
            }

            // The broadcast adapter owns the driver's lifetime: once the
            // event bus is gone, no further input can arrive that matters.
            if this.events_closed {
                info!("tethering driver shutting down");
                return Poll::Ready(());
            }

            return Poll::Pending;
        }
    }
}

impl TetheringDriver {
    fn dispatch(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Master(msg) => self.handle_master(msg),
            Envelope::Machine(id, msg) => self.deliver_to_machine(id, msg),
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Tether { iface } => match self.shared.registry.get(&iface) {
                Some(entry) => {
                    self.inbox.push_back(Envelope::Machine(entry.machine, IfaceMessage::TetherRequested));
                }
                None => debug!(%iface, "tether command for untracked interface, dropping"),
            },
            Command::Untether { iface } => match self.shared.registry.get(&iface) {
                Some(entry) => {
                    self.inbox
                        .push_back(Envelope::Machine(entry.machine, IfaceMessage::TetherUnrequested));
                }
                None => debug!(%iface, "untether command for untracked interface, dropping"),
            },
            Command::ClearError => self.handle_master(MasterMessage::ClearError),
        }
    }

    // ----- interface machines ------------------------------------------------

    fn deliver_to_machine(&mut self, id: MachineId, msg: IfaceMessage) {
        let Some(machine) = self.machines.get_mut(&id) else {
            debug!(%id, "message for terminated machine, dropping");
            return;
        };

        let mut reports = Vec::new();
        let status = machine.handle(
            msg,
            &mut MachineCtx { nms: &*self.shared.services.nms, reports: &mut reports },
        );
        if status == MachineStatus::Terminated {
            self.machines.remove(&id);
        }

        for report in reports {
            self.apply_report(report);
        }
    }

    /// Applies a machine's state report: registry update (identity-checked
    /// against the recorded handle), master coupling, and the state
    /// broadcast.
    fn apply_report(&mut self, report: StateReport) {
        debug!(
            iface = %report.iface,
            state = ?report.state,
            error = ?report.error,
            "interface state report"
        );

        if !self.shared.registry.update(&report.iface, report.machine, report.state, report.error) {
            debug!(iface = %report.iface, "state report from untracked interface");
        }

        if report.error == ErrorCode::MasterError {
            // Give the master a chance to recover to initial.
            self.inbox.push_back(Envelope::Master(MasterMessage::ClearError));
        }

        match report.state {
            InterfaceState::Unavailable | InterfaceState::Available => {
                self.inbox
                    .push_back(Envelope::Master(MasterMessage::TetherModeUnrequested(report.machine)));
            }
            InterfaceState::Tethered => {
                self.inbox
                    .push_back(Envelope::Master(MasterMessage::TetherModeRequested(report.machine)));
            }
        }

        self.shared.send_state_broadcast();
    }

    // ----- OS events ---------------------------------------------------------

    fn on_os_event(&mut self, event: OsEvent) {
        match event {
            OsEvent::UsbState { connected, rndis_enabled } => {
                self.handle_usb_state(connected, rndis_enabled)
            }
            OsEvent::ConnectivityChanged => self.handle_master(MasterMessage::UpstreamChanged),
            OsEvent::WifiApState(state) => self.handle_wifi_ap_state(state),
            OsEvent::ConfigChanged(config) => {
                info!("tethering configuration replaced");
                self.shared.config.store(config);
            }
            OsEvent::SimState(state) => self.handle_sim_state(state),
            OsEvent::InterfaceAdded(iface) => self.handle_interface_added(&iface),
            OsEvent::InterfaceRemoved(iface) => self.handle_interface_removed(&iface),
            OsEvent::InterfaceStatusChanged { iface, up } => self.handle_interface_status(&iface, up),
        }
    }

    fn handle_usb_state(&mut self, connected: bool, rndis_enabled: bool) {
        let tether_now = self.shared.registry.with_flags(|flags| {
            flags.rndis_enabled = rndis_enabled;
            if !connected {
                // Cable gone; whatever was pending is moot.
                flags.usb_tether_requested = false;
                return false;
            }
            if rndis_enabled && flags.usb_tether_requested {
                flags.usb_tether_requested = false;
                return true;
            }
            false
        });

        if tether_now {
            self.shared.tether_matching_interfaces(true, InterfaceType::Usb);
        }
    }

    fn handle_wifi_ap_state(&mut self, state: WifiApState) {
        match state {
            WifiApState::Enabling => {
                // Seen on the way to both enabled and failed; nothing to do
                // until a terminal state arrives.
            }
            WifiApState::Enabled => {
                let requested = self.shared.registry.with_flags(|flags| flags.wifi_tether_requested);
                if requested {
                    self.shared.tether_matching_interfaces(true, InterfaceType::Wifi);
                }
            }
            WifiApState::Disabling | WifiApState::Disabled | WifiApState::Failed => {
                debug!(?state, "canceling Wi-Fi tethering request");
                // There is at most one soft-AP downstream.
                if let Some(id) = self
                    .machines
                    .values()
                    .find(|m| m.interface_type() == InterfaceType::Wifi)
                    .map(|m| m.id())
                {
                    self.inbox.push_back(Envelope::Machine(id, IfaceMessage::TetherUnrequested));
                }
                self.shared.registry.with_flags(|flags| flags.wifi_tether_requested = false);
            }
        }
    }

    fn handle_sim_state(&mut self, state: SimState) {
        if !self.sim.observe(state) {
            return;
        }

        let config = self.shared.config.load();
        if config.provisioning_app_no_ui().is_none() {
            debug!("no provisioning recheck needed for new SIM");
            return;
        }

        info!("SIM changed, re-evaluating provisioning");
        let mut types: Vec<InterfaceType> = Vec::new();
        for (iface, entry) in self.shared.registry.snapshot() {
            if entry.last_state != InterfaceState::Tethered {
                continue;
            }
            if let Some(ty) = config.classify(&iface) {
                if !types.contains(&ty) {
                    types.push(ty);
                }
            }
        }

        for ty in types {
            self.shared.services.provisioner.run_silent_provisioning(
                ty,
                Box::new(move |code: ErrorCode| {
                    debug!(%ty, ?code, "SIM-change provisioning result");
                }),
            );
        }
    }

    fn handle_interface_added(&mut self, iface: &str) {
        let Some(ty) = self.shared.config.load().classify(iface) else {
            debug!(%iface, "not a tetherable interface, ignoring");
            return;
        };
        if self.shared.registry.contains(iface) {
            debug!(%iface, "known interface reported as added, ignoring");
            return;
        }
        self.track_new_interface(iface, ty);
    }

    fn handle_interface_status(&mut self, iface: &str, up: bool) {
        let Some(ty) = self.shared.config.load().classify(iface) else {
            return;
        };

        if up {
            if !self.shared.registry.contains(iface) {
                self.track_new_interface(iface, ty);
            }
            return;
        }

        match ty {
            InterfaceType::Bluetooth => self.handle_interface_removed(iface),
            InterfaceType::Usb | InterfaceType::Wifi => {
                // USB flaps while the function set is reconfigured, and the
                // soft-AP is tracked through AP-state broadcasts; teardown
                // waits for the removed event.
                debug!(%iface, "ignoring interface down");
            }
        }
    }

    fn handle_interface_removed(&mut self, iface: &str) {
        let Some(entry) = self.shared.registry.remove(iface) else {
            debug!(%iface, "attempt to remove untracked interface, ignoring");
            return;
        };
        self.inbox.push_back(Envelope::Machine(entry.machine, IfaceMessage::InterfaceDown));
    }

    fn track_new_interface(&mut self, iface: &str, ty: InterfaceType) {
        self.next_machine_id += 1;
        let id = MachineId(self.next_machine_id);
        info!(%iface, %ty, %id, "tracking new tetherable interface");
        self.machines.insert(id, InterfaceMachine::new(id, iface.to_string(), ty));
        self.shared.registry.insert(iface, id);
    }

    // ----- master machine ----------------------------------------------------

    fn handle_master(&mut self, msg: MasterMessage) {
        debug!(state = ?self.master.state, ?msg, "master message");

        match self.master.state {
            MasterState::Initial => match msg {
                MasterMessage::TetherModeRequested(id) => {
                    if self.master.add_request(id) {
                        self.ipv6_add_downstream(id);
                    }
                    self.enter_tether_mode_alive();
                }
                MasterMessage::TetherModeUnrequested(id) => {
                    self.master.remove_request(id);
                    self.ipv6_remove_downstream(id);
                }
                other => debug!(?other, "unhandled in initial state"),
            },

            MasterState::TetherModeAlive => match msg {
                MasterMessage::TetherModeRequested(id) => {
                    if self.master.add_request(id) {
                        self.ipv6_add_downstream(id);
                    }
                    let upstream = self.master.current_upstream_iface.clone();
                    self.inbox
                        .push_back(Envelope::Machine(id, IfaceMessage::ConnectionChanged(upstream)));
                }
                MasterMessage::TetherModeUnrequested(id) => {
                    if self.master.remove_request(id) {
                        if !self.master.has_requests() {
                            self.turn_off_master_tether_settings();
                        }
                    } else {
                        warn!(%id, "unrequest from a machine not on the request list");
                    }
                    self.ipv6_remove_downstream(id);
                }
                MasterMessage::UpstreamChanged => {
                    // Try cellular right away in case Wi-Fi just went down.
                    self.choose_upstream_type(true);
                    self.master.try_cell = false;
                }
                MasterMessage::RetryUpstream => {
                    let try_cell = self.master.try_cell;
                    self.choose_upstream_type(try_cell);
                    self.master.try_cell = !try_cell;
                }
                MasterMessage::UpstreamEvent(kind, ns) => self.handle_upstream_event(kind, ns),
                MasterMessage::ClearError => {}
            },

            MasterState::Error(_) => match msg {
                MasterMessage::TetherModeRequested(id) => {
                    let code = self.master.error_code;
                    self.inbox.push_back(Envelope::Machine(id, IfaceMessage::Error(code)));
                }
                MasterMessage::TetherModeUnrequested(id) => {
                    self.master.remove_request(id);
                    self.ipv6_remove_downstream(id);
                }
                MasterMessage::ClearError => {
                    info!("master error cleared");
                    self.master.error_code = ErrorCode::NoError;
                    self.master.state = MasterState::Initial;
                    self.shared.registry.clear_errors();
                    self.shared.send_state_broadcast();
                }
                other => debug!(?other, "unhandled in error state"),
            },
        }
    }

    fn ipv6_add_downstream(&self, id: MachineId) {
        if let Some(machine) = self.machines.get(&id) {
            self.shared.services.ipv6.add_active_downstream(machine.iface());
        }
    }

    fn ipv6_remove_downstream(&self, id: MachineId) {
        if let Some(machine) = self.machines.get(&id) {
            self.shared.services.ipv6.remove_active_downstream(machine.iface());
        }
    }

    fn enter_tether_mode_alive(&mut self) {
        info!("entering tether mode");
        self.master.state = MasterState::TetherModeAlive;

        if let Err(kind) = self.turn_on_master_tether_settings() {
            self.enter_error(kind);
            return;
        }

        self.sim.start();
        self.monitor.start();
        self.shared.services.offload.start();

        // Try something on the first pass; later events refine the choice.
        self.choose_upstream_type(true);
        self.master.try_cell = false;
    }

    fn exit_tether_mode_alive(&mut self) {
        self.shared.services.offload.stop();
        self.monitor.release_mobile_request();
        self.monitor.stop();
        self.sim.stop();
        self.notify_tethered_of_new_upstream(None);
        self.handle_new_upstream_network_state(None);
        self.retry_timer = None;
    }

    fn turn_on_master_tether_settings(&mut self) -> Result<(), ErrorKind> {
        let config = self.shared.config.load();
        let nms = &self.shared.services.nms;

        if let Err(e) = nms.set_ip_forwarding_enabled(true) {
            error!("failed to enable IP forwarding: {e}");
            return Err(ErrorKind::EnableForwarding);
        }

        if let Err(e) = nms.start_tethering(config.dhcp_ranges()) {
            warn!("start tethering failed, stopping and retrying once: {e}");
            let retried =
                nms.stop_tethering().and_then(|()| nms.start_tethering(config.dhcp_ranges()));
            if let Err(e) = retried {
                error!("failed to start tethering: {e}");
                return Err(ErrorKind::StartTethering);
            }
        }

        Ok(())
    }

    fn turn_off_master_tether_settings(&mut self) {
        if let Err(e) = self.shared.services.nms.stop_tethering() {
            error!("failed to stop tethering: {e}");
            self.enter_error(ErrorKind::StopTethering);
            return;
        }
        if let Err(e) = self.shared.services.nms.set_ip_forwarding_enabled(false) {
            error!("failed to disable IP forwarding: {e}");
            self.enter_error(ErrorKind::DisableForwarding);
            return;
        }

        self.exit_tether_mode_alive();
        self.master.state = MasterState::Initial;
        info!("left tether mode");
    }

    fn enter_error(&mut self, kind: ErrorKind) {
        error!(?kind, "master entering error state");

        if self.master.state == MasterState::TetherModeAlive {
            self.exit_tether_mode_alive();
        }
        self.master.state = MasterState::Error(kind);

        let code = kind.error_code();
        self.master.error_code = code;
        for id in self.master.request_list().to_vec() {
            self.inbox.push_back(Envelope::Machine(id, IfaceMessage::Error(code)));
        }

        // Best-effort revert; secondary failures are logged and swallowed.
        let nms = &self.shared.services.nms;
        match kind {
            ErrorKind::EnableForwarding | ErrorKind::DisableForwarding => {}
            ErrorKind::StartTethering | ErrorKind::StopTethering => {
                if let Err(e) = nms.set_ip_forwarding_enabled(false) {
                    warn!("cleanup failed to disable IP forwarding: {e}");
                }
            }
            ErrorKind::SetDnsForwarders => {
                if let Err(e) = nms.stop_tethering() {
                    warn!("cleanup failed to stop tethering: {e}");
                }
                if let Err(e) = nms.set_ip_forwarding_enabled(false) {
                    warn!("cleanup failed to disable IP forwarding: {e}");
                }
            }
        }
    }

    // ----- upstream selection ------------------------------------------------

    fn choose_upstream_type(&mut self, try_cell: bool) {
        let (preferred, dun_required) = {
            let config = self.shared.config.load();
            (config.preferred_upstream_types().to_vec(), config.is_dun_required())
        };

        let up_type = preferred.iter().copied().find(|ty| self.monitor.is_type_connected(*ty));

        debug!(?up_type, try_cell, "upstream selection");

        match up_type {
            Some(ty) if matches!(ty, UpstreamType::MobileDun | UpstreamType::MobileHipri) => {
                // On a cellular upstream, keep our own grab on it.
                self.monitor.set_dun_required(dun_required);
                self.monitor.register_mobile_request();
            }
            None if try_cell => {
                self.monitor.set_dun_required(dun_required);
                self.monitor.register_mobile_request();
                // Mobile should be coming up; no retry needed.
            }
            None => {
                self.schedule_retry_upstream();
            }
            Some(_) => {
                // A non-cellular upstream is active; stop holding one up.
                self.monitor.release_mobile_request();
            }
        }

        self.set_upstream_by_type(up_type);
    }

    fn schedule_retry_upstream(&mut self) {
        debug!("retrying upstream selection in {UPSTREAM_SETTLE_TIME_MS}ms");
        self.retry_timer = Some(Box::pin(sleep(Duration::from_millis(UPSTREAM_SETTLE_TIME_MS))));
    }

    fn set_upstream_by_type(&mut self, up_type: Option<UpstreamType>) {
        let mut iface = None;
        let mut network = None;

        if let Some(ty) = up_type {
            if let Some(ns) = self.monitor.current_for_type(ty).cloned() {
                info!(network = %ns.network, "finding IPv4 upstream interface");
                match ns.link_properties.ipv4_default_interface() {
                    Some(name) => {
                        info!(upstream = %name, "found IPv4 upstream interface");
                        iface = Some(name.to_string());
                        network = Some(ns.network);
                    }
                    None => info!("no IPv4 default route on upstream, giving up"),
                }
                if iface.is_some() && !self.set_dns_forwarders(network, &ns.link_properties) {
                    return;
                }
            }
        }

        self.notify_tethered_of_new_upstream(iface);

        // An already-known network will not announce itself again; examine
        // its state now.
        let known = network.and_then(|n| self.monitor.lookup(n).cloned());
        match known {
            Some(ns) if self.pertains_to_current_upstream(&ns) => {
                self.handle_new_upstream_network_state(Some(&ns));
            }
            _ => {
                if self.master.current_upstream_iface.is_none() {
                    self.handle_new_upstream_network_state(None);
                }
            }
        }
    }

    fn set_dns_forwarders(&mut self, network: Option<NetworkId>, lp: &LinkProperties) -> bool {
        let dns = if lp.dns_servers.is_empty() {
            self.shared.config.load().default_ipv4_dns().to_vec()
        } else {
            lp.dns_servers.clone()
        };

        debug!(?network, ?dns, "setting DNS forwarders");
        if let Err(e) = self.shared.services.nms.set_dns_forwarders(network, &dns) {
            error!("failed to set DNS forwarders: {e}");
            self.enter_error(ErrorKind::SetDnsForwarders);
            return false;
        }
        true
    }

    fn notify_tethered_of_new_upstream(&mut self, iface: Option<String>) {
        debug!(upstream = ?iface, "notifying requesters of upstream");
        self.master.current_upstream_iface = iface.clone();
        for id in self.master.request_list().to_vec() {
            self.inbox
                .push_back(Envelope::Machine(id, IfaceMessage::ConnectionChanged(iface.clone())));
        }
    }

    /// The canonical upstream truth is the selected interface name; a
    /// network state pertains to the current upstream iff one of its
    /// (stacked) interfaces is that name.
    fn pertains_to_current_upstream(&self, ns: &NetworkState) -> bool {
        self.master
            .current_upstream_iface
            .as_deref()
            .is_some_and(|iface| ns.carries_interface(iface))
    }

    fn handle_upstream_event(&mut self, kind: UpstreamEventKind, ns: NetworkState) {
        if !self.pertains_to_current_upstream(&ns) {
            if self.master.current_upstream_iface.is_none() {
                // IPv4 connectivity may have shown up after IPv6; run
                // through selection again without forcing cellular.
                self.choose_upstream_type(false);
            }
            return;
        }

        match kind {
            UpstreamEventKind::Available => {
                // Capability and link-property updates for this network are
                // on their way; nothing to do until they arrive.
            }
            UpstreamEventKind::Capabilities => {
                self.handle_new_upstream_network_state(Some(&ns));
            }
            UpstreamEventKind::LinkProperties => {
                if self.set_dns_forwarders(Some(ns.network), &ns.link_properties) {
                    self.handle_new_upstream_network_state(Some(&ns));
                }
            }
            UpstreamEventKind::Lost => {
                self.handle_new_upstream_network_state(None);
                self.notify_tethered_of_new_upstream(None);
            }
        }
    }

    fn handle_new_upstream_network_state(&self, ns: Option<&NetworkState>) {
        self.shared.services.ipv6.update_upstream_network_state(ns);
        self.shared.services.offload.set_upstream_link_properties(ns.map(|ns| &ns.link_properties));
    }
}
