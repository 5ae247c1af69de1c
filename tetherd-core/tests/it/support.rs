//! Mock collaborators and the test harness.

use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::sync::mpsc;

use tetherd_core::{
    BluetoothPan, ConnectivityPort, ConnectivityRequest, ErrorCode, EventBus, InterfaceType,
    LinkProperties, NetworkCallback, NetworkCapabilities, NetworkId, NetworkManager, NetworkState,
    NmsError, Provisioner, ResultSink, Route, Services, StateSink, Tethering, TetheringSettings,
    TetherStateSnapshot, UpstreamEventKind, UpstreamType, UsbControl, WifiControl,
};

/// Polls `cond` until it holds, panicking after a generous timeout.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Lets in-flight events and messages settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// A result sink writing into a shared slot.
pub fn result_slot() -> (Box<dyn ResultSink>, Arc<Mutex<Option<ErrorCode>>>) {
    let slot = Arc::new(Mutex::new(None));
    let writer = Arc::clone(&slot);
    let sink = Box::new(move |code: ErrorCode| {
        *writer.lock().unwrap() = Some(code);
    });
    (sink, slot)
}

// ----- network fixtures ------------------------------------------------------

pub fn network(
    id: u64,
    iface: &str,
    ty: UpstreamType,
    dns: &[&str],
) -> NetworkState {
    NetworkState {
        network: NetworkId(id),
        link_properties: LinkProperties {
            interface_name: Some(iface.to_string()),
            routes: vec![Route::ipv4_default(iface, "192.0.2.1".parse().unwrap())],
            dns_servers: dns.iter().map(|d| d.parse().unwrap()).collect(),
            stacked: vec![],
        },
        capabilities: NetworkCapabilities { upstream_type: ty, connected: true },
    }
}

pub fn ethernet(id: u64, iface: &str) -> NetworkState {
    network(id, iface, UpstreamType::Ethernet, &["198.51.100.53"])
}

pub fn default_settings() -> TetheringSettings {
    TetheringSettings {
        tetherable_usb_regexs: vec!["rndis\\d".into()],
        tetherable_wifi_regexs: vec!["wlan\\d".into()],
        tetherable_bluetooth_regexs: vec!["bt-pan".into()],
        preferred_upstream_types: vec![UpstreamType::Ethernet, UpstreamType::MobileHipri],
        ..Default::default()
    }
}

// ----- mock collaborators ----------------------------------------------------

#[derive(Default)]
pub struct MockNms {
    calls: Mutex<Vec<String>>,
    interfaces: Mutex<Vec<String>>,
    pub fail_forwarding_enable: AtomicBool,
    pub fail_dns: AtomicBool,
    /// Makes the next N `start_tethering` calls fail.
    pub fail_start_tethering: AtomicU32,
}

impl MockNms {
    pub fn set_interfaces<const N: usize>(&self, interfaces: [&str; N]) {
        *self.interfaces.lock().unwrap() =
            interfaces.iter().map(|s| s.to_string()).collect();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn has_call(&self, call: &str) -> bool {
        self.calls().iter().any(|c| c == call)
    }

    pub fn count_calls(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl NetworkManager for MockNms {
    fn set_ip_forwarding_enabled(&self, enabled: bool) -> Result<(), NmsError> {
        if enabled && self.fail_forwarding_enable.load(Ordering::SeqCst) {
            return Err(NmsError::Command("forwarding".into()));
        }
        self.record(format!("forwarding {enabled}"));
        Ok(())
    }

    fn start_tethering(&self, dhcp_ranges: &[String]) -> Result<(), NmsError> {
        let remaining = self.fail_start_tethering.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_start_tethering.store(remaining - 1, Ordering::SeqCst);
            return Err(NmsError::Command("start".into()));
        }
        self.record(format!("start_tethering {}", dhcp_ranges.len()));
        Ok(())
    }

    fn stop_tethering(&self) -> Result<(), NmsError> {
        self.record("stop_tethering");
        Ok(())
    }

    fn set_dns_forwarders(&self, _network: Option<NetworkId>, dns: &[IpAddr]) -> Result<(), NmsError> {
        if self.fail_dns.load(Ordering::SeqCst) {
            return Err(NmsError::Command("dns".into()));
        }
        let dns: Vec<String> = dns.iter().map(|d| d.to_string()).collect();
        self.record(format!("dns {}", dns.join(",")));
        Ok(())
    }

    fn list_interfaces(&self) -> Result<Vec<String>, NmsError> {
        Ok(self.interfaces.lock().unwrap().clone())
    }

    fn tether_interface(&self, iface: &str) -> Result<(), NmsError> {
        self.record(format!("tether {iface}"));
        Ok(())
    }

    fn untether_interface(&self, iface: &str) -> Result<(), NmsError> {
        self.record(format!("untether {iface}"));
        Ok(())
    }

    fn enable_nat(&self, downstream: &str, upstream: &str) -> Result<(), NmsError> {
        self.record(format!("nat {downstream} {upstream}"));
        Ok(())
    }

    fn disable_nat(&self, downstream: &str, upstream: &str) -> Result<(), NmsError> {
        self.record(format!("denat {downstream} {upstream}"));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockUsb {
    functions: Mutex<Vec<Option<String>>>,
}

impl MockUsb {
    pub fn functions(&self) -> Vec<Option<String>> {
        self.functions.lock().unwrap().clone()
    }
}

impl UsbControl for MockUsb {
    fn set_current_function(&self, function: Option<&str>) {
        self.functions.lock().unwrap().push(function.map(str::to_string));
    }
}

pub struct MockWifi {
    requests: Mutex<Vec<bool>>,
    pub accept: AtomicBool,
}

impl Default for MockWifi {
    fn default() -> Self {
        Self { requests: Mutex::new(Vec::new()), accept: AtomicBool::new(true) }
    }
}

impl MockWifi {
    pub fn requests(&self) -> Vec<bool> {
        self.requests.lock().unwrap().clone()
    }
}

impl WifiControl for MockWifi {
    fn set_wifi_ap_enabled(&self, enabled: bool) -> bool {
        self.requests.lock().unwrap().push(enabled);
        self.accept.load(Ordering::SeqCst)
    }
}

pub struct MockBluetooth {
    pub adapter_enabled: AtomicBool,
    /// Whether `set_bluetooth_tethering` actually takes effect before the
    /// readback; `false` simulates the stale-proxy race.
    pub applies: AtomicBool,
    tethering_on: AtomicBool,
}

impl Default for MockBluetooth {
    fn default() -> Self {
        Self {
            adapter_enabled: AtomicBool::new(true),
            applies: AtomicBool::new(true),
            tethering_on: AtomicBool::new(false),
        }
    }
}

impl MockBluetooth {
    pub fn reset_tethering(&self) {
        self.tethering_on.store(false, Ordering::SeqCst);
    }
}

impl BluetoothPan for MockBluetooth {
    fn is_adapter_enabled(&self) -> bool {
        self.adapter_enabled.load(Ordering::SeqCst)
    }

    fn set_bluetooth_tethering(&self, enable: bool) {
        if self.applies.load(Ordering::SeqCst) {
            self.tethering_on.store(enable, Ordering::SeqCst);
        }
    }

    fn is_tethering_on(&self) -> bool {
        self.tethering_on.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockProvisioner {
    pub required: AtomicBool,
    /// Outcome delivered by the provisioning flows.
    pub fail: AtomicBool,
    silent_runs: Mutex<Vec<InterfaceType>>,
    ui_runs: Mutex<Vec<InterfaceType>>,
    scheduled: Mutex<Vec<InterfaceType>>,
    canceled: Mutex<Vec<InterfaceType>>,
}

impl MockProvisioner {
    pub fn silent_runs(&self) -> Vec<InterfaceType> {
        self.silent_runs.lock().unwrap().clone()
    }

    pub fn ui_runs(&self) -> Vec<InterfaceType> {
        self.ui_runs.lock().unwrap().clone()
    }

    pub fn scheduled(&self) -> Vec<InterfaceType> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn canceled(&self) -> Vec<InterfaceType> {
        self.canceled.lock().unwrap().clone()
    }

    fn outcome(&self) -> ErrorCode {
        if self.fail.load(Ordering::SeqCst) {
            ErrorCode::MasterError
        } else {
            ErrorCode::NoError
        }
    }
}

impl Provisioner for MockProvisioner {
    fn entitlement_checks_required(&self) -> bool {
        self.required.load(Ordering::SeqCst)
    }

    fn run_ui_provisioning(&self, ty: InterfaceType, sink: Box<dyn ResultSink>) {
        self.ui_runs.lock().unwrap().push(ty);
        sink.send(self.outcome());
    }

    fn run_silent_provisioning(&self, ty: InterfaceType, sink: Box<dyn ResultSink>) {
        self.silent_runs.lock().unwrap().push(ty);
        sink.send(self.outcome());
    }

    fn schedule_rechecks(&self, ty: InterfaceType) {
        self.scheduled.lock().unwrap().push(ty);
    }

    fn cancel_rechecks(&self, ty: InterfaceType) {
        self.canceled.lock().unwrap().push(ty);
    }
}

#[derive(Default)]
pub struct RecordingStateSink {
    snapshots: Mutex<Vec<TetherStateSnapshot>>,
}

impl RecordingStateSink {
    pub fn last(&self) -> Option<TetherStateSnapshot> {
        self.snapshots.lock().unwrap().last().cloned()
    }
}

impl StateSink for RecordingStateSink {
    fn on_tether_state_changed(&self, snapshot: &TetherStateSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot.clone());
    }
}

// ----- mock platform connectivity --------------------------------------------

enum Control {
    Emit(UpstreamEventKind, NetworkState),
}

/// Test-side handle of the mock connectivity layer.
///
/// Known networks are announced (available, capabilities, link properties)
/// whenever the monitor registers its listener or requests a mobile
/// network; `emit` injects individual transitions.
pub struct Platform {
    networks: Arc<Mutex<Vec<NetworkState>>>,
    requests: Arc<Mutex<Vec<ConnectivityRequest>>>,
    control: mpsc::Sender<Control>,
}

impl Platform {
    fn spawn(mut port: ConnectivityPort) -> Self {
        let networks: Arc<Mutex<Vec<NetworkState>>> = Arc::default();
        let requests: Arc<Mutex<Vec<ConnectivityRequest>>> = Arc::default();
        let (control_tx, mut control_rx) = mpsc::channel::<Control>(64);

        let task_networks = Arc::clone(&networks);
        let task_requests = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = port.recv() => {
                        let Some(request) = request else { break };
                        task_requests.lock().unwrap().push(request);

                        let announce: Vec<NetworkState> = match request {
                            ConnectivityRequest::RegisterDefaultListener => {
                                task_networks.lock().unwrap().clone()
                            }
                            ConnectivityRequest::RequestMobileNetwork(_) => task_networks
                                .lock()
                                .unwrap()
                                .iter()
                                .filter(|ns| ns.capabilities.upstream_type.is_mobile())
                                .cloned()
                                .collect(),
                            _ => Vec::new(),
                        };

                        for ns in announce {
                            for kind in [
                                UpstreamEventKind::Available,
                                UpstreamEventKind::Capabilities,
                                UpstreamEventKind::LinkProperties,
                            ] {
                                let _ = port.try_send(NetworkCallback { kind, state: ns.clone() });
                            }
                        }
                    }
                    control = control_rx.recv() => {
                        let Some(Control::Emit(kind, state)) = control else { break };
                        let _ = port.try_send(NetworkCallback { kind, state });
                    }
                }
            }
        });

        Self { networks, requests, control: control_tx }
    }

    pub fn add_network(&self, ns: NetworkState) {
        self.networks.lock().unwrap().push(ns);
    }

    pub async fn emit(&self, kind: UpstreamEventKind, state: NetworkState) {
        self.control.send(Control::Emit(kind, state)).await.unwrap();
    }

    pub fn requests(&self) -> Vec<ConnectivityRequest> {
        self.requests.lock().unwrap().clone()
    }
}

// ----- harness ---------------------------------------------------------------

pub struct Harness {
    pub tethering: Tethering,
    pub bus: EventBus,
    pub platform: Platform,
    pub nms: Arc<MockNms>,
    pub usb: Arc<MockUsb>,
    pub wifi: Arc<MockWifi>,
    pub bluetooth: Arc<MockBluetooth>,
    pub provisioner: Arc<MockProvisioner>,
    pub sink: Arc<RecordingStateSink>,
}

impl Harness {
    pub fn new(settings: TetheringSettings) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let nms = Arc::new(MockNms::default());
        let usb = Arc::new(MockUsb::default());
        let wifi = Arc::new(MockWifi::default());
        let bluetooth = Arc::new(MockBluetooth::default());
        let provisioner = Arc::new(MockProvisioner::default());
        let sink = Arc::new(RecordingStateSink::default());

        let services = Services::new(
            nms.clone(),
            usb.clone(),
            wifi.clone(),
            bluetooth.clone(),
            provisioner.clone(),
            sink.clone(),
        );

        let config = settings.compile().unwrap();
        let (tethering, driver, bus, port) = Tethering::new(config, services);
        tokio::spawn(driver);

        Self {
            tethering,
            bus,
            platform: Platform::spawn(port),
            nms,
            usb,
            wifi,
            bluetooth,
            provisioner,
            sink,
        }
    }

    /// Tracks `iface` (reported up) and waits for the registry entry.
    pub async fn track(&self, iface: &str) {
        self.bus.interface_status_changed(iface, true);
        let tethering = self.tethering.clone();
        let iface = iface.to_string();
        wait_until("interface tracked", move || {
            tethering.tetherable_ifaces().contains(&iface)
        })
        .await;
    }

    /// Tracks and tethers `iface`, waiting until it reports tethered.
    pub async fn tether(&self, iface: &str) {
        self.track(iface).await;
        self.tethering.tether(iface).unwrap();
        let tethering = self.tethering.clone();
        let iface = iface.to_string();
        wait_until("interface tethered", move || {
            tethering.tethered_ifaces().contains(&iface)
        })
        .await;
    }
}
