//! Idempotence and invariant checks over the public surface.

use tetherd_core::{ErrorCode, InterfaceType, TetherError, UpstreamEventKind, UpstreamType};

use crate::support::{default_settings, ethernet, network, settle, wait_until, Harness};

#[tokio::test(start_paused = true)]
async fn start_then_stop_returns_to_the_prior_state() {
    let h = Harness::new(default_settings());
    h.platform.add_network(ethernet(1, "eth0"));
    h.nms.set_interfaces(["eth0", "rndis0"]);

    h.track("rndis0").await;
    let before = h.tethering.tetherable_ifaces();

    h.bus.usb_state(true, true);
    h.tethering.set_usb_tethering(true);
    wait_until("tethered", || h.tethering.tethered_ifaces() == vec!["rndis0".to_string()]).await;

    h.tethering.set_usb_tethering(false);
    wait_until("untethered", || h.tethering.tethered_ifaces().is_empty()).await;

    assert_eq!(h.tethering.tetherable_ifaces(), before);
    assert!(h.tethering.errored_ifaces().is_empty());
    // Tether mode was fully torn down.
    wait_until("forwarding disabled", || h.nms.has_call("forwarding false")).await;
    assert!(h.nms.has_call("stop_tethering"));
}

#[tokio::test(start_paused = true)]
async fn repeated_interface_added_creates_one_entry() {
    let h = Harness::new(default_settings());

    h.bus.interface_added("rndis0");
    h.bus.interface_added("rndis0");
    h.bus.interface_status_changed("rndis0", true);
    settle().await;

    assert_eq!(h.tethering.tetherable_ifaces(), vec!["rndis0".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn usb_request_round_trip_clears_the_flags() {
    let h = Harness::new(default_settings());
    h.nms.set_interfaces(["rndis0"]);

    // Enable parks a request (RNDIS is off), disable withdraws it.
    h.tethering.set_usb_tethering(true);
    h.tethering.set_usb_tethering(false);
    assert_eq!(h.usb.functions(), vec![Some("rndis".to_string())]);

    // RNDIS coming up later must not tether: the request is gone.
    h.bus.interface_status_changed("rndis0", true);
    h.bus.usb_state(true, true);
    settle().await;

    assert!(h.tethering.tethered_ifaces().is_empty());
    assert!(!h.nms.has_call("tether rndis0"));
}

#[tokio::test(start_paused = true)]
async fn upstream_change_notifies_each_machine_exactly_once() {
    let mut settings = default_settings();
    settings.tetherable_bluetooth_regexs = vec!["bt-pan".into()];
    settings.preferred_upstream_types =
        vec![UpstreamType::Ethernet, UpstreamType::Wifi, UpstreamType::MobileHipri];
    let h = Harness::new(settings);

    let eth = ethernet(1, "eth0");
    h.platform.add_network(eth.clone());
    h.nms.set_interfaces(["eth0", "rndis0", "bt-pan"]);

    h.tether("rndis0").await;
    h.tether("bt-pan").await;
    wait_until("both forwarding through eth0", || {
        h.nms.has_call("nat rndis0 eth0") && h.nms.has_call("nat bt-pan eth0")
    })
    .await;

    // Swap the upstream: each tethered machine reprograms exactly once.
    h.platform.emit(UpstreamEventKind::Lost, eth).await;
    let wifi = network(2, "wlan1", UpstreamType::Wifi, &["203.0.113.53"]);
    h.platform.emit(UpstreamEventKind::LinkProperties, wifi).await;

    wait_until("both forwarding through wlan1", || {
        h.nms.has_call("nat rndis0 wlan1") && h.nms.has_call("nat bt-pan wlan1")
    })
    .await;
    settle().await;

    assert_eq!(h.nms.count_calls("nat rndis0 wlan1"), 1);
    assert_eq!(h.nms.count_calls("nat bt-pan wlan1"), 1);
    assert_eq!(h.nms.count_calls("denat rndis0 eth0"), 1);
    assert_eq!(h.nms.count_calls("denat bt-pan eth0"), 1);
}

#[tokio::test(start_paused = true)]
async fn caller_errors_are_synchronous_and_stateless() {
    let h = Harness::new(default_settings());

    assert!(matches!(h.tethering.tether("nope0"), Err(TetherError::UnknownIface(_))));
    assert!(matches!(h.tethering.untether("nope0"), Err(TetherError::UnknownIface(_))));
    assert!(matches!(h.tethering.last_tether_error("nope0"), Err(TetherError::UnknownIface(_))));

    h.track("rndis0").await;
    // Untethering an available interface is a caller error.
    assert!(matches!(h.tethering.untether("rndis0"), Err(TetherError::UnavailIface(_))));
    assert_eq!(h.tethering.last_tether_error("rndis0").unwrap(), ErrorCode::NoError);

    // Nothing moved.
    assert!(h.tethering.tethered_ifaces().is_empty());
    assert!(h.nms.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn bluetooth_interface_down_removes_the_entry_immediately() {
    let h = Harness::new(default_settings());

    h.track("bt-pan").await;
    h.bus.interface_status_changed("bt-pan", false);
    wait_until("entry removed", || h.tethering.tetherable_ifaces().is_empty()).await;

    // USB interfaces ride out a down; only removal unregisters them.
    h.track("rndis0").await;
    h.bus.interface_status_changed("rndis0", false);
    settle().await;
    assert_eq!(h.tethering.tetherable_ifaces(), vec!["rndis0".to_string()]);

    h.bus.interface_removed("rndis0");
    wait_until("entry removed on removal", || h.tethering.tetherable_ifaces().is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn teardown_completes_for_a_removed_tethered_interface() {
    let h = Harness::new(default_settings());
    h.platform.add_network(ethernet(1, "eth0"));
    h.nms.set_interfaces(["eth0", "rndis0"]);

    h.tether("rndis0").await;
    wait_until("forwarding", || h.nms.has_call("nat rndis0 eth0")).await;

    // Removal excises the registry entry, but the machine still runs its
    // teardown (drop NAT, untether, release tether mode).
    h.bus.interface_removed("rndis0");
    wait_until("NAT dropped", || h.nms.has_call("denat rndis0 eth0")).await;
    wait_until("downstream unprogrammed", || h.nms.has_call("untether rndis0")).await;
    wait_until("tether mode released", || h.nms.has_call("forwarding false")).await;

    assert!(h.tethering.tetherable_ifaces().is_empty());
    assert!(h.tethering.tethered_ifaces().is_empty());
}

#[tokio::test(start_paused = true)]
async fn untether_all_stops_every_class() {
    let h = Harness::new(default_settings());
    h.nms.set_interfaces(["rndis0", "wlan0"]);

    h.tethering.untether_all();
    settle().await;

    // Wi-Fi was asked down; USB cleared its flags; Bluetooth reported back.
    assert_eq!(h.wifi.requests(), vec![false]);
}

#[tokio::test(start_paused = true)]
async fn wifi_only_tethering_raises_no_notification() {
    let h = Harness::new(default_settings());
    h.platform.add_network(ethernet(1, "eth0"));
    h.nms.set_interfaces(["eth0", "wlan0"]);

    let (sink, _result) = crate::support::result_slot();
    h.tethering.start_tethering(InterfaceType::Wifi, sink, false);
    h.track("wlan0").await;
    h.bus.wifi_ap_state(tetherd_core::WifiApState::Enabled);

    wait_until("wlan0 tethered", || {
        h.tethering.tethered_ifaces() == vec!["wlan0".to_string()]
    })
    .await;

    // Wi-Fi is the only active class: the broadcast lists it as active but
    // the notification is dropped (the soft-AP has its own status surface).
    let last = h.sink.last().unwrap();
    assert_eq!(last.notification, tetherd_core::NotificationClass::None);
    assert_eq!(last.active, vec!["wlan0".to_string()]);
}
