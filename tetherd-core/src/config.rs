//! Tethering configuration snapshot.
//!
//! A [`TetheringConfig`] is an immutable view of everything the control plane
//! reads from device configuration: which interface names are tetherable per
//! class, the preferred upstream ordering, the DHCP ranges handed to the
//! network-management service, and the provisioning app wiring. The live
//! handle is an `ArcSwap` owned by the orchestrator and replaced wholesale
//! whenever a configuration-change event arrives; readers hold the `Arc` they
//! loaded and never observe a partially updated snapshot.

use std::net::IpAddr;

use regex::RegexSet;
use thiserror::Error;

use crate::types::{InterfaceType, UpstreamType};

/// DHCP pools offered to downstream clients when none are configured, as
/// start/end pairs. One pool per concurrently tethered downstream.
pub const DEFAULT_DHCP_RANGES: &[&str] = &[
    "192.168.42.2", "192.168.42.254",
    "192.168.43.2", "192.168.43.254",
    "192.168.44.2", "192.168.44.254",
    "192.168.45.2", "192.168.45.254",
];

/// DNS servers offered downstream when the upstream reports none.
pub const DEFAULT_IPV4_DNS: &[&str] = &["8.8.8.8", "8.8.4.4"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid interface pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("dhcp ranges must come in start/end pairs, got {0} entries")]
    OddDhcpRanges(usize),
    #[error("invalid DNS server address: {0}")]
    Dns(#[from] std::net::AddrParseError),
}

/// Raw, uncompiled configuration values.
///
/// Compile into a [`TetheringConfig`] with [`TetheringSettings::compile`].
#[derive(Debug, Clone)]
pub struct TetheringSettings {
    pub tetherable_usb_regexs: Vec<String>,
    pub tetherable_wifi_regexs: Vec<String>,
    pub tetherable_bluetooth_regexs: Vec<String>,
    /// Upstream classes in preference order; first connected class wins.
    pub preferred_upstream_types: Vec<UpstreamType>,
    /// DHCP pools as start/end pairs (even number of entries).
    pub dhcp_ranges: Vec<String>,
    /// Whether the carrier requires the DUN APN for tethering upstream.
    pub is_dun_required: bool,
    pub default_ipv4_dns: Vec<String>,
    /// Carrier provisioning app, `[package, class]`. Provisioning is only
    /// ever required when exactly two entries are configured.
    pub provisioning_app: Vec<String>,
    /// No-UI provisioning component used for SIM-change rechecks.
    pub provisioning_app_no_ui: Option<String>,
    /// System-property override that disables provisioning entirely.
    pub noprovisioning: bool,
}

impl Default for TetheringSettings {
    fn default() -> Self {
        Self {
            tetherable_usb_regexs: Vec::new(),
            tetherable_wifi_regexs: Vec::new(),
            tetherable_bluetooth_regexs: Vec::new(),
            preferred_upstream_types: Vec::new(),
            dhcp_ranges: DEFAULT_DHCP_RANGES.iter().map(|s| s.to_string()).collect(),
            is_dun_required: false,
            default_ipv4_dns: DEFAULT_IPV4_DNS.iter().map(|s| s.to_string()).collect(),
            provisioning_app: Vec::new(),
            provisioning_app_no_ui: None,
            noprovisioning: false,
        }
    }
}

impl TetheringSettings {
    /// Validates the raw values and compiles the interface-name patterns.
    pub fn compile(self) -> Result<TetheringConfig, ConfigError> {
        if self.dhcp_ranges.len() % 2 != 0 {
            return Err(ConfigError::OddDhcpRanges(self.dhcp_ranges.len()));
        }

        let wifi = RegexSet::new(&self.tetherable_wifi_regexs)?;
        let usb = RegexSet::new(&self.tetherable_usb_regexs)?;
        let bluetooth = RegexSet::new(&self.tetherable_bluetooth_regexs)?;

        let default_ipv4_dns = self
            .default_ipv4_dns
            .iter()
            .map(|s| s.parse::<IpAddr>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TetheringConfig { settings: self, wifi, usb, bluetooth, default_ipv4_dns })
    }
}

/// Compiled, immutable configuration snapshot.
#[derive(Debug)]
pub struct TetheringConfig {
    settings: TetheringSettings,
    wifi: RegexSet,
    usb: RegexSet,
    bluetooth: RegexSet,
    default_ipv4_dns: Vec<IpAddr>,
}

impl TetheringConfig {
    /// Classifies an interface name against the per-class patterns.
    ///
    /// Checked in the order Wi-Fi, USB, Bluetooth; the first class that
    /// matches wins. `None` means the interface is not tetherable.
    pub fn classify(&self, iface: &str) -> Option<InterfaceType> {
        if self.wifi.is_match(iface) {
            Some(InterfaceType::Wifi)
        } else if self.usb.is_match(iface) {
            Some(InterfaceType::Usb)
        } else if self.bluetooth.is_match(iface) {
            Some(InterfaceType::Bluetooth)
        } else {
            None
        }
    }

    pub fn is_usb(&self, iface: &str) -> bool {
        self.classify(iface) == Some(InterfaceType::Usb)
    }

    pub fn is_wifi(&self, iface: &str) -> bool {
        self.classify(iface) == Some(InterfaceType::Wifi)
    }

    pub fn is_bluetooth(&self, iface: &str) -> bool {
        self.classify(iface) == Some(InterfaceType::Bluetooth)
    }

    pub fn tetherable_usb_regexs(&self) -> &[String] {
        &self.settings.tetherable_usb_regexs
    }

    pub fn tetherable_wifi_regexs(&self) -> &[String] {
        &self.settings.tetherable_wifi_regexs
    }

    pub fn tetherable_bluetooth_regexs(&self) -> &[String] {
        &self.settings.tetherable_bluetooth_regexs
    }

    pub fn preferred_upstream_types(&self) -> &[UpstreamType] {
        &self.settings.preferred_upstream_types
    }

    pub fn dhcp_ranges(&self) -> &[String] {
        &self.settings.dhcp_ranges
    }

    pub fn is_dun_required(&self) -> bool {
        self.settings.is_dun_required
    }

    pub fn default_ipv4_dns(&self) -> &[IpAddr] {
        &self.default_ipv4_dns
    }

    /// The carrier provisioning app, if exactly two entries are configured.
    pub fn provisioning_app(&self) -> Option<&[String]> {
        (self.settings.provisioning_app.len() == 2).then_some(self.settings.provisioning_app.as_slice())
    }

    pub fn provisioning_app_no_ui(&self) -> Option<&str> {
        self.settings.provisioning_app_no_ui.as_deref()
    }

    pub fn noprovisioning(&self) -> bool {
        self.settings.noprovisioning
    }

    /// Whether this device can tether at all: at least one downstream class
    /// configured and a non-empty upstream preference list.
    pub fn has_tetherable_configuration(&self) -> bool {
        let has_downstream = !self.settings.tetherable_usb_regexs.is_empty()
            || !self.settings.tetherable_wifi_regexs.is_empty()
            || !self.settings.tetherable_bluetooth_regexs.is_empty();
        let has_upstream = !self.settings.preferred_upstream_types.is_empty();

        has_downstream && has_upstream
    }
}
