//! Shared type tags and network descriptions used across the control plane.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
};

/// The class of a downstream (tetherable) interface, derived by matching the
/// interface name against the configured per-class patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceType {
    Wifi,
    Usb,
    Bluetooth,
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wifi => write!(f, "wifi"),
            Self::Usb => write!(f, "usb"),
            Self::Bluetooth => write!(f, "bluetooth"),
        }
    }
}

/// Lifecycle state of a tracked downstream interface.
///
/// Newly tracked interfaces start out [`Available`](Self::Available): the
/// registry only creates entries for interfaces that were observed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterfaceState {
    Unavailable,
    #[default]
    Available,
    Tethered,
}

/// Error codes surfaced to callers and recorded per interface.
///
/// The numeric assignment is part of the external status surface and must
/// stay stable; see [`ErrorCode::code`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    #[default]
    NoError = 0,
    UnknownIface = 1,
    UnavailIface = 2,
    ServiceUnavail = 3,
    MasterError = 4,
    IpForwardingEnableError = 5,
    IpForwardingDisableError = 6,
    StartTetheringError = 7,
    StopTetheringError = 8,
    SetDnsForwardersError = 9,
}

impl ErrorCode {
    /// Stable numeric value of this code.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Returns `true` for anything other than [`NoError`](Self::NoError).
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::NoError)
    }
}

/// Upstream network classes, in the terms the preferred-upstream ordering is
/// expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamType {
    Ethernet,
    Wifi,
    Bluetooth,
    Mobile,
    MobileDun,
    MobileHipri,
}

impl UpstreamType {
    /// Whether this class is carried by the cellular radio.
    pub const fn is_mobile(self) -> bool {
        matches!(self, Self::Mobile | Self::MobileDun | Self::MobileHipri)
    }
}

/// Opaque handle identifying a network at the platform connectivity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(pub u64);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net-{}", self.0)
    }
}

/// An IP prefix: base address plus prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    pub addr: IpAddr,
    pub len: u8,
}

impl Prefix {
    pub const fn new(addr: IpAddr, len: u8) -> Self {
        Self { addr, len }
    }

    /// The IPv4 default prefix, `0.0.0.0/0`.
    pub const fn ipv4_default() -> Self {
        Self { addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED), len: 0 }
    }

    /// Returns `true` if `addr` falls inside this prefix. Mixed address
    /// families never match. Over-long prefix lengths are treated as
    /// host-length.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let len = self.len.min(32);
                let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
                net.to_bits() & mask == a.to_bits() & mask
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let len = self.len.min(128);
                let mask = if len == 0 { 0 } else { u128::MAX << (128 - len) };
                net.to_bits() & mask == a.to_bits() & mask
            }
            _ => false,
        }
    }
}

/// A single route from a network's link properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: Prefix,
    pub gateway: Option<IpAddr>,
    /// Name of the interface the route goes out of.
    pub interface: String,
}

impl Route {
    /// A default IPv4 route (`0.0.0.0/0`) via `gateway` on `interface`.
    pub fn ipv4_default(interface: impl Into<String>, gateway: IpAddr) -> Self {
        Self { destination: Prefix::ipv4_default(), gateway: Some(gateway), interface: interface.into() }
    }

    pub fn is_ipv4_default(&self) -> bool {
        self.destination.addr.is_ipv4() && self.destination.len == 0
    }
}

/// Picks the most specific route covering `dest` out of `routes`. Ties go to
/// the earliest route, so callers control preference by ordering.
pub fn best_route_to<'a, I>(routes: I, dest: &IpAddr) -> Option<&'a Route>
where
    I: IntoIterator<Item = &'a Route>,
{
    let mut best: Option<&'a Route> = None;
    for route in routes {
        if !route.destination.contains(dest) {
            continue;
        }
        if best.map_or(true, |b| route.destination.len > b.destination.len) {
            best = Some(route);
        }
    }
    best
}

/// Link-layer properties of a network: its interface, routes, DNS servers,
/// and any stacked links (e.g. clat on top of a cellular interface).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkProperties {
    pub interface_name: Option<String>,
    pub routes: Vec<Route>,
    pub dns_servers: Vec<IpAddr>,
    pub stacked: Vec<LinkProperties>,
}

impl LinkProperties {
    /// All interface names carried by this link, stacked links included.
    pub fn all_interface_names(&self) -> Vec<&str> {
        let mut names = Vec::with_capacity(1 + self.stacked.len());
        if let Some(name) = self.interface_name.as_deref() {
            names.push(name);
        }
        for stacked in &self.stacked {
            names.extend(stacked.all_interface_names());
        }
        names
    }

    /// All routes over this link and its stacked links.
    pub fn all_routes(&self) -> Vec<&Route> {
        let mut routes: Vec<&Route> = self.routes.iter().collect();
        for stacked in &self.stacked {
            routes.extend(stacked.all_routes());
        }
        routes
    }

    /// The interface carrying the best IPv4 default route over the full
    /// (stacked) route set, if any.
    pub fn ipv4_default_interface(&self) -> Option<&str> {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        best_route_to(self.all_routes(), &any).map(|route| route.interface.as_str())
    }
}

/// What the connectivity layer knows about a network beyond its links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkCapabilities {
    pub upstream_type: UpstreamType,
    pub connected: bool,
}

/// A snapshot of one observed network: handle, links, capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkState {
    pub network: NetworkId,
    pub link_properties: LinkProperties,
    pub capabilities: NetworkCapabilities,
}

impl NetworkState {
    /// Whether `iface` is one of the interfaces (stacked included) carrying
    /// this network.
    pub fn carries_interface(&self, iface: &str) -> bool {
        self.link_properties.all_interface_names().contains(&iface)
    }
}
