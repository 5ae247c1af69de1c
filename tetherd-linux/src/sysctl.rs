//! Typed access to the `/proc/sys/net` parameters the gateway role needs.
//!
//! Only the forwarding switches are modeled; anything else can go through
//! plain `std::fs` access on its `/proc/sys` path.

use std::io;

/// IP protocol version, selecting the sysctl subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// `/proc/sys/net/ipv4/...`
    #[default]
    V4,
    /// `/proc/sys/net/ipv6/...`
    V6,
}

/// A sysctl parameter addressable per protocol.
pub trait SysctlParam {
    /// Full path of the parameter file for the given protocol.
    fn path(&self, protocol: Protocol) -> String;
}

/// General IP parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ip {
    /// The packet-forwarding master switch. Note the asymmetric paths:
    /// IPv4 uses `ip_forward`, IPv6 `conf/all/forwarding`.
    Forwarding,
}

impl SysctlParam for Ip {
    fn path(&self, protocol: Protocol) -> String {
        match (self, protocol) {
            (Self::Forwarding, Protocol::V4) => "/proc/sys/net/ipv4/ip_forward".to_string(),
            (Self::Forwarding, Protocol::V6) => {
                "/proc/sys/net/ipv6/conf/all/forwarding".to_string()
            }
        }
    }
}

/// Reads a sysctl parameter, trimmed of its trailing newline.
pub fn read(param: impl SysctlParam, protocol: Protocol) -> io::Result<String> {
    let value = std::fs::read_to_string(param.path(protocol))?;
    Ok(value.trim_end().to_string())
}

/// Writes a sysctl parameter.
pub fn write(param: impl SysctlParam, protocol: Protocol, value: &str) -> io::Result<()> {
    std::fs::write(param.path(protocol), value)
}
