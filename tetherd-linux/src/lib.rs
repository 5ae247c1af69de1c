//! # tetherd-linux
//!
//! Linux building blocks for the tethering control plane: a
//! [`NetworkManager`](tetherd_core::NetworkManager) backed by sysctl,
//! dnsmasq and iptables, and a netlink link watcher that feeds interface
//! events into the core's event bus.
//!
//! Everything here needs the right capabilities (CAP_NET_ADMIN, write
//! access to `/proc/sys/net`) to actually take effect.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod links;
mod nms;
pub mod sysctl;

pub use links::{list_links, spawn_link_poller, LinkSnapshot};
pub use nms::LinuxNetworkManager;
