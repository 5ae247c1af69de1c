//! # tetherd-core
//!
//! The tethering control plane: the business logic that lets a device act
//! as an IP gateway over USB (RNDIS), Wi-Fi soft-AP, and Bluetooth PAN
//! downstreams.
//!
//! Caller requests, link-state events from the OS, and upstream-network
//! events are reconciled on a single event-loop task into commands against
//! the external network-management service. Two kinds of state machine do
//! the work:
//!
//! - the **master** machine owns the globals: the IP-forwarding switch, the
//!   DHCP range lifecycle, DNS forwarder programming, upstream selection,
//!   and error recovery;
//! - one **interface** machine per tetherable downstream walks it through
//!   available → tethered and back, coupled to the master through
//!   request/unrequest messages.
//!
//! Everything that touches hardware or other daemons is behind the traits
//! in [`services`]; the crate itself forwards no packets and owns no NAT
//! table.
//!
//! ## Wiring
//!
//! [`Tethering::new`] returns four values: the thread-safe facade, the
//! [`TetheringDriver`] future (spawn it), the [`EventBus`] platform glue
//! feeds broadcasts into, and the connectivity-channel endpoint the
//! platform connectivity layer drives.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod config;
pub mod event;
mod iface;
mod master;
mod provision;
mod registry;
pub mod services;
mod tethering;
pub mod types;
pub mod upstream;

pub use config::{ConfigError, TetheringConfig, TetheringSettings};
pub use event::{DetailedState, EventBus, SimState, WifiApState};
pub use iface::MachineId;
pub use master::TetheringDriver;
pub use registry::{TetherEntry, TetherStateRegistry};
pub use services::{
    BluetoothPan, Ipv6Coordinator, NetworkManager, NmsError, NoIpv6, NoOffload, OffloadControl,
    Provisioner, ResultSink, Services, StateSink, UsbControl, WifiControl,
};
pub use tethering::{NotificationClass, TetherError, TetherStateSnapshot, Tethering};
pub use types::{
    best_route_to, ErrorCode, InterfaceState, InterfaceType, LinkProperties, NetworkCapabilities,
    NetworkId, NetworkState, Prefix, Route, UpstreamType,
};
pub use upstream::{
    ApnType, ConnectivityPort, ConnectivityRequest, NetworkCallback, UpstreamEventKind,
};
