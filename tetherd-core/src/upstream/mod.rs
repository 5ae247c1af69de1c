//! Upstream network monitoring.
//!
//! The monitor talks to the platform connectivity layer over a
//! bi-directional channel: requests (listener registration, mobile network
//! requests) go out, network callbacks come back. It keeps a map of every
//! observed network's last-known state and forwards each transition to the
//! master as an upstream event.

mod monitor;

pub(crate) use monitor::UpstreamMonitor;

use tetherd_common::Channel;

use crate::types::NetworkState;

/// Buffer for each direction of the connectivity channel.
pub(crate) const CONNECTIVITY_BUFFER_SIZE: usize = 64;

/// Cellular APN flavor for an upstream mobile request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApnType {
    /// The carrier's dedicated tethering APN.
    Dun,
    /// The high-priority default APN.
    Hipri,
}

/// Requests the monitor issues to the platform connectivity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityRequest {
    /// Start delivering callbacks for the default network and any other
    /// candidate upstreams. Registration triggers immediate callbacks for
    /// already-connected networks.
    RegisterDefaultListener,
    UnregisterDefaultListener,
    /// Bring up (and hold) a mobile connection of the given APN flavor.
    RequestMobileNetwork(ApnType),
    /// Drop the outstanding mobile request, if any.
    ReleaseMobileNetwork,
}

/// The kind of a network callback / upstream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamEventKind {
    Available,
    Capabilities,
    LinkProperties,
    Lost,
}

/// A callback from the platform connectivity layer: one transition of one
/// network, carrying that network's current state.
#[derive(Debug, Clone)]
pub struct NetworkCallback {
    pub kind: UpstreamEventKind,
    pub state: NetworkState,
}

/// The platform-facing endpoint of the connectivity channel: receives
/// [`ConnectivityRequest`]s, sends [`NetworkCallback`]s.
pub type ConnectivityPort = Channel<NetworkCallback, ConnectivityRequest>;
