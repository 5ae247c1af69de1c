use std::task::{Context, Poll};

use rustc_hash::FxHashMap;
use tetherd_common::Channel;
use tracing::{debug, info, warn};

use super::{ApnType, ConnectivityRequest, NetworkCallback, UpstreamEventKind};
use crate::types::{NetworkId, NetworkState, UpstreamType};

/// Observes candidate upstream networks on behalf of the master.
///
/// `start`/`stop` are idempotent; `stop` always cancels an outstanding
/// mobile request before unregistering.
pub(crate) struct UpstreamMonitor {
    /// Channel to the platform connectivity layer.
    port: Channel<ConnectivityRequest, NetworkCallback>,
    /// Last-known state of every observed network.
    networks: FxHashMap<NetworkId, NetworkState>,
    started: bool,
    /// The APN flavor of the outstanding mobile request, if any.
    mobile_request: Option<ApnType>,
    dun_required: bool,
}

impl UpstreamMonitor {
    pub(crate) fn new(port: Channel<ConnectivityRequest, NetworkCallback>) -> Self {
        Self {
            port,
            networks: FxHashMap::default(),
            started: false,
            mobile_request: None,
            dun_required: false,
        }
    }

    pub(crate) fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.request(ConnectivityRequest::RegisterDefaultListener);
        info!("upstream monitor started");
    }

    pub(crate) fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.release_mobile_request();
        self.request(ConnectivityRequest::UnregisterDefaultListener);
        self.networks.clear();
        self.started = false;
        info!("upstream monitor stopped");
    }

    /// Re-arms which APN flavor the next mobile request asks for.
    pub(crate) fn set_dun_required(&mut self, dun_required: bool) {
        self.dun_required = dun_required;
    }

    /// Requests (and holds) an upstream mobile connection. A no-op if a
    /// request is already outstanding.
    pub(crate) fn register_mobile_request(&mut self) {
        if self.mobile_request.is_some() {
            return;
        }
        let apn = if self.dun_required { ApnType::Dun } else { ApnType::Hipri };
        self.mobile_request = Some(apn);
        self.request(ConnectivityRequest::RequestMobileNetwork(apn));
        debug!(?apn, "requested mobile upstream");
    }

    pub(crate) fn release_mobile_request(&mut self) {
        if self.mobile_request.take().is_some() {
            self.request(ConnectivityRequest::ReleaseMobileNetwork);
            debug!("released mobile upstream request");
        }
    }

    /// Current state of an already-known network, for synchronous
    /// examination at selection time.
    pub(crate) fn lookup(&self, network: NetworkId) -> Option<&NetworkState> {
        self.networks.get(&network)
    }

    /// The connected network of the given upstream class, if one is known.
    pub(crate) fn current_for_type(&self, ty: UpstreamType) -> Option<&NetworkState> {
        self.networks
            .values()
            .find(|ns| ns.capabilities.upstream_type == ty && ns.capabilities.connected)
    }

    pub(crate) fn is_type_connected(&self, ty: UpstreamType) -> bool {
        self.current_for_type(ty).is_some()
    }

    /// Polls the connectivity channel, folds the callback into the network
    /// map, and hands the transition to the caller.
    pub(crate) fn poll_event(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<(UpstreamEventKind, NetworkState)>> {
        loop {
            let callback = match self.port.poll_recv(cx) {
                Poll::Ready(Some(callback)) => callback,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            };

            let NetworkCallback { kind, state } = callback;

            if !self.started {
                debug!(network = %state.network, ?kind, "callback while stopped, dropping");
                continue;
            }

            match kind {
                UpstreamEventKind::Available
                | UpstreamEventKind::Capabilities
                | UpstreamEventKind::LinkProperties => {
                    self.networks.insert(state.network, state.clone());
                }
                UpstreamEventKind::Lost => {
                    self.networks.remove(&state.network);
                }
            }

            return Poll::Ready(Some((kind, state)));
        }
    }

    fn request(&mut self, request: ConnectivityRequest) {
        if let Err(e) = self.port.try_send(request) {
            warn!("connectivity request dropped: {e}");
        }
    }
}
