use tracing::{debug, error, warn};

use super::{IfaceMessage, MachineId, StateReport};
use crate::{
    services::NetworkManager,
    types::{ErrorCode, InterfaceState, InterfaceType},
};

/// Context handed to a machine for one message: the network-management
/// service to program the downstream with, and the report sink the driver
/// drains afterwards.
pub(crate) struct MachineCtx<'a> {
    pub nms: &'a dyn NetworkManager,
    pub reports: &'a mut Vec<StateReport>,
}

/// Whether the machine survives the message it just processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MachineStatus {
    Alive,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Tracked and tetherable, not requested.
    Available,
    /// Requested; the downstream is programmed, waiting for an upstream.
    Starting,
    /// Forwarding through `upstream` (or parked without one).
    Tethered,
}

/// State machine for one downstream interface.
pub(crate) struct InterfaceMachine {
    id: MachineId,
    iface: String,
    ty: InterfaceType,
    state: State,
    /// The upstream interface NAT is currently programmed against.
    upstream: Option<String>,
}

impl InterfaceMachine {
    pub(crate) fn new(id: MachineId, iface: String, ty: InterfaceType) -> Self {
        Self { id, iface, ty, state: State::Available, upstream: None }
    }

    pub(crate) fn id(&self) -> MachineId {
        self.id
    }

    pub(crate) fn iface(&self) -> &str {
        &self.iface
    }

    pub(crate) fn interface_type(&self) -> InterfaceType {
        self.ty
    }

    /// Processes one message. Runs on the shared event loop; everything in
    /// here is bounded.
    pub(crate) fn handle(&mut self, msg: IfaceMessage, ctx: &mut MachineCtx<'_>) -> MachineStatus {
        debug!(iface = %self.iface, state = ?self.state, ?msg, "interface machine message");

        match msg {
            IfaceMessage::TetherRequested => self.on_tether_requested(ctx),
            IfaceMessage::TetherUnrequested => self.on_tether_unrequested(ctx),
            IfaceMessage::ConnectionChanged(upstream) => self.on_connection_changed(upstream, ctx),
            IfaceMessage::Error(code) => self.on_master_error(code, ctx),
            IfaceMessage::InterfaceDown => return self.on_interface_down(ctx),
        }

        MachineStatus::Alive
    }

    fn on_tether_requested(&mut self, ctx: &mut MachineCtx<'_>) {
        if self.state != State::Available {
            debug!(iface = %self.iface, "tether requested while already requested, ignoring");
            return;
        }

        if let Err(e) = ctx.nms.tether_interface(&self.iface) {
            error!(iface = %self.iface, "failed to tether interface: {e}");
            self.report(ctx, InterfaceState::Available, ErrorCode::MasterError);
            return;
        }

        self.state = State::Starting;
        self.report(ctx, InterfaceState::Tethered, ErrorCode::NoError);
    }

    fn on_tether_unrequested(&mut self, ctx: &mut MachineCtx<'_>) {
        if self.state == State::Available {
            debug!(iface = %self.iface, "untether requested while not tethered, ignoring");
            return;
        }

        let code = self.teardown_downstream(ctx);
        self.state = State::Available;
        self.report(ctx, InterfaceState::Available, code);
    }

    fn on_connection_changed(&mut self, upstream: Option<String>, ctx: &mut MachineCtx<'_>) {
        match self.state {
            State::Available => {
                debug!(iface = %self.iface, "stray upstream notification, ignoring");
            }
            State::Starting | State::Tethered => {
                if upstream == self.upstream && self.state == State::Tethered {
                    return;
                }

                if let Some(old) = self.upstream.take() {
                    if let Err(e) = ctx.nms.disable_nat(&self.iface, &old) {
                        warn!(iface = %self.iface, upstream = %old, "failed to drop NAT: {e}");
                    }
                }

                match upstream {
                    Some(up) => {
                        if let Err(e) = ctx.nms.enable_nat(&self.iface, &up) {
                            error!(iface = %self.iface, upstream = %up, "failed to program NAT: {e}");
                            if let Err(e) = ctx.nms.untether_interface(&self.iface) {
                                warn!(iface = %self.iface, "cleanup untether failed: {e}");
                            }
                            self.state = State::Available;
                            self.report(ctx, InterfaceState::Available, ErrorCode::MasterError);
                            return;
                        }
                        self.upstream = Some(up);
                        self.state = State::Tethered;
                    }
                    None => {
                        // No upstream right now; stay put and wait for the
                        // next notification.
                    }
                }
            }
        }
    }

    fn on_master_error(&mut self, code: ErrorCode, ctx: &mut MachineCtx<'_>) {
        warn!(iface = %self.iface, ?code, "master error notification");
        if self.state != State::Available {
            self.teardown_downstream(ctx);
            self.state = State::Available;
        }
        self.report(ctx, InterfaceState::Available, code);
    }

    fn on_interface_down(&mut self, ctx: &mut MachineCtx<'_>) -> MachineStatus {
        if self.state != State::Available {
            self.teardown_downstream(ctx);
        }
        self.report(ctx, InterfaceState::Unavailable, ErrorCode::NoError);
        MachineStatus::Terminated
    }

    /// Drops NAT and unprograms the downstream. Returns the error code to
    /// report: failures here are surfaced, not swallowed, so the sticky
    /// per-interface error reflects them.
    fn teardown_downstream(&mut self, ctx: &mut MachineCtx<'_>) -> ErrorCode {
        if let Some(old) = self.upstream.take() {
            if let Err(e) = ctx.nms.disable_nat(&self.iface, &old) {
                warn!(iface = %self.iface, upstream = %old, "failed to drop NAT: {e}");
            }
        }
        match ctx.nms.untether_interface(&self.iface) {
            Ok(()) => ErrorCode::NoError,
            Err(e) => {
                error!(iface = %self.iface, "failed to untether interface: {e}");
                ErrorCode::MasterError
            }
        }
    }

    fn report(&self, ctx: &mut MachineCtx<'_>, state: InterfaceState, error: ErrorCode) {
        ctx.reports.push(StateReport {
            iface: self.iface.clone(),
            machine: self.id,
            state,
            error,
        });
    }
}
