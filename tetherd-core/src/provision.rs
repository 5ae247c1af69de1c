//! Carrier provisioning gate.
//!
//! Decides whether a user "start" request must pass an entitlement check
//! first, and re-runs silent provisioning when the SIM is swapped while
//! tethering is active. The actual provisioning flows and their periodic
//! rechecks are external ([`Provisioner`]); the core only routes through
//! them.

use tracing::debug;

use crate::{config::TetheringConfig, event::SimState, services::Provisioner};

/// Whether enabling tethering must first pass a carrier entitlement check.
///
/// True iff a two-entry provisioning app is configured, the carrier demands
/// entitlement checks, and the no-provisioning override is not set.
pub(crate) fn is_provisioning_required(
    config: &TetheringConfig,
    provisioner: &dyn Provisioner,
) -> bool {
    if config.noprovisioning() || config.provisioning_app().is_none() {
        return false;
    }
    provisioner.entitlement_checks_required()
}

/// Tracks the SIM state stream while tether mode is alive.
///
/// Only a not-loaded → LOADED transition counts as a SIM change; the
/// steady-state LOADED broadcasts a booted device emits are ignored.
#[derive(Debug, Default)]
pub(crate) struct SimChangeTracker {
    listening: bool,
    not_loaded_seen: bool,
}

impl SimChangeTracker {
    pub(crate) fn start(&mut self) {
        if !self.listening {
            debug!("listening for SIM changes");
            self.listening = true;
            self.not_loaded_seen = false;
        }
    }

    pub(crate) fn stop(&mut self) {
        if self.listening {
            debug!("no longer listening for SIM changes");
            self.listening = false;
        }
    }

    /// Feeds one SIM state observation. Returns `true` when a SIM change
    /// (not-loaded followed by loaded) completed and re-provisioning should
    /// run.
    pub(crate) fn observe(&mut self, state: SimState) -> bool {
        if !self.listening {
            return false;
        }

        if !state.is_loaded() {
            self.not_loaded_seen = true;
            return false;
        }

        if self.not_loaded_seen {
            self.not_loaded_seen = false;
            return true;
        }

        false
    }
}
