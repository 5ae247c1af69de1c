//! Tether-state registry: the shared map from interface name to its machine
//! handle and last-known state.
//!
//! One mutex guards the map and the subsystem request flags together. The
//! lock is only ever held for the duration of a map mutation or a snapshot
//! copy; callers never hold it across a message send or an external call.

use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::{
    iface::MachineId,
    types::{ErrorCode, InterfaceState},
};

/// Per-interface record: the machine handle plus the last state and error it
/// reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TetherEntry {
    pub machine: MachineId,
    pub last_state: InterfaceState,
    pub last_error: ErrorCode,
}

impl TetherEntry {
    /// Machines start out available and error-free.
    fn new(machine: MachineId) -> Self {
        Self { machine, last_state: InterfaceState::Available, last_error: ErrorCode::NoError }
    }
}

/// Request flags for the three downstream subsystems, guarded by the same
/// mutex as the interface map.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SubsystemFlags {
    /// Last observed RNDIS function state.
    pub rndis_enabled: bool,
    /// USB tethering should start once RNDIS comes up.
    pub usb_tether_requested: bool,
    /// Wi-Fi tethering should start once the soft-AP reports enabled.
    pub wifi_tether_requested: bool,
}

#[derive(Default)]
struct Inner {
    states: FxHashMap<String, TetherEntry>,
    flags: SubsystemFlags,
}

/// Thread-safe registry of tracked downstream interfaces.
#[derive(Default)]
pub struct TetherStateRegistry {
    inner: Mutex<Inner>,
}

impl TetherStateRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, iface: &str) -> Option<TetherEntry> {
        self.lock().states.get(iface).copied()
    }

    pub fn contains(&self, iface: &str) -> bool {
        self.lock().states.contains_key(iface)
    }

    /// Tracks a new interface. Returns `false` if an entry already exists,
    /// in which case nothing changes.
    pub(crate) fn insert(&self, iface: &str, machine: MachineId) -> bool {
        let mut inner = self.lock();
        if inner.states.contains_key(iface) {
            return false;
        }
        inner.states.insert(iface.to_string(), TetherEntry::new(machine));
        true
    }

    pub(crate) fn remove(&self, iface: &str) -> Option<TetherEntry> {
        self.lock().states.remove(iface)
    }

    /// Records a state report, but only if `machine` still matches the
    /// entry's handle; reports from replaced machines are dropped.
    pub(crate) fn update(
        &self,
        iface: &str,
        machine: MachineId,
        state: InterfaceState,
        error: ErrorCode,
    ) -> bool {
        let mut inner = self.lock();
        match inner.states.get_mut(iface) {
            Some(entry) if entry.machine == machine => {
                entry.last_state = state;
                entry.last_error = error;
                true
            }
            _ => false,
        }
    }

    /// Resets every recorded error back to [`ErrorCode::NoError`].
    pub(crate) fn clear_errors(&self) {
        for entry in self.lock().states.values_mut() {
            entry.last_error = ErrorCode::NoError;
        }
    }

    /// An owned copy of the map for iteration without holding the lock.
    pub fn snapshot(&self) -> Vec<(String, TetherEntry)> {
        self.lock().states.iter().map(|(iface, entry)| (iface.clone(), *entry)).collect()
    }

    /// Names of entries currently in `state`.
    pub fn ifaces_in_state(&self, state: InterfaceState) -> Vec<String> {
        let mut ifaces: Vec<String> = self
            .lock()
            .states
            .iter()
            .filter(|(_, e)| e.last_state == state)
            .map(|(iface, _)| iface.clone())
            .collect();
        ifaces.sort();
        ifaces
    }

    /// Names of entries with a sticky error recorded.
    pub fn errored_ifaces(&self) -> Vec<String> {
        let mut ifaces: Vec<String> = self
            .lock()
            .states
            .iter()
            .filter(|(_, e)| e.last_error.is_error())
            .map(|(iface, _)| iface.clone())
            .collect();
        ifaces.sort();
        ifaces
    }

    /// Runs `f` with the subsystem flags, under the registry lock.
    pub(crate) fn with_flags<R>(&self, f: impl FnOnce(&mut SubsystemFlags) -> R) -> R {
        f(&mut self.lock().flags)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("registry mutex poisoned")
    }
}
