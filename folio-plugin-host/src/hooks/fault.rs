//! Per-hook fault isolation
//!
//! Each (plugin, event, table) keeps its own consecutive-failure counter.
//! Past the threshold the hook is disabled until an administrator resets it.

use super::HookKey;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Fault state of one hook
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FaultState {
    pub consecutive_failures: u32,
    pub disabled: bool,
}

#[derive(Debug)]
pub(crate) struct FaultTable {
    threshold: u32,
    states: RwLock<HashMap<HookKey, FaultState>>,
}

impl FaultTable {
    pub(crate) fn new(threshold: u32) -> Self {
        Self {
            threshold,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, key: &HookKey) -> FaultState {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn is_disabled(&self, key: &HookKey) -> bool {
        self.get(key).disabled
    }

    /// Count a failure; returns `true` if it disabled the hook
    pub(crate) fn record_failure(&self, key: &HookKey) -> bool {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(key.clone()).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if !state.disabled && state.consecutive_failures >= self.threshold {
            state.disabled = true;
            return true;
        }
        false
    }

    pub(crate) fn record_success(&self, key: &HookKey) {
        let clean = self
            .states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(true, |s| s.consecutive_failures == 0);
        if clean {
            return;
        }
        if let Some(state) = self
            .states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(key)
        {
            state.consecutive_failures = 0;
        }
    }

    /// Clear the counter and re-enable the hook
    pub(crate) fn reset(&self, key: &HookKey) -> bool {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub(crate) fn remove_plugin(&self, plugin: &str) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| key.plugin != plugin);
    }
}
