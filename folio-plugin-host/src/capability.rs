//! Host capability surface bound to each VM handle
//!
//! Every handle gets exactly one [`CapabilitySet`]. It carries the state the
//! host needs to police a plugin's data access from the outside: a gate the
//! hook engine closes around synchronous calls, a per-checkout operation
//! counter with a resettable ceiling, and an interrupt flag raised when the
//! owner of a running call cancels it.

use folio_plugin_api::{DataRequest, DataResponse};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned to the guest by data-access calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("data access is blocked during synchronous hooks")]
    Blocked,

    #[error("call interrupted by host shutdown")]
    Interrupted,

    #[error("data access budget of {ceiling} operations exceeded")]
    BudgetExceeded { ceiling: u32 },

    #[error("data access failed: {0}")]
    Backend(String),
}

/// Host modules a VM handle must expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostModule {
    /// Query/insert/update/delete capability
    Data,
    /// Guest logging
    Log,
    /// Hook registration
    Hooks,
}

impl HostModule {
    /// Modules a healthy handle must still expose
    pub const REQUIRED: [HostModule; 3] = [HostModule::Data, HostModule::Log, HostModule::Hooks];

    /// Module name as seen by the guest
    pub fn name(&self) -> &'static str {
        match self {
            HostModule::Data => "db",
            HostModule::Log => "log",
            HostModule::Hooks => "hooks",
        }
    }
}

/// Backend executing a plugin's data-access requests
///
/// What a plugin may do with an approved handle is decided here, not by the
/// runtime.
pub trait DataAccess: Send + Sync {
    fn execute(&self, plugin: &str, request: DataRequest) -> Result<DataResponse, String>;
}

/// Backend that refuses every request
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAllDataAccess;

impl DataAccess for DenyAllDataAccess {
    fn execute(&self, plugin: &str, _request: DataRequest) -> Result<DataResponse, String> {
        Err(format!("plugin '{}' has no data access", plugin))
    }
}

/// Per-handle capability state
pub struct CapabilitySet {
    plugin: String,
    blocked: AtomicBool,
    interrupted: AtomicBool,
    ops: AtomicU32,
    ceiling: AtomicU32,
    default_ceiling: u32,
    data: Arc<dyn DataAccess>,
}

impl CapabilitySet {
    /// Create the capability state for one handle
    pub fn new(plugin: impl Into<String>, op_budget: u32, data: Arc<dyn DataAccess>) -> Self {
        Self {
            plugin: plugin.into(),
            blocked: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            ops: AtomicU32::new(0),
            ceiling: AtomicU32::new(op_budget),
            default_ceiling: op_budget,
            data,
        }
    }

    /// Plugin this state belongs to
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Block every data-access call until the guard is dropped
    pub fn block_data_access(&self) -> DataAccessBlock<'_> {
        self.blocked.store(true, Ordering::SeqCst);
        DataAccessBlock { caps: self }
    }

    /// Whether data access is currently blocked
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Ask the running call to stop.
    ///
    /// VM implementations poll [`is_interrupted`](Self::is_interrupted) and
    /// abort; data access fails from here on.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Whether the current call was interrupted
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Clear the interrupt flag before a new call
    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    /// Zero the counter and set the ceiling for the next checkout.
    ///
    /// `None` restores the configured default.
    pub fn reset_ops(&self, ceiling: Option<u32>) {
        self.ops.store(0, Ordering::SeqCst);
        self.ceiling
            .store(ceiling.unwrap_or(self.default_ceiling), Ordering::SeqCst);
    }

    /// Operations used since the last reset
    pub fn ops_used(&self) -> u32 {
        self.ops.load(Ordering::SeqCst)
    }

    /// Ceiling in force for the current checkout
    pub fn ceiling(&self) -> u32 {
        self.ceiling.load(Ordering::SeqCst)
    }

    fn charge(&self) -> Result<(), CapabilityError> {
        let ceiling = self.ceiling();
        let used = self.ops.fetch_add(1, Ordering::SeqCst) + 1;
        if used > ceiling {
            return Err(CapabilityError::BudgetExceeded { ceiling });
        }
        Ok(())
    }

    /// Run a data-access request on behalf of the guest
    pub fn execute(&self, request: DataRequest) -> Result<DataResponse, CapabilityError> {
        if self.is_interrupted() {
            return Err(CapabilityError::Interrupted);
        }
        if self.is_blocked() {
            tracing::debug!(plugin = %self.plugin, table = %request.table, "Data access blocked");
            return Err(CapabilityError::Blocked);
        }
        self.charge()?;
        self.data
            .execute(&self.plugin, request)
            .map_err(CapabilityError::Backend)
    }
}

impl std::fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilitySet")
            .field("plugin", &self.plugin)
            .field("blocked", &self.is_blocked())
            .field("interrupted", &self.is_interrupted())
            .field("ops", &self.ops_used())
            .field("ceiling", &self.ceiling())
            .finish()
    }
}

/// Guard returned by [`CapabilitySet::block_data_access`]
#[must_use = "data access is unblocked as soon as the guard is dropped"]
pub struct DataAccessBlock<'a> {
    caps: &'a CapabilitySet,
}

impl Drop for DataAccessBlock<'_> {
    fn drop(&mut self) {
        self.caps.blocked.store(false, Ordering::SeqCst);
    }
}
