//! Script VM abstraction
//!
//! The runtime never interprets plugin code itself. It drives opaque,
//! already-sandboxed VM handles through [`ScriptVm`], builds them through a
//! [`VmFactory`], and asks a [`PluginRuntime`] for both.

use crate::capability::CapabilitySet;
use folio_plugin_api::{HookDecl, PluginInfo};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Errors raised by a VM handle
#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM construction failed: {0}")]
    Construction(String),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,

    #[error("Trap: {0}")]
    Trap(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Plugin rejected the operation: {0}")]
    Rejected(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("VM call panicked: {0}")]
    Panicked(String),

    #[error("VM handle is no longer available")]
    Unavailable,
}

impl VmError {
    /// Whether the error came from the deadline firing
    pub fn is_timeout(&self) -> bool {
        matches!(self, VmError::DeadlineExceeded)
    }
}

/// Entry point a VM call runs
#[derive(Debug, Clone)]
pub enum Invocation {
    /// The plugin's startup routine
    Startup,

    /// The plugin's shutdown routine
    Shutdown,

    /// A hook handler addressed by its `event:table` key
    Hook {
        key: String,
        record: Arc<serde_json::Value>,
    },
}

impl Invocation {
    /// Short label used in logs
    pub fn label(&self) -> &str {
        match self {
            Invocation::Startup => "startup",
            Invocation::Shutdown => "shutdown",
            Invocation::Hook { key, .. } => key,
        }
    }
}

/// One reusable sandboxed interpreter instance
///
/// Implementations are stateful: the top-level namespace, operand stack and
/// cancellation deadline survive between calls until the pool resets them.
pub trait ScriptVm: Send {
    /// Names currently bound in the top-level namespace
    fn global_names(&self) -> BTreeSet<String>;

    /// Unbind a top-level name
    fn remove_global(&mut self, name: &str);

    /// Clear whatever the interpreter left on its operand stack
    fn reset_stack(&mut self);

    /// Set or clear the cancellation deadline for subsequent calls
    fn set_deadline(&mut self, deadline: Option<Instant>);

    /// Host capability state bound to this handle, absent for capability-free VMs
    fn capabilities(&self) -> Option<Arc<CapabilitySet>>;

    /// Check that the capability surface is intact and host-bound
    fn verify(&self) -> Result<(), String>;

    /// Read the plugin manifest record
    fn read_manifest(&mut self) -> Result<PluginInfo, VmError>;

    /// Hooks the plugin registered while its initializer ran
    fn declared_hooks(&self) -> Vec<HookDecl>;

    /// Run an entry point
    fn invoke(&mut self, call: &Invocation) -> Result<(), VmError>;
}

/// Zero-argument constructor for fully equipped VM handles
pub trait VmFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn ScriptVm>, VmError>;
}

impl<F> VmFactory for F
where
    F: Fn() -> Result<Box<dyn ScriptVm>, VmError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn ScriptVm>, VmError> {
        self()
    }
}

/// Source of VMs for the lifecycle manager
pub trait PluginRuntime: Send + Sync {
    /// File inside a plugin directory that marks it as a plugin
    fn initializer_name(&self) -> &str;

    /// Build a throwaway, capability-free VM to read the manifest from
    fn inspect(&self, initializer: &Path) -> Result<Box<dyn ScriptVm>, VmError>;

    /// Build the factory that equips every pool handle for a plugin
    fn factory(
        &self,
        info: &PluginInfo,
        initializer: &Path,
        op_budget: u32,
    ) -> Result<Arc<dyn VmFactory>, VmError>;
}

/// Placeholder left behind once a pooled handle has been released
pub(crate) struct ReleasedVm;

impl ScriptVm for ReleasedVm {
    fn global_names(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn remove_global(&mut self, _name: &str) {}

    fn reset_stack(&mut self) {}

    fn set_deadline(&mut self, _deadline: Option<Instant>) {}

    fn capabilities(&self) -> Option<Arc<CapabilitySet>> {
        None
    }

    fn verify(&self) -> Result<(), String> {
        Err("handle already released".to_string())
    }

    fn read_manifest(&mut self) -> Result<PluginInfo, VmError> {
        Err(VmError::Unavailable)
    }

    fn declared_hooks(&self) -> Vec<HookDecl> {
        Vec::new()
    }

    fn invoke(&mut self, _call: &Invocation) -> Result<(), VmError> {
        Err(VmError::Unavailable)
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
