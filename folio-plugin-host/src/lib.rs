//! folio-plugin-host: plugin runtime for the folio CMS
//!
//! This crate runs untrusted content plugins in sandboxed VMs and wires
//! them into the content pipeline.
//!
//! - [`pool`]: fixed-size pools of reusable VM handles per plugin
//! - [`manager`]: discovery, dependency ordering, startup and shutdown
//! - [`hooks`]: approved lifecycle hooks run around content mutations
//! - [`breaker`]: per-plugin circuit breakers for embedders
//! - [`wasm`]: the wasmtime-backed VM runtime
//!
//! # Example
//!
//! ```ignore
//! use folio_plugin_host::{HookEngine, HostConfig, PluginManager, WasmRuntime};
//! use std::sync::Arc;
//!
//! let config = HostConfig::load("folio.toml")?;
//! let runtime = Arc::new(WasmRuntime::new(data_access, config.wasm.clone())?);
//! let manager = Arc::new(PluginManager::new(config.manager.clone(), runtime));
//! manager.load_all().await?;
//!
//! let hooks = HookEngine::new(config.hooks.clone(), manager.clone(), store);
//! hooks.register_from(&manager).await?;
//! hooks.run_before_hooks(None, HookEvent::BeforeCreate, "posts", &record).await?;
//! ```

pub mod approval;
pub mod audit;
pub mod breaker;
pub mod capability;
pub mod config;
pub mod deps;
pub mod discovery;
pub mod hooks;
pub mod manager;
pub mod pool;
#[cfg(feature = "subscriber")]
pub mod tracing_support;
pub mod vm;
pub mod wasm;

pub use approval::{ApprovalStore, MemoryApprovalStore, SqlApprovalStore, StoreError};
pub use audit::{AuditEvent, AuditSink, FileAuditSink, MemoryAuditSink, NullAuditSink};
pub use breaker::{BreakerError, BreakerRegistry, CircuitBreaker, CircuitState};
pub use capability::{CapabilityError, CapabilitySet, DataAccess, DenyAllDataAccess};
pub use config::{BreakerConfig, HookConfig, HostConfig, ManagerConfig, PoolConfig, WasmConfig};
pub use deps::{resolve_order, DependencyError};
pub use discovery::{DiscoveredPlugin, DiscoveryError, DiscoveryResult, PluginScanner};
pub use hooks::{HookEngine, HookError, HookKey, HookStatus};
pub use manager::{LoadReport, ManagerError, PluginManager, PluginSnapshot, PluginState};
pub use pool::{CallOptions, PoolError, PoolLookup, PoolStats, PooledVm, SlotKind, VmId, VmPool};
pub use vm::{Invocation, PluginRuntime, ScriptVm, VmError, VmFactory};
pub use wasm::{WasmError, WasmRuntime};

pub use folio_plugin_api::{
    DataOp, DataRequest, DataResponse, HookDecl, HookEvent, HookReply, PluginInfo, API_VERSION,
};
