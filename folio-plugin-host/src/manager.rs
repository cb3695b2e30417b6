//! Plugin lifecycle manager
//!
//! Discovers plugins, orders them by dependency and drives each one through
//! its lifecycle, owning one [`VmPool`] per plugin.
//!
//! ```text
//!   Discovered ──► Loading ──┬──► Running ──► Stopped
//!                            └──► Failed
//! ```
//!
//! A plugin whose dependency is not running fails without a pool ever being
//! built for it; failures cascade to dependents but never block unrelated
//! plugins. Shutdown walks the load order backwards so dependencies outlive
//! their dependents.

use crate::approval::ApprovalStore;
use crate::audit::{self, AuditSink, NullAuditSink};
use crate::config::ManagerConfig;
use crate::deps::{resolve_order, DependencyError};
use crate::discovery::{DiscoveredPlugin, DiscoveryError, DiscoveryResult, PluginScanner};
use crate::pool::{CallOptions, PoolLookup, PoolStats, VmPool};
use crate::vm::{Invocation, PluginRuntime, VmError};
use folio_plugin_api::{HookDecl, PluginInfo};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Slack given to a VM to report its own deadline before the host stops waiting
const DEADLINE_GRACE: Duration = Duration::from_millis(100);

/// Errors that abort a whole load
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Plugin discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Plugin dependencies cannot be resolved: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Plugins have already been loaded")]
    AlreadyLoaded,

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Lifecycle state of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Discovered,
    Loading,
    Running,
    Failed,
    Stopped,
}

impl PluginState {
    /// Whether the lifecycle allows moving to `next`
    pub fn can_transition_to(self, next: PluginState) -> bool {
        matches!(
            (self, next),
            (PluginState::Discovered, PluginState::Loading)
                | (PluginState::Loading, PluginState::Running)
                | (PluginState::Loading, PluginState::Failed)
                | (PluginState::Running, PluginState::Stopped)
        )
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginState::Discovered => "discovered",
            PluginState::Loading => "loading",
            PluginState::Running => "running",
            PluginState::Failed => "failed",
            PluginState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginSnapshot {
    pub name: String,
    pub info: PluginInfo,
    pub state: PluginState,
    pub dir: PathBuf,
    pub initializer: PathBuf,
    /// Set iff the plugin failed
    pub failure: Option<String>,
    /// Hooks the plugin declared during startup
    pub hooks: Vec<HookDecl>,
    pub pool: Option<PoolStats>,
}

/// Outcome of [`PluginManager::load_all`]
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Running plugins, in the order they started
    pub load_order: Vec<String>,
    /// Plugins that failed to provision, with the reason
    pub failed: Vec<(String, String)>,
    /// Directories left out of the batch before registration
    pub excluded: Vec<(PathBuf, String)>,
}

struct PluginInstance {
    info: PluginInfo,
    state: PluginState,
    dir: PathBuf,
    initializer: PathBuf,
    failure: Option<String>,
    hooks: Vec<HookDecl>,
    pool: Option<VmPool>,
}

impl PluginInstance {
    fn new(plugin: DiscoveredPlugin) -> Self {
        Self {
            info: plugin.info,
            state: PluginState::Discovered,
            dir: plugin.dir,
            initializer: plugin.initializer,
            failure: None,
            hooks: Vec::new(),
            pool: None,
        }
    }

    fn transition(&mut self, next: PluginState) {
        if !self.state.can_transition_to(next) {
            tracing::error!(
                plugin = %self.info.name,
                from = %self.state,
                to = %next,
                "Illegal plugin state transition ignored"
            );
            return;
        }
        self.state = next;
    }

    fn snapshot(&self) -> PluginSnapshot {
        PluginSnapshot {
            name: self.info.name.clone(),
            info: self.info.clone(),
            state: self.state,
            dir: self.dir.clone(),
            initializer: self.initializer.clone(),
            failure: self.failure.clone(),
            hooks: self.hooks.clone(),
            pool: self.pool.as_ref().map(VmPool::stats),
        }
    }
}

#[derive(Default)]
struct ManagerInner {
    plugins: HashMap<String, PluginInstance>,
    load_order: Vec<String>,
}

/// Owns every plugin and its VM pool
pub struct PluginManager {
    config: ManagerConfig,
    runtime: Arc<dyn PluginRuntime>,
    store: Option<Arc<dyn ApprovalStore>>,
    audit: Arc<dyn AuditSink>,
    inner: RwLock<ManagerInner>,
    loaded: AtomicBool,
    stopped: AtomicBool,
}

impl PluginManager {
    pub fn new(config: ManagerConfig, runtime: Arc<dyn PluginRuntime>) -> Self {
        Self {
            config,
            runtime,
            store: None,
            audit: Arc::new(NullAuditSink),
            inner: RwLock::new(ManagerInner::default()),
            loaded: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Backing store closed at shutdown
    pub fn with_store(mut self, store: Arc<dyn ApprovalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Record lifecycle transitions to an audit sink
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ManagerInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ManagerInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Discover, order and start every plugin under the plugin root.
    ///
    /// Individual plugin failures are reported, not returned; only a
    /// malformed dependency graph or an unreadable plugin root aborts. An
    /// aborted load registers nothing and may be retried.
    pub async fn load_all(&self) -> Result<LoadReport, ManagerError> {
        if self.loaded.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyLoaded);
        }

        let (discovery, order) = match self.plan().await {
            Ok(plan) => plan,
            Err(e) => {
                self.loaded.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        tracing::info!(plugins = order.len(), order = ?order, "Plugin load order resolved");

        let mut report = LoadReport {
            excluded: discovery
                .failures
                .into_iter()
                .map(|(path, e)| (path, e.to_string()))
                .collect(),
            ..LoadReport::default()
        };

        {
            let mut inner = self.write();
            for plugin in discovery.plugins {
                inner
                    .plugins
                    .insert(plugin.info.name.clone(), PluginInstance::new(plugin));
            }
        }

        for name in order {
            if let Err(reason) = self.provision(&name).await {
                report.failed.push((name, reason));
            }
        }

        report.load_order = self.load_order();
        tracing::info!(
            running = report.load_order.len(),
            failed = report.failed.len(),
            excluded = report.excluded.len(),
            "Plugins loaded"
        );
        Ok(report)
    }

    /// Scan the plugin root and order what it holds
    async fn plan(&self) -> Result<(DiscoveryResult, Vec<String>), ManagerError> {
        let scanner = PluginScanner::new(self.runtime.clone(), self.config.host_version.clone());
        let root = self.config.plugins_dir.clone();
        let discovery = tokio::task::spawn_blocking(move || scanner.scan_directory(root))
            .await
            .map_err(|e| ManagerError::Task(e.to_string()))??;
        let order = resolve_order(discovery.plugins.iter().map(|p| &p.info))?;
        Ok((discovery, order))
    }

    async fn provision(&self, name: &str) -> Result<(), String> {
        let (info, initializer) = {
            let mut inner = self.write();
            let unmet = {
                let Some(plugin) = inner.plugins.get(name) else {
                    return Err(format!("plugin '{}' is not registered", name));
                };
                plugin
                    .info
                    .dependencies
                    .iter()
                    .find(|dep| {
                        inner
                            .plugins
                            .get(dep.as_str())
                            .map_or(true, |d| d.state != PluginState::Running)
                    })
                    .cloned()
            };
            let Some(plugin) = inner.plugins.get_mut(name) else {
                return Err(format!("plugin '{}' is not registered", name));
            };
            plugin.transition(PluginState::Loading);
            if let Some(dep) = unmet {
                drop(inner);
                return Err(self.fail(name, format!("dependency '{}' is not running", dep), None));
            }
            (plugin.info.clone(), plugin.initializer.clone())
        };

        tracing::debug!(plugin = %name, "Provisioning plugin");

        let runtime = self.runtime.clone();
        let pool_config = self.config.pool.clone();
        let plugin = name.to_string();
        let built = tokio::task::spawn_blocking(move || {
            let factory = runtime
                .factory(&info, &initializer, pool_config.op_budget)
                .map_err(|e| format!("failed to prepare VM factory: {}", e))?;
            VmPool::new(plugin, factory, &pool_config).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())
        .and_then(|r| r);
        let pool = match built {
            Ok(pool) => pool,
            Err(reason) => return Err(self.fail(name, reason, None)),
        };

        let deadline = Instant::now() + self.config.startup_timeout;
        let vm = match pool.get(Some(deadline)).await {
            Ok(vm) => vm,
            Err(e) => return Err(self.fail(name, e.to_string(), Some(&pool))),
        };

        let options = CallOptions {
            deadline: Some(deadline),
            ..CallOptions::default()
        };
        let started = tokio::time::timeout_at(
            deadline + DEADLINE_GRACE,
            vm.invoke(Invocation::Startup, options),
        )
        .await;

        let outcome = match started {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                return Err(self.fail(name, format!("startup failed: {}", e), Some(&pool)))
            }
            Err(_) => {
                let reason = format!(
                    "startup failed: {}",
                    VmError::DeadlineExceeded
                );
                return Err(self.fail(name, reason, Some(&pool)));
            }
        };
        if let Err(e) = outcome.result {
            pool.put(outcome.vm);
            return Err(self.fail(name, format!("startup failed: {}", e), Some(&pool)));
        }

        pool.snapshot_globals(&outcome.vm);
        let hooks = outcome.vm.declared_hooks();
        pool.put(outcome.vm);

        let (dir, version) = {
            let mut inner = self.write();
            let Some(plugin) = inner.plugins.get_mut(name) else {
                pool.close();
                return Err(format!("plugin '{}' is not registered", name));
            };
            plugin.hooks = hooks;
            plugin.pool = Some(pool);
            plugin.transition(PluginState::Running);
            let loaded = (plugin.dir.clone(), plugin.info.version.clone());
            inner.load_order.push(name.to_string());
            loaded
        };

        tracing::info!(plugin = %name, version = %version, "Plugin running");
        audit::emit(self.audit.as_ref(), audit::plugin_loaded(name, &dir, &version));
        Ok(())
    }

    fn fail(&self, name: &str, reason: String, pool: Option<&VmPool>) -> String {
        if let Some(pool) = pool {
            pool.close();
        }
        if let Some(plugin) = self.write().plugins.get_mut(name) {
            plugin.transition(PluginState::Failed);
            plugin.failure = Some(reason.clone());
            plugin.pool = None;
        }
        tracing::error!(plugin = %name, reason = %reason, "Plugin failed to load");
        audit::emit(self.audit.as_ref(), audit::plugin_failed(name, &reason));
        reason
    }

    /// Snapshot of one plugin
    pub fn get_plugin(&self, name: &str) -> Option<PluginSnapshot> {
        self.read().plugins.get(name).map(PluginInstance::snapshot)
    }

    /// Snapshot of every registered plugin, ordered by name
    pub fn list_plugins(&self) -> Vec<PluginSnapshot> {
        let mut plugins: Vec<_> = self
            .read()
            .plugins
            .values()
            .map(PluginInstance::snapshot)
            .collect();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));
        plugins
    }

    /// Snapshot of every running plugin, in load order
    pub fn list_running(&self) -> Vec<PluginSnapshot> {
        let inner = self.read();
        inner
            .load_order
            .iter()
            .filter_map(|name| inner.plugins.get(name))
            .filter(|p| p.state == PluginState::Running)
            .map(PluginInstance::snapshot)
            .collect()
    }

    /// Names of plugins in the order they reached Running
    pub fn load_order(&self) -> Vec<String> {
        self.read().load_order.clone()
    }

    /// Stop every running plugin in reverse load order, then release pools
    /// and the backing store.
    ///
    /// Shutdown routines are best effort: failures and timeouts are logged
    /// and the plugin still moves to Stopped. `deadline` bounds the whole
    /// sequence; each routine is further bounded by the configured
    /// shutdown timeout.
    pub async fn shutdown(&self, deadline: Duration) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let overall = Instant::now() + deadline;

        let order: Vec<String> = self.read().load_order.iter().rev().cloned().collect();
        for name in order {
            let pool = {
                let inner = self.read();
                match inner.plugins.get(&name) {
                    Some(p) if p.state == PluginState::Running => p.pool.clone(),
                    _ => continue,
                }
            };

            if let Some(pool) = pool {
                self.stop_one(&name, &pool, overall).await;
            }

            if let Some(plugin) = self.write().plugins.get_mut(&name) {
                plugin.transition(PluginState::Stopped);
            }
            tracing::info!(plugin = %name, "Plugin stopped");
            audit::emit(self.audit.as_ref(), audit::plugin_stopped(&name));
        }

        let pools: Vec<VmPool> = self
            .read()
            .plugins
            .values()
            .filter_map(|p| p.pool.clone())
            .collect();
        for pool in &pools {
            pool.close();
        }

        if let Some(store) = &self.store {
            store.close().await;
        }
        if let Err(e) = self.audit.flush() {
            tracing::warn!(error = %e, "Failed to flush audit sink");
        }
        tracing::info!(pools = pools.len(), "Plugin manager shut down");
    }

    async fn stop_one(&self, name: &str, pool: &VmPool, overall: Instant) {
        let deadline = overall.min(Instant::now() + self.config.shutdown_timeout);
        let vm = match pool.get(Some(deadline)).await {
            Ok(vm) => vm,
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Skipping shutdown routine");
                return;
            }
        };

        let options = CallOptions {
            deadline: Some(deadline),
            ..CallOptions::default()
        };
        match tokio::time::timeout_at(
            deadline + DEADLINE_GRACE,
            pool.call(vm, Invocation::Shutdown, options),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(plugin = %name, error = %e, "Shutdown routine failed"),
            Err(_) => tracing::warn!(plugin = %name, "Shutdown routine timed out"),
        }
    }
}

impl PoolLookup for PluginManager {
    /// Pool of a running plugin
    fn pool(&self, plugin: &str) -> Option<VmPool> {
        self.read()
            .plugins
            .get(plugin)
            .filter(|p| p.state == PluginState::Running)
            .and_then(|p| p.pool.clone())
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.read();
        f.debug_struct("PluginManager")
            .field("plugins_dir", &self.config.plugins_dir)
            .field("plugins", &inner.plugins.len())
            .field("load_order", &inner.load_order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use PluginState::*;
        assert!(Discovered.can_transition_to(Loading));
        assert!(Loading.can_transition_to(Running));
        assert!(Loading.can_transition_to(Failed));
        assert!(Running.can_transition_to(Stopped));

        assert!(!Discovered.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Stopped));
        assert!(!Failed.can_transition_to(Loading));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Failed));
    }
}
