//! Hook dispatch engine

use super::error::HookError;
use super::fault::{FaultState, FaultTable};
use super::index::{HookEntry, HookIndex, HookKey};
use crate::approval::{ApprovalStore, StoreError};
use crate::audit::{self, AuditSink, NullAuditSink};
use crate::config::HookConfig;
use crate::manager::PluginManager;
use crate::pool::{CallOptions, PoolError, PoolLookup, VmPool};
use crate::vm::{Invocation, VmError};
use folio_plugin_api::{HookDecl, HookEvent, RECORD_EVENT_FIELD, RECORD_TABLE_FIELD};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Slack given to a VM to report its own deadline before the host stops waiting
const DEADLINE_GRACE: Duration = Duration::from_millis(100);

/// Admin view of one registered hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookStatus {
    pub key: HookKey,
    pub priority: i32,
    pub approved: bool,
    pub fault: FaultState,
}

/// Indexes plugin hooks and dispatches content events to them
pub struct HookEngine {
    config: HookConfig,
    pools: Arc<dyn PoolLookup>,
    store: Arc<dyn ApprovalStore>,
    audit: Arc<dyn AuditSink>,
    schema: OnceCell<()>,
    index: RwLock<HookIndex>,
    approvals: RwLock<HashMap<HookKey, bool>>,
    faults: Arc<FaultTable>,
    next_seq: AtomicU64,
    limiter: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    closing: AtomicBool,
}

impl HookEngine {
    pub fn new(
        config: HookConfig,
        pools: Arc<dyn PoolLookup>,
        store: Arc<dyn ApprovalStore>,
    ) -> Self {
        let faults = Arc::new(FaultTable::new(config.fault_threshold));
        let limiter = Arc::new(Semaphore::new(config.after_concurrency));
        Self {
            config,
            pools,
            store,
            audit: Arc::new(NullAuditSink),
            schema: OnceCell::new(),
            index: RwLock::new(HookIndex::new()),
            approvals: RwLock::new(HashMap::new()),
            faults,
            next_seq: AtomicU64::new(0),
            limiter,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closing: AtomicBool::new(false),
        }
    }

    /// Record approval changes to an audit sink
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.schema
            .get_or_try_init(|| self.store.ensure_schema())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Index a plugin's declared hooks and load their approval flags.
    ///
    /// Returns the number of hooks indexed. Runs at load time, before
    /// dispatch starts.
    pub async fn register_plugin(
        &self,
        plugin: &str,
        decls: &[HookDecl],
    ) -> Result<usize, StoreError> {
        self.ensure_schema().await?;

        let mut added = 0;
        for decl in decls {
            let key = HookKey::new(plugin, decl.event, decl.table.clone());
            let approved = self.store.upsert_hook(&key, decl.priority).await?;

            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let entry = HookEntry::new(key.clone(), decl.priority, seq);
            let inserted = self
                .index
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(entry);
            if !inserted {
                tracing::warn!(hook = %key, "Duplicate hook declaration ignored");
                continue;
            }
            self.approvals
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key.clone(), approved);

            tracing::debug!(hook = %key, priority = decl.priority, approved, "Hook registered");
            added += 1;
        }
        Ok(added)
    }

    /// Register the hooks of every running plugin, in load order
    pub async fn register_from(&self, manager: &PluginManager) -> Result<usize, StoreError> {
        let mut total = 0;
        for plugin in manager.list_running() {
            total += self.register_plugin(&plugin.name, &plugin.hooks).await?;
        }
        tracing::info!(hooks = total, "Hook index built");
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Whether any hook is registered for an event/table, approved or not
    pub fn has_hooks(&self, event: HookEvent, table: &str) -> bool {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(event, table)
    }

    /// Approved, enabled entries for an event/table in dispatch order
    pub fn gather_entries(&self, event: HookEvent, table: &str) -> Vec<Arc<HookEntry>> {
        let candidates = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(event, table);
        if candidates.is_empty() {
            return candidates;
        }

        let approvals = self.approvals.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = candidates
            .into_iter()
            .filter(|e| approvals.get(&e.key).copied().unwrap_or(false))
            .filter(|e| !self.faults.is_disabled(&e.key))
            .collect();
        entries.sort_by(|a, b| HookEntry::dispatch_order(a, b));
        entries
    }

    fn prepare_record<R>(
        event: HookEvent,
        table: &str,
        record: &R,
    ) -> Result<Arc<serde_json::Value>, HookError>
    where
        R: Serialize + ?Sized,
    {
        let mut value = serde_json::to_value(record).map_err(|e| HookError::InvalidRecord {
            detail: e.to_string(),
        })?;
        let Some(fields) = value.as_object_mut() else {
            return Err(HookError::InvalidRecord {
                detail: format!("expected a keyed record, got {}", value),
            });
        };
        fields.insert(RECORD_TABLE_FIELD.to_string(), table.into());
        fields.insert(RECORD_EVENT_FIELD.to_string(), event.as_str().into());
        Ok(Arc::new(value))
    }

    // ------------------------------------------------------------------
    // Synchronous dispatch
    // ------------------------------------------------------------------

    /// Run the matching hooks inline, in order, stopping at the first failure.
    ///
    /// The whole chain is bounded by the tighter of `deadline` and the
    /// configured per-event budget. Handlers cannot use data access: the
    /// caller is expected to hold its own transaction.
    pub async fn run_before_hooks<R>(
        &self,
        deadline: Option<Instant>,
        event: HookEvent,
        table: &str,
        record: &R,
    ) -> Result<(), HookError>
    where
        R: Serialize + ?Sized,
    {
        if !self.has_hooks(event, table) {
            return Ok(());
        }
        let entries = self.gather_entries(event, table);
        if entries.is_empty() {
            return Ok(());
        }

        let record = Self::prepare_record(event, table, record)?;
        let budget = Instant::now() + self.config.before_event_timeout;
        let event_deadline = deadline.map_or(budget, |d| d.min(budget));

        for entry in entries {
            match self.run_one_before(&entry, &record, event_deadline).await {
                Ok(()) => self.faults.record_success(&entry.key),
                Err(e) => {
                    if e.is_fault() && self.faults.record_failure(&entry.key) {
                        tracing::warn!(
                            hook = %entry.key,
                            threshold = self.config.fault_threshold,
                            "Hook disabled after consecutive failures"
                        );
                    }
                    tracing::warn!(hook = %entry.key, error = %e, detail = %e.detail(), "Before hook failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn run_one_before(
        &self,
        entry: &HookEntry,
        record: &Arc<serde_json::Value>,
        event_deadline: Instant,
    ) -> Result<(), HookError> {
        let key = &entry.key;
        let Some(pool) = self.pools.pool(&key.plugin) else {
            return Err(HookError::Unavailable {
                key: key.clone(),
                detail: format!("no VM pool for plugin '{}'", key.plugin),
            });
        };

        let hook_deadline = event_deadline.min(Instant::now() + self.config.before_hook_timeout);
        let vm = pool
            .get_for_hook(Some(hook_deadline))
            .await
            .map_err(|e| pool_error(key, e))?;

        let call = Invocation::Hook {
            key: entry.handler.clone(),
            record: record.clone(),
        };
        let options = CallOptions {
            deadline: Some(hook_deadline),
            block_data_access: true,
            ..CallOptions::default()
        };

        match tokio::time::timeout_at(hook_deadline + DEADLINE_GRACE, pool.call(vm, call, options))
            .await
        {
            Ok(result) => result.map_err(|e| vm_error(key, e)),
            Err(_) => Err(HookError::TimedOut {
                key: key.clone(),
                detail: "handler did not return before its deadline".to_string(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Asynchronous dispatch
    // ------------------------------------------------------------------

    /// Hand the matching hooks to background workers.
    ///
    /// Workers are bounded by the engine's concurrency limiter; this call
    /// waits for a free slot but never for a handler to finish. Workers run
    /// under the engine's lifetime, not the caller's. A no-op once the
    /// engine is closing.
    pub async fn run_after_hooks<R>(&self, event: HookEvent, table: &str, record: &R)
    where
        R: Serialize + ?Sized,
    {
        if self.is_closing() || !self.has_hooks(event, table) {
            return;
        }
        let entries = self.gather_entries(event, table);
        if entries.is_empty() {
            return;
        }

        let record = match Self::prepare_record(event, table, record) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(event = %event, table = %table, detail = %e.detail(), "After hooks skipped");
                return;
            }
        };

        for entry in entries {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                permit = self.limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            if self.is_closing() {
                return;
            }
            let Some(pool) = self.pools.pool(&entry.key.plugin) else {
                tracing::warn!(hook = %entry.key, "No VM pool for after hook");
                continue;
            };

            let worker = AfterHook {
                pool,
                entry,
                record: record.clone(),
                faults: self.faults.clone(),
                timeout: self.config.after_hook_timeout,
                op_budget: self.config.after_op_budget,
                shutdown: self.shutdown.clone(),
            };
            self.tracker.spawn(worker.run(permit));
        }
    }

    /// Async handlers currently running or waiting for a VM
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Approve a hook, persisting the flag first
    pub async fn approve(&self, key: &HookKey, actor: &str) -> Result<(), StoreError> {
        self.set_approval(key, true, actor).await
    }

    /// Revoke a hook's approval, persisting the flag first
    pub async fn revoke(&self, key: &HookKey, actor: &str) -> Result<(), StoreError> {
        self.set_approval(key, false, actor).await
    }

    async fn set_approval(&self, key: &HookKey, approved: bool, actor: &str) -> Result<(), StoreError> {
        let known = self
            .approvals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key);
        if !known {
            return Err(StoreError::NotFound(key.to_string()));
        }

        self.store.set_hook_approval(key, approved, actor).await?;
        self.approvals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), approved);

        tracing::info!(hook = %key, approved, actor = %actor, "Hook approval changed");
        audit::emit(
            self.audit.as_ref(),
            audit::hook_approval(&key.plugin, key.event, &key.table, approved, actor),
        );
        Ok(())
    }

    /// Every registered hook with its approval and fault state
    pub fn list(&self) -> Vec<HookStatus> {
        let entries = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries();
        let approvals = self.approvals.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .into_iter()
            .map(|e| HookStatus {
                key: e.key.clone(),
                priority: e.priority,
                approved: approvals.get(&e.key).copied().unwrap_or(false),
                fault: self.faults.get(&e.key),
            })
            .collect()
    }

    /// Clear a hook's failure counter and re-enable it
    pub fn reset_fault(&self, key: &HookKey) -> bool {
        let reset = self.faults.reset(key);
        if reset {
            tracing::info!(hook = %key, "Hook fault state reset");
        }
        reset
    }

    /// Fault state of one hook
    pub fn fault_state(&self, key: &HookKey) -> FaultState {
        self.faults.get(key)
    }

    /// Strip a plugin's hooks from every index and forget their state
    pub async fn remove_plugin(&self, plugin: &str) -> Result<(), StoreError> {
        let removed = self
            .index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_plugin(plugin);
        self.approvals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| key.plugin != plugin);
        self.faults.remove_plugin(plugin);

        tracing::info!(plugin = %plugin, hooks = removed.len(), "Plugin hooks removed");
        self.store.remove_plugin(plugin).await
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Stop accepting async work and interrupt in-flight handlers.
    ///
    /// Running handlers are cancelled through their VM's interrupt flag.
    /// Returns once every worker has wound down or `deadline` elapsed,
    /// whichever comes first.
    pub async fn close(&self, deadline: Duration) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.limiter.close();
        self.tracker.close();

        let pending = self.tracker.len();
        if tokio::time::timeout(deadline, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                pending = self.tracker.len(),
                "After hooks still running at shutdown deadline"
            );
        } else {
            tracing::debug!(drained = pending, "Hook engine closed");
        }
    }
}

impl std::fmt::Debug for HookEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookEngine")
            .field("hooks", &self.index.read().unwrap_or_else(PoisonError::into_inner).len())
            .field("in_flight", &self.in_flight())
            .field("closing", &self.is_closing())
            .finish()
    }
}

struct AfterHook {
    pool: VmPool,
    entry: Arc<HookEntry>,
    record: Arc<serde_json::Value>,
    faults: Arc<FaultTable>,
    timeout: Duration,
    op_budget: u32,
    shutdown: CancellationToken,
}

impl AfterHook {
    async fn run(self, _permit: OwnedSemaphorePermit) {
        let key = &self.entry.key;
        let deadline = Instant::now() + self.timeout;

        let vm = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                tracing::debug!(hook = %key, "After hook abandoned at shutdown");
                return;
            }
            vm = self.pool.get_for_hook(Some(deadline)) => vm,
        };
        let vm = match vm {
            Ok(vm) => vm,
            Err(e) => {
                tracing::warn!(hook = %key, error = %e, "After hook could not get a VM");
                return;
            }
        };

        let call = Invocation::Hook {
            key: self.entry.handler.clone(),
            record: self.record.clone(),
        };
        let options = CallOptions {
            deadline: Some(deadline),
            block_data_access: false,
            op_ceiling: Some(self.op_budget),
            cancel: Some(self.shutdown.clone()),
        };

        let result =
            match tokio::time::timeout_at(deadline + DEADLINE_GRACE, self.pool.call(vm, call, options)).await {
                Ok(result) => result,
                Err(_) => Err(VmError::DeadlineExceeded),
            };

        match result {
            Ok(()) => self.faults.record_success(key),
            Err(e) if self.shutdown.is_cancelled() => {
                tracing::debug!(hook = %key, error = %e, "After hook interrupted at shutdown");
            }
            Err(VmError::Rejected(reason)) => {
                tracing::debug!(hook = %key, reason = %reason, "After hook returned a rejection, ignored");
            }
            Err(e) => {
                tracing::warn!(hook = %key, error = %e, "After hook failed");
                if self.faults.record_failure(key) {
                    tracing::warn!(hook = %key, "Hook disabled after consecutive failures");
                }
            }
        }
    }
}

fn pool_error(key: &HookKey, e: PoolError) -> HookError {
    HookError::Unavailable {
        key: key.clone(),
        detail: e.to_string(),
    }
}

fn vm_error(key: &HookKey, e: VmError) -> HookError {
    let detail = e.to_string();
    match e {
        VmError::Rejected(reason) => HookError::Rejected {
            key: key.clone(),
            detail: reason,
        },
        VmError::DeadlineExceeded => HookError::TimedOut {
            key: key.clone(),
            detail,
        },
        _ => HookError::Failed {
            key: key.clone(),
            detail,
        },
    }
}
