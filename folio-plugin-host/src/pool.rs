//! Fixed-capacity pool of reusable VM handles for one plugin
//!
//! The pool is split into a *general* freelist for ordinary checkouts and a
//! smaller *reserved* freelist that only hook dispatch may fall back to, so
//! request traffic can never starve hooks.
//!
//! ```text
//!   get()           ──► general ──────────────────────┐
//!   get_for_hook()  ──► general ──► reserved ──────────┤──► PooledVm
//!                                                      │
//!   put(vm) ◄──────────────────────────────────────────┘
//!     ├─ healthy:   reset stack, clear deadline, scrub new globals, return
//!     └─ unhealthy: discard, rebuild through the factory, same slot
//! ```
//!
//! Pool size never changes: an unhealthy handle is replaced in its own slot,
//! and if the factory fails the slot stays vacant in its freelist and is
//! rebuilt by the next checkout that draws it. A vacant slot counts as
//! available, so `available() + in_use() == size()` while the pool is open.

use crate::capability::CapabilitySet;
use crate::config::PoolConfig;
use crate::vm::{panic_message, Invocation, ReleasedVm, ScriptVm, VmError, VmFactory};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Errors that can occur while checking out a VM
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("VM pool for plugin '{plugin}' exhausted after waiting {waited:?}")]
    Exhausted { plugin: String, waited: Duration },

    #[error("VM pool for plugin '{0}' is closed")]
    Closed(String),

    #[error("Failed to build VM for plugin '{plugin}': {source}")]
    Factory {
        plugin: String,
        #[source]
        source: VmError,
    },
}

/// Identifier of a VM handle, unique within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(u64);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm-{}", self.0)
    }
}

/// Freelist a handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    General,
    Reserved,
}

type DiscardObserver = Box<dyn Fn(VmId, &dyn ScriptVm) + Send + Sync>;

struct Slot {
    id: VmId,
    vm: Option<Box<dyn ScriptVm>>,
}

struct Freelist {
    permits: Semaphore,
    slots: Mutex<Vec<Slot>>,
}

impl Freelist {
    fn new(slots: Vec<Slot>) -> Self {
        Self {
            permits: Semaphore::new(slots.len()),
            slots: Mutex::new(slots),
        }
    }

    fn push(&self, slot: Slot) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slot);
        self.permits.add_permits(1);
    }

    fn pop(&self) -> Option<Slot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    fn drain(&self) -> Vec<Slot> {
        self.permits.close();
        std::mem::take(&mut *self.slots.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

struct PoolShared {
    plugin: String,
    factory: Arc<dyn VmFactory>,
    general: Freelist,
    reserved: Freelist,
    size: usize,
    acquire_timeout: Duration,
    snapshot: RwLock<Option<Arc<BTreeSet<String>>>>,
    bindings: Mutex<HashMap<VmId, Arc<CapabilitySet>>>,
    on_discard: RwLock<Option<DiscardObserver>>,
    closed: AtomicBool,
    checked_out: AtomicUsize,
    next_id: AtomicU64,
}

impl PoolShared {
    fn freelist(&self, kind: SlotKind) -> &Freelist {
        match kind {
            SlotKind::General => &self.general,
            SlotKind::Reserved => &self.reserved,
        }
    }

    fn next_id(&self) -> VmId {
        VmId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn build(&self) -> Result<(VmId, Box<dyn ScriptVm>), VmError> {
        let vm = self.factory.create()?;
        let id = self.next_id();
        if let Some(caps) = vm.capabilities() {
            self.bindings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, caps);
        }
        Ok((id, vm))
    }

    fn unbind(&self, id: VmId) {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Take a slot from a freelist whose permit the caller already holds
    fn checkout(self: &Arc<Self>, kind: SlotKind) -> Result<PooledVm, PoolError> {
        self.checked_out.fetch_add(1, Ordering::SeqCst);
        let list = self.freelist(kind);
        let Some(slot) = list.pop() else {
            self.checked_out.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::Closed(self.plugin.clone()));
        };

        let (id, vm) = match slot.vm {
            Some(vm) => (slot.id, vm),
            None => match self.build() {
                Ok(built) => {
                    tracing::info!(plugin = %self.plugin, vm = %built.0, "Rebuilt vacant VM slot");
                    built
                }
                Err(source) => {
                    list.push(slot);
                    self.checked_out.fetch_sub(1, Ordering::SeqCst);
                    return Err(PoolError::Factory {
                        plugin: self.plugin.clone(),
                        source,
                    });
                }
            },
        };

        Ok(PooledVm {
            id,
            kind,
            inner: vm,
            poisoned: false,
            released: false,
            pool: Arc::downgrade(self),
        })
    }

    fn release(&self, id: VmId, kind: SlotKind, mut vm: Box<dyn ScriptVm>, poisoned: bool) {
        if self.closed.load(Ordering::SeqCst) {
            self.unbind(id);
            self.checked_out.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let health = if poisoned {
            Err("handle poisoned by an aborted call".to_string())
        } else {
            vm.verify()
        };

        let slot = match health {
            Ok(()) => {
                vm.reset_stack();
                vm.set_deadline(None);
                self.scrub(id, vm.as_mut());
                Slot { id, vm: Some(vm) }
            }
            Err(reason) => {
                tracing::warn!(plugin = %self.plugin, vm = %id, reason = %reason, "Discarding unhealthy VM");
                if let Some(observer) = self
                    .on_discard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                {
                    observer(id, vm.as_ref());
                }
                drop(vm);
                self.unbind(id);
                match self.build() {
                    Ok((new_id, new_vm)) => Slot {
                        id: new_id,
                        vm: Some(new_vm),
                    },
                    Err(e) => {
                        tracing::error!(plugin = %self.plugin, error = %e, "Failed to replace VM, slot left vacant");
                        Slot {
                            id: self.next_id(),
                            vm: None,
                        }
                    }
                }
            }
        };

        self.checked_out.fetch_sub(1, Ordering::SeqCst);
        self.freelist(kind).push(slot);
    }

    fn scrub(&self, id: VmId, vm: &mut dyn ScriptVm) {
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(snapshot) = snapshot else {
            return;
        };
        for name in vm.global_names() {
            if !snapshot.contains(&name) {
                tracing::debug!(plugin = %self.plugin, vm = %id, global = %name, "Scrubbing leaked global");
                vm.remove_global(&name);
            }
        }
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Instant {
        let window = Instant::now() + self.acquire_timeout;
        match deadline {
            Some(deadline) if deadline < window => deadline,
            _ => window,
        }
    }
}

/// A VM handle checked out of a [`VmPool`]
///
/// Return it with [`VmPool::put`]. A handle dropped without being put back is
/// treated as corrupted: its slot is rebuilt so the pool keeps its size.
pub struct PooledVm {
    id: VmId,
    kind: SlotKind,
    inner: Box<dyn ScriptVm>,
    poisoned: bool,
    released: bool,
    pool: Weak<PoolShared>,
}

/// Options applied to one VM call
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Cancellation deadline for the call
    pub deadline: Option<Instant>,

    /// Make every data-access call fail for the duration of the call
    pub block_data_access: bool,

    /// Data-access ceiling for this call, `None` for the configured default
    pub op_ceiling: Option<u32>,

    /// Token whose cancellation interrupts the running call
    pub cancel: Option<CancellationToken>,
}

/// Pool counters read from one snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub in_use: usize,
}

/// Handle plus result of a completed VM call
pub struct CallOutcome {
    pub vm: PooledVm,
    pub result: Result<(), VmError>,
}

impl PooledVm {
    /// Handle identifier
    pub fn id(&self) -> VmId {
        self.id
    }

    /// Freelist the handle came from
    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    /// Mark the handle as corrupted so the pool replaces it on return
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Whether the handle will be replaced on return
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn take(&mut self) -> Box<dyn ScriptVm> {
        self.released = true;
        std::mem::replace(&mut self.inner, Box::new(ReleasedVm))
    }

    /// Run an entry point on a blocking thread.
    ///
    /// Panics inside the VM are caught, turned into [`VmError::Panicked`] and
    /// poison the handle. Cancelling `options.cancel` raises the interrupt
    /// flag on the handle's capabilities while the call runs. Returns `Err`
    /// only if the blocking task itself was cancelled, in which case the
    /// handle has already gone back to its pool.
    pub async fn invoke(
        mut self,
        call: Invocation,
        options: CallOptions,
    ) -> Result<CallOutcome, VmError> {
        let watcher = self.inner.capabilities().and_then(|caps| {
            caps.clear_interrupt();
            let cancel = options.cancel.clone()?;
            Some(tokio::spawn(async move {
                cancel.cancelled().await;
                tracing::debug!(plugin = %caps.plugin(), "Interrupting running call");
                caps.interrupt();
            }))
        });

        let task = tokio::task::spawn_blocking(move || {
            let caps = self.inner.capabilities();
            if let Some(caps) = &caps {
                caps.reset_ops(options.op_ceiling);
            }
            let _block = match (&caps, options.block_data_access) {
                (Some(caps), true) => Some(caps.block_data_access()),
                _ => None,
            };

            self.inner
                .set_deadline(options.deadline.map(Instant::into_std));
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| self.inner.invoke(&call)));
            self.inner.set_deadline(None);
            drop(_block);

            let result = match result {
                Ok(result) => result,
                Err(payload) => {
                    self.poison();
                    Err(VmError::Panicked(panic_message(payload.as_ref())))
                }
            };
            CallOutcome { vm: self, result }
        });

        let outcome = task.await;
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        outcome.map_err(|e| VmError::Panicked(format!("VM task failed: {}", e)))
    }
}

impl Deref for PooledVm {
    type Target = dyn ScriptVm;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for PooledVm {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for PooledVm {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let vm = self.take();
        if let Some(pool) = self.pool.upgrade() {
            tracing::warn!(plugin = %pool.plugin, vm = %self.id, "VM dropped without being returned");
            pool.release(self.id, self.kind, vm, true);
        }
    }
}

impl fmt::Debug for PooledVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledVm")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

/// Fixed-capacity, self-healing pool of VM handles for one plugin
#[derive(Clone)]
pub struct VmPool {
    shared: Arc<PoolShared>,
}

impl VmPool {
    /// Build every handle up front through the factory
    pub fn new(
        plugin: impl Into<String>,
        factory: Arc<dyn VmFactory>,
        config: &PoolConfig,
    ) -> Result<Self, PoolError> {
        let plugin = plugin.into();
        let next_id = AtomicU64::new(0);
        let mut bindings = HashMap::new();

        let mut build = |count: usize| -> Result<Vec<Slot>, PoolError> {
            let mut slots = Vec::with_capacity(count);
            for _ in 0..count {
                let vm = factory.create().map_err(|source| PoolError::Factory {
                    plugin: plugin.clone(),
                    source,
                })?;
                let id = VmId(next_id.fetch_add(1, Ordering::Relaxed));
                if let Some(caps) = vm.capabilities() {
                    bindings.insert(id, caps);
                }
                slots.push(Slot { id, vm: Some(vm) });
            }
            Ok(slots)
        };

        let general = build(config.general)?;
        let reserved = build(config.reserved)?;

        tracing::debug!(
            plugin = %plugin,
            general = config.general,
            reserved = config.reserved,
            "VM pool ready"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                plugin,
                factory,
                general: Freelist::new(general),
                reserved: Freelist::new(reserved),
                size: config.size(),
                acquire_timeout: config.acquire_timeout,
                snapshot: RwLock::new(None),
                bindings: Mutex::new(bindings),
                on_discard: RwLock::new(None),
                closed: AtomicBool::new(false),
                checked_out: AtomicUsize::new(0),
                next_id,
            }),
        })
    }

    /// Register a callback receiving every handle discarded as unhealthy
    pub fn set_discard_observer(
        &self,
        observer: impl Fn(VmId, &dyn ScriptVm) + Send + Sync + 'static,
    ) {
        *self
            .shared
            .on_discard
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(observer));
    }

    /// Plugin this pool serves
    pub fn plugin(&self) -> &str {
        &self.shared.plugin
    }

    /// Check out a handle from the general capacity
    pub async fn get(&self, deadline: Option<Instant>) -> Result<PooledVm, PoolError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed(shared.plugin.clone()));
        }

        let started = Instant::now();
        let wait_until = shared.wait_until(deadline);
        match tokio::time::timeout_at(wait_until, shared.general.permits.acquire()).await {
            Ok(Ok(permit)) => permit.forget(),
            Ok(Err(_)) => return Err(PoolError::Closed(shared.plugin.clone())),
            Err(_) => {
                return Err(PoolError::Exhausted {
                    plugin: shared.plugin.clone(),
                    waited: started.elapsed(),
                })
            }
        }
        shared.checkout(SlotKind::General)
    }

    /// Check out a handle for hook dispatch: general first, then reserved
    pub async fn get_for_hook(&self, deadline: Option<Instant>) -> Result<PooledVm, PoolError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed(shared.plugin.clone()));
        }

        for kind in [SlotKind::General, SlotKind::Reserved] {
            match shared.freelist(kind).permits.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    return shared.checkout(kind);
                }
                Err(TryAcquireError::Closed) => {
                    return Err(PoolError::Closed(shared.plugin.clone()))
                }
                Err(TryAcquireError::NoPermits) => {}
            }
        }

        let started = Instant::now();
        let wait_until = shared.wait_until(deadline);
        let kind = tokio::select! {
            biased;
            permit = shared.general.permits.acquire() => {
                permit.map_err(|_| PoolError::Closed(shared.plugin.clone()))?.forget();
                SlotKind::General
            }
            permit = shared.reserved.permits.acquire() => {
                permit.map_err(|_| PoolError::Closed(shared.plugin.clone()))?.forget();
                SlotKind::Reserved
            }
            _ = tokio::time::sleep_until(wait_until) => {
                return Err(PoolError::Exhausted {
                    plugin: shared.plugin.clone(),
                    waited: started.elapsed(),
                });
            }
        };
        shared.checkout(kind)
    }

    /// Return a handle, validating and resetting it first.
    ///
    /// Silently drops the handle once the pool is closed.
    pub fn put(&self, mut vm: PooledVm) {
        let inner = vm.take();
        self.shared.release(vm.id, vm.kind, inner, vm.poisoned);
    }

    /// Record the handle's current top-level names as the scrub baseline
    pub fn snapshot_globals(&self, vm: &PooledVm) {
        let names = vm.global_names();
        tracing::debug!(plugin = %self.shared.plugin, count = names.len(), "Global snapshot taken");
        *self
            .shared
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(names));
    }

    /// Get a VM, run one call, and put it back
    pub async fn call(
        &self,
        vm: PooledVm,
        call: Invocation,
        options: CallOptions,
    ) -> Result<(), VmError> {
        let outcome = vm.invoke(call, options).await?;
        self.put(outcome.vm);
        outcome.result
    }

    /// Handles not checked out, vacant slots included; zero once closed
    pub fn available(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.shared
            .size
            .saturating_sub(self.shared.checked_out.load(Ordering::SeqCst))
    }

    /// Handles currently checked out
    pub fn in_use(&self) -> usize {
        self.shared.checked_out.load(Ordering::SeqCst)
    }

    /// Size, free and checked-out counts from a single read
    pub fn stats(&self) -> PoolStats {
        let in_use = self.in_use();
        let available = if self.is_closed() {
            0
        } else {
            self.shared.size.saturating_sub(in_use)
        };
        PoolStats {
            size: self.shared.size,
            available,
            in_use,
        }
    }

    /// Configured capacity (general + reserved)
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Capability state bound to a live handle
    pub fn capabilities(&self, id: VmId) -> Option<Arc<CapabilitySet>> {
        self.shared
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Number of handles with bound capability state
    pub fn bound_handles(&self) -> usize {
        self.shared
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Drain every handle; later checkouts fail and returns are dropped
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained = self.shared.general.drain().len() + self.shared.reserved.drain().len();
        self.shared
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!(plugin = %self.shared.plugin, drained, "VM pool closed");
    }
}

/// Resolves a plugin name to its pool
pub trait PoolLookup: Send + Sync {
    fn pool(&self, plugin: &str) -> Option<VmPool>;
}

impl PoolLookup for HashMap<String, VmPool> {
    fn pool(&self, plugin: &str) -> Option<VmPool> {
        self.get(plugin).cloned()
    }
}

impl fmt::Debug for VmPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmPool")
            .field("plugin", &self.shared.plugin)
            .field("size", &self.size())
            .field("available", &self.available())
            .field("in_use", &self.in_use())
            .finish()
    }
}
