//! Plugin loader using wasmtime
//!
//! Compiles plugin modules once, then builds sandboxed instances from them:
//! capability-free ones to read manifests, fully equipped ones for pools.
//! Every guest call runs with a fresh fuel allowance. On each epoch tick the
//! store checks the call's deadline and its interrupt flag, and traps the
//! guest once either fires.

use super::error::WasmError;
use super::host::{self, HostState};
use crate::capability::{CapabilitySet, DataAccess, HostModule};
use crate::config::WasmConfig;
use crate::vm::{Invocation, PluginRuntime, ScriptVm, VmError, VmFactory};
use folio_plugin_api::{abi, CallReply, HookDecl, HookReply, PluginInfo};
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use wasmtime::*;

/// Interval between epoch increments
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Background thread advancing the engine epoch
struct EpochTicker {
    stop: Arc<AtomicBool>,
}

impl EpochTicker {
    fn start(engine: &Engine) -> Result<Self, WasmError> {
        let stop = Arc::new(AtomicBool::new(false));
        let engine = engine.clone();
        let flag = stop.clone();
        std::thread::Builder::new()
            .name("folio-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| WasmError::EngineCreation(e.into()))?;
        Ok(Self { stop })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Whether a running call must stop at the next epoch tick
fn should_stop(state: &HostState) -> bool {
    state.caps.as_ref().is_some_and(|caps| caps.is_interrupted())
        || state.deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

fn on_epoch(ctx: StoreContextMut<'_, HostState>) -> anyhow::Result<UpdateDeadline> {
    if should_stop(ctx.data()) {
        return Err(Trap::Interrupt.into());
    }
    Ok(UpdateDeadline::Continue(1))
}

/// State shared by a runtime, its factories and their instances
struct Shared {
    engine: Engine,
    linker: Linker<HostState>,
    data: Arc<dyn DataAccess>,
    config: WasmConfig,
    _ticker: EpochTicker,
}

/// [`PluginRuntime`] backed by wasmtime
pub struct WasmRuntime {
    shared: Arc<Shared>,
    modules: Mutex<HashMap<PathBuf, Module>>,
}

impl WasmRuntime {
    /// File inside a plugin directory holding the compiled plugin
    pub const INITIALIZER: &'static str = "plugin.wasm";

    /// Create a runtime whose plugins reach data through `data`
    pub fn new(data: Arc<dyn DataAccess>, config: WasmConfig) -> Result<Self, WasmError> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        engine_config.epoch_interruption(true);
        engine_config.wasm_memory64(false);

        let engine = Engine::new(&engine_config).map_err(WasmError::EngineCreation)?;
        let linker = host::linker(&engine).map_err(WasmError::EngineCreation)?;
        let ticker = EpochTicker::start(&engine)?;

        Ok(Self {
            shared: Arc::new(Shared {
                engine,
                linker,
                data,
                config,
                _ticker: ticker,
            }),
            modules: Mutex::new(HashMap::new()),
        })
    }

    /// Compile a plugin module, reusing an earlier compilation of the same file
    pub fn module(&self, path: &Path) -> Result<Module, WasmError> {
        let mut modules = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(module) = modules.get(path) {
            return Ok(module.clone());
        }

        let bytes = std::fs::read(path).map_err(|source| WasmError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let module =
            Module::new(&self.shared.engine, bytes).map_err(WasmError::ModuleCompilation)?;
        tracing::debug!(path = %path.display(), "Plugin module compiled");
        modules.insert(path.to_path_buf(), module.clone());
        Ok(module)
    }
}

impl PluginRuntime for WasmRuntime {
    fn initializer_name(&self) -> &str {
        Self::INITIALIZER
    }

    fn inspect(&self, initializer: &Path) -> Result<Box<dyn ScriptVm>, VmError> {
        let module = self.module(initializer)?;
        let label = initializer
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let vm = WasmVm::instantiate(&self.shared, &module, HostState::inspection(label))?;
        Ok(Box::new(vm))
    }

    fn factory(
        &self,
        info: &PluginInfo,
        initializer: &Path,
        op_budget: u32,
    ) -> Result<Arc<dyn VmFactory>, VmError> {
        let module = self.module(initializer)?;
        Ok(Arc::new(WasmVmFactory {
            shared: self.shared.clone(),
            module,
            plugin: info.name.clone(),
            op_budget,
        }))
    }
}

impl std::fmt::Debug for WasmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self
            .modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("WasmRuntime")
            .field("config", &self.shared.config)
            .field("cached_modules", &cached)
            .finish()
    }
}

/// Builds equipped instances of one plugin module
pub struct WasmVmFactory {
    shared: Arc<Shared>,
    module: Module,
    plugin: String,
    op_budget: u32,
}

impl VmFactory for WasmVmFactory {
    fn create(&self) -> Result<Box<dyn ScriptVm>, VmError> {
        let caps = Arc::new(CapabilitySet::new(
            self.plugin.clone(),
            self.op_budget,
            self.shared.data.clone(),
        ));
        let mut vm = WasmVm::instantiate(&self.shared, &self.module, HostState::equipped(caps))?;

        vm.set_deadline(Some(Instant::now() + self.shared.config.declare_timeout));
        let declared = vm.declare();
        vm.set_deadline(None);
        declared.map_err(|e| VmError::Construction(format!("declaration failed: {}", e)))?;

        vm.verify().map_err(VmError::Construction)?;
        Ok(Box::new(vm))
    }
}

#[derive(Clone, Copy)]
enum Kind {
    I32,
    I64,
}

impl Kind {
    fn matches(&self, ty: &ValType) -> bool {
        matches!(
            (self, ty),
            (Kind::I32, ValType::I32) | (Kind::I64, ValType::I64)
        )
    }
}

/// Exports every handle must provide
const REQUIRED_EXPORTS: &[(&str, &[Kind], &[Kind])] = &[
    (abi::EXPORT_ALLOC, &[Kind::I32], &[Kind::I32]),
    (abi::EXPORT_DEALLOC, &[Kind::I32, Kind::I32], &[]),
    (abi::EXPORT_INFO, &[], &[Kind::I64]),
];

/// Exports that must have these signatures when present
const OPTIONAL_EXPORTS: &[(&str, &[Kind], &[Kind])] = &[
    (abi::EXPORT_DECLARE, &[], &[]),
    (abi::EXPORT_ON_INIT, &[], &[Kind::I64]),
    (abi::EXPORT_ON_SHUTDOWN, &[], &[Kind::I64]),
    (
        abi::EXPORT_HOOK,
        &[Kind::I32, Kind::I32, Kind::I32, Kind::I32],
        &[Kind::I64],
    ),
];

fn check_signature(
    module: &Module,
    name: &str,
    params: &[Kind],
    results: &[Kind],
    required: bool,
) -> Result<(), String> {
    let ty = match module.get_export(name) {
        Some(ExternType::Func(ty)) => ty,
        Some(_) => return Err(format!("export '{}' is not a function", name)),
        None if required => return Err(format!("export '{}' is missing", name)),
        None => return Ok(()),
    };
    let same = |expected: &[Kind], actual: Vec<ValType>| {
        expected.len() == actual.len() && expected.iter().zip(&actual).all(|(k, t)| k.matches(t))
    };
    if !same(params, ty.params().collect()) || !same(results, ty.results().collect()) {
        return Err(format!("export '{}' has the wrong signature", name));
    }
    Ok(())
}

/// A sandboxed plugin instance
pub struct WasmVm {
    shared: Arc<Shared>,
    module: Module,
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    poisoned: Option<String>,
}

impl WasmVm {
    fn instantiate(shared: &Arc<Shared>, module: &Module, state: HostState) -> Result<Self, WasmError> {
        let mut store = Store::new(&shared.engine, state);
        store
            .set_fuel(shared.config.fuel_per_call)
            .map_err(WasmError::Instantiation)?;
        store.data_mut().deadline = Some(Instant::now() + shared.config.declare_timeout);
        store.epoch_deadline_callback(on_epoch);
        store.set_epoch_deadline(1);

        let instance = shared
            .linker
            .instantiate(&mut store, module)
            .map_err(WasmError::Instantiation)?;
        let memory = instance
            .get_memory(&mut store, abi::EXPORT_MEMORY)
            .ok_or_else(|| WasmError::FunctionNotFound(abi::EXPORT_MEMORY.to_string()))?;
        store.data_mut().deadline = None;

        Ok(Self {
            shared: shared.clone(),
            module: module.clone(),
            store,
            instance,
            memory,
            poisoned: None,
        })
    }

    fn has_export(&mut self, name: &str) -> bool {
        self.instance.get_func(&mut self.store, name).is_some()
    }

    /// Call an export with a fresh fuel allowance, checked every epoch tick
    fn call<P, R>(&mut self, function: &'static str, params: P) -> Result<R, WasmError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self
            .instance
            .get_typed_func::<P, R>(&mut self.store, function)
            .map_err(|_| WasmError::FunctionNotFound(function.to_string()))?;

        self.store
            .set_fuel(self.shared.config.fuel_per_call)
            .map_err(WasmError::Instantiation)?;
        self.store.set_epoch_deadline(1);

        func.call(&mut self.store, params).map_err(|e| {
            let e = WasmError::from_call(function, e);
            if e.is_trap() {
                self.poisoned = Some(e.to_string());
            }
            e
        })
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(i32, i32), WasmError> {
        let len = i32::try_from(bytes.len())
            .map_err(|_| WasmError::MemoryAccess("buffer too large".to_string()))?;
        let ptr: i32 = self.call(abi::EXPORT_ALLOC, len)?;
        self.memory
            .write(&mut self.store, ptr as u32 as usize, bytes)
            .map_err(|e| WasmError::MemoryAccess(format!("Failed to write buffer: {}", e)))?;
        Ok((ptr, len))
    }

    fn free(&mut self, ptr: i32, len: i32) {
        if let Err(e) = self.call::<(i32, i32), ()>(abi::EXPORT_DEALLOC, (ptr, len)) {
            tracing::debug!(plugin = %self.store.data().plugin, error = %e, "Guest dealloc failed");
        }
    }

    /// Read a packed buffer returned by the guest and hand it back
    fn take_reply(&mut self, packed: i64) -> Result<Vec<u8>, WasmError> {
        let (ptr, len) = abi::unpack_ptr_len(packed);
        let (start, size) = (ptr as u32 as usize, len as u32 as usize);
        let data = self.memory.data(&self.store);
        let bytes = start
            .checked_add(size)
            .filter(|end| *end <= data.len())
            .map(|end| data[start..end].to_vec())
            .ok_or_else(|| {
                WasmError::MemoryAccess(format!(
                    "Out of bounds: ptr={}, len={}, memory_size={}",
                    start,
                    size,
                    data.len()
                ))
            })?;
        self.free(ptr, len);
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(&mut self, packed: i64) -> Result<T, WasmError> {
        let bytes = self.take_reply(packed)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    /// Run the guest's top-level declarations
    fn declare(&mut self) -> Result<(), WasmError> {
        if self.has_export(abi::EXPORT_DECLARE) {
            self.call::<(), ()>(abi::EXPORT_DECLARE, ())?;
        }
        Ok(())
    }

    fn lifecycle(&mut self, function: &'static str) -> Result<(), VmError> {
        if !self.has_export(function) {
            return Ok(());
        }
        let packed: i64 = self.call(function, ())?;
        match self.decode::<CallReply>(packed)? {
            CallReply::Ok => Ok(()),
            CallReply::Error(msg) => Err(VmError::Plugin(msg)),
        }
    }

    fn hook(&mut self, key: &str, record: &serde_json::Value) -> Result<(), VmError> {
        let record = rmp_serde::to_vec_named(record).map_err(WasmError::from)?;
        let (key_ptr, key_len) = self.write_bytes(key.as_bytes())?;
        let (rec_ptr, rec_len) = self.write_bytes(&record)?;

        let packed: Result<i64, WasmError> =
            self.call(abi::EXPORT_HOOK, (key_ptr, key_len, rec_ptr, rec_len));
        if self.poisoned.is_none() {
            self.free(key_ptr, key_len);
            self.free(rec_ptr, rec_len);
        }

        match self.decode::<HookReply>(packed?)? {
            HookReply::Allow => Ok(()),
            HookReply::Reject(reason) => Err(VmError::Rejected(reason)),
        }
    }
}

impl ScriptVm for WasmVm {
    fn global_names(&self) -> BTreeSet<String> {
        self.store.data().globals.keys().cloned().collect()
    }

    fn remove_global(&mut self, name: &str) {
        self.store.data_mut().globals.remove(name);
    }

    /// Wasm value stacks unwind with every call; only the call deadline
    /// outlives one.
    fn reset_stack(&mut self) {
        self.store.data_mut().deadline = None;
    }

    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.store.data_mut().deadline = deadline;
    }

    fn capabilities(&self) -> Option<Arc<CapabilitySet>> {
        self.store.data().caps.clone()
    }

    fn verify(&self) -> Result<(), String> {
        if let Some(reason) = &self.poisoned {
            return Err(format!("instance poisoned: {}", reason));
        }
        match self.module.get_export(abi::EXPORT_MEMORY) {
            Some(ExternType::Memory(_)) => {}
            _ => return Err(format!("export '{}' is missing", abi::EXPORT_MEMORY)),
        }
        for (name, params, results) in REQUIRED_EXPORTS {
            check_signature(&self.module, name, params, results, true)?;
        }
        for (name, params, results) in OPTIONAL_EXPORTS {
            check_signature(&self.module, name, params, results, false)?;
        }

        let state = self.store.data();
        if state.caps.is_none() {
            return Err("no capability set bound".to_string());
        }
        for module in HostModule::REQUIRED {
            if !state.modules.contains(module.name()) {
                return Err(format!("host module '{}' is missing", module.name()));
            }
        }
        Ok(())
    }

    fn read_manifest(&mut self) -> Result<PluginInfo, VmError> {
        let packed: i64 = self.call(abi::EXPORT_INFO, ())?;
        Ok(self.decode(packed)?)
    }

    fn declared_hooks(&self) -> Vec<HookDecl> {
        self.store.data().hooks.clone()
    }

    fn invoke(&mut self, call: &Invocation) -> Result<(), VmError> {
        match call {
            Invocation::Startup => self.lifecycle(abi::EXPORT_ON_INIT),
            Invocation::Shutdown => self.lifecycle(abi::EXPORT_ON_SHUTDOWN),
            Invocation::Hook { key, record } => self.hook(key, record),
        }
    }
}
