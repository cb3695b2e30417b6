//! Scripted in-memory VM runtime shared by the integration tests

#![allow(dead_code)]

use folio_plugin_api::{DataRequest, DataResponse, HookDecl, PluginInfo};
use folio_plugin_host::capability::{CapabilityError, CapabilitySet, DataAccess};
use folio_plugin_host::config::{ManagerConfig, PoolConfig};
use folio_plugin_host::vm::{Invocation, PluginRuntime, ScriptVm, VmError, VmFactory};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type Handler = Arc<dyn Fn(&mut MockVm, &Invocation) -> Result<(), VmError> + Send + Sync>;

/// File marking a mock plugin directory; its content names the script
pub const INITIALIZER: &str = "plugin.mock";

/// Behaviour of one mock plugin
#[derive(Clone)]
pub struct MockPlugin {
    pub info: PluginInfo,
    pub hooks: Vec<HookDecl>,
    pub globals: Vec<String>,
    pub handler: Handler,
    pub created: Arc<AtomicUsize>,
    pub factory_fails: Arc<AtomicBool>,
}

impl MockPlugin {
    pub fn new(name: &str) -> Self {
        Self {
            info: PluginInfo::new(name, "1.0.0", "mock plugin"),
            hooks: Vec::new(),
            globals: Vec::new(),
            handler: Arc::new(|_, _| Ok(())),
            created: Arc::new(AtomicUsize::new(0)),
            factory_fails: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn depends_on(mut self, dep: &str) -> Self {
        self.info = self.info.depends_on(dep);
        self
    }

    pub fn hook(mut self, decl: HookDecl) -> Self {
        self.hooks.push(decl);
        self
    }

    pub fn global(mut self, name: &str) -> Self {
        self.globals.push(name.to_string());
        self
    }

    pub fn handler(
        mut self,
        f: impl Fn(&mut MockVm, &Invocation) -> Result<(), VmError> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Arc::new(f);
        self
    }

    /// Handles built so far through the factory
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn set_factory_fails(&self, fails: bool) {
        self.factory_fails.store(fails, Ordering::SeqCst);
    }

    fn vm(&self, caps: Option<Arc<CapabilitySet>>) -> MockVm {
        MockVm {
            plugin: self.info.name.clone(),
            info: self.info.clone(),
            hooks: if caps.is_some() { self.hooks.clone() } else { Vec::new() },
            globals: self.globals.iter().cloned().collect(),
            caps,
            deadline: None,
            healthy: true,
            handler: self.handler.clone(),
        }
    }

    pub fn factory(&self, op_budget: u32, data: Arc<dyn DataAccess>) -> Arc<dyn VmFactory> {
        let plugin = self.clone();
        Arc::new(move || -> Result<Box<dyn ScriptVm>, VmError> {
            if plugin.factory_fails.load(Ordering::SeqCst) {
                return Err(VmError::Construction("factory disabled".to_string()));
            }
            plugin.created.fetch_add(1, Ordering::SeqCst);
            let caps = Arc::new(CapabilitySet::new(
                plugin.info.name.clone(),
                op_budget,
                data.clone(),
            ));
            Ok(Box::new(plugin.vm(Some(caps))))
        })
    }
}

/// One mock VM handle
pub struct MockVm {
    pub plugin: String,
    pub info: PluginInfo,
    pub hooks: Vec<HookDecl>,
    pub globals: BTreeSet<String>,
    pub caps: Option<Arc<CapabilitySet>>,
    pub deadline: Option<Instant>,
    pub healthy: bool,
    handler: Handler,
}

impl MockVm {
    /// Busy the VM for `total`, honouring the deadline and interrupts
    pub fn work(&self, total: Duration) -> Result<(), VmError> {
        let until = Instant::now() + total;
        while Instant::now() < until {
            let interrupted = self.caps.as_ref().is_some_and(|c| c.is_interrupted());
            if interrupted || self.deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(VmError::DeadlineExceeded);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }

    /// Issue a data-access request through the bound capabilities
    pub fn data(&self, table: &str) -> Result<DataResponse, CapabilityError> {
        match &self.caps {
            Some(caps) => caps.execute(DataRequest::query(table)),
            None => Err(CapabilityError::Backend("no capabilities".to_string())),
        }
    }
}

impl ScriptVm for MockVm {
    fn global_names(&self) -> BTreeSet<String> {
        self.globals.clone()
    }

    fn remove_global(&mut self, name: &str) {
        self.globals.remove(name);
    }

    fn reset_stack(&mut self) {}

    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    fn capabilities(&self) -> Option<Arc<CapabilitySet>> {
        self.caps.clone()
    }

    fn verify(&self) -> Result<(), String> {
        if !self.healthy {
            return Err("capability surface replaced".to_string());
        }
        if self.caps.is_none() {
            return Err("no capability set bound".to_string());
        }
        Ok(())
    }

    fn read_manifest(&mut self) -> Result<PluginInfo, VmError> {
        Ok(self.info.clone())
    }

    fn declared_hooks(&self) -> Vec<HookDecl> {
        self.hooks.clone()
    }

    fn invoke(&mut self, call: &Invocation) -> Result<(), VmError> {
        let handler = self.handler.clone();
        handler(self, call)
    }
}

/// Data backend recording every table it serves
#[derive(Default)]
pub struct RecordingData {
    pub tables: Mutex<Vec<String>>,
}

impl DataAccess for RecordingData {
    fn execute(&self, _plugin: &str, request: DataRequest) -> Result<DataResponse, String> {
        self.tables.lock().unwrap().push(request.table);
        Ok(DataResponse::default())
    }
}

/// Runtime resolving plugin directories to scripted plugins
pub struct MockRuntime {
    plugins: Mutex<BTreeMap<String, MockPlugin>>,
    pub data: Arc<RecordingData>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            plugins: Mutex::new(BTreeMap::new()),
            data: Arc::new(RecordingData::default()),
        }
    }

    /// Register a script under the plugin's own name
    pub fn add(&self, plugin: MockPlugin) -> MockPlugin {
        self.add_as(&plugin.info.name.clone(), plugin)
    }

    /// Register a script under an arbitrary key
    pub fn add_as(&self, key: &str, plugin: MockPlugin) -> MockPlugin {
        self.plugins
            .lock()
            .unwrap()
            .insert(key.to_string(), plugin.clone());
        plugin
    }
}

impl PluginRuntime for MockRuntime {
    fn initializer_name(&self) -> &str {
        INITIALIZER
    }

    fn inspect(&self, initializer: &Path) -> Result<Box<dyn ScriptVm>, VmError> {
        let key = std::fs::read_to_string(initializer)
            .map_err(|e| VmError::Construction(e.to_string()))?;
        let plugins = self.plugins.lock().unwrap();
        let plugin = plugins
            .get(key.trim())
            .ok_or_else(|| VmError::Trap(format!("initializer '{}' raised", key.trim())))?;
        Ok(Box::new(plugin.vm(None)))
    }

    fn factory(
        &self,
        info: &PluginInfo,
        _initializer: &Path,
        op_budget: u32,
    ) -> Result<Arc<dyn VmFactory>, VmError> {
        let plugins = self.plugins.lock().unwrap();
        let plugin = plugins
            .values()
            .find(|p| p.info.name == info.name)
            .ok_or_else(|| VmError::Construction(format!("no script for '{}'", info.name)))?;
        Ok(plugin.factory(op_budget, self.data.clone()))
    }
}

/// Create `root/<dir>/plugin.mock` pointing at script `key`
pub fn write_plugin(root: &Path, dir: &str, key: &str) {
    let dir = root.join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(INITIALIZER), key).unwrap();
}

pub fn pool_config(general: usize, reserved: usize) -> PoolConfig {
    PoolConfig {
        general,
        reserved,
        acquire_timeout: Duration::from_millis(200),
        op_budget: 10,
    }
}

pub fn manager_config(root: &Path) -> ManagerConfig {
    ManagerConfig {
        plugins_dir: root.to_path_buf(),
        host_version: "1.0.0".to_string(),
        startup_timeout: Duration::from_secs(1),
        shutdown_timeout: Duration::from_millis(500),
        pool: pool_config(2, 1),
    }
}
