//! Host functions linked into every wasm plugin
//!
//! All imports live under [`abi::IMPORT_MODULE`]. Buffers cross the boundary
//! as packed `(ptr << 32) | len` values; replies the guest must read are
//! written into memory it allocates through `plugin_alloc`.

use crate::capability::{CapabilitySet, HostModule};
use anyhow::{anyhow, bail, Context};
use folio_plugin_api::{abi, DataReply, DataRequest, HookDecl, LogLevel};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use wasmtime::{Caller, Engine, Extern, Linker, Memory};

/// Per-store state the host functions work on
pub(crate) struct HostState {
    pub plugin: String,

    /// Absent for capability-free inspection instances
    pub caps: Option<Arc<CapabilitySet>>,

    /// The guest's top-level namespace
    pub globals: BTreeMap<String, Vec<u8>>,

    /// Hooks registered through `hooks_register`
    pub hooks: Vec<HookDecl>,

    /// Host modules bound to this instance
    pub modules: BTreeSet<&'static str>,

    /// Cancellation deadline of the running call
    pub deadline: Option<Instant>,
}

impl HostState {
    /// State for a pool handle
    pub fn equipped(caps: Arc<CapabilitySet>) -> Self {
        Self {
            plugin: caps.plugin().to_string(),
            caps: Some(caps),
            globals: BTreeMap::new(),
            hooks: Vec::new(),
            modules: HostModule::REQUIRED.iter().map(|m| m.name()).collect(),
            deadline: None,
        }
    }

    /// State for a throwaway manifest reader
    pub fn inspection(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            caps: None,
            globals: BTreeMap::new(),
            hooks: Vec::new(),
            modules: BTreeSet::new(),
            deadline: None,
        }
    }

    fn require(&self, module: HostModule) -> anyhow::Result<&Arc<CapabilitySet>> {
        match &self.caps {
            Some(caps) if self.modules.contains(module.name()) => Ok(caps),
            _ => bail!(
                "host module '{}' is not available to this instance",
                module.name()
            ),
        }
    }
}

fn memory(caller: &mut Caller<'_, HostState>) -> anyhow::Result<Memory> {
    match caller.get_export(abi::EXPORT_MEMORY) {
        Some(Extern::Memory(mem)) => Ok(mem),
        _ => bail!("guest does not export '{}'", abi::EXPORT_MEMORY),
    }
}

fn read_bytes(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
    let mem = memory(caller)?;
    let (start, len) = (ptr as u32 as usize, len as u32 as usize);
    let data = mem.data(&caller);
    let end = start
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| anyhow!("out of bounds read: ptr={} len={}", start, len))?;
    Ok(data[start..end].to_vec())
}

fn read_string(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> anyhow::Result<String> {
    let bytes = read_bytes(caller, ptr, len)?;
    String::from_utf8(bytes).context("guest string is not valid UTF-8")
}

/// Copy `bytes` into guest memory and return the packed location
fn write_reply(caller: &mut Caller<'_, HostState>, bytes: &[u8]) -> anyhow::Result<i64> {
    let alloc = caller
        .get_export(abi::EXPORT_ALLOC)
        .and_then(Extern::into_func)
        .ok_or_else(|| anyhow!("guest does not export '{}'", abi::EXPORT_ALLOC))?
        .typed::<i32, i32>(&caller)?;
    let len = i32::try_from(bytes.len()).context("reply too large for guest memory")?;
    let ptr = alloc.call(&mut *caller, len)?;
    memory(caller)?.write(&mut *caller, ptr as u32 as usize, bytes)?;
    Ok(abi::pack_ptr_len(ptr, len))
}

/// Build the linker shared by every instance of an engine
pub(crate) fn linker(engine: &Engine) -> anyhow::Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);

    linker.func_wrap(
        abi::IMPORT_MODULE,
        abi::IMPORT_LOG,
        |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| -> anyhow::Result<()> {
            caller.data().require(HostModule::Log)?;
            let message = read_string(&mut caller, ptr, len)?;
            let plugin = caller.data().plugin.as_str();
            match LogLevel::from_i32(level) {
                LogLevel::Debug => tracing::debug!(plugin, guest_message = %message, "Plugin log"),
                LogLevel::Info => tracing::info!(plugin, guest_message = %message, "Plugin log"),
                LogLevel::Warn => tracing::warn!(plugin, guest_message = %message, "Plugin log"),
                LogLevel::Error => tracing::error!(plugin, guest_message = %message, "Plugin log"),
            }
            Ok(())
        },
    )?;

    linker.func_wrap(
        abi::IMPORT_MODULE,
        abi::IMPORT_HOOKS_REGISTER,
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            caller.data().require(HostModule::Hooks)?;
            let bytes = read_bytes(&mut caller, ptr, len)?;
            let decl: HookDecl =
                rmp_serde::from_slice(&bytes).context("malformed hook declaration")?;
            let state = caller.data_mut();
            if !state.hooks.contains(&decl) {
                tracing::debug!(plugin = %state.plugin, hook = %decl.handler_key(), "Hook declared");
                state.hooks.push(decl);
            }
            Ok(())
        },
    )?;

    linker.func_wrap(
        abi::IMPORT_MODULE,
        abi::IMPORT_DB_EXECUTE,
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<i64> {
            let caps = caller.data().require(HostModule::Data)?.clone();
            let bytes = read_bytes(&mut caller, ptr, len)?;
            let reply = match rmp_serde::from_slice::<DataRequest>(&bytes) {
                Ok(request) => match caps.execute(request) {
                    Ok(response) => DataReply::Ok(response),
                    Err(e) => DataReply::Error(e.to_string()),
                },
                Err(e) => DataReply::Error(format!("malformed request: {}", e)),
            };
            let encoded = rmp_serde::to_vec_named(&reply)?;
            write_reply(&mut caller, &encoded)
        },
    )?;

    linker.func_wrap(
        abi::IMPORT_MODULE,
        abi::IMPORT_GLOBAL_SET,
        |mut caller: Caller<'_, HostState>,
         key_ptr: i32,
         key_len: i32,
         val_ptr: i32,
         val_len: i32|
         -> anyhow::Result<()> {
            let key = read_string(&mut caller, key_ptr, key_len)?;
            let value = read_bytes(&mut caller, val_ptr, val_len)?;
            caller.data_mut().globals.insert(key, value);
            Ok(())
        },
    )?;

    linker.func_wrap(
        abi::IMPORT_MODULE,
        abi::IMPORT_GLOBAL_GET,
        |mut caller: Caller<'_, HostState>, key_ptr: i32, key_len: i32| -> anyhow::Result<i64> {
            let key = read_string(&mut caller, key_ptr, key_len)?;
            match caller.data().globals.get(&key).cloned() {
                Some(value) => write_reply(&mut caller, &value),
                None => Ok(0),
            }
        },
    )?;

    linker.func_wrap(
        abi::IMPORT_MODULE,
        abi::IMPORT_GLOBAL_DEL,
        |mut caller: Caller<'_, HostState>, key_ptr: i32, key_len: i32| -> anyhow::Result<()> {
            let key = read_string(&mut caller, key_ptr, key_len)?;
            caller.data_mut().globals.remove(&key);
            Ok(())
        },
    )?;

    Ok(linker)
}
