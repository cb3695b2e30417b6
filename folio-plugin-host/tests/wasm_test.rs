//! Wasm runtime integration tests
//!
//! Plugins are written in the text format; wasmtime compiles `.wat` source
//! as readily as binary modules.

mod common;

use common::{manager_config, pool_config, RecordingData};
use folio_plugin_api::{abi, CallReply, HookDecl, HookEvent, HookReply, PluginInfo};
use folio_plugin_host::approval::MemoryApprovalStore;
use folio_plugin_host::capability::DataAccess;
use folio_plugin_host::config::{HookConfig, WasmConfig};
use folio_plugin_host::hooks::{HookEngine, HookError, HookKey};
use folio_plugin_host::manager::{PluginManager, PluginState};
use folio_plugin_host::pool::{CallOptions, VmPool};
use folio_plugin_host::vm::{Invocation, PluginRuntime, VmError};
use folio_plugin_host::wasm::WasmRuntime;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const INFO_AT: i32 = 0;
const DECL_AT: i32 = 1024;
const ALLOW_AT: i32 = 2048;
const REJECT_AT: i32 = 2304;
const OK_AT: i32 = 2560;
const LEAK_AT: i32 = 2816;

/// What `plugin_hook` does when called
#[derive(Clone, Copy)]
enum Behavior {
    Allow,
    Reject,
    Spin,
    Leak,
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    rmp_serde::to_vec_named(value).unwrap()
}

fn escape(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{:02x}", b)).collect()
}

fn segment(at: i32, bytes: &[u8]) -> String {
    format!("  (data (i32.const {}) \"{}\")\n", at, escape(bytes))
}

fn packed(at: i32, bytes: &[u8]) -> i64 {
    abi::pack_ptr_len(at, bytes.len() as i32)
}

/// Text-format plugin exporting the full guest ABI
fn plugin_wat(info: &PluginInfo, decl: &HookDecl, behavior: Behavior) -> String {
    let info = encode(info);
    let decl = encode(decl);
    let allow = encode(&HookReply::Allow);
    let reject = encode(&HookReply::Reject("spam detected".to_string()));
    let ok = encode(&CallReply::Ok);
    let leak = b"leak";

    let hook_body = match behavior {
        Behavior::Allow => format!("i64.const {}", packed(ALLOW_AT, &allow)),
        Behavior::Reject => format!("i64.const {}", packed(REJECT_AT, &reject)),
        Behavior::Spin => "(loop $spin (br $spin))\n    unreachable".to_string(),
        Behavior::Leak => format!(
            "(call $global_set (i32.const {at}) (i32.const 4) (i32.const {at}) (i32.const 4))\n    i64.const {}",
            packed(ALLOW_AT, &allow),
            at = LEAK_AT,
        ),
    };

    let mut wat = String::from("(module\n");
    wat.push_str("  (import \"folio\" \"hooks_register\" (func $hooks_register (param i32 i32)))\n");
    wat.push_str(
        "  (import \"folio\" \"global_set\" (func $global_set (param i32 i32 i32 i32)))\n",
    );
    wat.push_str("  (memory (export \"memory\") 2)\n");
    wat.push_str("  (global $heap (mut i32) (i32.const 8192))\n");
    wat.push_str(&segment(INFO_AT, &info));
    wat.push_str(&segment(DECL_AT, &decl));
    wat.push_str(&segment(ALLOW_AT, &allow));
    wat.push_str(&segment(REJECT_AT, &reject));
    wat.push_str(&segment(OK_AT, &ok));
    wat.push_str(&segment(LEAK_AT, leak));
    wat.push_str(
        r#"  (func (export "plugin_alloc") (param $size i32) (result i32)
    (local $ptr i32)
    global.get $heap
    local.set $ptr
    global.get $heap
    local.get $size
    i32.add
    global.set $heap
    local.get $ptr)
  (func (export "plugin_dealloc") (param i32 i32))
"#,
    );
    wat.push_str(&format!(
        "  (func (export \"plugin_info\") (result i64)\n    i64.const {})\n",
        packed(INFO_AT, &info)
    ));
    wat.push_str(&format!(
        "  (func (export \"plugin_declare\")\n    (call $hooks_register (i32.const {}) (i32.const {})))\n",
        DECL_AT,
        decl.len()
    ));
    wat.push_str(&format!(
        "  (func (export \"plugin_on_init\") (result i64)\n    i64.const {})\n",
        packed(OK_AT, &ok)
    ));
    wat.push_str(&format!(
        "  (func (export \"plugin_hook\") (param i32 i32 i32 i32) (result i64)\n    {})\n",
        hook_body
    ));
    wat.push_str(")\n");
    wat
}

fn info(name: &str) -> PluginInfo {
    PluginInfo::new(name, "1.0.0", "Moderates new posts")
}

fn decl() -> HookDecl {
    HookDecl::new(HookEvent::BeforeCreate, "posts").priority(5)
}

fn install(root: &Path, name: &str, behavior: Behavior) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(WasmRuntime::INITIALIZER);
    std::fs::write(&path, plugin_wat(&info(name), &decl(), behavior)).unwrap();
    path
}

fn runtime(config: WasmConfig) -> WasmRuntime {
    let data: Arc<dyn DataAccess> = Arc::new(RecordingData::default());
    WasmRuntime::new(data, config).unwrap()
}

fn pool(runtime: &WasmRuntime, path: &Path, name: &str) -> VmPool {
    let factory = runtime.factory(&info(name), path, 10).unwrap();
    VmPool::new(name, factory, &pool_config(1, 0)).unwrap()
}

fn hook_call() -> Invocation {
    Invocation::Hook {
        key: "before_create:posts".to_string(),
        record: Arc::new(json!({ "title": "Buy now", "_table": "posts" })),
    }
}

#[test]
fn test_inspect_reads_manifest_without_capabilities() {
    let root = TempDir::new().unwrap();
    let path = install(root.path(), "spamguard", Behavior::Allow);
    let runtime = runtime(WasmConfig::default());

    let mut vm = runtime.inspect(&path).unwrap();
    assert_eq!(vm.read_manifest().unwrap(), info("spamguard"));
    assert!(vm.capabilities().is_none());
    assert!(vm.declared_hooks().is_empty());
    assert!(vm.verify().is_err());
}

#[test]
fn test_factory_runs_declarations() {
    let root = TempDir::new().unwrap();
    let path = install(root.path(), "spamguard", Behavior::Allow);
    let runtime = runtime(WasmConfig::default());

    let factory = runtime.factory(&info("spamguard"), &path, 10).unwrap();
    let vm = factory.create().unwrap();
    assert!(vm.verify().is_ok());
    assert_eq!(vm.declared_hooks(), vec![decl()]);
    assert_eq!(vm.capabilities().unwrap().plugin(), "spamguard");
    assert!(vm.global_names().is_empty());
}

#[test]
fn test_invalid_modules_are_rejected() {
    let root = TempDir::new().unwrap();
    let runtime = runtime(WasmConfig::default());

    let dir = root.path().join("garbage");
    std::fs::create_dir_all(&dir).unwrap();
    let garbage = dir.join(WasmRuntime::INITIALIZER);
    std::fs::write(&garbage, "this is not a module").unwrap();
    assert!(matches!(
        runtime.inspect(&garbage),
        Err(VmError::Construction(_))
    ));

    // Imports nothing the host provides
    let dir = root.path().join("alien");
    std::fs::create_dir_all(&dir).unwrap();
    let alien = dir.join(WasmRuntime::INITIALIZER);
    std::fs::write(
        &alien,
        r#"(module (import "env" "abort" (func)) (memory (export "memory") 1))"#,
    )
    .unwrap();
    assert!(matches!(runtime.inspect(&alien), Err(VmError::Construction(_))));

    // Missing required exports
    let dir = root.path().join("partial");
    std::fs::create_dir_all(&dir).unwrap();
    let partial = dir.join(WasmRuntime::INITIALIZER);
    std::fs::write(
        &partial,
        r#"(module
  (memory (export "memory") 1)
  (func (export "plugin_alloc") (param i32) (result i32) i32.const 0))"#,
    )
    .unwrap();
    let factory = runtime.factory(&info("partial"), &partial, 10).unwrap();
    match factory.create() {
        Err(VmError::Construction(msg)) => assert!(msg.contains("plugin_dealloc")),
        other => panic!("expected construction error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_hook_replies_map_to_outcomes() {
    let root = TempDir::new().unwrap();
    let runtime = runtime(WasmConfig::default());

    let allow = install(root.path(), "friendly", Behavior::Allow);
    let friendly = pool(&runtime, &allow, "friendly");
    let vm = friendly.get(None).await.unwrap();
    friendly
        .call(vm, hook_call(), CallOptions::default())
        .await
        .unwrap();

    let reject = install(root.path(), "spamguard", Behavior::Reject);
    let spamguard = pool(&runtime, &reject, "spamguard");
    let vm = spamguard.get(None).await.unwrap();
    let result = spamguard.call(vm, hook_call(), CallOptions::default()).await;
    assert!(matches!(result, Err(VmError::Rejected(ref reason)) if reason == "spam detected"));

    // A rejection is a normal reply; the handle stays in service
    assert_eq!(spamguard.available(), 1);
    assert_eq!(spamguard.bound_handles(), 1);
}

#[tokio::test]
async fn test_runaway_guest_is_interrupted_and_replaced() {
    let root = TempDir::new().unwrap();
    let path = install(root.path(), "spinner", Behavior::Spin);
    let runtime = runtime(WasmConfig {
        fuel_per_call: 1 << 50,
        ..WasmConfig::default()
    });
    let pool = pool(&runtime, &path, "spinner");

    let vm = pool.get(None).await.unwrap();
    let old_id = vm.id();
    let started = Instant::now();
    let options = CallOptions {
        deadline: Some(Instant::now() + Duration::from_millis(100)),
        ..CallOptions::default()
    };
    let result = pool.call(vm, hook_call(), options).await;

    assert!(matches!(result, Err(VmError::DeadlineExceeded)));
    assert!(started.elapsed() < Duration::from_secs(2));

    let vm = pool.get(None).await.unwrap();
    assert_ne!(vm.id(), old_id);
    assert!(vm.verify().is_ok());
    pool.put(vm);
}

#[tokio::test]
async fn test_cancelled_guest_stops_without_deadline() {
    let root = TempDir::new().unwrap();
    let path = install(root.path(), "spinner", Behavior::Spin);
    let runtime = runtime(WasmConfig {
        fuel_per_call: 1 << 50,
        ..WasmConfig::default()
    });
    let pool = pool(&runtime, &path, "spinner");
    let cancel = CancellationToken::new();

    let vm = pool.get(None).await.unwrap();
    let old_id = vm.id();
    let options = CallOptions {
        cancel: Some(cancel.clone()),
        ..CallOptions::default()
    };
    let started = Instant::now();
    let call = tokio::spawn({
        let pool = pool.clone();
        async move { pool.call(vm, hook_call(), options).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    assert!(matches!(call.await.unwrap(), Err(VmError::DeadlineExceeded)));
    assert!(started.elapsed() < Duration::from_secs(2));

    let vm = pool.get(None).await.unwrap();
    assert_ne!(vm.id(), old_id);
    pool.put(vm);
}

#[tokio::test]
async fn test_fuel_bounds_guest_without_deadline() {
    let root = TempDir::new().unwrap();
    let path = install(root.path(), "spinner", Behavior::Spin);
    let runtime = runtime(WasmConfig {
        fuel_per_call: 100_000,
        ..WasmConfig::default()
    });
    let pool = pool(&runtime, &path, "spinner");

    let vm = pool.get(None).await.unwrap();
    let result = pool.call(vm, hook_call(), CallOptions::default()).await;
    assert!(matches!(result, Err(VmError::FuelExhausted)));
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn test_guest_globals_scrubbed_between_calls() {
    let root = TempDir::new().unwrap();
    let path = install(root.path(), "leaky", Behavior::Leak);
    let runtime = runtime(WasmConfig::default());
    let pool = pool(&runtime, &path, "leaky");

    let vm = pool.get(None).await.unwrap();
    pool.snapshot_globals(&vm);
    pool.put(vm);

    let vm = pool.get(None).await.unwrap();
    let outcome = vm
        .invoke(hook_call(), CallOptions::default())
        .await
        .unwrap();
    outcome.result.unwrap();
    assert!(outcome.vm.global_names().contains("leak"));
    pool.put(outcome.vm);

    let vm = pool.get(None).await.unwrap();
    assert!(vm.global_names().is_empty());
    pool.put(vm);
}

#[tokio::test]
async fn test_wasm_plugin_end_to_end() {
    let root = TempDir::new().unwrap();
    install(root.path(), "spamguard", Behavior::Reject);
    let runtime = Arc::new(runtime(WasmConfig::default()));

    let manager = Arc::new(PluginManager::new(manager_config(root.path()), runtime));
    let report = manager.load_all().await.unwrap();
    assert_eq!(report.load_order, vec!["spamguard"]);

    let plugin = manager.get_plugin("spamguard").unwrap();
    assert_eq!(plugin.state, PluginState::Running);
    assert_eq!(plugin.hooks, vec![decl()]);

    let engine = HookEngine::new(
        HookConfig::default(),
        manager.clone(),
        Arc::new(MemoryApprovalStore::new()),
    );
    assert_eq!(engine.register_from(&manager).await.unwrap(), 1);
    let key = HookKey::new("spamguard", HookEvent::BeforeCreate, "posts");
    engine.approve(&key, "admin").await.unwrap();

    let err = engine
        .run_before_hooks(
            None,
            HookEvent::BeforeCreate,
            "posts",
            &json!({ "title": "Buy now" }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HookError::Rejected { .. }));
    assert_eq!(err.detail(), "spam detected");

    engine.close(Duration::from_secs(1)).await;
    manager.shutdown(Duration::from_secs(1)).await;
    assert_eq!(
        manager.get_plugin("spamguard").unwrap().state,
        PluginState::Stopped
    );
}
