//! Hook dispatch integration tests

mod common;

use common::{manager_config, pool_config, write_plugin, MockPlugin, MockRuntime, RecordingData};
use folio_plugin_api::{HookDecl, HookEvent};
use folio_plugin_host::approval::{ApprovalStore, MemoryApprovalStore, StoreError};
use folio_plugin_host::audit::{AuditEventType, MemoryAuditSink};
use folio_plugin_host::capability::DataAccess;
use folio_plugin_host::config::HookConfig;
use folio_plugin_host::hooks::{FaultState, HookEngine, HookError, HookKey};
use folio_plugin_host::manager::PluginManager;
use folio_plugin_host::pool::{PoolLookup, VmPool};
use folio_plugin_host::vm::{Invocation, VmError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

type CallLog = Arc<Mutex<Vec<String>>>;

/// Plugin whose handler appends `<plugin> <handler key>` to `log`
fn recording(name: &str, log: &CallLog) -> MockPlugin {
    let log = log.clone();
    let owner = name.to_string();
    MockPlugin::new(name).handler(move |_, call| {
        if let Invocation::Hook { key, .. } = call {
            log.lock().unwrap().push(format!("{} {}", owner, key));
        }
        Ok(())
    })
}

struct Harness {
    engine: HookEngine,
    store: Arc<MemoryApprovalStore>,
    data: Arc<RecordingData>,
}

fn harness(plugins: &[&MockPlugin], config: HookConfig) -> Harness {
    harness_with_store(plugins, config, Arc::new(MemoryApprovalStore::new()))
}

fn harness_with_store(
    plugins: &[&MockPlugin],
    config: HookConfig,
    store: Arc<MemoryApprovalStore>,
) -> Harness {
    let data = Arc::new(RecordingData::default());
    let mut pools: HashMap<String, VmPool> = HashMap::new();
    for plugin in plugins {
        let access: Arc<dyn DataAccess> = data.clone();
        let pool = VmPool::new(
            plugin.info.name.clone(),
            plugin.factory(10, access),
            &pool_config(1, 1),
        )
        .unwrap();
        pools.insert(plugin.info.name.clone(), pool);
    }
    let engine = HookEngine::new(
        config,
        Arc::new(pools) as Arc<dyn PoolLookup>,
        store.clone() as Arc<dyn ApprovalStore>,
    );
    Harness {
        engine,
        store,
        data,
    }
}

async fn register_approved(engine: &HookEngine, plugin: &str, decls: &[HookDecl]) {
    engine.register_plugin(plugin, decls).await.unwrap();
    for decl in decls {
        let key = HookKey::new(plugin, decl.event, decl.table.clone());
        engine.approve(&key, "admin").await.unwrap();
    }
}

fn record() -> Value {
    json!({ "title": "Hello", "body": "World" })
}

#[tokio::test]
async fn test_dispatch_order_is_priority_then_exact_then_registration() {
    let log = CallLog::default();
    let a = recording("a", &log);
    let b = recording("b", &log);
    let c = recording("c", &log);
    let h = harness(&[&a, &b, &c], HookConfig::default());

    register_approved(
        &h.engine,
        "a",
        &[
            HookDecl::new(HookEvent::BeforeCreate, "posts").priority(10),
            HookDecl::new(HookEvent::BeforeCreate, "*").priority(0),
        ],
    )
    .await;
    register_approved(
        &h.engine,
        "b",
        &[
            HookDecl::new(HookEvent::BeforeCreate, "posts").priority(0),
            HookDecl::new(HookEvent::BeforeCreate, "*").priority(10),
        ],
    )
    .await;
    register_approved(
        &h.engine,
        "c",
        &[HookDecl::new(HookEvent::BeforeCreate, "posts").priority(0)],
    )
    .await;

    h.engine
        .run_before_hooks(None, HookEvent::BeforeCreate, "posts", &record())
        .await
        .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "b before_create:posts",
            "c before_create:posts",
            "a before_create:*",
            "a before_create:posts",
            "b before_create:*",
        ]
    );

    // Other tables only see the wildcards
    log.lock().unwrap().clear();
    h.engine
        .run_before_hooks(None, HookEvent::BeforeCreate, "pages", &record())
        .await
        .unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["a before_create:*", "b before_create:*"]
    );
}

#[tokio::test]
async fn test_unapproved_hooks_never_run() {
    let log = CallLog::default();
    let seo = recording("seo", &log);
    let h = harness(&[&seo], HookConfig::default());

    let decl = HookDecl::new(HookEvent::BeforeUpdate, "posts");
    assert_eq!(h.engine.register_plugin("seo", &[decl.clone()]).await.unwrap(), 1);
    // Duplicate declarations are ignored
    assert_eq!(h.engine.register_plugin("seo", &[decl]).await.unwrap(), 0);

    assert!(h.engine.has_hooks(HookEvent::BeforeUpdate, "posts"));
    assert!(h.engine.gather_entries(HookEvent::BeforeUpdate, "posts").is_empty());
    h.engine
        .run_before_hooks(None, HookEvent::BeforeUpdate, "posts", &record())
        .await
        .unwrap();
    assert!(log.lock().unwrap().is_empty());

    let key = HookKey::new("seo", HookEvent::BeforeUpdate, "posts");
    h.engine.approve(&key, "admin").await.unwrap();
    h.engine
        .run_before_hooks(None, HookEvent::BeforeUpdate, "posts", &record())
        .await
        .unwrap();
    assert_eq!(log.lock().unwrap().len(), 1);

    h.engine.revoke(&key, "admin").await.unwrap();
    h.engine
        .run_before_hooks(None, HookEvent::BeforeUpdate, "posts", &record())
        .await
        .unwrap();
    assert_eq!(log.lock().unwrap().len(), 1);

    let status = h.engine.list();
    assert_eq!(status.len(), 1);
    assert!(!status[0].approved);
}

#[tokio::test]
async fn test_rejection_aborts_chain_with_sanitized_error() {
    let log = CallLog::default();
    let first = MockPlugin::new("first").handler(|_, _| {
        Err(VmError::Rejected("title must not be empty".to_string()))
    });
    let second = recording("second", &log);
    let h = harness(&[&first, &second], HookConfig::default());

    register_approved(
        &h.engine,
        "first",
        &[HookDecl::new(HookEvent::BeforeCreate, "posts").priority(1)],
    )
    .await;
    register_approved(
        &h.engine,
        "second",
        &[HookDecl::new(HookEvent::BeforeCreate, "posts").priority(2)],
    )
    .await;

    let err = h
        .engine
        .run_before_hooks(None, HookEvent::BeforeCreate, "posts", &record())
        .await
        .unwrap_err();

    assert!(matches!(err, HookError::Rejected { .. }));
    assert_eq!(err.to_string(), "the operation was rejected by a content hook");
    assert_eq!(err.detail(), "title must not be empty");
    assert_eq!(err.key().unwrap().plugin, "first");
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_repeated_failures_disable_hook_until_reset() {
    let calls = Arc::new(Mutex::new(0usize));
    let counter = calls.clone();
    let flaky = MockPlugin::new("flaky").handler(move |_, _| {
        *counter.lock().unwrap() += 1;
        Err(VmError::Plugin("db password=hunter2 rejected".to_string()))
    });
    let config = HookConfig {
        fault_threshold: 3,
        ..HookConfig::default()
    };
    let h = harness(&[&flaky], config);
    register_approved(
        &h.engine,
        "flaky",
        &[HookDecl::new(HookEvent::BeforeDelete, "*")],
    )
    .await;
    let key = HookKey::new("flaky", HookEvent::BeforeDelete, "*");

    for attempt in 1..=3u32 {
        let err = h
            .engine
            .run_before_hooks(None, HookEvent::BeforeDelete, "posts", &record())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "a content hook failed");
        assert!(!err.to_string().contains("hunter2"));
        assert!(err.detail().contains("hunter2"));
        assert_eq!(h.engine.fault_state(&key).consecutive_failures, attempt);
    }
    assert!(h.engine.fault_state(&key).disabled);

    // Disabled: the operation proceeds without calling the plugin
    h.engine
        .run_before_hooks(None, HookEvent::BeforeDelete, "posts", &record())
        .await
        .unwrap();
    assert_eq!(*calls.lock().unwrap(), 3);
    assert!(h.engine.list()[0].fault.disabled);

    assert!(h.engine.reset_fault(&key));
    assert_eq!(h.engine.fault_state(&key), FaultState::default());
    assert!(h
        .engine
        .run_before_hooks(None, HookEvent::BeforeDelete, "posts", &record())
        .await
        .is_err());
    assert_eq!(*calls.lock().unwrap(), 4);
}

#[tokio::test]
async fn test_success_clears_failure_streak() {
    let fail = Arc::new(Mutex::new(true));
    let toggle = fail.clone();
    let plugin = MockPlugin::new("seo").handler(move |_, _| {
        if *toggle.lock().unwrap() {
            Err(VmError::Plugin("boom".to_string()))
        } else {
            Ok(())
        }
    });
    let config = HookConfig {
        fault_threshold: 2,
        ..HookConfig::default()
    };
    let h = harness(&[&plugin], config);
    register_approved(&h.engine, "seo", &[HookDecl::new(HookEvent::BeforeCreate, "posts")]).await;
    let key = HookKey::new("seo", HookEvent::BeforeCreate, "posts");

    let rec = record();
    assert!(h
        .engine
        .run_before_hooks(None, HookEvent::BeforeCreate, "posts", &rec)
        .await
        .is_err());
    *fail.lock().unwrap() = false;
    assert!(h
        .engine
        .run_before_hooks(None, HookEvent::BeforeCreate, "posts", &rec)
        .await
        .is_ok());
    assert_eq!(h.engine.fault_state(&key).consecutive_failures, 0);

    *fail.lock().unwrap() = true;
    assert!(h
        .engine
        .run_before_hooks(None, HookEvent::BeforeCreate, "posts", &rec)
        .await
        .is_err());
    assert!(!h.engine.fault_state(&key).disabled);
}

#[tokio::test]
async fn test_before_hooks_cannot_touch_data() {
    let plugin = MockPlugin::new("seo").handler(|vm, _| {
        vm.data("posts")
            .map(|_| ())
            .map_err(|e| VmError::Plugin(e.to_string()))
    });
    let h = harness(&[&plugin], HookConfig::default());
    register_approved(
        &h.engine,
        "seo",
        &[
            HookDecl::new(HookEvent::BeforeCreate, "posts"),
            HookDecl::new(HookEvent::AfterCreate, "posts"),
        ],
    )
    .await;

    let err = h
        .engine
        .run_before_hooks(None, HookEvent::BeforeCreate, "posts", &record())
        .await
        .unwrap_err();
    assert!(matches!(err, HookError::Failed { .. }));
    assert!(err.detail().contains("blocked"));
    assert!(h.data.tables.lock().unwrap().is_empty());

    h.engine
        .run_after_hooks(HookEvent::AfterCreate, "posts", &record())
        .await;
    h.engine.close(Duration::from_secs(2)).await;
    assert_eq!(*h.data.tables.lock().unwrap(), vec!["posts"]);
}

#[tokio::test]
async fn test_record_carries_event_and_table() {
    let seen = Arc::new(Mutex::new(None));
    let capture = seen.clone();
    let plugin = MockPlugin::new("seo").handler(move |_, call| {
        if let Invocation::Hook { record, .. } = call {
            *capture.lock().unwrap() = Some(record.as_ref().clone());
        }
        Ok(())
    });
    let h = harness(&[&plugin], HookConfig::default());
    register_approved(&h.engine, "seo", &[HookDecl::new(HookEvent::BeforePublish, "*")]).await;

    h.engine
        .run_before_hooks(None, HookEvent::BeforePublish, "pages", &record())
        .await
        .unwrap();
    let record = seen.lock().unwrap().clone().unwrap();
    assert_eq!(record["title"], "Hello");
    assert_eq!(record["_table"], "pages");
    assert_eq!(record["_event"], "before_publish");

    let err = h
        .engine
        .run_before_hooks(None, HookEvent::BeforePublish, "pages", &42)
        .await
        .unwrap_err();
    assert!(matches!(err, HookError::InvalidRecord { .. }));
}

#[tokio::test]
async fn test_slow_before_hook_times_out() {
    let plugin = MockPlugin::new("slow").handler(|vm, _| vm.work(Duration::from_secs(5)));
    let config = HookConfig {
        before_hook_timeout: Duration::from_millis(50),
        ..HookConfig::default()
    };
    let h = harness(&[&plugin], config);
    register_approved(&h.engine, "slow", &[HookDecl::new(HookEvent::BeforeCreate, "posts")]).await;

    let started = Instant::now();
    let err = h
        .engine
        .run_before_hooks(None, HookEvent::BeforeCreate, "posts", &record())
        .await
        .unwrap_err();
    assert!(matches!(err, HookError::TimedOut { .. }));
    assert_eq!(err.to_string(), "a content hook timed out");
    assert!(started.elapsed() < Duration::from_secs(1));

    // A caller deadline tighter than the configured budget wins
    let config = HookConfig {
        before_hook_timeout: Duration::from_secs(5),
        ..HookConfig::default()
    };
    let h = harness(&[&plugin], config);
    register_approved(&h.engine, "slow", &[HookDecl::new(HookEvent::BeforeCreate, "posts")]).await;
    let started = Instant::now();
    let deadline = Instant::now() + Duration::from_millis(50);
    assert!(h
        .engine
        .run_before_hooks(Some(deadline), HookEvent::BeforeCreate, "posts", &record())
        .await
        .is_err());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_missing_pool_is_unavailable_not_a_fault() {
    let h = harness(&[], HookConfig::default());
    register_approved(&h.engine, "ghost", &[HookDecl::new(HookEvent::BeforeCreate, "posts")]).await;

    let err = h
        .engine
        .run_before_hooks(None, HookEvent::BeforeCreate, "posts", &record())
        .await
        .unwrap_err();
    assert!(matches!(err, HookError::Unavailable { .. }));
    assert!(!err.is_fault());

    let key = HookKey::new("ghost", HookEvent::BeforeCreate, "posts");
    assert_eq!(h.engine.fault_state(&key), FaultState::default());
}

#[tokio::test]
async fn test_after_hooks_run_in_background() {
    let log = CallLog::default();
    let done = log.clone();
    let plugin = MockPlugin::new("mailer").handler(move |vm, call| {
        vm.work(Duration::from_millis(200))?;
        if let Invocation::Hook { key, .. } = call {
            done.lock().unwrap().push(key.clone());
        }
        Ok(())
    });
    let h = harness(&[&plugin], HookConfig::default());
    register_approved(&h.engine, "mailer", &[HookDecl::new(HookEvent::AfterPublish, "posts")]).await;

    let started = Instant::now();
    h.engine
        .run_after_hooks(HookEvent::AfterPublish, "posts", &record())
        .await;
    assert!(started.elapsed() < Duration::from_millis(150));
    assert_eq!(h.engine.in_flight(), 1);
    assert!(log.lock().unwrap().is_empty());

    let waited = Instant::now();
    while h.engine.in_flight() > 0 && waited.elapsed() < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.engine.in_flight(), 0);
    assert_eq!(*log.lock().unwrap(), vec!["after_publish:posts"]);

    h.engine.close(Duration::from_secs(2)).await;
    assert!(h.engine.is_closing());

    // Closed engines accept no more async work
    h.engine
        .run_after_hooks(HookEvent::AfterPublish, "posts", &record())
        .await;
    assert_eq!(h.engine.in_flight(), 0);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_close_interrupts_running_after_hooks() {
    let log = CallLog::default();
    let done = log.clone();
    let plugin = MockPlugin::new("mailer").handler(move |vm, call| {
        vm.work(Duration::from_secs(3))?;
        if let Invocation::Hook { key, .. } = call {
            done.lock().unwrap().push(key.clone());
        }
        Ok(())
    });
    let h = harness(&[&plugin], HookConfig::default());
    register_approved(&h.engine, "mailer", &[HookDecl::new(HookEvent::AfterPublish, "posts")]).await;

    h.engine
        .run_after_hooks(HookEvent::AfterPublish, "posts", &record())
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.engine.in_flight(), 1);

    let started = Instant::now();
    h.engine.close(Duration::from_secs(10)).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.engine.in_flight(), 0);
    assert!(log.lock().unwrap().is_empty());

    // Shutdown interruptions are not held against the hook
    let key = HookKey::new("mailer", HookEvent::AfterPublish, "posts");
    assert_eq!(h.engine.fault_state(&key), FaultState::default());
}

#[tokio::test]
async fn test_after_hook_rejection_is_ignored() {
    let plugin = MockPlugin::new("seo")
        .handler(|_, _| Err(VmError::Rejected("too late to veto".to_string())));
    let config = HookConfig {
        fault_threshold: 1,
        ..HookConfig::default()
    };
    let h = harness(&[&plugin], config);
    register_approved(&h.engine, "seo", &[HookDecl::new(HookEvent::AfterUpdate, "posts")]).await;

    h.engine
        .run_after_hooks(HookEvent::AfterUpdate, "posts", &record())
        .await;
    h.engine.close(Duration::from_secs(2)).await;

    let key = HookKey::new("seo", HookEvent::AfterUpdate, "posts");
    assert_eq!(h.engine.fault_state(&key), FaultState::default());
}

#[tokio::test]
async fn test_approvals_persist_across_engines() {
    let log = CallLog::default();
    let seo = recording("seo", &log);
    let store = Arc::new(MemoryApprovalStore::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let decl = HookDecl::new(HookEvent::BeforeCreate, "posts");
    let key = HookKey::new("seo", HookEvent::BeforeCreate, "posts");

    {
        let h = harness_with_store(&[&seo], HookConfig::default(), store.clone());
        let engine = h.engine.with_audit(audit.clone());
        engine.register_plugin("seo", &[decl.clone()]).await.unwrap();

        let unknown = HookKey::new("seo", HookEvent::BeforeCreate, "pages");
        assert!(matches!(
            engine.approve(&unknown, "admin").await,
            Err(StoreError::NotFound(_))
        ));
        engine.approve(&key, "alice").await.unwrap();
    }

    let stored = store.list_hooks().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].approved);
    assert_eq!(stored[0].approved_by.as_deref(), Some("alice"));
    assert_eq!(audit.find_by_type(AuditEventType::HookApproved).len(), 1);

    let h = harness_with_store(&[&seo], HookConfig::default(), store.clone());
    h.engine.register_plugin("seo", &[decl]).await.unwrap();
    h.engine
        .run_before_hooks(None, HookEvent::BeforeCreate, "posts", &record())
        .await
        .unwrap();
    assert_eq!(log.lock().unwrap().len(), 1);

    h.engine.remove_plugin("seo").await.unwrap();
    assert!(!h.engine.has_hooks(HookEvent::BeforeCreate, "posts"));
    assert!(h.engine.list().is_empty());
    assert!(h.store.list_hooks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_register_from_running_plugins() {
    let root = tempfile::TempDir::new().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let log = CallLog::default();

    write_plugin(root.path(), "seo", "seo");
    runtime.add(recording("seo", &log).hook(HookDecl::new(HookEvent::BeforeCreate, "posts")));
    write_plugin(root.path(), "broken", "broken");
    runtime.add(
        recording("broken", &log)
            .hook(HookDecl::new(HookEvent::BeforeCreate, "posts"))
            .handler(|_, call| match call {
                Invocation::Startup => Err(VmError::Plugin("no config".to_string())),
                _ => Ok(()),
            }),
    );

    let manager = Arc::new(PluginManager::new(manager_config(root.path()), runtime));
    manager.load_all().await.unwrap();

    let engine = HookEngine::new(
        HookConfig::default(),
        manager.clone(),
        Arc::new(MemoryApprovalStore::new()),
    );
    assert_eq!(engine.register_from(&manager).await.unwrap(), 1);

    let key = HookKey::new("seo", HookEvent::BeforeCreate, "posts");
    engine.approve(&key, "admin").await.unwrap();
    engine
        .run_before_hooks(None, HookEvent::BeforeCreate, "posts", &record())
        .await
        .unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["seo before_create:posts"]);

    manager.shutdown(Duration::from_secs(1)).await;
    let err = engine
        .run_before_hooks(None, HookEvent::BeforeCreate, "posts", &record())
        .await
        .unwrap_err();
    assert!(matches!(err, HookError::Unavailable { .. }));
}
