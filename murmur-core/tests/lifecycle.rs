//! End-to-end lifecycle tests over the public API: discovery from disk,
//! dependency-ordered startup, bus delivery, sandbox bounds, and registry
//! persistence across a host restart.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use murmur_core::sandbox::SandboxLimits;
use murmur_core::{
    HostError, ManagerConfig, NoopGuard, PluginManager, Sandbox, StaticModuleLoader,
};
use murmur_plugin_api::{
    Event, EventPriority, HandlerSpec, Plugin, PluginContext, PluginError, PluginInfo,
    PluginState, PluginType,
};
use serde_json::{Value, json};
use tempfile::TempDir;

type CallLog = Arc<Mutex<Vec<String>>>;

struct TestPlugin {
    info: PluginInfo,
    log: CallLog,
    start_delay: Option<Duration>,
}

#[async_trait]
impl Plugin for TestPlugin {
    fn info(&self) -> PluginInfo {
        self.info.clone()
    }

    async fn initialize(&mut self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        ctx.log_info("initializing");
        self.log
            .lock()
            .unwrap()
            .push(format!("init:{}", self.info.name));
        Ok(())
    }

    async fn start(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("start:{}", self.info.name));
        Ok(())
    }

    async fn stop(&mut self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("stop:{}", self.info.name));
        Ok(())
    }

    fn declare_handlers(&self) -> Vec<HandlerSpec> {
        let log = Arc::clone(&self.log);
        let name = self.info.name.clone();
        vec![
            HandlerSpec::new("message.received", move |event: Event| {
                let log = Arc::clone(&log);
                let name = name.clone();
                async move {
                    log.lock()
                        .unwrap()
                        .push(format!("handled:{name}:{}", event.payload));
                    Ok(Value::Null)
                }
            })
            .with_priority(EventPriority::High),
        ]
    }
}

struct Host {
    manager: PluginManager,
    log: CallLog,
    root: TempDir,
}

fn build_host(plugins: &[(&str, &[&str])]) -> Host {
    let root = TempDir::new().unwrap();
    let host = build_host_at(root.path(), plugins, None);
    Host {
        manager: host.0,
        log: host.1,
        root,
    }
}

fn build_host_at(
    root: &Path,
    plugins: &[(&str, &[&str])],
    start_delay: Option<Duration>,
) -> (PluginManager, CallLog) {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let statics = StaticModuleLoader::new();
    let plugin_dir = root.join("plugins");

    for (name, deps) in plugins {
        let dir = plugin_dir.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("plugin.json"),
            json!({
                "name": name,
                "version": "1.0.0",
                "entry_point": format!("{name}.so"),
                "dependencies": deps,
                "tags": ["test"],
            })
            .to_string(),
        )
        .unwrap();

        let entry = dir.join(format!("{name}.so"));
        let mut info =
            PluginInfo::new(*name, "1.0.0", PluginType::Extension, entry.to_string_lossy());
        info.dependencies = deps.iter().map(|d| d.to_string()).collect();
        info.tags = vec!["test".to_string()];

        let log = Arc::clone(&log);
        statics.register(entry, move || {
            Box::new(TestPlugin {
                info: info.clone(),
                log: Arc::clone(&log),
                start_delay,
            })
        });
    }

    let manager = PluginManager::with_module_loader(
        ManagerConfig::at(root),
        Arc::new(statics),
        Sandbox::with_guard(Box::new(NoopGuard)),
    );
    (manager, log)
}

#[tokio::test]
async fn full_lifecycle_with_dependencies() {
    let mut host = build_host(&[("base", &[]), ("mid", &["base"]), ("top", &["mid"])]);
    host.manager.initialize().await.unwrap();

    // Loading the top of the chain pulls in everything beneath it
    host.manager.load_plugin("top", None).await.unwrap();
    assert_eq!(host.manager.list_plugins().len(), 3);

    let (started, total) = host.manager.start_all().await.unwrap();
    assert_eq!((started, total), (3, 3));
    assert_eq!(
        host.manager.plugin_states().get("base"),
        Some(&PluginState::Started)
    );

    host.manager.shutdown().await.unwrap();
    assert!(host.manager.list_plugins().is_empty());

    let log = host.log.lock().unwrap();
    let starts: Vec<_> = log.iter().filter(|e| e.starts_with("start:")).collect();
    let stops: Vec<_> = log.iter().filter(|e| e.starts_with("stop:")).collect();
    assert_eq!(starts, vec!["start:base", "start:mid", "start:top"]);
    // Teardown is the exact reverse of startup
    assert_eq!(stops, vec!["stop:top", "stop:mid", "stop:base"]);
}

#[tokio::test]
async fn dependency_cycle_fails_without_partial_load() {
    let mut host = build_host(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
    host.manager.initialize().await.unwrap();

    let err = host.manager.load_plugin("a", None).await.unwrap_err();
    assert!(matches!(err, HostError::DependencyCycle { .. }));
    assert!(host.manager.list_plugins().is_empty());
}

#[tokio::test]
async fn missing_dependency_fails_load() {
    let mut host = build_host(&[("orphan", &["nonexistent"])]);
    host.manager.initialize().await.unwrap();

    let err = host.manager.load_plugin("orphan", None).await.unwrap_err();
    assert!(matches!(err, HostError::NotFound(_)));
    assert!(host.manager.get_plugin("orphan").is_none());
}

#[tokio::test]
async fn declared_handlers_are_wired_and_unwired() {
    let mut host = build_host(&[("listener", &[])]);
    host.manager.initialize().await.unwrap();
    host.manager.load_plugin("listener", None).await.unwrap();

    let bus = host.manager.bus();
    let results = bus
        .emit_wait(Event::new("message.received", json!("hello")))
        .await;
    assert_eq!(results.len(), 1);
    assert!(host
        .log
        .lock()
        .unwrap()
        .iter()
        .any(|e| e.starts_with("handled:listener:")));

    host.manager.unload_plugin("listener").await.unwrap();
    let results = bus
        .emit_wait(Event::new("message.received", json!("again")))
        .await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn sandbox_timeout_marks_plugin_errored() {
    let root = TempDir::new().unwrap();
    let (mut manager, _log) = build_host_at(
        root.path(),
        &[("sleepy", &[])],
        Some(Duration::from_secs(60)),
    );
    manager
        .sandbox()
        .set_limits(SandboxLimits {
            max_execution_time: Duration::from_millis(50),
            ..Default::default()
        })
        .await;

    manager.initialize().await.unwrap();
    manager.load_plugin("sleepy", None).await.unwrap();

    let err = manager.start_plugin("sleepy").await.unwrap_err();
    assert!(matches!(err, HostError::Timeout { .. }));
    assert_eq!(
        manager.plugin_states().get("sleepy"),
        Some(&PluginState::Error)
    );

    let stats = manager.sandbox().stats("sleepy").await.unwrap();
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn registry_survives_host_restart() {
    let root = TempDir::new().unwrap();

    {
        let (mut manager, _log) = build_host_at(root.path(), &[("keeper", &[])], None);
        manager.initialize().await.unwrap();
        assert!(manager.registry().contains("keeper"));
        manager.shutdown().await.unwrap();
    }

    // A fresh manager over the same root sees the persisted registry even
    // before discovery runs
    let (manager, _log) = build_host_at(root.path(), &[], None);
    assert!(manager.registry().contains("keeper"));
    assert_eq!(manager.registry().list_by_tag("test").len(), 1);
}

#[tokio::test]
async fn plugin_config_store_roundtrip() {
    let root = TempDir::new().unwrap();

    let mut config = HashMap::new();
    config.insert("greeting".to_string(), json!("hi"));

    {
        let (mut manager, _log) = build_host_at(root.path(), &[("echo", &[])], None);
        manager.initialize().await.unwrap();
        manager.set_plugin_config("echo", config.clone());
        manager.shutdown().await.unwrap();
    }

    let (mut manager, _log) = build_host_at(root.path(), &[("echo", &[])], None);
    manager.initialize().await.unwrap();
    assert_eq!(manager.get_plugin_config("echo"), Some(&config));
}

#[tokio::test]
async fn scratch_directory_removed_at_shutdown() {
    let mut host = build_host(&[("echo", &[])]);
    host.manager.initialize().await.unwrap();
    host.manager.load_plugin("echo", None).await.unwrap();

    let temp_root = host.root.path().join("tmp");
    assert!(temp_root.join("echo").is_dir());

    host.manager.shutdown().await.unwrap();
    assert!(!temp_root.exists());
}
