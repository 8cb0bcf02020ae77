//! Load / reload / unload behaviour of a realm watcher against a fake registry

use std::path::PathBuf;
use std::sync::Arc;

use sideload_host::{
    DeliveryGate, FileEvent, HostConfig, InitReport, ModuleLoader, RealmWatcher, TrackedState,
};
use sideload_kernel::{LogLevel, Realm, RealmContext, RegistryBridge};
use sideload_testing::{
    BridgeCall, ConstructBehavior, FakeRegistry, MethodBehavior, ModuleImage, RecordingLog,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Harness {
    dir: TempDir,
    registry: Arc<FakeRegistry>,
    log: Arc<RecordingLog>,
    watcher: RealmWatcher,
    events: mpsc::UnboundedReceiver<FileEvent>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(HostConfig::default())
    }

    fn with_config(config: HostConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let registry = FakeRegistry::new();
        let log = RecordingLog::new();
        let (gate, events) = DeliveryGate::channel();
        let realm = Realm::new("client", dir.path(), RealmContext::new("client"));
        let watcher = RealmWatcher::new(realm, registry.clone(), gate, &config, log.log("host"));
        Self {
            dir,
            registry,
            log,
            watcher,
            events,
        }
    }

    fn path(&self, file_name: &str) -> PathBuf {
        self.dir.path().join(file_name)
    }

    fn write(&self, file_name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path(file_name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn context(&self) -> &RealmContext {
        self.watcher.realm().context()
    }
}

#[test]
fn load_then_unload_releases_the_same_handle() {
    let h = Harness::new();
    let mut loader = ModuleLoader::new(
        "a",
        h.context().clone(),
        h.registry.clone(),
        h.log.log("client"),
    )
    .unwrap();

    loader.replace_source(std::io::Cursor::new(ModuleImage::addon().to_bytes()));
    let handle = loader.load().unwrap();
    loader.unload();

    assert!(loader.current().is_none());
    let unregisters: Vec<_> = h
        .registry
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            BridgeCall::Unregister { handle, .. } => Some(handle),
            _ => None,
        })
        .collect();
    assert_eq!(unregisters, vec![handle.id()]);
}

#[test]
fn reload_never_holds_two_registrations() {
    let mut h = Harness::new();
    let path = h.write("a.module", &ModuleImage::addon().to_bytes());
    h.watcher.initialize();

    for round in 0..3 {
        std::fs::write(&path, ModuleImage::addon().tag(&format!("r{}", round)).to_bytes()).unwrap();
        assert!(h.watcher.handle_event(&FileEvent::modified(&path)));
        assert_eq!(h.registry.live_count(), 1);
    }
    assert_eq!(h.registry.calls_to("a", "Addon", "OnReload"), 3);
}

#[test]
fn modify_of_untracked_file_is_ignored_once() {
    let mut h = Harness::new();
    h.watcher.initialize();
    let path = h.write("stray.module", &ModuleImage::addon().to_bytes());

    assert!(!h.watcher.handle_event(&FileEvent::modified(&path)));
    assert_eq!(h.log.count_containing(LogLevel::Warning, "ignored"), 1);
    assert_eq!(h.log.count(LogLevel::Error), 0);
    assert!(h.registry.calls().is_empty());
    assert!(!h.watcher.is_tracked(&path));
}

#[test]
fn module_without_on_load_loads_with_one_warning() {
    let mut h = Harness::new();
    let image = ModuleImage::new()
        .with_type("Addon", ConstructBehavior::Ctor)
        .method("OnReload", 0, false);
    let path = h.write("a.module", &image.to_bytes());

    let report = h.watcher.initialize();
    assert_eq!(report, InitReport { loaded: 1, failed: 0 });
    assert_eq!(h.watcher.state_of(&path), Some(TrackedState::Loaded));
    assert_eq!(h.log.count(LogLevel::Warning), 1);
    assert_eq!(h.log.count(LogLevel::Error), 0);
}

#[test]
fn on_load_with_parameters_is_never_called() {
    let mut h = Harness::new();
    let image = ModuleImage::new()
        .with_type("Addon", ConstructBehavior::Ctor)
        .method("OnLoad", 2, false);
    h.write("a.module", &image.to_bytes());

    h.watcher.initialize();
    assert_eq!(h.registry.calls_to("a", "Addon", "OnLoad"), 0);
    assert_eq!(
        h.log
            .count_containing(LogLevel::Error, "a.Addon.OnLoad cannot have any parameters!"),
        1
    );
}

#[test]
fn overwrite_at_runtime_reloads_with_delivery_paused() {
    let mut h = Harness::new();
    let path = h.write("a.module", &ModuleImage::addon().to_bytes());

    h.watcher.initialize();
    assert_eq!(h.registry.calls_to("a", "Addon", "OnLoad"), 1);
    let old = h.registry.lookup(h.context(), "a").unwrap().id();

    let gate = h.watcher.gate().clone();
    h.registry.observe(move || gate.is_enabled());
    h.registry.clear_calls();

    assert!(h.watcher.gate().is_enabled());
    std::fs::write(&path, ModuleImage::addon().tag("v2").to_bytes()).unwrap();
    assert!(h.watcher.handle_event(&FileEvent::modified(&path)));
    assert!(h.watcher.gate().is_enabled());

    let calls = h.registry.calls();
    let lifecycle: Vec<&BridgeCall> = calls
        .iter()
        .filter(|call| !matches!(call, BridgeCall::Adapt | BridgeCall::Lookup { .. }))
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            &BridgeCall::Unregister {
                name: "a".to_string(),
                handle: old,
            },
            &BridgeCall::Register {
                name: "a".to_string(),
            },
            &BridgeCall::Callback {
                module: "a".to_string(),
                type_name: "Addon".to_string(),
                method: "OnReload".to_string(),
            },
        ]
    );
    assert_eq!(h.registry.calls_to("a", "Addon", "OnLoad"), 0);
    assert_eq!(h.registry.observations(), vec![false, false]);
}

#[test]
fn malformed_module_does_not_block_others() {
    let mut h = Harness::new();
    h.write("bad.module", &ModuleImage::malformed());
    let good = h.write("good.module", &ModuleImage::addon().to_bytes());

    let report = h.watcher.initialize();
    assert_eq!(report, InitReport { loaded: 1, failed: 1 });
    assert_eq!(
        h.log
            .count_containing(LogLevel::Error, "Failed to load module bad.module!"),
        1
    );
    assert_eq!(h.watcher.state_of(&good), Some(TrackedState::Loaded));
    assert_eq!(h.registry.calls_to("good", "Addon", "OnLoad"), 1);
}

#[test]
fn unloading_an_empty_loader_touches_nothing() {
    let h = Harness::new();
    let mut loader = ModuleLoader::new(
        "a",
        h.context().clone(),
        h.registry.clone(),
        h.log.log("client"),
    )
    .unwrap();

    loader.unload();
    loader.unload();
    assert!(h.registry.calls().is_empty());
}

#[test]
fn events_during_reload_are_delayed_not_lost() {
    let mut h = Harness::new();
    let path = h.write("a.module", &ModuleImage::addon().to_bytes());
    let other = h.path("b.module");
    h.watcher.initialize();
    while h.events.try_recv().is_ok() {}

    let gate = h.watcher.gate().clone();
    let raised = other.clone();
    h.registry.observe(move || {
        gate.offer(FileEvent::created(&raised));
        gate.is_enabled()
    });

    std::fs::write(&path, ModuleImage::addon().tag("v2").to_bytes()).unwrap();
    assert!(h.watcher.handle_event(&FileEvent::modified(&path)));

    // Offered twice while paused, delivered once afterwards
    assert_eq!(h.events.try_recv().unwrap(), FileEvent::created(&other));
    assert!(h.events.try_recv().is_err());
}

#[test]
fn duplicate_create_for_tracked_file_is_a_no_op() {
    let mut h = Harness::new();
    let path = h.write("a.module", &ModuleImage::addon().to_bytes());
    h.watcher.initialize();
    h.registry.clear_calls();

    assert!(h.watcher.handle_event(&FileEvent::created(&path)));
    assert!(h.registry.calls().is_empty());
    assert_eq!(h.watcher.tracked_count(), 1);
}

#[test]
fn duplicate_create_with_new_content_reloads() {
    let mut h = Harness::new();
    let path = h.write("a.module", &ModuleImage::addon().to_bytes());
    h.watcher.initialize();

    std::fs::write(&path, ModuleImage::addon().tag("v2").to_bytes()).unwrap();
    assert!(h.watcher.handle_event(&FileEvent::created(&path)));
    assert_eq!(h.registry.calls_to("a", "Addon", "OnReload"), 1);
    assert_eq!(h.registry.live_count(), 1);
}

#[test]
fn unchanged_skip_can_be_disabled() {
    let mut h = Harness::with_config(HostConfig::default().with_skip_unchanged(false));
    let path = h.write("a.module", &ModuleImage::addon().to_bytes());
    h.watcher.initialize();

    assert!(h.watcher.handle_event(&FileEvent::modified(&path)));
    assert_eq!(h.registry.calls_to("a", "Addon", "OnReload"), 1);
}

#[test]
fn partial_write_then_complete_gets_on_load() {
    let mut h = Harness::new();
    h.watcher.initialize();

    let path = h.write("a.module", b"sideload-fake");
    assert!(!h.watcher.handle_event(&FileEvent::created(&path)));
    assert_eq!(h.watcher.state_of(&path), Some(TrackedState::Unloaded));

    std::fs::write(&path, ModuleImage::addon().to_bytes()).unwrap();
    assert!(h.watcher.handle_event(&FileEvent::modified(&path)));
    assert_eq!(h.watcher.state_of(&path), Some(TrackedState::Loaded));
    assert_eq!(h.registry.calls_to("a", "Addon", "OnLoad"), 1);
    assert_eq!(h.registry.calls_to("a", "Addon", "OnReload"), 0);
}

#[test]
fn remove_then_create_starts_over() {
    let mut h = Harness::new();
    let path = h.write("a.module", &ModuleImage::addon().to_bytes());
    h.watcher.initialize();

    std::fs::remove_file(&path).unwrap();
    assert!(h.watcher.handle_event(&FileEvent::removed(&path)));
    assert_eq!(h.registry.live_count(), 0);

    h.write("a.module", &ModuleImage::addon().to_bytes());
    assert!(h.watcher.handle_event(&FileEvent::created(&path)));
    assert_eq!(h.registry.calls_to("a", "Addon", "OnLoad"), 2);
    assert_eq!(h.registry.live_count(), 1);
    assert_eq!(
        h.log
            .count_containing(LogLevel::Info, "Attempting to load new module a.module..."),
        1
    );
}

#[test]
fn panicking_callback_keeps_module_and_watcher_alive() {
    let mut h = Harness::new();
    let image = ModuleImage::new()
        .with_type("Addon", ConstructBehavior::Ctor)
        .method_with("OnLoad", 0, false, MethodBehavior::Panic)
        .method("OnReload", 0, false);
    let path = h.write("a.module", &image.to_bytes());

    let report = h.watcher.initialize();
    assert_eq!(report.loaded, 1);
    assert_eq!(h.watcher.state_of(&path), Some(TrackedState::Loaded));
    assert_eq!(h.log.count_containing(LogLevel::Error, "exploded"), 1);

    std::fs::write(&path, image.tag("v2").to_bytes()).unwrap();
    assert!(h.watcher.handle_event(&FileEvent::modified(&path)));
    assert_eq!(h.registry.calls_to("a", "Addon", "OnReload"), 1);
}

#[test]
fn registry_without_adapter_fails_every_load() {
    let mut h = Harness::new();
    h.registry.set_adapter_missing(true);
    h.write("a.module", &ModuleImage::addon().to_bytes());
    h.write("b.module", &ModuleImage::addon().to_bytes());

    let report = h.watcher.initialize();
    assert_eq!(report, InitReport { loaded: 0, failed: 2 });
    assert_eq!(h.registry.register_count(), 0);
    assert!(h.watcher.gate().is_enabled());
}

#[test]
fn failed_lookup_does_not_strand_the_registration() {
    let mut h = Harness::new();
    let path = h.write("a.module", &ModuleImage::addon().to_bytes());

    h.registry.fail_lookup(true);
    assert_eq!(h.watcher.initialize(), InitReport { loaded: 0, failed: 1 });
    assert_eq!(h.watcher.state_of(&path), Some(TrackedState::Unloaded));
    assert_eq!(h.registry.live_count(), 0);

    h.registry.fail_lookup(false);
    h.write("a.module", &ModuleImage::addon().tag("v2").to_bytes());
    assert!(h.watcher.handle_event(&FileEvent::modified(&path)));
    assert_eq!(h.watcher.state_of(&path), Some(TrackedState::Loaded));
    assert_eq!(h.registry.live_count(), 1);
    assert_eq!(h.registry.calls_to("a", "Addon", "OnLoad"), 1);
    assert_eq!(h.log.count_containing(LogLevel::Error, "already registered"), 0);
}

#[test]
fn transient_register_failure_is_retried_with_same_bytes() {
    let mut h = Harness::new();
    let path = h.write("a.module", &ModuleImage::addon().to_bytes());

    h.registry.fail_register(true);
    h.watcher.initialize();
    assert_eq!(h.watcher.state_of(&path), Some(TrackedState::Unloaded));

    h.registry.fail_register(false);
    assert!(h.watcher.handle_event(&FileEvent::modified(&path)));
    assert_eq!(h.watcher.state_of(&path), Some(TrackedState::Loaded));
    assert_eq!(h.registry.register_count(), 2);
}
