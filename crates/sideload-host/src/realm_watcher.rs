//! Realm watcher
//!
//! One watcher per realm. It owns the module loaders for every module file in
//! the realm's directory and drives them through load, reload and unload in
//! response to file events:
//!
//! ```text
//! Unloaded ──load ok──▶ Loaded ──modify──▶ (unload) ──load ok──▶ Loaded
//!    ▲                    │                    │
//!    └────── remove ──────┘                    └─load failed─▶ Unloaded
//! ```
//!
//! Events are handled one at a time on the realm's task. While a reload is in
//! flight, delivery for the whole realm is paused through the
//! [`DeliveryGate`]; events raised meanwhile are deferred, not lost.

use std::collections::HashMap;
use std::future;
use std::io::Cursor;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use sideload_kernel::{Log, Realm, RegistryBridge};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::config::HostConfig;
use crate::delivery::{DeliveryGate, EventCoalescer, FileEvent, FileEventKind};
use crate::invoker::{LifecycleInvoker, panic_message};
use crate::loader::ModuleLoader;

/// Stable identity of a module file.
///
/// Derived from the path, never from content: the canonical parent directory
/// joined with the file name, so every event on one path maps to one entry
/// even after the file itself has been deleted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity(PathBuf);

impl FileIdentity {
    pub fn of(path: &Path) -> Self {
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let identity = match (absolute.parent(), absolute.file_name()) {
            (Some(parent), Some(name)) => parent
                .canonicalize()
                .map(|parent| parent.join(name))
                .unwrap_or_else(|_| absolute.clone()),
            _ => absolute.clone(),
        };
        Self(identity)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

/// Load state of a tracked file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedState {
    Unloaded,
    Loaded,
}

/// Operational phase of a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherPhase {
    Initializing,
    Watching,
}

/// Outcome of the initial directory scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitReport {
    pub loaded: usize,
    pub failed: usize,
}

struct TrackedFile {
    path: PathBuf,
    loader: ModuleLoader,
    /// Set once any load of this file succeeded
    ever_loaded: bool,
    /// Digest of the image behind the live registration
    loaded_digest: Option<String>,
}

/// Owns the module loaders of one realm
pub struct RealmWatcher {
    realm: Realm,
    config: HostConfig,
    bridge: Arc<dyn RegistryBridge>,
    invoker: LifecycleInvoker,
    log: Log,
    gate: Arc<DeliveryGate>,
    tracked: HashMap<FileIdentity, TrackedFile>,
    phase: WatcherPhase,
}

impl RealmWatcher {
    pub fn new(
        realm: Realm,
        bridge: Arc<dyn RegistryBridge>,
        gate: Arc<DeliveryGate>,
        config: &HostConfig,
        log: Log,
    ) -> Self {
        let log = log.scoped(realm.name());
        Self {
            invoker: LifecycleInvoker::new(log.clone()),
            realm,
            config: config.clone(),
            bridge,
            log,
            gate,
            tracked: HashMap::new(),
            phase: WatcherPhase::Initializing,
        }
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    pub fn phase(&self) -> WatcherPhase {
        self.phase
    }

    pub fn gate(&self) -> &Arc<DeliveryGate> {
        &self.gate
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.tracked.contains_key(&FileIdentity::of(path))
    }

    /// Load state of the file at `path`, `None` when it is not tracked
    pub fn state_of(&self, path: &Path) -> Option<TrackedState> {
        self.tracked.get(&FileIdentity::of(path)).map(|tracked| {
            if tracked.loader.is_loaded() {
                TrackedState::Loaded
            } else {
                TrackedState::Unloaded
            }
        })
    }

    /// Paths of all tracked files, sorted
    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.tracked.values().map(|t| t.path.clone()).collect();
        paths.sort();
        paths
    }

    /// Load every module file already in the directory.
    ///
    /// Delivery stays paused for the whole scan; events raised meanwhile are
    /// handed to the event loop afterwards and de-duplicated by identity.
    pub fn initialize(&mut self) -> InitReport {
        let gate = self.gate.clone();
        let _paused = gate.pause();

        let mut report = InitReport::default();
        for path in self.scan() {
            let file_name = display_name(&path);
            self.log
                .info(format_args!("Attempting to load module {}...", file_name));
            if self.guarded("initial load", &file_name, |watcher| watcher.add_module(&path)) {
                report.loaded += 1;
            } else {
                report.failed += 1;
            }
        }

        self.phase = WatcherPhase::Watching;
        debug!(
            "Realm {} initialized: {} loaded, {} failed",
            self.realm.name(),
            report.loaded,
            report.failed
        );
        report
    }

    /// Module files currently in the directory, sorted by path
    fn scan(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(self.realm.directory()) {
            Ok(entries) => entries,
            Err(e) => {
                self.log.error(format_args!(
                    "Failed to read directory {}: {}",
                    self.realm.directory().display(),
                    e
                ));
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && self.config.is_module_file(path))
            .collect();
        paths.sort();
        paths
    }

    /// React to one file event. Never panics; returns false on failure.
    pub fn handle_event(&mut self, event: &FileEvent) -> bool {
        if !self.config.is_module_file(&event.path) {
            return false;
        }

        let path = event.path.clone();
        match event.kind {
            FileEventKind::Created => {
                self.guarded("create", &event.file_name, |watcher| watcher.on_created(&path))
            }
            FileEventKind::Modified => {
                self.guarded("modify", &event.file_name, |watcher| watcher.reload_module(&path))
            }
            FileEventKind::Removed => {
                self.guarded("remove", &event.file_name, |watcher| watcher.on_removed(&path))
            }
        }
    }

    /// Run a handler, turning a panic into a logged failure
    fn guarded(
        &mut self,
        operation: &str,
        file_name: &str,
        handler: impl FnOnce(&mut Self) -> bool,
    ) -> bool {
        match catch_unwind(AssertUnwindSafe(|| handler(self))) {
            Ok(result) => result,
            Err(payload) => {
                self.log.error(format_args!(
                    "Unexpected failure during {} of module {}: {}",
                    operation,
                    file_name,
                    panic_message(payload)
                ));
                false
            }
        }
    }

    fn on_created(&mut self, path: &Path) -> bool {
        if self.tracked.contains_key(&FileIdentity::of(path)) {
            debug!("Create for tracked module {:?}, taking reload path", path);
            return self.reload_module(path);
        }

        self.log.info(format_args!(
            "Attempting to load new module {}...",
            display_name(path)
        ));
        self.add_module(path)
    }

    /// Start tracking `path` and load it
    fn add_module(&mut self, path: &Path) -> bool {
        let file_name = display_name(path);
        let identity = FileIdentity::of(path);

        let image = match std::fs::read(path) {
            Ok(image) => image,
            Err(e) => {
                self.log
                    .error(format_args!("Failed to read module {}: {}", file_name, e));
                self.log.error(format_args!("Failed to load module {}!", file_name));
                return false;
            }
        };

        let loader = match ModuleLoader::new(
            module_name(path),
            self.realm.context().clone(),
            self.bridge.clone(),
            self.log.clone(),
        ) {
            Ok(loader) => loader,
            Err(e) => {
                self.log
                    .error(format_args!("Failed to load module {}: {}", file_name, e));
                return false;
            }
        };

        self.tracked.insert(
            identity.clone(),
            TrackedFile {
                path: path.to_path_buf(),
                loader,
                ever_loaded: false,
                loaded_digest: None,
            },
        );

        if self.apply_image(&identity, image) {
            true
        } else {
            self.log.error(format_args!("Failed to load module {}!", file_name));
            false
        }
    }

    /// Swap the module at `path` for the file's current content
    fn reload_module(&mut self, path: &Path) -> bool {
        let file_name = display_name(path);
        let identity = FileIdentity::of(path);

        if !self.tracked.contains_key(&identity) {
            self.log.warning(format_args!(
                "Change to untracked module {} ignored.",
                file_name
            ));
            return false;
        }

        let gate = self.gate.clone();
        let _paused = gate.pause();

        let image = match std::fs::read(path) {
            Ok(image) => image,
            Err(e) => {
                self.log
                    .error(format_args!("Failed to read module {}: {}", file_name, e));
                self.log
                    .error(format_args!("Failed to reload module {}!", file_name));
                return false;
            }
        };

        if self.config.skip_unchanged {
            let digest = image_digest(&image);
            let unchanged = self
                .tracked
                .get(&identity)
                .filter(|tracked| tracked.loader.is_loaded())
                .and_then(|tracked| tracked.loaded_digest.as_deref())
                .is_some_and(|previous| previous == digest);
            if unchanged {
                self.log
                    .info(format_args!("Module {} unchanged, skipping reload.", file_name));
                return true;
            }
        }

        self.log.info(format_args!("Reloading module {}...", file_name));
        if self.apply_image(&identity, image) {
            true
        } else {
            self.log
                .error(format_args!("Failed to reload module {}!", file_name));
            false
        }
    }

    /// Feed `image` to the tracked loader, replace the registration and run
    /// the matching lifecycle callback
    fn apply_image(&mut self, identity: &FileIdentity, image: Vec<u8>) -> bool {
        let Some(tracked) = self.tracked.get_mut(identity) else {
            return false;
        };

        let digest = image_digest(&image);
        tracked.loaded_digest = None;
        tracked.loader.replace_source(Cursor::new(image));
        tracked.loader.unload();

        let Some(handle) = tracked.loader.load() else {
            return false;
        };
        tracked.loaded_digest = Some(digest);

        let callback = if tracked.ever_loaded {
            &self.config.on_reload
        } else {
            &self.config.on_load
        };
        tracked.ever_loaded = true;

        // Callback failures are logged by the invoker; the module stays registered
        let _ = self
            .invoker
            .invoke(handle.module().as_ref(), &self.config.entry_type, callback);
        true
    }

    fn on_removed(&mut self, path: &Path) -> bool {
        let Some(mut tracked) = self.tracked.remove(&FileIdentity::of(path)) else {
            debug!("Remove for untracked module {:?}", path);
            return true;
        };

        tracked.loader.unload();
        self.log.info(format_args!(
            "Module {} removed, unloaded.",
            display_name(&tracked.path)
        ));
        true
    }

    /// Unload every tracked module and forget them
    pub fn shutdown(&mut self) {
        let count = self.tracked.len();
        for (_, mut tracked) in self.tracked.drain() {
            tracked.loader.unload();
        }
        debug!(
            "Realm {} watcher stopped, {} module(s) unloaded",
            self.realm.name(),
            count
        );
    }

    /// Process events until `shutdown` fires, then unload everything.
    ///
    /// With a non-zero debounce, events for one path are coalesced and handled
    /// once the path has been quiet for the configured period.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<FileEvent>,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        let mut coalescer = EventCoalescer::new(self.config.debounce());

        loop {
            let deadline = coalescer.next_deadline();
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if coalescer.is_immediate() {
                        self.handle_event_blocking(&event);
                    } else {
                        coalescer.push(event, Instant::now());
                    }
                }
                _ = wait_until(deadline) => {
                    for event in coalescer.drain_ready(Instant::now()) {
                        self.handle_event_blocking(&event);
                    }
                }
            }
        }

        if !coalescer.is_empty() {
            debug!("Dropping pending events for realm {}", self.realm.name());
        }
        self.shutdown();
    }

    /// [`handle_event`](Self::handle_event) from inside the runtime.
    ///
    /// Reads, library mapping and module callbacks block, so on a
    /// multi-threaded runtime the worker hands its other tasks off first.
    fn handle_event_blocking(&mut self, event: &FileEvent) -> bool {
        let multi_thread = Handle::try_current()
            .is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread);
        if multi_thread {
            task::block_in_place(|| self.handle_event(event))
        } else {
            self.handle_event(event)
        }
    }

    /// Run the event loop on its own task
    pub fn spawn(
        self,
        events: mpsc::UnboundedReceiver<FileEvent>,
    ) -> (JoinHandle<()>, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(self.run(events, shutdown_rx));
        (task, shutdown_tx)
    }
}

impl std::fmt::Debug for RealmWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealmWatcher")
            .field("realm", &self.realm.name())
            .field("phase", &self.phase)
            .field("tracked", &self.tracked.len())
            .finish()
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

fn image_digest(image: &[u8]) -> String {
    format!("{:x}", Sha256::digest(image))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Registry name of the module at `path`: the file stem
fn module_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}
