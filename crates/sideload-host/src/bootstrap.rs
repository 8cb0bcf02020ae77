//! Host entry point
//!
//! Discovers the host's realms once at startup and gives each one a watched
//! directory, a [`RealmWatcher`] and its own event task. The resulting
//! [`RealmRegistry`] is the only record of running watchers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sideload_kernel::{ContextDiscovery, HostLog, Log, Realm, RealmContext, RegistryBridge};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{ConfigError, HostConfig};
use crate::delivery::DeliveryGate;
use crate::realm_watcher::{InitReport, RealmWatcher};
use crate::watch::{DirectoryWatch, WatchError};

/// Host-wide errors
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Failed to create directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Capabilities the host hands to the entry point
#[derive(Clone)]
pub struct HostServices {
    pub discovery: Arc<dyn ContextDiscovery>,
    pub bridge: Arc<dyn RegistryBridge>,
    /// Host log facility; `tracing` only when absent
    pub log: Option<Arc<dyn HostLog>>,
}

impl HostServices {
    pub fn new(discovery: Arc<dyn ContextDiscovery>, bridge: Arc<dyn RegistryBridge>) -> Self {
        Self {
            discovery,
            bridge,
            log: None,
        }
    }

    pub fn with_log(mut self, log: Arc<dyn HostLog>) -> Self {
        self.log = Some(log);
        self
    }

    fn logger(&self, scope: &str) -> Log {
        match &self.log {
            Some(sink) => Log::new(scope).with_sink(sink.clone()),
            None => Log::new(scope),
        }
    }
}

/// Realms named in configuration, each watching `<sideload_root>/<name>/`
#[derive(Debug, Clone)]
pub struct ConfiguredRealms {
    root: PathBuf,
    contexts: Vec<RealmContext>,
}

impl ConfiguredRealms {
    pub fn new<P: AsRef<Path>>(root: P, names: &[String]) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            contexts: names.iter().map(|name| RealmContext::new(name.as_str())).collect(),
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(&config.sideload_root, &config.realms)
    }
}

impl ContextDiscovery for ConfiguredRealms {
    fn list_active_contexts(&self) -> Vec<RealmContext> {
        self.contexts.clone()
    }

    fn resolve_realm_name(&self, context: &RealmContext) -> Option<String> {
        self.contexts
            .contains(context)
            .then(|| context.label().to_string())
    }

    fn resolve_watch_directory(&self, realm_name: &str) -> PathBuf {
        self.root.join(realm_name)
    }
}

/// A running realm
pub struct RealmHandle {
    realm: Realm,
    report: InitReport,
    gate: Arc<DeliveryGate>,
    watch: Option<DirectoryWatch>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl RealmHandle {
    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    /// Outcome of the startup scan
    pub fn report(&self) -> InitReport {
        self.report
    }

    pub fn gate(&self) -> &Arc<DeliveryGate> {
        &self.gate
    }

    async fn stop(mut self) {
        // No more OS events once the watch is gone
        drop(self.watch.take());
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!("Realm {} task ended abnormally: {}", self.realm.name(), e);
        }
    }
}

/// Every realm started by [`bootstrap`]
#[derive(Default)]
pub struct RealmRegistry {
    realms: Vec<RealmHandle>,
}

impl RealmRegistry {
    pub fn realms(&self) -> &[RealmHandle] {
        &self.realms
    }

    pub fn len(&self) -> usize {
        self.realms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.realms.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&RealmHandle> {
        self.realms.iter().find(|handle| handle.realm.name() == name)
    }

    /// Stop every watcher and unload every module
    pub async fn shutdown(self) {
        for handle in self.realms {
            handle.stop().await;
        }
    }
}

/// Start one watcher per realm the host exposes.
///
/// A realm whose directory cannot be prepared or watched is logged and
/// skipped; the others still start.
pub async fn bootstrap(services: HostServices, config: &HostConfig) -> RealmRegistry {
    let log = services.logger("host");
    let mut registry = RealmRegistry::default();

    for context in services.discovery.list_active_contexts() {
        let Some(name) = services.discovery.resolve_realm_name(&context) else {
            debug!("Context {:?} is not a realm, skipping", context);
            continue;
        };
        let directory = services.discovery.resolve_watch_directory(&name);

        match start_realm(&services, config, Realm::new(name.as_str(), directory, context)) {
            Ok(handle) => registry.realms.push(handle),
            Err(e) => log.error(format_args!("Failed to start realm {}: {}", name, e)),
        }
    }

    registry
}

fn start_realm(
    services: &HostServices,
    config: &HostConfig,
    realm: Realm,
) -> Result<RealmHandle, HostError> {
    let log = services.logger(realm.name());

    if config.create_missing_dirs && !realm.directory().exists() {
        std::fs::create_dir_all(realm.directory()).map_err(|source| HostError::CreateDir {
            path: realm.directory().to_path_buf(),
            source,
        })?;
    }

    log.info(format_args!(
        "Realm {} found, creating watcher at {}",
        realm.name().to_uppercase(),
        realm.directory().display()
    ));

    let (gate, events) = DeliveryGate::channel();
    let mut watcher = RealmWatcher::new(
        realm.clone(),
        services.bridge.clone(),
        gate.clone(),
        config,
        log,
    );

    // Subscribe before scanning; anything seen meanwhile waits behind the gate
    let (watch, report) = {
        let _paused = gate.pause();
        let watch = DirectoryWatch::start(realm.directory(), &config.extension, gate.clone())?;
        let report = watcher.initialize();
        (watch, report)
    };

    let (task, shutdown_tx) = watcher.spawn(events);

    Ok(RealmHandle {
        realm,
        report,
        gate,
        watch: Some(watch),
        shutdown_tx,
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_realms() {
        let realms = ConfiguredRealms::new(
            "/srv/sideload",
            &["client".to_string(), "server".to_string()],
        );
        let contexts = realms.list_active_contexts();
        assert_eq!(contexts.len(), 2);
        assert_eq!(
            realms.resolve_realm_name(&contexts[0]).as_deref(),
            Some("client")
        );
        assert_eq!(
            realms.resolve_watch_directory("server"),
            PathBuf::from("/srv/sideload/server")
        );

        // A context with a matching label but a different id is not a realm
        assert_eq!(realms.resolve_realm_name(&RealmContext::new("client")), None);
    }
}
