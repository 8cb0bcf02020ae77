//! Sideload host
//!
//! Watches one directory per realm and hot-loads the module files dropped
//! into it:
//!
//! - [`loader`]: one registration per module file, through the host's
//!   [`RegistryBridge`](sideload_kernel::RegistryBridge)
//! - [`invoker`]: `OnLoad` / `OnReload` lifecycle callbacks
//! - [`realm_watcher`]: the per-realm load/reload/unload state machine
//! - [`bootstrap`]: discovers realms and starts a watcher for each
//! - [`native`]: a registry for shared-library modules

pub mod bootstrap;
pub mod config;
pub mod delivery;
pub mod invoker;
pub mod loader;
pub mod logging;
pub mod native;
pub mod realm_watcher;
pub mod watch;

pub use bootstrap::{
    ConfiguredRealms, HostError, HostServices, RealmHandle, RealmRegistry, bootstrap,
};
pub use config::{ConfigError, HostConfig};
pub use delivery::{DeliveryGate, FileEvent, FileEventKind, PausedDelivery};
pub use invoker::{InvokeError, InvokeOutcome, LifecycleInvoker};
pub use loader::{LoadError, LoaderError, ModuleLoader};
pub use native::NativeRegistry;
pub use realm_watcher::{FileIdentity, InitReport, RealmWatcher, TrackedState, WatcherPhase};
pub use watch::{DirectoryWatch, WatchError};
