//! Sideload kernel
//!
//! Types shared between a hot-loading host and the modules it loads:
//!
//! - [`Realm`] and [`RealmContext`]: the isolated execution contexts modules
//!   are registered into
//! - [`RegistryBridge`] and the capability traits used to reach into loaded code
//! - [`ContextDiscovery`]: how a host enumerates its realms
//! - [`Log`] / [`HostLog`]: best-effort logging into the host
//! - [`abi`]: the C ABI a native module exports

// abi module
pub mod abi;

// capability module
pub mod capability;
pub use capability::*;

// context module
pub mod context;
pub use context::{Realm, RealmContext};

// discovery module
pub mod discovery;
pub use discovery::ContextDiscovery;

// logging module
pub mod log;
pub use log::{HostLog, Log, LogLevel, LogUnavailable};
