//! Realm discovery

use std::path::PathBuf;

use crate::context::RealmContext;

/// How a host exposes its isolated execution contexts.
///
/// Implementations are environment-specific lookups; the host entry point
/// calls them once at startup.
pub trait ContextDiscovery: Send + Sync {
    /// Every context currently active in the host
    fn list_active_contexts(&self) -> Vec<RealmContext>;

    /// Name of the realm running in `context`, or `None` if it is not a realm
    fn resolve_realm_name(&self, context: &RealmContext) -> Option<String>;

    /// Directory watched for the named realm
    fn resolve_watch_directory(&self, realm_name: &str) -> PathBuf;
}
