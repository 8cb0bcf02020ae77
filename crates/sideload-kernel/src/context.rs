//! Realms and their execution-context tokens

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque token for an isolation boundary inside the host.
///
/// Every registry and type operation performed on behalf of a realm carries
/// the realm's context. Hosts may attach their own payload (for example the
/// native handle of the boundary) and recover it in their bridge.
///
/// Equality and hashing use the token's id only.
#[derive(Clone)]
pub struct RealmContext {
    id: u64,
    label: Arc<str>,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl RealmContext {
    /// Create a new context with a fresh id
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            payload: None,
        }
    }

    /// Attach a host-specific payload
    pub fn with_payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Borrow the attached payload if it has type `T`
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }
}

impl PartialEq for RealmContext {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RealmContext {}

impl Hash for RealmContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for RealmContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealmContext")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// A named isolated execution context with its own watched directory.
///
/// Created once at host startup and kept for the process lifetime.
#[derive(Debug, Clone)]
pub struct Realm {
    name: String,
    directory: PathBuf,
    context: RealmContext,
}

impl Realm {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>, context: RealmContext) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            context,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn context(&self) -> &RealmContext {
        &self.context
    }
}
