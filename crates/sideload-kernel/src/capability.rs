//! Capability interface onto the host's module registry
//!
//! The core never touches host types directly. Everything it needs from the
//! host is expressed here:
//!
//! - [`RegistryBridge`]: adapt an image, register, look up and unregister
//! - [`LoadedModule`] / [`ModuleType`] / [`ModuleMethod`]: find a type inside a
//!   loaded module, construct it and invoke a callback by name
//!
//! Hosts implement these with whatever late binding their platform needs.

use std::any::Any;
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use crate::context::RealmContext;

/// Errors raised by host capabilities
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CapabilityError {
    /// A host-provided facility could not be located
    #[error("Capability unavailable: {0}")]
    Unavailable(String),

    /// The image could not be adapted into a form the registry accepts
    #[error("Malformed module image: {0}")]
    MalformedImage(String),

    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("Module already registered: {0}")]
    AlreadyRegistered(String),

    /// The registry refused the registration request
    #[error("Registration rejected: {0}")]
    Rejected(String),

    #[error("Stale module handle: {0}")]
    StaleHandle(HandleId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for capability operations
pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Module bytes accepted by the registry as a loadable image
#[derive(Clone, PartialEq, Eq)]
pub struct TrustedImage {
    bytes: Vec<u8>,
}

impl TrustedImage {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Debug for TrustedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustedImage")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A request to register a module image under a name
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    name: String,
    image: TrustedImage,
}

impl RegistrationRequest {
    pub fn new(name: impl Into<String>, image: TrustedImage) -> Self {
        Self {
            name: name.into(),
            image,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &TrustedImage {
        &self.image
    }

    pub fn into_parts(self) -> (String, TrustedImage) {
        (self.name, self.image)
    }
}

/// Identity of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(uuid::Uuid);

impl HandleId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to a registered module.
///
/// Only the Module Loader that received it may unregister it.
#[derive(Clone)]
pub struct ModuleHandle {
    id: HandleId,
    module: Arc<dyn LoadedModule>,
}

impl ModuleHandle {
    pub fn new(module: Arc<dyn LoadedModule>) -> Self {
        Self {
            id: HandleId::new(),
            module,
        }
    }

    /// Wrap an artifact under an id the registry already issued
    pub fn with_id(id: HandleId, module: Arc<dyn LoadedModule>) -> Self {
        Self { id, module }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn module(&self) -> &Arc<dyn LoadedModule> {
        &self.module
    }

    pub fn name(&self) -> &str {
        self.module.name()
    }
}

impl PartialEq for ModuleHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ModuleHandle {}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("id", &self.id)
            .field("name", &self.module.name())
            .finish()
    }
}

/// Adapter onto the host's module registry.
///
/// Thin by contract: implementations translate calls and hold no lifecycle
/// logic of their own.
pub trait RegistryBridge: Send + Sync {
    /// Read a module image and wrap it in the stream type the registry trusts
    fn adapt_image(&self, context: &RealmContext, source: &mut dyn Read)
    -> CapabilityResult<TrustedImage>;

    /// Register an image under the request's name and return the id the
    /// registration was issued under
    fn register(
        &self,
        context: &RealmContext,
        request: RegistrationRequest,
    ) -> CapabilityResult<HandleId>;

    /// Resolve the artifact registered under `name`.
    ///
    /// Registration does not hand the artifact back, so callers look it up
    /// right after a successful `register`.
    fn lookup(&self, context: &RealmContext, name: &str) -> CapabilityResult<ModuleHandle>;

    /// Remove the registration of `name` issued under `id`.
    ///
    /// Fails with [`CapabilityError::StaleHandle`] when `name` is live under a
    /// different id.
    fn unregister(&self, context: &RealmContext, name: &str, id: HandleId) -> CapabilityResult<()>;
}

/// A module artifact living inside the host registry
pub trait LoadedModule: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve a top-level type by name
    fn find_type(&self, type_name: &str) -> Option<Arc<dyn ModuleType>>;
}

/// A type exported by a loaded module
pub trait ModuleType: Send + Sync {
    fn name(&self) -> &str;

    /// Construct an instance with the default constructor
    fn construct(&self) -> Result<Instance, ConstructError>;

    /// Resolve a method by name, static or instance, any visibility
    fn find_method(&self, method_name: &str) -> Option<Arc<dyn ModuleMethod>>;
}

/// A callable method on a module type
pub trait ModuleMethod: Send + Sync {
    fn name(&self) -> &str;

    fn parameter_count(&self) -> usize;

    fn is_static(&self) -> bool;

    /// Call the method with no arguments.
    ///
    /// Static methods ignore `instance`.
    fn invoke(&self, instance: Option<&mut Instance>) -> Result<(), CallbackError>;
}

/// An instance constructed from a [`ModuleType`]
pub struct Instance(Box<dyn Any + Send>);

impl Instance {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.downcast_mut::<T>()
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Instance { .. }")
    }
}

/// Errors constructing a module type
#[derive(Debug, thiserror::Error)]
pub enum ConstructError {
    /// The type has no default constructor (for example a static utility type)
    #[error("Type {0} has no default constructor")]
    NoDefaultConstructor(String),

    #[error("Failed to construct {type_name}: {reason}")]
    Failed { type_name: String, reason: String },
}

/// Errors raised by a callback inside a loaded module
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("Instance method {0} called without an instance")]
    MissingInstance(String),

    #[error("Callback {method} failed: {reason}")]
    Failed { method: String, reason: String },

    #[error("Callback {method} panicked: {message}")]
    Panicked { method: String, message: String },
}
