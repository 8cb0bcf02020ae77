//! Module loader
//!
//! Owns the registration of exactly one named module in one realm. A loader
//! is armed with a byte source, turns it into a registration through the
//! [`RegistryBridge`], and keeps the resulting handle until it is unloaded.

use std::io::Read;
use std::sync::Arc;

use sideload_kernel::{
    CapabilityError, HandleId, Log, ModuleHandle, RealmContext, RegistrationRequest, RegistryBridge,
};

/// Loader construction errors
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Module name must not be empty")]
    EmptyName,
}

/// Reasons a load attempt produced no module
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("No pending source for module {0}")]
    NoSource(String),

    #[error("Failed to adapt image: {0}")]
    Adapt(#[source] CapabilityError),

    #[error("Failed to register module: {0}")]
    Register(#[source] CapabilityError),

    #[error("Failed to resolve registered module: {0}")]
    Lookup(#[source] CapabilityError),
}

/// Registration owner for one module file
pub struct ModuleLoader {
    name: String,
    context: RealmContext,
    bridge: Arc<dyn RegistryBridge>,
    log: Log,
    /// Consumed by the next load attempt
    pending: Option<Box<dyn Read + Send>>,
    current: Option<ModuleHandle>,
}

impl ModuleLoader {
    pub fn new(
        name: impl Into<String>,
        context: RealmContext,
        bridge: Arc<dyn RegistryBridge>,
        log: Log,
    ) -> Result<Self, LoaderError> {
        let name = name.into();
        if name.is_empty() {
            return Err(LoaderError::EmptyName);
        }
        Ok(Self {
            name,
            context,
            bridge,
            log,
            pending: None,
            current: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &RealmContext {
        &self.context
    }

    /// Handle of the live registration, if any
    pub fn current(&self) -> Option<&ModuleHandle> {
        self.current.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.current.is_some()
    }

    pub fn has_pending_source(&self) -> bool {
        self.pending.is_some()
    }

    /// Arm the next load with a fresh source, dropping any unconsumed one
    pub fn replace_source<R: Read + Send + 'static>(&mut self, source: R) {
        self.pending = Some(Box::new(source));
    }

    /// Load the pending source, reporting why nothing was loaded.
    ///
    /// Any live registration is released first, so at most one registration
    /// per loader exists at any time. A registration that cannot be resolved
    /// afterwards is released again before the error is returned. The source
    /// is consumed whether or not the attempt succeeds.
    pub fn try_load(&mut self) -> Result<ModuleHandle, LoadError> {
        if self.current.is_some() {
            self.unload();
        }

        let mut source = self
            .pending
            .take()
            .ok_or_else(|| LoadError::NoSource(self.name.clone()))?;

        let image = self
            .bridge
            .adapt_image(&self.context, &mut source)
            .map_err(LoadError::Adapt)?;
        drop(source);

        let id = self
            .bridge
            .register(&self.context, RegistrationRequest::new(self.name.clone(), image))
            .map_err(LoadError::Register)?;

        let handle = match self.bridge.lookup(&self.context, &self.name) {
            Ok(handle) if handle.id() == id => handle,
            Ok(handle) => {
                self.release(id);
                return Err(LoadError::Lookup(CapabilityError::StaleHandle(handle.id())));
            }
            Err(e) => {
                self.release(id);
                return Err(LoadError::Lookup(e));
            }
        };

        self.current = Some(handle.clone());
        Ok(handle)
    }

    /// Load the pending source.
    ///
    /// Failures are logged and yield `None`; the loader is left unloaded.
    pub fn load(&mut self) -> Option<ModuleHandle> {
        match self.try_load() {
            Ok(handle) => Some(handle),
            Err(e) => {
                self.log
                    .error(format_args!("Could not load module {}: {}", self.name, e));
                None
            }
        }
    }

    /// Release the live registration. A no-op when nothing is loaded.
    ///
    /// The handle is forgotten even if the registry refuses the request.
    pub fn unload(&mut self) {
        let Some(handle) = self.current.take() else {
            return;
        };
        self.release(handle.id());
    }

    fn release(&self, id: HandleId) {
        if let Err(e) = self.bridge.unregister(&self.context, &self.name, id) {
            self.log
                .error(format_args!("Failed to unregister module {}: {}", self.name, e));
        }
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("current", &self.current)
            .field("has_pending_source", &self.pending.is_some())
            .finish()
    }
}
