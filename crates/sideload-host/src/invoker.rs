//! Lifecycle invoker
//!
//! Finds a named type in a loaded module, constructs it when it can and calls
//! a parameterless callback on it. Nothing raised by module code escapes:
//! callback errors and panics are reported through the log.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use sideload_kernel::{CallbackError, ConstructError, LoadedModule, Log};

/// What happened to a lifecycle callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeOutcome {
    /// The callback ran to completion
    Invoked,
    /// The module has no type of that name
    MissingType,
    /// The type has no method of that name
    MissingMethod,
    /// The method takes parameters and was not called
    RejectedSignature,
}

/// Failures raised by module code
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Failed to construct {module}.{type_name}: {source}")]
    Construct {
        module: String,
        type_name: String,
        #[source]
        source: ConstructError,
    },

    #[error("Callback {module}.{type_name}.{method} failed: {source}")]
    Callback {
        module: String,
        type_name: String,
        method: String,
        #[source]
        source: CallbackError,
    },
}

/// Runs lifecycle callbacks inside loaded modules
#[derive(Debug, Clone)]
pub struct LifecycleInvoker {
    log: Log,
}

impl LifecycleInvoker {
    pub fn new(log: Log) -> Self {
        Self { log }
    }

    /// Call `type_name.method_name` on `module`.
    ///
    /// A missing type is an error in the log, a missing method a warning, and
    /// a method with parameters an error; none of these are returned as `Err`.
    /// `Err` means module code itself failed, and it has already been logged.
    pub fn invoke(
        &self,
        module: &dyn LoadedModule,
        type_name: &str,
        method_name: &str,
    ) -> Result<InvokeOutcome, InvokeError> {
        let module_name = module.name();

        let Some(ty) = module.find_type(type_name) else {
            self.log.error(format_args!(
                "Type {} does not exist in module {}!",
                type_name, module_name
            ));
            return Ok(InvokeOutcome::MissingType);
        };

        // Types without a default constructor only get their static methods called
        let mut instance = match guarded(|| ty.construct()) {
            Ok(Ok(instance)) => Some(instance),
            Ok(Err(ConstructError::NoDefaultConstructor(_))) => None,
            Ok(Err(source)) => {
                return Err(self.report(InvokeError::Construct {
                    module: module_name.to_string(),
                    type_name: type_name.to_string(),
                    source,
                }));
            }
            Err(message) => {
                return Err(self.report(InvokeError::Construct {
                    module: module_name.to_string(),
                    type_name: type_name.to_string(),
                    source: ConstructError::Failed {
                        type_name: type_name.to_string(),
                        reason: format!("constructor panicked: {}", message),
                    },
                }));
            }
        };

        let Some(method) = ty.find_method(method_name) else {
            self.log.warning(format_args!(
                "Failed to find method {}.{}.{}.",
                module_name, type_name, method_name
            ));
            return Ok(InvokeOutcome::MissingMethod);
        };

        if method.parameter_count() != 0 {
            self.log.error(format_args!(
                "{}.{}.{} cannot have any parameters!",
                module_name, type_name, method_name
            ));
            return Ok(InvokeOutcome::RejectedSignature);
        }

        let target = if method.is_static() {
            None
        } else {
            instance.as_mut()
        };

        let result = match guarded(|| method.invoke(target)) {
            Ok(result) => result,
            Err(message) => Err(CallbackError::Panicked {
                method: method_name.to_string(),
                message,
            }),
        };

        match result {
            Ok(()) => {
                tracing::debug!("Invoked {}.{}.{}", module_name, type_name, method_name);
                Ok(InvokeOutcome::Invoked)
            }
            Err(source) => Err(self.report(InvokeError::Callback {
                module: module_name.to_string(),
                type_name: type_name.to_string(),
                method: method_name.to_string(),
                source,
            })),
        }
    }

    fn report(&self, error: InvokeError) -> InvokeError {
        self.log.error(&error);
        error
    }
}

/// Run module code, turning a panic into its message
fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
