//! Best-effort logging into the host
//!
//! Lifecycle messages go to two places: a `tracing` event (always) and the
//! host's own log facility (when one is attached). The host facility is
//! fire-and-forget; if it is unavailable the message is dropped and the
//! operation being logged carries on.

use std::fmt;
use std::sync::Arc;

/// Severity of a host log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// The host's log facility could not take the message
#[derive(Debug, thiserror::Error)]
#[error("Host log unavailable: {0}")]
pub struct LogUnavailable(pub String);

/// Log facility exposed by the host
pub trait HostLog: Send + Sync {
    fn write(&self, level: LogLevel, message: &str) -> Result<(), LogUnavailable>;
}

/// Scoped logger used by the lifecycle engine
#[derive(Clone)]
pub struct Log {
    scope: Arc<str>,
    sink: Option<Arc<dyn HostLog>>,
}

impl Log {
    /// Create a logger that only emits `tracing` events
    pub fn new(scope: impl Into<Arc<str>>) -> Self {
        Self {
            scope: scope.into(),
            sink: None,
        }
    }

    /// Forward every message to the host facility as well
    pub fn with_sink(mut self, sink: Arc<dyn HostLog>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Same sink, different scope
    pub fn scoped(&self, scope: impl Into<Arc<str>>) -> Self {
        Self {
            scope: scope.into(),
            sink: self.sink.clone(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.emit(LogLevel::Info, message.to_string());
    }

    pub fn warning(&self, message: impl fmt::Display) {
        self.emit(LogLevel::Warning, message.to_string());
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.emit(LogLevel::Error, message.to_string());
    }

    fn emit(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => tracing::info!(realm = %self.scope, "{}", message),
            LogLevel::Warning => tracing::warn!(realm = %self.scope, "{}", message),
            LogLevel::Error => tracing::error!(realm = %self.scope, "{}", message),
        }

        if let Some(sink) = &self.sink {
            let _ = sink.write(level, &message);
        }
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log")
            .field("scope", &self.scope)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}
