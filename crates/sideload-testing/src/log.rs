//! In-memory host log

use std::sync::Arc;

use parking_lot::Mutex;
use sideload_kernel::{HostLog, Log, LogLevel, LogUnavailable};

/// Records every line written through it
#[derive(Default)]
pub struct RecordingLog {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl RecordingLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A scoped [`Log`] that writes into this recorder
    pub fn log(self: &Arc<Self>, scope: &str) -> Log {
        Log::new(scope).with_sink(self.clone())
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().clone()
    }

    pub fn count(&self, level: LogLevel) -> usize {
        self.lines.lock().iter().filter(|(l, _)| *l == level).count()
    }

    /// Lines at `level` containing `needle`, case-insensitively
    pub fn count_containing(&self, level: LogLevel, needle: &str) -> usize {
        let needle = needle.to_lowercase();
        self.lines
            .lock()
            .iter()
            .filter(|(l, message)| *l == level && message.to_lowercase().contains(&needle))
            .count()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl HostLog for RecordingLog {
    fn write(&self, level: LogLevel, message: &str) -> Result<(), LogUnavailable> {
        self.lines.lock().push((level, message.to_string()));
        Ok(())
    }
}
