//! Directory watch backed by `notify`
//!
//! Translates raw filesystem notifications for one realm directory into
//! [`FileEvent`]s and offers them to the realm's [`DeliveryGate`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
};
use tracing::{debug, info, warn};

use crate::delivery::{DeliveryGate, FileEvent, FileEventKind};

/// Watch errors
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Watch directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("Watch error: {0}")]
    Notify(#[from] notify::Error),
}

/// Live subscription to one directory.
///
/// Dropping it stops event delivery from the OS.
pub struct DirectoryWatch {
    directory: PathBuf,
    _watcher: RecommendedWatcher,
}

impl DirectoryWatch {
    /// Subscribe to create/modify/remove events for `*.<extension>` files
    pub fn start(
        directory: &Path,
        extension: &str,
        gate: Arc<DeliveryGate>,
    ) -> Result<Self, WatchError> {
        if !directory.is_dir() {
            return Err(WatchError::MissingDirectory(directory.to_path_buf()));
        }

        let filter = extension.to_string();
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    for file_event in translate(&event, &filter) {
                        if !gate.offer(file_event) {
                            debug!("Realm event loop is gone, dropping event");
                        }
                    }
                }
                Err(e) => warn!("Filesystem watch error: {}", e),
            },
            Config::default(),
        )?;
        watcher.watch(directory, RecursiveMode::NonRecursive)?;

        info!("Watching {:?} for *.{} files", directory, extension);

        Ok(Self {
            directory: directory.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}

/// Map one notify event onto module file events
pub fn translate(event: &Event, extension: &str) -> Vec<FileEvent> {
    let kind_for = |path: &Path| -> Option<FileEventKind> {
        match event.kind {
            EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => None,
            EventKind::Create(_) => Some(FileEventKind::Created),
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                Some(FileEventKind::Modified)
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(FileEventKind::Removed),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(FileEventKind::Created),
            EventKind::Modify(ModifyKind::Name(_)) => {
                if path.exists() {
                    Some(FileEventKind::Created)
                } else {
                    Some(FileEventKind::Removed)
                }
            }
            EventKind::Remove(_) => Some(FileEventKind::Removed),
            _ => None,
        }
    };

    // A rename reported with both paths: the first is the old name
    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        if let [from, to] = event.paths.as_slice() {
            return [
                (FileEventKind::Removed, from),
                (FileEventKind::Created, to),
            ]
            .into_iter()
            .filter(|(_, path)| has_extension(path, extension))
            .map(|(kind, path)| FileEvent::new(kind, path.clone()))
            .collect();
        }
    }

    event
        .paths
        .iter()
        .filter(|path| has_extension(path, extension))
        .filter_map(|path| kind_for(path.as_path()).map(|kind| FileEvent::new(kind, path.clone())))
        .collect()
}
