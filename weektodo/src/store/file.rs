//! JSON-file task store.
//!
//! The whole collection lives in one file, in the same array format that
//! `export_data` produces. Writes go to a sibling temp file which is then
//! renamed over the original, so a crash mid-write leaves the previous
//! collection intact. Reads are served from an in-memory cache that is only
//! updated after the file write succeeded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use weektodo_proto::codec;
use weektodo_proto::merge::group_by_day;
use weektodo_proto::task::{Day, Task};

use super::{StoreError, TaskStore};

/// Default file name inside the data directory.
pub const TODOS_FILE: &str = "todos.json";

/// Task store backed by a single JSON file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    cache: RwLock<BTreeMap<Day, Vec<Task>>>,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens the store at `path`, loading the collection if the file exists.
    ///
    /// A missing file is an empty collection. Parent directories are created
    /// on first write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file exists but cannot be read, and
    /// [`StoreError::Serialization`] if its content is not a task array.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tasks = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => codec::decode_tasks(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), count = tasks.len(), "task file loaded");
        Ok(Self {
            path,
            cache: RwLock::new(group_by_day(tasks)),
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_file(&self, snapshot: &BTreeMap<Day, Vec<Task>>) -> Result<(), StoreError> {
        let flat: Vec<Task> = snapshot.values().flatten().cloned().collect();
        let raw = codec::export_tasks(&flat).map_err(|e| StoreError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl TaskStore for FileStore {
    async fn get_todos(&self, day: Day) -> Result<Vec<Task>, StoreError> {
        Ok(self.cache.read().get(&day).cloned().unwrap_or_default())
    }

    async fn commit(&self, batch: Vec<(Day, Vec<Task>)>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.cache.read().clone();
        for (day, todos) in batch {
            next.insert(day, todos);
        }
        self.write_file(&next).await?;
        *self.cache.write() = next;
        Ok(())
    }
}
