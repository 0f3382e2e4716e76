//! Facts remembered about the user across conversations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::data_dir;

/// Most memories `list_memories` returns.
pub const MEMORY_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Memory {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

pub trait MemoryStore: Send + Sync {
    /// Newest first, at most [`MEMORY_LIST_LIMIT`].
    fn list_memories(&self) -> Result<Vec<Memory>>;
    fn save_memory(&self, content: &str) -> Result<Memory>;
    /// Returns false when there was nothing to delete.
    fn delete_memory(&self, id: &str) -> Result<bool>;
    /// Forget everything. Returns how many memories were removed.
    fn delete_memories(&self) -> Result<usize>;
}

fn newest_first(mut memories: Vec<Memory>) -> Vec<Memory> {
    memories.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    memories.truncate(MEMORY_LIST_LIMIT);
    memories
}

fn checked(content: &str) -> Result<Memory> {
    let content = content.trim();
    if content.is_empty() {
        return Err(Error::EmptyMemory);
    }
    Ok(Memory::new(content))
}

/// Process-local memories, lost on exit.
#[derive(Debug, Default)]
pub struct LocalMemoryStore {
    memories: Mutex<Vec<Memory>>,
}

impl LocalMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn memories(&self) -> MutexGuard<'_, Vec<Memory>> {
        self.memories.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MemoryStore for LocalMemoryStore {
    fn list_memories(&self) -> Result<Vec<Memory>> {
        Ok(newest_first(self.memories().clone()))
    }

    fn save_memory(&self, content: &str) -> Result<Memory> {
        let memory = checked(content)?;
        self.memories().push(memory.clone());
        Ok(memory)
    }

    fn delete_memory(&self, id: &str) -> Result<bool> {
        let mut memories = self.memories();
        let before = memories.len();
        memories.retain(|m| m.id != id);
        Ok(memories.len() != before)
    }

    fn delete_memories(&self) -> Result<usize> {
        Ok(self.memories().drain(..).count())
    }
}

/// All memories in one JSON file, rewritten on every change.
#[derive(Debug)]
pub struct FileMemoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileMemoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<data dir>/memories.json`
    pub fn open_default() -> Self {
        Self::new(data_dir().join("memories.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> Result<Vec<Memory>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| Error::io(&self.path, e))?;
        serde_json::from_str(&raw).map_err(|source| Error::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write(&self, memories: &[Memory]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }
        let json = serde_json::to_string_pretty(memories)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| Error::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| Error::io(&self.path, e))?;
        debug!(count = memories.len(), "memories saved");
        Ok(())
    }
}

impl MemoryStore for FileMemoryStore {
    fn list_memories(&self) -> Result<Vec<Memory>> {
        let _guard = self.guard();
        Ok(newest_first(self.read()?))
    }

    fn save_memory(&self, content: &str) -> Result<Memory> {
        let memory = checked(content)?;
        let _guard = self.guard();
        let mut memories = self.read()?;
        memories.push(memory.clone());
        self.write(&memories)?;
        Ok(memory)
    }

    fn delete_memory(&self, id: &str) -> Result<bool> {
        let _guard = self.guard();
        let mut memories = self.read()?;
        let before = memories.len();
        memories.retain(|m| m.id != id);
        if memories.len() == before {
            return Ok(false);
        }
        self.write(&memories)?;
        Ok(true)
    }

    fn delete_memories(&self) -> Result<usize> {
        let _guard = self.guard();
        let count = self.read()?.len();
        if count > 0 {
            self.write(&[])?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn aged(content: &str, minutes_ago: i64) -> Memory {
        Memory {
            created_at: Utc::now() - Duration::minutes(minutes_ago),
            ..Memory::new(content)
        }
    }

    #[test]
    fn newest_memories_come_first() {
        let store = LocalMemoryStore::new();
        store.memories().extend([aged("old", 30), aged("new", 1), aged("middle", 10)]);

        let contents: Vec<String> = store
            .list_memories()
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, ["new", "middle", "old"]);
    }

    #[test]
    fn listing_is_capped() {
        let store = LocalMemoryStore::new();
        store
            .memories()
            .extend((0..MEMORY_LIST_LIMIT as i64 + 5).map(|i| aged("fact", i)));
        assert_eq!(store.list_memories().unwrap().len(), MEMORY_LIST_LIMIT);
    }

    #[test]
    fn blank_memories_are_rejected() {
        let store = LocalMemoryStore::new();
        assert!(matches!(store.save_memory("  \n"), Err(Error::EmptyMemory)));
        assert_eq!(store.save_memory("  likes dark mode ").unwrap().content, "likes dark mode");
    }

    #[test]
    fn single_and_bulk_delete() {
        let store = LocalMemoryStore::new();
        let kept = store.save_memory("works in Berlin").unwrap();
        let dropped = store.save_memory("prefers outlines").unwrap();

        assert!(store.delete_memory(&dropped.id).unwrap());
        assert!(!store.delete_memory(&dropped.id).unwrap());
        assert_eq!(store.list_memories().unwrap(), vec![kept]);

        store.save_memory("uses vim").unwrap();
        assert_eq!(store.delete_memories().unwrap(), 2);
        assert!(store.list_memories().unwrap().is_empty());
        assert_eq!(store.delete_memories().unwrap(), 0);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memories.json");

        let store = FileMemoryStore::new(&path);
        assert!(store.list_memories().unwrap().is_empty());
        let first = store.save_memory("team of five").unwrap();
        store.save_memory("ships on Fridays").unwrap();

        let reopened = FileMemoryStore::new(&path);
        assert_eq!(reopened.list_memories().unwrap().len(), 2);
        assert!(reopened.delete_memory(&first.id).unwrap());
        assert_eq!(reopened.delete_memories().unwrap(), 1);
        assert!(store.list_memories().unwrap().is_empty());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_memory_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memories.json");
        fs::write(&path, "{ not json").unwrap();

        let store = FileMemoryStore::new(&path);
        assert!(matches!(store.list_memories(), Err(Error::Corrupt { .. })));
    }
}
