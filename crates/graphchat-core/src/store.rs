//! Conversation persistence.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::{data_dir, Chat, ChatSummary};

pub trait ChatStore: Send + Sync {
    /// Summaries, most recently updated first.
    fn list_chats(&self) -> Result<Vec<ChatSummary>>;
    fn load_chat(&self, id: &str) -> Result<Chat>;
    fn save_chat(&self, chat: &Chat) -> Result<()>;
    /// Returns false when there was nothing to delete.
    fn delete_chat(&self, id: &str) -> Result<bool>;

    fn delete_chats(&self, ids: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for id in ids {
            if self.delete_chat(id)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

pub fn validate_chat_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidChatId(id.to_string()))
    }
}

fn sort_newest_first(summaries: &mut [ChatSummary]) {
    summaries.sort_by(|a, b| b.date.cmp(&a.date));
}

/// One JSON file per chat under a directory.
#[derive(Debug, Clone)]
pub struct FileChatStore {
    dir: PathBuf,
}

impl FileChatStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data dir>/chats/`
    pub fn open_default() -> Self {
        Self::new(data_dir().join("chats"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        validate_chat_id(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn read(path: &Path) -> Result<Chat> {
        let raw = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_str(&raw).map_err(|source| Error::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ChatStore for FileChatStore {
    fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }
        let entries = fs::read_dir(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let mut summaries: Vec<ChatSummary> = entries
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                let name = path.file_name()?.to_str()?;
                if name.starts_with('.') || !name.ends_with(".json") {
                    return None;
                }
                match Self::read(&path) {
                    Ok(chat) => Some(chat.summary()),
                    Err(err) => {
                        warn!(error = %err, "skipping unreadable chat file");
                        None
                    }
                }
            })
            .collect();
        sort_newest_first(&mut summaries);
        Ok(summaries)
    }

    fn load_chat(&self, id: &str) -> Result<Chat> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Err(Error::ChatNotFound(id.to_string()));
        }
        Self::read(&path)
    }

    /// Temp file + rename, so readers never see a half-written chat.
    fn save_chat(&self, chat: &Chat) -> Result<()> {
        let path = self.path_for(&chat.id)?;
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let json = serde_json::to_string_pretty(chat)?;
        let tmp = self.dir.join(format!(".{}.json.tmp", chat.id));
        fs::write(&tmp, json).map_err(|e| Error::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))?;
        debug!(chat_id = %chat.id, messages = chat.messages.len(), "chat saved");
        Ok(())
    }

    fn delete_chat(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
        Ok(true)
    }
}

/// Process-local store for anonymous sessions and tests.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    chats: Mutex<HashMap<String, Chat>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn chats(&self) -> std::sync::MutexGuard<'_, HashMap<String, Chat>> {
        self.chats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ChatStore for MemoryChatStore {
    fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        let mut summaries: Vec<ChatSummary> = self.chats().values().map(Chat::summary).collect();
        sort_newest_first(&mut summaries);
        Ok(summaries)
    }

    fn load_chat(&self, id: &str) -> Result<Chat> {
        self.chats()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ChatNotFound(id.to_string()))
    }

    fn save_chat(&self, chat: &Chat) -> Result<()> {
        validate_chat_id(&chat.id)?;
        self.chats().insert(chat.id.clone(), chat.clone());
        Ok(())
    }

    fn delete_chat(&self, id: &str) -> Result<bool> {
        Ok(self.chats().remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChatMessage, Role};

    #[test]
    fn ids_are_restricted_to_safe_characters() {
        assert!(validate_chat_id("0b6c1a9e-7f1d-4a63-9d1e-3f2a1b0c9d8e").is_ok());
        assert!(validate_chat_id("chat_1").is_ok());
        assert!(validate_chat_id("").is_err());
        assert!(validate_chat_id("../etc/passwd").is_err());
        assert!(validate_chat_id("a b").is_err());
    }

    #[test]
    fn memory_store_round_trip_and_bulk_delete() {
        let store = MemoryChatStore::new();
        let mut chat = Chat::new("a");
        chat.messages.push(ChatMessage::new(Role::User, "draw a login flow"));
        store.save_chat(&chat).unwrap();
        store.save_chat(&Chat::new("b")).unwrap();

        assert_eq!(store.load_chat("a").unwrap(), chat);
        assert_eq!(store.list_chats().unwrap().len(), 2);
        let deleted = store
            .delete_chats(&["a".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(matches!(store.load_chat("a"), Err(Error::ChatNotFound(_))));
    }
}
