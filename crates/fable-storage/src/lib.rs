//! Fable Storage - byte-level persistence for conversation data.
//!
//! This crate provides the durable layer for the chat backend, using redb as
//! the embedded database. It exposes byte-level APIs only: records are opaque
//! blobs, and the typed codec lives in the fable-chat crate. This keeps the
//! storage crate free of message-model dependencies.
//!
//! # Tables
//!
//! - `chat_log` / `chat_log_seq` - append-only per-conversation message log
//! - `conversations` / `conversation_pairs` - conversation records plus the
//!   `(user, role)` uniqueness index

pub mod chat_log;
pub mod conversation;

use anyhow::Result;
use redb::Database;
use std::path::Path;
use std::sync::Arc;

pub use chat_log::ChatLogStorage;
pub use conversation::{ConversationStorage, PairInsert};

/// Central storage manager that initializes all storage subsystems.
pub struct Storage {
    db: Arc<Database>,
    pub chat_log: ChatLogStorage,
    pub conversations: ConversationStorage,
}

impl Storage {
    /// Open (or create) the database at the given path and initialize all
    /// required tables.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let db = Arc::new(Database::create(path)?);
        Self::with_db(db)
    }

    /// Build a storage manager on top of an existing database handle.
    pub fn with_db(db: Arc<Database>) -> Result<Self> {
        let chat_log = ChatLogStorage::new(db.clone())?;
        let conversations = ConversationStorage::new(db.clone())?;

        Ok(Self {
            db,
            chat_log,
            conversations,
        })
    }

    /// Get a reference to the underlying database.
    pub fn get_db(&self) -> Arc<Database> {
        self.db.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_storage_initializes_all_tables() {
        let temp_dir = tempdir().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.db")).unwrap();

        storage.chat_log.append_raw("c1", b"hello").unwrap();
        assert_eq!(storage.chat_log.count("c1").unwrap(), 1);
    }
}
