//! Conversation storage - records keyed by conversation id with a
//! `(user, role)` uniqueness index.
//!
//! The pair index key is `"{user_id}:{role_id}"`, so a prefix scan on
//! `"{user_id}:"` lists all of a user's conversations.
//! `get_or_insert_with_seed_raw` performs the lookup, the insert, and the
//! seed log entry in a single write transaction, which is the serialization
//! point that keeps concurrent creation races down to exactly one stored
//! conversation per pair and never exposes a conversation without its seed.

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

use crate::chat_log::{CHAT_LOG_SEQ_TABLE, CHAT_LOG_TABLE, log_key};

const CONVERSATIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("conversations");
/// Index: "user_id:role_id" -> conversation_id
const PAIR_INDEX_TABLE: TableDefinition<&str, &str> = TableDefinition::new("conversation_pairs");

/// Outcome of an atomic create-if-absent on a `(user, role)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairInsert {
    /// The record was inserted under the caller's conversation id.
    Created(String),
    /// Another conversation already owns the pair; its id is returned.
    Existing(String),
}

/// Low-level conversation storage with byte-level API.
#[derive(Debug, Clone)]
pub struct ConversationStorage {
    db: Arc<Database>,
}

impl ConversationStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(CONVERSATIONS_TABLE)?;
        write_txn.open_table(PAIR_INDEX_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Store (or overwrite) a conversation record.
    pub fn put_raw(&self, conversation_id: &str, data: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CONVERSATIONS_TABLE)?;
            table.insert(conversation_id, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get a conversation record by id.
    pub fn get_raw(&self, conversation_id: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONVERSATIONS_TABLE)?;

        if let Some(data) = table.get(conversation_id)? {
            Ok(Some(data.value().to_vec()))
        } else {
            Ok(None)
        }
    }

    /// Atomically insert a conversation for a `(user, role)` pair, together
    /// with its seed message as log entry 0.
    ///
    /// Record, pair index, sequence counter and the seed commit in one write
    /// transaction: a conversation is either fully created (seed included) or
    /// not visible at all. If the pair is already taken, nothing is written
    /// and the existing conversation id is returned, so the loser of a
    /// creation race adopts the winner's record.
    pub fn get_or_insert_with_seed_raw(
        &self,
        pair_key: &str,
        conversation_id: &str,
        data: &[u8],
        seed: &[u8],
    ) -> Result<PairInsert> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut pairs = write_txn.open_table(PAIR_INDEX_TABLE)?;
            let existing = pairs.get(pair_key)?.map(|v| v.value().to_string());

            match existing {
                Some(id) => PairInsert::Existing(id),
                None => {
                    pairs.insert(pair_key, conversation_id)?;
                    let mut table = write_txn.open_table(CONVERSATIONS_TABLE)?;
                    table.insert(conversation_id, data)?;

                    let mut seq_table = write_txn.open_table(CHAT_LOG_SEQ_TABLE)?;
                    seq_table.insert(conversation_id, 0u64)?;
                    let mut log = write_txn.open_table(CHAT_LOG_TABLE)?;
                    log.insert(log_key(conversation_id, 0).as_str(), seed)?;

                    PairInsert::Created(conversation_id.to_string())
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Find the conversation record owning a `(user, role)` pair, if any.
    pub fn find_by_pair_raw(&self, pair_key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let pairs = read_txn.open_table(PAIR_INDEX_TABLE)?;

        let Some(id) = pairs.get(pair_key)?.map(|v| v.value().to_string()) else {
            return Ok(None);
        };

        let table = read_txn.open_table(CONVERSATIONS_TABLE)?;
        Ok(table.get(id.as_str())?.map(|data| data.value().to_vec()))
    }

    /// List all conversation records whose pair key starts with the prefix
    /// (`"{user_id}:"` lists a user's conversations).
    pub fn list_by_pair_prefix_raw(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let pairs = read_txn.open_table(PAIR_INDEX_TABLE)?;
        let table = read_txn.open_table(CONVERSATIONS_TABLE)?;

        let mut records = Vec::new();
        let mut iter = pairs.range(prefix..)?;
        while let Some(entry) = iter.next() {
            let (key, value) = entry?;
            if !key.value().starts_with(prefix) {
                break;
            }
            if let Some(data) = table.get(value.value())? {
                records.push(data.value().to_vec());
            }
        }

        Ok(records)
    }

    /// Delete a conversation record and release its pair key.
    ///
    /// Returns true when a record existed.
    pub fn delete(&self, conversation_id: &str, pair_key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(CONVERSATIONS_TABLE)?;
            let existed = table.remove(conversation_id)?.is_some();

            let mut pairs = write_txn.open_table(PAIR_INDEX_TABLE)?;
            // Only release the pair if it still points at this conversation.
            let owns_pair = pairs
                .get(pair_key)?
                .map(|v| v.value() == conversation_id)
                .unwrap_or(false);
            if owns_pair {
                pairs.remove(pair_key)?;
            }
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_storage() -> (tempfile::TempDir, ConversationStorage) {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Arc::new(Database::create(db_path).unwrap());
        let storage = ConversationStorage::new(db).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_put_and_get_raw() {
        let (_tmp, storage) = test_storage();

        storage.put_raw("conv-1", b"record").unwrap();
        assert_eq!(storage.get_raw("conv-1").unwrap().unwrap(), b"record");
        assert!(storage.get_raw("conv-2").unwrap().is_none());
    }

    #[test]
    fn test_get_or_insert_is_first_writer_wins() {
        let (_tmp, storage) = test_storage();

        let first = storage
            .get_or_insert_with_seed_raw("1:5", "conv-a", b"a", b"seed-a")
            .unwrap();
        assert_eq!(first, PairInsert::Created("conv-a".to_string()));

        let second = storage
            .get_or_insert_with_seed_raw("1:5", "conv-b", b"b", b"seed-b")
            .unwrap();
        assert_eq!(second, PairInsert::Existing("conv-a".to_string()));

        // The loser's record was never stored.
        assert!(storage.get_raw("conv-b").unwrap().is_none());
        assert_eq!(
            storage.find_by_pair_raw("1:5").unwrap().unwrap(),
            b"a".to_vec()
        );
    }

    #[test]
    fn test_creation_writes_seed_in_same_transaction() {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(Database::create(temp_dir.path().join("test.db")).unwrap());
        let storage = ConversationStorage::new(db.clone()).unwrap();
        let log = crate::ChatLogStorage::new(db).unwrap();

        storage
            .get_or_insert_with_seed_raw("1:5", "conv-a", b"a", b"seed")
            .unwrap();

        // The seed is log entry 0 and the counter continues from it.
        assert_eq!(log.read_all_raw("conv-a").unwrap(), vec![b"seed".to_vec()]);
        assert_eq!(log.append_raw("conv-a", b"next").unwrap(), 1);

        // A losing insert leaves no log entries behind.
        storage
            .get_or_insert_with_seed_raw("1:5", "conv-b", b"b", b"other")
            .unwrap();
        assert!(log.read_all_raw("conv-b").unwrap().is_empty());
    }

    #[test]
    fn test_list_by_pair_prefix() {
        let (_tmp, storage) = test_storage();

        storage
            .get_or_insert_with_seed_raw("1:5", "conv-a", b"a", b"s")
            .unwrap();
        storage
            .get_or_insert_with_seed_raw("1:7", "conv-b", b"b", b"s")
            .unwrap();
        storage
            .get_or_insert_with_seed_raw("12:5", "conv-c", b"c", b"s")
            .unwrap();

        let user1 = storage.list_by_pair_prefix_raw("1:").unwrap();
        assert_eq!(user1.len(), 2);
    }

    #[test]
    fn test_delete_releases_pair() {
        let (_tmp, storage) = test_storage();

        storage
            .get_or_insert_with_seed_raw("1:5", "conv-a", b"a", b"s")
            .unwrap();
        assert!(storage.delete("conv-a", "1:5").unwrap());
        assert!(storage.find_by_pair_raw("1:5").unwrap().is_none());

        // The pair can be claimed again.
        let again = storage
            .get_or_insert_with_seed_raw("1:5", "conv-b", b"b", b"s")
            .unwrap();
        assert_eq!(again, PairInsert::Created("conv-b".to_string()));
    }
}
