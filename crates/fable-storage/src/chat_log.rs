//! Chat log storage - append-only per-conversation message log.
//!
//! Each message is stored under a composite key `"{conversation_id}:{seq}"`
//! where `seq` is a zero-padded per-conversation sequence number. A prefix
//! range scan therefore returns a conversation's messages in append order,
//! and ties on wall-clock timestamps are broken by insertion order.

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::sync::Arc;

pub(crate) const CHAT_LOG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("chat_log");
pub(crate) const CHAT_LOG_SEQ_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("chat_log_seq");

/// Low-level chat log storage with byte-level API.
#[derive(Debug, Clone)]
pub struct ChatLogStorage {
    db: Arc<Database>,
}

pub(crate) fn log_key(conversation_id: &str, seq: u64) -> String {
    format!("{conversation_id}:{seq:020}")
}

fn log_prefix(conversation_id: &str) -> String {
    format!("{conversation_id}:")
}

impl ChatLogStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(CHAT_LOG_TABLE)?;
        write_txn.open_table(CHAT_LOG_SEQ_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Durably append a record to the end of a conversation's log.
    ///
    /// Returns the assigned sequence number. The sequence counter and the
    /// record are written in one transaction, so a failure leaves no gap.
    pub fn append_raw(&self, conversation_id: &str, data: &[u8]) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        let seq = {
            let mut seq_table = write_txn.open_table(CHAT_LOG_SEQ_TABLE)?;
            let seq = seq_table
                .get(conversation_id)?
                .map(|v| v.value() + 1)
                .unwrap_or(0);
            seq_table.insert(conversation_id, seq)?;

            let mut log = write_txn.open_table(CHAT_LOG_TABLE)?;
            log.insert(log_key(conversation_id, seq).as_str(), data)?;
            seq
        };
        write_txn.commit()?;
        Ok(seq)
    }

    /// Read all records of a conversation in append order.
    ///
    /// Returns an empty vector for an unknown or empty conversation.
    pub fn read_all_raw(&self, conversation_id: &str) -> Result<Vec<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CHAT_LOG_TABLE)?;

        let prefix = log_prefix(conversation_id);
        let mut records = Vec::new();
        let mut iter = table.range(prefix.as_str()..)?;
        while let Some(entry) = iter.next() {
            let (key, value) = entry?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            records.push(value.value().to_vec());
        }

        Ok(records)
    }

    /// Number of records in a conversation's log.
    pub fn count(&self, conversation_id: &str) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CHAT_LOG_TABLE)?;

        let prefix = log_prefix(conversation_id);
        let mut count = 0;
        let mut iter = table.range(prefix.as_str()..)?;
        while let Some(entry) = iter.next() {
            let (key, _) = entry?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            count += 1;
        }

        Ok(count)
    }

    /// Remove a conversation's entire log and its sequence counter.
    ///
    /// Used by account/data deletion flows only; a conversation reset leaves
    /// the log untouched. Returns the number of records removed.
    pub fn delete_all(&self, conversation_id: &str) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut log = write_txn.open_table(CHAT_LOG_TABLE)?;

            let prefix = log_prefix(conversation_id);
            let mut keys = Vec::new();
            {
                let mut iter = log.range(prefix.as_str()..)?;
                while let Some(entry) = iter.next() {
                    let (key, _) = entry?;
                    if !key.value().starts_with(&prefix) {
                        break;
                    }
                    keys.push(key.value().to_string());
                }
            }
            for key in &keys {
                log.remove(key.as_str())?;
            }

            let mut seq_table = write_txn.open_table(CHAT_LOG_SEQ_TABLE)?;
            seq_table.remove(conversation_id)?;
            keys.len()
        };
        write_txn.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_storage() -> (tempfile::TempDir, ChatLogStorage) {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Arc::new(Database::create(db_path).unwrap());
        let storage = ChatLogStorage::new(db).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_append_assigns_increasing_sequence() {
        let (_tmp, storage) = test_storage();

        assert_eq!(storage.append_raw("conv-1", b"a").unwrap(), 0);
        assert_eq!(storage.append_raw("conv-1", b"b").unwrap(), 1);
        assert_eq!(storage.append_raw("conv-2", b"x").unwrap(), 0);
    }

    #[test]
    fn test_read_all_preserves_append_order() {
        let (_tmp, storage) = test_storage();

        for i in 0..25u8 {
            storage.append_raw("conv-1", &[i]).unwrap();
        }
        // Interleave another conversation; it must not leak into conv-1.
        storage.append_raw("conv-10", b"other").unwrap();

        let records = storage.read_all_raw("conv-1").unwrap();
        assert_eq!(records.len(), 25);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.as_slice(), &[i as u8]);
        }
    }

    #[test]
    fn test_read_unknown_conversation_is_empty() {
        let (_tmp, storage) = test_storage();
        assert!(storage.read_all_raw("missing").unwrap().is_empty());
        assert_eq!(storage.count("missing").unwrap(), 0);
    }

    #[test]
    fn test_delete_all_removes_log_and_counter() {
        let (_tmp, storage) = test_storage();

        storage.append_raw("conv-1", b"a").unwrap();
        storage.append_raw("conv-1", b"b").unwrap();
        storage.append_raw("conv-2", b"keep").unwrap();

        let removed = storage.delete_all("conv-1").unwrap();
        assert_eq!(removed, 2);
        assert!(storage.read_all_raw("conv-1").unwrap().is_empty());
        assert_eq!(storage.read_all_raw("conv-2").unwrap().len(), 1);

        // Sequence restarts after a full deletion.
        assert_eq!(storage.append_raw("conv-1", b"c").unwrap(), 0);
    }
}
