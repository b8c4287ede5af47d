//! Persistent document storage using redb.
//!
//! Local and shared repos keep one Automerge blob per document, keyed by
//! the document's base58 ID. Ephemeral repos run without storage.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::PincalError;
use crate::types::DocumentId;

const DOCUMENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct DocumentStorage {
    db: Arc<RwLock<Database>>,
}

impl DocumentStorage {
    /// Create a new storage instance at the given path.
    ///
    /// Creates the parent directory and the documents table if needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, PincalError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(DOCUMENTS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Save a document (Automerge blob), replacing any previous version.
    pub fn save_document(&self, id: &DocumentId, data: &[u8]) -> Result<(), PincalError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            let key = id.to_base58();
            table.insert(key.as_str(), data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a document.
    ///
    /// Returns `None` if no document exists for the given ID.
    pub fn load_document(&self, id: &DocumentId) -> Result<Option<Vec<u8>>, PincalError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(DOCUMENTS_TABLE)?;
        let key = id.to_base58();

        Ok(table.get(key.as_str())?.map(|v| v.value().to_vec()))
    }

    /// Delete a document. Deleting a missing document is not an error.
    pub fn delete_document(&self, id: &DocumentId) -> Result<(), PincalError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(DOCUMENTS_TABLE)?;
            let key = id.to_base58();
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// List the IDs of every stored document.
    ///
    /// Keys that do not parse as document IDs are skipped.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, PincalError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(DOCUMENTS_TABLE)?;

        let mut ids = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            if let Ok(id) = DocumentId::from_base58(key.value()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}
