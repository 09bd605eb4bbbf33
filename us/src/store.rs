//! SQLite-backed Store implementation

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, info};

use crate::record::{Filter, FilterOp, Record};

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record already exists: {collection}/{id}")]
    Duplicate { collection: String, id: String },

    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    collection  TEXT NOT NULL,
    id          TEXT NOT NULL,
    body        TEXT NOT NULL,
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE TABLE IF NOT EXISTS record_index (
    collection  TEXT NOT NULL,
    record_id   TEXT NOT NULL,
    field       TEXT NOT NULL,
    value       TEXT NOT NULL,
    PRIMARY KEY (collection, record_id, field)
);
CREATE INDEX IF NOT EXISTS idx_record_index_lookup
    ON record_index (collection, field, value);
";

/// Persistent record store
///
/// One SQLite database holds every collection. Each write runs in its own
/// transaction so a record body and its index rows change together or not
/// at all.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a store in the given directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("unitstore.db");
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %db_path.display(), "Opened store");
        Ok(Self { conn })
    }

    /// Open an in-memory store (tests)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Insert a new record, failing if the id already exists
    pub fn create<R: Record>(&mut self, record: &R) -> Result<(), StoreError> {
        let collection = R::collection_name();
        let body = serde_json::to_string(record)?;

        let tx = self.conn.transaction()?;
        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, record.id()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Duplicate {
                collection: collection.to_string(),
                id: record.id().to_string(),
            });
        }

        tx.execute(
            "INSERT INTO records (collection, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![collection, record.id(), body, record.updated_at()],
        )?;
        write_index_rows(&tx, collection, record)?;
        tx.commit()?;

        debug!(collection, id = %record.id(), "Created record");
        Ok(())
    }

    /// Replace an existing record atomically (body + index rows together)
    pub fn update<R: Record>(&mut self, record: &R) -> Result<(), StoreError> {
        let collection = R::collection_name();
        let body = serde_json::to_string(record)?;

        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE records SET body = ?3, updated_at = ?4 WHERE collection = ?1 AND id = ?2",
            params![collection, record.id(), body, record.updated_at()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: record.id().to_string(),
            });
        }

        tx.execute(
            "DELETE FROM record_index WHERE collection = ?1 AND record_id = ?2",
            params![collection, record.id()],
        )?;
        write_index_rows(&tx, collection, record)?;
        tx.commit()?;

        debug!(collection, id = %record.id(), "Updated record");
        Ok(())
    }

    /// Fetch a record by id
    pub fn get<R: Record>(&self, id: &str) -> Result<Option<R>, StoreError> {
        let collection = R::collection_name();
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Delete a record by id (no-op if absent)
    pub fn delete<R: Record>(&mut self, id: &str) -> Result<(), StoreError> {
        let collection = R::collection_name();
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        tx.execute(
            "DELETE FROM record_index WHERE collection = ?1 AND record_id = ?2",
            params![collection, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// List records matching every filter, ordered by id
    ///
    /// Equality filters run against the index table; inequality filters are
    /// applied after deserialization (collections here are small).
    pub fn list<R: Record>(&self, filters: &[Filter]) -> Result<Vec<R>, StoreError> {
        let collection = R::collection_name();

        let mut sql = String::from("SELECT r.body FROM records r");
        let mut args: Vec<String> = vec![collection.to_string()];
        let eq_filters: Vec<&Filter> = filters.iter().filter(|f| f.op == FilterOp::Eq).collect();

        for (n, filter) in eq_filters.iter().enumerate() {
            sql.push_str(&format!(
                " JOIN record_index x{n} ON x{n}.collection = r.collection \
                  AND x{n}.record_id = r.id AND x{n}.field = ?{} AND x{n}.value = ?{}",
                args.len() + 1,
                args.len() + 2,
            ));
            args.push(filter.field.clone());
            args.push(filter.value.encode());
        }
        sql.push_str(" WHERE r.collection = ?1 ORDER BY r.id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            row.get::<_, String>(0)
        })?;

        let mut records = Vec::new();
        for body in rows {
            let record: R = serde_json::from_str(&body?)?;
            records.push(record);
        }

        // Apply Ne filters in memory
        let ne_filters: Vec<&Filter> = filters.iter().filter(|f| f.op == FilterOp::Ne).collect();
        if !ne_filters.is_empty() {
            records.retain(|r| {
                let fields = r.indexed_fields();
                ne_filters
                    .iter()
                    .all(|f| fields.get(&f.field).map(|v| *v != f.value).unwrap_or(true))
            });
        }

        Ok(records)
    }

    /// Count records matching the filters
    pub fn count<R: Record>(&self, filters: &[Filter]) -> Result<usize, StoreError> {
        Ok(self.list::<R>(filters)?.len())
    }

    /// Rebuild the index rows for every record in a collection
    ///
    /// Used on startup after a crash: indexed_fields may have drifted from
    /// what an older process wrote.
    pub fn rebuild_indexes<R: Record>(&mut self) -> Result<usize, StoreError> {
        let records: Vec<R> = self.list(&[])?;
        let collection = R::collection_name();

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM record_index WHERE collection = ?1", params![collection])?;
        for record in &records {
            write_index_rows(&tx, collection, record)?;
        }
        tx.commit()?;

        info!(collection, count = records.len(), "Rebuilt indexes");
        Ok(records.len())
    }
}

fn write_index_rows<R: Record>(
    tx: &rusqlite::Transaction<'_>,
    collection: &str,
    record: &R,
) -> Result<(), StoreError> {
    for (field, value) in record.indexed_fields() {
        tx.execute(
            "INSERT OR REPLACE INTO record_index (collection, record_id, field, value) \
             VALUES (?1, ?2, ?3, ?4)",
            params![collection, record.id(), field, value.encode()],
        )?;
    }
    Ok(())
}
