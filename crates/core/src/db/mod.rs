//! SQLite-backed substrate.
//!
//! Provides a [`SqliteSubstrate`] with WAL-mode journaling and automatic
//! schema migrations. Every document entry is one row keyed by
//! `(collection, id, revision)` holding the JSON-encoded [`NodeRecord`].

pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::errors::SubstrateError;
use crate::models::Revision;
use crate::store::{Collection, Document, DocumentUpdate, NodeRecord, Substrate};

/// Substrate handle wrapping one SQLite connection.
///
/// The connection sits behind a `Mutex` so the handle is `Send + Sync` and
/// can be shared through an `Arc` by every writer.
pub struct SqliteSubstrate {
    conn: Mutex<Connection>,
}

impl SqliteSubstrate {
    /// Open (or create) a substrate database at `path` and migrate it.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, SubstrateError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening substrate database");

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        schema::run_migrations(&conn)?;

        debug!("substrate database opened with WAL mode");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory database, for tests.
    pub fn in_memory() -> Result<Self, SubstrateError> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection, recovering from a poisoned mutex.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("substrate mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` inside a transaction; commit on `Ok`, roll back otherwise.
    fn transaction<F, T>(&self, f: F) -> Result<T, SubstrateError>
    where
        F: FnOnce(&Connection) -> Result<T, SubstrateError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

fn entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

/// Fold `(id, revision, record)` rows, sorted by id, into documents.
fn collect_documents<I>(rows: I) -> Result<Vec<Document>, SubstrateError>
where
    I: IntoIterator<Item = Result<(String, i64, String), rusqlite::Error>>,
{
    let mut docs: Vec<Document> = Vec::new();
    for row in rows {
        let (id, revision, record) = row?;
        let record: NodeRecord = serde_json::from_str(&record)?;
        let revision = u64::try_from(revision).map_err(|_| SubstrateError::Corrupt {
            id: id.clone(),
            detail: format!("negative revision {revision}"),
        })?;
        match docs.last_mut() {
            Some(doc) if doc.id == id => {
                doc.entries.insert(Revision(revision), record);
            }
            _ => {
                let mut doc = Document::new(id);
                doc.entries.insert(Revision(revision), record);
                docs.push(doc);
            }
        }
    }
    Ok(docs)
}

fn revision_param(revision: Revision) -> Result<i64, SubstrateError> {
    i64::try_from(revision.0)
        .map_err(|_| SubstrateError::Backend(format!("revision {revision} out of range")))
}

impl Substrate for SqliteSubstrate {
    fn find(&self, collection: Collection, id: &str) -> Result<Option<Document>, SubstrateError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, revision, record FROM entries
             WHERE collection = ?1 AND id = ?2
             ORDER BY revision",
        )?;
        let rows = stmt.query_map(params![collection.as_str(), id], entry_row)?;
        let mut docs = collect_documents(rows)?;
        Ok(docs.pop())
    }

    fn query(
        &self,
        collection: Collection,
        from_key: &str,
        to_key: &str,
        limit: usize,
    ) -> Result<Vec<Document>, SubstrateError> {
        if from_key >= to_key || limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, revision, record FROM entries
             WHERE collection = ?1 AND id IN (
                 SELECT DISTINCT id FROM entries
                 WHERE collection = ?1 AND id > ?2 AND id < ?3
                 ORDER BY id
                 LIMIT ?4
             )
             ORDER BY id, revision",
        )?;
        let rows = stmt.query_map(params![collection.as_str(), from_key, to_key, limit], entry_row)?;
        let docs = collect_documents(rows)?;
        Ok(docs)
    }

    fn apply(&self, updates: &[DocumentUpdate]) -> Result<(), SubstrateError> {
        self.transaction(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT OR REPLACE INTO entries (collection, id, revision, record)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for update in updates {
                let record = serde_json::to_string(&update.record)?;
                stmt.execute(params![
                    update.collection.as_str(),
                    update.id,
                    revision_param(update.revision)?,
                    record
                ])?;
            }
            Ok(())
        })?;
        debug!(entries = updates.len(), "applied substrate batch");
        Ok(())
    }
}
