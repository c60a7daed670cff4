use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Local;
use rusqlite::{Connection, params};

/// SQLite-backed hierarchical document store that plays the remote replica.
///
/// Documents are addressed by slash-separated paths with an even number of
/// segments (`collection/doc/collection/doc`). A document's parent
/// collection is its path minus the last segment.
pub struct DocumentStore {
    conn: Connection,
}

/// Split a document path into `(collection, doc_id)` after checking every
/// segment is non-empty and limited to `[A-Za-z0-9_-]`.
pub fn split_document_path(path: &str) -> Result<(&str, &str)> {
    let segments = validate_segments(path)?;
    if segments % 2 != 0 {
        bail!("'{path}' is a collection path, not a document path");
    }
    path.rsplit_once('/')
        .with_context(|| format!("'{path}' is not a document path"))
}

/// Check a collection path (odd number of segments).
pub fn validate_collection_path(path: &str) -> Result<()> {
    if validate_segments(path)? % 2 == 0 {
        bail!("'{path}' is a document path, not a collection path");
    }
    Ok(())
}

fn validate_segments(path: &str) -> Result<usize> {
    if path.is_empty() {
        bail!("path must not be empty");
    }
    let mut count = 0;
    for segment in path.split('/') {
        if segment.is_empty()
            || !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!("invalid path segment '{segment}' in '{path}'");
        }
        count += 1;
    }
    Ok(count)
}

impl DocumentStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open document store: {}", path.display()))?;
        let store = DocumentStore { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = DocumentStore { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS documents (
                    path TEXT PRIMARY KEY NOT NULL,
                    collection TEXT NOT NULL,
                    doc_id TEXT NOT NULL,
                    body BLOB NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, doc_id);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    /// Whether any document is stored anywhere beneath `namespace`.
    pub fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        validate_segments(namespace)?;
        // Every descendant path sorts in [ns + "/", ns + "0") since '0' follows '/'.
        let lower = format!("{namespace}/");
        let upper = format!("{namespace}0");
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM documents WHERE path >= ?1 AND path < ?2)",
            params![lower, upper],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        split_document_path(path)?;
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM documents WHERE path = ?1")?;
        let mut rows = stmt.query(params![path])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    pub fn put(&self, path: &str, body: &[u8]) -> Result<()> {
        let (collection, doc_id) = split_document_path(path)?;
        self.conn.execute(
            "INSERT INTO documents (path, collection, doc_id, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![path, collection, doc_id, body, Local::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Documents in `collection` whose id lies in `[start, end]`, by id.
    pub fn range(&self, collection: &str, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>> {
        validate_collection_path(collection)?;
        let mut stmt = self.conn.prepare(
            "SELECT doc_id, body FROM documents
             WHERE collection = ?1 AND doc_id >= ?2 AND doc_id <= ?3
             ORDER BY doc_id",
        )?;
        let docs = stmt
            .query_map(params![collection, start, end], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(docs)
    }
}
