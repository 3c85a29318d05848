//! Document Store - rusqlite-backed store of fetched sources
//!
//! One row per Document, keyed by a `document_id` derived from
//! `(company, url)`. Re-fetching a page with identical content is a no-op;
//! changed content replaces the row in place.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{RagError, RagResult};

// ============================================================================
// Types
// ============================================================================

/// One fetched source owned by a company
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub company: String,
    pub url: String,
    pub title: String,
    /// Cleaned markdown
    pub content: String,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        company: &str,
        url: &str,
        title: &str,
        content: &str,
        fetched_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            document_id: document_id(company, url),
            company: company.to_string(),
            url: url.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            content_hash: content_hash(content),
            fetched_at: fetched_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Outcome of [`DocumentStore::upsert_document`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentWrite {
    Inserted,
    /// Same content hash already stored
    Unchanged,
    /// Content changed; row overwritten
    Replaced,
}

/// Store statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub document_count: usize,
    pub company_count: usize,
    pub total_content_bytes: usize,
    pub db_path: Option<PathBuf>,
}

// ============================================================================
// DocumentStore
// ============================================================================

/// SQLite document store
#[derive(Clone)]
pub struct DocumentStore {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl DocumentStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> RagResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: Some(path.to_path_buf()),
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn open_in_memory() -> RagResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
            db_path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock(&self) -> RagResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RagError::Storage(format!("document store lock poisoned: {}", e)))
    }

    fn initialize(&self) -> RagResult<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                document_id TEXT PRIMARY KEY,
                company TEXT NOT NULL,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                fetched_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_documents_company ON documents(company);",
        )?;

        tracing::debug!("Document store initialized at {:?}", self.db_path);
        Ok(())
    }

    /// Insert, skip or replace depending on the stored content hash
    pub fn upsert_document(&self, doc: &Document) -> RagResult<DocumentWrite> {
        let conn = self.lock()?;

        let existing: Option<String> = conn
            .query_row(
                "SELECT content_hash FROM documents WHERE document_id = ?1",
                params![doc.document_id],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing {
            Some(hash) if hash == doc.content_hash => return Ok(DocumentWrite::Unchanged),
            Some(_) => DocumentWrite::Replaced,
            None => DocumentWrite::Inserted,
        };

        conn.execute(
            "INSERT OR REPLACE INTO documents
                (document_id, company, url, title, content, content_hash, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                doc.document_id,
                doc.company,
                doc.url,
                doc.title,
                doc.content,
                doc.content_hash,
                doc.fetched_at.to_rfc3339(),
            ],
        )?;

        tracing::debug!("{:?} document {} ({})", outcome, doc.url, doc.document_id);
        Ok(outcome)
    }

    pub fn get_document(&self, document_id: &str) -> RagResult<Option<Document>> {
        let conn = self.lock()?;

        let doc = conn
            .query_row(
                "SELECT document_id, company, url, title, content, content_hash, fetched_at
                 FROM documents WHERE document_id = ?1",
                params![document_id],
                row_to_document,
            )
            .optional()?;

        Ok(doc)
    }

    /// Documents of one company, ordered by URL
    pub fn list_documents(&self, company: &str) -> RagResult<Vec<Document>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT document_id, company, url, title, content, content_hash, fetched_at
             FROM documents WHERE company = ?1
             ORDER BY url",
        )?;

        let docs = stmt
            .query_map(params![company], row_to_document)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(docs)
    }

    /// Remove every document of a company in one statement
    pub fn delete_company(&self, company: &str) -> RagResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM documents WHERE company = ?1", params![company])?;
        Ok(removed)
    }

    /// Remove documents of a company whose id is not in `keep`
    pub fn retain_company_documents(
        &self,
        company: &str,
        keep: &HashSet<String>,
    ) -> RagResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let stale: Vec<String> = {
            let mut stmt = tx.prepare("SELECT document_id FROM documents WHERE company = ?1")?;
            let ids = stmt
                .query_map(params![company], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids.into_iter().filter(|id| !keep.contains(id)).collect()
        };

        for id in &stale {
            tx.execute("DELETE FROM documents WHERE document_id = ?1", params![id])?;
        }
        tx.commit()?;

        Ok(stale.len())
    }

    /// Distinct companies, sorted
    pub fn companies(&self) -> RagResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT DISTINCT company FROM documents ORDER BY company")?;
        let companies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(companies)
    }

    pub fn stats(&self) -> RagResult<StoreStats> {
        let conn = self.lock()?;

        let (count, companies, total_size): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT company), COALESCE(SUM(LENGTH(content)), 0)
             FROM documents",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(StoreStats {
            document_count: count as usize,
            company_count: companies as usize,
            total_content_bytes: total_size as usize,
            db_path: self.db_path.clone(),
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// UUID from the first 16 bytes of a SHA-256 digest over `parts`
pub fn stable_uuid(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"::");
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

pub fn document_id(company: &str, url: &str) -> String {
    stable_uuid(&[company, url])
}

pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        document_id: row.get(0)?,
        company: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        content_hash: row.get(5)?,
        fetched_at: parse_datetime(row.get::<_, String>(6)?),
    })
}

/// RFC3339 string to `DateTime<Utc>`
fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// Tests
// ============================================================================
