//! Key/value store seam, its SQLite implementation, and the image records
//! kept in it.
//!
//! Keys are scoped per model by prefixing: `images/<image id>`.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

pub trait Store: Send + Sync {
    fn put(&self, model: &str, key: &str, value: &[u8]) -> Result<()>;
    fn get(&self, model: &str, key: &str) -> Result<Option<Vec<u8>>>;
    fn has(&self, model: &str, key: &str) -> Result<bool>;
    fn delete(&self, model: &str, key: &str) -> Result<()>;
}

fn scoped_key(model: &str, key: &str) -> String {
    format!("{model}/{key}")
}

// ── SQLite ────────────────────────────────────────────────────────────────────

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open store {}", path.display()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )
        .context("failed to create kv table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("store connection poisoned"))?;
        Ok(f(&conn)?)
    }
}

impl Store for SqliteStore {
    fn put(&self, model: &str, key: &str, value: &[u8]) -> Result<()> {
        let key = scoped_key(model, key);
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
        })
        .with_context(|| format!("put {key}"))?;
        Ok(())
    }

    fn get(&self, model: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let key = scoped_key(model, key);
        self.with_conn(|c| {
            c.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
        })
        .with_context(|| format!("get {key}"))
    }

    fn has(&self, model: &str, key: &str) -> Result<bool> {
        Ok(self.get(model, key)?.is_some())
    }

    fn delete(&self, model: &str, key: &str) -> Result<()> {
        let key = scoped_key(model, key);
        self.with_conn(|c| c.execute("DELETE FROM kv WHERE key = ?1", params![key]))
            .with_context(|| format!("delete {key}"))?;
        Ok(())
    }
}

// ── Image records ─────────────────────────────────────────────────────────────

pub const IMAGES_MODEL: &str = "images";

/// Stored per image id after an upload has been loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Hex BLAKE3 of the image archive.
    pub content_hash: String,
    /// Hex signatures of every uploader, oldest first, no duplicates.
    pub signatures: Vec<String>,
    /// Unix seconds of the first upload.
    pub created_at: i64,
}

pub fn load_image_record(store: &dyn Store, image_id: &str) -> Result<Option<ImageRecord>> {
    match store.get(IMAGES_MODEL, image_id)? {
        Some(bytes) => Ok(Some(
            serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt image record {image_id}"))?,
        )),
        None => Ok(None),
    }
}

/// Insert a record, or append `signature` to the existing one. The content
/// hash of an existing record is replaced by the newest upload's.
pub fn record_image_upload(
    store: &dyn Store,
    image_id: &str,
    content_hash: &str,
    signature: &str,
    now: i64,
) -> Result<ImageRecord> {
    let record = match load_image_record(store, image_id)? {
        Some(mut existing) => {
            existing.content_hash = content_hash.to_string();
            if !existing.signatures.iter().any(|s| s == signature) {
                existing.signatures.push(signature.to_string());
            }
            existing
        }
        None => ImageRecord {
            content_hash: content_hash.to_string(),
            signatures: vec![signature.to_string()],
            created_at: now,
        },
    };
    store.put(IMAGES_MODEL, image_id, &serde_json::to_vec(&record)?)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_has_delete_are_model_scoped() {
        let store = SqliteStore::in_memory().unwrap();
        store.put("images", "a", b"one").unwrap();
        store.put("other", "a", b"two").unwrap();

        assert_eq!(store.get("images", "a").unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get("other", "a").unwrap(), Some(b"two".to_vec()));
        assert!(store.has("images", "a").unwrap());
        assert!(!store.has("images", "b").unwrap());

        store.put("images", "a", b"three").unwrap();
        assert_eq!(store.get("images", "a").unwrap(), Some(b"three".to_vec()));

        store.delete("images", "a").unwrap();
        assert_eq!(store.get("images", "a").unwrap(), None);
        assert!(store.has("other", "a").unwrap());
    }

    #[test]
    fn reupload_appends_distinct_signature() {
        let store = SqliteStore::in_memory().unwrap();
        let first = record_image_upload(&store, "sha256:aa", "h1", "sig1", 100).unwrap();
        assert_eq!(first.signatures, vec!["sig1"]);

        record_image_upload(&store, "sha256:aa", "h1", "sig2", 200).unwrap();
        let again = record_image_upload(&store, "sha256:aa", "h1", "sig2", 300).unwrap();
        assert_eq!(again.signatures, vec!["sig1", "sig2"]);
        assert_eq!(again.created_at, 100);

        let loaded = load_image_record(&store, "sha256:aa").unwrap().unwrap();
        assert_eq!(loaded, again);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("cairn-store-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("cairn.db");

        SqliteStore::open(&path)
            .unwrap()
            .put("images", "x", b"v")
            .unwrap();
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get("images", "x").unwrap(), Some(b"v".to_vec()));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
