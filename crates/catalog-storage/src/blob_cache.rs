//! Keyed binary payloads (cover images, thumbnails) in a pure-cache store.

use crate::cursor::{ColumnType, Cursor};
use crate::db::SynchronizedDb;
use crate::error::Result;
use crate::schema::{ColumnDef, DefaultValue, IndexDef, TableDefinition};
use crate::statement::StatementCache;
use crate::store::{CacheSchema, StoreDescriptor};
use rusqlite::types::Value;

pub const IMAGE_TABLE: &str = "image";

/// Bumping this discards every cached payload on next open.
pub const BLOB_CACHE_VERSION: u32 = 1;

pub fn image_table() -> TableDefinition {
    TableDefinition::new(IMAGE_TABLE)
        .with_column(ColumnDef::new("_id", ColumnType::Integer).primary_key())
        .with_column(ColumnDef::new("key", ColumnType::Text).not_null())
        .with_column(ColumnDef::new("image", ColumnType::Blob).not_null())
        .with_column(
            ColumnDef::new("last_update_date", ColumnType::DateTime)
                .not_null()
                .default_value(DefaultValue::CurrentTimestamp),
        )
        .with_index(IndexDef::new("key", ["key"]).unique())
        .with_index(IndexDef::new("key_date", ["key", "last_update_date"]).unique())
}

pub fn blob_cache_descriptor(name: &str, file_name: &str) -> StoreDescriptor {
    StoreDescriptor::new(
        name,
        file_name,
        BLOB_CACHE_VERSION,
        CacheSchema::new(vec![image_table()]),
    )
}

/// Escape GLOB metacharacters so `text` only matches itself.
fn glob_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '*' | '?' | '[' => {
                out.push('[');
                out.push(ch);
                out.push(']');
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Statement owner over one blob-cache store. Call [`BlobCache::close`] when
/// done with it.
#[derive(Debug)]
pub struct BlobCache {
    statements: StatementCache,
}

impl BlobCache {
    pub fn new(db: SynchronizedDb, owner: impl Into<String>) -> Self {
        Self {
            statements: StatementCache::new(db, owner),
        }
    }

    pub fn db(&self) -> &SynchronizedDb {
        self.statements.db()
    }

    /// Store `payload` under `key`, replacing any previous payload and
    /// refreshing its timestamp.
    pub fn put(&self, key: &str, payload: &[u8]) -> Result<()> {
        let stmt = self.statements.get("put", || {
            "INSERT INTO image (key, image) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET image = excluded.image, \
             last_update_date = CURRENT_TIMESTAMP"
        })?;
        stmt.execute_update_delete(rusqlite::params![key, payload])?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let stmt = self
            .statements
            .get("get", || "SELECT image FROM image WHERE key = ?1")?;
        let mut cursor = stmt.query(&[Value::Text(key.to_string())])?;
        if !cursor.move_to_first() {
            return Ok(None);
        }
        cursor.row().get_blob("image")
    }

    /// The payload for `key` if it was stored after `since`
    /// (`YYYY-MM-DD HH:MM:SS`, UTC).
    pub fn get_if_newer(&self, key: &str, since: &str) -> Result<Option<Vec<u8>>> {
        let stmt = self.statements.get("get_if_newer", || {
            "SELECT image FROM image WHERE key = ?1 AND last_update_date > ?2"
        })?;
        let mut cursor = stmt.query(&[
            Value::Text(key.to_string()),
            Value::Text(since.to_string()),
        ])?;
        if !cursor.move_to_first() {
            return Ok(None);
        }
        cursor.row().get_blob("image")
    }

    pub fn last_updated(&self, key: &str) -> Result<Option<String>> {
        let stmt = self.statements.get("last_updated", || {
            "SELECT last_update_date FROM image WHERE key = ?1"
        })?;
        stmt.query_string([key])
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        let stmt = self
            .statements
            .get("contains", || "SELECT COUNT(*) FROM image WHERE key = ?1")?;
        Ok(stmt.count([key])? > 0)
    }

    pub fn count(&self) -> Result<i64> {
        let stmt = self
            .statements
            .get("count", || "SELECT COUNT(*) FROM image")?;
        stmt.count([])
    }

    pub fn delete(&self, key: &str) -> Result<usize> {
        let stmt = self
            .statements
            .get("delete", || "DELETE FROM image WHERE key = ?1")?;
        stmt.execute_update_delete([key])
    }

    /// Delete every payload whose key starts with `prefix`.
    pub fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let stmt = self
            .statements
            .get("delete_prefix", || "DELETE FROM image WHERE key GLOB ?1")?;
        stmt.execute_update_delete([format!("{}*", glob_literal(prefix))])
    }

    pub fn clear(&self) -> Result<usize> {
        let stmt = self
            .statements
            .get("clear", || "DELETE FROM image")?;
        stmt.execute_update_delete([])
    }

    pub fn close(&self) {
        self.statements.close();
    }
}
