//! Named, lazily compiled statements and the per-owner cache that holds them.
//!
//! The engine keeps compiled statements in its own LRU keyed by SQL text;
//! a [`SyncStatement`] pins the SQL and how it must be locked, and each run
//! fetches the compiled form back from that LRU.

use crate::cursor::SyncCursor;
use crate::db::SynchronizedDb;
use crate::error::{Result, StoreError};
use crate::sync::LockMode;
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Params};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A compiled statement bound to one store.
///
/// Read-only statements run under a shared token, everything else under an
/// exclusive one.
pub struct SyncStatement {
    db: SynchronizedDb,
    name: String,
    sql: Arc<str>,
    read_only: bool,
    closed: AtomicBool,
}

impl SyncStatement {
    pub(crate) fn new(db: SynchronizedDb, name: &str, sql: &str, read_only: bool) -> Self {
        Self {
            db,
            name: name.to_string(),
            sql: Arc::from(sql),
            read_only,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mode(&self) -> LockMode {
        if self.read_only {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::StatementClosed(self.name.clone()));
        }
        Ok(())
    }

    pub fn execute<P: Params>(&self, params: P) -> Result<usize> {
        self.ensure_open()?;
        self.db.with_conn(self.mode(), |conn| {
            let mut stmt = conn.prepare_cached(&self.sql)?;
            Ok(stmt.execute(params)?)
        })
    }

    /// Run an `INSERT` and return the new rowid.
    pub fn execute_insert<P: Params>(&self, params: P) -> Result<i64> {
        self.ensure_open()?;
        self.db.with_conn(self.mode(), |conn| {
            let mut stmt = conn.prepare_cached(&self.sql)?;
            stmt.insert(params)
                .map_err(|err| StoreError::write_failed(format!("statement `{}`", self.name), err))
        })
    }

    /// Run an `UPDATE` or `DELETE` and return the number of changed rows.
    pub fn execute_update_delete<P: Params>(&self, params: P) -> Result<usize> {
        self.ensure_open()?;
        self.db.with_conn(self.mode(), |conn| {
            let mut stmt = conn.prepare_cached(&self.sql)?;
            stmt.execute(params)
                .map_err(|err| StoreError::write_failed(format!("statement `{}`", self.name), err))
        })
    }

    /// First column of the first row; `None` for no row or a null value.
    pub fn query_i64<P: Params>(&self, params: P) -> Result<Option<i64>> {
        self.ensure_open()?;
        self.db.with_conn(self.mode(), |conn| {
            let mut stmt = conn.prepare_cached(&self.sql)?;
            let value = stmt
                .query_row(params, |row| row.get::<_, Option<i64>>(0))
                .optional()?;
            Ok(value.flatten())
        })
    }

    pub fn query_i64_or_zero<P: Params>(&self, params: P) -> Result<i64> {
        Ok(self.query_i64(params)?.unwrap_or(0))
    }

    /// For `SELECT COUNT(*)` style statements.
    pub fn count<P: Params>(&self, params: P) -> Result<i64> {
        self.query_i64_or_zero(params)
    }

    pub fn query_string<P: Params>(&self, params: P) -> Result<Option<String>> {
        self.ensure_open()?;
        self.db.with_conn(self.mode(), |conn| {
            let mut stmt = conn.prepare_cached(&self.sql)?;
            let value = stmt
                .query_row(params, |row| row.get::<_, Option<String>>(0))
                .optional()?;
            Ok(value.flatten())
        })
    }

    pub fn query(&self, args: &[Value]) -> Result<SyncCursor> {
        self.ensure_open()?;
        SyncCursor::open(
            self.db.clone(),
            Arc::clone(&self.sql),
            args.to_vec(),
            self.mode(),
        )
    }

    /// Release the statement and evict its compiled form from the
    /// connection. Closing twice is an error.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::StatementClosed(self.name.clone()));
        }
        self.db.discard_cached(&self.sql);
        Ok(())
    }
}

impl fmt::Debug for SyncStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncStatement")
            .field("name", &self.name)
            .field("sql", &self.sql)
            .field("read_only", &self.read_only)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Default)]
struct CacheState {
    statements: HashMap<String, Arc<SyncStatement>>,
    /// Set while the owner is registered with the store's leak auditor.
    audit_id: Option<u64>,
}

/// Statements compiled on behalf of one owner, keyed by a name the owner
/// chooses.
///
/// Owners must call [`StatementCache::close`]; a cache dropped while still
/// holding statements is logged and recorded as a leak.
pub struct StatementCache {
    db: SynchronizedDb,
    owner: String,
    state: Mutex<CacheState>,
}

impl StatementCache {
    pub fn new(db: SynchronizedDb, owner: impl Into<String>) -> Self {
        Self {
            db,
            owner: owner.into(),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn db(&self) -> &SynchronizedDb {
        &self.db
    }

    /// The statement cached under `name`, compiling the SQL from `sql` the
    /// first time. Later calls never look at the SQL again.
    pub fn get<F, S>(&self, name: &str, sql: F) -> Result<Arc<SyncStatement>>
    where
        F: FnOnce() -> S,
        S: AsRef<str>,
    {
        let mut state = self.state.lock().expect("statement cache mutex poisoned");
        if let Some(stmt) = state.statements.get(name) {
            return Ok(Arc::clone(stmt));
        }

        let sql = sql();
        let stmt = Arc::new(self.db.compile_statement(name, sql.as_ref())?);
        if state.audit_id.is_none() {
            state.audit_id = Some(self.db.leak_auditor().register(&self.owner));
        }
        state
            .statements
            .insert(name.to_string(), Arc::clone(&stmt));
        Ok(stmt)
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("statement cache mutex poisoned")
            .statements
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every cached statement and empty the cache. Failures are logged
    /// per statement and never stop the rest from closing. The cache can be
    /// used again afterwards.
    pub fn close(&self) {
        let (statements, audit_id) = {
            let mut state = self.state.lock().expect("statement cache mutex poisoned");
            (std::mem::take(&mut state.statements), state.audit_id.take())
        };

        for (name, stmt) in statements {
            if let Err(err) = stmt.close() {
                log::warn!("{}: releasing statement `{name}` failed: {err}", self.owner);
            }
        }
        if let Some(id) = audit_id {
            self.db.leak_auditor().unregister(id);
        }
    }
}

impl fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementCache")
            .field("owner", &self.owner)
            .field("store", &self.db.name())
            .finish()
    }
}

impl Drop for StatementCache {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(id) = state.audit_id.take() else {
            return;
        };
        log::warn!(
            "statement cache `{}` on `{}` dropped without close",
            self.owner,
            self.db.name()
        );
        self.db.leak_auditor().record_leak(id);
        for (_, stmt) in state.statements.drain() {
            let _ = stmt.close();
        }
    }
}
