//! Connection guardian: one engine connection per store, with every access
//! routed through the store's [`Synchronizer`].
//!
//! Transactions are per thread. The outermost `begin_transaction` on a thread
//! takes a lock token and starts the engine transaction; nested calls on the
//! same thread only push a scope. The engine transaction commits only if every
//! scope was marked successful.
//!
//! A single connection can only run one engine transaction at a time, so
//! read transactions opened by several threads share one: the first reader
//! begins it and the last reader ends it. Write transactions are exclusive by
//! virtue of their token.
//!
//! Lock order: lock token, then transaction state, then connection.

use crate::audit::LeakAuditor;
use crate::config::StorageConfig;
use crate::cursor::{SyncCursor, TypedCursor};
use crate::error::{LockProtocolError, Result, StoreError, TransactionError};
use crate::schema::{quote_ident, TableDefinition, TableInfo};
use crate::statement::SyncStatement;
use crate::store::StoreDescriptor;
use crate::sync::{report_violation, LockMode, LockToken, Synchronizer};
use lru::LruCache;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Params};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    RolledBack,
    /// The scope ended but the engine transaction is still open: an inner
    /// scope, or a read scope that other threads still share.
    Nested,
}

#[derive(Debug, Default)]
struct TxScopes {
    /// One entry per open scope, innermost last: was it marked successful?
    marks: Vec<bool>,
    failed: bool,
}

impl TxScopes {
    fn opened() -> Self {
        Self {
            marks: vec![false],
            failed: false,
        }
    }
}

#[derive(Debug, Default)]
struct TxState {
    writer: Option<(ThreadId, TxScopes)>,
    readers: HashMap<ThreadId, TxScopes>,
}

impl TxState {
    fn mode_of(&self, thread: ThreadId) -> Option<LockMode> {
        match &self.writer {
            Some((owner, _)) if *owner == thread => Some(LockMode::Exclusive),
            _ if self.readers.contains_key(&thread) => Some(LockMode::Shared),
            _ => None,
        }
    }

    fn scopes_mut(&mut self, thread: ThreadId, mode: LockMode) -> Option<&mut TxScopes> {
        match mode {
            LockMode::Exclusive => match &mut self.writer {
                Some((owner, scopes)) if *owner == thread => Some(scopes),
                _ => None,
            },
            LockMode::Shared => self.readers.get_mut(&thread),
        }
    }
}

struct DbInner {
    name: String,
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
    sync: Synchronizer,
    tx: Mutex<TxState>,
    tables: Mutex<LruCache<String, Arc<TableInfo>>>,
    lock_timeout: Option<Duration>,
    auditor: LeakAuditor,
}

impl DbInner {
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("db connection mutex poisoned")
    }

    fn tx_state(&self) -> MutexGuard<'_, TxState> {
        self.tx.lock().expect("db transaction mutex poisoned")
    }
}

/// Handle to one store. Clones share the connection and the synchronizer.
#[derive(Clone)]
pub struct SynchronizedDb {
    inner: Arc<DbInner>,
}

impl fmt::Debug for SynchronizedDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedDb")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .finish()
    }
}

impl SynchronizedDb {
    /// Open the store described by `descriptor`, creating or upgrading it.
    ///
    /// Without a configured base directory the store lives in memory.
    pub fn open(descriptor: &StoreDescriptor, config: &StorageConfig) -> Result<Self> {
        let path = config.store_path(&descriptor.file_name);
        let conn = match &path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        Self::initialize(conn, path, descriptor, config)
    }

    pub fn open_in_memory(descriptor: &StoreDescriptor) -> Result<Self> {
        Self::initialize(
            Connection::open_in_memory()?,
            None,
            descriptor,
            &StorageConfig::default(),
        )
    }

    fn initialize(
        conn: Connection,
        path: Option<PathBuf>,
        descriptor: &StoreDescriptor,
        config: &StorageConfig,
    ) -> Result<Self> {
        conn.busy_timeout(config.busy_timeout())?;
        conn.set_prepared_statement_cache_capacity(config.prepared_statement_capacity());
        // Upgrades run with enforcement off; the pragma is a no-op once a
        // transaction is open.
        conn.pragma_update(None, "foreign_keys", false)?;

        let table_capacity =
            NonZeroUsize::new(config.table_info_capacity()).unwrap_or(NonZeroUsize::MIN);
        let db = Self {
            inner: Arc::new(DbInner {
                name: descriptor.name.clone(),
                path,
                conn: Mutex::new(conn),
                sync: Synchronizer::new(descriptor.name.clone()),
                tx: Mutex::new(TxState::default()),
                tables: Mutex::new(LruCache::new(table_capacity)),
                lock_timeout: config.lock_timeout(),
                auditor: LeakAuditor::new(),
            }),
        };
        db.run_lifecycle(descriptor)?;
        Ok(db)
    }

    fn run_lifecycle(&self, descriptor: &StoreDescriptor) -> Result<()> {
        let found = self.user_version()?;
        let expected = descriptor.version;
        if found > expected {
            return Err(StoreError::Downgrade {
                store: descriptor.name.clone(),
                found,
                expected,
            });
        }

        if found < expected {
            let callbacks = &descriptor.callbacks;
            self.with_transaction(true, |db| {
                if found == 0 {
                    log::info!("creating store `{}` at version {expected}", db.name());
                    callbacks.on_create(db)?;
                } else {
                    log::info!(
                        "upgrading store `{}` from version {found} to {expected}",
                        db.name()
                    );
                    callbacks.on_upgrade(db, found, expected)?;
                }
                db.set_user_version(expected)
            })?;
        }

        self.set_foreign_keys(true)?;
        descriptor.callbacks.on_open(self)?;
        log::debug!("opened store `{}` at version {expected}", self.name());
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.inner.sync
    }

    pub fn leak_auditor(&self) -> &LeakAuditor {
        &self.inner.auditor
    }

    /// Whether both handles refer to the same open store.
    pub fn same_store(&self, other: &SynchronizedDb) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn acquire(&self, mode: LockMode) -> Result<LockToken> {
        match self.inner.lock_timeout {
            Some(timeout) => self.inner.sync.acquire_timeout(mode, timeout),
            None => self.inner.sync.acquire(mode),
        }
    }

    /// Mode of the transaction the calling thread has open on this store.
    pub fn transaction_mode(&self) -> Option<LockMode> {
        self.inner.tx_state().mode_of(thread::current().id())
    }

    /// Token for a single operation, or `None` when the calling thread's own
    /// transaction already covers `mode`.
    fn guard(&self, mode: LockMode) -> Result<Option<LockToken>> {
        match (self.transaction_mode(), mode) {
            (Some(LockMode::Exclusive), _) | (Some(LockMode::Shared), LockMode::Shared) => {
                Ok(None)
            }
            (Some(LockMode::Shared), LockMode::Exclusive) => Err(StoreError::Transaction(
                TransactionError::WriteInsideShared,
            )),
            (None, mode) => self.acquire(mode).map(Some),
        }
    }

    /// Run `f` against the connection under a `mode` token.
    pub(crate) fn with_conn<T>(
        &self,
        mode: LockMode,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let _token = self.guard(mode)?;
        let conn = self.inner.conn();
        f(&conn)
    }

    pub fn begin_transaction(&self, is_update: bool) -> Result<TxLock> {
        let me = thread::current().id();
        let mode = if is_update {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };

        {
            let mut tx = self.inner.tx_state();
            match tx.mode_of(me) {
                Some(LockMode::Shared) if is_update => {
                    return Err(StoreError::Transaction(TransactionError::WriteInsideShared));
                }
                Some(current) => {
                    let scopes = tx
                        .scopes_mut(me, current)
                        .ok_or(StoreError::Transaction(TransactionError::NotStarted))?;
                    scopes.marks.push(false);
                    return Ok(TxLock {
                        db: self.clone(),
                        owner: me,
                        mode: current,
                        depth: scopes.marks.len(),
                        token: None,
                        ended: false,
                    });
                }
                None => {}
            }
        }

        let token = self.acquire(mode)?;
        self.open_outermost(me, mode, Some(token))
    }

    /// Start the engine transaction for an outermost scope. With `token` set
    /// to `None` the caller keeps holding a token of at least `mode` until the
    /// scope has ended.
    fn open_outermost(
        &self,
        me: ThreadId,
        mode: LockMode,
        token: Option<LockToken>,
    ) -> Result<TxLock> {
        let mut tx = self.inner.tx_state();
        match mode {
            LockMode::Exclusive => {
                self.inner.conn().execute_batch("BEGIN IMMEDIATE")?;
                tx.writer = Some((me, TxScopes::opened()));
            }
            LockMode::Shared => {
                if tx.readers.is_empty() {
                    self.inner.conn().execute_batch("BEGIN")?;
                }
                tx.readers.insert(me, TxScopes::opened());
            }
        }

        Ok(TxLock {
            db: self.clone(),
            owner: me,
            mode,
            depth: 1,
            token,
            ended: false,
        })
    }

    /// Mark the calling thread's innermost open scope as successful.
    pub fn set_transaction_successful(&self) -> Result<()> {
        let me = thread::current().id();
        let mut tx = self.inner.tx_state();
        let mode = tx
            .mode_of(me)
            .ok_or(StoreError::Transaction(TransactionError::NotStarted))?;
        let scopes = tx
            .scopes_mut(me, mode)
            .ok_or(StoreError::Transaction(TransactionError::NotStarted))?;
        match scopes.marks.last_mut() {
            Some(mark) => {
                *mark = true;
                Ok(())
            }
            None => Err(StoreError::Transaction(TransactionError::NotStarted)),
        }
    }

    /// End the scope opened by `lock`. The outermost scope commits if every
    /// scope was marked successful and rolls back otherwise; the lock token
    /// is released either way.
    pub fn end_transaction(&self, mut lock: TxLock) -> Result<TxOutcome> {
        if !self.same_store(&lock.db) {
            return Err(StoreError::Transaction(TransactionError::WrongStore));
        }
        lock.ended = true;
        self.finish_scope(&mut lock, false)
    }

    fn finish_scope(&self, lock: &mut TxLock, abandoned: bool) -> Result<TxOutcome> {
        let mut tx = self.inner.tx_state();
        let Some(scopes) = tx.scopes_mut(lock.owner, lock.mode) else {
            return Err(StoreError::Transaction(TransactionError::NotStarted));
        };
        if lock.depth > scopes.marks.len() {
            // Already closed by an outer scope that ended first.
            return Err(StoreError::Transaction(TransactionError::NotStarted));
        }
        if lock.depth < scopes.marks.len() {
            report_violation(&LockProtocolError::ScopeOrder {
                store: self.inner.name.clone(),
                depth: lock.depth,
                open: scopes.marks.len(),
            });
            scopes.marks.truncate(lock.depth);
            scopes.failed = true;
        }

        let marked = scopes.marks.pop().unwrap_or(false);
        if !marked || abandoned {
            scopes.failed = true;
        }
        if !scopes.marks.is_empty() {
            return Ok(TxOutcome::Nested);
        }

        let commit = !scopes.failed;
        let end_physical = match lock.mode {
            LockMode::Exclusive => {
                tx.writer = None;
                true
            }
            LockMode::Shared => {
                tx.readers.remove(&lock.owner);
                tx.readers.is_empty()
            }
        };

        if !end_physical {
            // Other threads' read scopes still share the engine transaction.
            drop(tx);
            drop(lock.token.take());
            return Ok(TxOutcome::Nested);
        }

        let result = {
            let conn = self.inner.conn();
            let sql = if commit { "COMMIT" } else { "ROLLBACK" };
            match conn.execute_batch(sql) {
                Ok(()) => Ok(()),
                Err(err) => {
                    if commit {
                        if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                            log::error!("rollback after failed commit on `{}`: {rollback}", self.name());
                        }
                    }
                    Err(err)
                }
            }
        };
        drop(tx);
        drop(lock.token.take());

        result?;
        Ok(if commit {
            TxOutcome::Committed
        } else {
            TxOutcome::RolledBack
        })
    }

    /// Run `f` in a transaction, marking it successful iff `f` returns `Ok`.
    pub fn with_transaction<T>(
        &self,
        is_update: bool,
        f: impl FnOnce(&SynchronizedDb) -> Result<T>,
    ) -> Result<T> {
        let lock = self.begin_transaction(is_update)?;
        self.run_scope(lock, f)
    }

    fn run_scope<T>(
        &self,
        lock: TxLock,
        f: impl FnOnce(&SynchronizedDb) -> Result<T>,
    ) -> Result<T> {
        match f(self) {
            Ok(value) => {
                self.set_transaction_successful()?;
                match self.end_transaction(lock)? {
                    TxOutcome::RolledBack => {
                        Err(StoreError::Transaction(TransactionError::RolledBack))
                    }
                    TxOutcome::Committed | TxOutcome::Nested => Ok(value),
                }
            }
            Err(err) => {
                if let Err(end_err) = self.end_transaction(lock) {
                    log::warn!("ending failed transaction on `{}`: {end_err}", self.name());
                }
                Err(err)
            }
        }
    }

    /// Run `f` in a new write transaction with foreign-key enforcement off.
    ///
    /// One exclusive token covers switching enforcement off, the whole
    /// transaction and restoring the previous setting, so no other thread
    /// ever writes while enforcement is suspended. Fails with
    /// `LockProtocol(Upgrade)` if the calling thread already holds a token.
    pub(crate) fn with_foreign_keys_suspended<T>(
        &self,
        f: impl FnOnce(&SynchronizedDb) -> Result<T>,
    ) -> Result<T> {
        let token = self.acquire(LockMode::Exclusive)?;
        let enforced = {
            let conn = self.inner.conn();
            let enforced =
                conn.pragma_query_value(None, "foreign_keys", |row| row.get::<_, i64>(0))? != 0;
            if enforced {
                conn.pragma_update(None, "foreign_keys", false)?;
            }
            enforced
        };

        let result = self
            .open_outermost(thread::current().id(), LockMode::Exclusive, None)
            .and_then(|lock| self.run_scope(lock, f));

        if enforced {
            if let Err(err) = self.inner.conn().pragma_update(None, "foreign_keys", true) {
                if result.is_ok() {
                    return Err(err.into());
                }
                log::warn!("re-enabling foreign keys on `{}`: {err}", self.name());
            }
        }
        drop(token);
        result
    }

    /// Execute one or more statements without parameters.
    pub fn execute_sql(&self, sql: &str) -> Result<()> {
        self.with_conn(LockMode::Exclusive, |conn| Ok(conn.execute_batch(sql)?))?;
        // Any of them may have changed a table layout.
        self.invalidate_table_info(None);
        Ok(())
    }

    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.with_conn(LockMode::Exclusive, |conn| Ok(conn.execute(sql, params)?))
    }

    /// Insert one row and return its rowid.
    pub fn insert(&self, table: &str, values: &[(&str, Value)]) -> Result<i64> {
        let sql = if values.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table))
        } else {
            let columns: Vec<String> = values.iter().map(|(c, _)| quote_ident(c)).collect();
            let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                columns.join(", "),
                placeholders.join(", ")
            )
        };
        self.with_conn(LockMode::Exclusive, |conn| {
            conn.execute(&sql, params_from_iter(values.iter().map(|(_, v)| v)))
                .map(|_| conn.last_insert_rowid())
                .map_err(|err| StoreError::write_failed(format!("insert into {table}"), err))
        })
    }

    /// Update rows matching `where_clause` (all rows when `None`).
    ///
    /// Placeholders in `where_clause` are numbered after the assigned values.
    pub fn update(
        &self,
        table: &str,
        values: &[(&str, Value)],
        where_clause: Option<&str>,
        where_args: &[Value],
    ) -> Result<usize> {
        let assignments: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(i, (c, _))| format!("{} = ?{}", quote_ident(c), i + 1))
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            quote_ident(table),
            assignments.join(", ")
        );
        if let Some(clause) = where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        let args = values.iter().map(|(_, v)| v).chain(where_args);
        self.with_conn(LockMode::Exclusive, |conn| {
            conn.execute(&sql, params_from_iter(args))
                .map_err(|err| StoreError::write_failed(format!("update {table}"), err))
        })
    }

    pub fn delete(
        &self,
        table: &str,
        where_clause: Option<&str>,
        where_args: &[Value],
    ) -> Result<usize> {
        let mut sql = format!("DELETE FROM {}", quote_ident(table));
        if let Some(clause) = where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        self.with_conn(LockMode::Exclusive, |conn| {
            conn.execute(&sql, params_from_iter(where_args))
                .map_err(|err| StoreError::write_failed(format!("delete from {table}"), err))
        })
    }

    /// Compile `sql` against this store's connection.
    ///
    /// Compiling does not take a lock token: it only reads the schema, and
    /// statement caches call it while holding their own mutex.
    pub fn compile_statement(&self, name: &str, sql: &str) -> Result<SyncStatement> {
        let read_only = {
            let conn = self.inner.conn();
            let stmt = conn.prepare_cached(sql)?;
            stmt.readonly()
        };
        Ok(SyncStatement::new(self.clone(), name, sql, read_only))
    }

    /// Evict `sql` from the connection's compiled-statement cache. SQL that no
    /// longer compiles was never cached and is skipped.
    pub(crate) fn discard_cached(&self, sql: &str) {
        if let Ok(stmt) = self.inner.conn().prepare_cached(sql) {
            stmt.discard();
        }
    }

    /// Run a query and materialise its rows under a shared token.
    pub fn raw_query(&self, sql: &str, args: &[Value]) -> Result<SyncCursor> {
        SyncCursor::open(self.clone(), Arc::from(sql), args.to_vec(), LockMode::Shared)
    }

    /// Like [`SynchronizedDb::raw_query`], reporting column types declared by `table`.
    pub fn raw_query_typed(&self, sql: &str, args: &[Value], table: &str) -> Result<TypedCursor> {
        Ok(TypedCursor::new(self.raw_query(sql, args)?, Some(table)))
    }

    pub(crate) fn fetch_rows(
        &self,
        mode: LockMode,
        sql: &str,
        args: &[Value],
    ) -> Result<(Arc<[String]>, Vec<Vec<Value>>)> {
        self.with_conn(mode, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let columns: Arc<[String]> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();
            let width = columns.len();
            let mut rows = stmt.query(params_from_iter(args))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(width);
                for index in 0..width {
                    values.push(row.get::<_, Value>(index)?);
                }
                out.push(values);
            }
            Ok((columns, out))
        })
    }

    /// Declared layout of `table`, cached until the next schema change.
    pub fn table_info(&self, table: &str) -> Result<Arc<TableInfo>> {
        let key = table.to_ascii_lowercase();
        if let Some(info) = self
            .inner
            .tables
            .lock()
            .expect("table info mutex poisoned")
            .get(&key)
        {
            return Ok(Arc::clone(info));
        }

        let info = self
            .with_conn(LockMode::Shared, |conn| Ok(TableInfo::load(conn, table)?))?
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let info = Arc::new(info);
        self.inner
            .tables
            .lock()
            .expect("table info mutex poisoned")
            .put(key, Arc::clone(&info));
        Ok(info)
    }

    /// Forget cached layouts: one table, or all of them with `None`.
    pub fn invalidate_table_info(&self, table: Option<&str>) {
        let mut tables = self.inner.tables.lock().expect("table info mutex poisoned");
        match table {
            Some(table) => {
                tables.pop(&table.to_ascii_lowercase());
            }
            None => tables.clear(),
        }
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        self.with_conn(LockMode::Shared, |conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE)",
                [table],
                |row| row.get(0),
            )?)
        })
    }

    pub fn drop_table(&self, table: &str) -> Result<()> {
        self.execute_sql(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
    }

    /// Drop `definition`'s table, losing its rows, and create it afresh.
    pub fn recreate(&self, definition: &TableDefinition) -> Result<()> {
        self.with_transaction(true, |db| {
            db.drop_table(definition.name())?;
            definition.create(db)
        })
    }

    pub fn optimize(&self) -> Result<()> {
        self.with_conn(LockMode::Exclusive, |conn| {
            Ok(conn.execute_batch("PRAGMA optimize")?)
        })
    }

    /// Gather planner statistics for one table, or the whole store.
    pub fn analyze(&self, table: Option<&str>) -> Result<()> {
        let sql = match table {
            Some(table) => format!("ANALYZE {}", quote_ident(table)),
            None => "ANALYZE".to_string(),
        };
        self.with_conn(LockMode::Exclusive, |conn| Ok(conn.execute_batch(&sql)?))
    }

    pub fn foreign_keys_enabled(&self) -> Result<bool> {
        self.with_conn(LockMode::Shared, |conn| {
            Ok(conn.pragma_query_value(None, "foreign_keys", |row| row.get::<_, i64>(0))? != 0)
        })
    }

    /// Has no effect while a transaction is open; the engine ignores it.
    pub fn set_foreign_keys(&self, enabled: bool) -> Result<()> {
        self.with_conn(LockMode::Exclusive, |conn| {
            Ok(conn.pragma_update(None, "foreign_keys", enabled)?)
        })
    }

    pub fn user_version(&self) -> Result<u32> {
        self.with_conn(LockMode::Shared, |conn| {
            let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
            Ok(u32::try_from(version).unwrap_or(0))
        })
    }

    pub(crate) fn set_user_version(&self, version: u32) -> Result<()> {
        self.with_conn(LockMode::Exclusive, |conn| {
            Ok(conn.pragma_update(None, "user_version", version)?)
        })
    }
}

/// An open transaction scope on one thread.
///
/// End it with [`SynchronizedDb::end_transaction`]. A scope dropped without
/// being ended counts as unsuccessful.
#[must_use = "a transaction scope must be ended with end_transaction"]
pub struct TxLock {
    db: SynchronizedDb,
    owner: ThreadId,
    mode: LockMode,
    depth: usize,
    token: Option<LockToken>,
    ended: bool,
}

impl TxLock {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// 1 for the outermost scope.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_outermost(&self) -> bool {
        self.depth == 1
    }
}

impl fmt::Debug for TxLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxLock")
            .field("store", &self.db.name())
            .field("mode", &self.mode)
            .field("depth", &self.depth)
            .finish()
    }
}

impl Drop for TxLock {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        let db = self.db.clone();
        log::warn!(
            "transaction scope {} on `{}` dropped without end_transaction",
            self.depth,
            db.name()
        );
        if let Err(err) = db.finish_scope(self, true) {
            log::error!("abandoning transaction on `{}`: {err}", db.name());
        }
    }
}
