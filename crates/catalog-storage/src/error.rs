use crate::context::StoreKind;
use crate::migrate::MigrationStep;
use crate::sync::LockMode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock protocol violation: {0}")]
    LockProtocol(LockProtocolError),
    #[error("gave up waiting for a {mode} lock after {waited:?}")]
    LockTimeout { mode: LockMode, waited: Duration },
    #[error("transaction error: {0}")]
    Transaction(TransactionError),
    #[error("column not present: {0}")]
    ColumnNotPresent(String),
    #[error("write failed: {context}")]
    WriteFailed {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("migration of table `{table}` failed at step {step}")]
    MigrationFailed {
        table: String,
        step: MigrationStep,
        #[source]
        source: Box<StoreError>,
    },
    #[error("statement `{0}` is closed")]
    StatementClosed(String),
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("columns {columns:?} of table `{table}` are neither kept, renamed nor removed")]
    SchemaDrift { table: String, columns: Vec<String> },
    #[error("store `{store}` is at version {found}, newer than supported version {expected}")]
    Downgrade {
        store: String,
        found: u32,
        expected: u32,
    },
    #[error("store {0} is already initialized")]
    AlreadyInitialized(StoreKind),
    #[error("foreign key enforcement cannot be switched off inside an open transaction")]
    ForeignKeysEnforced,
    #[error("{count} foreign key violation(s) in table `{table}`")]
    ForeignKeyViolations { table: String, count: usize },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Misuse of the lock contract.
///
/// Release-side violations are only reported (see [`crate::sync`]); the
/// acquire-side `Upgrade` variant is returned because granting it would
/// deadlock the calling thread.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockProtocolError {
    #[error("lock token {token} released but not held by `{store}`")]
    NotHeld { store: String, token: u64 },
    #[error("lock token from `{owner}` released through `{store}`")]
    ForeignToken { store: String, owner: String },
    #[error("exclusive lock requested on `{store}` while this thread already holds a {held} lock")]
    Upgrade { store: String, held: LockMode },
    #[error("transaction scope ended out of order on `{store}` (depth {depth}, open scopes {open})")]
    ScopeOrder {
        store: String,
        depth: usize,
        open: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("no transaction started on this thread")]
    NotStarted,
    #[error("write attempted inside a shared transaction")]
    WriteInsideShared,
    #[error("transaction handle belongs to a different store")]
    WrongStore,
    #[error("transaction rolled back because a nested scope did not succeed")]
    RolledBack,
}

impl StoreError {
    pub(crate) fn write_failed(context: impl Into<String>, source: rusqlite::Error) -> Self {
        StoreError::WriteFailed {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn migration(table: &str, step: MigrationStep, source: StoreError) -> Self {
        StoreError::MigrationFailed {
            table: table.to_string(),
            step,
            source: Box::new(source),
        }
    }
}
