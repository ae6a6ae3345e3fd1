//! SQLite access layer for a catalog store and its image caches.
//!
//! Every store is one SQLite file with one connection, shared by many
//! threads. The crate provides:
//! - a reader/writer [`Synchronizer`] per store, so readers run concurrently
//!   and writers are serialized instead of hitting `SQLITE_BUSY`
//! - nested, per-thread transactions through [`SynchronizedDb`]
//! - named statement caches that are closed explicitly and audited for leaks
//! - cursors that report declared column types instead of stored ones
//! - in-place table rebuilds for layout changes `ALTER TABLE` cannot express
//! - a [`StorageContext`] that opens each store once and can be torn down

mod audit;
mod blob_cache;
mod config;
mod context;
mod cursor;
mod db;
mod error;
pub mod migrate;
mod row;
pub mod schema;
mod statement;
mod store;
mod sync;

pub use audit::LeakAuditor;
pub use blob_cache::{blob_cache_descriptor, image_table, BlobCache, BLOB_CACHE_VERSION, IMAGE_TABLE};
pub use config::StorageConfig;
pub use context::{StorageContext, StoreKind};
pub use cursor::{ColumnType, Cursor, SyncCursor, TypedCursor};
pub use db::{SynchronizedDb, TxLock, TxOutcome};
pub use error::{LockProtocolError, Result, StoreError, TransactionError};
pub use migrate::{add_columns, rebuild_table, CopyPlan, DriftPolicy, MigrationStep, RebuildOptions, RebuildReport};
pub use row::{ColumnValue, CursorRow};
pub use schema::{ColumnDef, ColumnInfo, DefaultValue, IndexDef, TableDefinition, TableInfo};
pub use statement::{StatementCache, SyncStatement};
pub use store::{CacheSchema, StoreCallbacks, StoreDescriptor, UpgradeStep, VersionedSchema};
pub use sync::{LockMode, LockToken, SyncStats, Synchronizer};
