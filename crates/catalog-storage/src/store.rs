//! Store descriptors and the lifecycle callbacks run when a store is opened.

use crate::db::SynchronizedDb;
use crate::error::Result;
use crate::migrate::{add_columns, rebuild_table, RebuildOptions};
use crate::schema::{ColumnDef, TableDefinition};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Hooks run by [`SynchronizedDb::open`].
///
/// `on_create` and `on_upgrade` run inside one write transaction with
/// foreign-key enforcement off; `on_open` runs afterwards with enforcement on.
pub trait StoreCallbacks: Send + Sync {
    /// Create every table and index of the current version.
    fn on_create(&self, db: &SynchronizedDb) -> Result<()>;

    /// Bring a store at `old_version` up to `new_version`.
    fn on_upgrade(&self, db: &SynchronizedDb, old_version: u32, new_version: u32) -> Result<()>;

    fn on_open(&self, _db: &SynchronizedDb) -> Result<()> {
        Ok(())
    }
}

/// One logical store: its name, file and schema version (starting at 1).
#[derive(Clone)]
pub struct StoreDescriptor {
    pub name: String,
    pub file_name: String,
    pub version: u32,
    pub callbacks: Arc<dyn StoreCallbacks>,
}

impl StoreDescriptor {
    pub fn new(
        name: impl Into<String>,
        file_name: impl Into<String>,
        version: u32,
        callbacks: impl StoreCallbacks + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            file_name: file_name.into(),
            version,
            callbacks: Arc::new(callbacks),
        }
    }
}

impl fmt::Debug for StoreDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreDescriptor")
            .field("name", &self.name)
            .field("file_name", &self.file_name)
            .field("version", &self.version)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum UpgradeStep {
    Execute(String),
    AddColumns {
        table: String,
        columns: Vec<ColumnDef>,
    },
    Rebuild {
        target: TableDefinition,
        options: RebuildOptions,
    },
}

impl UpgradeStep {
    fn apply(&self, db: &SynchronizedDb) -> Result<()> {
        match self {
            UpgradeStep::Execute(sql) => db.execute_sql(sql),
            UpgradeStep::AddColumns { table, columns } => {
                add_columns(db, table, columns).map(|_| ())
            }
            UpgradeStep::Rebuild { target, options } => {
                rebuild_table(db, target, options).map(|_| ())
            }
        }
    }
}

/// Callbacks for a store whose data must survive upgrades.
///
/// `tables` is the layout of the latest version. Steps registered for version
/// `n` take a store from `n - 1` to `n`; an upgrade applies every step above
/// the old version up to the new one, in order.
#[derive(Debug, Clone, Default)]
pub struct VersionedSchema {
    tables: Vec<TableDefinition>,
    steps: BTreeMap<u32, Vec<UpgradeStep>>,
}

impl VersionedSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TableDefinition) -> Self {
        self.tables.push(table);
        self
    }

    pub fn step(mut self, version: u32, step: UpgradeStep) -> Self {
        self.steps.entry(version).or_default().push(step);
        self
    }

    pub fn tables(&self) -> &[TableDefinition] {
        &self.tables
    }
}

impl StoreCallbacks for VersionedSchema {
    fn on_create(&self, db: &SynchronizedDb) -> Result<()> {
        for table in &self.tables {
            table.create(db)?;
        }
        Ok(())
    }

    fn on_upgrade(&self, db: &SynchronizedDb, old_version: u32, new_version: u32) -> Result<()> {
        for (version, steps) in self.steps.range(old_version + 1..=new_version) {
            log::debug!("applying {} upgrade step(s) for version {version}", steps.len());
            for step in steps {
                step.apply(db)?;
            }
        }
        Ok(())
    }
}

/// Callbacks for a pure cache: any upgrade drops every table and starts over.
#[derive(Debug, Clone, Default)]
pub struct CacheSchema {
    tables: Vec<TableDefinition>,
}

impl CacheSchema {
    pub fn new(tables: Vec<TableDefinition>) -> Self {
        Self { tables }
    }
}

impl StoreCallbacks for CacheSchema {
    fn on_create(&self, db: &SynchronizedDb) -> Result<()> {
        for table in &self.tables {
            table.create(db)?;
        }
        Ok(())
    }

    fn on_upgrade(&self, db: &SynchronizedDb, old_version: u32, new_version: u32) -> Result<()> {
        log::info!(
            "discarding cache `{}` on upgrade from version {old_version} to {new_version}",
            db.name()
        );
        for table in &self.tables {
            db.drop_table(table.name())?;
        }
        self.on_create(db)
    }
}
