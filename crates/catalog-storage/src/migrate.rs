//! In-place table rebuilds for layout changes SQLite cannot `ALTER`.
//!
//! A rebuild creates the target layout under a temporary name, copies the
//! retained columns by explicit name, drops the original and renames the copy
//! into place. The whole run is one write transaction, so a failure at any
//! step leaves the original table untouched.

use crate::cursor::Cursor;
use crate::db::SynchronizedDb;
use crate::error::{Result, StoreError, TransactionError};
use crate::schema::{quote_ident, ColumnDef, TableDefinition};
use crate::sync::LockMode;
use rusqlite::types::Value;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationStep {
    ReadSource,
    PlanCopy,
    DisableForeignKeys,
    CreateTemporary,
    CopyRows,
    DropOriginal,
    RenameTemporary,
    RecreateIndexes,
    VerifyForeignKeys,
    EnableForeignKeys,
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationStep::ReadSource => "read-source",
            MigrationStep::PlanCopy => "plan-copy",
            MigrationStep::DisableForeignKeys => "disable-foreign-keys",
            MigrationStep::CreateTemporary => "create-temporary",
            MigrationStep::CopyRows => "copy-rows",
            MigrationStep::DropOriginal => "drop-original",
            MigrationStep::RenameTemporary => "rename-temporary",
            MigrationStep::RecreateIndexes => "recreate-indexes",
            MigrationStep::VerifyForeignKeys => "verify-foreign-keys",
            MigrationStep::EnableForeignKeys => "enable-foreign-keys",
        };
        f.write_str(name)
    }
}

/// What to do with source columns that the target neither has nor was told
/// to drop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DriftPolicy {
    /// Refuse the rebuild with [`StoreError::SchemaDrift`].
    #[default]
    Fail,
    /// Drop them, logging each one.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildOptions {
    /// Source columns to discard.
    pub remove: Vec<String>,
    /// Source column name to target column name.
    pub rename: BTreeMap<String, String>,
    pub drift: DriftPolicy,
    /// Run `PRAGMA foreign_key_check` over the whole database after the rename.
    pub verify_foreign_keys: bool,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            remove: Vec::new(),
            rename: BTreeMap::new(),
            drift: DriftPolicy::Fail,
            verify_foreign_keys: true,
        }
    }
}

impl RebuildOptions {
    pub fn remove(mut self, column: impl Into<String>) -> Self {
        self.remove.push(column.into());
        self
    }

    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rename.insert(from.into(), to.into());
        self
    }

    pub fn drift(mut self, policy: DriftPolicy) -> Self {
        self.drift = policy;
        self
    }

    pub fn verify_foreign_keys(mut self, verify: bool) -> Self {
        self.verify_foreign_keys = verify;
        self
    }

    fn is_removed(&self, column: &str) -> bool {
        self.remove.iter().any(|c| c.eq_ignore_ascii_case(column))
    }

    fn renamed<'a>(&'a self, column: &'a str) -> &'a str {
        self.rename
            .iter()
            .find(|(from, _)| from.eq_ignore_ascii_case(column))
            .map(|(_, to)| to.as_str())
            .unwrap_or(column)
    }
}

/// Column pairing used to copy rows from the source table into the target
/// layout. `source_columns[i]` is copied into `target_columns[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CopyPlan {
    pub source_columns: Vec<String>,
    pub target_columns: Vec<String>,
    /// Source columns dropped because they were listed in `remove`.
    pub removed: Vec<String>,
    /// Source columns dropped because the target does not have them.
    pub drifted: Vec<String>,
}

impl CopyPlan {
    pub fn build(
        source: &[String],
        target: &TableDefinition,
        options: &RebuildOptions,
    ) -> Result<Self> {
        let mut plan = CopyPlan::default();
        for column in source {
            if options.is_removed(column) {
                plan.removed.push(column.clone());
                continue;
            }
            let wanted = options.renamed(column);
            let Some(target_column) = target.find_column(wanted) else {
                plan.drifted.push(column.clone());
                continue;
            };
            if plan
                .target_columns
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&target_column.name))
            {
                // Two source columns map onto one target column.
                plan.drifted.push(column.clone());
                continue;
            }
            plan.source_columns.push(column.clone());
            plan.target_columns.push(target_column.name.clone());
        }

        if !plan.drifted.is_empty() {
            match options.drift {
                DriftPolicy::Fail => {
                    return Err(StoreError::SchemaDrift {
                        table: target.name().to_string(),
                        columns: plan.drifted,
                    });
                }
                DriftPolicy::Drop => {
                    for column in &plan.drifted {
                        log::warn!("rebuild of `{}` drops column `{column}`", target.name());
                    }
                }
            }
        }
        Ok(plan)
    }

    /// `INSERT ... SELECT` copying every planned column; `None` when there is
    /// nothing to copy.
    pub fn copy_sql(&self, from: &str, into: &str) -> Option<String> {
        if self.source_columns.is_empty() {
            return None;
        }
        let quoted = |columns: &[String]| {
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        Some(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote_ident(into),
            quoted(&self.target_columns),
            quoted(&self.source_columns),
            quote_ident(from)
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub rows_copied: usize,
    pub copied_columns: Vec<String>,
    pub dropped_columns: Vec<String>,
}

fn temporary_name(table: &str) -> String {
    format!("copy_of_{table}")
}

/// Rebuild `target.name()` with the layout of `target`, keeping its rows.
///
/// Called outside a transaction, the rebuild holds one exclusive lock while
/// it switches foreign-key enforcement off, runs its write transaction and
/// restores the previous setting. Called inside the thread's write transaction,
/// enforcement must already be off because the engine ignores the pragma
/// there; otherwise the rebuild fails before touching anything.
pub fn rebuild_table(
    db: &SynchronizedDb,
    target: &TableDefinition,
    options: &RebuildOptions,
) -> Result<RebuildReport> {
    let table = target.name();
    match db.transaction_mode() {
        Some(LockMode::Shared) => Err(StoreError::migration(
            table,
            MigrationStep::ReadSource,
            StoreError::Transaction(TransactionError::WriteInsideShared),
        )),
        Some(LockMode::Exclusive) => {
            let enforced = db
                .foreign_keys_enabled()
                .map_err(|err| StoreError::migration(table, MigrationStep::DisableForeignKeys, err))?;
            if enforced {
                return Err(StoreError::migration(
                    table,
                    MigrationStep::DisableForeignKeys,
                    StoreError::ForeignKeysEnforced,
                ));
            }
            rebuild_in_transaction(db, target, options)
        }
        None => {
            let body_ran = Cell::new(false);
            db.with_foreign_keys_suspended(|db| {
                body_ran.set(true);
                rebuild_in_transaction(db, target, options)
            })
            .map_err(|err| match err {
                err @ StoreError::MigrationFailed { .. } => err,
                // Setup failures precede the copy; the rest are the commit or
                // restoring enforcement.
                err if !body_ran.get() => {
                    StoreError::migration(table, MigrationStep::DisableForeignKeys, err)
                }
                err => StoreError::migration(table, MigrationStep::EnableForeignKeys, err),
            })
        }
    }
}

fn rebuild_in_transaction(
    db: &SynchronizedDb,
    target: &TableDefinition,
    options: &RebuildOptions,
) -> Result<RebuildReport> {
    let table = target.name();
    let step = |step: MigrationStep| move |err: StoreError| StoreError::migration(table, step, err);
    log::debug!("rebuilding table `{table}`");

    db.invalidate_table_info(Some(table));
    let source = db.table_info(table).map_err(step(MigrationStep::ReadSource))?;
    let plan = CopyPlan::build(&source.column_names(), target, options)
        .map_err(step(MigrationStep::PlanCopy))?;

    let temporary = temporary_name(table);
    db.execute_sql(&format!("DROP TABLE IF EXISTS {}", quote_ident(&temporary)))
        .and_then(|()| db.execute_sql(&target.create_sql(&temporary)))
        .map_err(step(MigrationStep::CreateTemporary))?;

    let rows_copied = match plan.copy_sql(table, &temporary) {
        Some(sql) => db.execute(&sql, []).map_err(step(MigrationStep::CopyRows))?,
        None => {
            log::warn!("rebuild of `{table}` keeps no columns; rows are not copied");
            0
        }
    };
    log::debug!("copied {rows_copied} row(s) of `{table}`");

    db.execute_sql(&format!("DROP TABLE {}", quote_ident(table)))
        .map_err(step(MigrationStep::DropOriginal))?;
    db.execute_sql(&format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(&temporary),
        quote_ident(table)
    ))
    .map_err(step(MigrationStep::RenameTemporary))?;

    for sql in target.index_sql() {
        db.execute_sql(&sql)
            .map_err(step(MigrationStep::RecreateIndexes))?;
    }

    if options.verify_foreign_keys {
        // Whole-database check: tables that reference the rebuilt one count too.
        let mut violations = db
            .raw_query("PRAGMA foreign_key_check", &[])
            .map_err(step(MigrationStep::VerifyForeignKeys))?;
        let count = violations.row_count();
        if count > 0 {
            let offender = violations
                .column_index("table")
                .filter(|_| violations.move_to_first())
                .and_then(|index| match violations.value(index) {
                    Some(Value::Text(name)) => Some(name.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| table.to_string());
            return Err(StoreError::migration(
                table,
                MigrationStep::VerifyForeignKeys,
                StoreError::ForeignKeyViolations {
                    table: offender,
                    count,
                },
            ));
        }
    }

    db.invalidate_table_info(Some(table));
    log::info!(
        "rebuilt table `{table}`: {} column(s) kept, {} dropped",
        plan.target_columns.len(),
        plan.removed.len() + plan.drifted.len()
    );

    let mut dropped_columns = plan.removed;
    dropped_columns.extend(plan.drifted);
    Ok(RebuildReport {
        rows_copied,
        copied_columns: plan.target_columns,
        dropped_columns,
    })
}

/// Add any of `columns` that `table` does not have yet.
///
/// Returns the names of the columns that were added.
pub fn add_columns(db: &SynchronizedDb, table: &str, columns: &[ColumnDef]) -> Result<Vec<String>> {
    db.with_transaction(true, |db| {
        db.invalidate_table_info(Some(table));
        let existing = db.table_info(table)?;
        let mut added = Vec::new();
        for column in columns {
            if existing.has_column(&column.name) {
                continue;
            }
            db.execute_sql(&format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column.definition_sql()
            ))?;
            added.push(column.name.clone());
        }
        Ok(added)
    })
}
