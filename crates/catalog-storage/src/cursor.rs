//! Row cursors over materialised result sets.
//!
//! [`SyncCursor`] runs its query under a lock token from the owning store and
//! keeps the rows, so iterating it never touches the connection again.
//! [`TypedCursor`] wraps one and reports each column's declared schema type
//! instead of the type sniffed from the stored value.

use crate::db::SynchronizedDb;
use crate::error::Result;
use crate::row::CursorRow;
use crate::schema::TableInfo;
use crate::sync::LockMode;
use rusqlite::types::{Value, ValueRef};
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Null,
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
    Date,
    DateTime,
}

impl ColumnType {
    /// Map a declared column type to a [`ColumnType`].
    ///
    /// Date and boolean names are recognised first; anything else follows
    /// SQLite's type-affinity rules.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or_default().trim();
        match base {
            "DATE" => return ColumnType::Date,
            "DATETIME" | "TIMESTAMP" => return ColumnType::DateTime,
            "BOOLEAN" | "BOOL" => return ColumnType::Boolean,
            _ => {}
        }

        if base.contains("INT") {
            ColumnType::Integer
        } else if base.contains("CHAR") || base.contains("CLOB") || base.contains("TEXT") {
            ColumnType::Text
        } else if base.is_empty() || base.contains("BLOB") {
            ColumnType::Blob
        } else {
            // REAL, FLOAT, DOUBLE and NUMERIC affinity.
            ColumnType::Real
        }
    }

    /// Runtime type of a stored value.
    pub fn from_value(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => ColumnType::Null,
            ValueRef::Integer(_) => ColumnType::Integer,
            ValueRef::Real(_) => ColumnType::Real,
            ValueRef::Text(_) => ColumnType::Text,
            ValueRef::Blob(_) => ColumnType::Blob,
        }
    }

    /// Type name used when rendering `CREATE TABLE`.
    pub fn declared_name(self) -> &'static str {
        match self {
            ColumnType::Null => "",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::DateTime => "DATETIME",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Null => f.write_str("null"),
            other => f.write_str(&other.declared_name().to_ascii_lowercase()),
        }
    }
}

/// Forward-only-or-random-access view over a result set.
///
/// A fresh cursor is positioned before the first row.
pub trait Cursor {
    fn column_names(&self) -> &[String];

    fn column_index(&self, name: &str) -> Option<usize> {
        let names = self.column_names();
        names
            .iter()
            .position(|c| c == name)
            .or_else(|| names.iter().position(|c| c.eq_ignore_ascii_case(name)))
    }

    fn row_count(&self) -> usize;

    /// Current row, or `None` before the first / after the last row.
    fn position(&self) -> Option<usize>;

    fn move_to_position(&mut self, position: usize) -> bool;

    fn move_to_first(&mut self) -> bool {
        self.move_to_position(0)
    }

    fn move_to_next(&mut self) -> bool;

    /// Value of column `index` in the current row.
    fn value(&self, index: usize) -> Option<&Value>;

    fn column_type(&self, index: usize) -> ColumnType;

    fn row(&self) -> CursorRow<'_, Self>
    where
        Self: Sized,
    {
        CursorRow::new(self)
    }
}

pub struct SyncCursor {
    db: SynchronizedDb,
    sql: Arc<str>,
    params: Vec<Value>,
    mode: LockMode,
    columns: Arc<[String]>,
    rows: Vec<Vec<Value>>,
    pos: isize,
    closed: bool,
}

impl SyncCursor {
    pub(crate) fn open(
        db: SynchronizedDb,
        sql: Arc<str>,
        params: Vec<Value>,
        mode: LockMode,
    ) -> Result<Self> {
        let (columns, rows) = db.fetch_rows(mode, &sql, &params)?;
        Ok(Self {
            db,
            sql,
            params,
            mode,
            columns,
            rows,
            pos: -1,
            closed: false,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn db(&self) -> &SynchronizedDb {
        &self.db
    }

    /// Run the query again and move back before the first row.
    pub fn requery(&mut self) -> Result<()> {
        let (columns, rows) = self.db.fetch_rows(self.mode, &self.sql, &self.params)?;
        self.columns = columns;
        self.rows = rows;
        self.pos = -1;
        self.closed = false;
        Ok(())
    }

    pub fn close(&mut self) {
        self.rows = Vec::new();
        self.pos = -1;
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn current(&self) -> Option<&[Value]> {
        usize::try_from(self.pos)
            .ok()
            .and_then(|pos| self.rows.get(pos))
            .map(Vec::as_slice)
    }
}

impl fmt::Debug for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCursor")
            .field("store", &self.db.name())
            .field("sql", &self.sql)
            .field("rows", &self.rows.len())
            .field("pos", &self.pos)
            .finish()
    }
}

impl Cursor for SyncCursor {
    fn column_names(&self) -> &[String] {
        &self.columns
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn position(&self) -> Option<usize> {
        self.current().map(|_| self.pos as usize)
    }

    fn move_to_position(&mut self, position: usize) -> bool {
        if position < self.rows.len() {
            self.pos = position as isize;
            true
        } else {
            self.pos = self.rows.len() as isize;
            false
        }
    }

    fn move_to_next(&mut self) -> bool {
        let next = usize::try_from(self.pos + 1).unwrap_or(0);
        self.move_to_position(next)
    }

    fn value(&self, index: usize) -> Option<&Value> {
        self.current().and_then(|row| row.get(index))
    }

    fn column_type(&self, index: usize) -> ColumnType {
        match self.value(index) {
            Some(value) => ColumnType::from_value(value.into()),
            None => ColumnType::Null,
        }
    }
}

/// Reports declared column types for a bound table.
///
/// The table descriptor is looked up at most once per cursor, on the first
/// [`Cursor::column_type`] call. Columns the descriptor does not know, and
/// every column when no table is bound or the lookup fails, report the
/// runtime type of the wrapped cursor.
pub struct TypedCursor {
    inner: SyncCursor,
    table: Option<String>,
    declared: OnceCell<Option<Arc<TableInfo>>>,
}

impl TypedCursor {
    pub fn new(inner: SyncCursor, table: Option<&str>) -> Self {
        Self {
            inner,
            table: table.map(str::to_string),
            declared: OnceCell::new(),
        }
    }

    pub fn unbound(inner: SyncCursor) -> Self {
        Self::new(inner, None)
    }

    pub fn bound_table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn inner(&self) -> &SyncCursor {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut SyncCursor {
        &mut self.inner
    }

    pub fn into_inner(self) -> SyncCursor {
        self.inner
    }

    fn schema(&self) -> Option<&TableInfo> {
        self.declared
            .get_or_init(|| {
                let table = self.table.as_deref()?;
                match self.inner.db.table_info(table) {
                    Ok(info) => Some(info),
                    Err(err) => {
                        log::warn!("no declared types for `{table}`, using stored types: {err}");
                        None
                    }
                }
            })
            .as_deref()
    }
}

impl fmt::Debug for TypedCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedCursor")
            .field("table", &self.table)
            .field("inner", &self.inner)
            .finish()
    }
}

impl Cursor for TypedCursor {
    fn column_names(&self) -> &[String] {
        self.inner.column_names()
    }

    fn row_count(&self) -> usize {
        self.inner.row_count()
    }

    fn position(&self) -> Option<usize> {
        self.inner.position()
    }

    fn move_to_position(&mut self, position: usize) -> bool {
        self.inner.move_to_position(position)
    }

    fn move_to_next(&mut self) -> bool {
        self.inner.move_to_next()
    }

    fn value(&self, index: usize) -> Option<&Value> {
        self.inner.value(index)
    }

    fn column_type(&self, index: usize) -> ColumnType {
        let declared = self.schema().and_then(|info| {
            let name = self.inner.column_names().get(index)?;
            info.column(name)?.column_type
        });
        declared.unwrap_or_else(|| self.inner.column_type(index))
    }
}
