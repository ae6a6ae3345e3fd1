//! Table descriptors: the declared layout used to create tables, and the
//! layout read back from the engine.

use crate::cursor::ColumnType;
use crate::db::SynchronizedDb;
use crate::error::Result;
use rusqlite::Connection;

/// Double-quote an identifier for use in generated SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Null,
    CurrentTimestamp,
    /// Raw SQL expression, rendered in parentheses.
    Expression(String),
}

impl DefaultValue {
    fn to_sql(&self) -> String {
        match self {
            DefaultValue::Integer(i) => i.to_string(),
            DefaultValue::Real(f) => format!("{f:?}"),
            DefaultValue::Text(text) => format!("'{}'", text.replace('\'', "''")),
            DefaultValue::Boolean(b) => (if *b { "1" } else { "0" }).to_string(),
            DefaultValue::Null => "NULL".to_string(),
            DefaultValue::CurrentTimestamp => "CURRENT_TIMESTAMP".to_string(),
            DefaultValue::Expression(expr) => format!("({expr})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub not_null: bool,
    pub default: Option<DefaultValue>,
    pub primary_key: bool,
    pub autoincrement: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            not_null: false,
            default: None,
            primary_key: false,
            autoincrement: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn default_value(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn autoincrement(mut self) -> Self {
        self.primary_key = true;
        self.autoincrement = true;
        self
    }

    /// Column clause as used in `CREATE TABLE` and `ALTER TABLE ... ADD COLUMN`.
    pub fn definition_sql(&self) -> String {
        self.render(true)
    }

    fn render(&self, inline_primary_key: bool) -> String {
        let mut sql = quote_ident(&self.name);
        let declared = self.column_type.declared_name();
        if !declared.is_empty() {
            sql.push(' ');
            sql.push_str(declared);
        }
        if inline_primary_key && self.primary_key {
            sql.push_str(" PRIMARY KEY");
            if self.autoincrement {
                sql.push_str(" AUTOINCREMENT");
            }
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default.to_sql());
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    /// The index is named `{table}_{suffix}`.
    pub suffix: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

impl IndexDef {
    pub fn new<I, S>(suffix: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            suffix: suffix.into(),
            unique: false,
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn index_name(&self, table: &str) -> String {
        format!("{table}_{}", self.suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForeignKeyAction {
    #[default]
    NoAction,
    Cascade,
    SetNull,
    SetDefault,
    Restrict,
}

impl ForeignKeyAction {
    fn as_sql(self) -> &'static str {
        match self {
            ForeignKeyAction::NoAction => "NO ACTION",
            ForeignKeyAction::Cascade => "CASCADE",
            ForeignKeyAction::SetNull => "SET NULL",
            ForeignKeyAction::SetDefault => "SET DEFAULT",
            ForeignKeyAction::Restrict => "RESTRICT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDef {
    pub columns: Vec<String>,
    pub foreign_table: String,
    pub foreign_columns: Vec<String>,
    pub on_delete: ForeignKeyAction,
}

impl ForeignKeyDef {
    pub fn new(column: &str, foreign_table: &str, foreign_column: &str) -> Self {
        Self {
            columns: vec![column.to_string()],
            foreign_table: foreign_table.to_string(),
            foreign_columns: vec![foreign_column.to_string()],
            on_delete: ForeignKeyAction::NoAction,
        }
    }

    pub fn on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = action;
        self
    }
}

/// Declared layout of one table. Immutable once the table exists; a rebuild
/// takes a new definition for the same table name.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    name: String,
    columns: Vec<ColumnDef>,
    primary_key: Vec<String>,
    indexes: Vec<IndexDef>,
    foreign_keys: Vec<ForeignKeyDef>,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Composite primary key. Overrides per-column `primary_key` flags.
    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_foreign_key(mut self, foreign_key: ForeignKeyDef) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    /// Case-insensitive, like SQLite identifiers.
    pub fn find_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// `CREATE TABLE` for this layout under `physical_name`.
    pub fn create_sql(&self, physical_name: &str) -> String {
        let table_pk: Vec<&str> = if self.primary_key.is_empty() {
            let flagged: Vec<&str> = self
                .columns
                .iter()
                .filter(|c| c.primary_key)
                .map(|c| c.name.as_str())
                .collect();
            if flagged.len() > 1 {
                flagged
            } else {
                Vec::new()
            }
        } else {
            self.primary_key.iter().map(String::as_str).collect()
        };
        let inline_pk = table_pk.is_empty();

        let mut clauses: Vec<String> = self
            .columns
            .iter()
            .map(|c| c.render(inline_pk))
            .collect();
        if !table_pk.is_empty() {
            clauses.push(format!("PRIMARY KEY ({})", quote_list(table_pk)));
        }
        for fk in &self.foreign_keys {
            clauses.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
                quote_list(&fk.columns),
                quote_ident(&fk.foreign_table),
                quote_list(&fk.foreign_columns),
                fk.on_delete.as_sql()
            ));
        }

        format!(
            "CREATE TABLE {} ({})",
            quote_ident(physical_name),
            clauses.join(", ")
        )
    }

    /// `CREATE INDEX` statements for the table under its own name.
    pub fn index_sql(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|index| {
                format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    if index.unique { "UNIQUE " } else { "" },
                    quote_ident(&index.index_name(&self.name)),
                    quote_ident(&self.name),
                    quote_list(&index.columns)
                )
            })
            .collect()
    }

    /// Create the table and its indexes.
    pub fn create(&self, db: &SynchronizedDb) -> Result<()> {
        db.execute_sql(&self.create_sql(&self.name))?;
        for sql in self.index_sql() {
            db.execute_sql(&sql)?;
        }
        Ok(())
    }
}

fn quote_list<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One column as reported by `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub cid: i64,
    pub name: String,
    pub declared: String,
    /// `None` when the column has no declared type.
    pub column_type: Option<ColumnType>,
    pub not_null: bool,
    pub default: Option<String>,
    /// 1-based position in the primary key, 0 if not part of it.
    pub pk: i64,
}

/// Layout of an existing table as the engine reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    /// Read the layout of `table`; `None` if it does not exist.
    pub(crate) fn load(conn: &Connection, table: &str) -> rusqlite::Result<Option<Self>> {
        let mut stmt = conn.prepare_cached(
            "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1)",
        )?;
        let columns = stmt
            .query_map([table], |row| {
                let declared: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
                Ok(ColumnInfo {
                    cid: row.get(0)?,
                    name: row.get(1)?,
                    column_type: (!declared.trim().is_empty())
                        .then(|| ColumnType::from_declared(&declared)),
                    declared,
                    not_null: row.get::<_, i64>(3)? != 0,
                    default: row.get(4)?,
                    pk: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if columns.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            name: table.to_string(),
            columns,
        }))
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}
