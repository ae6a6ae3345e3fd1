use crate::cursor::{ColumnType, Cursor};
use crate::error::{Result, StoreError};
use rusqlite::types::Value;
use serde::Serialize;
use std::collections::BTreeMap;

/// A column value exported by [`CursorRow::to_map`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Blob(Vec<u8>),
}

/// Named access to the current row of a cursor.
///
/// Null values read as defaults: `""` for strings, `0` for numbers, `false`
/// for booleans. A column name missing from the result set is always
/// [`StoreError::ColumnNotPresent`].
pub struct CursorRow<'a, C: Cursor> {
    cursor: &'a C,
}

impl<'a, C: Cursor> CursorRow<'a, C> {
    pub fn new(cursor: &'a C) -> Self {
        Self { cursor }
    }

    pub fn contains(&self, column: &str) -> bool {
        self.cursor.column_index(column).is_some()
    }

    fn lookup(&self, column: &str) -> Result<(usize, Option<&'a Value>)> {
        let index = self
            .cursor
            .column_index(column)
            .ok_or_else(|| StoreError::ColumnNotPresent(column.to_string()))?;
        Ok((index, self.cursor.value(index)))
    }

    pub fn get_string_opt(&self, column: &str) -> Result<Option<String>> {
        let (_, value) = self.lookup(column)?;
        Ok(value.and_then(value_to_string))
    }

    pub fn get_string(&self, column: &str) -> Result<String> {
        Ok(self.get_string_opt(column)?.unwrap_or_default())
    }

    pub fn get_long(&self, column: &str) -> Result<i64> {
        let (_, value) = self.lookup(column)?;
        Ok(value.map(value_to_i64).unwrap_or(0))
    }

    /// Truncates to 32 bits like the engine's own integer accessor.
    pub fn get_int(&self, column: &str) -> Result<i32> {
        Ok(self.get_long(column)? as i32)
    }

    pub fn get_double(&self, column: &str) -> Result<f64> {
        let (_, value) = self.lookup(column)?;
        Ok(value.map(value_to_f64).unwrap_or(0.0))
    }

    pub fn get_bool(&self, column: &str) -> Result<bool> {
        let (_, value) = self.lookup(column)?;
        Ok(value.is_some_and(value_to_bool))
    }

    pub fn get_blob(&self, column: &str) -> Result<Option<Vec<u8>>> {
        let (_, value) = self.lookup(column)?;
        Ok(match value {
            Some(Value::Blob(bytes)) => Some(bytes.clone()),
            Some(Value::Text(text)) => Some(text.clone().into_bytes()),
            Some(Value::Null) | None => None,
            Some(other) => value_to_string(other).map(String::into_bytes),
        })
    }

    /// Every non-null column of the current row, shaped by the cursor's
    /// reported column type. Null columns are omitted.
    pub fn to_map(&self) -> BTreeMap<String, ColumnValue> {
        let mut out = BTreeMap::new();
        for (index, name) in self.cursor.column_names().iter().enumerate() {
            let Some(value) = self.cursor.value(index) else {
                continue;
            };
            if matches!(value, Value::Null) {
                continue;
            }
            let exported = match self.cursor.column_type(index) {
                ColumnType::Null => continue,
                ColumnType::Boolean => ColumnValue::Bool(value_to_bool(value)),
                ColumnType::Integer => match value {
                    Value::Real(f) => ColumnValue::Real(*f),
                    other => ColumnValue::Integer(value_to_i64(other)),
                },
                ColumnType::Real => ColumnValue::Real(value_to_f64(value)),
                ColumnType::Blob => match value {
                    Value::Blob(bytes) => ColumnValue::Blob(bytes.clone()),
                    other => ColumnValue::Text(value_to_string(other).unwrap_or_default()),
                },
                ColumnType::Text | ColumnType::Date | ColumnType::DateTime => {
                    ColumnValue::Text(value_to_string(value).unwrap_or_default())
                }
            };
            out.insert(name.clone(), exported);
        }
        out
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.to_map())?)
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(f.to_string()),
        Value::Text(text) => Some(text.clone()),
        Value::Blob(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Text(text) if text.trim().eq_ignore_ascii_case("true") => true,
        other => value_to_i64(other) != 0,
    }
}

/// Longest prefix of `text` (after leading whitespace) that reads as a
/// number: sign, digits, and with `real` also a fraction and exponent.
fn numeric_prefix(text: &str, real: bool) -> &str {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let digits_from = |mut at: usize| {
        while at < bytes.len() && bytes[at].is_ascii_digit() {
            at += 1;
        }
        at
    };

    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let sign = end;
    end = digits_from(end);
    let mut has_digits = end > sign;
    if real {
        if bytes.get(end) == Some(&b'.') {
            let fraction = digits_from(end + 1);
            has_digits |= fraction > end + 1;
            end = fraction;
        }
        if has_digits && matches!(bytes.get(end), Some(b'e' | b'E')) {
            let mut at = end + 1;
            if matches!(bytes.get(at), Some(b'+' | b'-')) {
                at += 1;
            }
            let exponent = digits_from(at);
            if exponent > at {
                end = exponent;
            }
        }
    }
    if has_digits {
        &text[..end]
    } else {
        ""
    }
}

fn value_to_i64(value: &Value) -> i64 {
    match value {
        Value::Integer(i) => *i,
        Value::Real(f) => *f as i64,
        Value::Text(text) => {
            let prefix = numeric_prefix(text, false);
            prefix.parse::<i64>().unwrap_or_else(|_| match prefix {
                "" => 0,
                negative if negative.starts_with('-') => i64::MIN,
                _ => i64::MAX,
            })
        }
        Value::Null | Value::Blob(_) => 0,
    }
}

fn value_to_f64(value: &Value) -> f64 {
    match value {
        Value::Integer(i) => *i as f64,
        Value::Real(f) => *f,
        Value::Text(text) => numeric_prefix(text, true).parse().unwrap_or(0.0),
        Value::Null | Value::Blob(_) => 0.0,
    }
}
