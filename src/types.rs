//! Core types for the tabular store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier for a table, row, cell, or value. Non-empty, unique within
/// its scope.
pub type Id = String;

/// A single cell or value: exactly one of text, finite number, or boolean.
///
/// `Null` is only ever stored for a cell/value whose schema explicitly
/// allows it; without a schema it fails validation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Text(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl Datum {
    /// The type tag, or `None` for `Null`.
    pub fn datum_type(&self) -> Option<DatumType> {
        match self {
            Datum::Text(_) => Some(DatumType::Text),
            Datum::Number(_) => Some(DatumType::Number),
            Datum::Bool(_) => Some(DatumType::Bool),
            Datum::Null => None,
        }
    }

    /// Whether this datum is acceptable without any schema: text, boolean,
    /// or a finite number. `Null` needs an explicit schema grant.
    pub fn is_valid(&self) -> bool {
        match self {
            Datum::Number(n) => n.is_finite(),
            Datum::Null => false,
            _ => true,
        }
    }

    /// The rejected-input shape recorded in invalid reports.
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Text(s) => write!(f, "{}", s),
            Datum::Number(n) => write!(f, "{}", n),
            Datum::Bool(b) => write!(f, "{}", b),
            Datum::Null => write!(f, "null"),
        }
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::Text(s.to_owned())
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum::Text(s)
    }
}

impl From<f64> for Datum {
    fn from(n: f64) -> Self {
        Datum::Number(n)
    }
}

impl From<i64> for Datum {
    fn from(n: i64) -> Self {
        Datum::Number(n as f64)
    }
}

impl From<i32> for Datum {
    fn from(n: i32) -> Self {
        Datum::Number(n as f64)
    }
}

impl From<bool> for Datum {
    fn from(b: bool) -> Self {
        Datum::Bool(b)
    }
}

/// Type tag carried by a schema entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatumType {
    Text,
    Number,
    Bool,
}

/// A row: cell id to datum. Empty rows do not exist as entities.
pub type Row = BTreeMap<Id, Datum>;

/// A table: row id to row. A table with zero rows is removed.
pub type Table = BTreeMap<Id, Row>;

/// All tables: table id to table.
pub type Tables = BTreeMap<Id, Table>;

/// The flat value namespace: value id to datum.
pub type Values = BTreeMap<Id, Datum>;

/// Whole-content wire shape: `[tables, values]`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Content(pub Tables, pub Values);

impl Content {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty() && self.1.is_empty()
    }
}

/// Cell-level delta: `None` means delete.
pub type CellChanges = BTreeMap<Id, Option<Datum>>;

/// Row-level delta: `None` deletes the whole row.
pub type RowChanges = BTreeMap<Id, Option<CellChanges>>;

/// Table-level delta: `None` deletes the whole table.
pub type TableChanges = BTreeMap<Id, Option<RowChanges>>;

/// Value-level delta: `None` means delete.
pub type ValueChanges = BTreeMap<Id, Option<Datum>>;

/// Transaction-change delta with the same shape as [`Content`], where any
/// field may instead be explicitly absent (meaning "delete").
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentChanges(pub TableChanges, pub ValueChanges);

impl ContentChanges {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty() && self.1.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datum_type_tags() {
        assert_eq!(Datum::from("a").datum_type(), Some(DatumType::Text));
        assert_eq!(Datum::from(1.5).datum_type(), Some(DatumType::Number));
        assert_eq!(Datum::from(true).datum_type(), Some(DatumType::Bool));
        assert_eq!(Datum::Null.datum_type(), None);
    }

    #[test]
    fn test_datum_validity() {
        assert!(Datum::from("a").is_valid());
        assert!(Datum::from(0).is_valid());
        assert!(!Datum::Number(f64::NAN).is_valid());
        assert!(!Datum::Number(f64::INFINITY).is_valid());
        assert!(!Datum::Null.is_valid());
    }

    #[test]
    fn test_datum_json_roundtrip() {
        let json = r#"["dog",4.5,true,null]"#;
        let data: Vec<Datum> = serde_json::from_str(json).unwrap();
        assert_eq!(
            data,
            vec![
                Datum::Text("dog".into()),
                Datum::Number(4.5),
                Datum::Bool(true),
                Datum::Null
            ]
        );
        assert_eq!(serde_json::to_string(&data).unwrap(), json);
    }

    #[test]
    fn test_content_wire_shape() {
        let mut tables = Tables::new();
        let mut row = Row::new();
        row.insert("species".into(), "dog".into());
        let mut table = Table::new();
        table.insert("fido".into(), row);
        tables.insert("pets".into(), table);

        let mut values = Values::new();
        values.insert("open".into(), true.into());

        let json = serde_json::to_string(&Content(tables, values)).unwrap();
        assert_eq!(json, r#"[{"pets":{"fido":{"species":"dog"}}},{"open":true}]"#);
    }

    #[test]
    fn test_content_changes_delete_marker() {
        let mut tables = TableChanges::new();
        tables.insert("pets".into(), None);
        let json = serde_json::to_string(&ContentChanges(tables, ValueChanges::new())).unwrap();
        assert_eq!(json, r#"[{"pets":null},{}]"#);
    }
}
