//! Optional schemas and write-time validation.
//!
//! A schema is independent for tables and values. Each entry carries a
//! required type tag, an optional default (used when a row or the value
//! namespace omits that id, and when a supplied datum fails validation),
//! and an optional allow-null flag. Setting a schema retroactively
//! re-validates and re-defaults all existing data.

use crate::types::{Datum, DatumType, Id};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema for one cell or value id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellSchema {
    /// Required type tag.
    #[serde(rename = "type")]
    pub kind: DatumType,

    /// Substituted when the id is omitted or a supplied datum is invalid.
    #[serde(default)]
    pub default: Option<Datum>,

    /// Whether an explicit `null` is a legal stored state for this id.
    #[serde(default)]
    pub allow_null: bool,
}

impl CellSchema {
    pub fn new(kind: DatumType) -> Self {
        Self {
            kind,
            default: None,
            allow_null: false,
        }
    }

    pub fn with_default(kind: DatumType, default: impl Into<Datum>) -> Self {
        Self {
            kind,
            default: Some(default.into()),
            allow_null: false,
        }
    }

    /// Drop a default that does not itself satisfy the schema. A `null`
    /// default is only kept when nulls are allowed.
    pub(crate) fn sanitize(&mut self) {
        let keep = match &self.default {
            None => true,
            Some(Datum::Null) => self.allow_null,
            Some(d) => d.datum_type() == Some(self.kind) && d.is_valid(),
        };
        if !keep {
            self.default = None;
        }
    }
}

/// Per-cell schemas for one table.
pub type TableSchema = BTreeMap<Id, CellSchema>;

/// Schemas for all tables. A table id absent from this map is not allowed
/// to hold data while the schema is in force.
pub type TablesSchema = BTreeMap<Id, TableSchema>;

/// Schemas for the value namespace.
pub type ValuesSchema = BTreeMap<Id, CellSchema>;

/// Outcome of validating one datum against an optional schema entry.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Validated {
    /// The datum is acceptable as supplied.
    Ok(Datum),
    /// The datum was rejected; the schema default stands in for it.
    Defaulted {
        rejected: serde_json::Value,
        datum: Datum,
    },
    /// The datum was rejected and there is no default; the field is omitted.
    Rejected { rejected: serde_json::Value },
}

/// Validate a datum against a schema entry, or against the bare primitive
/// rules when no schema governs it.
pub(crate) fn validate_datum(datum: Datum, schema: Option<&CellSchema>) -> Validated {
    match schema {
        None => {
            if datum.is_valid() {
                Validated::Ok(datum)
            } else {
                Validated::Rejected {
                    rejected: datum.to_json_value(),
                }
            }
        }
        Some(entry) => {
            let acceptable = match &datum {
                Datum::Null => entry.allow_null,
                d => d.datum_type() == Some(entry.kind) && d.is_valid(),
            };
            if acceptable {
                Validated::Ok(datum)
            } else {
                let rejected = datum.to_json_value();
                match &entry.default {
                    Some(default) => Validated::Defaulted {
                        rejected,
                        datum: default.clone(),
                    },
                    None => Validated::Rejected { rejected },
                }
            }
        }
    }
}

/// Sanitize every entry of a schema map in place.
pub(crate) fn sanitize_schema(schema: &mut BTreeMap<Id, CellSchema>) {
    for entry in schema.values_mut() {
        entry.sanitize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schemaless_accepts_primitives() {
        assert_eq!(
            validate_datum("dog".into(), None),
            Validated::Ok("dog".into())
        );
        assert_eq!(validate_datum(1.into(), None), Validated::Ok(1.into()));
    }

    #[test]
    fn test_schemaless_rejects_null_and_non_finite() {
        assert_eq!(
            validate_datum(Datum::Null, None),
            Validated::Rejected {
                rejected: json!(null)
            }
        );
        assert!(matches!(
            validate_datum(Datum::Number(f64::NAN), None),
            Validated::Rejected { .. }
        ));
    }

    #[test]
    fn test_type_mismatch_takes_default() {
        let schema = CellSchema::with_default(DatumType::Number, 0);
        assert_eq!(
            validate_datum("oops".into(), Some(&schema)),
            Validated::Defaulted {
                rejected: json!("oops"),
                datum: 0.into()
            }
        );
    }

    #[test]
    fn test_type_mismatch_without_default_is_rejected() {
        let schema = CellSchema::new(DatumType::Bool);
        assert_eq!(
            validate_datum(2.into(), Some(&schema)),
            Validated::Rejected { rejected: json!(2.0) }
        );
    }

    #[test]
    fn test_allow_null_grants_null() {
        let mut schema = CellSchema::new(DatumType::Text);
        schema.allow_null = true;
        assert_eq!(
            validate_datum(Datum::Null, Some(&schema)),
            Validated::Ok(Datum::Null)
        );
    }

    #[test]
    fn test_sanitize_drops_mismatched_default() {
        let mut schema = CellSchema::with_default(DatumType::Number, "not a number");
        schema.sanitize();
        assert_eq!(schema.default, None);

        let mut ok = CellSchema::with_default(DatumType::Number, 3);
        ok.sanitize();
        assert_eq!(ok.default, Some(3.into()));
    }

    #[test]
    fn test_schema_json_shape() {
        let mut table: TableSchema = BTreeMap::new();
        table.insert("legs".into(), CellSchema::with_default(DatumType::Number, 4));
        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(
            json,
            r#"{"legs":{"type":"number","default":4.0,"allow_null":false}}"#
        );
        let back: TableSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }
}
