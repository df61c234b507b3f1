//!
//! Runtime record schemas
//! ----------------------
//! Converts a table's ordered column definitions into a runtime validation
//! schema: an ordered list of field descriptors, each a tagged `FieldKind`
//! variant evaluated by a generic validator. Validation never raises for
//! ordinary bad input; it collects one message per invalid field across the
//! whole record in a single pass and hands them back as structured data.

use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use crate::storage::{ColumnRecord, Datatype};

/// Raw form input: field identity -> submitted string.
pub type RawValues = BTreeMap<String, String>;

/// Per-field validation messages, one per invalid field.
pub type FieldErrors = BTreeMap<String, String>;

/// Typed field constraints.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Str { max_length: usize, required: bool },
    Int { minimum: Option<i64>, maximum: Option<i64>, required: bool },
    Choice { choices: Vec<String>, required: bool },
}

/// One named, titled, typed field in a record schema.
#[derive(Debug, Clone, Serialize)]
pub struct FieldDescriptor {
    pub identity: String,
    pub title: String,
    pub kind: FieldKind,
}

/// Ordered runtime schema for one record shape.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RecordSchema {
    fields: Vec<FieldDescriptor>,
}

impl RecordSchema {
    pub fn new(fields: Vec<FieldDescriptor>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, identity: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.identity == identity)
    }

    pub fn identities(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.identity.clone()).collect()
    }

    /// Validate a full record of raw string inputs.
    ///
    /// Returns the typed record on success, or the complete set of field
    /// errors on failure. Every field is checked; validation does not stop
    /// at the first bad one.
    pub fn validate(&self, raw: &RawValues) -> Result<Map<String, Value>, FieldErrors> {
        let mut record = Map::new();
        let mut errors = FieldErrors::new();
        for field in &self.fields {
            let input = raw.get(&field.identity).map(|s| s.as_str());
            match validate_value(&field.kind, input) {
                Ok(Some(value)) => {
                    record.insert(field.identity.clone(), value);
                }
                Ok(None) => {} // optional and blank: omit the key
                Err(message) => {
                    errors.insert(field.identity.clone(), message);
                }
            }
        }
        if errors.is_empty() {
            Ok(record)
        } else {
            Err(errors)
        }
    }

    /// Inverse of `validate`, used to populate edit forms. Missing keys
    /// serialize to the empty string rather than erroring.
    pub fn serialize(&self, record: &Map<String, Value>) -> RawValues {
        let mut raw = RawValues::new();
        for field in &self.fields {
            let text = match record.get(&field.identity) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            raw.insert(field.identity.clone(), text);
        }
        raw
    }
}

fn is_required(kind: &FieldKind) -> bool {
    match kind {
        FieldKind::Str { required, .. }
        | FieldKind::Int { required, .. }
        | FieldKind::Choice { required, .. } => *required,
    }
}

fn validate_value(kind: &FieldKind, input: Option<&str>) -> Result<Option<Value>, String> {
    // A key absent from the submission is distinct from a blank value.
    let Some(input) = input else {
        if is_required(kind) {
            return Err("This field is required.".to_string());
        }
        return Ok(None);
    };
    match kind {
        FieldKind::Str { max_length, required } => {
            if input.is_empty() {
                if *required {
                    return Err("Must not be blank.".to_string());
                }
                return Ok(None);
            }
            if input.chars().count() > *max_length {
                return Err(format!("Must have no more than {} characters.", max_length));
            }
            Ok(Some(Value::String(input.to_string())))
        }
        FieldKind::Int { minimum, maximum, required } => {
            let trimmed = input.trim();
            if trimmed.is_empty() {
                if *required {
                    return Err("Must not be blank.".to_string());
                }
                return Ok(None);
            }
            let value: i64 = trimmed.parse().map_err(|_| "Must be a number.".to_string())?;
            if let Some(min) = minimum {
                if value < *min {
                    return Err(format!("Must be greater than or equal to {}.", min));
                }
            }
            if let Some(max) = maximum {
                if value > *max {
                    return Err(format!("Must be less than or equal to {}.", max));
                }
            }
            Ok(Some(Value::Number(Number::from(value))))
        }
        FieldKind::Choice { choices, required } => {
            if input.is_empty() {
                if *required {
                    return Err("Must not be blank.".to_string());
                }
                return Ok(None);
            }
            if !choices.iter().any(|c| c == input) {
                return Err("Not a valid choice.".to_string());
            }
            Ok(Some(Value::String(input.to_string())))
        }
    }
}

/// Maximum length applied to all user-facing string fields.
pub const STRING_MAX_LENGTH: usize = 100;

/// Build the runtime schema for a dynamic table from its ordered columns.
pub fn schema_for_columns(columns: &[ColumnRecord]) -> RecordSchema {
    let fields = columns
        .iter()
        .map(|column| FieldDescriptor {
            identity: column.identity.clone(),
            title: column.name.clone(),
            kind: match column.datatype {
                Datatype::String => FieldKind::Str { max_length: STRING_MAX_LENGTH, required: true },
                Datatype::Integer => FieldKind::Int { minimum: None, maximum: None, required: true },
            },
        })
        .collect();
    RecordSchema::new(fields)
}

/// Form schema for creating a table.
pub fn new_table_schema() -> RecordSchema {
    RecordSchema::new(vec![FieldDescriptor {
        identity: "name".into(),
        title: "Name".into(),
        kind: FieldKind::Str { max_length: STRING_MAX_LENGTH, required: true },
    }])
}

/// Form schema for adding a column to a table.
pub fn new_column_schema() -> RecordSchema {
    RecordSchema::new(vec![
        FieldDescriptor {
            identity: "name".into(),
            title: "Name".into(),
            kind: FieldKind::Str { max_length: STRING_MAX_LENGTH, required: true },
        },
        FieldDescriptor {
            identity: "datatype".into(),
            title: "Datatype".into(),
            kind: FieldKind::Choice {
                choices: vec!["string".into(), "integer".into()],
                required: true,
            },
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn election_schema() -> RecordSchema {
        RecordSchema::new(vec![
            FieldDescriptor {
                identity: "constituency".into(),
                title: "Constituency".into(),
                kind: FieldKind::Str { max_length: 100, required: true },
            },
            FieldDescriptor {
                identity: "votes".into(),
                title: "Votes".into(),
                kind: FieldKind::Int { minimum: Some(0), maximum: None, required: true },
            },
        ])
    }

    #[test]
    fn collects_all_errors_in_one_pass() {
        let schema = election_schema();
        let mut raw = RawValues::new();
        raw.insert("constituency".into(), "".into());
        raw.insert("votes".into(), "-1".into());
        let errors = schema.validate(&raw).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors["constituency"], "Must not be blank.");
        assert_eq!(errors["votes"], "Must be greater than or equal to 0.");
    }

    #[test]
    fn valid_record_is_typed() {
        let schema = election_schema();
        let mut raw = RawValues::new();
        raw.insert("constituency".into(), "Brighton Pavilion".into());
        raw.insert("votes".into(), "30149".into());
        let record = schema.validate(&raw).unwrap();
        assert_eq!(record["constituency"], json!("Brighton Pavilion"));
        assert_eq!(record["votes"], json!(30149));
    }

    #[test]
    fn rejects_too_long_and_non_integer() {
        let schema = election_schema();
        let mut raw = RawValues::new();
        raw.insert("constituency".into(), "x".repeat(101));
        raw.insert("votes".into(), "many".into());
        let errors = schema.validate(&raw).unwrap_err();
        assert_eq!(errors["constituency"], "Must have no more than 100 characters.");
        assert_eq!(errors["votes"], "Must be a number.");
    }

    #[test]
    fn missing_required_key_is_distinct_from_blank() {
        let schema = election_schema();
        let mut raw = RawValues::new();
        raw.insert("constituency".into(), "".into());
        let errors = schema.validate(&raw).unwrap_err();
        assert_eq!(errors["constituency"], "Must not be blank.");
        assert_eq!(errors["votes"], "This field is required.");
    }

    #[test]
    fn optional_blank_is_omitted() {
        let schema = RecordSchema::new(vec![FieldDescriptor {
            identity: "votes".into(),
            title: "Votes".into(),
            kind: FieldKind::Int { minimum: None, maximum: None, required: false },
        }]);
        let record = schema.validate(&RawValues::new()).unwrap();
        assert!(record.is_empty());
    }

    #[test]
    fn serialize_fills_missing_with_empty() {
        let schema = election_schema();
        let mut record = Map::new();
        record.insert("votes".into(), json!(42));
        let raw = schema.serialize(&record);
        assert_eq!(raw["constituency"], "");
        assert_eq!(raw["votes"], "42");
    }

    #[test]
    fn choice_rejects_unknown_datatype() {
        let schema = new_column_schema();
        let mut raw = RawValues::new();
        raw.insert("name".into(), "Score".into());
        raw.insert("datatype".into(), "decimal".into());
        let errors = schema.validate(&raw).unwrap_err();
        assert_eq!(errors["datatype"], "Not a valid choice.");
    }

    #[test]
    fn schema_for_columns_maps_datatypes() {
        use crate::storage::{ColumnRecord, Datatype};
        use chrono::Utc;
        let columns = vec![
            ColumnRecord {
                pk: 1,
                table: 1,
                identity: "party".into(),
                name: "Party".into(),
                datatype: Datatype::String,
                position: 1,
                created_at: Utc::now(),
            },
            ColumnRecord {
                pk: 2,
                table: 1,
                identity: "votes".into(),
                name: "Votes".into(),
                datatype: Datatype::Integer,
                position: 2,
                created_at: Utc::now(),
            },
        ];
        let schema = schema_for_columns(&columns);
        assert!(matches!(schema.field("party").unwrap().kind, FieldKind::Str { .. }));
        assert!(matches!(schema.field("votes").unwrap().kind, FieldKind::Int { .. }));
    }
}
