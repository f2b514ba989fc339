//! Record and result types for qmd-repair.
//!
//! Epistemic foundation:
//! - K_i: A field is exactly a `[kind, text]` pair
//! - B_i: Input lines may carry keys beyond `query` and `output` → kept verbatim
//!
//! These types represent the data flowing through both pipelines.

use serde::{Deserialize, Serialize};

/// Field kind holding a hypothetical-document snippet.
pub const HYDE: &str = "hyde";

/// Field kind holding a lexical variant of the query.
pub const LEX: &str = "lex";

/// One labeled text field of a record.
///
/// Serialized as a two-element `[kind, text]` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct Field {
    /// Field kind, e.g. "hyde" or "lex"
    pub kind: String,
    /// Field text
    pub text: String,
}

impl Field {
    pub fn new(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            text: text.into(),
        }
    }

    /// Whether this field is of the given kind.
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

impl From<(String, String)> for Field {
    fn from((kind, text): (String, String)) -> Self {
        Self { kind, text }
    }
}

impl From<Field> for (String, String) {
    fn from(field: Field) -> Self {
        (field.kind, field.text)
    }
}

/// A training record: a query and its ordered output fields.
///
/// Keys other than `query` and `output` are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The natural-language query
    pub query: String,

    /// Ordered labeled fields
    pub output: Vec<Field>,

    /// Any other keys present on the input line
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub fn new(query: impl Into<String>, output: Vec<Field>) -> Self {
        Self {
            query: query.into(),
            output,
            extra: serde_json::Map::new(),
        }
    }

    /// Text of the first field of `kind`, if any.
    pub fn field(&self, kind: &str) -> Option<&str> {
        self.output
            .iter()
            .find(|f| f.is(kind))
            .map(|f| f.text.as_str())
    }

    /// Whether any field of `kind` contains `needle`.
    pub fn field_contains(&self, kind: &str, needle: &str) -> bool {
        self.output
            .iter()
            .any(|f| f.is(kind) && f.text.contains(needle))
    }

    /// Replace the first field of `kind`, appending one if none exists.
    ///
    /// Returns true if an existing field was replaced.
    pub fn set_field(&mut self, kind: &str, text: impl Into<String>) -> bool {
        let text = text.into();
        match self.output.iter_mut().find(|f| f.is(kind)) {
            Some(field) => {
                field.text = text;
                true
            }
            None => {
                self.output.push(Field::new(kind, text));
                false
            }
        }
    }
}

/// Statistics for a hyde regeneration run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairStats {
    /// Records loaded
    pub total_records: usize,

    /// Records whose hyde matched the bad pattern
    pub defective: usize,

    /// Defective records already completed by an earlier run
    pub previously_completed: usize,

    /// Batches sent to the generation service this run
    pub batches_sent: usize,

    /// Batches that came back with no usable entries
    pub batches_empty: usize,

    /// Records repaired this run
    pub repaired: usize,

    /// Batch positions the service left out
    pub missing: usize,

    /// Repairs applied to the written dataset
    pub applied: usize,

    /// Output lines still containing the bad pattern
    pub residual: usize,

    /// Total runtime in seconds
    pub runtime_secs: f64,
}

/// Statistics for a lex normalization run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeStats {
    /// Records processed
    pub total_records: usize,

    /// Records with at least one cleaned lex field
    pub records_modified: usize,

    /// Lex fields cleaned
    pub fields_cleaned: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip_preserves_shape() {
        let line = r#"{"query":"pod networking","output":[["lex","pod network"],["hyde","text"]],"source":"gen-v2"}"#;
        let record: Record = serde_json::from_str(line).unwrap();

        assert_eq!(record.query, "pod networking");
        assert_eq!(record.output[0], Field::new(LEX, "pod network"));
        assert_eq!(record.field(HYDE), Some("text"));
        assert_eq!(record.extra["source"], "gen-v2");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["output"][1][0], "hyde");
        assert_eq!(json["output"][1][1], "text");
        assert_eq!(json["source"], "gen-v2");
    }

    #[test]
    fn test_field_rejects_wrong_arity() {
        let line = r#"{"query":"q","output":[["hyde"]]}"#;
        assert!(serde_json::from_str::<Record>(line).is_err());
    }

    #[test]
    fn test_set_field_replaces_first_only() {
        let mut record = Record::new(
            "q",
            vec![
                Field::new(LEX, "a"),
                Field::new(HYDE, "old"),
                Field::new(HYDE, "second"),
            ],
        );

        assert!(record.set_field(HYDE, "new"));
        assert_eq!(record.output[1].text, "new");
        assert_eq!(record.output[2].text, "second");
        assert_eq!(record.output.len(), 3);
    }

    #[test]
    fn test_set_field_appends_when_absent() {
        let mut record = Record::new("q", vec![Field::new(LEX, "a")]);
        assert!(!record.set_field(HYDE, "fresh"));
        assert_eq!(record.output.last(), Some(&Field::new(HYDE, "fresh")));
    }

    #[test]
    fn test_field_contains_checks_every_field_of_kind() {
        let record = Record::new(
            "q",
            vec![Field::new(HYDE, "fine"), Field::new(HYDE, "has marker")],
        );
        assert!(record.field_contains(HYDE, "marker"));
        assert!(!record.field_contains(LEX, "marker"));
    }
}
