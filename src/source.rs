//! # Source Module
//!
//! Raw records from the two source feeds and the name-extraction contract
//! that turns one record into a typed name, or a per-record [`ParseError`].

use crate::error::{ParseError, ParseReason};
use crate::model::{AttributedTerm, IdentityKind, NameComponents, Occurrence, Provenance, SourceId, TermValue};
use crate::normalize::normalize_for_similarity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One field-mapped record from a source feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source: SourceId,
    /// Deterministic key shared across sources (the fire number)
    #[serde(default)]
    pub natural_key: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    pub row_index: u64,
    pub record_key: String,
}

impl SourceRecord {
    pub fn new(source: SourceId, row_index: u64, record_key: impl Into<String>) -> Self {
        Self {
            source,
            natural_key: None,
            fields: BTreeMap::new(),
            row_index,
            record_key: record_key.into(),
        }
    }

    pub fn with_natural_key(mut self, natural_key: impl Into<String>) -> Self {
        self.natural_key = Some(natural_key.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    fn parse_error(&self, reason: ParseReason) -> ParseError {
        ParseError {
            row_index: self.row_index,
            record_key: self.record_key.clone(),
            reason,
        }
    }
}

/// A name pulled out of a source record.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedName {
    pub value: TermValue,
    pub field_name: String,
    pub kind: IdentityKind,
    pub components: Option<NameComponents>,
}

impl ExtractedName {
    /// Attributed term carrying the record's provenance.
    pub fn term(&self, record: &SourceRecord) -> AttributedTerm {
        AttributedTerm::new(
            self.value.clone(),
            Provenance::new(
                record.source,
                Occurrence::new(record.row_index, record.record_key.clone(), self.field_name.clone()),
            ),
        )
    }

    pub fn display(&self) -> String {
        self.value.to_string()
    }
}

/// Name-parsing collaborator.
pub trait NameExtractor: Send + Sync {
    fn extract(&self, record: &SourceRecord) -> Result<ExtractedName, ParseError>;
}

/// Tokens that mark a name as an organization.
const ORGANIZATION_MARKERS: &[&str] = &[
    "LLC", "INC", "CORP", "CORPORATION", "CO", "COMPANY", "LTD", "LP", "LLP", "TRUST", "BANK",
    "CHURCH", "ASSOCIATION", "ASSN", "CLUB", "FARM", "FARMS", "HOLDINGS", "PARTNERSHIP",
];

/// Guess the identity kind from a display name.
pub fn classify_kind(name: &str) -> IdentityKind {
    let normalized = normalize_for_similarity(name);
    let tokens: Vec<&str> = normalized.split(' ').collect();
    if tokens.iter().any(|token| ORGANIZATION_MARKERS.contains(token)) {
        IdentityKind::Organization
    } else if tokens.iter().any(|token| *token == "&" || *token == "AND") || name.contains('&') {
        IdentityKind::HouseholdAggregate
    } else {
        IdentityKind::Person
    }
}

/// Split a person's name into components. `"Last, First Middle"` and
/// `"First Middle Last"` are both understood.
pub fn split_person_name(name: &str) -> NameComponents {
    if let Some((last, rest)) = name.split_once(',') {
        let mut rest = rest.split_whitespace().map(str::to_string);
        let first = rest.next();
        return NameComponents {
            first,
            last: Some(last.trim().to_string()).filter(|last| !last.is_empty()),
            other: rest.collect(),
        };
    }
    let mut words: Vec<String> = name.split_whitespace().map(str::to_string).collect();
    match words.len() {
        0 => NameComponents::default(),
        1 => NameComponents {
            first: None,
            last: words.pop(),
            other: Vec::new(),
        },
        _ => {
            let last = words.pop();
            let first = Some(words.remove(0));
            NameComponents {
                first,
                last,
                other: words,
            }
        }
    }
}

/// Extractor reading the first present field of a configured list, falling
/// back to `first_name` + `last_name`.
#[derive(Debug, Clone)]
pub struct FieldNameExtractor {
    fields: Vec<String>,
}

impl FieldNameExtractor {
    pub fn new(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    fn read_text(record: &SourceRecord, field: &str, value: &Value) -> Result<TermValue, ParseError> {
        match value {
            Value::String(text) if text.trim().is_empty() => {
                Err(record.parse_error(ParseReason::EmptyName))
            }
            Value::String(text) => Ok(TermValue::Text(text.clone())),
            Value::Number(number) => number
                .as_i64()
                .map(TermValue::Number)
                .ok_or_else(|| record.parse_error(ParseReason::UnreadableField)),
            Value::Null => Err(record.parse_error(ParseReason::EmptyName)),
            _ => {
                tracing::debug!(field, record_key = %record.record_key, "name field is not a scalar");
                Err(record.parse_error(ParseReason::UnreadableField))
            }
        }
    }

    fn from_split_fields(&self, record: &SourceRecord) -> Option<Result<ExtractedName, ParseError>> {
        let first = record.fields.get("first_name");
        let last = record.fields.get("last_name");
        if first.is_none() && last.is_none() {
            return None;
        }
        let mut parts = Vec::new();
        for (field, value) in [("first_name", first), ("last_name", last)] {
            let Some(value) = value else { continue };
            match Self::read_text(record, field, value) {
                Ok(text) => parts.push(text.to_string()),
                Err(err) if err.reason == ParseReason::EmptyName => {}
                Err(err) => return Some(Err(err)),
            }
        }
        if parts.is_empty() {
            return Some(Err(record.parse_error(ParseReason::EmptyName)));
        }
        let components = NameComponents {
            first: first.and_then(Value::as_str).map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            last: last.and_then(Value::as_str).map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            other: Vec::new(),
        };
        let value = parts.join(" ");
        Some(Ok(ExtractedName {
            kind: classify_kind(&value),
            value: TermValue::Text(value),
            field_name: "first_name+last_name".to_string(),
            components: Some(components),
        }))
    }
}

impl Default for FieldNameExtractor {
    fn default() -> Self {
        Self::new(["name", "owner_name"])
    }
}

impl NameExtractor for FieldNameExtractor {
    fn extract(&self, record: &SourceRecord) -> Result<ExtractedName, ParseError> {
        for field in &self.fields {
            let Some(value) = record.fields.get(field) else {
                continue;
            };
            let value = Self::read_text(record, field, value)?;
            let display = value.to_string();
            let kind = classify_kind(&display);
            let components = match kind {
                IdentityKind::Person => Some(split_person_name(&display)),
                _ => None,
            };
            return Ok(ExtractedName {
                value,
                field_name: field.clone(),
                kind,
                components,
            });
        }
        self.from_split_fields(record)
            .unwrap_or_else(|| Err(record.parse_error(ParseReason::MissingName)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(row: u64) -> SourceRecord {
        SourceRecord::new(SourceId::SourceA, row, format!("acct-{row}"))
    }

    #[test]
    fn test_extracts_first_configured_field() {
        let extractor = FieldNameExtractor::default();
        let rec = record(7).with_field("owner_name", "Smith, John A");
        let name = extractor.extract(&rec).unwrap();
        assert_eq!(name.display(), "Smith, John A");
        assert_eq!(name.field_name, "owner_name");
        assert_eq!(name.kind, IdentityKind::Person);
        let components = name.components.as_ref().unwrap();
        assert_eq!(components.first.as_deref(), Some("John"));
        assert_eq!(components.last.as_deref(), Some("Smith"));
        assert_eq!(components.other, vec!["A".to_string()]);

        let term = name.term(&rec);
        assert_eq!(term.origin().occurrence.record_key, "acct-7");
        assert_eq!(term.origin().occurrence.field_name, "owner_name");
    }

    #[test]
    fn test_parse_reasons() {
        let extractor = FieldNameExtractor::default();

        let err = extractor.extract(&record(1)).unwrap_err();
        assert_eq!(err.reason, ParseReason::MissingName);
        assert_eq!(err.row_index, 1);

        let err = extractor.extract(&record(2).with_field("name", "   ")).unwrap_err();
        assert_eq!(err.reason, ParseReason::EmptyName);

        let err = extractor
            .extract(&record(3).with_field("name", json!(["a", "b"])))
            .unwrap_err();
        assert_eq!(err.reason, ParseReason::UnreadableField);
    }

    #[test]
    fn test_split_name_fields_fallback() {
        let extractor = FieldNameExtractor::default();
        let rec = record(4)
            .with_field("first_name", "Mary")
            .with_field("last_name", "Jones");
        let name = extractor.extract(&rec).unwrap();
        assert_eq!(name.display(), "Mary Jones");
        assert_eq!(name.components.unwrap().last.as_deref(), Some("Jones"));
    }

    #[test]
    fn test_numeric_name_is_kept_as_number() {
        let extractor = FieldNameExtractor::new(["parcel_owner"]);
        let name = extractor
            .extract(&record(5).with_field("parcel_owner", 4411))
            .unwrap();
        assert_eq!(name.value, TermValue::Number(4411));
    }

    #[test]
    fn test_classify_kind() {
        assert_eq!(classify_kind("Acme Widgets, LLC"), IdentityKind::Organization);
        assert_eq!(classify_kind("First Baptist Church"), IdentityKind::Organization);
        assert_eq!(classify_kind("John & Mary Smith"), IdentityKind::HouseholdAggregate);
        assert_eq!(classify_kind("John and Mary Smith"), IdentityKind::HouseholdAggregate);
        assert_eq!(classify_kind("Coco Chanel"), IdentityKind::Person);
    }
}
