//! Core data models used throughout Agentation.
//!
//! An [`Annotation`] is the persisted unit: an immutable `id` plus a small,
//! allow-listed set of fields describing what the developer pointed at and
//! what they said about it. [`SourceLocation`] is the decoded form of the
//! marker attribute the locator injects into every element.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the attribute carrying an element's source location.
pub const LOCATION_ATTRIBUTE: &str = "data-agentation-location";

/// Where a markup element was written: `file:line:column`.
///
/// `line` is 1-based, `column` is 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }

    /// Parses a marker value. The file part may itself contain `:`.
    pub fn parse(marker: &str) -> Option<Self> {
        let mut parts = marker.rsplitn(3, ':');
        let column = parts.next()?.parse().ok()?;
        let line = parts.next()?.parse().ok()?;
        let file = parts.next()?;
        if file.is_empty() {
            return None;
        }
        Some(Self::new(file, line, column))
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A stored annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    #[serde(default)]
    pub annotation: AnnotationFields,
}

impl Annotation {
    pub fn new(id: impl Into<String>, annotation: AnnotationFields) -> Self {
        Self {
            id: id.into(),
            annotation,
        }
    }

    /// Decodes one stored record leniently.
    ///
    /// Numeric ids are stringified and off-schema fields are dropped the same
    /// way [`AnnotationFields::from_payload`] drops them. `None` only when the
    /// record has no usable id.
    pub fn from_record(record: &Value) -> Option<Self> {
        let id = caller_id(record.get("id"))?;
        let fields = record
            .get("annotation")
            .map(AnnotationFields::from_payload)
            .unwrap_or_default();
        Some(Self::new(id, fields))
    }
}

/// The only fields ever persisted under `annotation`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Opaque descriptor of the annotated element (tag name, role, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<Value>,
}

impl AnnotationFields {
    /// Picks the allow-listed fields out of an arbitrary payload, dropping
    /// everything else.
    pub fn from_payload(payload: &Value) -> Self {
        Self {
            source_location: payload
                .get("sourceLocation")
                .and_then(Value::as_str)
                .map(str::to_string),
            comment: payload
                .get("comment")
                .and_then(Value::as_str)
                .map(str::to_string),
            element: payload.get("element").filter(|v| !v.is_null()).cloned(),
        }
    }

    /// The decoded location, when `source_location` is a well-formed marker.
    pub fn location(&self) -> Option<SourceLocation> {
        self.source_location.as_deref().and_then(SourceLocation::parse)
    }
}

/// Partial update for an existing annotation.
///
/// Only `sourceLocation` and `comment` may change. Absent or empty values
/// leave the stored field untouched; a patch can never clear a field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl AnnotationPatch {
    pub fn from_payload(payload: &Value) -> Self {
        let non_empty = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            source_location: non_empty("sourceLocation"),
            comment: non_empty("comment"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source_location.is_none() && self.comment.is_none()
    }

    pub fn apply(&self, fields: &mut AnnotationFields) {
        if let Some(loc) = self.source_location.as_ref().filter(|s| !s.is_empty()) {
            fields.source_location = Some(loc.clone());
        }
        if let Some(comment) = self.comment.as_ref().filter(|s| !s.is_empty()) {
            fields.comment = Some(comment.clone());
        }
    }
}

/// Reads a caller-supplied identifier: a non-empty string, or a number.
pub fn caller_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Generates an identifier from the current time plus a random suffix.
///
/// Both halves are base-36, so ids sort roughly by creation time.
pub fn generate_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u128;
    let random = to_base36(uuid::Uuid::new_v4().as_u128());
    let suffix = &random[random.len().saturating_sub(11)..];
    format!("{}{}", to_base36(millis), suffix)
}

fn to_base36(mut n: u128) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
