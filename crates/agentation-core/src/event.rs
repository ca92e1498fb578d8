//! The event envelope accepted by `POST /api/annotations`.
//!
//! The annotation API sits behind a generic event bus, so incoming bodies
//! look like `{ "event": "...", "annotation": {...}, "id": "..." }`. Event
//! names are mapped onto a closed set of [`EventKind`]s; only
//! [`EventKind::AnnotationAdd`] produces a mutation; every other kind,
//! recognized or not, becomes [`AnnotationEvent::Ignored`].

use serde_json::Value;

use crate::models::{caller_id, generate_id, Annotation, AnnotationFields};

/// Event names emitted by the annotation toolbar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    AnnotationAdd,
    AnnotationUpdate,
    AnnotationDelete,
    AnnotationsClear,
    Submit,
    /// Anything else, including a missing or non-string `event`.
    Unknown(String),
}

impl EventKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "annotation.add" => Self::AnnotationAdd,
            "annotation.update" => Self::AnnotationUpdate,
            "annotation.delete" => Self::AnnotationDelete,
            "annotations.clear" => Self::AnnotationsClear,
            "submit" => Self::Submit,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::AnnotationAdd => "annotation.add",
            Self::AnnotationUpdate => "annotation.update",
            Self::AnnotationDelete => "annotation.delete",
            Self::AnnotationsClear => "annotations.clear",
            Self::Submit => "submit",
            Self::Unknown(name) => name,
        }
    }
}

/// What a decoded envelope asks the store to do.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationEvent {
    /// Append this record.
    Add(Annotation),
    /// No mutation; the response is `{ "ignored": true }`.
    Ignored(EventKind),
}

impl AnnotationEvent {
    /// Decodes an envelope, generating an id when the caller supplied none.
    pub fn from_envelope(envelope: &Value) -> Self {
        Self::from_envelope_with(envelope, generate_id)
    }

    pub fn from_envelope_with(envelope: &Value, new_id: impl FnOnce() -> String) -> Self {
        let kind = EventKind::parse(envelope.get("event").and_then(Value::as_str).unwrap_or(""));
        if kind != EventKind::AnnotationAdd {
            return Self::Ignored(kind);
        }

        let payload = envelope.get("annotation").cloned().unwrap_or(Value::Null);
        let id = caller_id(payload.get("id"))
            .or_else(|| caller_id(envelope.get("id")))
            .unwrap_or_else(new_id);

        Self::Add(Annotation::new(id, AnnotationFields::from_payload(&payload)))
    }
}
