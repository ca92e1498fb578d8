//! Storage abstraction for the annotation collection.
//!
//! The [`AnnotationStore`] trait defines the four operations the annotation
//! API needs. Backends own the whole collection and apply every mutation as
//! a read-modify-write of the complete sequence; insertion order is
//! preserved and `id` is the only lookup key.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Annotation, AnnotationPatch};

/// Outcome of [`AnnotationStore::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    NotFound,
}

/// Abstract backend for the annotation collection.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`list`](AnnotationStore::list) | Full collection in insertion order |
/// | [`append`](AnnotationStore::append) | Add a record at the end |
/// | [`update`](AnnotationStore::update) | Merge a patch into one record |
/// | [`remove`](AnnotationStore::remove) | Drop one record by id |
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// Returns every stored annotation. Unreadable data reads as empty.
    async fn list(&self) -> Result<Vec<Annotation>>;

    /// Appends a record and returns it as stored.
    async fn append(&self, annotation: Annotation) -> Result<Annotation>;

    /// Merges `patch` into the record with `id`; `None` when no such record.
    async fn update(&self, id: &str, patch: &AnnotationPatch) -> Result<Option<Annotation>>;

    /// Removes the record with `id`.
    async fn remove(&self, id: &str) -> Result<Removal>;
}

/// Applies `patch` to the record with `id` inside `records`.
pub fn apply_update(
    records: &mut [Annotation],
    id: &str,
    patch: &AnnotationPatch,
) -> Option<Annotation> {
    let record = records.iter_mut().find(|a| a.id == id)?;
    patch.apply(&mut record.annotation);
    Some(record.clone())
}

/// Drops every record with `id`, reporting whether the length changed.
pub fn remove_record(records: &mut Vec<Annotation>, id: &str) -> Removal {
    let before = records.len();
    records.retain(|a| a.id != id);
    if records.len() == before {
        Removal::NotFound
    } else {
        Removal::Removed
    }
}
