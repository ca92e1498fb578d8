//! In-memory [`AnnotationStore`] implementation for tests and embedding.
//!
//! Uses a `Vec` behind `std::sync::RwLock`. Semantics match the file-backed
//! store, minus persistence.

use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{Annotation, AnnotationPatch};

use super::{apply_update, remove_record, AnnotationStore, Removal};

/// In-memory annotation store.
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<Vec<Annotation>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<Annotation>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("annotation store lock poisoned")
}

#[async_trait]
impl AnnotationStore for InMemoryStore {
    async fn list(&self) -> Result<Vec<Annotation>> {
        Ok(self.records.read().map_err(poisoned)?.clone())
    }

    async fn append(&self, annotation: Annotation) -> Result<Annotation> {
        self.records
            .write()
            .map_err(poisoned)?
            .push(annotation.clone());
        Ok(annotation)
    }

    async fn update(&self, id: &str, patch: &AnnotationPatch) -> Result<Option<Annotation>> {
        let mut records = self.records.write().map_err(poisoned)?;
        Ok(apply_update(&mut records, id, patch))
    }

    async fn remove(&self, id: &str) -> Result<Removal> {
        let mut records = self.records.write().map_err(poisoned)?;
        Ok(remove_record(&mut records, id))
    }
}
