//! File-backed annotation store.
//!
//! The whole collection lives in one pretty-printed JSON array. Every
//! operation re-reads the file and every mutation rewrites it in full, so
//! the store is correct across restarts and hand edits between sessions.
//!
//! # Known limitation: lost updates
//!
//! There is no lock and no version check. Two mutations that overlap in
//! time each read the file, modify their copy and write it back; the later
//! write silently discards the earlier one. This is accepted for a
//! single-developer local tool.
//!
//! # Read recovery
//!
//! | File state | `list()` result |
//! |------------|-----------------|
//! | missing | file recreated as `[]`, empty collection |
//! | empty / whitespace | empty collection |
//! | unparsable | empty collection, file left as-is until the next write |
//! | record without an id | that record skipped; the others are kept |

use std::io::Write;
use std::path::{Path, PathBuf};

use agentation_core::models::{Annotation, AnnotationPatch};
use agentation_core::store::{apply_update, remove_record, AnnotationStore, Removal};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Opens the store at `path`, creating `[]` there if nothing exists yet.
    ///
    /// A relative `path` is resolved against the working directory.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .context("Failed to resolve working directory")?
                .join(path)
        };
        let store = Self { path };
        if !tokio::fs::try_exists(&store.path).await.unwrap_or(false) {
            store.write_all(&[]).await?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<Annotation>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "annotation file missing; recreating");
                self.write_all(&[]).await?;
                return Ok(Vec::new());
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read annotation file");
                return Ok(Vec::new());
            }
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let records: Vec<Value> = match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "annotation file is corrupt; treating as empty");
                return Ok(Vec::new());
            }
        };

        Ok(records
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                let decoded = Annotation::from_record(record);
                if decoded.is_none() {
                    warn!(path = %self.path.display(), index, "skipping stored record without an id");
                }
                decoded
            })
            .collect())
    }

    /// Replaces the file through a uniquely named sibling temp file, so
    /// readers never see a partially written document and overlapping
    /// writers never share a temp path.
    async fn write_all(&self, records: &[Annotation]) -> Result<()> {
        let json = serde_json::to_string_pretty(records)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || replace_file(&path, json.as_bytes()))
            .await
            .context("Annotation write task failed")?
    }
}

fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("Failed to write annotation file: {}", tmp.path().display()))?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace annotation file: {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl AnnotationStore for JsonFileStore {
    async fn list(&self) -> Result<Vec<Annotation>> {
        self.read_all().await
    }

    async fn append(&self, annotation: Annotation) -> Result<Annotation> {
        let mut records = self.read_all().await?;
        records.push(annotation.clone());
        self.write_all(&records).await?;
        Ok(annotation)
    }

    async fn update(&self, id: &str, patch: &AnnotationPatch) -> Result<Option<Annotation>> {
        let mut records = self.read_all().await?;
        let updated = apply_update(&mut records, id, patch);
        if updated.is_some() {
            self.write_all(&records).await?;
        }
        Ok(updated)
    }

    async fn remove(&self, id: &str) -> Result<Removal> {
        let mut records = self.read_all().await?;
        let removal = remove_record(&mut records, id);
        if removal == Removal::Removed {
            self.write_all(&records).await?;
        }
        Ok(removal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentation_core::models::AnnotationFields;
    use serde_json::json;
    use tempfile::TempDir;

    fn note(id: &str, loc: &str, comment: &str) -> Annotation {
        Annotation::new(
            id,
            AnnotationFields {
                source_location: Some(loc.to_string()),
                comment: Some(comment.to_string()),
                element: Some(json!("button")),
            },
        )
    }

    async fn store_in(tmp: &TempDir) -> JsonFileStore {
        JsonFileStore::open(tmp.path().join("annotations.json"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_initializes_empty_array() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp).await;
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.trim(), "[]");
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_creates_parent_directories() {
        let tmp = TempDir::new().unwrap();
        let store = JsonFileStore::open(tmp.path().join("nested/dir/notes.json"))
            .await
            .unwrap();
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_append_then_list() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp).await;
        let a = note("a1", "App.tsx:10:2", "fix spacing");
        let stored = store.append(a.clone()).await.unwrap();
        assert_eq!(stored, a);

        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![a]);
    }

    #[tokio::test]
    async fn test_file_is_pretty_printed_with_only_known_fields() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp).await;
        store.append(note("a1", "App.tsx:1:0", "c")).await.unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("\n  {\n    \"id\": \"a1\""), "{}", content);
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(
            value,
            json!([{"id": "a1", "annotation": {"sourceLocation": "App.tsx:1:0", "comment": "c", "element": "button"}}])
        );
    }

    #[tokio::test]
    async fn test_update_comment_keeps_location() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp).await;
        store.append(note("a1", "App.tsx:10:2", "fix spacing")).await.unwrap();

        let patch = AnnotationPatch {
            source_location: None,
            comment: Some("x".into()),
        };
        let updated = store.update("a1", &patch).await.unwrap().unwrap();
        assert_eq!(updated.annotation.comment.as_deref(), Some("x"));

        let listed = store.list().await.unwrap();
        assert_eq!(listed[0].annotation.comment.as_deref(), Some("x"));
        assert_eq!(listed[0].annotation.source_location.as_deref(), Some("App.tsx:10:2"));
        assert_eq!(listed[0].annotation.element, Some(json!("button")));
    }

    #[tokio::test]
    async fn test_update_location_keeps_comment() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp).await;
        store.append(note("a1", "App.tsx:10:2", "keep me")).await.unwrap();

        let patch = AnnotationPatch {
            source_location: Some("App.tsx:12:4".into()),
            comment: None,
        };
        store.update("a1", &patch).await.unwrap().unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed[0].annotation.source_location.as_deref(), Some("App.tsx:12:4"));
        assert_eq!(listed[0].annotation.comment.as_deref(), Some("keep me"));
    }

    #[tokio::test]
    async fn test_update_missing_id_leaves_file_alone() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp).await;
        store.append(note("a1", "App.tsx:1:0", "c")).await.unwrap();
        let before = std::fs::read_to_string(store.path()).unwrap();

        let patch = AnnotationPatch {
            source_location: None,
            comment: Some("x".into()),
        };
        assert!(store.update("nope", &patch).await.unwrap().is_none());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_remove_exact() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp).await;
        store.append(note("a", "A.tsx:1:0", "one")).await.unwrap();
        store.append(note("b", "B.tsx:2:0", "two")).await.unwrap();
        store.append(note("c", "C.tsx:3:0", "three")).await.unwrap();

        assert_eq!(store.remove("b").await.unwrap(), Removal::Removed);
        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![note("a", "A.tsx:1:0", "one"), note("c", "C.tsx:3:0", "three")]);

        assert_eq!(store.remove("b").await.unwrap(), Removal::NotFound);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_file_reads_as_empty_and_is_not_repaired_by_reads() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp).await;
        std::fs::write(store.path(), "{not json").unwrap();

        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "{not json");

        store.append(note("a", "A.tsx:1:0", "one")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_off_schema_record_does_not_hide_the_rest() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp).await;
        std::fs::write(
            store.path(),
            r#"[
  {"id": "keep", "annotation": {"sourceLocation": "A.tsx:1:0", "comment": "one"}},
  {"id": 7, "annotation": {"sourceLocation": 12, "comment": "two"}},
  {"annotation": {"comment": "no id"}}
]"#,
        )
        .unwrap();

        let listed = store.list().await.unwrap();
        let ids: Vec<_> = listed.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["keep", "7"]);
        assert_eq!(listed[1].annotation.comment.as_deref(), Some("two"));

        store.append(note("new", "B.tsx:2:0", "three")).await.unwrap();
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("\"keep\""));
        assert_eq!(store.list().await.unwrap().len(), 3);
        assert_eq!(store.remove("7").await.unwrap(), Removal::Removed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_writes_never_fail() {
        let tmp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(store_in(&tmp).await);

        for round in 0..5 {
            let mut tasks = Vec::new();
            for i in 0..16 {
                let store = store.clone();
                tasks.push(tokio::spawn(async move {
                    let id = format!("r{}-{}", round, i);
                    store.append(note(&id, "A.tsx:1:0", "c")).await
                }));
            }
            for task in tasks {
                task.await.unwrap().unwrap();
            }

            // Updates may be lost, but the file is always a complete document.
            let content = std::fs::read_to_string(store.path()).unwrap();
            let parsed: Vec<Annotation> = serde_json::from_str(&content).unwrap();
            assert!(!parsed.is_empty());
        }

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name != "annotations.json")
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
    }

    #[tokio::test]
    async fn test_empty_file_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp).await;
        std::fs::write(store.path(), "  \n").unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_file_is_recreated_on_list() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp).await;
        std::fs::remove_file(store.path()).unwrap();

        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap().trim(), "[]");
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = store_in(&tmp).await;
            store.append(note("a", "A.tsx:1:0", "one")).await.unwrap();
        }
        let store = store_in(&tmp).await;
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
