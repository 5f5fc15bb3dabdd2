//! Version history: read-back, restore, and fork (§4.4).
//!
//! The history row appended on every successful `Update`/`ForceUpdate` (what
//! §4.4 calls `CreateVersion`) is written inline in
//! [`super::diagrams::apply_update`] — it has to share the same transaction as
//! the `diagrams` row bump to stay consistent under concurrent writers, so
//! there is no separate public `create_version` entry point.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{StorageError, StorageResult};

use super::model::{Diagram, DiagramVersion, DiagramVersionMetadata, Page, UpdateOutcome};
use super::Storage;

impl Storage {
    /// All versions for a diagram, newest first.
    pub async fn get_versions(&self, diagram_id: String) -> StorageResult<Vec<DiagramVersion>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_reader(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM diagram_versions WHERE diagram_id = ?1 ORDER BY version DESC",
                )?;
                stmt.query_map(params![diagram_id], row_to_version)?.collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("get_versions task panicked")
    }

    /// Paginated version listing, newest first.
    pub async fn get_versions_paginated(
        &self,
        diagram_id: String,
        limit: i64,
        offset: i64,
    ) -> StorageResult<Page<DiagramVersion>> {
        let limit = if limit > 0 { limit } else { 20 };
        let offset = offset.max(0);
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_reader(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM diagram_versions WHERE diagram_id = ?1 ORDER BY version DESC LIMIT ?2 OFFSET ?3",
                )?;
                let data = stmt
                    .query_map(params![diagram_id, limit, offset], row_to_version)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM diagram_versions WHERE diagram_id = ?1",
                    params![diagram_id],
                    |r| r.get(0),
                )?;
                Ok(Page { data, total })
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("get_versions_paginated task panicked")
    }

    /// Version listing with the `spec` column omitted — cheap to page through
    /// for a history sidebar (§4.4).
    pub async fn get_versions_metadata(&self, diagram_id: String) -> StorageResult<Vec<DiagramVersionMetadata>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_reader(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, diagram_id, version, message, created_at FROM diagram_versions
                     WHERE diagram_id = ?1 ORDER BY version DESC",
                )?;
                stmt.query_map(params![diagram_id], |row| {
                    Ok(DiagramVersionMetadata {
                        id: row.get("id")?,
                        diagram_id: row.get("diagram_id")?,
                        version: row.get("version")?,
                        message: row.get("message")?,
                        created_at: row.get("created_at")?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("get_versions_metadata task panicked")
    }

    /// A single historic version, if it exists.
    pub async fn get_version(&self, diagram_id: String, version: i64) -> StorageResult<Option<DiagramVersion>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_reader(|conn| {
                conn.query_row(
                    "SELECT * FROM diagram_versions WHERE diagram_id = ?1 AND version = ?2",
                    params![diagram_id, version],
                    row_to_version,
                )
                .optional()
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("get_version task panicked")
    }

    /// The most recent version row (equal to the diagram's current spec
    /// unless a write is racing this read).
    pub async fn get_latest_version(&self, diagram_id: String) -> StorageResult<Option<DiagramVersion>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_reader(|conn| {
                conn.query_row(
                    "SELECT * FROM diagram_versions WHERE diagram_id = ?1 ORDER BY version DESC LIMIT 1",
                    params![diagram_id],
                    row_to_version,
                )
                .optional()
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("get_latest_version task panicked")
    }

    /// Re-applies a historic version's spec as a new current version (§4.4).
    ///
    /// Appends a fresh history row rather than truncating forward history —
    /// restoring to version 3 after reaching version 10 leaves 4..=10 intact
    /// and creates an 11th entry whose spec matches version 3's.
    pub async fn restore_version(&self, diagram_id: String, version: i64) -> StorageResult<UpdateOutcome> {
        let Some(historic) = self.get_version(diagram_id.clone(), version).await? else {
            return Ok(UpdateOutcome::NotFound);
        };
        let message = Some(format!("Restored to version {version}"));
        self.force_update(diagram_id, historic.spec.spec, message).await
    }

    /// Copies a diagram's current spec into a brand-new diagram at version 1
    /// (§4.4). The fork is independent: future writes to either diagram never
    /// affect the other. `project` defaults to the source diagram's own
    /// project when not given.
    pub async fn fork(
        &self,
        diagram_id: String,
        new_name: String,
        project: Option<String>,
    ) -> StorageResult<Option<Diagram>> {
        let Some(source) = self.get(diagram_id.clone()).await? else {
            return Ok(None);
        };
        let target_project = project.unwrap_or_else(|| source.project.clone());
        let source_name = source.name.clone();
        let forked = self
            .create(new_name, target_project, source.spec.spec, None, false)
            .await?;

        let pool = self.pool.clone();
        let fork_id = forked.id.clone();
        let note = format!("Forked from {source_name} ({diagram_id})");
        tokio::task::spawn_blocking(move || {
            pool.with_writer(|conn| {
                conn.execute(
                    "UPDATE diagram_versions SET message = ?1 WHERE diagram_id = ?2 AND version = 1",
                    params![note, fork_id],
                )
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("fork annotate task panicked")?;

        Ok(Some(forked))
    }
}

fn row_to_version(row: &Row) -> rusqlite::Result<DiagramVersion> {
    let spec_raw: String = row.get("spec")?;
    let spec_value: serde_json::Value = serde_json::from_str(&spec_raw).unwrap_or(serde_json::Value::Null);
    let spec = super::diagrams::decode_lenient(spec_value);
    Ok(DiagramVersion {
        id: row.get("id")?,
        diagram_id: row.get("diagram_id")?,
        version: row.get("version")?,
        spec,
        message: row.get("message")?,
        created_at: row.get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{DiagramSpec, DiagramType, Node};
    use crate::thumbnails::ThumbnailStore;
    use std::sync::Arc;

    fn storage() -> Storage {
        let dir = tempfile::tempdir().unwrap();
        let thumbs = Arc::new(ThumbnailStore::open(dir.path()).unwrap());
        Storage::open_in_memory_for_tests(thumbs)
    }

    fn node(id: &str) -> Node {
        Node {
            id: id.into(),
            label: id.into(),
            shape: None,
            color: None,
            position: None,
            width: None,
            height: None,
            details: None,
            stereotype: None,
            attributes: vec![],
            methods: vec![],
            swimlane: None,
        }
    }

    #[tokio::test]
    async fn update_appends_a_history_row_per_write() {
        let storage = storage();
        let spec = DiagramSpec::empty(DiagramType::Flowchart);
        let d = storage.create("d".into(), "p".into(), spec.clone(), None, false).await.unwrap();

        let mut spec2 = spec.clone();
        spec2.nodes.push(node("a"));
        storage.update(d.id.clone(), spec2, None, Some(1)).await.unwrap();

        let versions = storage.get_versions(d.id.clone()).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, 2);
        assert_eq!(versions[1].version, 1);
    }

    #[tokio::test]
    async fn restore_version_appends_rather_than_truncates() {
        let storage = storage();
        let spec = DiagramSpec::empty(DiagramType::Flowchart);
        let d = storage.create("d".into(), "p".into(), spec.clone(), None, false).await.unwrap();
        let mut spec2 = spec.clone();
        spec2.nodes.push(node("a"));
        storage.update(d.id.clone(), spec2, None, Some(1)).await.unwrap();

        let outcome = storage.restore_version(d.id.clone(), 1).await.unwrap();
        let restored = match outcome {
            UpdateOutcome::Ok(d) => d,
            other => panic!("expected Ok, got {other:?}"),
        };
        assert_eq!(restored.version, 3);
        assert!(restored.spec.spec.nodes.is_empty());
        assert_eq!(storage.get_versions(d.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn fork_is_independent_of_its_source() {
        let storage = storage();
        let mut spec = DiagramSpec::empty(DiagramType::Flowchart);
        spec.nodes.push(node("a"));
        let d = storage.create("d".into(), "p".into(), spec, None, false).await.unwrap();

        let forked = storage.fork(d.id.clone(), "copy".into(), None).await.unwrap().unwrap();
        assert_eq!(forked.version, 1);
        assert_ne!(forked.id, d.id);

        storage.delete(d.id).await.unwrap();
        assert!(storage.get(forked.id).await.unwrap().is_some());
    }
}
