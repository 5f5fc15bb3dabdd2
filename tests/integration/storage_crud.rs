//! Integration coverage for basic diagram CRUD and quota/validation gating
//! on the storage engine (C4, spec §4.4, §8).

use std::sync::Arc;

use diagramhub::error::{QuotaResource, StorageError};
use diagramhub::quota::QuotaLimits;
use diagramhub::spec::{DiagramSpec, DiagramType, Edge, Node};
use diagramhub::storage::{Storage, UpdateOutcome};
use diagramhub::thumbnails::ThumbnailStore;

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
async fn create_get_update_delete_round_trip() {
    let storage = storage();
    let mut spec = DiagramSpec::empty(DiagramType::Flowchart);
    spec.nodes.push(node("a"));

    let created = storage
        .create("dashboard".into(), "acme".into(), spec.clone(), Some("owner1".into()), false)
        .await
        .unwrap();
    assert_eq!(created.version, 1);
    assert_eq!(created.name, "dashboard");

    let fetched = storage.get(created.id.clone()).await.unwrap().unwrap();
    assert_eq!(fetched.spec.spec, spec);

    let mut updated_spec = spec.clone();
    updated_spec.nodes.push(node("b"));
    updated_spec.edges.push(Edge { id: None, from: "a".into(), to: "b".into(), label: None, style: None, color: None });
    let outcome = storage
        .update(created.id.clone(), updated_spec.clone(), Some("added b".into()), Some(1))
        .await
        .unwrap();
    let updated = match outcome {
        UpdateOutcome::Ok(d) => d,
        other => panic!("expected Ok, got {other:?}"),
    };
    assert_eq!(updated.version, 2);

    assert!(storage.delete(created.id.clone()).await.unwrap());
    assert!(storage.get(created.id).await.unwrap().is_none());
}

#[tokio::test]
async fn create_rejects_edge_referencing_unknown_node() {
    let storage = storage();
    let mut spec = DiagramSpec::empty(DiagramType::Flowchart);
    spec.nodes.push(node("a"));
    spec.edges.push(Edge { id: None, from: "a".into(), to: "ghost".into(), label: None, style: None, color: None });

    let err = storage.create("d".into(), "p".into(), spec, None, false).await.unwrap_err();
    match err {
        StorageError::Validation(e) => assert!(e.issues.iter().any(|i| i.path == "edges[0].to")),
        other => panic!("expected Validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn create_rejects_spec_over_node_quota() {
    let storage = storage();
    let mut spec = DiagramSpec::empty(DiagramType::Flowchart);
    for i in 0..600 {
        spec.nodes.push(node(&format!("n{i}")));
    }
    let err = storage.create("d".into(), "p".into(), spec, None, false).await.unwrap_err();
    match err {
        StorageError::Quota(q) => assert_eq!(q.resource, QuotaResource::Nodes),
        other => panic!("expected Quota error, got {other:?}"),
    }
}

#[tokio::test]
async fn create_rejects_owner_over_diagram_quota() {
    // `Storage::open` (rather than the in-memory test constructor) is used
    // here so a non-default `QuotaLimits` can be exercised end to end.
    let tight = QuotaLimits { max_diagrams_per_user: 1, ..QuotaLimits::default() };
    let dir = tempfile::tempdir().unwrap();
    let thumbs = Arc::new(ThumbnailStore::open(dir.path().join("thumbnails")).unwrap());
    let limited = Storage::open(&dir.path().join("db.sqlite3"), thumbs, tight).await.unwrap();

    let spec = DiagramSpec::empty(DiagramType::Flowchart);
    limited
        .create("first".into(), "p".into(), spec.clone(), Some("owner1".into()), false)
        .await
        .unwrap();
    let err = limited.create("second".into(), "p".into(), spec, Some("owner1".into()), false).await.unwrap_err();
    match err {
        StorageError::Quota(q) => assert_eq!(q.resource, QuotaResource::DiagramsPerUser),
        other => panic!("expected Quota error, got {other:?}"),
    }
}

#[tokio::test]
async fn update_of_missing_diagram_returns_not_found() {
    let storage = storage();
    let spec = DiagramSpec::empty(DiagramType::Flowchart);
    let outcome = storage.update("nonexistent".into(), spec, None, None).await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::NotFound));
}

#[tokio::test]
async fn force_update_bumps_version_without_a_base_check() {
    let storage = storage();
    let spec = DiagramSpec::empty(DiagramType::Flowchart);
    let d = storage.create("d".into(), "p".into(), spec.clone(), None, false).await.unwrap();

    let mut new_spec = spec.clone();
    new_spec.nodes.push(node("a"));
    let outcome = storage.force_update(d.id, new_spec, Some("admin fix".into())).await.unwrap();
    match outcome {
        UpdateOutcome::Ok(updated) => assert_eq!(updated.version, 2),
        other => panic!("expected Ok, got {other:?}"),
    }
}
