//! Integration coverage for ownership transfer, visibility, and per-user
//! sharing (spec §4.4, §3.2 invariant 5, §9 "User-id hygiene").

use std::sync::Arc;

use diagramhub::error::StorageError;
use diagramhub::spec::{DiagramSpec, DiagramType};
use diagramhub::storage::{ListFilter, Permission, Storage};
use diagramhub::thumbnails::ThumbnailStore;

fn storage() -> Storage {
    let dir = tempfile::tempdir().unwrap();
    let thumbs = Arc::new(ThumbnailStore::open(dir.path()).unwrap());
    Storage::open_in_memory_for_tests(thumbs)
}

#[tokio::test]
async fn update_owner_and_set_public_round_trip() {
    let storage = storage();
    let d = storage
        .create("d".into(), "p".into(), DiagramSpec::empty(DiagramType::Flowchart), Some("alice".into()), false)
        .await
        .unwrap();

    assert!(storage.update_owner(d.id.clone(), Some("bob".into())).await.unwrap());
    let reowned = storage.get(d.id.clone()).await.unwrap().unwrap();
    assert_eq!(reowned.owner_id.as_deref(), Some("bob"));

    assert!(storage.set_public(d.id.clone(), true).await.unwrap());
    let now_public = storage.get(d.id).await.unwrap().unwrap();
    assert!(now_public.is_public);
}

#[tokio::test]
async fn update_owner_on_missing_diagram_returns_false() {
    let storage = storage();
    assert!(!storage.update_owner("nonexistent".into(), Some("alice".into())).await.unwrap());
}

#[tokio::test]
async fn add_share_is_idempotent_and_updates_permission() {
    let storage = storage();
    let d = storage
        .create("d".into(), "p".into(), DiagramSpec::empty(DiagramType::Flowchart), Some("alice".into()), false)
        .await
        .unwrap();

    assert!(storage.add_share(d.id.clone(), "bob".into(), Permission::Viewer).await.unwrap());
    assert!(storage.add_share(d.id.clone(), "bob".into(), Permission::Editor).await.unwrap());

    let diagram = storage.get(d.id).await.unwrap().unwrap();
    assert_eq!(diagram.shares.len(), 1);
    assert_eq!(diagram.shares[0].permission, Permission::Editor);
}

#[tokio::test]
async fn remove_share_on_absent_entry_is_a_no_op_success() {
    let storage = storage();
    let d = storage
        .create("d".into(), "p".into(), DiagramSpec::empty(DiagramType::Flowchart), Some("alice".into()), false)
        .await
        .unwrap();

    assert!(storage.remove_share(d.id, "nobody-shared".into()).await.unwrap());
}

#[tokio::test]
async fn update_shares_replaces_the_whole_list() {
    let storage = storage();
    let d = storage
        .create("d".into(), "p".into(), DiagramSpec::empty(DiagramType::Flowchart), Some("alice".into()), false)
        .await
        .unwrap();
    storage.add_share(d.id.clone(), "bob".into(), Permission::Viewer).await.unwrap();

    storage
        .update_shares(
            d.id.clone(),
            vec![diagramhub::storage::Share { user_id: "carol".into(), permission: Permission::Editor }],
        )
        .await
        .unwrap();

    let diagram = storage.get(d.id).await.unwrap().unwrap();
    assert_eq!(diagram.shares.len(), 1);
    assert_eq!(diagram.shares[0].user_id, "carol");
}

#[tokio::test]
async fn invalid_user_id_is_rejected_before_any_write_on_every_sharing_entry_point() {
    let storage = storage();
    let d = storage
        .create("d".into(), "p".into(), DiagramSpec::empty(DiagramType::Flowchart), Some("alice".into()), false)
        .await
        .unwrap();

    let bad = "has a space";
    assert!(matches!(
        storage.update_owner(d.id.clone(), Some(bad.into())).await.unwrap_err(),
        StorageError::InvalidUserId
    ));
    assert!(matches!(
        storage.add_share(d.id.clone(), bad.into(), Permission::Viewer).await.unwrap_err(),
        StorageError::InvalidUserId
    ));
    assert!(matches!(
        storage.remove_share(d.id.clone(), bad.into()).await.unwrap_err(),
        StorageError::InvalidUserId
    ));
    assert!(matches!(
        storage
            .update_shares(d.id.clone(), vec![diagramhub::storage::Share { user_id: bad.into(), permission: Permission::Viewer }])
            .await
            .unwrap_err(),
        StorageError::InvalidUserId
    ));
    assert!(matches!(
        storage.list_for_user(Some(bad.into()), ListFilter::defaults()).await.unwrap_err(),
        StorageError::InvalidUserId
    ));

    let untouched = storage.get(d.id).await.unwrap().unwrap();
    assert_eq!(untouched.owner_id.as_deref(), Some("alice"));
    assert!(untouched.shares.is_empty());
}
