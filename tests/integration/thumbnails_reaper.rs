//! Integration coverage for the transactional-delete + orphan-reap contract
//! (spec §3.2 invariant 9, §4.3, §8 scenario 6), combining [`Storage`] and
//! [`ThumbnailStore`] the way the server binary's reaper task does.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use diagramhub::spec::DiagramSpec;
use diagramhub::spec::DiagramType;
use diagramhub::storage::Storage;
use diagramhub::thumbnails::ThumbnailStore;

const TINY_PNG_B64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNk+A8AAQUBAScY42YAAAAASUVORK5CYII=";

async fn existing_ids(storage: &Storage) -> HashSet<String> {
    storage.list(None).await.unwrap().into_iter().map(|d| d.id).collect()
}

/// `Delete` best-effort-removes the thumbnail inline on the happy path
/// (§3.3), so no reaper sweep is needed to clean up after an ordinary delete.
#[tokio::test]
async fn delete_removes_the_diagrams_thumbnail_inline() {
    let dir = tempfile::tempdir().unwrap();
    let thumbs = Arc::new(ThumbnailStore::open(dir.path().join("thumbnails")).unwrap());
    let storage = Storage::open_in_memory_for_tests(thumbs.clone());

    let spec = DiagramSpec::empty(DiagramType::Flowchart);
    let d = storage.create("d".into(), "p".into(), spec, None, false).await.unwrap();
    thumbs.save(&d.id, &format!("data:image/png;base64,{TINY_PNG_B64}")).unwrap();
    assert!(thumbs.exists(&d.id));

    assert!(storage.delete(d.id.clone()).await.unwrap());
    assert!(!thumbs.exists(&d.id));
}

/// Mirrors spec §8 scenario 6: a thumbnail file whose diagram row is gone
/// (e.g. the inline delete-cleanup failed, or the row was never created) is
/// swept by a reaper pass once it clears `ORPHAN_GRACE`, but a still-referenced
/// thumbnail belonging to a live diagram is left alone.
#[tokio::test]
async fn reaper_sweeps_orphans_but_spares_referenced_thumbnails() {
    let dir = tempfile::tempdir().unwrap();
    let thumbs = Arc::new(ThumbnailStore::open(dir.path().join("thumbnails")).unwrap());
    let storage = Storage::open_in_memory_for_tests(thumbs.clone());

    let spec = DiagramSpec::empty(DiagramType::Flowchart);
    let kept = storage.create("kept".into(), "p".into(), spec, None, false).await.unwrap();

    let data_url = format!("data:image/png;base64,{TINY_PNG_B64}");
    thumbs.save(&kept.id, &data_url).unwrap();
    // Simulates a thumbnail left behind by a delete whose inline cleanup
    // failed: there is no corresponding row in `diagrams` at all.
    thumbs.save("orphaned-diagram-id", &data_url).unwrap();

    let existing = existing_ids(&storage).await;
    assert!(existing.contains(&kept.id));
    assert!(!existing.contains("orphaned-diagram-id"));

    let deleted = thumbs.cleanup_orphans(&existing, Duration::from_secs(0)).unwrap();
    assert_eq!(deleted, vec!["orphaned-diagram-id".to_string()]);
    assert!(!thumbs.exists("orphaned-diagram-id"));
    assert!(thumbs.exists(&kept.id));
}

/// A thumbnail whose diagram no longer exists but whose file is younger than
/// `ORPHAN_GRACE` is preserved, since it may belong to a `Save` racing a
/// concurrent `Delete`/not-yet-committed `Create`.
#[tokio::test]
async fn fresh_orphan_survives_a_sweep_within_the_grace_window() {
    let dir = tempfile::tempdir().unwrap();
    let thumbs = Arc::new(ThumbnailStore::open(dir.path().join("thumbnails")).unwrap());
    let storage = Storage::open_in_memory_for_tests(thumbs.clone());

    let data_url = format!("data:image/png;base64,{TINY_PNG_B64}");
    thumbs.save("not-yet-committed", &data_url).unwrap();

    let existing = existing_ids(&storage).await;
    assert!(existing.is_empty());

    let deleted = thumbs.cleanup_orphans(&existing, diagramhub::thumbnails::ORPHAN_GRACE).unwrap();
    assert!(deleted.is_empty());
    assert!(thumbs.exists("not-yet-committed"));
}
