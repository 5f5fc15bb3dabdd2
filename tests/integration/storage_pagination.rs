//! Integration coverage for `ListPaginated`, full-text search, and type
//! filtering (spec §4.4, §8 scenario 5).

use std::sync::Arc;

use diagramhub::spec::{DiagramSpec, DiagramType, Node};
use diagramhub::storage::{ListFilter, SortBy, SortOrder, Storage};
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

/// Mirrors spec §8 scenario 5 literally: 15 diagrams named "API Test 00"
/// through "API Test 14", 10 of them flowcharts and 5 sequence diagrams, a
/// search for "API Test 0" should hit exactly the 10 whose name contains it,
/// and a `types: ["flowchart"]` filter should return exactly the 10 flowcharts.
#[tokio::test]
async fn scenario_5_search_and_type_filter() {
    let storage = storage();
    for i in 0..15 {
        let diagram_type = if i < 10 { DiagramType::Flowchart } else { DiagramType::Sequence };
        let spec = DiagramSpec::empty(diagram_type);
        storage
            .create(format!("API Test {i:02}"), "shared".into(), spec, None, false)
            .await
            .unwrap();
    }

    let by_search = storage
        .list_paginated(ListFilter { search: Some("API Test 0".into()), limit: 50, ..ListFilter::defaults() })
        .await
        .unwrap();
    assert_eq!(by_search.total, 10);
    assert_eq!(by_search.data.len(), 10);
    assert!(by_search.data.iter().all(|d| d.name.starts_with("API Test 0")));

    let by_type = storage
        .list_paginated(ListFilter {
            types: Some(vec!["flowchart".into()]),
            limit: 50,
            ..ListFilter::defaults()
        })
        .await
        .unwrap();
    assert_eq!(by_type.total, 10);
    assert!(by_type.data.iter().all(|d| d.spec.spec.diagram_type == DiagramType::Flowchart));
}

#[tokio::test]
async fn unknown_type_filter_short_circuits_to_empty_page() {
    let storage = storage();
    storage
        .create("d".into(), "p".into(), DiagramSpec::empty(DiagramType::Flowchart), None, false)
        .await
        .unwrap();

    let page = storage
        .list_paginated(ListFilter { types: Some(vec!["not-a-real-type".into()]), ..ListFilter::defaults() })
        .await
        .unwrap();
    assert_eq!(page.total, 0);
    assert!(page.data.is_empty());
}

#[tokio::test]
async fn short_search_term_falls_back_to_like() {
    let storage = storage();
    storage.create("ab".into(), "p".into(), DiagramSpec::empty(DiagramType::Flowchart), None, false).await.unwrap();
    storage.create("zz".into(), "p".into(), DiagramSpec::empty(DiagramType::Flowchart), None, false).await.unwrap();

    // A two-character search term is below the FTS trigram floor, so it must
    // go through the `LIKE` fallback rather than an FTS `MATCH`.
    let page = storage
        .list_paginated(ListFilter { search: Some("ab".into()), ..ListFilter::defaults() })
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.data[0].name, "ab");
}

#[tokio::test]
async fn pagination_limit_and_offset_slice_correctly() {
    let storage = storage();
    for i in 0..5 {
        storage
            .create(format!("d{i}"), "p".into(), DiagramSpec::empty(DiagramType::Flowchart), None, false)
            .await
            .unwrap();
    }

    let page1 = storage
        .list_paginated(ListFilter {
            limit: 2,
            offset: 0,
            sort_by: Some(SortBy::Name),
            sort_order: Some(SortOrder::Asc),
            ..ListFilter::defaults()
        })
        .await
        .unwrap();
    assert_eq!(page1.total, 5);
    assert_eq!(page1.data.len(), 2);
    assert_eq!(page1.data[0].name, "d0");
    assert_eq!(page1.data[1].name, "d1");

    let page2 = storage
        .list_paginated(ListFilter {
            limit: 2,
            offset: 2,
            sort_by: Some(SortBy::Name),
            sort_order: Some(SortOrder::Asc),
            ..ListFilter::defaults()
        })
        .await
        .unwrap();
    assert_eq!(page2.data[0].name, "d2");
    assert_eq!(page2.data[1].name, "d3");
}

#[tokio::test]
async fn list_for_user_sees_own_public_and_shared_but_not_others_private() {
    let storage = storage();
    let spec = DiagramSpec::empty(DiagramType::Flowchart);

    let mine = storage.create("mine".into(), "p".into(), spec.clone(), Some("alice".into()), false).await.unwrap();
    let public = storage.create("public".into(), "p".into(), spec.clone(), Some("bob".into()), true).await.unwrap();
    let private_other = storage
        .create("private".into(), "p".into(), spec.clone(), Some("bob".into()), false)
        .await
        .unwrap();
    let legacy = storage.create("legacy".into(), "p".into(), spec.clone(), None, false).await.unwrap();

    storage.add_share(private_other.id.clone(), "alice".into(), diagramhub::storage::Permission::Viewer).await.unwrap();

    let page = storage.list_for_user(Some("alice".into()), ListFilter { limit: 50, ..ListFilter::defaults() }).await.unwrap();
    let ids: Vec<&str> = page.data.iter().map(|d| d.id.as_str()).collect();
    assert!(ids.contains(&mine.id.as_str()));
    assert!(ids.contains(&public.id.as_str()));
    assert!(ids.contains(&private_other.id.as_str()));
    assert!(ids.contains(&legacy.id.as_str()));

    let stranger_page = storage.list_for_user(Some("carol".into()), ListFilter { limit: 50, ..ListFilter::defaults() }).await.unwrap();
    let stranger_ids: Vec<&str> = stranger_page.data.iter().map(|d| d.id.as_str()).collect();
    assert!(!stranger_ids.contains(&private_other.id.as_str()));
    assert!(stranger_ids.contains(&public.id.as_str()));
    assert!(stranger_ids.contains(&legacy.id.as_str()));
}
