//! Flows across the whole document tree: holder → collection → document.

use perch_index::{STRING_MAX, STRING_MIN};
use perch_store::path::{resolve, split_parent, Resource, ResourceKind};
use perch_store::{AllowAll, CollectionHolder, Patch, PatchOp, StoreError};
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn seeded() -> CollectionHolder {
    let root = CollectionHolder::new();
    root.put("db").unwrap();
    let db = root.get("db").unwrap();
    db.put_doc("d1", "/d1", json!({"prop": 100}), "alice", None)
        .await
        .unwrap();
    root
}

#[tokio::test]
async fn resolve_follows_what_writes_created() {
    let root = seeded().await;

    let Resource::Document(doc) = resolve("/v1/db/d1", &root).unwrap() else {
        panic!("expected a document");
    };
    assert_eq!(doc.body(), json!({"prop": 100}));

    doc.put_child("notes").unwrap();
    let Resource::Collection(notes) = resolve("/v1/db/d1/notes/", &root).unwrap() else {
        panic!("expected a collection");
    };
    notes
        .put_doc("n1", "/d1/notes/n1", json!({"text": "hi"}), "alice", None)
        .await
        .unwrap();

    let Resource::Document(nested) = resolve("/v1/db/d1/notes/n1", &root).unwrap() else {
        panic!("expected the nested document");
    };
    assert_eq!(nested.path(), "/d1/notes/n1");
}

#[tokio::test]
async fn parent_splitting_matches_resolution() {
    let root = seeded().await;

    let (parent, name, kind) = split_parent("/v1/db/d1").unwrap();
    assert_eq!(kind, ResourceKind::Document);
    let Resource::Database(coll) = resolve(&parent, &root).unwrap() else {
        panic!("parent of a database document is the database");
    };
    assert!(coll.find_doc(&name).is_some());
}

#[tokio::test]
async fn overwrite_prunes_resolution_below_it() {
    let root = seeded().await;
    let Resource::Document(doc) = resolve("/v1/db/d1", &root).unwrap() else {
        panic!();
    };
    doc.put_child("notes").unwrap();
    assert!(resolve("/v1/db/d1/notes/", &root).is_ok());

    let db = root.get("db").unwrap();
    db.put_doc("d1", "/d1", json!({"fresh": 1}), "bob", None)
        .await
        .unwrap();

    assert!(matches!(
        resolve("/v1/db/d1/notes/", &root),
        Err(perch_store::PathError::Missing(ResourceKind::Collection))
    ));
}

#[tokio::test]
async fn patch_through_the_tree_updates_the_record() {
    let root = seeded().await;
    let db = root.get("db").unwrap();

    let patches = vec![Patch {
        op: PatchOp::ObjectAdd,
        path: "/tags".to_string(),
        value: json!([]),
    }];
    let outcome = db
        .patch_doc("d1", &patches, &AllowAll, "bob", "/v1/db/d1")
        .await
        .unwrap();
    assert!(!outcome.patch_failed);

    let cancel = CancellationToken::new();
    let records = db.list(&cancel, STRING_MIN, STRING_MAX).unwrap();
    assert_eq!(records[0].doc, json!({"prop": 100, "tags": []}));
    assert_eq!(records[0].meta.last_modified_by, "bob");
}

#[tokio::test]
async fn concurrent_puts_into_one_collection_all_land() {
    let root = CollectionHolder::new();
    root.put("db").unwrap();
    let db = root.get("db").unwrap();

    let mut handles = Vec::new();
    for i in 0..32 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let name = format!("doc-{i:02}");
            db.put_doc(&name, &format!("/{name}"), json!({"i": i}), "alice", None)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let cancel = CancellationToken::new();
    let records = db.list(&cancel, STRING_MIN, STRING_MAX).unwrap();
    assert_eq!(records.len(), 32);
    let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);
}

#[tokio::test]
async fn posted_documents_are_queryable_by_their_name() {
    let root = CollectionHolder::new();
    root.put("db").unwrap();
    let db = root.get("db").unwrap();

    let name = db.post_doc("/", json!({"prop": 1}), "alice").await.unwrap();

    let cancel = CancellationToken::new();
    let records = db.list(&cancel, &name, &name).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].path, format!("/{name}"));
}

#[tokio::test]
async fn database_lifecycle_recreation_starts_empty() {
    let root = seeded().await;
    root.delete("db", "/v1/db").await.unwrap();
    root.put("db").unwrap();

    let db = root.get("db").unwrap();
    let cancel = CancellationToken::new();
    assert!(db.list(&cancel, STRING_MIN, STRING_MAX).unwrap().is_empty());
}

#[tokio::test]
async fn stale_timestamp_surfaces_from_the_tree() {
    let root = seeded().await;
    let db = root.get("db").unwrap();
    let err = db
        .put_doc("d1", "/d1", json!({}), "bob", Some(12345))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::StaleTimestamp);
}
