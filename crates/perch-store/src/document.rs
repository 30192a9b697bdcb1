//! A single JSON document: body, metadata and nested collections.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::holder::CollectionHolder;
use crate::now_millis;
use crate::patch::{apply_patch, Patch, PatchOutcome};
use crate::subscribe::{SubscriberRegistry, Subscription};
use crate::validate::BodyValidator;

/// Who touched a document and when (millisecond epochs).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub created_by: String,
    pub created_at: i64,
    pub last_modified_by: String,
    pub last_modified_at: i64,
}

impl Meta {
    fn new(user: &str) -> Self {
        let now = now_millis();
        Meta {
            created_by: user.to_string(),
            created_at: now,
            last_modified_by: user.to_string(),
            last_modified_at: now,
        }
    }
}

/// The shape a document read serializes to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub path: String,
    pub doc: Value,
    pub meta: Meta,
}

#[derive(Debug)]
struct DocState {
    path: String,
    body: Value,
    meta: Meta,
    children: CollectionHolder,
}

/// A shared, internally synchronized document.
///
/// The body, metadata and child collections live behind one lock so a read
/// snapshot is always self-consistent. Documents are handed around as
/// `Arc<Document>`; collection-level upserts serialize writers per name.
#[derive(Debug)]
pub struct Document {
    state: RwLock<DocState>,
    subscribers: SubscriberRegistry,
}

impl Document {
    /// Create a document owned by `user`, stored under `path` (relative to
    /// its database, e.g. `/d1`).
    pub fn new(path: impl Into<String>, user: &str, body: Value) -> Arc<Self> {
        Arc::new(Document {
            state: RwLock::new(DocState {
                path: path.into(),
                body,
                meta: Meta::new(user),
                children: CollectionHolder::new(),
            }),
            subscribers: SubscriberRegistry::new(),
        })
    }

    /// Self-consistent snapshot of path, body and metadata.
    pub fn record(&self) -> DocumentRecord {
        let state = self.state.read();
        DocumentRecord {
            path: state.path.clone(),
            doc: state.body.clone(),
            meta: state.meta.clone(),
        }
    }

    pub fn body(&self) -> Value {
        self.state.read().body.clone()
    }

    pub fn path(&self) -> String {
        self.state.read().path.clone()
    }

    pub fn created_by(&self) -> String {
        self.state.read().meta.created_by.clone()
    }

    pub fn last_modified_at(&self) -> i64 {
        self.state.read().meta.last_modified_at
    }

    /// Replace the body, stamp the modification metadata, and drop every
    /// child collection — an overwrite starts the subtree over.
    pub fn overwrite(&self, body: Value, user: &str) {
        let mut state = self.state.write();
        state.body = body;
        state.meta.last_modified_by = user.to_string();
        state.meta.last_modified_at = now_millis();
        state.children = CollectionHolder::new();
        debug!(path = %state.path, user, "document overwritten");
    }

    /// Append `suffix` to the stored path; used once a POSTed document has
    /// won its generated name.
    pub fn append_path(&self, suffix: &str) {
        self.state.write().path.push_str(suffix);
    }

    /// Apply a patch batch atomically.
    ///
    /// Patches run in order against a private copy; the first failure aborts
    /// the whole batch and the document is untouched. When every patch lands
    /// the result must still satisfy the schema, and only then does it
    /// replace the body (which also wipes child collections, like any other
    /// overwrite).
    pub fn apply_patches(
        &self,
        patches: &[Patch],
        validator: &dyn BodyValidator,
        user: &str,
        uri: &str,
    ) -> PatchOutcome {
        let mut body = self.body();
        for (i, patch) in patches.iter().enumerate() {
            match apply_patch(&body, patch) {
                Ok(next) => body = next,
                Err(err) => {
                    info!(uri, index = i, %err, "patch batch aborted");
                    return PatchOutcome::failure(uri, format!("error applying patch {i}: {err}"));
                }
            }
        }

        if let Err(err) = validator.validate(&body) {
            info!(uri, "patched document rejected by schema");
            return PatchOutcome::failure(
                uri,
                format!("patched document does not conform to the schema: {err}"),
            );
        }

        self.overwrite(body, user);
        PatchOutcome::success(uri)
    }

    /// Look up a child collection by name.
    pub fn get_child(&self, name: &str) -> Option<Arc<crate::collection::Collection>> {
        self.state.read().children.get(name)
    }

    /// Create a named child collection; fails if the name is taken.
    pub fn put_child(&self, name: &str) -> crate::error::StoreResult<()> {
        self.state.read().children.put(name)
    }

    /// Delete a named child collection.
    pub async fn delete_child(&self, name: &str, uri: &str) -> crate::error::StoreResult<()> {
        // Clone the holder handle out so the state lock is not held across
        // the subscriber notification.
        let children = self.state.read().children.clone();
        children.delete(name, uri).await
    }

    /// Register a live listener on this document.
    ///
    /// The current record is queued as an `update` event before the
    /// subscription is returned, so the client always starts from the
    /// present state.
    pub async fn subscribe(&self, interval_start: String, interval_end: String) -> Subscription {
        let subscription = self.subscribers.subscribe(interval_start, interval_end);
        let snapshot = json!({ "action": "update", "content": self.record() });
        if let Ok(payload) = serde_json::to_vec(&snapshot) {
            subscription.subscriber.enqueue(Bytes::from(payload)).await;
        }
        subscription
    }

    /// Fan an update event out to this document's subscribers.
    pub async fn notify_update(&self, event: Bytes, interval_value: &str) {
        self.subscribers.notify_update(event, interval_value).await;
    }

    /// Fan a delete event out to this document's subscribers.
    pub async fn notify_delete(&self, event: Bytes, interval_value: &str) {
        self.subscribers.notify_delete(event, interval_value).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchOp;
    use crate::validate::AllowAll;
    use serde_json::json;

    struct RejectAll;

    impl BodyValidator for RejectAll {
        fn validate(&self, _body: &Value) -> Result<(), String> {
            Err("rejected".to_string())
        }
    }

    #[test]
    fn new_document_stamps_creator() {
        let doc = Document::new("/d1", "alice", json!({"prop": 100}));
        let record = doc.record();
        assert_eq!(record.path, "/d1");
        assert_eq!(record.doc, json!({"prop": 100}));
        assert_eq!(record.meta.created_by, "alice");
        assert_eq!(record.meta.last_modified_by, "alice");
        assert!(record.meta.created_at <= record.meta.last_modified_at);
    }

    #[test]
    fn overwrite_keeps_creator_and_wipes_children() {
        let doc = Document::new("/d1", "alice", json!({"v": 1}));
        doc.put_child("sub").unwrap();
        assert!(doc.get_child("sub").is_some());

        doc.overwrite(json!({"v": 2}), "bob");

        let record = doc.record();
        assert_eq!(record.doc, json!({"v": 2}));
        assert_eq!(record.meta.created_by, "alice");
        assert_eq!(record.meta.last_modified_by, "bob");
        assert!(doc.get_child("sub").is_none());
    }

    #[test]
    fn record_serializes_camel_case_meta() {
        let doc = Document::new("/d1", "alice", json!(null));
        let text = serde_json::to_string(&doc.record()).unwrap();
        assert!(text.contains("\"createdBy\":\"alice\""));
        assert!(text.contains("\"lastModifiedAt\""));
    }

    #[test]
    fn patch_batch_applies_in_order() {
        let doc = Document::new("/d1", "alice", json!({"prop": 100}));
        let patches = vec![
            Patch {
                op: PatchOp::ObjectAdd,
                path: "/a".to_string(),
                value: json!(100),
            },
            Patch {
                op: PatchOp::ObjectAdd,
                path: "/b".to_string(),
                value: json!([]),
            },
            Patch {
                op: PatchOp::ArrayAdd,
                path: "/b".to_string(),
                value: json!("x"),
            },
        ];

        let outcome = doc.apply_patches(&patches, &AllowAll, "bob", "/v1/db/d1");
        assert!(!outcome.patch_failed);
        assert_eq!(outcome.message, "patches applied");
        assert_eq!(outcome.uri, "/v1/db/d1");
        assert_eq!(doc.body(), json!({"prop": 100, "a": 100, "b": ["x"]}));
        assert_eq!(doc.record().meta.last_modified_by, "bob");
    }

    #[test]
    fn failed_patch_leaves_document_unchanged() {
        let doc = Document::new("/d1", "alice", json!({"b": 5}));
        let patches = vec![
            Patch {
                op: PatchOp::ObjectAdd,
                path: "/ok".to_string(),
                value: json!(1),
            },
            Patch {
                op: PatchOp::ArrayAdd,
                path: "/b".to_string(),
                value: json!(100),
            },
        ];

        let outcome = doc.apply_patches(&patches, &AllowAll, "bob", "/v1/db/d1");
        assert!(outcome.patch_failed);
        assert!(outcome.message.contains("patch 1"));
        assert_eq!(doc.body(), json!({"b": 5}));
        assert_eq!(doc.record().meta.last_modified_by, "alice");
    }

    #[test]
    fn schema_rejection_aborts_the_batch() {
        let doc = Document::new("/d1", "alice", json!({}));
        let patches = vec![Patch {
            op: PatchOp::ObjectAdd,
            path: "/a".to_string(),
            value: json!(1),
        }];

        let outcome = doc.apply_patches(&patches, &RejectAll, "bob", "/v1/db/d1");
        assert!(outcome.patch_failed);
        assert!(outcome.message.contains("schema"));
        assert_eq!(doc.body(), json!({}));
    }

    #[tokio::test]
    async fn subscribe_sends_the_current_record_first() {
        let doc = Document::new("/d1", "alice", json!({"v": 1}));
        let mut sub = doc
            .subscribe("a".to_string(), "z".to_string())
            .await;
        let first = sub.receiver.try_recv().unwrap();
        let event: Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(event["action"], "update");
        assert_eq!(event["content"]["doc"], json!({"v": 1}));
    }
}
