//! An ordered set of documents plus its subscriber registry.

use bytes::Bytes;
use perch_index::{IndexedMap, UpsertOutcome, STRING_MAX, STRING_MIN};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::document::{Document, DocumentRecord};
use crate::error::{StoreError, StoreResult};
use crate::patch::{Patch, PatchOutcome};
use crate::path::ResourceKind;
use crate::subscribe::{SubscriberRegistry, Subscription};
use crate::validate::BodyValidator;

/// What a document PUT did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    Updated,
}

/// A collection of documents, ordered by name.
#[derive(Debug)]
pub struct Collection {
    documents: IndexedMap<String, Arc<Document>>,
    subscribers: SubscriberRegistry,
}

impl Default for Collection {
    fn default() -> Self {
        Self::new()
    }
}

impl Collection {
    pub fn new() -> Self {
        Collection {
            documents: IndexedMap::default(),
            subscribers: SubscriberRegistry::new(),
        }
    }

    /// Range-query the documents with `lo <= name <= hi`, in name order.
    pub fn list(
        &self,
        cancel: &CancellationToken,
        lo: &str,
        hi: &str,
    ) -> StoreResult<Vec<DocumentRecord>> {
        let pairs = self
            .documents
            .query(cancel, &lo.to_string(), &hi.to_string())?;
        Ok(pairs.into_iter().map(|(_, doc)| doc.record()).collect())
    }

    /// Create or overwrite the document called `name`.
    ///
    /// An existing document is overwritten in place — creator metadata and
    /// name survive, child collections do not. When `expected_ts` is present
    /// and not `-1`, the overwrite only goes through if it equals the
    /// document's current `lastModifiedAt`. Subscribers whose interval
    /// contains the body's category are told with an `update` event.
    pub async fn put_doc(
        &self,
        name: &str,
        record_path: &str,
        body: Value,
        user: &str,
        expected_ts: Option<i64>,
    ) -> StoreResult<PutOutcome> {
        let outcome = self.documents.upsert(name.to_string(), |_, current| {
            match current {
                Some(existing) => {
                    if let Some(ts) = expected_ts {
                        if ts != -1 && ts != existing.last_modified_at() {
                            return Err(StoreError::StaleTimestamp);
                        }
                    }
                    existing.overwrite(body.clone(), user);
                    Ok(existing.clone())
                }
                None => Ok(Document::new(record_path, user, body.clone())),
            }
        })?;

        info!(name, ?outcome, "document put");
        self.notify_document_event("update", name).await;

        Ok(match outcome {
            UpsertOutcome::Inserted => PutOutcome::Created,
            UpsertOutcome::Updated => PutOutcome::Updated,
        })
    }

    /// Insert a document under a fresh random name.
    ///
    /// Names are 32 hex characters (128 random bits); a collision simply
    /// draws again. The generated name is appended to the stored path after
    /// the insert succeeds, so the record's path matches the `Location` the
    /// caller will advertise. Subscribers get a `create` event.
    pub async fn post_doc(&self, base_path: &str, body: Value, user: &str) -> StoreResult<String> {
        struct NameTaken;

        let doc = Document::new(base_path, user, body);
        let name = loop {
            let candidate = Uuid::new_v4().simple().to_string();
            let result = self.documents.upsert(candidate.clone(), |_, current| {
                if current.is_some() {
                    return Err(NameTaken);
                }
                Ok(doc.clone())
            });
            match result {
                Ok(_) => break candidate,
                Err(NameTaken) => {
                    debug!(name = %candidate, "generated name collided, retrying");
                }
            }
        };

        doc.append_path(&name);
        info!(name = %name, "document posted");
        self.notify_document_event("create", &name).await;
        Ok(name)
    }

    /// Apply a patch batch to the document called `name`.
    ///
    /// The batch runs inside the upsert critical section, which serializes it
    /// against concurrent writers to the same name and publishes the write to
    /// the operation counter so range scans restart. A failed batch reports
    /// through the returned [`PatchOutcome`]; only a missing document is an
    /// error.
    pub async fn patch_doc(
        &self,
        name: &str,
        patches: &[Patch],
        validator: &dyn BodyValidator,
        user: &str,
        uri: &str,
    ) -> StoreResult<PatchOutcome> {
        let mut outcome = None;
        self.documents.upsert(name.to_string(), |_, current| {
            let Some(doc) = current else {
                return Err(StoreError::Absent(ResourceKind::Document));
            };
            outcome = Some(doc.apply_patches(patches, validator, user, uri));
            Ok(doc.clone())
        })?;

        let outcome = outcome
            .ok_or_else(|| StoreError::Internal("patch ran without producing an outcome".into()))?;
        if !outcome.patch_failed {
            self.notify_document_event("update", name).await;
        }
        Ok(outcome)
    }

    /// Delete the document called `name`; `uri` is the request path carried
    /// in the delete event.
    pub async fn delete_doc(&self, name: &str, uri: &str) -> StoreResult<()> {
        if self.documents.remove(&name.to_string()).is_none() {
            return Err(StoreError::Absent(ResourceKind::Document));
        }

        info!(name, "document deleted");
        let event = json!({ "action": "delete", "document": uri });
        if let Ok(payload) = serde_json::to_vec(&event) {
            self.subscribers
                .notify_delete(Bytes::from(payload), &deletion_interval_value(uri))
                .await;
        }
        Ok(())
    }

    pub fn find_doc(&self, name: &str) -> Option<Arc<Document>> {
        self.documents.find(&name.to_string())
    }

    /// Register a live listener over `[interval_start, interval_end]`.
    pub fn subscribe(&self, interval_start: String, interval_end: String) -> Subscription {
        self.subscribers.subscribe(interval_start, interval_end)
    }

    /// Fan an update event out to this collection's subscribers.
    pub async fn notify_update(&self, event: Bytes, interval_value: &str) {
        self.subscribers.notify_update(event, interval_value).await;
    }

    /// Fan a delete event out to this collection's subscribers.
    pub async fn notify_delete(&self, event: Bytes, interval_value: &str) {
        self.subscribers.notify_delete(event, interval_value).await;
    }

    /// Build and deliver an `update`/`create` event carrying the named
    /// document's current record.
    async fn notify_document_event(&self, action: &str, name: &str) {
        let Some(doc) = self.find_doc(name) else {
            return;
        };
        let record = doc.record();
        let interval_value = interval_value_for(&record.doc);
        let event = json!({ "action": action, "document": record });
        if let Ok(payload) = serde_json::to_vec(&event) {
            self.subscribers
                .notify_update(Bytes::from(payload), &interval_value)
                .await;
        }
    }
}

/// Interval value of an update: the body's `category` string field when the
/// body is an object carrying one, `general` otherwise.
pub fn interval_value_for(body: &Value) -> String {
    body.as_object()
        .and_then(|m| m.get("category"))
        .and_then(Value::as_str)
        .unwrap_or("general")
        .to_string()
}

/// Interval value of a deletion: the segment following `categories` in the
/// deleted path, `general` otherwise.
pub fn deletion_interval_value(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    parts
        .windows(2)
        .find(|pair| pair[0] == "categories")
        .map(|pair| pair[1].to_string())
        .unwrap_or_else(|| "general".to_string())
}

/// Parse an `interval=[lo,hi]` query value.
///
/// Anything that is not a two-element bracketed list falls back to the full
/// key range; an empty upper bound means "up to the maximum".
pub fn parse_interval(raw: &str) -> (String, String) {
    let full = (STRING_MIN.to_string(), STRING_MAX.to_string());
    let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) else {
        return full;
    };
    let parts: Vec<&str> = inner.split(',').collect();
    if parts.len() != 2 {
        return full;
    }
    let lo = parts[0].to_string();
    let hi = if parts[1].is_empty() {
        STRING_MAX.to_string()
    } else {
        parts[1].to_string()
    };
    (lo, hi)
}
