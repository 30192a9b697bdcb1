//! The perchdb document tree.
//!
//! A process hosts one root [`CollectionHolder`] of databases; each database
//! is a [`Collection`] of [`Document`]s, and each document embeds another
//! holder for nested collections. Every container is backed by the
//! concurrent ordered map from `perch-index`, so point operations are
//! conditional-write safe and range reads are stable snapshots. Mutations
//! fan out to live subscribers through per-container registries.
//!
//! The HTTP surface lives in `perch-server`; this crate only speaks typed
//! operations and typed errors.

pub mod collection;
pub mod document;
pub mod error;
pub mod holder;
pub mod patch;
pub mod path;
pub mod subscribe;
pub mod validate;

pub use collection::{Collection, PutOutcome};
pub use document::{Document, DocumentRecord, Meta};
pub use error::{StoreError, StoreResult};
pub use holder::CollectionHolder;
pub use patch::{apply_patch, Patch, PatchError, PatchOp, PatchOutcome};
pub use path::{PathError, Resource, ResourceKind};
pub use subscribe::{SubscriberRegistry, Subscription};
pub use validate::{AllowAll, BodyValidator};

/// Milliseconds since the Unix epoch; the clock used for document metadata
/// and event ids.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
