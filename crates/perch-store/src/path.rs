//! Request-path resolution.
//!
//! Paths look like `/v1/<db>[/<doc>[/<coll>…]]`: after the version prefix,
//! even-positioned segments name collections and odd-positioned segments
//! name documents. A trailing slash addresses a collection, its absence a
//! database or document.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::collection::Collection;
use crate::document::Document;
use crate::holder::CollectionHolder;

/// The kind of resource a path addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// `/v1/<db>` — the PUT/DELETE form of a database.
    DatabaseBare,
    /// `/v1/<db>/` — a database queried as a collection.
    Database,
    /// `/v1/<db>/<doc>/<coll>/` and deeper.
    Collection,
    /// `/v1/<db>/<doc>` and deeper, no trailing slash.
    Document,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::DatabaseBare | ResourceKind::Database => "Database",
            ResourceKind::Collection => "Collection",
            ResourceKind::Document => "Document",
        };
        f.write_str(name)
    }
}

/// A resolved resource.
#[derive(Debug)]
pub enum Resource {
    DatabaseBare(Arc<Collection>),
    Database(Arc<Collection>),
    Collection(Arc<Collection>),
    Document(Arc<Document>),
}

/// Why a path failed to resolve.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("no /v1/ version prefix")]
    NoVersion,

    #[error("bad slash placement")]
    BadSlash,

    #[error("blank path segment")]
    BlankSegment,

    /// A lookup along the path failed; carries the kind the full path was
    /// expected to address, so the caller can say what was missing.
    #[error("{0} not found")]
    Missing(ResourceKind),

    #[error("internal path resolution error")]
    Internal,
}

/// Walk `path` from the root holder down to the resource it addresses.
pub fn resolve(path: &str, root: &CollectionHolder) -> Result<Resource, PathError> {
    let Some(rest) = path.strip_prefix("/v1/") else {
        return Err(PathError::NoVersion);
    };
    let segments: Vec<&str> = rest.split('/').collect();
    debug!(path, ?segments, "resolving path");

    // A slash after a document name (or a path ending in a collection name
    // without one) has the wrong parity.
    if segments.len() > 1 && segments.len() % 2 == 1 {
        return Err(PathError::BadSlash);
    }

    let kind = expected_kind(&segments);

    let mut coll: Option<Arc<Collection>> = None;
    let mut doc: Option<Arc<Document>> = None;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            if i != segments.len() - 1 {
                return Err(PathError::BlankSegment);
            }
            if i == 0 {
                // "/v1/" names nothing at all.
                return Err(PathError::BadSlash);
            }
            let coll = coll.ok_or(PathError::Internal)?;
            return Ok(match kind {
                ResourceKind::Database => Resource::Database(coll),
                _ => Resource::Collection(coll),
            });
        }

        let found = if i == 0 {
            coll = root.get(segment);
            coll.is_some()
        } else if i % 2 == 1 {
            doc = coll.as_ref().and_then(|c| c.find_doc(segment));
            doc.is_some()
        } else {
            coll = doc.as_ref().and_then(|d| d.get_child(segment));
            coll.is_some()
        };
        if !found {
            debug!(path, segment, "lookup failed");
            return Err(PathError::Missing(kind));
        }
    }

    match kind {
        ResourceKind::DatabaseBare => coll.map(Resource::DatabaseBare).ok_or(PathError::Internal),
        ResourceKind::Document => doc.map(Resource::Document).ok_or(PathError::Internal),
        _ => Err(PathError::Internal),
    }
}

fn expected_kind(segments: &[&str]) -> ResourceKind {
    if segments.len() == 1 {
        ResourceKind::DatabaseBare
    } else if segments.len() == 2 && segments[1].is_empty() {
        ResourceKind::Database
    } else if segments.last().is_some_and(|s| s.is_empty()) {
        ResourceKind::Collection
    } else {
        ResourceKind::Document
    }
}

/// Split a path into the parent container's path, the final resource name,
/// and the kind of the *full* path. Create and delete address the parent.
pub fn split_parent(path: &str) -> Result<(String, String, ResourceKind), PathError> {
    let Some(rest) = path.strip_prefix("/v1/") else {
        return Err(PathError::NoVersion);
    };
    let segments: Vec<&str> = rest.split('/').collect();

    if segments.len() == 1 {
        return named(String::new(), segments[0], ResourceKind::DatabaseBare);
    }
    if segments.len() == 2 && segments[1].is_empty() {
        return named(String::new(), segments[0], ResourceKind::Database);
    }
    if segments.len() % 2 == 1 {
        return Err(PathError::BadSlash);
    }

    if segments.last().is_some_and(|s| s.is_empty()) {
        // A collection lives in the document two segments up:
        // /v1/a/d/c/ → parent /v1/a/d, name c.
        let name = segments[segments.len() - 2];
        let parent = format!("/v1/{}", segments[..segments.len() - 2].join("/"));
        named(parent, name, ResourceKind::Collection)
    } else {
        // A document lives in the collection one segment up, which keeps its
        // trailing slash: /v1/a/d → parent /v1/a/, name d.
        let name = segments[segments.len() - 1];
        let parent = format!("/v1/{}/", segments[..segments.len() - 1].join("/"));
        named(parent, name, ResourceKind::Document)
    }
}

fn named(
    parent: String,
    name: &str,
    kind: ResourceKind,
) -> Result<(String, String, ResourceKind), PathError> {
    if name.is_empty() {
        return Err(PathError::BlankSegment);
    }
    Ok((parent, name.to_string(), kind))
}

/// The path a document stores: the request path with `/v1/<db>` stripped
/// (`/v1/db/d1` → `/d1`, `/v1/db/` → `/`).
pub fn relative_path(uri: &str) -> String {
    let tail = uri.splitn(4, '/').nth(3).unwrap_or("");
    format!("/{tail}")
}
