//! Concurrent ordered map with snapshot range queries.
//!
//! [`IndexedMap`] is a probabilistically layered ordered list: every entry
//! owns a randomly drawn stack of forward links, point lookups descend from
//! the sparsest layer, and mutations lock only the handful of nodes adjacent
//! to the change. Readers never block writers and writers never block
//! readers; a 32-bit operation counter lets [`IndexedMap::query`] detect
//! interference and re-run until it observes a stable pass, so a returned
//! range is always an atomic snapshot.
//!
//! # Example
//!
//! ```
//! use perch_index::{IndexedMap, UpsertOutcome};
//!
//! let map: IndexedMap<String, i64> = IndexedMap::default();
//! let outcome = map
//!     .upsert("a".to_string(), |_key, _current| Ok::<_, std::convert::Infallible>(1))
//!     .unwrap();
//! assert_eq!(outcome, UpsertOutcome::Inserted);
//! assert_eq!(map.find(&"a".to_string()), Some(1));
//! ```

mod map;

pub use map::{IndexedMap, QueryCancelled, UpsertOutcome};

/// Smallest string key a caller can store.
pub const STRING_MIN: &str = "";

/// Upper bound for string-keyed range scans: a single code point above any
/// one-byte character, so every stored name sorts below it.
pub const STRING_MAX: &str = "\u{100}";

/// Default number of layers for a new map.
pub const DEFAULT_MAX_LEVEL: usize = 5;
