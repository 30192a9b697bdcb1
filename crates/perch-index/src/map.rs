//! The layered ordered map and its locking protocol.
//!
//! Every node carries a `marked` flag (logically deleted) and a
//! `fully_linked` flag (insertion finished at every layer). Readers only
//! trust nodes that are fully linked and unmarked. Writers lock the
//! predecessors adjacent to the splice from the bottom layer up — descending
//! key order, the same global order `remove` establishes by locking its
//! victim before the victim's predecessors — and re-validate the links after
//! locking, retrying from a fresh traversal when another writer got there
//! first.

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::DEFAULT_MAX_LEVEL;

/// What a successful [`IndexedMap::upsert`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The key was absent and a new entry was spliced in.
    Inserted,
    /// The key existed and its value was replaced in place.
    Updated,
}

/// The cancellation token fired before a range pass completed without
/// interference from concurrent writers.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("range query cancelled before a stable pass completed")]
pub struct QueryCancelled;

/// Internal key space. Sentinels order strictly below and above every entry
/// key, so traversals never run off either end of a layer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Key<K> {
    Min,
    Entry(K),
    Max,
}

impl<K: Ord> Key<K> {
    fn is_below(&self, key: &K) -> bool {
        match self {
            Key::Min => true,
            Key::Entry(k) => k < key,
            Key::Max => false,
        }
    }

    fn matches(&self, key: &K) -> bool {
        matches!(self, Key::Entry(k) if k == key)
    }
}

type Link<K, V> = Option<Arc<Node<K, V>>>;

#[derive(Debug)]
struct Node<K, V> {
    key: Key<K>,
    /// `None` only on the sentinels, which are never read as entries.
    value: Option<RwLock<V>>,
    /// Structural lock: held while this node's outgoing links are rewritten
    /// or while it serves as a locked predecessor of a splice.
    guard: Mutex<()>,
    next: Vec<RwLock<Link<K, V>>>,
    marked: AtomicBool,
    fully_linked: AtomicBool,
    top_level: usize,
}

impl<K, V> Node<K, V> {
    fn entry(key: K, value: V, top_level: usize) -> Arc<Self> {
        Arc::new(Node {
            key: Key::Entry(key),
            value: Some(RwLock::new(value)),
            guard: Mutex::new(()),
            next: (0..=top_level).map(|_| RwLock::new(None)).collect(),
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(false),
            top_level,
        })
    }

    fn value(&self) -> &RwLock<V> {
        self.value
            .as_ref()
            .expect("sentinel nodes never carry a value")
    }

    fn forward(&self, level: usize) -> Arc<Node<K, V>> {
        self.next[level]
            .read()
            .clone()
            .expect("forward links are only severed on drop")
    }
}

/// Concurrent ordered key→value map.
///
/// Point lookups and range scans are lock-free; `upsert` and `remove` take
/// per-node locks around the splice. Values are cloned out on read, so `V`
/// is typically an `Arc` or another cheaply cloned handle.
#[derive(Debug)]
pub struct IndexedMap<K, V> {
    head: Arc<Node<K, V>>,
    ops: AtomicU32,
    max_level: usize,
}

impl<K: Ord + Clone, V: Clone> IndexedMap<K, V> {
    /// Create an empty map with `max_level` layers.
    pub fn new(max_level: usize) -> Self {
        assert!(max_level >= 1, "a map needs at least one layer");
        let tail: Arc<Node<K, V>> = Arc::new(Node {
            key: Key::Max,
            value: None,
            guard: Mutex::new(()),
            next: Vec::new(),
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(true),
            top_level: 0,
        });
        let head = Arc::new(Node {
            key: Key::Min,
            value: None,
            guard: Mutex::new(()),
            next: (0..max_level)
                .map(|_| RwLock::new(Some(tail.clone())))
                .collect(),
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(true),
            top_level: max_level - 1,
        });
        IndexedMap {
            head,
            ops: AtomicU32::new(0),
            max_level,
        }
    }

    /// Look up `key` without taking any locks.
    ///
    /// Returns the value only when the matching entry is fully linked and
    /// unmarked, so a reader never observes a half-inserted or logically
    /// deleted entry.
    pub fn find(&self, key: &K) -> Option<V> {
        let (found, _, succs) = self.search(key);
        let node = &succs[found?];
        if node.fully_linked.load(Ordering::Acquire) && !node.marked.load(Ordering::Acquire) {
            Some(node.value().read().clone())
        } else {
            None
        }
    }

    /// Insert or update `key`, letting `check` decide inside the critical
    /// section.
    ///
    /// `check` receives the current value when the key exists and `None` when
    /// it does not; the value it returns is stored, and an error aborts the
    /// operation without touching the map. `check` may run more than once if
    /// the splice has to be retried.
    pub fn upsert<F, E>(&self, key: K, mut check: F) -> Result<UpsertOutcome, E>
    where
        F: FnMut(&K, Option<&V>) -> Result<V, E>,
    {
        let top_level = self.random_level();
        loop {
            let (found, preds, succs) = self.search(&key);

            if let Some(level) = found {
                let node = succs[level].clone();
                if !node.marked.load(Ordering::Acquire) {
                    // An in-flight insert owns this node until it is fully
                    // linked; wait it out rather than racing the splice.
                    while !node.fully_linked.load(Ordering::Acquire) {
                        std::hint::spin_loop();
                    }
                    let node_guard = node.guard.lock();
                    let new_value = {
                        let current = node.value().read();
                        check(&key, Some(&*current))
                    }?;
                    *node.value().write() = new_value;
                    drop(node_guard);
                    self.ops.fetch_add(1, Ordering::SeqCst);
                    return Ok(UpsertOutcome::Updated);
                }
                // Marked victim still being unlinked; retry once it is gone.
                continue;
            }

            let new_value = check(&key, None)?;

            let locked = distinct_bottom_up(&preds[..=top_level]);
            let guards: Vec<_> = locked.iter().map(|p| p.guard.lock()).collect();

            let valid = (0..=top_level).all(|level| {
                let pred = &preds[level];
                let succ = &succs[level];
                !pred.marked.load(Ordering::Acquire)
                    && !succ.marked.load(Ordering::Acquire)
                    && pred.next[level]
                        .read()
                        .as_ref()
                        .is_some_and(|n| Arc::ptr_eq(n, succ))
            });
            if !valid {
                trace!("upsert: splice invalidated by a concurrent writer, retrying");
                drop(guards);
                continue;
            }

            let node = Node::entry(key.clone(), new_value, top_level);
            for level in 0..=top_level {
                *node.next[level].write() = Some(succs[level].clone());
            }
            for level in 0..=top_level {
                *preds[level].next[level].write() = Some(node.clone());
            }
            node.fully_linked.store(true, Ordering::Release);
            drop(guards);
            self.ops.fetch_add(1, Ordering::SeqCst);
            return Ok(UpsertOutcome::Inserted);
        }
    }

    /// Remove `key`, returning its value.
    ///
    /// Setting the victim's marked flag under its lock is the linearization
    /// point; the physical unlink happens afterwards under the predecessor
    /// locks. Returns `None` when the key is absent, still being inserted,
    /// or already claimed by another remover.
    pub fn remove(&self, key: &K) -> Option<V> {
        let (victim, top_level) = {
            let (found, _, succs) = self.search(key);
            let level = found?;
            let victim = succs[level].clone();
            if !victim.fully_linked.load(Ordering::Acquire)
                || victim.marked.load(Ordering::Acquire)
                || victim.top_level != level
            {
                return None;
            }
            (victim, level)
        };

        let victim_guard = victim.guard.lock();
        if victim.marked.load(Ordering::Acquire) {
            // Another remover claimed it between the search and the lock.
            return None;
        }
        victim.marked.store(true, Ordering::Release);

        loop {
            let (_, preds, _) = self.search(key);

            let locked = distinct_bottom_up(&preds[..=top_level]);
            let guards: Vec<_> = locked.iter().map(|p| p.guard.lock()).collect();

            let valid = (0..=top_level).all(|level| {
                let pred = &preds[level];
                !pred.marked.load(Ordering::Acquire)
                    && pred.next[level]
                        .read()
                        .as_ref()
                        .is_some_and(|n| Arc::ptr_eq(n, &victim))
            });
            if !valid {
                trace!("remove: predecessors moved under us, retrying unlink");
                drop(guards);
                continue;
            }

            for level in (0..=top_level).rev() {
                let after = victim.next[level].read().clone();
                *preds[level].next[level].write() = after;
            }
            drop(guards);
            drop(victim_guard);
            self.ops.fetch_add(1, Ordering::SeqCst);
            return Some(victim.value().read().clone());
        }
    }

    /// Collect every `(key, value)` with `start <= key <= end`, in ascending
    /// key order, as of a single instant.
    ///
    /// A pass walks the bottom layer and is kept only if the operation
    /// counter did not move while it ran; otherwise the walk restarts. The
    /// token is consulted between passes, so a query under sustained write
    /// pressure fails with [`QueryCancelled`] instead of looping forever.
    pub fn query(
        &self,
        cancel: &CancellationToken,
        start: &K,
        end: &K,
    ) -> Result<Vec<(K, V)>, QueryCancelled> {
        loop {
            let before = self.ops.load(Ordering::SeqCst);
            let pass = self.scan(start, end);
            if self.ops.load(Ordering::SeqCst) == before {
                return Ok(pass);
            }
            if cancel.is_cancelled() {
                return Err(QueryCancelled);
            }
            std::thread::yield_now();
        }
    }

    /// One bottom-layer pass over `[start, end]`, skipping entries that are
    /// not yet fully linked or are marked.
    fn scan(&self, start: &K, end: &K) -> Vec<(K, V)> {
        let mut results = Vec::new();
        let mut current = self.head.forward(0);
        loop {
            match &current.key {
                Key::Max => break,
                Key::Entry(k) => {
                    if *k > *end {
                        break;
                    }
                    if *k >= *start
                        && current.fully_linked.load(Ordering::Acquire)
                        && !current.marked.load(Ordering::Acquire)
                    {
                        results.push((k.clone(), current.value().read().clone()));
                    }
                    current = current.forward(0);
                }
                Key::Min => current = current.forward(0),
            }
        }
        results
    }

    /// Top-down traversal recording the predecessor and successor at every
    /// layer. Returns the highest layer at which `key` itself was seen.
    fn search(&self, key: &K) -> SearchResult<K, V> {
        let mut found = None;
        let mut preds = vec![self.head.clone(); self.max_level];
        let mut succs = preds.clone();

        let mut pred = self.head.clone();
        for level in (0..self.max_level).rev() {
            let mut current = pred.forward(level);
            while current.key.is_below(key) {
                pred = current;
                current = pred.forward(level);
            }
            if found.is_none() && current.key.matches(key) {
                found = Some(level);
            }
            preds[level] = pred.clone();
            succs[level] = current;
        }

        (found, preds, succs)
    }

    fn random_level(&self) -> usize {
        let mut level = 0;
        let mut rng = rand::thread_rng();
        while level < self.head.top_level && rng.gen_bool(0.5) {
            level += 1;
        }
        level
    }
}

type SearchResult<K, V> = (Option<usize>, Vec<Arc<Node<K, V>>>, Vec<Arc<Node<K, V>>>);

/// Distinct predecessors in bottom-layer-first (descending key) order.
///
/// Predecessor keys never increase with the layer, so duplicates across
/// layers are adjacent and a single pointer comparison deduplicates them.
fn distinct_bottom_up<K, V>(preds: &[Arc<Node<K, V>>]) -> Vec<Arc<Node<K, V>>> {
    let mut out: Vec<Arc<Node<K, V>>> = Vec::with_capacity(preds.len());
    for pred in preds {
        if !out.last().is_some_and(|p| Arc::ptr_eq(p, pred)) {
            out.push(pred.clone());
        }
    }
    out
}

impl<K: Ord + Clone, V: Clone> Default for IndexedMap<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEVEL)
    }
}

impl<K, V> Drop for IndexedMap<K, V> {
    fn drop(&mut self) {
        // Sever every forward link first so the chain of Arcs drops
        // iteratively instead of recursing node-by-node.
        let mut nodes = Vec::new();
        let mut current = self.head.next[0].read().clone();
        while let Some(node) = current {
            current = match node.next.first() {
                Some(link) => link.read().clone(),
                None => None,
            };
            nodes.push(node);
        }
        for node in &nodes {
            for link in &node.next {
                *link.write() = None;
            }
        }
        for link in &self.head.next {
            *link.write() = None;
        }
    }
}
