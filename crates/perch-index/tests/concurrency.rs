//! Multi-threaded races over a shared map.

use perch_index::{IndexedMap, QueryCancelled, UpsertOutcome};
use std::convert::Infallible;
use std::sync::Arc;
use std::thread;
use tokio_util::sync::CancellationToken;

const WRITERS: usize = 100;

#[test]
fn distinct_keys_all_land() {
    let map: Arc<IndexedMap<String, usize>> = Arc::new(IndexedMap::default());

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let map = map.clone();
            thread::spawn(move || {
                let key = format!("key-{i:03}");
                map.upsert(key, |_, _| Ok::<_, Infallible>(i)).unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), UpsertOutcome::Inserted);
    }

    for i in 0..WRITERS {
        assert_eq!(map.find(&format!("key-{i:03}")), Some(i));
    }

    let cancel = CancellationToken::new();
    let all = map
        .query(
            &cancel,
            &perch_index::STRING_MIN.to_string(),
            &perch_index::STRING_MAX.to_string(),
        )
        .unwrap();
    assert_eq!(all.len(), WRITERS);
    let keys: Vec<&String> = all.iter().map(|(k, _)| k).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
}

#[test]
fn same_key_fail_if_exists_has_one_winner() {
    let map: Arc<IndexedMap<String, usize>> = Arc::new(IndexedMap::default());

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let map = map.clone();
            thread::spawn(move || map.upsert("shared".to_string(), |_, current| match current {
                Some(_) => Err(()),
                None => Ok(i),
            }))
        })
        .collect();

    let mut inserted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(UpsertOutcome::Inserted) => inserted += 1,
            Ok(UpsertOutcome::Updated) => panic!("fail-if-exists check must never update"),
            Err(()) => rejected += 1,
        }
    }
    assert_eq!(inserted, 1);
    assert_eq!(rejected, WRITERS - 1);
    assert!(map.find(&"shared".to_string()).is_some());
}

#[test]
fn same_key_remove_has_one_winner() {
    let map: Arc<IndexedMap<String, usize>> = Arc::new(IndexedMap::default());
    map.upsert("victim".to_string(), |_, _| Ok::<_, Infallible>(42))
        .unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let map = map.clone();
            thread::spawn(move || map.remove(&"victim".to_string()))
        })
        .collect();

    let removed: Vec<usize> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(removed, vec![42]);
    assert_eq!(map.find(&"victim".to_string()), None);
}

#[test]
fn concurrent_updates_to_one_key_all_apply() {
    let map: Arc<IndexedMap<String, u64>> = Arc::new(IndexedMap::default());
    map.upsert("counter".to_string(), |_, _| Ok::<_, Infallible>(0))
        .unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let map = map.clone();
            thread::spawn(move || {
                map.upsert("counter".to_string(), |_, current| {
                    Ok::<_, Infallible>(current.copied().unwrap_or(0) + 1)
                })
                .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.find(&"counter".to_string()), Some(WRITERS as u64));
}

#[test]
fn queries_stay_stable_under_writes() {
    let map: Arc<IndexedMap<String, usize>> = Arc::new(IndexedMap::default());
    for i in 0..50 {
        map.upsert(format!("stable-{i:02}"), |_, _| Ok::<_, Infallible>(i))
            .unwrap();
    }

    let writer = {
        let map = map.clone();
        thread::spawn(move || {
            for round in 0..200 {
                let key = format!("churn-{:02}", round % 10);
                map.upsert(key.clone(), |_, _| Ok::<_, Infallible>(round))
                    .unwrap();
                map.remove(&key);
            }
        })
    };

    let cancel = CancellationToken::new();
    for _ in 0..50 {
        let got = map
            .query(&cancel, &"stable-00".to_string(), &"stable-49".to_string())
            .unwrap();
        // Churn happens outside this interval, so every snapshot is the
        // same 50 entries.
        assert_eq!(got.len(), 50);
    }
    writer.join().unwrap();
}

#[test]
fn cancelled_query_reports_cancellation() {
    let map: Arc<IndexedMap<String, u64>> = Arc::new(IndexedMap::default());
    for i in 0..1000 {
        map.upsert(format!("k{i:04}"), |_, _| Ok::<_, Infallible>(0))
            .unwrap();
    }

    let cancel = CancellationToken::new();
    cancel.cancel();

    // Keep the counter moving so passes cannot stabilize; a cancelled token
    // then has to surface as an error on the first unstable pass.
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let writer = {
        let map = map.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut n = 0u64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                n += 1;
                map.upsert("k0500".to_string(), move |_, _| Ok::<_, Infallible>(n))
                    .unwrap();
            }
        })
    };

    let mut saw_cancel = false;
    for _ in 0..10_000 {
        match map.query(&cancel, &"k0000".to_string(), &"k9999".to_string()) {
            Err(QueryCancelled) => {
                saw_cancel = true;
                break;
            }
            Ok(_) => continue,
        }
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    writer.join().unwrap();
    assert!(saw_cancel, "query should observe cancellation under churn");
}
