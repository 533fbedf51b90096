use stash_cache::{Cache, CacheConfig, CacheValue, EvictionPolicy, SetOptions};
use std::time::Duration;

fn open_cache(dir: &std::path::Path, config: CacheConfig) -> Cache {
    Cache::open_with(dir.join("cache"), config).unwrap()
}

#[test]
fn expired_entries_read_as_misses_and_get_swept() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cache = open_cache(tmp.path(), CacheConfig::default());

    cache
        .set_with(
            "t",
            1i64,
            SetOptions {
                expire: Some(0.1),
                ..SetOptions::default()
            },
        )
        .unwrap();

    assert_eq!(cache.get("t").unwrap(), Some(CacheValue::Int(1)));

    std::thread::sleep(Duration::from_millis(250));
    assert!(cache.get("t").unwrap().is_none());
    assert_eq!(cache.len().unwrap(), 1, "expired row lingers until a sweep");

    // The next write's cull pass removes the expired row.
    cache.set("u", 2i64).unwrap();
    assert_eq!(cache.len().unwrap(), 1);
    assert!(cache.get("t").unwrap().is_none());
    assert!(cache.get("u").unwrap().is_some());
}

#[test]
fn explicit_expire_sweeps_everything_stale() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cache = open_cache(
        tmp.path(),
        CacheConfig {
            cull_limit: Some(3),
            ..CacheConfig::default()
        },
    );

    for i in 0..10i64 {
        cache
            .set_with(
                i,
                i,
                SetOptions {
                    expire: Some(0.05),
                    ..SetOptions::default()
                },
            )
            .unwrap();
    }
    cache.set("keeper", 1i64).unwrap();

    std::thread::sleep(Duration::from_millis(200));
    cache.expire().unwrap();

    assert_eq!(cache.len().unwrap(), 1);
    assert!(cache.get("keeper").unwrap().is_some());
}

#[test]
fn least_recently_stored_keeps_the_newest_key() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cache = open_cache(
        tmp.path(),
        CacheConfig {
            size_limit: Some(100),
            large_value_threshold: Some(8),
            eviction_policy: Some(EvictionPolicy::LeastRecentlyStored),
            ..CacheConfig::default()
        },
    );

    for i in 0..20i64 {
        let key = format!("k{i}");
        cache.set(key, vec![b'v'; 10]).unwrap();
    }

    assert!(cache.get("k19").unwrap().is_some());
    assert!(cache.get("k0").unwrap().is_none());
    assert!(cache.get("k10").unwrap().is_none());
    assert!(cache.get("k18").unwrap().is_none());
}

#[test]
fn least_recently_used_evicts_the_coldest_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cache = open_cache(
        tmp.path(),
        CacheConfig {
            eviction_policy: Some(EvictionPolicy::LeastRecentlyUsed),
            large_value_threshold: Some(8),
            ..CacheConfig::default()
        },
    );

    cache.set("a", vec![b'a'; 16]).unwrap();
    cache.set("b", vec![b'b'; 16]).unwrap();

    // Reading refreshes a's access time, leaving b the eviction candidate.
    std::thread::sleep(Duration::from_millis(5));
    assert!(cache.get("a").unwrap().is_some());

    cache.set_cull_limit(1).unwrap();
    cache.set_size_limit(100).unwrap();
    cache.set("c", vec![b'c'; 16]).unwrap();

    assert!(cache.get("a").unwrap().is_some());
    assert!(cache.get("b").unwrap().is_none());
    assert!(cache.get("c").unwrap().is_some());
}

#[test]
fn least_frequently_used_evicts_cold_entries_first() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cache = open_cache(
        tmp.path(),
        CacheConfig {
            eviction_policy: Some(EvictionPolicy::LeastFrequentlyUsed),
            large_value_threshold: Some(8),
            ..CacheConfig::default()
        },
    );

    cache.set("a", vec![b'a'; 16]).unwrap();
    cache.set("b", vec![b'b'; 16]).unwrap();
    cache.set("c", vec![b'c'; 16]).unwrap();

    for _ in 0..3 {
        assert!(cache.get("a").unwrap().is_some());
    }
    assert!(cache.get("b").unwrap().is_some());

    // Pressure evicts by ascending access count: c (0 reads), then b (1).
    cache.set_cull_limit(2).unwrap();
    cache.set_size_limit(100).unwrap();
    cache.set("d", vec![b'd'; 16]).unwrap();

    assert!(cache.get("a").unwrap().is_some());
    assert!(cache.get("b").unwrap().is_none());
    assert!(cache.get("c").unwrap().is_none());
    assert!(cache.get("d").unwrap().is_some());
}

#[test]
fn cull_deletes_at_most_cull_limit_rows_per_write() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cache = open_cache(
        tmp.path(),
        CacheConfig {
            large_value_threshold: Some(8),
            cull_limit: Some(2),
            ..CacheConfig::default()
        },
    );

    for i in 0..10i64 {
        cache.set(i, vec![b'v'; 16]).unwrap();
    }
    assert_eq!(cache.len().unwrap(), 10);

    // Each subsequent write may remove at most two rows.
    cache.set_size_limit(100).unwrap();
    cache.set("pressure", vec![b'p'; 16]).unwrap();
    assert_eq!(cache.len().unwrap(), 9);
}
