use stash_cache::StampedeBarrier;
use std::cell::Cell;
use std::time::Duration;

#[test]
fn computed_once_while_fresh() {
    let tmp = tempfile::tempdir().unwrap();
    let mut barrier = StampedeBarrier::open(tmp.path().join("cache"), 60.0).unwrap();

    let calls = Cell::new(0u32);
    let compute = || {
        calls.set(calls.get() + 1);
        "expensive".to_string()
    };

    // A cheap computation far from expiry is effectively never refreshed.
    assert_eq!(barrier.call("report", compute).unwrap(), "expensive");
    assert_eq!(barrier.call("report", compute).unwrap(), "expensive");
    assert_eq!(calls.get(), 1);
}

#[test]
fn recomputes_after_expiry() {
    let tmp = tempfile::tempdir().unwrap();
    let mut barrier = StampedeBarrier::open(tmp.path().join("cache"), 0.05).unwrap();

    let calls = Cell::new(0u32);
    let compute = || {
        calls.set(calls.get() + 1);
        7u64
    };

    assert_eq!(barrier.call("value", compute).unwrap(), 7);
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(barrier.call("value", compute).unwrap(), 7);
    assert_eq!(calls.get(), 2);
}

#[test]
fn keys_are_cached_independently() {
    let tmp = tempfile::tempdir().unwrap();
    let mut barrier = StampedeBarrier::open(tmp.path().join("cache"), 60.0).unwrap();

    let calls = Cell::new(0u32);

    let first = barrier
        .call("first", || {
            calls.set(calls.get() + 1);
            vec![1u32, 2]
        })
        .unwrap();
    let second = barrier
        .call("second", || {
            calls.set(calls.get() + 1);
            vec![3u32]
        })
        .unwrap();

    assert_eq!(first, vec![1, 2]);
    assert_eq!(second, vec![3]);
    assert_eq!(calls.get(), 2);
}

#[test]
fn structured_results_round_trip() {
    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct UserInfo {
        id: u64,
        name: String,
    }

    let tmp = tempfile::tempdir().unwrap();
    let mut barrier = StampedeBarrier::open(tmp.path().join("cache"), 60.0).unwrap();

    let load = || UserInfo {
        id: 17,
        name: "ada".to_string(),
    };

    assert_eq!(barrier.call(17i64, load).unwrap(), load());
    assert_eq!(barrier.call(17i64, load).unwrap(), load());
}
