use stash_cache::{Cache, CacheValue};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;

fn val_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "val") {
                files.push(path);
            }
        }
    }
    files
}

#[test]
fn racing_writers_leave_no_orphan_files() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("cache");
    Cache::open(&dir).unwrap().close().unwrap();

    let writers = 4usize;
    let rounds = 20usize;
    let payload_len = 2048usize;
    let barrier = Arc::new(Barrier::new(writers));

    let mut handles = Vec::with_capacity(writers);
    for writer in 0..writers {
        let dir = dir.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let mut cache = Cache::open(&dir).unwrap();
            for round in 0..rounds {
                // Release all writers into the same-key write together so
                // that version races actually happen.
                barrier.wait();
                let payload = vec![writer as u8; payload_len + round];
                cache.set("contested", payload).unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    let mut cache = Cache::open(&dir).unwrap();

    // One committed row; the value is a full payload from the final round,
    // whichever writer won it.
    assert_eq!(cache.len().unwrap(), 1);
    let final_len = payload_len + rounds - 1;
    match cache.get("contested").unwrap().expect("winning value readable") {
        CacheValue::Bytes(bytes) => {
            assert_eq!(bytes.len(), final_len);
            assert!(bytes.iter().all(|&byte| byte == bytes[0]));
        }
        other => panic!("unexpected value kind: {other:?}"),
    }

    // Every loser removed the file it staged: exactly the winner's file
    // survives, and the size accounting matches it.
    let files = val_files(cache.directory());
    assert_eq!(files.len(), 1, "orphan value files left behind: {files:?}");
    assert_eq!(
        std::fs::metadata(&files[0]).unwrap().len(),
        final_len as u64
    );
    assert_eq!(cache.size().unwrap(), final_len as i64);

    let report = cache.check(false).unwrap();
    assert!(report.is_clean(), "unexpected findings: {report:?}");
}

#[test]
fn racing_writers_on_distinct_keys_all_commit() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("cache");
    Cache::open(&dir).unwrap().close().unwrap();

    let writers = 8usize;
    let barrier = Arc::new(Barrier::new(writers));

    let mut handles = Vec::with_capacity(writers);
    for writer in 0..writers {
        let dir = dir.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let mut cache = Cache::open(&dir).unwrap();
            barrier.wait();
            let key = format!("writer{writer}");
            cache.set(key.clone(), vec![writer as u8; 1500]).unwrap();
            key
        }));
    }

    let mut keys = Vec::with_capacity(writers);
    for handle in handles {
        keys.push(handle.join().unwrap());
    }

    let cache = Cache::open(&dir).unwrap();
    assert_eq!(cache.len().unwrap(), writers as u64);
    for (writer, key) in keys.iter().enumerate() {
        assert_eq!(
            cache.get(key.as_str()).unwrap(),
            Some(CacheValue::Bytes(vec![writer as u8; 1500]))
        );
    }
    assert_eq!(val_files(cache.directory()).len(), writers);
}
