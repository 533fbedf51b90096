use rusqlite::types::Value as SqlValue;
use rusqlite::{params, OptionalExtension};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::codec::{self, CacheKey, CacheValue, Fetched};
use crate::error::{CacheError, Result};
use crate::file_store::FileStore;
use crate::policy::EvictionPolicy;
use crate::store::{CacheConfig, Store};
use crate::util::now_seconds;

/// Per-entry options for a write.
#[derive(Clone, Debug, Default)]
pub struct SetOptions {
    /// Seconds until the entry expires. `None` means no expiry.
    pub expire: Option<f64>,
    /// Opaque tag associated with the entry, for bulk eviction.
    pub tag: Option<Vec<u8>>,
}

/// A successful read: the payload plus the entry's expiry and tag.
#[derive(Debug)]
pub struct Entry {
    pub value: Fetched,
    pub expire_time: Option<f64>,
    pub tag: Option<Vec<u8>>,
}

/// Persistent, process-safe disk cache.
///
/// Metadata lives in an embedded SQLite database at the cache directory
/// root; values above the large-value threshold are spilled to files under
/// a two-level hex-prefix tree. One instance is intended for use by a
/// single thread; any number of instances in the same or different
/// processes may share one cache directory. Serialization across writers
/// comes entirely from the database's write lock plus per-row version
/// tokens, so a lost write race is detected, reversed, and not an error.
pub struct Cache {
    directory: PathBuf,
    store: Store,
    files: FileStore,
}

impl Cache {
    /// Open the cache at `directory` with default settings.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(directory, CacheConfig::default())
    }

    /// Open the cache at `directory`, creating it if needed.
    ///
    /// Settings persisted by a previous open are honored; fields set in
    /// `config` override them and are persisted in turn.
    pub fn open_with(directory: impl AsRef<Path>, config: CacheConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.is_dir() {
            create_cache_dir(&directory).map_err(|source| CacheError::Directory {
                path: directory.clone(),
                source,
            })?;
        }

        let store = Store::open(&directory, &config)?;
        let files = FileStore::new(&directory);

        Ok(Self {
            directory,
            store,
            files,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Store a key/value pair.
    pub fn set(&mut self, key: impl Into<CacheKey>, value: impl Into<CacheValue>) -> Result<()> {
        self.set_with(key, value, SetOptions::default())
    }

    /// Store a key/value pair with expiry and tag options.
    pub fn set_with(
        &mut self,
        key: impl Into<CacheKey>,
        value: impl Into<CacheValue>,
        options: SetOptions,
    ) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let (db_key, raw) = key.encode();

        let (version, old_filename) = self.claim_row(&db_key, raw)?;
        if let Some(filename) = old_filename {
            // The old payload is orphan-eligible as soon as we intend to
            // overwrite; losing the race below leaves no reference to it.
            self.files.remove(&filename)?;
        }

        let threshold = self.store.settings().large_value_threshold as usize;
        let staged = codec::store(&value, threshold, &self.files)?;
        self.commit_row(&db_key, raw, version, staged, &options)
    }

    /// Store a streaming byte source, consumed in bounded chunks.
    ///
    /// The value is always file-backed and reads back as bytes.
    pub fn set_reader(
        &mut self,
        key: impl Into<CacheKey>,
        mut reader: impl Read,
        options: SetOptions,
    ) -> Result<()> {
        let key = key.into();
        let (db_key, raw) = key.encode();

        let (version, old_filename) = self.claim_row(&db_key, raw)?;
        if let Some(filename) = old_filename {
            self.files.remove(&filename)?;
        }

        let staged = codec::store_reader(&mut reader, &self.files)?;
        self.commit_row(&db_key, raw, version, staged, &options)
    }

    /// Get the value stored under `key`, or `None` on a miss.
    ///
    /// Expired entries, reservations from in-flight writes, and entries
    /// whose backing file has been removed all read as misses.
    pub fn get(&self, key: impl Into<CacheKey>) -> Result<Option<CacheValue>> {
        match self.lookup(&key.into(), false)? {
            Some(entry) => Ok(Some(entry.value.into_value()?)),
            None => Ok(None),
        }
    }

    /// Get the full entry under `key`: payload, expiry, and tag.
    ///
    /// With `read` set, file-backed binary values are returned as an open
    /// stream instead of being materialized.
    pub fn get_entry(&self, key: impl Into<CacheKey>, read: bool) -> Result<Option<Entry>> {
        self.lookup(&key.into(), read)
    }

    /// Get the value stored under `key`, failing on a miss.
    pub fn fetch(&self, key: impl Into<CacheKey>) -> Result<CacheValue> {
        self.get(key)?.ok_or(CacheError::KeyNotFound)
    }

    /// Delete `key`. Missing keys are ignored.
    pub fn delete(&mut self, key: impl Into<CacheKey>) -> Result<()> {
        match self.remove(key) {
            Err(CacheError::KeyNotFound) => Ok(()),
            other => other,
        }
    }

    /// Delete `key`, failing if it is absent.
    pub fn remove(&mut self, key: impl Into<CacheKey>) -> Result<()> {
        let (db_key, raw) = key.into().encode();

        let row = self
            .store
            .conn()
            .query_row(
                "SELECT rowid, version, filename FROM Cache WHERE key = ?1 AND raw = ?2",
                params![db_key, raw],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Err(CacheError::KeyNotFound),
            Some((rowid, version, filename)) => {
                self.delete_row(rowid, version, filename.as_deref())?;
                Ok(())
            }
        }
    }

    /// Remove all expired entries.
    pub fn expire(&mut self) -> Result<()> {
        let now = now_seconds();
        let chunk = self.store.settings().cull_limit;
        let mut lower = 0.0f64;

        loop {
            let rows = {
                let mut stmt = self.store.conn().prepare(
                    "SELECT rowid, version, expire_time, filename FROM Cache \
                     WHERE ?1 < expire_time AND expire_time < ?2 \
                     ORDER BY expire_time LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![lower, now, chunk], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            if rows.is_empty() {
                return Ok(());
            }

            for (rowid, version, expire_time, filename) in rows {
                // Advancing the lower bound keeps the cursor from restarting
                // under concurrent inserts.
                lower = expire_time;
                self.delete_row(rowid, version, filename.as_deref())?;
            }
        }
    }

    /// Remove all entries carrying `tag`.
    pub fn evict(&mut self, tag: impl Into<Vec<u8>>) -> Result<()> {
        let tag = tag.into();
        self.store.conn().execute(
            "CREATE INDEX IF NOT EXISTS Cache_tag_rowid ON Cache(tag, rowid)",
            [],
        )?;
        self.scan_delete(Some(tag.as_slice()))
    }

    /// Remove all entries.
    pub fn clear(&mut self) -> Result<()> {
        self.scan_delete(None)
    }

    /// Return `(hits, misses)`, optionally resetting the counters, and set
    /// whether statistics are collected going forward.
    pub fn stats(&mut self, enable: bool, reset: bool) -> Result<(i64, i64)> {
        let hits = self.store.read_counter("hits")?;
        let misses = self.store.read_counter("misses")?;

        if reset {
            self.store.put_counter("hits", 0)?;
            self.store.put_counter("misses", 0)?;
        }

        self.store.set_statistics(enable)?;
        Ok((hits, misses))
    }

    /// Number of entries, as maintained by the store's triggers.
    pub fn len(&self) -> Result<u64> {
        Ok(self.store.read_counter("count")?.max(0) as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Total payload bytes recorded across all entries (the `size` counter).
    pub fn size(&self) -> Result<i64> {
        self.store.read_counter("size")
    }

    pub fn statistics(&self) -> bool {
        self.store.settings().statistics
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.store.settings().eviction_policy
    }

    pub fn size_limit(&self) -> i64 {
        self.store.settings().size_limit
    }

    pub fn cull_limit(&self) -> i64 {
        self.store.settings().cull_limit
    }

    pub fn large_value_threshold(&self) -> i64 {
        self.store.settings().large_value_threshold
    }

    pub fn set_statistics(&mut self, enable: bool) -> Result<()> {
        self.store.set_statistics(enable)
    }

    pub fn set_eviction_policy(&mut self, policy: EvictionPolicy) -> Result<()> {
        self.store.set_eviction_policy(policy)
    }

    pub fn set_size_limit(&mut self, size_limit: i64) -> Result<()> {
        self.store.set_size_limit(size_limit)
    }

    pub fn set_cull_limit(&mut self, cull_limit: i64) -> Result<()> {
        self.store.set_cull_limit(cull_limit)
    }

    pub fn set_large_value_threshold(&mut self, threshold: i64) -> Result<()> {
        self.store.set_large_value_threshold(threshold)
    }

    /// Close the underlying database connection.
    pub fn close(self) -> Result<()> {
        self.store.close()
    }

    /// Find the current version for `(key, raw)`, inserting a reservation
    /// row if the key is new. Returns the observed version and filename.
    fn claim_row(&self, db_key: &SqlValue, raw: bool) -> Result<(i64, Option<String>)> {
        let row = self
            .store
            .conn()
            .query_row(
                "SELECT version, filename FROM Cache WHERE key = ?1 AND raw = ?2",
                params![db_key, raw],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;

        match row {
            Some(found) => Ok(found),
            None => {
                self.store.conn().execute(
                    "INSERT OR IGNORE INTO Cache(key, raw) VALUES (?1, ?2)",
                    params![db_key, raw],
                )?;
                Ok((0, None))
            }
        }
    }

    /// Attempt the versioned update that commits a staged value, then run
    /// the cull pipeline. Losing the version race is not an error: the
    /// staged file (if any) is removed and the write is dropped.
    fn commit_row(
        &mut self,
        db_key: &SqlValue,
        raw: bool,
        version: i64,
        staged: codec::StoredValue,
        options: &SetOptions,
    ) -> Result<()> {
        let now = now_seconds();
        let expire_time = options.expire.map(|expire| now + expire);

        let changed = self.store.conn().execute(
            "UPDATE Cache SET \
             version = ?1, store_time = ?2, expire_time = ?3, access_time = ?4, \
             access_count = ?5, tag = ?6, size = ?7, mode = ?8, filename = ?9, value = ?10 \
             WHERE key = ?11 AND raw = ?12 AND version = ?13",
            params![
                version + 1,
                now,
                expire_time,
                now,
                0i64,
                options.tag,
                staged.size,
                staged.mode,
                staged.filename,
                staged.value,
                db_key,
                raw,
                version,
            ],
        )?;

        if changed == 0 {
            // Another cache committed this key first. Drop our write.
            tracing::debug!(
                target = "stash.cache",
                "lost write race; removing staged value"
            );
            if let Some(filename) = &staged.filename {
                self.files.remove(filename)?;
            }
            return Ok(());
        }

        self.cull(now, db_key, raw)
    }

    /// One bounded round of deletions after a committed write: expired rows
    /// first, then rows in policy order while the cache is over its size
    /// limit. At most `cull_limit` rows are deleted per pass.
    fn cull(&mut self, now: f64, db_key: &SqlValue, raw: bool) -> Result<()> {
        let mut quota = self.store.settings().cull_limit;

        let expired = {
            let mut stmt = self.store.conn().prepare(
                "SELECT rowid, version, filename FROM Cache \
                 WHERE expire_time IS NOT NULL AND expire_time < ?1 \
                 ORDER BY expire_time LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now, quota], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for (rowid, version, filename) in expired {
            if self.delete_row(rowid, version, filename.as_deref())? {
                quota -= 1;
            }
        }

        if quota == 0 {
            return Ok(());
        }

        // Total footprint: database pages plus recorded payload bytes.
        let page_count: i64 = self
            .store
            .conn()
            .query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let size = self.store.read_counter("size")?;
        let total = self.store.page_size() * page_count + size;

        if total < self.store.settings().size_limit {
            return Ok(());
        }

        let victims = {
            let mut stmt = self
                .store
                .conn()
                .prepare(self.store.settings().eviction_policy.evict_scan_sql())?;
            let rows = stmt.query_map(params![db_key, raw, quota], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for (rowid, version, filename) in victims {
            self.delete_row(rowid, version, filename.as_deref())?;
        }

        Ok(())
    }

    fn lookup(&self, key: &CacheKey, read: bool) -> Result<Option<Entry>> {
        let (db_key, raw) = key.encode();

        let row = self
            .store
            .conn()
            .query_row(
                "SELECT rowid, store_time, expire_time, tag, mode, filename, value \
                 FROM Cache WHERE key = ?1 AND raw = ?2",
                params![db_key, raw],
                |row| {
                    Ok(CacheRow {
                        rowid: row.get(0)?,
                        store_time: row.get(1)?,
                        expire_time: row.get(2)?,
                        tag: row.get(3)?,
                        mode: row.get(4)?,
                        filename: row.get(5)?,
                        value: row.get(6)?,
                    })
                },
            )
            .optional()?;

        let Some(row) = row else {
            return self.miss();
        };

        // A reservation row belongs to a write that has not committed.
        if row.store_time.is_none() {
            return self.miss();
        }

        let now = now_seconds();
        if let Some(expire_time) = row.expire_time {
            if expire_time < now {
                return self.miss();
            }
        }

        let fetched = match codec::fetch(
            row.rowid,
            row.mode,
            row.filename.as_deref(),
            row.value,
            read,
            &self.files,
        ) {
            Ok(fetched) => fetched,
            // The entry was deleted out from under us after the row lookup.
            Err(err) if err.is_missing_file() => return self.miss(),
            Err(err) => return Err(err),
        };

        if self.store.settings().statistics {
            self.store.bump_counter("hits")?;
        }

        self.store
            .settings()
            .eviction_policy
            .touch(self.store.conn(), row.rowid, now)?;

        Ok(Some(Entry {
            value: fetched,
            expire_time: row.expire_time,
            tag: row.tag,
        }))
    }

    fn miss(&self) -> Result<Option<Entry>> {
        if self.store.settings().statistics {
            self.store.bump_counter("misses")?;
        }
        Ok(None)
    }

    /// Chunked rowid-cursor deletion, optionally filtered by tag.
    fn scan_delete(&mut self, tag: Option<&[u8]>) -> Result<()> {
        let chunk = self.store.settings().cull_limit;
        let mut cursor = 0i64;

        loop {
            let rows = {
                let (sql, bind_tag) = match tag {
                    Some(_) => (
                        "SELECT rowid, version, filename FROM Cache \
                         WHERE tag = ?1 AND rowid > ?2 ORDER BY rowid LIMIT ?3",
                        true,
                    ),
                    None => (
                        "SELECT rowid, version, filename FROM Cache \
                         WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
                        false,
                    ),
                };
                let mut stmt = self.store.conn().prepare(sql)?;
                let map = |row: &rusqlite::Row<'_>| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                };
                let rows = if bind_tag {
                    stmt.query_map(params![tag, cursor, chunk], map)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                } else {
                    stmt.query_map(params![cursor, chunk], map)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                };
                rows
            };

            if rows.is_empty() {
                return Ok(());
            }

            for (rowid, version, filename) in rows {
                cursor = rowid;
                self.delete_row(rowid, version, filename.as_deref())?;
            }
        }
    }

    /// Delete one row, gated by its version so concurrent writers never
    /// observe a half-delete. Unlinking the backing file follows the row.
    pub(crate) fn delete_row(
        &self,
        rowid: i64,
        version: i64,
        filename: Option<&str>,
    ) -> Result<bool> {
        let deleted = self.store.conn().execute(
            "DELETE FROM Cache WHERE rowid = ?1 AND version = ?2",
            params![rowid, version],
        )? == 1;

        if deleted {
            if let Some(filename) = filename {
                self.files.remove(filename)?;
            }
        }

        Ok(deleted)
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn files(&self) -> &FileStore {
        &self.files
    }
}

struct CacheRow {
    rowid: i64,
    store_time: Option<f64>,
    expire_time: Option<f64>,
    tag: Option<Vec<u8>>,
    mode: i64,
    filename: Option<String>,
    value: SqlValue,
}

#[cfg(unix)]
fn create_cache_dir(directory: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(directory)
}

#[cfg(not(unix))]
fn create_cache_dir(directory: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(directory)
}
