use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::policy::EvictionPolicy;

pub(crate) const DATABASE_NAME: &str = "cache.sqlite3";

/// Bound on waiting for the store's write lock, and on PRAGMA retries.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(60);
const PRAGMA_RETRY_PAUSE: Duration = Duration::from_millis(1);

const DEFAULT_SIZE_LIMIT: i64 = 1 << 30;
const DEFAULT_CULL_LIMIT: i64 = 10;
const DEFAULT_LARGE_VALUE_THRESHOLD: i64 = 1 << 10;
const MIN_LARGE_VALUE_THRESHOLD: i64 = 8;
const DEFAULT_SQLITE_CACHE_SIZE: i64 = 1 << 13;
const DEFAULT_SQLITE_MMAP_SIZE: i64 = 1 << 27;

const SCHEMA_DDL: &str = "\
CREATE TABLE IF NOT EXISTS Cache (
  rowid INTEGER PRIMARY KEY,
  key BLOB,
  raw INTEGER,
  version INTEGER DEFAULT 0,
  store_time REAL,
  expire_time REAL,
  access_time REAL,
  access_count INTEGER DEFAULT 0,
  tag BLOB,
  size INTEGER DEFAULT 0,
  mode INTEGER DEFAULT 0,
  filename TEXT,
  value BLOB
);
CREATE UNIQUE INDEX IF NOT EXISTS Cache_key_raw ON Cache(key, raw);
CREATE INDEX IF NOT EXISTS Cache_expire_time ON Cache (expire_time);
CREATE TRIGGER IF NOT EXISTS Settings_count_insert AFTER INSERT ON Cache FOR EACH ROW BEGIN
  UPDATE Settings SET value = value + 1 WHERE key = 'count';
END;
CREATE TRIGGER IF NOT EXISTS Settings_count_delete AFTER DELETE ON Cache FOR EACH ROW BEGIN
  UPDATE Settings SET value = value - 1 WHERE key = 'count';
END;
CREATE TRIGGER IF NOT EXISTS Settings_size_insert AFTER INSERT ON Cache FOR EACH ROW BEGIN
  UPDATE Settings SET value = value + NEW.size WHERE key = 'size';
END;
CREATE TRIGGER IF NOT EXISTS Settings_size_update AFTER UPDATE ON Cache FOR EACH ROW BEGIN
  UPDATE Settings SET value = value + NEW.size - OLD.size WHERE key = 'size';
END;
CREATE TRIGGER IF NOT EXISTS Settings_size_delete AFTER DELETE ON Cache FOR EACH ROW BEGIN
  UPDATE Settings SET value = value - OLD.size WHERE key = 'size';
END;
";

/// A settings-table value.
#[derive(Clone, Debug, PartialEq)]
pub enum SettingValue {
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SettingValue {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) => Some(*v as i64),
            Self::Text(v) => v.parse().ok(),
            Self::Blob(_) => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Rendering used on the right-hand side of a PRAGMA assignment.
    fn pragma_literal(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Text(v) => v.clone(),
            Self::Blob(_) => String::new(),
        }
    }

    fn from_sql(value: SqlValue) -> Option<Self> {
        match value {
            SqlValue::Integer(v) => Some(Self::Int(v)),
            SqlValue::Real(v) => Some(Self::Float(v)),
            SqlValue::Text(v) => Some(Self::Text(v)),
            SqlValue::Blob(v) => Some(Self::Blob(v)),
            SqlValue::Null => None,
        }
    }
}

impl ToSql for SettingValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Self::Int(v) => v.to_sql(),
            Self::Float(v) => v.to_sql(),
            Self::Text(v) => v.to_sql(),
            Self::Blob(v) => v.to_sql(),
        }
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Settings supplied when opening a cache.
///
/// `None` fields fall back to the value persisted in the cache (or the
/// default for a fresh cache). Entries in `extra` are persisted verbatim;
/// unknown keys have no effect on behavior.
#[derive(Clone, Debug, Default)]
pub struct CacheConfig {
    pub statistics: Option<bool>,
    pub eviction_policy: Option<EvictionPolicy>,
    pub size_limit: Option<i64>,
    pub cull_limit: Option<i64>,
    pub large_value_threshold: Option<i64>,
    pub sqlite_synchronous: Option<String>,
    pub sqlite_journal_mode: Option<String>,
    pub sqlite_cache_size: Option<i64>,
    pub sqlite_mmap_size: Option<i64>,
    pub extra: Vec<(String, SettingValue)>,
}

/// Typed view of the recognized settings, cached in memory.
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    pub(crate) statistics: bool,
    pub(crate) eviction_policy: EvictionPolicy,
    pub(crate) size_limit: i64,
    pub(crate) cull_limit: i64,
    pub(crate) large_value_threshold: i64,
}

impl Settings {
    fn from_merged(merged: &BTreeMap<String, SettingValue>) -> Result<Self> {
        let int = |key: &str, default: i64| -> i64 {
            merged.get(key).and_then(SettingValue::as_i64).unwrap_or(default)
        };

        let eviction_policy = match merged.get("eviction_policy") {
            Some(value) => value
                .as_str()
                .unwrap_or_default()
                .parse::<EvictionPolicy>()?,
            None => EvictionPolicy::default(),
        };

        Ok(Self {
            statistics: int("statistics", 0) != 0,
            eviction_policy,
            size_limit: int("size_limit", DEFAULT_SIZE_LIMIT),
            cull_limit: int("cull_limit", DEFAULT_CULL_LIMIT),
            large_value_threshold: int("large_value_threshold", DEFAULT_LARGE_VALUE_THRESHOLD)
                .max(MIN_LARGE_VALUE_THRESHOLD),
        })
    }
}

/// The metadata store: one autocommit SQLite connection plus the cached
/// settings and the database page size.
pub(crate) struct Store {
    conn: Connection,
    page_size: i64,
    settings: Settings,
}

impl Store {
    pub(crate) fn open(directory: &Path, config: &CacheConfig) -> Result<Self> {
        let conn = Connection::open(directory.join(DATABASE_NAME))?;
        conn.busy_timeout(OPERATION_TIMEOUT)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS Settings (key TEXT NOT NULL UNIQUE, value)",
            [],
        )?;

        // Defaults, overridden by what the cache has persisted, overridden
        // by what the caller supplied. Every merged entry is written back so
        // a fresh cache records its full configuration.
        let mut merged = default_settings();
        for (key, value) in read_all_settings(&conn)? {
            merged.insert(key, value);
        }
        apply_config(&mut merged, config);

        for (key, value) in &merged {
            write_setting(&conn, key, value)?;
        }

        let settings = Settings::from_merged(&merged)?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        conn.execute_batch(SCHEMA_DDL)?;
        conn.execute(settings.eviction_policy.init_sql(), [])?;

        Ok(Self {
            conn,
            page_size,
            settings,
        })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn page_size(&self) -> i64 {
        self.page_size
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Re-read a counter from the settings table.
    pub(crate) fn read_counter(&self, key: &str) -> Result<i64> {
        let value: i64 = self.conn.query_row(
            "SELECT value FROM Settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    /// Increment a counter. Used for hit/miss accounting.
    pub(crate) fn bump_counter(&self, key: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE Settings SET value = value + 1 WHERE key = ?1",
            params![key],
        )?;
        Ok(())
    }

    pub(crate) fn put_counter(&self, key: &str, value: i64) -> Result<()> {
        write_setting(&self.conn, key, &SettingValue::Int(value))
    }

    pub(crate) fn set_statistics(&mut self, enable: bool) -> Result<()> {
        write_setting(&self.conn, "statistics", &SettingValue::Int(enable as i64))?;
        self.settings.statistics = enable;
        Ok(())
    }

    pub(crate) fn set_eviction_policy(&mut self, policy: EvictionPolicy) -> Result<()> {
        write_setting(
            &self.conn,
            "eviction_policy",
            &SettingValue::Text(policy.name().to_string()),
        )?;
        self.conn.execute(policy.init_sql(), [])?;
        self.settings.eviction_policy = policy;
        Ok(())
    }

    pub(crate) fn set_size_limit(&mut self, size_limit: i64) -> Result<()> {
        write_setting(&self.conn, "size_limit", &SettingValue::Int(size_limit))?;
        self.settings.size_limit = size_limit;
        Ok(())
    }

    pub(crate) fn set_cull_limit(&mut self, cull_limit: i64) -> Result<()> {
        write_setting(&self.conn, "cull_limit", &SettingValue::Int(cull_limit))?;
        self.settings.cull_limit = cull_limit;
        Ok(())
    }

    pub(crate) fn set_large_value_threshold(&mut self, threshold: i64) -> Result<()> {
        let threshold = threshold.max(MIN_LARGE_VALUE_THRESHOLD);
        write_setting(
            &self.conn,
            "large_value_threshold",
            &SettingValue::Int(threshold),
        )?;
        self.settings.large_value_threshold = threshold;
        Ok(())
    }

    pub(crate) fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| err.into())
    }
}

fn default_settings() -> BTreeMap<String, SettingValue> {
    let mut defaults = BTreeMap::new();
    defaults.insert("statistics".to_string(), SettingValue::Int(0));
    defaults.insert(
        "eviction_policy".to_string(),
        SettingValue::Text(EvictionPolicy::default().name().to_string()),
    );
    defaults.insert("size_limit".to_string(), SettingValue::Int(DEFAULT_SIZE_LIMIT));
    defaults.insert("cull_limit".to_string(), SettingValue::Int(DEFAULT_CULL_LIMIT));
    defaults.insert(
        "large_value_threshold".to_string(),
        SettingValue::Int(DEFAULT_LARGE_VALUE_THRESHOLD),
    );
    defaults.insert(
        "sqlite_synchronous".to_string(),
        SettingValue::Text("NORMAL".to_string()),
    );
    defaults.insert(
        "sqlite_journal_mode".to_string(),
        SettingValue::Text("WAL".to_string()),
    );
    defaults.insert(
        "sqlite_cache_size".to_string(),
        SettingValue::Int(DEFAULT_SQLITE_CACHE_SIZE),
    );
    defaults.insert(
        "sqlite_mmap_size".to_string(),
        SettingValue::Int(DEFAULT_SQLITE_MMAP_SIZE),
    );

    // Live counters.
    defaults.insert("count".to_string(), SettingValue::Int(0));
    defaults.insert("size".to_string(), SettingValue::Int(0));
    defaults.insert("hits".to_string(), SettingValue::Int(0));
    defaults.insert("misses".to_string(), SettingValue::Int(0));

    defaults
}

fn apply_config(merged: &mut BTreeMap<String, SettingValue>, config: &CacheConfig) {
    if let Some(statistics) = config.statistics {
        merged.insert("statistics".to_string(), SettingValue::Int(statistics as i64));
    }
    if let Some(policy) = config.eviction_policy {
        merged.insert(
            "eviction_policy".to_string(),
            SettingValue::Text(policy.name().to_string()),
        );
    }
    if let Some(size_limit) = config.size_limit {
        merged.insert("size_limit".to_string(), SettingValue::Int(size_limit));
    }
    if let Some(cull_limit) = config.cull_limit {
        merged.insert("cull_limit".to_string(), SettingValue::Int(cull_limit));
    }
    if let Some(threshold) = config.large_value_threshold {
        merged.insert(
            "large_value_threshold".to_string(),
            SettingValue::Int(threshold.max(MIN_LARGE_VALUE_THRESHOLD)),
        );
    }
    if let Some(synchronous) = &config.sqlite_synchronous {
        merged.insert(
            "sqlite_synchronous".to_string(),
            SettingValue::Text(synchronous.clone()),
        );
    }
    if let Some(journal_mode) = &config.sqlite_journal_mode {
        merged.insert(
            "sqlite_journal_mode".to_string(),
            SettingValue::Text(journal_mode.clone()),
        );
    }
    if let Some(cache_size) = config.sqlite_cache_size {
        merged.insert("sqlite_cache_size".to_string(), SettingValue::Int(cache_size));
    }
    if let Some(mmap_size) = config.sqlite_mmap_size {
        merged.insert("sqlite_mmap_size".to_string(), SettingValue::Int(mmap_size));
    }
    for (key, value) in &config.extra {
        merged.insert(key.clone(), value.clone());
    }
}

fn read_all_settings(conn: &Connection) -> Result<Vec<(String, SettingValue)>> {
    let mut stmt = conn.prepare("SELECT key, value FROM Settings")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, SqlValue>(1)?))
    })?;

    let mut settings = Vec::new();
    for row in rows {
        let (key, value) = row?;
        if let Some(value) = SettingValue::from_sql(value) {
            settings.push((key, value));
        }
    }
    Ok(settings)
}

/// Persist one setting and, for store-tuning keys, issue its PRAGMA.
fn write_setting(conn: &Connection, key: &str, value: &SettingValue) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO Settings VALUES (?1, ?2)",
        params![key, value],
    )?;

    if let Some(pragma) = key.strip_prefix("sqlite_") {
        set_pragma_with_retry(conn, pragma, value)?;
    }

    Ok(())
}

/// Issue `PRAGMA <name> = <value>`, retrying while the database is busy.
///
/// Some PRAGMA statements take an exclusive lock on the database and fail
/// intermittently under concurrent writers. Retry with a short pause for up
/// to the operation timeout before surfacing the last error.
fn set_pragma_with_retry(conn: &Connection, pragma: &str, value: &SettingValue) -> Result<()> {
    let sql = format!("PRAGMA {} = {}", pragma, value.pragma_literal());
    let deadline = Instant::now() + OPERATION_TIMEOUT;

    loop {
        // Some pragmas report their new value as a row, some return nothing;
        // accept both.
        match conn.query_row(&sql, [], |_row| Ok(())).optional() {
            Ok(_) => return Ok(()),
            Err(err) if is_busy(&err) && Instant::now() < deadline => {
                tracing::debug!(
                    target = "stash.cache",
                    pragma,
                    error = %err,
                    "pragma contended; retrying"
                );
                std::thread::sleep(PRAGMA_RETRY_PAUSE);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_recognized_setting() {
        let defaults = default_settings();
        for key in [
            "statistics",
            "eviction_policy",
            "size_limit",
            "cull_limit",
            "large_value_threshold",
            "sqlite_synchronous",
            "sqlite_journal_mode",
            "sqlite_cache_size",
            "sqlite_mmap_size",
            "count",
            "size",
            "hits",
            "misses",
        ] {
            assert!(defaults.contains_key(key), "missing default for {key}");
        }
    }

    #[test]
    fn threshold_is_clamped_to_minimum() {
        let mut merged = default_settings();
        merged.insert("large_value_threshold".to_string(), SettingValue::Int(2));
        let settings = Settings::from_merged(&merged).unwrap();
        assert_eq!(settings.large_value_threshold, MIN_LARGE_VALUE_THRESHOLD);
    }

    #[test]
    fn pragma_literal_renders_bare_words_and_numbers() {
        assert_eq!(SettingValue::Text("WAL".to_string()).pragma_literal(), "WAL");
        assert_eq!(SettingValue::Int(8192).pragma_literal(), "8192");
    }
}
