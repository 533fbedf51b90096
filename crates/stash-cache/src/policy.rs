use rusqlite::{params, Connection};
use std::fmt;
use std::str::FromStr;

use crate::error::CacheError;

/// Row-eviction ordering applied when the cache exceeds its size limit.
///
/// Each policy pairs an ordering key for the eviction scan with an optional
/// side effect applied to rows on successful reads. The supporting index is
/// created once when the cache opens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict rows with the oldest `store_time` first. Reads leave rows
    /// untouched.
    #[default]
    LeastRecentlyStored,
    /// Evict rows with the oldest `access_time` first. Reads refresh
    /// `access_time`.
    LeastRecentlyUsed,
    /// Evict rows with the smallest `access_count` first. Reads increment
    /// `access_count`.
    LeastFrequentlyUsed,
}

impl EvictionPolicy {
    pub fn name(self) -> &'static str {
        match self {
            Self::LeastRecentlyStored => "least-recently-stored",
            Self::LeastRecentlyUsed => "least-recently-used",
            Self::LeastFrequentlyUsed => "least-frequently-used",
        }
    }

    /// DDL for the supporting index, run once on open.
    pub(crate) fn init_sql(self) -> &'static str {
        match self {
            Self::LeastRecentlyStored => {
                "CREATE INDEX IF NOT EXISTS Cache_store_time ON Cache (store_time)"
            }
            Self::LeastRecentlyUsed => {
                "CREATE INDEX IF NOT EXISTS Cache_access_time ON Cache (access_time)"
            }
            Self::LeastFrequentlyUsed => {
                "CREATE INDEX IF NOT EXISTS Cache_access_count ON Cache (access_count)"
            }
        }
    }

    /// Per-read side effect for `rowid`, if the policy has one.
    pub(crate) fn touch(self, conn: &Connection, rowid: i64, now: f64) -> rusqlite::Result<()> {
        match self {
            Self::LeastRecentlyStored => Ok(()),
            Self::LeastRecentlyUsed => {
                conn.execute(
                    "UPDATE Cache SET access_time = ?1 WHERE rowid = ?2",
                    params![now, rowid],
                )?;
                Ok(())
            }
            Self::LeastFrequentlyUsed => {
                conn.execute(
                    "UPDATE Cache SET access_count = access_count + 1 WHERE rowid = ?1",
                    params![rowid],
                )?;
                Ok(())
            }
        }
    }

    /// Eviction scan in policy order, excluding the row identified by
    /// `(key, raw)` so that the write which triggered the cull cannot evict
    /// its own entry.
    pub(crate) fn evict_scan_sql(self) -> &'static str {
        match self {
            Self::LeastRecentlyStored => {
                "SELECT rowid, version, filename FROM Cache \
                 WHERE NOT (key = ?1 AND raw = ?2) ORDER BY store_time LIMIT ?3"
            }
            Self::LeastRecentlyUsed => {
                "SELECT rowid, version, filename FROM Cache \
                 WHERE NOT (key = ?1 AND raw = ?2) ORDER BY access_time LIMIT ?3"
            }
            Self::LeastFrequentlyUsed => {
                "SELECT rowid, version, filename FROM Cache \
                 WHERE NOT (key = ?1 AND raw = ?2) ORDER BY access_count LIMIT ?3"
            }
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EvictionPolicy {
    type Err = CacheError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "least-recently-stored" => Ok(Self::LeastRecentlyStored),
            "least-recently-used" => Ok(Self::LeastRecentlyUsed),
            "least-frequently-used" => Ok(Self::LeastFrequentlyUsed),
            other => Err(CacheError::UnknownEvictionPolicy {
                name: other.to_string(),
            }),
        }
    }
}
