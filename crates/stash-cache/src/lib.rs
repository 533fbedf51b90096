//! Persistent, process-safe disk cache.
//!
//! This crate implements a dictionary-like cache whose metadata lives in an
//! embedded SQLite database and whose large values are spilled to files
//! under the cache directory:
//! - per-entry expiry and tagging with byte-accurate size accounting
//! - hybrid inline/file value storage around a configurable threshold
//! - lock-free multi-process writes via per-row version tokens
//! - bounded culling under three eviction policies
//! - a consistency checker that reconciles rows against the filesystem
//! - a probabilistic stampede barrier for expensive computations

mod cache;
mod check;
mod codec;
mod error;
mod file_store;
mod policy;
mod stampede;
mod store;
mod util;

pub use cache::{Cache, Entry, SetOptions};
pub use check::{CheckFinding, CheckReport};
pub use codec::{CacheKey, CacheValue, Fetched};
pub use error::{CacheError, Result};
pub use policy::EvictionPolicy;
pub use stampede::StampedeBarrier;
pub use store::{CacheConfig, SettingValue};
