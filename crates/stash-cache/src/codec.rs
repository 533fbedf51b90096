use rusqlite::types::Value as SqlValue;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::Read;

use crate::error::{CacheError, Result};
use crate::file_store::FileStore;
use crate::util;

// Storage disciplines recorded in the `mode` column.
pub(crate) const MODE_NONE: i64 = 0;
pub(crate) const MODE_RAW: i64 = 1;
pub(crate) const MODE_BINARY: i64 = 2;
pub(crate) const MODE_TEXT: i64 = 3;
pub(crate) const MODE_OPAQUE: i64 = 4;

/// A cache key.
///
/// Integer, float, text, and byte keys are stored natively in the metadata
/// row; everything else is serialized through [`CacheKey::opaque`]. The pair
/// of encoded key and raw flag is the row identity.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheKey {
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Serialized payload for key types outside the native set.
    Opaque(Vec<u8>),
}

impl CacheKey {
    /// Encode an arbitrary serializable key.
    pub fn opaque<T: Serialize>(key: &T) -> Result<Self> {
        Ok(Self::Opaque(util::bincode_serialize(key)?))
    }

    /// Column value and raw flag forming the row identity.
    pub(crate) fn encode(&self) -> (SqlValue, bool) {
        match self {
            Self::Int(v) => (SqlValue::Integer(*v), true),
            Self::Float(v) => (SqlValue::Real(*v), true),
            Self::Text(v) => (SqlValue::Text(v.clone()), true),
            Self::Bytes(v) => (SqlValue::Blob(v.clone()), true),
            Self::Opaque(v) => (SqlValue::Blob(v.clone()), false),
        }
    }

    /// Decode the column value and raw flag back into a key.
    pub(crate) fn decode(value: SqlValue, raw: bool) -> Option<Self> {
        match (value, raw) {
            (SqlValue::Integer(v), true) => Some(Self::Int(v)),
            (SqlValue::Real(v), true) => Some(Self::Float(v)),
            (SqlValue::Text(v), true) => Some(Self::Text(v)),
            (SqlValue::Blob(v), true) => Some(Self::Bytes(v)),
            (SqlValue::Blob(v), false) => Some(Self::Opaque(v)),
            _ => None,
        }
    }
}

impl From<i64> for CacheKey {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for CacheKey {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for CacheKey {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&[u8]> for CacheKey {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for CacheKey {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// A cache value.
///
/// Integer and float values are always stored inline with a recorded size of
/// zero: the database's own page accounting tracks them. Text, bytes, and
/// opaque payloads spill to a value file once they reach the configured
/// large-value threshold.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Serialized payload for value types outside the native set.
    Opaque(Vec<u8>),
}

impl CacheValue {
    /// Encode an arbitrary serializable value.
    pub fn opaque<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Opaque(util::bincode_serialize(value)?))
    }

    /// Decode an opaque payload back into its original type.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Self::Opaque(bytes) => util::bincode_deserialize(bytes),
            _ => Err(CacheError::NotOpaque),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for CacheValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for CacheValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for CacheValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&[u8]> for CacheValue {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// A fetched payload: materialized, or an open handle onto the value file.
///
/// The stream arm is only produced for file-backed binary values read with
/// the streaming flag; the handle's lifetime belongs to the caller.
#[derive(Debug)]
pub enum Fetched {
    Value(CacheValue),
    Stream(File),
}

impl Fetched {
    /// Materialize the payload, draining the stream arm if present.
    pub fn into_value(self) -> Result<CacheValue> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Stream(mut file) => {
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes)?;
                Ok(CacheValue::Bytes(bytes))
            }
        }
    }
}

/// Row fields produced by staging a value for storage.
#[derive(Debug)]
pub(crate) struct StoredValue {
    pub(crate) size: i64,
    pub(crate) mode: i64,
    pub(crate) filename: Option<String>,
    pub(crate) value: SqlValue,
}

impl StoredValue {
    fn inline(size: i64, mode: i64, value: SqlValue) -> Self {
        Self {
            size,
            mode,
            filename: None,
            value,
        }
    }

    fn external(size: i64, mode: i64, filename: String) -> Self {
        Self {
            size,
            mode,
            filename: Some(filename),
            value: SqlValue::Null,
        }
    }
}

/// Stage a value: decide inline vs file per `threshold` and write any file.
pub(crate) fn store(value: &CacheValue, threshold: usize, files: &FileStore) -> Result<StoredValue> {
    match value {
        CacheValue::Int(v) => Ok(StoredValue::inline(0, MODE_RAW, SqlValue::Integer(*v))),
        CacheValue::Float(v) => Ok(StoredValue::inline(0, MODE_RAW, SqlValue::Real(*v))),
        CacheValue::Text(text) => {
            if text.len() < threshold {
                Ok(StoredValue::inline(0, MODE_RAW, SqlValue::Text(text.clone())))
            } else {
                let filename = files.write_bytes(text.as_bytes())?;
                Ok(StoredValue::external(
                    text.len() as i64,
                    MODE_TEXT,
                    filename,
                ))
            }
        }
        CacheValue::Bytes(bytes) => {
            if bytes.len() < threshold {
                Ok(StoredValue::inline(
                    bytes.len() as i64,
                    MODE_RAW,
                    SqlValue::Blob(bytes.clone()),
                ))
            } else {
                let filename = files.write_bytes(bytes)?;
                Ok(StoredValue::external(
                    bytes.len() as i64,
                    MODE_BINARY,
                    filename,
                ))
            }
        }
        CacheValue::Opaque(bytes) => {
            if bytes.len() < threshold {
                Ok(StoredValue::inline(
                    0,
                    MODE_OPAQUE,
                    SqlValue::Blob(bytes.clone()),
                ))
            } else {
                let filename = files.write_bytes(bytes)?;
                Ok(StoredValue::external(
                    bytes.len() as i64,
                    MODE_OPAQUE,
                    filename,
                ))
            }
        }
    }
}

/// Stage a streaming byte source. Always file-backed, size as counted.
pub(crate) fn store_reader(reader: &mut dyn Read, files: &FileStore) -> Result<StoredValue> {
    let (filename, size) = files.write_reader(reader)?;
    Ok(StoredValue::external(size as i64, MODE_BINARY, filename))
}

/// Reconstruct a payload from its row fields.
pub(crate) fn fetch(
    rowid: i64,
    mode: i64,
    filename: Option<&str>,
    value: SqlValue,
    read: bool,
    files: &FileStore,
) -> Result<Fetched> {
    let malformed = || CacheError::MalformedRow { rowid, mode };

    match mode {
        // Reservation rows never reach a fetch; their mode is a row defect.
        MODE_NONE => Err(malformed()),
        MODE_RAW => {
            let value = match value {
                SqlValue::Integer(v) => CacheValue::Int(v),
                SqlValue::Real(v) => CacheValue::Float(v),
                SqlValue::Text(v) => CacheValue::Text(v),
                SqlValue::Blob(v) => CacheValue::Bytes(v),
                SqlValue::Null => return Err(malformed()),
            };
            Ok(Fetched::Value(value))
        }
        MODE_BINARY => {
            let filename = filename.ok_or_else(malformed)?;
            if read {
                Ok(Fetched::Stream(files.open(filename)?))
            } else {
                Ok(Fetched::Value(CacheValue::Bytes(files.read(filename)?)))
            }
        }
        MODE_TEXT => {
            let filename = filename.ok_or_else(malformed)?;
            Ok(Fetched::Value(CacheValue::Text(files.read_text(filename)?)))
        }
        MODE_OPAQUE => match (value, filename) {
            (SqlValue::Blob(bytes), _) => Ok(Fetched::Value(CacheValue::Opaque(bytes))),
            (SqlValue::Null, Some(filename)) => {
                Ok(Fetched::Value(CacheValue::Opaque(files.read(filename)?)))
            }
            _ => Err(malformed()),
        },
        _ => Err(malformed()),
    }
}
