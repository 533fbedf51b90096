use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// Hard upper bound for any bincode-encoded payload we will attempt to
/// deserialize from the store.
///
/// Corruption should degrade to an error, not an out-of-memory crash: this
/// cap keeps a damaged length prefix from requesting an enormous allocation.
pub(crate) const BINCODE_PAYLOAD_LIMIT_BYTES: u64 = 64 * 1024 * 1024;

/// Wall-clock seconds since the unix epoch.
pub(crate) fn now_seconds() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(err) => {
            // This should be extremely rare (system clock set before 1970).
            // Avoid spamming logs in hot call sites by logging at most once.
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "stash.cache",
                    error = %err,
                    "system time is before unix epoch; using 0.0 for now_seconds"
                );
            }
            0.0
        }
    }
}

pub(crate) fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

pub(crate) fn bincode_options_limited() -> impl bincode::Options + Copy {
    bincode_options().with_limit(BINCODE_PAYLOAD_LIMIT_BYTES)
}

pub(crate) fn bincode_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode_options().serialize(value)?)
}

pub(crate) fn bincode_deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode_options_limited().deserialize(bytes)?)
}
