use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;

use crate::cache::{Cache, SetOptions};
use crate::codec::{CacheKey, CacheValue};
use crate::error::Result;
use crate::util::now_seconds;

/// Mitigates cache stampedes (dog-piling, cache miss storms) around an
/// expensive computation.
///
/// The cached record carries the measured cost `delta` of the last
/// computation. A read recomputes early with probability that rises
/// smoothly as the entry approaches expiry, biased by that cost, so
/// concurrent clients stagger their refreshes before the true deadline.
/// Callers are deliberately not coordinated with a lock; the barrier only
/// reduces the expected number of refreshes.
///
/// Based on research by Vattani, A.; Chierichetti, F.; Lowenstein, K.
/// (2015), Optimal Probabilistic Cache Stampede Prevention, VLDB,
/// pp. 886-897, ISSN 2150-8097.
pub struct StampedeBarrier {
    cache: Cache,
    expire: f64,
}

#[derive(Serialize, Deserialize)]
struct CachedCall<V> {
    value: V,
    delta: f64,
    expire_time: f64,
}

impl StampedeBarrier {
    /// Wrap an existing cache. `expire` is the TTL for cached results.
    pub fn new(cache: Cache, expire: f64) -> Self {
        Self { cache, expire }
    }

    /// Open a cache at `directory` and wrap it.
    pub fn open(directory: impl AsRef<Path>, expire: f64) -> Result<Self> {
        Ok(Self::new(Cache::open(directory)?, expire))
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn into_cache(self) -> Cache {
        self.cache
    }

    /// Return the cached result for `key`, or invoke `func`, measure it,
    /// cache the result with this barrier's TTL, and return it.
    pub fn call<K, V, F>(&mut self, key: K, func: F) -> Result<V>
    where
        K: Into<CacheKey>,
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> V,
    {
        let key = key.into();

        if let Some(value) = self.cache.get(key.clone())? {
            let cached: CachedCall<V> = value.deserialize()?;
            let ttl = cached.expire_time - now_seconds();
            let draw: f64 = rand::thread_rng().gen();

            if early_recompute_score(cached.delta, uniform_unit(draw)) < ttl {
                return Ok(cached.value);
            }
        }

        let started = Instant::now();
        let value = func();
        let delta = started.elapsed().as_secs_f64();

        let record = CachedCall {
            value,
            delta,
            expire_time: now_seconds() + self.expire,
        };
        self.cache.set_with(
            key,
            CacheValue::opaque(&record)?,
            SetOptions {
                expire: Some(self.expire),
                ..SetOptions::default()
            },
        )?;

        Ok(record.value)
    }
}

/// Map a draw from `[0, 1)` onto `(0, 1]` so the logarithm is finite.
fn uniform_unit(draw: f64) -> f64 {
    1.0 - draw
}

/// The recompute score `-delta * ln(u)`: an exponential variable scaled by
/// the last computation's cost. The entry is served from cache while the
/// score stays below the remaining TTL.
fn early_recompute_score(delta: f64, u: f64) -> f64 {
    -delta * u.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn score_grows_with_cost() {
        let u = 0.5;
        assert!(early_recompute_score(2.0, u) > early_recompute_score(1.0, u));
        assert_eq!(early_recompute_score(1.0, 1.0), 0.0);
    }

    #[test]
    fn cached_serve_rate_matches_closed_form() {
        // With cost 1 and 5 seconds remaining, the entry is served from
        // cache with probability 1 - exp(-5).
        let delta = 1.0;
        let ttl = 5.0;
        let trials = 10_000u32;

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut served = 0u32;
        for _ in 0..trials {
            let draw: f64 = rng.gen();
            if early_recompute_score(delta, uniform_unit(draw)) < ttl {
                served += 1;
            }
        }

        let observed = f64::from(served) / f64::from(trials);
        let expected = 1.0 - (-ttl / delta).exp();
        assert!(
            (observed - expected).abs() < 0.01,
            "observed {observed}, expected {expected}"
        );
    }
}
