// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Shared machinery of the two serving caches.
//!
//! Both caches shard entries by key hash and keep one mutex per shard map
//! plus one wait-lock/condvar per entry. Lock ordering is mandatory and the
//! same everywhere: shard lock, then entry wait-lock, then sleep lock. A
//! shard lock is never held across a condition wait.

pub mod api_key;
pub mod fs_cache;

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use xxhash_rust::xxh3::xxh3_64;

/// Cache tuning knobs, taken from the `Security.APIKey` config section.
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub refresh_interval_ms: u32,
    pub unused_eviction_ms: u32,
    pub refresh_interval_jitter_ms: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            refresh_interval_ms: 10_000,
            unused_eviction_ms: 60_000,
            refresh_interval_jitter_ms: 1_000,
        }
    }
}

impl CacheSettings {
    /// Refresh interval for a new entry, drawn once at insertion from
    /// `uniform(base - jitter, base + jitter)`.
    pub fn refresh_interval_with_jitter(&self) -> Duration {
        let base = self.refresh_interval_ms as i64;
        let jitter = self.refresh_interval_jitter_ms as i64;
        let drawn = if jitter == 0 {
            base
        } else {
            base + rand::Rng::gen_range(&mut rand::thread_rng(), -jitter..=jitter)
        };
        Duration::from_millis(drawn.max(1) as u64)
    }
}

/// Shard index for a key. `n_shards` must be a power of two; with a single
/// shard the hash is skipped entirely.
pub fn shard_of(key: &str, n_shards: usize) -> usize {
    debug_assert!(n_shards.is_power_of_two());
    if n_shards == 1 {
        0
    } else {
        (xxh3_64(key.as_bytes()) as usize) & (n_shards - 1)
    }
}

/// Process-wide sleep condvar. All updater workers sleep on this so that
/// shutdown can wake every one of them with a single broadcast.
pub struct SleepCond {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Default for SleepCond {
    fn default() -> Self {
        Self::new()
    }
}

impl SleepCond {
    pub fn new() -> Self {
        SleepCond {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Sleep up to `timeout` unless `skip` (the shutdown flag check) is
    /// already true.
    pub fn sleep(&self, timeout: Duration, skip: impl Fn() -> bool) {
        let mut guard = self.lock.lock();
        if !skip() {
            self.cond.wait_for(&mut guard, timeout);
        }
    }

    pub fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_shard_is_zero_without_hashing() {
        assert_eq!(shard_of("anything", 1), 0);
    }

    #[test]
    fn shard_is_stable_and_in_range() {
        for key in ["a", "b", "key|view|1"] {
            let s = shard_of(key, 8);
            assert!(s < 8);
            assert_eq!(s, shard_of(key, 8));
        }
    }

    #[test]
    fn jittered_interval_stays_in_band() {
        let settings = CacheSettings {
            refresh_interval_ms: 1000,
            unused_eviction_ms: 5000,
            refresh_interval_jitter_ms: 100,
        };
        for _ in 0..100 {
            let d = settings.refresh_interval_with_jitter();
            assert!(d >= Duration::from_millis(900));
            assert!(d <= Duration::from_millis(1100));
        }
    }
}
