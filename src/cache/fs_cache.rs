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

//! Feature-view metadata cache.
//!
//! Entries are filled once by the first reader and refreshed only through
//! eviction. Each shard keeps its entries on a last-used queue; a sweeper
//! thread per shard evicts from the head once an entry is old enough and no
//! longer referenced. Failed fills are cached too, so repeated requests for a
//! bad feature view do not storm the metadata backend.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};

use super::{shard_of, CacheSettings, SleepCond};
use crate::error::{RestError, FETCH_METADATA_FROM_CACHE_FAIL};
use crate::metadata::FeatureViewMetadata;

pub const NUM_FS_SHARDS: usize = 1;
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const CLEANUP_SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
enum FsState {
    Filling,
    Valid(Arc<FeatureViewMetadata>),
    Invalid(RestError),
}

#[derive(Debug)]
struct FsEntryInner {
    state: FsState,
    ref_count: i32,
    last_used: Instant,
}

pub struct FsCacheEntry {
    key: String,
    inner: Mutex<FsEntryInner>,
    cond: Condvar,
}

struct Shard {
    map: Mutex<HashMap<String, Arc<FsCacheEntry>>>,
    // Last-used queue; head is the eviction candidate. Leaf lock, taken
    // after the entry wait-lock.
    queue: Mutex<VecDeque<Arc<FsCacheEntry>>>,
}

/// Outcome of a cache lookup.
pub enum FsLookup {
    /// Entry is valid; payload attached.
    Hit(Arc<FeatureViewMetadata>),
    /// Caller inserted a Filling entry and must populate it via
    /// [`FsMetadataCache::fill`].
    MustFill(Arc<FsCacheEntry>),
    /// Cached failure or shutdown.
    Failed(RestError),
}

pub struct FsMetadataCache {
    shards: Vec<Shard>,
    sleep: SleepCond,
    evicted: AtomicBool,
    running_sweepers: AtomicUsize,
    settings: CacheSettings,
}

impl FsMetadataCache {
    pub fn new(settings: CacheSettings) -> Arc<Self> {
        Self::with_shards(settings, NUM_FS_SHARDS)
    }

    pub fn with_shards(settings: CacheSettings, n_shards: usize) -> Arc<Self> {
        assert!(n_shards.is_power_of_two());
        let cache = Arc::new(FsMetadataCache {
            shards: (0..n_shards)
                .map(|_| Shard {
                    map: Mutex::new(HashMap::new()),
                    queue: Mutex::new(VecDeque::new()),
                })
                .collect(),
            sleep: SleepCond::new(),
            evicted: AtomicBool::new(false),
            running_sweepers: AtomicUsize::new(0),
            settings,
        });
        for shard_id in 0..n_shards {
            let sweeper = Arc::clone(&cache);
            sweeper.running_sweepers.fetch_add(1, Ordering::AcqRel);
            std::thread::Builder::new()
                .name("fs-cache-sweeper".to_string())
                .spawn(move || sweeper.sweeper(shard_id))
                .expect("failed to spawn metadata cache sweeper");
        }
        cache
    }

    /// The cache key for a feature view.
    pub fn cache_key(fs_name: &str, fv_name: &str, fv_version: i32) -> String {
        format!("{fs_name}|{fv_name}|{fv_version}")
    }

    /// Look the key up, blocking while another reader fills it. A miss
    /// returns `MustFill`; the caller performs the backend fetch and hands
    /// the result to [`fill`](Self::fill).
    pub fn get(&self, fs_key: &str) -> FsLookup {
        let shard_id = shard_of(fs_key, self.shards.len());
        let shard = &self.shards[shard_id];
        let mut map = shard.map.lock();
        if self.evicted.load(Ordering::Acquire) {
            return FsLookup::Failed(FETCH_METADATA_FROM_CACHE_FAIL.error());
        }
        let entry = match map.get(fs_key) {
            Some(entry) => Arc::clone(entry),
            None => {
                let entry = Arc::new(FsCacheEntry {
                    key: fs_key.to_string(),
                    inner: Mutex::new(FsEntryInner {
                        state: FsState::Filling,
                        ref_count: 1,
                        last_used: Instant::now(),
                    }),
                    cond: Condvar::new(),
                });
                map.insert(fs_key.to_string(), Arc::clone(&entry));
                shard.queue.lock().push_back(Arc::clone(&entry));
                debug!("metadata cache miss for {fs_key}, caller fills");
                return FsLookup::MustFill(entry);
            }
        };
        let mut inner = entry.inner.lock();
        drop(map);
        if let FsState::Invalid(err) = &inner.state {
            return FsLookup::Failed(err.clone());
        }
        inner.ref_count += 1;
        while matches!(inner.state, FsState::Filling) {
            entry.cond.wait(&mut inner);
        }
        inner.ref_count -= 1;
        match &inner.state {
            FsState::Invalid(err) => FsLookup::Failed(err.clone()),
            FsState::Valid(data) => {
                let data = Arc::clone(data);
                inner.last_used = Instant::now();
                let mut queue = self.shards[shard_id].queue.lock();
                if let Some(pos) = queue.iter().position(|e| Arc::ptr_eq(e, &entry)) {
                    let moved = queue.remove(pos).expect("position just found");
                    queue.push_back(moved);
                }
                FsLookup::Hit(data)
            }
            FsState::Filling => unreachable!("waited for fill above"),
        }
    }

    /// Resolve a Filling entry with the fetched payload or the error to
    /// cache, release the populator's reference and wake waiting readers.
    pub fn fill(
        &self,
        entry: &Arc<FsCacheEntry>,
        result: Result<Arc<FeatureViewMetadata>, RestError>,
    ) {
        let mut inner = entry.inner.lock();
        inner.state = match result {
            Ok(data) => FsState::Valid(data),
            Err(err) => {
                debug!("metadata fill for {} failed: {err}", entry.key);
                FsState::Invalid(err)
            }
        };
        inner.ref_count -= 1;
        entry.cond.notify_all();
    }

    /// One sweeper per shard: every tick, inspect the head of the last-used
    /// queue and evict it if it is unreferenced and old enough (or shutdown
    /// is in progress).
    fn sweeper(&self, shard_id: usize) {
        let eviction = Duration::from_millis(self.settings.unused_eviction_ms as u64);
        let shard = &self.shards[shard_id];
        loop {
            loop {
                let map = shard.map.lock();
                let head = shard.queue.lock().front().map(Arc::clone);
                let Some(entry) = head else {
                    if self.evicted.load(Ordering::Acquire) {
                        drop(map);
                        self.running_sweepers.fetch_sub(1, Ordering::AcqRel);
                        debug!("metadata cache sweeper {shard_id} stopped");
                        return;
                    }
                    break;
                };
                let inner = entry.inner.lock();
                let evict = inner.ref_count == 0
                    && !matches!(inner.state, FsState::Filling)
                    && (self.evicted.load(Ordering::Acquire)
                        || inner.last_used.elapsed() >= eviction);
                if !evict {
                    break;
                }
                drop(inner);
                let mut map = map;
                map.remove(&entry.key);
                let mut queue = shard.queue.lock();
                if let Some(pos) = queue.iter().position(|e| Arc::ptr_eq(e, &entry)) {
                    let _ = queue.remove(pos);
                }
                debug!("metadata cache evicted {}", entry.key);
                // Loop again without sleeping; more entries may be ripe.
            }
            self.sleep
                .sleep(SWEEP_INTERVAL, || self.evicted.load(Ordering::Acquire));
            if self.evicted.load(Ordering::Acquire) {
                // Drain mode: held entries block eviction, poll until the
                // readers release them.
                std::thread::sleep(CLEANUP_SLEEP);
            }
        }
    }

    /// Shut down: wake the sweepers and wait until every shard map is empty
    /// and every sweeper has exited. Held entries are never freed while
    /// `ref_count > 0`; the sweepers keep draining until readers let go.
    pub fn cleanup(&self) {
        debug!("metadata cache cleanup started");
        {
            let guards: Vec<_> = self.shards.iter().map(|s| s.map.lock()).collect();
            self.evicted.store(true, Ordering::Release);
            self.sleep.notify_all();
            drop(guards);
        }
        for shard in &self.shards {
            loop {
                if shard.map.lock().is_empty() {
                    break;
                }
                std::thread::sleep(CLEANUP_SLEEP);
            }
        }
        while self.running_sweepers.load(Ordering::Acquire) > 0 {
            self.sleep.notify_all();
            std::thread::sleep(CLEANUP_SLEEP);
        }
        debug!("metadata cache cleanup finished");
    }

    pub fn size(&self) -> usize {
        self.shards.iter().map(|s| s.map.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FeatureViewMetadata;

    fn settings() -> CacheSettings {
        CacheSettings {
            refresh_interval_ms: 50,
            unused_eviction_ms: 150,
            refresh_interval_jitter_ms: 10,
        }
    }

    fn dummy_metadata() -> Arc<FeatureViewMetadata> {
        Arc::new(FeatureViewMetadata::default())
    }

    #[test]
    fn first_reader_fills_then_hits() {
        let cache = FsMetadataCache::new(settings());
        let key = FsMetadataCache::cache_key("fs", "fv", 1);
        let entry = match cache.get(&key) {
            FsLookup::MustFill(entry) => entry,
            _ => panic!("expected MustFill on first access"),
        };
        cache.fill(&entry, Ok(dummy_metadata()));
        assert!(matches!(cache.get(&key), FsLookup::Hit(_)));
        cache.cleanup();
    }

    #[test]
    fn failed_fill_is_cached() {
        let cache = FsMetadataCache::new(settings());
        let key = FsMetadataCache::cache_key("fs", "missing", 1);
        let entry = match cache.get(&key) {
            FsLookup::MustFill(entry) => entry,
            _ => panic!("expected MustFill"),
        };
        cache.fill(&entry, Err(crate::error::FV_NOT_EXIST.error()));
        match cache.get(&key) {
            FsLookup::Failed(err) => assert_eq!(err.code, crate::error::FV_NOT_EXIST.code),
            _ => panic!("expected cached failure"),
        }
        cache.cleanup();
    }

    #[test]
    fn waiting_readers_are_woken_by_fill() {
        let cache = FsMetadataCache::new(settings());
        let key = FsMetadataCache::cache_key("fs", "fv", 2);
        let entry = match cache.get(&key) {
            FsLookup::MustFill(entry) => entry,
            _ => panic!("expected MustFill"),
        };
        let mut readers = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            readers.push(std::thread::spawn(move || {
                matches!(cache.get(&key), FsLookup::Hit(_))
            }));
        }
        std::thread::sleep(Duration::from_millis(50));
        cache.fill(&entry, Ok(dummy_metadata()));
        for r in readers {
            assert!(r.join().unwrap());
        }
        cache.cleanup();
    }

    #[test]
    fn sweeper_evicts_unused_entries() {
        let cache = FsMetadataCache::new(settings());
        let key = FsMetadataCache::cache_key("fs", "fv", 3);
        match cache.get(&key) {
            FsLookup::MustFill(entry) => cache.fill(&entry, Ok(dummy_metadata())),
            _ => panic!("expected MustFill"),
        }
        assert_eq!(cache.size(), 1);
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(cache.size(), 0);
        cache.cleanup();
    }

    #[test]
    fn cleanup_waits_for_in_flight_fill() {
        let cache = FsMetadataCache::new(settings());
        let key = FsMetadataCache::cache_key("fs", "slow", 1);
        let entry = match cache.get(&key) {
            FsLookup::MustFill(entry) => entry,
            _ => panic!("expected MustFill"),
        };
        // The populator still holds a reference; shutdown must not free the
        // entry until the fill completes.
        let filler = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                cache.fill(&entry, Ok(dummy_metadata()));
            })
        };
        cache.cleanup();
        assert_eq!(cache.size(), 0);
        filler.join().unwrap();
    }

    #[test]
    fn cleanup_empties_all_shards() {
        let cache = FsMetadataCache::with_shards(settings(), 4);
        for i in 0..16 {
            let key = FsMetadataCache::cache_key("fs", "fv", i);
            match cache.get(&key) {
                FsLookup::MustFill(entry) => cache.fill(&entry, Ok(dummy_metadata())),
                _ => panic!("expected MustFill"),
            }
        }
        assert_eq!(cache.size(), 16);
        cache.cleanup();
        assert_eq!(cache.size(), 0);
        assert!(matches!(cache.get("fs|fv|0"), FsLookup::Failed(_)));
    }
}
