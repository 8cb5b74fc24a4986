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

//! API-key authorization cache.
//!
//! Maps a raw API key to the set of database names the key may access. Each
//! entry has a dedicated updater thread that populates it, refreshes it
//! periodically and removes it once unused. Readers authenticate from the
//! cache alone; only a miss spawns backend traffic.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{shard_of, CacheSettings, SleepCond};
use crate::dal::{AuthBackend, DalError};

pub const NUM_API_KEY_SHARDS: usize = 1;
const CLEANUP_SLEEP: Duration = Duration::from_millis(10);
const API_KEY_PREFIX_LEN: usize = 16;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0}")]
    Client(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Server(String),
}

impl AuthError {
    pub fn status(&self) -> u16 {
        match self {
            AuthError::Client(_) => 400,
            AuthError::Unauthorized(_) => 401,
            AuthError::Server(_) => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum KeyState {
    Validating,
    Valid(HashSet<String>),
    Invalid,
}

#[derive(Debug)]
struct UserDbs {
    state: KeyState,
    ref_count: i32,
    last_used: Instant,
    last_updated: Instant,
}

struct ApiKeyEntry {
    wait_lock: Mutex<UserDbs>,
    wait_cond: Condvar,
    refresh_interval: Duration,
}

enum FindOutcome {
    NotCached,
    Allowed,
    Denied(AuthError),
}

/// The cache itself. One instance per process; `validate_api_key` is the
/// whole read API.
pub struct ApiKeyCache {
    shards: Vec<Mutex<HashMap<String, Arc<ApiKeyEntry>>>>,
    sleep: SleepCond,
    evicted: AtomicBool,
    backend: Arc<dyn AuthBackend>,
    settings: CacheSettings,
}

impl ApiKeyCache {
    pub fn new(backend: Arc<dyn AuthBackend>, settings: CacheSettings) -> Arc<Self> {
        Self::with_shards(backend, settings, NUM_API_KEY_SHARDS)
    }

    pub fn with_shards(
        backend: Arc<dyn AuthBackend>,
        settings: CacheSettings,
        n_shards: usize,
    ) -> Arc<Self> {
        assert!(n_shards.is_power_of_two());
        Arc::new(ApiKeyCache {
            shards: (0..n_shards).map(|_| Mutex::new(HashMap::new())).collect(),
            sleep: SleepCond::new(),
            evicted: AtomicBool::new(false),
            backend,
            settings,
        })
    }

    /// Validate the key's format and its access to every database in `dbs`.
    pub fn validate_api_key(self: &Arc<Self>, api_key: &str, dbs: &[&str]) -> Result<(), AuthError> {
        validate_api_key_format(api_key)?;
        if dbs.is_empty() {
            return Err(AuthError::Client(
                "Needs at least one database to validate API key for".to_string(),
            ));
        }
        let shard = shard_of(api_key, self.shards.len());
        match self.find_and_validate(api_key, dbs, shard, false) {
            FindOutcome::Allowed => return Ok(()),
            FindOutcome::Denied(err) => return Err(err),
            FindOutcome::NotCached => {}
        }
        // Only reached when the key was not in the cache: insert an entry in
        // Validating state and wait for its updater to resolve it.
        self.place_entry(api_key, shard)?;
        match self.find_and_validate(api_key, dbs, shard, true) {
            FindOutcome::Allowed => Ok(()),
            FindOutcome::Denied(err) => Err(err),
            FindOutcome::NotCached => Err(AuthError::Server(
                "API key disappeared from cache during validation".to_string(),
            )),
        }
    }

    /// Authenticate from the cache only; never contacts the backend.
    fn find_and_validate(
        &self,
        api_key: &str,
        dbs: &[&str],
        shard: usize,
        mut ref_taken: bool,
    ) -> FindOutcome {
        let map = self.shards[shard].lock();
        if self.evicted.load(Ordering::Acquire) {
            return FindOutcome::Denied(AuthError::Server(
                "API Key cache is shutting down".to_string(),
            ));
        }
        let entry = match map.get(api_key) {
            Some(entry) => Arc::clone(entry),
            None => {
                debug_assert!(!ref_taken);
                return FindOutcome::NotCached;
            }
        };
        let mut state = entry.wait_lock.lock();
        drop(map);
        while state.state == KeyState::Validating {
            if !ref_taken {
                ref_taken = true;
                state.ref_count += 1;
            }
            entry.wait_cond.wait(&mut state);
        }
        let outcome = match &state.state {
            KeyState::Invalid => FindOutcome::Denied(AuthError::Unauthorized(
                "API key found in cache but is invalid".to_string(),
            )),
            KeyState::Valid(authorized) => {
                let denied = dbs
                    .iter()
                    .find(|db| !authorized.contains(**db))
                    .map(|db| db.to_string());
                state.last_used = Instant::now();
                match denied {
                    Some(db) => FindOutcome::Denied(AuthError::Unauthorized(format!(
                        "API key not authorized to access {db}"
                    ))),
                    None => FindOutcome::Allowed,
                }
            }
            KeyState::Validating => unreachable!("waited for state change above"),
        };
        if ref_taken {
            state.ref_count -= 1;
        }
        outcome
    }

    /// Insert a Validating entry for the key (or take a reference on an
    /// entry that appeared meanwhile) and spawn its updater worker.
    fn place_entry(self: &Arc<Self>, api_key: &str, shard: usize) -> Result<(), AuthError> {
        let mut map = self.shards[shard].lock();
        if let Some(entry) = map.get(api_key) {
            // Raced with another reader; it already owns the worker.
            entry.wait_lock.lock().ref_count += 1;
            return Ok(());
        }
        let entry = Arc::new(ApiKeyEntry {
            wait_lock: Mutex::new(UserDbs {
                state: KeyState::Validating,
                ref_count: 1,
                last_used: Instant::now(),
                last_updated: Instant::now(),
            }),
            wait_cond: Condvar::new(),
            refresh_interval: self.settings.refresh_interval_with_jitter(),
        });
        map.insert(api_key.to_string(), Arc::clone(&entry));
        drop(map);
        debug!("API key inserted in cache, spawning updater");
        let cache = Arc::clone(self);
        let key = api_key.to_string();
        std::thread::Builder::new()
            .name("api-key-cache".to_string())
            .spawn(move || cache.entry_updater(key, shard, entry))
            .map_err(|e| AuthError::Server(format!("Failed to spawn cache updater: {e}")))?;
        Ok(())
    }

    /// Per-entry worker: populate, refresh with jitter, evict when unused,
    /// drain and unlink on shutdown. At most one exists per entry.
    fn entry_updater(&self, api_key: String, shard: usize, entry: Arc<ApiKeyEntry>) {
        let mut first = true;
        loop {
            let lookup = if self.evicted.load(Ordering::Acquire) {
                None
            } else {
                Some(self.lookup_databases(&api_key))
            };
            {
                let mut state = entry.wait_lock.lock();
                let now = Instant::now();
                match lookup {
                    Some(Ok(dbs)) => {
                        if first {
                            state.last_used = now;
                        }
                        state.state = KeyState::Valid(dbs);
                    }
                    Some(Err(PopulateError::Rejected)) => {
                        if first {
                            state.last_used = now;
                        }
                        state.state = KeyState::Invalid;
                    }
                    Some(Err(PopulateError::Backend(err))) => {
                        debug!("API key backend lookup failed: {err}");
                        // A transient failure during refresh keeps serving
                        // stale data until eviction.
                        if first {
                            state.last_used = now;
                            state.state = KeyState::Invalid;
                        }
                    }
                    None => {}
                }
                first = false;
                state.last_updated = now;
                entry.wait_cond.notify_all();
            }

            self.sleep
                .sleep(entry.refresh_interval, || self.evicted.load(Ordering::Acquire));

            while self.evicted.load(Ordering::Acquire) {
                // Wait for all access to this key to finish, then unlink.
                let ref_count = entry.wait_lock.lock().ref_count;
                if ref_count > 0 {
                    std::thread::sleep(CLEANUP_SLEEP);
                    continue;
                }
                self.shards[shard].lock().remove(&api_key);
                return;
            }

            let last_used = entry.wait_lock.lock().last_used;
            if last_used.elapsed() >= Duration::from_millis(self.settings.unused_eviction_ms as u64)
            {
                let mut map = self.shards[shard].lock();
                let state = entry.wait_lock.lock();
                if state.ref_count <= 0 {
                    map.remove(&api_key);
                    return;
                }
            }
        }
    }

    fn lookup_databases(&self, api_key: &str) -> Result<HashSet<String>, PopulateError> {
        let (prefix, secret) = api_key
            .split_once('.')
            .ok_or(PopulateError::Rejected)?;
        let record = match self.backend.find_api_key(prefix) {
            Ok(record) => record,
            Err(DalError::NotFound) => return Err(PopulateError::Rejected),
            Err(err) => return Err(PopulateError::Backend(err)),
        };
        // sha256(client secret + salt) must equal the stored hash.
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(record.salt.as_bytes());
        let hashed = hex_lower(&hasher.finalize());
        if hashed != record.secret_hash {
            debug!("bad API key");
            return Err(PopulateError::Rejected);
        }
        let projects = self
            .backend
            .find_all_projects(record.user_id)
            .map_err(PopulateError::Backend)?;
        Ok(projects.into_iter().collect())
    }

    /// Shut down: wake every worker, then wait until they have all drained
    /// their ref-counts and removed themselves from the shard maps.
    pub fn cleanup(&self) {
        debug!("API key cache cleanup started");
        {
            let guards: Vec<_> = self.shards.iter().map(|s| s.lock()).collect();
            self.evicted.store(true, Ordering::Release);
            self.sleep.notify_all();
            drop(guards);
        }
        for shard in &self.shards {
            loop {
                let remaining = shard.lock().len();
                if remaining == 0 {
                    break;
                }
                std::thread::sleep(CLEANUP_SLEEP);
            }
        }
        debug!("API key cache cleanup finished");
    }

    pub fn size(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn last_updated(&self, api_key: &str) -> Option<Instant> {
        let shard = shard_of(api_key, self.shards.len());
        let map = self.shards[shard].lock();
        let entry = map.get(api_key)?;
        let state = entry.wait_lock.lock();
        Some(state.last_updated)
    }
}

enum PopulateError {
    /// The backend answered and the key is bad: no such prefix, or the
    /// hashed secret does not match.
    Rejected,
    Backend(DalError),
}

fn validate_api_key_format(api_key: &str) -> Result<(), AuthError> {
    if api_key.is_empty() {
        return Err(AuthError::Client("the apikey is nil".to_string()));
    }
    let valid = match api_key.split_once('.') {
        Some((prefix, secret)) => {
            prefix.len() == API_KEY_PREFIX_LEN && !secret.is_empty() && !secret.contains('.')
        }
        None => false,
    };
    if !valid {
        return Err(AuthError::Client(
            "the apikey has an incorrect format".to_string(),
        ));
    }
    Ok(())
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Hash a secret the way the authorization backend stores it; shared with
/// test fixtures that seed the backend.
pub fn hash_secret(secret: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(salt.as_bytes());
    hex_lower(&hasher.finalize())
}
