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

//! In-memory implementations of the storage-cluster contracts, used by unit
//! tests and by binary-level test cases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffers::BufferPool;
use crate::cache::api_key::{hash_secret, ApiKeyCache};
use crate::cache::fs_cache::FsMetadataCache;
use crate::cache::CacheSettings;
use crate::config::AppConfig;
use crate::dal::{
    AggClient, AggResultRecord, AggScanRequest, AggValue, ApiKeyRecord, AuthBackend, ColumnDef,
    DalError, DataClient, FeatureGroupAvroSchema, FeatureGroupRow, MetadataBackend, OrderedIndex,
    RonDbStats, RsBuffer, ScanValue, ServingKeyRow, TableSchema, TrainingDatasetFeature,
    TrainingDatasetJoin,
};
use crate::feature_store::FeatureStoreCore;
use crate::pkread::encoding::{
    create_native_response, decode_native_request, ResponseColumn, DATA_TYPE_NUMBER,
    DATA_TYPE_STRING,
};

// ---- Authorization backend ----------------------------------------------

#[derive(Default)]
pub struct MockAuthBackend {
    keys: Mutex<HashMap<String, ApiKeyRecord>>,
    projects: Mutex<HashMap<i32, Vec<String>>>,
    key_lookups: AtomicUsize,
}

impl MockAuthBackend {
    pub fn add_key(&self, prefix: &str, secret: &str, user_id: i32, projects: &[&str]) {
        let salt = format!("salt-{prefix}");
        self.keys.lock().insert(
            prefix.to_string(),
            ApiKeyRecord {
                secret_hash: hash_secret(secret, &salt),
                salt,
                user_id,
            },
        );
        self.projects
            .lock()
            .insert(user_id, projects.iter().map(|p| p.to_string()).collect());
    }

    pub fn key_lookups(&self) -> usize {
        self.key_lookups.load(Ordering::Acquire)
    }
}

impl AuthBackend for MockAuthBackend {
    fn find_api_key(&self, prefix: &str) -> Result<ApiKeyRecord, DalError> {
        self.key_lookups.fetch_add(1, Ordering::AcqRel);
        self.keys
            .lock()
            .get(prefix)
            .cloned()
            .ok_or(DalError::NotFound)
    }

    fn find_all_projects(&self, user_id: i32) -> Result<Vec<String>, DalError> {
        self.projects
            .lock()
            .get(&user_id)
            .cloned()
            .ok_or(DalError::NotFound)
    }
}

// ---- Metadata backend ---------------------------------------------------

#[derive(Default)]
pub struct MockMetadataBackend {
    pub feature_stores: HashMap<String, i32>,
    pub feature_store_names: HashMap<i32, String>,
    pub feature_views: HashMap<(i32, String, i32), i32>,
    pub joins: HashMap<i32, Vec<TrainingDatasetJoin>>,
    pub features: HashMap<i32, Vec<TrainingDatasetFeature>>,
    pub feature_groups: HashMap<i32, FeatureGroupRow>,
    pub serving_keys: HashMap<i32, Vec<ServingKeyRow>>,
    pub projects: HashMap<String, i32>,
    pub schemas: HashMap<(String, i32), FeatureGroupAvroSchema>,
}

impl MockMetadataBackend {
    /// Change the declared type of a training-dataset feature.
    pub fn set_feature_type(&mut self, feature_name: &str, data_type: &str) {
        for features in self.features.values_mut() {
            for feature in features.iter_mut() {
                if feature.name == feature_name {
                    feature.data_type = data_type.to_string();
                }
            }
        }
    }

    /// Register the Avro subschema of one feature of a feature group.
    pub fn set_avro_schema(&mut self, fg_name: &str, feature_name: &str, schema_json: &str) {
        let entry = self
            .schemas
            .entry((fg_name.to_string(), 1))
            .or_default();
        entry.fields.push(crate::dal::AvroField {
            name: feature_name.to_string(),
            schema_json: schema_json.to_string(),
        });
    }

    /// Simulate a deleted feature group for the named feature.
    pub fn zero_feature_group(&mut self, feature_name: &str) {
        for features in self.features.values_mut() {
            for feature in features.iter_mut() {
                if feature.name == feature_name {
                    feature.feature_group_id = 0;
                }
            }
        }
    }
}

impl MetadataBackend for MockMetadataBackend {
    fn find_feature_store_id(&self, fs_name: &str) -> Result<i32, DalError> {
        self.feature_stores
            .get(fs_name)
            .copied()
            .ok_or(DalError::NotFound)
    }

    fn find_feature_view_id(
        &self,
        fs_id: i32,
        fv_name: &str,
        fv_version: i32,
    ) -> Result<i32, DalError> {
        self.feature_views
            .get(&(fs_id, fv_name.to_string(), fv_version))
            .copied()
            .ok_or(DalError::NotFound)
    }

    fn find_training_dataset_joins(
        &self,
        fv_id: i32,
    ) -> Result<Vec<TrainingDatasetJoin>, DalError> {
        self.joins.get(&fv_id).cloned().ok_or(DalError::NotFound)
    }

    fn find_training_dataset_features(
        &self,
        fv_id: i32,
    ) -> Result<Vec<TrainingDatasetFeature>, DalError> {
        self.features.get(&fv_id).cloned().ok_or(DalError::NotFound)
    }

    fn find_feature_group(&self, fg_id: i32) -> Result<FeatureGroupRow, DalError> {
        self.feature_groups
            .get(&fg_id)
            .cloned()
            .ok_or(DalError::NotFound)
    }

    fn find_feature_store_name(&self, fs_id: i32) -> Result<String, DalError> {
        self.feature_store_names
            .get(&fs_id)
            .cloned()
            .ok_or(DalError::NotFound)
    }

    fn find_serving_keys(&self, fv_id: i32) -> Result<Vec<ServingKeyRow>, DalError> {
        self.serving_keys
            .get(&fv_id)
            .cloned()
            .ok_or(DalError::NotFound)
    }

    fn find_project_id(&self, fs_name: &str) -> Result<i32, DalError> {
        self.projects
            .get(fs_name)
            .copied()
            .ok_or(DalError::NotFound)
    }

    fn find_feature_group_schema(
        &self,
        fg_name: &str,
        fg_version: i32,
        _project_id: i32,
    ) -> Result<FeatureGroupAvroSchema, DalError> {
        self.schemas
            .get(&(fg_name.to_string(), fg_version))
            .cloned()
            .ok_or(DalError::NotFound)
    }
}

/// A feature view joining two feature groups on `pk`: `fg1` (columns `pk`,
/// `a`, `b` and a label) and `fg2` (column `c`). Output order is
/// `[a, b, c, pk]`.
pub fn two_group_backend() -> MockMetadataBackend {
    let mut backend = MockMetadataBackend::default();
    backend.feature_stores.insert("fs".to_string(), 1);
    backend.feature_store_names.insert(1, "fs".to_string());
    backend.projects.insert("fs".to_string(), 100);
    backend
        .feature_views
        .insert((1, "fv".to_string(), 1), 10);
    backend.joins.insert(
        10,
        vec![
            TrainingDatasetJoin {
                id: 100,
                prefix: String::new(),
                index: 0,
            },
            TrainingDatasetJoin {
                id: 101,
                prefix: String::new(),
                index: 1,
            },
        ],
    );
    backend.feature_groups.insert(
        21,
        FeatureGroupRow {
            name: "fg1".to_string(),
            feature_store_id: 1,
            version: 1,
            online_enabled: true,
        },
    );
    backend.feature_groups.insert(
        22,
        FeatureGroupRow {
            name: "fg2".to_string(),
            feature_store_id: 1,
            version: 1,
            online_enabled: true,
        },
    );
    let feature = |id: i32, fg: i32, name: &str, join: i32, idx: i32, label: bool| {
        TrainingDatasetFeature {
            feature_id: id,
            feature_group_id: fg,
            name: name.to_string(),
            data_type: "bigint".to_string(),
            td_join_id: join,
            idx,
            label,
        }
    };
    backend.features.insert(
        10,
        vec![
            feature(1, 21, "a", 100, 0, false),
            feature(2, 21, "b", 100, 1, false),
            feature(3, 22, "c", 101, 2, false),
            feature(4, 21, "pk", 100, 3, false),
            feature(5, 21, "lbl", 100, 4, true),
        ],
    );
    backend.serving_keys.insert(
        10,
        vec![
            ServingKeyRow {
                feature_group_id: 21,
                feature_name: "pk".to_string(),
                prefix: String::new(),
                required: true,
                join_on: String::new(),
                join_index: 0,
            },
            ServingKeyRow {
                feature_group_id: 22,
                feature_name: "pk".to_string(),
                prefix: String::new(),
                required: false,
                join_on: "pk".to_string(),
                join_index: 1,
            },
        ],
    );
    backend
}

// ---- Data client --------------------------------------------------------

type RowKey = (String, String, String);

/// Speaks the native wire format end to end: decodes request buffers, looks
/// rows up by the first filter value, and encodes responses.
#[derive(Default)]
pub struct MockDataClient {
    rows: Mutex<HashMap<RowKey, Vec<(String, String, u32)>>>,
}

impl MockDataClient {
    /// Insert a row addressed by the JSON text of its key; values are
    /// numeric column values.
    pub fn insert_row(&self, db: &str, table: &str, key: &str, columns: &[(&str, &str)]) {
        self.rows.lock().insert(
            (db.to_string(), table.to_string(), key.to_string()),
            columns
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string(), DATA_TYPE_NUMBER))
                .collect(),
        );
    }

    /// Insert a string-typed column value (stored unquoted; quoting happens
    /// in response processing).
    pub fn insert_string_value(&self, db: &str, table: &str, key: &str, column: &str, value: &str) {
        let mut rows = self.rows.lock();
        let row = rows
            .entry((db.to_string(), table.to_string(), key.to_string()))
            .or_default();
        row.push((column.to_string(), value.to_string(), DATA_TYPE_STRING));
    }
}

impl DataClient for MockDataClient {
    fn pk_batch_read(
        &self,
        requests: &[RsBuffer],
        responses: &mut [RsBuffer],
    ) -> Result<(), DalError> {
        assert_eq!(requests.len(), responses.len());
        let rows = self.rows.lock();
        for (req, resp) in requests.iter().zip(responses.iter_mut()) {
            let decoded = decode_native_request(req)?;
            let key = decoded
                .filters
                .first()
                .map(|(_, value)| String::from_utf8_lossy(value).to_string())
                .unwrap_or_default();
            let row = rows.get(&(decoded.db.clone(), decoded.table.clone(), key));
            match row {
                Some(row) => {
                    let columns: Vec<ResponseColumn> = decoded
                        .read_columns
                        .iter()
                        .map(|col| {
                            match row.iter().find(|(name, _, _)| name == col) {
                                Some((name, value, data_type)) => ResponseColumn {
                                    name: name.clone(),
                                    value: Some(value.clone().into_bytes()),
                                    data_type: *data_type,
                                },
                                None => ResponseColumn {
                                    name: col.clone(),
                                    value: None,
                                    data_type: DATA_TYPE_NUMBER,
                                },
                            }
                        })
                        .collect();
                    create_native_response(
                        resp,
                        200,
                        decoded.operation_id.as_deref(),
                        &columns,
                        None,
                    )?;
                }
                None => {
                    create_native_response(
                        resp,
                        404,
                        decoded.operation_id.as_deref(),
                        &[],
                        Some("Not Found"),
                    )?;
                }
            }
        }
        Ok(())
    }

    fn stats(&self) -> RonDbStats {
        RonDbStats {
            connected: true,
            ..Default::default()
        }
    }
}

// ---- Aggregation client -------------------------------------------------

#[derive(Default)]
pub struct MockAggClient {
    schemas: Mutex<HashMap<(String, String), TableSchema>>,
    results: Mutex<HashMap<String, Vec<AggResultRecord>>>,
    last_request: Mutex<Option<AggScanRequest>>,
    schema_lookups: AtomicUsize,
}

impl MockAggClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, db: &str, table: &str, columns: &[&str], indexes: &[(&str, &str)]) {
        self.schemas.lock().insert(
            (db.to_string(), table.to_string()),
            TableSchema {
                columns: columns
                    .iter()
                    .enumerate()
                    .map(|(i, name)| ColumnDef {
                        name: name.to_string(),
                        attr_id: i as i32,
                    })
                    .collect(),
                indexes: indexes
                    .iter()
                    .map(|(name, first_column)| OrderedIndex {
                        name: name.to_string(),
                        first_column: first_column.to_string(),
                        online: true,
                    })
                    .collect(),
            },
        );
    }

    pub fn add_group_result(&self, table: &str, groups: Vec<ScanValue>, aggs: Vec<AggValue>) {
        self.results
            .lock()
            .entry(table.to_string())
            .or_default()
            .push(AggResultRecord {
                group_columns: groups,
                aggregates: aggs,
            });
    }

    pub fn last_request(&self) -> Option<AggScanRequest> {
        self.last_request.lock().clone()
    }

    pub fn schema_lookups(&self) -> usize {
        self.schema_lookups.load(Ordering::Acquire)
    }
}

impl AggClient for MockAggClient {
    fn table_schema(&self, db: &str, table: &str) -> Result<TableSchema, DalError> {
        self.schema_lookups.fetch_add(1, Ordering::AcqRel);
        self.schemas
            .lock()
            .get(&(db.to_string(), table.to_string()))
            .cloned()
            .ok_or(DalError::NotFound)
    }

    fn scan(&self, request: &AggScanRequest) -> Result<Vec<AggResultRecord>, DalError> {
        *self.last_request.lock() = Some(request.clone());
        Ok(self
            .results
            .lock()
            .get(&request.table)
            .cloned()
            .unwrap_or_default())
    }
}

// ---- Assembled core -----------------------------------------------------

/// Config sized for tests: small buffers, short cache windows, API keys off.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.internal.req_buffer_size = 16 * 1024;
    config.internal.resp_buffer_size = 16 * 1024;
    config.internal.pre_allocated_buffers = 4;
    config.security.api_key.use_api_keys = false;
    config.security.api_key.cache_refresh_interval_ms = 100;
    config.security.api_key.cache_unused_entries_eviction_ms = 1_000;
    config.security.api_key.cache_refresh_interval_jitter_ms = 10;
    config
}

/// A fully wired [`FeatureStoreCore`] over the two-group fixture and an
/// empty data store. Returns the data client for row seeding.
pub fn test_core() -> (FeatureStoreCore, Arc<MockDataClient>) {
    let config = Arc::new(test_config());
    let settings: CacheSettings = config.security.api_key.cache_settings();
    let data_client = Arc::new(MockDataClient::default());
    let auth_backend = Arc::new(MockAuthBackend::default());
    let core = FeatureStoreCore {
        config: Arc::clone(&config),
        metadata_cache: FsMetadataCache::new(settings),
        metadata_backend: Arc::new(two_group_backend()),
        api_key_cache: ApiKeyCache::new(auth_backend, settings),
        data_client: Arc::clone(&data_client) as Arc<dyn DataClient>,
        buffer_pool: Arc::new(BufferPool::new(
            config.internal.req_buffer_size as usize,
            config.internal.resp_buffer_size as usize,
            config.internal.pre_allocated_buffers as usize,
        )),
    };
    (core, data_client)
}
