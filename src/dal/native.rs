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

//! Native cluster client wiring.
//!
//! The serving core is transport-agnostic; production deployments link the
//! native cluster client behind these types. This build carries the
//! connection lifecycle (connect string, retry configuration, stats) and
//! fails storage operations with a retryable error until the native library
//! is linked in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};

use crate::config::RonDbConfig;

use super::{
    AggClient, AggResultRecord, AggScanRequest, ApiKeyRecord, AuthBackend, DalError, DataClient,
    FeatureGroupAvroSchema, FeatureGroupRow, MetadataBackend, RonDbStats, RsBuffer,
    ServingKeyRow, TableSchema, TrainingDatasetFeature, TrainingDatasetJoin,
};

pub struct NativeClient {
    connect_string: String,
    connected: AtomicBool,
}

impl NativeClient {
    /// Establish the cluster connection described by `config`.
    pub fn connect(config: &RonDbConfig) -> Result<Arc<Self>, DalError> {
        let connect_string = config.connect_string();
        info!(
            "Connecting to management server(s) {connect_string} \
             (pool size {}, retries {})",
            config.connection_pool_size, config.connection_retries
        );
        warn!("native cluster client is not linked in this build; storage operations will fail");
        Ok(Arc::new(NativeClient {
            connect_string,
            connected: AtomicBool::new(false),
        }))
    }

    pub fn connect_string(&self) -> &str {
        &self.connect_string
    }

    fn unavailable<T>(&self) -> Result<T, DalError> {
        Err(DalError::Temporary {
            code: 0,
            message: "native cluster client is not available".to_string(),
        })
    }
}

impl DataClient for NativeClient {
    fn pk_batch_read(
        &self,
        _requests: &[RsBuffer],
        _responses: &mut [RsBuffer],
    ) -> Result<(), DalError> {
        self.unavailable()
    }

    fn stats(&self) -> RonDbStats {
        RonDbStats {
            connected: self.connected.load(Ordering::Acquire),
            ..Default::default()
        }
    }
}

impl AggClient for NativeClient {
    fn table_schema(&self, _db: &str, _table: &str) -> Result<TableSchema, DalError> {
        self.unavailable()
    }

    fn scan(&self, _request: &AggScanRequest) -> Result<Vec<AggResultRecord>, DalError> {
        self.unavailable()
    }
}

impl AuthBackend for NativeClient {
    fn find_api_key(&self, _prefix: &str) -> Result<ApiKeyRecord, DalError> {
        self.unavailable()
    }

    fn find_all_projects(&self, _user_id: i32) -> Result<Vec<String>, DalError> {
        self.unavailable()
    }
}

impl MetadataBackend for NativeClient {
    fn find_feature_store_id(&self, _fs_name: &str) -> Result<i32, DalError> {
        self.unavailable()
    }

    fn find_feature_view_id(
        &self,
        _fs_id: i32,
        _fv_name: &str,
        _fv_version: i32,
    ) -> Result<i32, DalError> {
        self.unavailable()
    }

    fn find_training_dataset_joins(
        &self,
        _fv_id: i32,
    ) -> Result<Vec<TrainingDatasetJoin>, DalError> {
        self.unavailable()
    }

    fn find_training_dataset_features(
        &self,
        _fv_id: i32,
    ) -> Result<Vec<TrainingDatasetFeature>, DalError> {
        self.unavailable()
    }

    fn find_feature_group(&self, _fg_id: i32) -> Result<FeatureGroupRow, DalError> {
        self.unavailable()
    }

    fn find_feature_store_name(&self, _fs_id: i32) -> Result<String, DalError> {
        self.unavailable()
    }

    fn find_serving_keys(&self, _fv_id: i32) -> Result<Vec<ServingKeyRow>, DalError> {
        self.unavailable()
    }

    fn find_project_id(&self, _fs_name: &str) -> Result<i32, DalError> {
        self.unavailable()
    }

    fn find_feature_group_schema(
        &self,
        _fg_name: &str,
        _fg_version: i32,
        _project_id: i32,
    ) -> Result<FeatureGroupAvroSchema, DalError> {
        self.unavailable()
    }
}
