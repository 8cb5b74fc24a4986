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

//! Orchestration of feature-vector requests: validate, authenticate, fetch
//! metadata, plan, execute, assemble, render.

pub mod planner;
pub mod types;

use std::sync::Arc;

use log::debug;

use crate::cache::api_key::{ApiKeyCache, AuthError};
use crate::cache::fs_cache::{FsLookup, FsMetadataCache};
use crate::config::AppConfig;
use crate::dal::{DataClient, MetadataBackend};
use crate::error::{translate_rondb_error, RestError, INCORRECT_PASSED_FEATURE, INCORRECT_PRIMARY_KEY, NO_PRIMARY_KEY_GIVEN};
use crate::metadata::{fetch_feature_view_metadata, FeatureViewMetadata};
use crate::pkread::encoding::{create_native_request, process_pkread_response, PkReadResponse};
use crate::pkread::PkReadParams;
use crate::buffers::BufferPool;

use types::{
    raw_feature_value, BatchFeatureStoreRequest, BatchFeatureStoreResponse, FeatureStatus,
    FeatureStoreRequest, FeatureStoreResponse, FeatureValue,
};

impl From<AuthError> for RestError {
    fn from(err: AuthError) -> Self {
        RestError {
            code: 0,
            reason: match err {
                AuthError::Client(_) => "Invalid API key.",
                AuthError::Unauthorized(_) => "Access denied.",
                AuthError::Server(_) => "Authentication failed.",
            },
            status: err.status(),
            message: err.to_string(),
        }
    }
}

/// Everything a feature-vector request needs, shared across worker threads.
pub struct FeatureStoreCore {
    pub config: Arc<AppConfig>,
    pub metadata_cache: Arc<FsMetadataCache>,
    pub metadata_backend: Arc<dyn MetadataBackend>,
    pub api_key_cache: Arc<ApiKeyCache>,
    pub data_client: Arc<dyn DataClient>,
    pub buffer_pool: Arc<BufferPool>,
}

impl FeatureStoreCore {
    /// Get-or-populate the feature-view metadata through the cache.
    pub fn get_metadata(
        &self,
        fs_name: &str,
        fv_name: &str,
        fv_version: i32,
    ) -> Result<Arc<FeatureViewMetadata>, RestError> {
        let key = FsMetadataCache::cache_key(fs_name, fv_name, fv_version);
        match self.metadata_cache.get(&key) {
            FsLookup::Hit(meta) => Ok(meta),
            FsLookup::Failed(err) => Err(err),
            FsLookup::MustFill(entry) => {
                let fetched =
                    fetch_feature_view_metadata(&*self.metadata_backend, fs_name, fv_name, fv_version)
                        .map(Arc::new);
                self.metadata_cache.fill(&entry, fetched.clone());
                fetched
            }
        }
    }

    fn authenticate(
        &self,
        api_key: Option<&str>,
        databases: &[String],
    ) -> Result<(), RestError> {
        if !self.config.security.api_key.use_api_keys {
            return Ok(());
        }
        let dbs: Vec<&str> = databases.iter().map(String::as_str).collect();
        self.api_key_cache
            .validate_api_key(api_key.unwrap_or_default(), &dbs)?;
        Ok(())
    }

    /// Encode, submit and parse one batch of PK reads through the pooled
    /// wire buffers.
    fn execute_pk_batch(
        &self,
        params: &[PkReadParams],
    ) -> Result<Vec<PkReadResponse>, RestError> {
        let resp_capacity = self.config.internal.resp_buffer_size;
        let mut requests = Vec::with_capacity(params.len());
        let mut responses = Vec::with_capacity(params.len());
        let mut encode_error = None;
        for param in params {
            let mut req = self.buffer_pool.get_req_buffer();
            if let Err(e) = create_native_request(param, &mut req, resp_capacity) {
                encode_error = Some(translate_rondb_error(400, &e.to_string()));
                self.buffer_pool.return_req_buffer(req);
                break;
            }
            requests.push(req);
            responses.push(self.buffer_pool.get_resp_buffer());
        }

        let parsed = match encode_error {
            Some(err) => Err(err),
            None => match self.data_client.pk_batch_read(&requests, &mut responses) {
                Ok(()) => responses
                    .iter()
                    .map(|resp| {
                        process_pkread_response(resp)
                            .map_err(|e| translate_rondb_error(500, &e.to_string()))
                    })
                    .collect(),
                Err(e) => Err(translate_rondb_error(500, &e.to_string())),
            },
        };
        for req in requests {
            self.buffer_pool.return_req_buffer(req);
        }
        for resp in responses {
            self.buffer_pool.return_resp_buffer(resp);
        }
        parsed
    }

    /// Reject batches where any sub-read failed with something other than
    /// success or row-not-found.
    fn check_rondb_responses(&self, responses: &[PkReadResponse]) -> Result<(), RestError> {
        for response in responses {
            if response.status != 200 && response.status != 404 {
                return Err(translate_rondb_error(response.status as u16, &response.message));
            }
        }
        Ok(())
    }

    /// Single PK read for the generic pk-read endpoint.
    pub fn pk_read(&self, params: &PkReadParams) -> Result<PkReadResponse, RestError> {
        params.validate(self.config.internal.operation_id_max_size as usize)?;
        let responses = self.execute_pk_batch(std::slice::from_ref(params))?;
        Ok(responses.into_iter().next().unwrap_or_default())
    }

    /// Generic batched PK reads; every operation is validated before any of
    /// them is dispatched.
    pub fn pk_batch(&self, params: &[PkReadParams]) -> Result<Vec<PkReadResponse>, RestError> {
        use crate::error::READ_FROM_DB_FAIL_BAD_INPUT;
        if params.is_empty() {
            return Err(READ_FROM_DB_FAIL_BAD_INPUT.message("No operations in batch"));
        }
        if params.len() > self.config.internal.batch_max_size as usize {
            return Err(READ_FROM_DB_FAIL_BAD_INPUT.message(format!(
                "Batch exceeds the maximum of {} operations",
                self.config.internal.batch_max_size
            )));
        }
        let op_id_max = self.config.internal.operation_id_max_size as usize;
        for param in params {
            param.validate(op_id_max)?;
        }
        self.execute_pk_batch(params)
    }

    /// Serve a single feature-vector request.
    pub fn feature_vector(
        &self,
        request: &FeatureStoreRequest,
        api_key: Option<&str>,
    ) -> Result<FeatureStoreResponse, RestError> {
        let meta = self.get_metadata(
            &request.feature_store_name,
            &request.feature_view_name,
            request.feature_view_version,
        )?;

        planner::validate_primary_key(&request.entries, &meta.prefix_primary_key_map)?;
        if request.options.validate_passed_features {
            planner::validate_passed_features(
                &request.passed_features,
                &meta.prefix_features_lookup,
            )?;
        }

        // Access must be allowed to every referenced feature store,
        // shared ones included.
        self.authenticate(api_key, &meta.feature_store_names)?;

        let params = planner::plan_pk_reads(&meta, &request.entries);
        if params.is_empty() {
            return Err(INCORRECT_PRIMARY_KEY.message("Feature store does not exist"));
        }
        let op_id_max = self.config.internal.operation_id_max_size as usize;
        for param in &params {
            param.validate(op_id_max)?;
        }

        let responses = self.execute_pk_batch(&params)?;
        self.check_rondb_responses(&responses)?;

        let refs: Vec<&PkReadResponse> = responses.iter().collect();
        let (mut features, status, err) =
            planner::assemble_vector(&refs, &request.entries, &meta);
        if let Some(err) = err {
            debug!("feature vector assembly error: {err}");
            return Err(err);
        }
        planner::fill_passed_features(&mut features, &request.passed_features, &meta);

        let metadata = request
            .metadata_request
            .any()
            .then(|| planner::feature_metadata_array(&meta, &request.metadata_request));
        Ok(FeatureStoreResponse {
            features: into_raw_values(features),
            metadata,
            status,
        })
    }

    /// Serve a batch feature-vector request. The response is 200 with
    /// per-entry statuses even when individual entries are missing or in
    /// error; only backend failures surface as HTTP errors.
    pub fn batch_feature_vector(
        &self,
        request: &BatchFeatureStoreRequest,
        api_key: Option<&str>,
    ) -> Result<BatchFeatureStoreResponse, RestError> {
        let meta = self.get_metadata(
            &request.feature_store_name,
            &request.feature_view_name,
            request.feature_view_version,
        )?;

        if request.entries.is_empty() {
            return Err(NO_PRIMARY_KEY_GIVEN.error());
        }
        if !request.passed_features.is_empty()
            && request.passed_features.len() != request.entries.len()
        {
            return Err(INCORRECT_PASSED_FEATURE.message(
                "Length of passed feature does not equal to that of the entries provided in the request.",
            ));
        }

        self.authenticate(api_key, &meta.feature_store_names)?;

        let mut status = vec![FeatureStatus::Complete; request.entries.len()];
        planner::check_feature_status(
            &request.entries,
            &request.passed_features,
            request.options.validate_passed_features,
            &meta,
            &mut status,
        );
        let params = planner::plan_batch_pk_reads(&meta, &request.entries, &status);

        let mut features: Vec<Vec<Option<Vec<u8>>>> =
            vec![vec![None; meta.num_of_features]; request.entries.len()];
        if !params.is_empty() {
            let op_id_max = self.config.internal.operation_id_max_size as usize;
            for param in &params {
                param.validate(op_id_max)?;
            }
            let responses = self.execute_pk_batch(&params)?;
            self.check_rondb_responses(&responses)?;
            let grouped = planner::group_batch_responses(responses, request.entries.len())?;
            for (i, entry_responses) in grouped.iter().enumerate() {
                if entry_responses.is_empty() {
                    continue;
                }
                let refs: Vec<&PkReadResponse> = entry_responses.iter().collect();
                let (entry_features, entry_status, _) =
                    planner::assemble_vector(&refs, &request.entries[i], &meta);
                features[i] = entry_features;
                status[i] = entry_status;
            }
        }

        if !request.passed_features.is_empty() {
            for (i, passed) in request.passed_features.iter().enumerate() {
                if status[i] != FeatureStatus::Error {
                    planner::fill_passed_features(&mut features[i], passed, &meta);
                }
            }
        }

        let metadata = request
            .metadata_request
            .any()
            .then(|| planner::feature_metadata_array(&meta, &request.metadata_request));
        Ok(BatchFeatureStoreResponse {
            features: features.into_iter().map(into_raw_values).collect(),
            metadata,
            status,
        })
    }
}

fn into_raw_values(features: Vec<Option<Vec<u8>>>) -> Vec<FeatureValue> {
    features.into_iter().map(raw_feature_value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_core;
    use serde_json::json;
    use std::collections::HashMap;

    fn single_request() -> FeatureStoreRequest {
        serde_json::from_value(json!({
            "featureStoreName": "fs",
            "featureViewName": "fv",
            "featureViewVersion": 1,
            "entries": {"pk": 42}
        }))
        .unwrap()
    }

    #[test]
    fn single_feature_vector_end_to_end() {
        let (core, data) = test_core();
        data.insert_row("fs", "fg1_1", "42", &[("a", "1"), ("b", "2")]);
        data.insert_row("fs", "fg2_1", "42", &[("c", "3")]);

        let resp = core.feature_vector(&single_request(), None).unwrap();
        assert_eq!(resp.status, FeatureStatus::Complete);
        let body = serde_json::to_string(&resp).unwrap();
        assert_eq!(body, r#"{"features":[1,2,3,42],"status":"COMPLETE"}"#);
        core.metadata_cache.cleanup();
        core.api_key_cache.cleanup();
    }

    #[test]
    fn missing_row_is_reported_not_failed() {
        let (core, data) = test_core();
        data.insert_row("fs", "fg1_1", "42", &[("a", "1"), ("b", "2")]);
        // fg2 has no row for pk 42.
        let resp = core.feature_vector(&single_request(), None).unwrap();
        assert_eq!(resp.status, FeatureStatus::Missing);
        core.metadata_cache.cleanup();
        core.api_key_cache.cleanup();
    }

    #[test]
    fn metadata_options_populate_metadata() {
        let (core, data) = test_core();
        data.insert_row("fs", "fg1_1", "42", &[("a", "1"), ("b", "2")]);
        data.insert_row("fs", "fg2_1", "42", &[("c", "3")]);
        let mut request = single_request();
        request.metadata_request.feature_name = true;
        request.metadata_request.feature_type = true;
        let resp = core.feature_vector(&request, None).unwrap();
        let metadata = resp.metadata.unwrap();
        assert_eq!(metadata.len(), 4);
        assert_eq!(metadata[0].feature_name.as_deref(), Some("a"));
        assert_eq!(metadata[3].feature_name.as_deref(), Some("pk"));
        core.metadata_cache.cleanup();
        core.api_key_cache.cleanup();
    }

    #[test]
    fn batch_zero_entries_is_rejected() {
        let (core, _) = test_core();
        let request: BatchFeatureStoreRequest = serde_json::from_value(json!({
            "featureStoreName": "fs",
            "featureViewName": "fv",
            "featureViewVersion": 1,
            "entries": []
        }))
        .unwrap();
        let err = core.batch_feature_vector(&request, None).unwrap_err();
        assert_eq!(err.code, NO_PRIMARY_KEY_GIVEN.code);
        core.metadata_cache.cleanup();
        core.api_key_cache.cleanup();
    }

    #[test]
    fn batch_passed_feature_length_mismatch() {
        let (core, _) = test_core();
        let request: BatchFeatureStoreRequest = serde_json::from_value(json!({
            "featureStoreName": "fs",
            "featureViewName": "fv",
            "featureViewVersion": 1,
            "entries": [{"pk": 1}, {"pk": 2}],
            "passedFeatures": [{"a": 5}]
        }))
        .unwrap();
        let err = core.batch_feature_vector(&request, None).unwrap_err();
        assert_eq!(err.code, INCORRECT_PASSED_FEATURE.code);
        core.metadata_cache.cleanup();
        core.api_key_cache.cleanup();
    }

    #[test]
    fn batch_mixes_statuses_per_entry() {
        let (core, data) = test_core();
        data.insert_row("fs", "fg1_1", "1", &[("a", "10"), ("b", "20")]);
        data.insert_row("fs", "fg2_1", "1", &[("c", "30")]);
        // pk 2 exists nowhere; third entry has a bad key.
        let request: BatchFeatureStoreRequest = serde_json::from_value(json!({
            "featureStoreName": "fs",
            "featureViewName": "fv",
            "featureViewVersion": 1,
            "entries": [{"pk": 1}, {"pk": 2}, {"nope": 3}]
        }))
        .unwrap();
        let resp = core.batch_feature_vector(&request, None).unwrap();
        assert_eq!(
            resp.status,
            vec![
                FeatureStatus::Complete,
                FeatureStatus::Missing,
                FeatureStatus::Error
            ]
        );
        let body = serde_json::to_value(&resp).unwrap();
        assert_eq!(body["features"][0], json!([10, 20, 30, 1]));
        assert_eq!(body["features"][2], json!([null, null, null, null]));
        core.metadata_cache.cleanup();
        core.api_key_cache.cleanup();
    }

    #[test]
    fn passed_features_bypass_reads() {
        let (core, data) = test_core();
        data.insert_row("fs", "fg1_1", "42", &[("a", "1"), ("b", "2")]);
        data.insert_row("fs", "fg2_1", "42", &[("c", "3")]);
        let mut request = single_request();
        request
            .passed_features
            .insert("b".to_string(), json!(99));
        let resp = core.feature_vector(&request, None).unwrap();
        let body = serde_json::to_string(&resp).unwrap();
        assert_eq!(body, r#"{"features":[1,99,3,42],"status":"COMPLETE"}"#);
        core.metadata_cache.cleanup();
        core.api_key_cache.cleanup();
    }

    #[test]
    fn auth_failure_propagates_as_401() {
        let (core, data) = test_core();
        data.insert_row("fs", "fg1_1", "42", &[("a", "1"), ("b", "2")]);
        let mut config = (*core.config).clone();
        config.security.api_key.use_api_keys = true;
        let core = FeatureStoreCore {
            config: Arc::new(config),
            ..core
        };
        let err = core
            .feature_vector(&single_request(), Some("AAAAAAAAAAAAAAAA.nope"))
            .unwrap_err();
        assert_eq!(err.status, 401);
        core.metadata_cache.cleanup();
        core.api_key_cache.cleanup();
    }
}
