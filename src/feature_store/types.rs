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

//! JSON request and response shapes of the feature-vector endpoints.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use strum::Display;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataOptions {
    #[serde(default)]
    pub feature_name: bool,
    #[serde(default)]
    pub feature_type: bool,
}

impl MetadataOptions {
    pub fn any(&self) -> bool {
        self.feature_name || self.feature_type
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    #[serde(default = "default_true")]
    pub validate_passed_features: bool,
    #[serde(default)]
    pub include_detailed_status: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            validate_passed_features: true,
            include_detailed_status: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStoreRequest {
    pub feature_store_name: String,
    pub feature_view_name: String,
    pub feature_view_version: i32,
    #[serde(default)]
    pub entries: HashMap<String, Value>,
    #[serde(default)]
    pub passed_features: HashMap<String, Value>,
    #[serde(default, rename = "metadataOptions")]
    pub metadata_request: MetadataOptions,
    #[serde(default)]
    pub options: RequestOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFeatureStoreRequest {
    pub feature_store_name: String,
    pub feature_view_name: String,
    pub feature_view_version: i32,
    #[serde(default)]
    pub entries: Vec<HashMap<String, Value>>,
    #[serde(default)]
    pub passed_features: Vec<HashMap<String, Value>>,
    #[serde(default, rename = "metadataOptions")]
    pub metadata_request: MetadataOptions,
    #[serde(default)]
    pub options: RequestOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum FeatureStatus {
    Complete,
    Missing,
    Error,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FeatureMetadataItem {
    #[serde(rename = "featureName", skip_serializing_if = "Option::is_none")]
    pub feature_name: Option<String>,
    #[serde(rename = "featureType", skip_serializing_if = "Option::is_none")]
    pub feature_type: Option<String>,
}

/// One output slot: the raw JSON literal for the value, or `null`.
pub type FeatureValue = Option<Box<RawValue>>;

#[derive(Debug, Serialize)]
pub struct FeatureStoreResponse {
    pub features: Vec<FeatureValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<FeatureMetadataItem>>,
    pub status: FeatureStatus,
}

#[derive(Debug, Serialize)]
pub struct BatchFeatureStoreResponse {
    pub features: Vec<Vec<FeatureValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<FeatureMetadataItem>>,
    pub status: Vec<FeatureStatus>,
}

/// Convert a raw JSON byte slot into the serializable form.
pub fn raw_feature_value(bytes: Option<Vec<u8>>) -> FeatureValue {
    let bytes = bytes?;
    let text = String::from_utf8(bytes).ok()?;
    RawValue::from_string(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_with_defaults() {
        let req: FeatureStoreRequest = serde_json::from_str(
            r#"{"featureStoreName": "fs", "featureViewName": "fv",
                "featureViewVersion": 1, "entries": {"pk": 42}}"#,
        )
        .unwrap();
        assert_eq!(req.feature_store_name, "fs");
        assert_eq!(req.entries["pk"], serde_json::json!(42));
        assert!(req.passed_features.is_empty());
        assert!(req.options.validate_passed_features);
        assert!(!req.metadata_request.any());
    }

    #[test]
    fn response_serializes_raw_slots() {
        let resp = FeatureStoreResponse {
            features: vec![
                raw_feature_value(Some(b"1".to_vec())),
                None,
                raw_feature_value(Some(b"[1,null,3]".to_vec())),
            ],
            metadata: None,
            status: FeatureStatus::Complete,
        };
        let text = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            text,
            r#"{"features":[1,null,[1,null,3]],"status":"COMPLETE"}"#
        );
    }

    #[test]
    fn status_strings() {
        assert_eq!(FeatureStatus::Complete.to_string(), "COMPLETE");
        assert_eq!(FeatureStatus::Missing.to_string(), "MISSING");
        assert_eq!(FeatureStatus::Error.to_string(), "ERROR");
    }
}
