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

//! Feature-view metadata: the read-side model of a feature view.
//!
//! Built once per cache fill from backend rows, then shared immutably by all
//! requests for that view. The lookup maps here define the output vector
//! order, primary-key validation, join-key aliasing and complex-feature
//! decoding for the planner.

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;

use crate::avro::AvroDecoder;
use crate::dal::{DalError, MetadataBackend, ServingKeyRow};
use crate::error::{
    RestError, FG_NOT_EXIST, FG_READ_FAIL, FS_NOT_EXIST, FS_READ_FAIL, FV_NOT_EXIST, FV_READ_FAIL,
    INCORRECT_FEATURE_VALUE, TD_FEATURE_READ_FAIL, TD_JOIN_READ_FAIL,
};

#[derive(Debug, Clone, Default)]
pub struct FeatureMetadata {
    pub feature_store_name: String,
    pub feature_group_name: String,
    pub feature_group_version: i32,
    pub feature_group_id: i32,
    pub id: i32,
    pub name: String,
    pub data_type: String,
    pub index: i32,
    pub label: bool,
    pub prefix: String,
    pub join_index: i32,
}

impl FeatureMetadata {
    /// A feature is complex when the base of its declared type (before any
    /// `<`) is one of the composite Hive types. Complex features are stored
    /// as binary Avro.
    pub fn is_complex(&self) -> bool {
        let base = self
            .data_type
            .split('<')
            .next()
            .unwrap_or_default()
            .to_uppercase();
        matches!(base.as_str(), "MAP" | "ARRAY" | "STRUCT" | "UNIONTYPE")
    }

    pub fn prefixed_name(&self) -> String {
        format!("{}{}", self.prefix, self.name)
    }
}

/// A serving key with its resolved `required_entry`: the request-entry name
/// that carries this key's value.
#[derive(Debug, Clone, Default)]
pub struct ServingKey {
    pub feature_group_id: i32,
    pub feature_name: String,
    pub prefix: String,
    pub required: bool,
    pub join_on: String,
    pub join_index: i32,
    pub required_entry: String,
}

impl ServingKey {
    fn from_row(row: ServingKeyRow) -> Self {
        let required_entry = if row.required {
            format!("{}{}", row.prefix, row.feature_name)
        } else {
            row.join_on.clone()
        };
        ServingKey {
            feature_group_id: row.feature_group_id,
            feature_name: row.feature_name,
            prefix: row.prefix,
            required: row.required,
            join_on: row.join_on,
            join_index: row.join_index,
            required_entry,
        }
    }

    pub fn prefixed_name(&self) -> String {
        format!("{}{}", self.prefix, self.feature_name)
    }
}

/// Features of one referenced feature group, with the serving-key subset
/// that addresses rows in it.
#[derive(Debug, Clone, Default)]
pub struct FeatureGroupFeatures {
    pub feature_store_name: String,
    pub feature_store_id: i32,
    pub feature_group_name: String,
    pub feature_group_version: i32,
    pub feature_group_id: i32,
    pub join_index: i32,
    pub features: Vec<FeatureMetadata>,
    pub primary_key_map: Vec<ServingKey>,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureViewMetadata {
    pub feature_store_name: String,
    pub feature_store_id: i32,
    pub feature_view_name: String,
    pub feature_view_id: i32,
    pub feature_view_version: i32,
    /// prefix+name → feature; labels excluded.
    pub prefix_features_lookup: HashMap<String, FeatureMetadata>,
    pub feature_group_features: Vec<FeatureGroupFeatures>,
    /// Every distinct feature store referenced, shared ones included;
    /// used for authorization.
    pub feature_store_names: Vec<String>,
    pub num_of_features: usize,
    /// `join_index|fg_id|name` → position in the output vector.
    pub feature_index_lookup: HashMap<String, usize>,
    /// `join_index|feature_name` → serving key; used when planning reads.
    pub primary_key_map: HashMap<String, ServingKey>,
    /// Accepted request-entry names (prefixed and bare) → feature-group
    /// column name; used for primary-key validation.
    pub prefix_primary_key_map: HashMap<String, String>,
    /// Entry name → prefixed feature names that receive its value when the
    /// output vector is assembled.
    pub join_key_map: HashMap<String, Vec<String>>,
    /// `join_index|fg_id|name` → decoder, for complex columns only.
    pub complex_features: HashMap<String, AvroDecoder>,
}

pub fn feature_group_key(join_index: i32, fg_id: i32) -> String {
    format!("{join_index}|{fg_id}")
}

pub fn serving_key_of(join_index: i32, feature_name: &str) -> String {
    format!("{join_index}|{feature_name}")
}

pub fn feature_index_key_by_fg(fg_key: &str, feature_name: &str) -> String {
    format!("{fg_key}|{feature_name}")
}

pub fn feature_index_key(join_index: i32, fg_id: i32, feature_name: &str) -> String {
    feature_index_key_by_fg(&feature_group_key(join_index, fg_id), feature_name)
}

pub fn feature_index_key_of(feature: &FeatureMetadata) -> String {
    feature_index_key(feature.join_index, feature.feature_group_id, &feature.name)
}

/// Assemble the metadata aggregate from resolved features and serving keys.
/// The schema lookup is only invoked for complex features, once per feature
/// group.
pub fn new_feature_view_metadata(
    feature_store_name: &str,
    feature_store_id: i32,
    feature_view_name: &str,
    feature_view_id: i32,
    feature_view_version: i32,
    features: &[FeatureMetadata],
    serving_keys: Vec<ServingKey>,
    backend: &dyn MetadataBackend,
) -> Result<FeatureViewMetadata, RestError> {
    let mut primary_key_map = HashMap::new();
    let mut fg_primary_key_map: HashMap<String, Vec<ServingKey>> = HashMap::new();
    let mut prefix_primary_key_map = HashMap::new();
    let mut join_key_map: HashMap<String, Vec<String>> = HashMap::new();

    for key in &serving_keys {
        let prefixed = key.prefixed_name();
        prefix_primary_key_map.insert(prefixed.clone(), key.feature_name.clone());
        prefix_primary_key_map.insert(key.feature_name.clone(), key.feature_name.clone());

        // Both the bare and the prefixed spelling of the entry alias to the
        // prefixed column slot.
        let aliases = join_key_map.entry(key.feature_name.clone()).or_default();
        if !aliases.contains(&prefixed) {
            aliases.push(prefixed.clone());
        }
        let aliases = join_key_map.entry(prefixed.clone()).or_default();
        if !aliases.contains(&prefixed) {
            aliases.push(prefixed.clone());
        }

        primary_key_map.insert(serving_key_of(key.join_index, &key.feature_name), key.clone());
        fg_primary_key_map
            .entry(feature_group_key(key.join_index, key.feature_group_id))
            .or_default()
            .push(key.clone());
    }

    let mut prefix_features_lookup = HashMap::new();
    let mut fg_features: BTreeMap<(i32, i32), Vec<FeatureMetadata>> = BTreeMap::new();
    for feature in features {
        if feature.label {
            continue;
        }
        prefix_features_lookup.insert(feature.prefixed_name(), feature.clone());
        fg_features
            .entry((feature.join_index, feature.feature_group_id))
            .or_default()
            .push(feature.clone());
    }

    let mut feature_group_features = Vec::with_capacity(fg_features.len());
    for ((join_index, fg_id), group) in fg_features {
        let first = &group[0];
        let fg_key = feature_group_key(join_index, fg_id);
        feature_group_features.push(FeatureGroupFeatures {
            feature_store_name: first.feature_store_name.clone(),
            feature_store_id,
            feature_group_name: first.feature_group_name.clone(),
            feature_group_version: first.feature_group_version,
            feature_group_id: fg_id,
            join_index,
            primary_key_map: fg_primary_key_map.get(&fg_key).cloned().unwrap_or_default(),
            features: group,
        });
    }

    // The output vector order is the training-dataset index order with
    // labels excluded; positions are contiguous from zero.
    let mut feature_index_lookup = HashMap::new();
    let sorted = features
        .iter()
        .filter(|f| !f.label)
        .sorted_by_key(|f| f.index);
    for (position, feature) in sorted.enumerate() {
        feature_index_lookup.insert(feature_index_key_of(feature), position);
    }

    let mut complex_features = HashMap::new();
    let mut fg_schema_cache = HashMap::new();
    for fgf in &feature_group_features {
        for feature in &fgf.features {
            if !feature.is_complex() {
                continue;
            }
            if !fg_schema_cache.contains_key(&feature.feature_group_id) {
                let project_id = backend
                    .find_project_id(&feature.feature_store_name)
                    .map_err(|e| FS_READ_FAIL.message(e.to_string()))?;
                let schema = backend
                    .find_feature_group_schema(
                        &fgf.feature_group_name,
                        fgf.feature_group_version,
                        project_id,
                    )
                    .map_err(|e| FG_READ_FAIL.message(e.to_string()))?;
                fg_schema_cache.insert(feature.feature_group_id, schema);
            }
            let schema = &fg_schema_cache[&feature.feature_group_id];
            let feature_schema = schema.schema_for_feature(&feature.name).ok_or_else(|| {
                INCORRECT_FEATURE_VALUE
                    .message(format!("Cannot find schema for feature {}", feature.name))
            })?;
            let decoder = AvroDecoder::new(feature_schema)
                .map_err(|_| INCORRECT_FEATURE_VALUE.message("Failed to parse feature schema."))?;
            complex_features.insert(feature_index_key_of(feature), decoder);
        }
    }

    let mut feature_store_names: Vec<String> = Vec::new();
    for fgf in &feature_group_features {
        if !feature_store_names.contains(&fgf.feature_store_name) {
            feature_store_names.push(fgf.feature_store_name.clone());
        }
    }
    if !feature_store_names.iter().any(|n| n == feature_store_name) {
        feature_store_names.push(feature_store_name.to_string());
    }

    Ok(FeatureViewMetadata {
        feature_store_name: feature_store_name.to_string(),
        feature_store_id,
        feature_view_name: feature_view_name.to_string(),
        feature_view_id,
        feature_view_version,
        prefix_features_lookup,
        feature_group_features,
        feature_store_names,
        num_of_features: feature_index_lookup.len(),
        feature_index_lookup,
        primary_key_map,
        prefix_primary_key_map,
        join_key_map,
        complex_features,
    })
}

fn not_found(err: &DalError) -> bool {
    matches!(err, DalError::NotFound)
}

/// Fetch and assemble the metadata for one feature view. This is the cache
/// fill path; every backend failure is mapped onto the stable error
/// catalogue before it is cached.
pub fn fetch_feature_view_metadata(
    backend: &dyn MetadataBackend,
    fs_name: &str,
    fv_name: &str,
    fv_version: i32,
) -> Result<FeatureViewMetadata, RestError> {
    let fs_id = backend.find_feature_store_id(fs_name).map_err(|e| {
        if not_found(&e) {
            FS_NOT_EXIST.error()
        } else {
            FS_READ_FAIL.message(e.to_string())
        }
    })?;
    let fv_id = backend
        .find_feature_view_id(fs_id, fv_name, fv_version)
        .map_err(|e| {
            if not_found(&e) {
                FV_NOT_EXIST.error()
            } else {
                FV_READ_FAIL.message(e.to_string())
            }
        })?;
    let td_joins = backend.find_training_dataset_joins(fv_id).map_err(|e| {
        if not_found(&e) {
            FG_NOT_EXIST.message("Feature view may contain deleted feature groups.")
        } else {
            TD_JOIN_READ_FAIL.message(e.to_string())
        }
    })?;
    let join_by_id: HashMap<i32, _> = td_joins.into_iter().map(|j| (j.id, j)).collect();
    let td_features = backend.find_training_dataset_features(fv_id).map_err(|e| {
        if not_found(&e) {
            FG_NOT_EXIST.message("Feature view may contain deleted feature groups.")
        } else {
            TD_FEATURE_READ_FAIL.message(e.to_string())
        }
    })?;

    let mut features = Vec::with_capacity(td_features.len());
    let mut fg_cache = HashMap::new();
    let mut fs_name_cache: HashMap<i32, String> = HashMap::new();
    for tdf in td_features {
        if tdf.feature_group_id == 0 {
            return Err(FG_NOT_EXIST.message(format!(
                "Cannot get the feature group of feature `{}`. Check if the feature group still exists.",
                tdf.name
            )));
        }
        if !fg_cache.contains_key(&tdf.feature_group_id) {
            let fg = backend.find_feature_group(tdf.feature_group_id).map_err(|e| {
                if not_found(&e) {
                    FG_NOT_EXIST.error()
                } else {
                    FG_READ_FAIL.message(e.to_string())
                }
            })?;
            fg_cache.insert(tdf.feature_group_id, fg);
        }
        let fg = &fg_cache[&tdf.feature_group_id];
        if !fs_name_cache.contains_key(&fg.feature_store_id) {
            let name = backend.find_feature_store_name(fg.feature_store_id).map_err(|e| {
                if not_found(&e) {
                    FS_NOT_EXIST.error()
                } else {
                    FS_READ_FAIL.message(e.to_string())
                }
            })?;
            fs_name_cache.insert(fg.feature_store_id, name);
        }
        let join = join_by_id.get(&tdf.td_join_id);
        features.push(FeatureMetadata {
            feature_store_name: fs_name_cache[&fg.feature_store_id].clone(),
            feature_group_name: fg.name.clone(),
            feature_group_version: fg.version,
            feature_group_id: tdf.feature_group_id,
            id: tdf.feature_id,
            name: tdf.name,
            data_type: tdf.data_type,
            index: tdf.idx,
            label: tdf.label,
            prefix: join.map(|j| j.prefix.clone()).unwrap_or_default(),
            join_index: join.map(|j| j.index).unwrap_or_default(),
        });
    }

    let serving_keys = backend
        .find_serving_keys(fv_id)
        .map_err(|_| FV_READ_FAIL.message("Failed to read serving keys."))?
        .into_iter()
        .map(ServingKey::from_row)
        .collect::<Vec<_>>();

    new_feature_view_metadata(
        fs_name,
        fs_id,
        fv_name,
        fv_id,
        fv_version,
        &features,
        serving_keys,
        backend,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{two_group_backend, MockMetadataBackend};

    #[test]
    fn complex_detection_uses_base_type() {
        let mut f = FeatureMetadata {
            data_type: "array<bigint>".to_string(),
            ..Default::default()
        };
        assert!(f.is_complex());
        f.data_type = "ARRAY".to_string();
        assert!(f.is_complex());
        f.data_type = "struct<a:int>".to_string();
        assert!(f.is_complex());
        f.data_type = "bigint".to_string();
        assert!(!f.is_complex());
    }

    #[test]
    fn builds_contiguous_feature_index() {
        let backend = two_group_backend();
        let meta = fetch_feature_view_metadata(&backend, "fs", "fv", 1).unwrap();
        // Output positions are contiguous [0, N).
        let mut positions: Vec<usize> = meta.feature_index_lookup.values().copied().collect();
        positions.sort_unstable();
        assert_eq!(positions, (0..meta.num_of_features).collect::<Vec<_>>());
        assert_eq!(meta.num_of_features, 4);
        // Labels never occupy an output slot.
        assert!(meta
            .feature_index_lookup
            .keys()
            .all(|k| !k.ends_with("|lbl")));
    }

    #[test]
    fn serving_keys_feed_all_lookup_maps() {
        let backend = two_group_backend();
        let meta = fetch_feature_view_metadata(&backend, "fs", "fv", 1).unwrap();
        assert!(meta.prefix_primary_key_map.contains_key("pk"));
        assert!(meta.primary_key_map.contains_key("0|pk"));
        assert!(meta.primary_key_map.contains_key("1|pk"));
        let aliases = meta.join_key_map.get("pk").unwrap();
        assert!(aliases.contains(&"pk".to_string()));
        assert_eq!(meta.feature_store_names, vec!["fs".to_string()]);
    }

    #[test]
    fn rebuild_from_same_rows_is_deterministic() {
        let backend = two_group_backend();
        let first = fetch_feature_view_metadata(&backend, "fs", "fv", 1).unwrap();
        let second = fetch_feature_view_metadata(&backend, "fs", "fv", 1).unwrap();
        assert_eq!(first.feature_index_lookup, second.feature_index_lookup);
        assert_eq!(
            first
                .feature_group_features
                .iter()
                .map(|f| (f.join_index, f.feature_group_id))
                .collect::<Vec<_>>(),
            second
                .feature_group_features
                .iter()
                .map(|f| (f.join_index, f.feature_group_id))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn missing_feature_store_maps_to_not_exist() {
        let backend = MockMetadataBackend::default();
        let err = fetch_feature_view_metadata(&backend, "nope", "fv", 1).unwrap_err();
        assert_eq!(err.code, FS_NOT_EXIST.code);
        assert_eq!(err.status, 404);
    }

    #[test]
    fn deleted_feature_group_is_reported() {
        let mut backend = two_group_backend();
        backend.zero_feature_group("a");
        let err = fetch_feature_view_metadata(&backend, "fs", "fv", 1).unwrap_err();
        assert_eq!(err.code, FG_NOT_EXIST.code);
        assert!(err.message.contains('`'));
    }

    #[test]
    fn complex_feature_gets_decoder() {
        let mut backend = two_group_backend();
        backend.set_feature_type("b", "array<bigint>");
        backend.set_avro_schema(
            "fg1",
            "b",
            r#"["null", {"type": "array", "items": ["null", "long"]}]"#,
        );
        let meta = fetch_feature_view_metadata(&backend, "fs", "fv", 1).unwrap();
        assert_eq!(meta.complex_features.len(), 1);
        let key = meta
            .complex_features
            .keys()
            .next()
            .expect("one complex feature");
        assert!(key.ends_with("|b"));
        assert!(meta.feature_index_lookup.contains_key(key));
    }
}
