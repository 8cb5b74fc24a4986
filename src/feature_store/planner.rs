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

//! Feature-vector planner: turns a request into primary-key reads and maps
//! the raw responses back into the ordered output vector.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{
    RestError, DESERIALISE_FEATURE_FAIL, FEATURE_NOT_EXIST, INCORRECT_PRIMARY_KEY, WRONG_DATA_TYPE,
};
use crate::metadata::{
    self, feature_index_key_by_fg, feature_index_key_of, serving_key_of, FeatureMetadata,
    FeatureViewMetadata,
};
use crate::pkread::encoding::PkReadResponse;
use crate::pkread::{DataReturnType, PkFilter, PkReadColumn, PkReadParams};

use super::types::{FeatureMetadataItem, FeatureStatus, MetadataOptions};

/// Separates the batch entry index from the feature-group operation id.
pub const SEQUENCE_SEPARATOR: char = '#';

const JSON_NUMBER: &str = "NUMBER";
const JSON_STRING: &str = "STRING";
const JSON_BOOLEAN: &str = "BOOLEAN";
const JSON_NIL: &str = "NIL";
const JSON_OTHER: &str = "OTHER";

/// Primary-key validation: data type checking is delegated to the storage
/// node, only presence and membership are verified here.
pub fn validate_primary_key(
    entries: &HashMap<String, Value>,
    valid_keys: &HashMap<String, String>,
) -> Result<(), RestError> {
    if entries.is_empty() {
        return Err(INCORRECT_PRIMARY_KEY.message("No entries found"));
    }
    for feature_name in entries.keys() {
        if !valid_keys.contains_key(feature_name) {
            return Err(INCORRECT_PRIMARY_KEY.message(format!(
                "Provided primary key `{feature_name}` does not belong to the set of primary keys."
            )));
        }
    }
    Ok(())
}

pub fn validate_passed_features(
    passed_features: &HashMap<String, Value>,
    features: &HashMap<String, FeatureMetadata>,
) -> Result<(), RestError> {
    for (feature_name, value) in passed_features {
        let feature = features.get(feature_name).ok_or_else(|| {
            FEATURE_NOT_EXIST.message(format!(
                "Feature `{feature_name}` does not exist in the feature view or it is a label \
                 which cannot be a passed feature."
            ))
        })?;
        validate_feature_type(value, &feature.data_type)?;
    }
    Ok(())
}

fn validate_feature_type(value: &Value, feature_type: &str) -> Result<(), RestError> {
    let got = json_type(value);
    let expected = map_feature_type_to_json_type(feature_type);
    if got != expected {
        return Err(WRONG_DATA_TYPE.message(format!(
            "Got: '{got}', expected: '{expected}' (offline type: {feature_type})"
        )));
    }
    Ok(())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Number(_) => JSON_NUMBER,
        Value::String(_) => JSON_STRING,
        Value::Bool(_) => JSON_BOOLEAN,
        Value::Null => JSON_NIL,
        _ => JSON_OTHER,
    }
}

fn map_feature_type_to_json_type(feature_type: &str) -> &'static str {
    match feature_type {
        "boolean" => JSON_BOOLEAN,
        "tinyint" | "int" | "smallint" | "bigint" | "float" | "double" | "decimal"
        | "timestamp" => JSON_NUMBER,
        "date" | "string" | "binary" => JSON_STRING,
        _ => JSON_OTHER,
    }
}

/// Plan the primary-key reads for one entry map: one read per feature group,
/// in feature-group iteration order.
pub fn plan_pk_reads(
    meta: &FeatureViewMetadata,
    entries: &HashMap<String, Value>,
) -> Vec<PkReadParams> {
    let mut params = Vec::with_capacity(meta.feature_group_features.len());
    for fgf in &meta.feature_group_features {
        let table = format!("{}_{}", fgf.feature_group_name, fgf.feature_group_version);

        // Read every column that is not a primary key; key columns are
        // reconstructed from the request entries at assembly time.
        let read_columns = fgf
            .features
            .iter()
            .filter(|f| {
                !meta
                    .primary_key_map
                    .contains_key(&serving_key_of(f.join_index, &f.name))
            })
            .map(|f| PkReadColumn {
                column: f.name.clone(),
                return_type: DataReturnType::Default,
            })
            .collect();

        // The original entry may not be required for this feature group;
        // the serving key records which entry carries the value.
        let mut filters = Vec::new();
        for serving_key in &fgf.primary_key_map {
            if let Some(value) = entries.get(&serving_key.required_entry) {
                filters.push(PkFilter {
                    column: serving_key.feature_name.clone(),
                    value: value.to_string().into_bytes(),
                });
            }
        }

        params.push(PkReadParams {
            db: fgf.feature_store_name.clone(),
            table,
            filters,
            read_columns,
            operation_id: metadata::feature_group_key(fgf.join_index, fgf.feature_group_id),
        });
    }
    params
}

/// Pre-validate every batch entry; returns the number of entries that will
/// actually be read. Failed entries keep status Error and are skipped.
pub fn check_feature_status(
    entries: &[HashMap<String, Value>],
    passed_features: &[HashMap<String, Value>],
    validate_passed: bool,
    meta: &FeatureViewMetadata,
    status: &mut [FeatureStatus],
) -> usize {
    let mut failed = 0;
    for (i, entry) in entries.iter().enumerate() {
        if validate_primary_key(entry, &meta.prefix_primary_key_map).is_err() {
            status[i] = FeatureStatus::Error;
        }
    }
    if validate_passed {
        for (i, passed) in passed_features.iter().enumerate() {
            if validate_passed_features(passed, &meta.prefix_features_lookup).is_err() {
                status[i] = FeatureStatus::Error;
            }
        }
    }
    for s in status.iter() {
        if *s == FeatureStatus::Error {
            failed += 1;
        }
    }
    entries.len() - failed
}

/// Plan the whole batch: per-entry PK reads with the entry index prefixed to
/// each operation id.
pub fn plan_batch_pk_reads(
    meta: &FeatureViewMetadata,
    entries: &[HashMap<String, Value>],
    status: &[FeatureStatus],
) -> Vec<PkReadParams> {
    let mut batch = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        if status[i] == FeatureStatus::Error {
            continue;
        }
        for mut param in plan_pk_reads(meta, entry) {
            param.operation_id = format!("{i}{SEQUENCE_SEPARATOR}{}", param.operation_id);
            batch.push(param);
        }
    }
    batch
}

/// Assemble the output vector for one entry from its PK-read responses,
/// decode complex features and reconstruct key columns from the entries.
pub fn assemble_vector(
    responses: &[&PkReadResponse],
    entries: &HashMap<String, Value>,
    meta: &FeatureViewMetadata,
) -> (Vec<Option<Vec<u8>>>, FeatureStatus, Option<RestError>) {
    let mut features: Vec<Option<Vec<u8>>> = vec![None; meta.num_of_features];
    let mut status = FeatureStatus::Complete;
    let mut error = None;

    for response in responses {
        if response.status == 404 {
            status = FeatureStatus::Missing;
        } else if response.status != 200 {
            status = FeatureStatus::Error;
        }
        for (column_name, value) in &response.data {
            let index_key = feature_index_key_by_fg(&response.operation_id, column_name);
            let Some(&position) = meta.feature_index_lookup.get(&index_key) else {
                continue;
            };
            let Some(value) = value else {
                continue;
            };
            if let Some(decoder) = meta.complex_features.get(&index_key) {
                match decode_complex_feature(value, decoder) {
                    Ok(json) => features[position] = Some(json),
                    Err(err) => {
                        status = FeatureStatus::Error;
                        error = Some(DESERIALISE_FEATURE_FAIL.message(format!(
                            "Feature name: {column_name}; {err}"
                        )));
                    }
                }
            } else {
                features[position] = Some(value.clone());
            }
        }
    }

    // Key columns are never read back; their output slots are filled from
    // the request entries through the join-key aliases.
    for (entry_name, value) in entries {
        let Some(aliases) = meta.join_key_map.get(entry_name) else {
            continue;
        };
        for alias in aliases {
            let Some(feature) = meta.prefix_features_lookup.get(alias) else {
                continue;
            };
            let index_key = feature_index_key_of(feature);
            if let Some(&position) = meta.feature_index_lookup.get(&index_key) {
                features[position] = Some(value.to_string().into_bytes());
            }
        }
    }

    (features, status, error)
}

fn decode_complex_feature(
    value: &[u8],
    decoder: &crate::avro::AvroDecoder,
) -> Result<Vec<u8>, RestError> {
    // The wire carries a JSON string whose contents are base64 of the
    // binary Avro datum.
    let wrapped: Value = serde_json::from_slice(value)
        .map_err(|_| DESERIALISE_FEATURE_FAIL.message("Failed to unmarshal JSON value."))?;
    let encoded = wrapped
        .as_str()
        .ok_or_else(|| DESERIALISE_FEATURE_FAIL.message("Failed to unmarshal JSON value."))?;
    use base64::Engine as _;
    let binary = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| DESERIALISE_FEATURE_FAIL.message("Failed to decode base64 value."))?;
    let json = decoder
        .decode_to_json(&binary)
        .map_err(|e| DESERIALISE_FEATURE_FAIL.message(e.to_string()))?;
    Ok(json.into_bytes())
}

/// Overlay caller-supplied features onto the assembled vector. Passed
/// features bypass storage reads entirely.
pub fn fill_passed_features(
    features: &mut [Option<Vec<u8>>],
    passed_features: &HashMap<String, Value>,
    meta: &FeatureViewMetadata,
) {
    for (feature_name, value) in passed_features {
        let Some(feature) = meta.prefix_features_lookup.get(feature_name) else {
            continue;
        };
        let index_key = feature_index_key_of(feature);
        if let Some(&position) = meta.feature_index_lookup.get(&index_key) {
            features[position] = Some(value.to_string().into_bytes());
        }
    }
}

/// Build the response `metadata` array in output-vector order.
pub fn feature_metadata_array(
    meta: &FeatureViewMetadata,
    options: &MetadataOptions,
) -> Vec<FeatureMetadataItem> {
    let mut items = vec![FeatureMetadataItem::default(); meta.num_of_features];
    for (feature_key, feature) in &meta.prefix_features_lookup {
        if let Some(&position) = meta.feature_index_lookup.get(&feature_index_key_of(feature)) {
            let item = &mut items[position];
            if options.feature_name {
                item.feature_name = Some(feature_key.clone());
            }
            if options.feature_type {
                item.feature_type = Some(feature.data_type.clone());
            }
        }
    }
    items
}

/// Split batch responses back into per-entry groups using the sequence
/// prefix on each operation id.
pub fn group_batch_responses(
    responses: Vec<PkReadResponse>,
    n_entries: usize,
) -> Result<Vec<Vec<PkReadResponse>>, RestError> {
    let mut grouped: Vec<Vec<PkReadResponse>> = (0..n_entries).map(|_| Vec::new()).collect();
    for mut response in responses {
        let (seq, op_id) = response
            .operation_id
            .split_once(SEQUENCE_SEPARATOR)
            .ok_or_else(|| {
                DESERIALISE_FEATURE_FAIL.message("Failed to parse sequence number.")
            })?;
        let seq: usize = seq
            .parse()
            .map_err(|_| DESERIALISE_FEATURE_FAIL.message("Failed to parse sequence number."))?;
        if seq >= n_entries {
            return Err(DESERIALISE_FEATURE_FAIL.message("Sequence number out of range."));
        }
        response.operation_id = op_id.to_string();
        grouped[seq].push(response);
    }
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::two_group_backend;
    use serde_json::json;

    fn meta() -> FeatureViewMetadata {
        crate::metadata::fetch_feature_view_metadata(&two_group_backend(), "fs", "fv", 1).unwrap()
    }

    #[test]
    fn plans_one_read_per_feature_group() {
        let meta = meta();
        let entries = HashMap::from([("pk".to_string(), json!(42))]);
        let params = plan_pk_reads(&meta, &entries);
        assert_eq!(params.len(), 2);

        assert_eq!(params[0].db, "fs");
        assert_eq!(params[0].table, "fg1_1");
        assert_eq!(params[0].operation_id, "0|21");
        assert_eq!(
            params[0]
                .filters
                .iter()
                .map(|f| (f.column.as_str(), f.value.as_slice()))
                .collect::<Vec<_>>(),
            vec![("pk", b"42".as_slice())]
        );
        // The key column is filtered on, not read back.
        let cols: Vec<_> = params[0].read_columns.iter().map(|c| c.column.as_str()).collect();
        assert_eq!(cols, vec!["a", "b"]);

        assert_eq!(params[1].table, "fg2_1");
        assert_eq!(params[1].operation_id, "1|22");
        let cols: Vec<_> = params[1].read_columns.iter().map(|c| c.column.as_str()).collect();
        assert_eq!(cols, vec!["c"]);
    }

    #[test]
    fn assembles_vector_in_feature_index_order() {
        let meta = meta();
        let entries = HashMap::from([("pk".to_string(), json!(42))]);

        let mut r1 = PkReadResponse {
            status: 200,
            operation_id: "0|21".to_string(),
            ..Default::default()
        };
        r1.data.insert("a".to_string(), Some(b"1".to_vec()));
        r1.data.insert("b".to_string(), Some(b"2".to_vec()));
        let mut r2 = PkReadResponse {
            status: 200,
            operation_id: "1|22".to_string(),
            ..Default::default()
        };
        r2.data.insert("c".to_string(), Some(b"3".to_vec()));

        let (features, status, err) = assemble_vector(&[&r1, &r2], &entries, &meta);
        assert!(err.is_none());
        assert_eq!(status, FeatureStatus::Complete);
        let rendered: Vec<_> = features
            .iter()
            .map(|f| f.as_ref().map(|b| String::from_utf8_lossy(b).to_string()))
            .collect();
        assert_eq!(
            rendered,
            vec![
                Some("1".to_string()),
                Some("2".to_string()),
                Some("3".to_string()),
                Some("42".to_string()),
            ]
        );
    }

    #[test]
    fn missing_row_downgrades_status() {
        let meta = meta();
        let entries = HashMap::from([("pk".to_string(), json!(42))]);
        let r1 = PkReadResponse {
            status: 404,
            operation_id: "0|21".to_string(),
            ..Default::default()
        };
        let (_, status, _) = assemble_vector(&[&r1], &entries, &meta);
        assert_eq!(status, FeatureStatus::Missing);
    }

    #[test]
    fn unknown_entry_key_is_rejected() {
        let meta = meta();
        let entries = HashMap::from([("who".to_string(), json!(1))]);
        let err = validate_primary_key(&entries, &meta.prefix_primary_key_map).unwrap_err();
        assert_eq!(err.code, INCORRECT_PRIMARY_KEY.code);
        let err = validate_primary_key(&HashMap::new(), &meta.prefix_primary_key_map).unwrap_err();
        assert!(err.message.contains("No entries found"));
    }

    #[test]
    fn passed_feature_type_check() {
        let meta = meta();
        let ok = HashMap::from([("a".to_string(), json!(1))]);
        assert!(validate_passed_features(&ok, &meta.prefix_features_lookup).is_ok());

        let wrong = HashMap::from([("a".to_string(), json!("one"))]);
        let err = validate_passed_features(&wrong, &meta.prefix_features_lookup).unwrap_err();
        assert_eq!(err.status, 415);

        let unknown = HashMap::from([("zz".to_string(), json!(1))]);
        let err = validate_passed_features(&unknown, &meta.prefix_features_lookup).unwrap_err();
        assert_eq!(err.code, FEATURE_NOT_EXIST.code);
    }

    #[test]
    fn passed_features_overwrite_slots() {
        let meta = meta();
        let mut features = vec![None; meta.num_of_features];
        let passed = HashMap::from([("a".to_string(), json!(9))]);
        fill_passed_features(&mut features, &passed, &meta);
        assert_eq!(features[0], Some(b"9".to_vec()));
        assert!(features[1].is_none());
    }

    #[test]
    fn batch_planning_prefixes_and_skips_failed_entries() {
        let meta = meta();
        let entries = vec![
            HashMap::from([("pk".to_string(), json!(1))]),
            HashMap::from([("bad".to_string(), json!(2))]),
            HashMap::from([("pk".to_string(), json!(3))]),
        ];
        let mut status = vec![FeatureStatus::Complete; 3];
        let passed = check_feature_status(&entries, &[], true, &meta, &mut status);
        assert_eq!(passed, 2);
        assert_eq!(status[1], FeatureStatus::Error);

        let batch = plan_batch_pk_reads(&meta, &entries, &status);
        assert_eq!(batch.len(), 4);
        assert!(batch[0].operation_id.starts_with("0#"));
        assert!(batch[2].operation_id.starts_with("2#"));
    }

    #[test]
    fn batch_responses_group_by_sequence() {
        let responses = vec![
            PkReadResponse {
                status: 200,
                operation_id: "1#0|21".to_string(),
                ..Default::default()
            },
            PkReadResponse {
                status: 200,
                operation_id: "0#0|21".to_string(),
                ..Default::default()
            },
        ];
        let grouped = group_batch_responses(responses, 2).unwrap();
        assert_eq!(grouped[0].len(), 1);
        assert_eq!(grouped[0][0].operation_id, "0|21");
        assert_eq!(grouped[1].len(), 1);
    }

    #[test]
    fn complex_feature_decodes_into_slot() {
        let mut backend = two_group_backend();
        backend.set_feature_type("b", "array<bigint>");
        backend.set_avro_schema(
            "fg1",
            "b",
            r#"["null", {"type": "array", "items": ["null", "long"]}]"#,
        );
        let meta =
            crate::metadata::fetch_feature_view_metadata(&backend, "fs", "fv", 1).unwrap();
        let entries = HashMap::from([("pk".to_string(), json!(42))]);

        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD
            .encode([0x02u8, 0x06, 0x02, 0x02, 0x00, 0x02, 0x06, 0x00]);
        let mut r1 = PkReadResponse {
            status: 200,
            operation_id: "0|21".to_string(),
            ..Default::default()
        };
        r1.data.insert(
            "b".to_string(),
            Some(format!("\"{encoded}\"").into_bytes()),
        );

        let (features, status, err) = assemble_vector(&[&r1], &entries, &meta);
        assert!(err.is_none());
        assert_eq!(status, FeatureStatus::Complete);
        let b_pos = meta.feature_index_lookup[&crate::metadata::feature_index_key(0, 21, "b")];
        assert_eq!(features[b_pos], Some(b"[1,null,3]".to_vec()));
    }

    #[test]
    fn complex_decode_failure_marks_error() {
        let mut backend = two_group_backend();
        backend.set_feature_type("b", "array<bigint>");
        backend.set_avro_schema(
            "fg1",
            "b",
            r#"["null", {"type": "array", "items": ["null", "long"]}]"#,
        );
        let meta =
            crate::metadata::fetch_feature_view_metadata(&backend, "fs", "fv", 1).unwrap();
        let entries = HashMap::from([("pk".to_string(), json!(42))]);
        let mut r1 = PkReadResponse {
            status: 200,
            operation_id: "0|21".to_string(),
            ..Default::default()
        };
        r1.data
            .insert("b".to_string(), Some(b"\"%%%not-base64\"".to_vec()));
        let (features, status, err) = assemble_vector(&[&r1], &entries, &meta);
        assert_eq!(status, FeatureStatus::Error);
        assert!(err.is_some());
        let b_pos = meta.feature_index_lookup[&crate::metadata::feature_index_key(0, 21, "b")];
        assert!(features[b_pos].is_none());
    }
}
