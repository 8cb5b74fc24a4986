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

//! Decoding of complex feature columns.
//!
//! Complex features (map, array, struct, uniontype) are stored in binary
//! Avro. Responses render them as plain JSON: unions are unwrapped, records
//! and maps become objects, so a stored `["null", {"type": "array", ...}]`
//! value comes back as e.g. `[1, null, 3]`.

use apache_avro::types::Value;
use apache_avro::{from_avro_datum, Schema};
use serde_json::{json, Map, Number};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AvroError {
    #[error("failed to parse feature schema: {0}")]
    Schema(apache_avro::Error),
    #[error("decoding failed: {0}")]
    Decode(apache_avro::Error),
    #[error("value not representable as JSON: {0}")]
    Json(String),
}

/// A compiled per-feature schema plus the binary decoder for it.
#[derive(Debug, Clone)]
pub struct AvroDecoder {
    schema: Schema,
}

impl AvroDecoder {
    pub fn new(schema_json: &str) -> Result<Self, AvroError> {
        let schema = Schema::parse_str(schema_json).map_err(AvroError::Schema)?;
        Ok(AvroDecoder { schema })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Decode one binary datum.
    pub fn decode(&self, data: &[u8]) -> Result<Value, AvroError> {
        let mut reader = data;
        from_avro_datum(&self.schema, &mut reader, None).map_err(AvroError::Decode)
    }

    /// Decode one binary datum and render it as a JSON literal.
    pub fn decode_to_json(&self, data: &[u8]) -> Result<String, AvroError> {
        let value = self.decode(data)?;
        let json = avro_value_to_json(&value)?;
        serde_json::to_string(&json).map_err(|e| AvroError::Json(e.to_string()))
    }
}

fn avro_value_to_json(value: &Value) -> Result<serde_json::Value, AvroError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Long(i) => json!(i),
        Value::Float(f) => float_to_json(*f as f64)?,
        Value::Double(f) => float_to_json(*f)?,
        Value::Bytes(b) | Value::Fixed(_, b) => {
            serde_json::Value::Array(b.iter().map(|&x| json!(x)).collect())
        }
        Value::String(s) => json!(s),
        Value::Enum(_, symbol) => json!(symbol),
        Value::Union(_, inner) => avro_value_to_json(inner)?,
        Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(avro_value_to_json)
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(entries) => {
            let mut obj = Map::new();
            for (k, v) in entries {
                obj.insert(k.clone(), avro_value_to_json(v)?);
            }
            serde_json::Value::Object(obj)
        }
        Value::Record(fields) => {
            let mut obj = Map::new();
            for (name, v) in fields {
                obj.insert(name.clone(), avro_value_to_json(v)?);
            }
            serde_json::Value::Object(obj)
        }
        Value::Date(d) => json!(d),
        Value::TimeMillis(t) => json!(t),
        Value::TimeMicros(t) => json!(t),
        Value::TimestampMillis(t) => json!(t),
        Value::TimestampMicros(t) => json!(t),
        other => {
            return Err(AvroError::Json(format!(
                "unsupported avro value: {other:?}"
            )))
        }
    })
}

fn float_to_json(f: f64) -> Result<serde_json::Value, AvroError> {
    Number::from_f64(f)
        .map(serde_json::Value::Number)
        .ok_or_else(|| AvroError::Json("non-finite float".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NULLABLE_LONG_ARRAY: &str = r#"["null", {"type": "array", "items": ["null", "long"]}]"#;

    #[test]
    fn decodes_nullable_long_array() {
        let decoder = AvroDecoder::new(NULLABLE_LONG_ARRAY).unwrap();
        // Union branch 1 (array), 3 items: long 1, null, long 3.
        let data = [0x02, 0x06, 0x02, 0x02, 0x00, 0x02, 0x06, 0x00];
        let json = decoder.decode_to_json(&data).unwrap();
        assert_eq!(json, "[1,null,3]");
    }

    #[test]
    fn decodes_null_branch() {
        let decoder = AvroDecoder::new(NULLABLE_LONG_ARRAY).unwrap();
        let json = decoder.decode_to_json(&[0x00]).unwrap();
        assert_eq!(json, "null");
    }

    #[test]
    fn decodes_record_to_object() {
        let schema = r#"{"type": "record", "name": "s", "fields": [
            {"name": "a", "type": "long"},
            {"name": "b", "type": ["null", "string"]}
        ]}"#;
        let decoder = AvroDecoder::new(schema).unwrap();
        // a = 7, b = union branch 1, string "hi"
        let data = [0x0e, 0x02, 0x04, b'h', b'i'];
        let json = decoder.decode_to_json(&data).unwrap();
        assert_eq!(json, r#"{"a":7,"b":"hi"}"#);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let decoder = AvroDecoder::new(NULLABLE_LONG_ARRAY).unwrap();
        assert!(decoder.decode_to_json(&[0x02, 0x06]).is_err());
    }

    #[test]
    fn bad_schema_is_an_error() {
        assert!(AvroDecoder::new("{not json").is_err());
    }
}
