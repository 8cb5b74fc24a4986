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

//! Primary-key read descriptors and their shape-level validation.

pub mod encoding;

use std::collections::BTreeMap;

use crate::error::{RestError, INCORRECT_PRIMARY_KEY, READ_FROM_DB_FAIL_BAD_INPUT};

pub const MAX_IDENTIFIER_BYTES: usize = 64;
pub const DEFAULT_OPERATION_ID_MAX_SIZE: usize = 256;

/// One `column = value` filter; the value is the raw JSON text supplied by
/// the caller, typed by the storage node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkFilter {
    pub column: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkReadColumn {
    pub column: String,
    /// Only the default return type is supported.
    pub return_type: DataReturnType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataReturnType {
    #[default]
    Default,
}

impl DataReturnType {
    pub fn wire_value(self) -> u32 {
        match self {
            DataReturnType::Default => 1,
        }
    }
}

/// A planned primary-key read against one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PkReadParams {
    pub db: String,
    pub table: String,
    pub filters: Vec<PkFilter>,
    pub read_columns: Vec<PkReadColumn>,
    pub operation_id: String,
}

impl PkReadParams {
    /// Shape-level validation: identifier rules, filter presence and
    /// uniqueness, read-column uniqueness, operation-id length.
    pub fn validate(&self, operation_id_max_size: usize) -> Result<(), RestError> {
        validate_db_identifier(&self.db)?;
        validate_db_identifier(&self.table)?;
        validate_operation_id(&self.operation_id, operation_id_max_size)?;
        if self.filters.is_empty() {
            return Err(INCORRECT_PRIMARY_KEY.message("No primary key filters"));
        }
        let mut seen = BTreeMap::new();
        for filter in &self.filters {
            validate_db_identifier(&filter.column)?;
            if seen.insert(filter.column.as_str(), ()).is_some() {
                return Err(INCORRECT_PRIMARY_KEY.message(format!(
                    "Duplicate primary key column `{}`",
                    filter.column
                )));
            }
        }
        let mut seen = BTreeMap::new();
        for col in &self.read_columns {
            validate_db_identifier(&col.column)?;
            if seen.insert(col.column.as_str(), ()).is_some() {
                return Err(READ_FROM_DB_FAIL_BAD_INPUT
                    .message(format!("Duplicate read column `{}`", col.column)));
            }
        }
        Ok(())
    }
}

/// Database, table and column identifiers follow the MySQL unquoted rules:
/// ASCII alphanumerics, `$`, `_`, or code points U+0080..=U+FFFF, at most 64
/// bytes of UTF-8.
pub fn validate_db_identifier(identifier: &str) -> Result<(), RestError> {
    if identifier.is_empty() {
        return Err(READ_FROM_DB_FAIL_BAD_INPUT.message("Empty identifier"));
    }
    if identifier.len() > MAX_IDENTIFIER_BYTES {
        return Err(READ_FROM_DB_FAIL_BAD_INPUT.message(format!(
            "Identifier `{identifier}` is longer than {MAX_IDENTIFIER_BYTES} bytes"
        )));
    }
    for ch in identifier.chars() {
        let ok = ch.is_ascii_alphanumeric()
            || ch == '$'
            || ch == '_'
            || ('\u{0080}'..='\u{ffff}').contains(&ch);
        if !ok {
            return Err(READ_FROM_DB_FAIL_BAD_INPUT
                .message(format!("Invalid character in identifier `{identifier}`")));
        }
    }
    Ok(())
}

pub fn validate_operation_id(operation_id: &str, max_size: usize) -> Result<(), RestError> {
    if operation_id.len() > max_size {
        return Err(READ_FROM_DB_FAIL_BAD_INPUT.message(format!(
            "Operation ID is longer than {max_size} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_length_boundary() {
        let ok = "a".repeat(64);
        assert!(validate_db_identifier(&ok).is_ok());
        let too_long = "a".repeat(65);
        assert!(validate_db_identifier(&too_long).is_err());
        // Multi-byte characters count in bytes, not chars.
        let multi = "å".repeat(32);
        assert_eq!(multi.len(), 64);
        assert!(validate_db_identifier(&multi).is_ok());
        let multi = "å".repeat(33);
        assert!(validate_db_identifier(&multi).is_err());
    }

    #[test]
    fn identifier_charset() {
        assert!(validate_db_identifier("proj_fs1$x").is_ok());
        assert!(validate_db_identifier("tablé").is_ok());
        assert!(validate_db_identifier("bad name").is_err());
        assert!(validate_db_identifier("semi;colon").is_err());
        assert!(validate_db_identifier("").is_err());
    }

    #[test]
    fn params_validation_catches_duplicates() {
        let mut params = PkReadParams {
            db: "db".to_string(),
            table: "t_1".to_string(),
            filters: vec![
                PkFilter {
                    column: "id".to_string(),
                    value: b"1".to_vec(),
                },
                PkFilter {
                    column: "id".to_string(),
                    value: b"2".to_vec(),
                },
            ],
            ..Default::default()
        };
        assert!(params
            .validate(DEFAULT_OPERATION_ID_MAX_SIZE)
            .is_err());
        params.filters.pop();
        assert!(params.validate(DEFAULT_OPERATION_ID_MAX_SIZE).is_ok());
    }

    #[test]
    fn operation_id_length_is_bounded() {
        let params = PkReadParams {
            db: "db".to_string(),
            table: "t".to_string(),
            filters: vec![PkFilter {
                column: "id".to_string(),
                value: b"1".to_vec(),
            }],
            operation_id: "x".repeat(300),
            ..Default::default()
        };
        assert!(params.validate(256).is_err());
        assert!(params.validate(512).is_ok());
    }
}
