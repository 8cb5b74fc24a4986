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

//! Domain error kinds for the REST surface.
//!
//! Every error that can reach a client is a [`RestError`]: a stable numeric
//! code, a human readable reason, the HTTP status it maps to, and an optional
//! per-occurrence message. The catalogue of codes mirrors the feature store
//! API and must stay stable across releases.

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// A catalogue entry. Use [`RestErrorCode::error`] or
/// [`RestErrorCode::message`] to produce a concrete [`RestError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestErrorCode {
    pub code: i32,
    pub reason: &'static str,
    pub status: u16,
}

impl RestErrorCode {
    const fn new(code: i32, reason: &'static str, status: u16) -> Self {
        Self {
            code,
            reason,
            status,
        }
    }

    pub fn error(&self) -> RestError {
        RestError {
            code: self.code,
            reason: self.reason,
            status: self.status,
            message: String::new(),
        }
    }

    pub fn message(&self, msg: impl Into<String>) -> RestError {
        RestError {
            code: self.code,
            reason: self.reason,
            status: self.status,
            message: msg.into(),
        }
    }
}

pub const FV_NOT_EXIST: RestErrorCode = RestErrorCode::new(1, "Feature view does not exist.", 404);
pub const FS_NOT_EXIST: RestErrorCode = RestErrorCode::new(2, "Feature store does not exist.", 404);
pub const FG_NOT_EXIST: RestErrorCode = RestErrorCode::new(3, "Feature group does not exist.", 404);
pub const FG_READ_FAIL: RestErrorCode =
    RestErrorCode::new(4, "Reading feature group failed.", 500);
pub const FS_READ_FAIL: RestErrorCode =
    RestErrorCode::new(5, "Reading feature store failed.", 500);
pub const FV_READ_FAIL: RestErrorCode = RestErrorCode::new(6, "Reading feature view failed.", 500);
pub const TD_JOIN_READ_FAIL: RestErrorCode =
    RestErrorCode::new(7, "Reading training dataset join failed.", 500);
pub const TD_FEATURE_READ_FAIL: RestErrorCode =
    RestErrorCode::new(8, "Reading training dataset feature failed.", 500);
pub const FETCH_METADATA_FROM_CACHE_FAIL: RestErrorCode =
    RestErrorCode::new(9, "Fetching metadata from cache failed.", 500);
pub const WRONG_DATA_TYPE: RestErrorCode = RestErrorCode::new(10, "Wrong data type.", 415);
pub const FEATURE_NOT_EXIST: RestErrorCode =
    RestErrorCode::new(11, "Feature does not exist.", 404);
pub const INCORRECT_PRIMARY_KEY: RestErrorCode =
    RestErrorCode::new(12, "Incorrect primary key.", 400);
pub const INCORRECT_PASSED_FEATURE: RestErrorCode =
    RestErrorCode::new(13, "Incorrect passed feature.", 400);
pub const READ_FROM_DB_FAIL: RestErrorCode = RestErrorCode::new(14, "Reading from db failed.", 500);
pub const NO_PRIMARY_KEY_GIVEN: RestErrorCode =
    RestErrorCode::new(15, "No primary key is given.", 400);
pub const INCORRECT_FEATURE_VALUE: RestErrorCode =
    RestErrorCode::new(16, "Incorrect feature value.", 400);
pub const FEATURE_STORE_NOT_SHARED: RestErrorCode =
    RestErrorCode::new(17, "Accessing unshared feature store failed", 401);
pub const READ_FROM_DB_FAIL_BAD_INPUT: RestErrorCode =
    RestErrorCode::new(18, "Reading from db failed.", 400);
pub const DESERIALISE_FEATURE_FAIL: RestErrorCode =
    RestErrorCode::new(19, "Deserialising complex feature failed.", 500);

/// Concrete error returned to clients. `Display` renders the JSON body the
/// REST API has always used.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{{\"code\": {code}, \"reason\": \"{reason}\", \"message\": \"{message}\"}}")]
pub struct RestError {
    pub code: i32,
    pub reason: &'static str,
    pub status: u16,
    pub message: String,
}

impl RestError {
    pub fn status(&self) -> u16 {
        self.status
    }
}

// Known substrings of storage-node error messages. Matching on message text
// is fragile but required for compatibility with existing clients.
pub const ERROR_012: &str = "Column does not exist.";
pub const ERROR_013: &str = "Wrong number of primary-key columns.";
pub const ERROR_014: &str = "Wrong primay-key column.";
pub const ERROR_015: &str = "Wrong data type.";

lazy_static! {
    static ref WRONG_TYPE_RE: Regex = Regex::new(r"Expecting (\w+)\. Column: (\w+)").unwrap();
}

/// Map a storage-backend failure onto a feature store error kind.
pub fn translate_rondb_error(http_code: u16, err: &str) -> RestError {
    if err.contains(ERROR_015) {
        if let Some(caps) = WRONG_TYPE_RE.captures(err) {
            let data_type = &caps[1];
            let column_name = &caps[2];
            return WRONG_DATA_TYPE.message(format!(
                "Primary key '{column_name}' should be in '{data_type}' format."
            ));
        }
        return WRONG_DATA_TYPE.error();
    }
    if err.contains(ERROR_013) || err.contains(ERROR_014) || err.contains(ERROR_012) {
        return INCORRECT_PRIMARY_KEY.message(err);
    }
    if http_code == 400 {
        READ_FROM_DB_FAIL_BAD_INPUT.message(err)
    } else {
        READ_FROM_DB_FAIL.message(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_wrong_data_type_extracts_column() {
        let err = format!("{ERROR_015} Expecting BIGINT. Column: id");
        let translated = translate_rondb_error(400, &err);
        assert_eq!(translated.code, WRONG_DATA_TYPE.code);
        assert_eq!(translated.status, 415);
        assert!(translated.message.contains("'id'"));
        assert!(translated.message.contains("'BIGINT'"));
    }

    #[test]
    fn translate_pk_errors() {
        for s in [ERROR_012, ERROR_013, ERROR_014] {
            let translated = translate_rondb_error(400, s);
            assert_eq!(translated.code, INCORRECT_PRIMARY_KEY.code);
        }
    }

    #[test]
    fn translate_generic_read_failures() {
        assert_eq!(
            translate_rondb_error(400, "something else").code,
            READ_FROM_DB_FAIL_BAD_INPUT.code
        );
        assert_eq!(
            translate_rondb_error(500, "something else").code,
            READ_FROM_DB_FAIL.code
        );
    }

    #[test]
    fn rest_error_renders_json_body() {
        let e = INCORRECT_PRIMARY_KEY.message("No entries found");
        assert_eq!(
            e.to_string(),
            "{\"code\": 12, \"reason\": \"Incorrect primary key.\", \"message\": \"No entries found\"}"
        );
    }
}
