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

//! Contracts of the native storage-cluster client.
//!
//! The serving core never talks to the cluster directly; it goes through the
//! traits defined here. Production implementations wrap the native client
//! library, test implementations live in [`crate::test_utils`].

pub mod native;

use thiserror::Error;

/// Failure of a storage or metadata operation, split the way the native
/// client reports it: permanent errors fail the request, temporary ones are
/// retryable by the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DalError {
    #[error("Not Found")]
    NotFound,
    #[error("temporary storage error {code}: {message}")]
    Temporary { code: i32, message: String },
    #[error("storage error {code}: {message}")]
    Permanent { code: i32, message: String },
}

impl DalError {
    pub fn permanent(message: impl Into<String>) -> Self {
        DalError::Permanent {
            code: 0,
            message: message.into(),
        }
    }
}

/// Fixed-capacity request/response buffer in the native wire format. The
/// capacity is decided by the buffer pool; `len` is the number of meaningful
/// bytes. Words are 4 bytes, little-endian, at word-aligned offsets.
#[derive(Debug)]
pub struct RsBuffer {
    data: Box<[u8]>,
    len: u32,
}

impl RsBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        RsBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn set_len(&mut self, len: u32) {
        self.len = len;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Read the word at word index `idx`.
    pub fn u32_at(&self, idx: u32) -> u32 {
        let off = idx as usize * 4;
        u32::from_le_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])
    }

    /// Write the word at word index `idx`.
    pub fn set_u32_at(&mut self, idx: u32, value: u32) {
        let off = idx as usize * 4;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read the NUL-terminated string starting at byte offset `offset`,
    /// skipping the length prefix word.
    pub fn cstr_at(&self, offset: u32) -> Result<&str, DalError> {
        let start = offset as usize;
        if start >= self.data.len() {
            return Err(DalError::permanent("string offset out of bounds"));
        }
        let nul = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| DalError::permanent("unterminated string in buffer"))?;
        std::str::from_utf8(&self.data[start..start + nul])
            .map_err(|_| DalError::permanent("invalid utf-8 in buffer"))
    }

    /// Reset for reuse by the pool.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Record fetched for an API key prefix.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub secret_hash: String,
    pub salt: String,
    pub user_id: i32,
}

/// Connection stats, surfaced verbatim on `GET /{version}/stat`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RonDbStats {
    pub ndb_objects_created: u32,
    pub ndb_objects_deleted: u32,
    pub ndb_objects_count: u32,
    pub ndb_objects_available: u32,
    pub connected: bool,
}

/// Batched primary-key reads over encoded wire buffers.
pub trait DataClient: Send + Sync {
    fn pk_batch_read(
        &self,
        requests: &[RsBuffer],
        responses: &mut [RsBuffer],
    ) -> Result<(), DalError>;

    fn stats(&self) -> RonDbStats;
}

/// Authorization backend of the API-key cache.
pub trait AuthBackend: Send + Sync {
    fn find_api_key(&self, prefix: &str) -> Result<ApiKeyRecord, DalError>;
    fn find_all_projects(&self, user_id: i32) -> Result<Vec<String>, DalError>;
}

/// Raw backend rows the feature-view metadata is computed from.
#[derive(Debug, Clone)]
pub struct TrainingDatasetJoin {
    pub id: i32,
    pub prefix: String,
    pub index: i32,
}

#[derive(Debug, Clone)]
pub struct TrainingDatasetFeature {
    pub feature_id: i32,
    /// 0 when the feature group has been deleted.
    pub feature_group_id: i32,
    pub name: String,
    pub data_type: String,
    pub td_join_id: i32,
    pub idx: i32,
    pub label: bool,
}

#[derive(Debug, Clone)]
pub struct FeatureGroupRow {
    pub name: String,
    pub feature_store_id: i32,
    pub version: i32,
    pub online_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ServingKeyRow {
    pub feature_group_id: i32,
    pub feature_name: String,
    pub prefix: String,
    pub required: bool,
    pub join_on: String,
    pub join_index: i32,
}

/// One field of a feature group's Avro schema: the per-feature subschema is
/// stored as JSON text under the feature's name.
#[derive(Debug, Clone)]
pub struct AvroField {
    pub name: String,
    pub schema_json: String,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureGroupAvroSchema {
    pub fields: Vec<AvroField>,
}

impl FeatureGroupAvroSchema {
    pub fn schema_for_feature(&self, feature_name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == feature_name)
            .map(|f| f.schema_json.as_str())
    }
}

/// Metadata lookups backing the feature-view cache fill.
pub trait MetadataBackend: Send + Sync {
    fn find_feature_store_id(&self, fs_name: &str) -> Result<i32, DalError>;
    fn find_feature_view_id(
        &self,
        fs_id: i32,
        fv_name: &str,
        fv_version: i32,
    ) -> Result<i32, DalError>;
    fn find_training_dataset_joins(&self, fv_id: i32)
        -> Result<Vec<TrainingDatasetJoin>, DalError>;
    fn find_training_dataset_features(
        &self,
        fv_id: i32,
    ) -> Result<Vec<TrainingDatasetFeature>, DalError>;
    fn find_feature_group(&self, fg_id: i32) -> Result<FeatureGroupRow, DalError>;
    fn find_feature_store_name(&self, fs_id: i32) -> Result<String, DalError>;
    fn find_serving_keys(&self, fv_id: i32) -> Result<Vec<ServingKeyRow>, DalError>;
    fn find_project_id(&self, fs_name: &str) -> Result<i32, DalError>;
    fn find_feature_group_schema(
        &self,
        fg_name: &str,
        fg_version: i32,
        project_id: i32,
    ) -> Result<FeatureGroupAvroSchema, DalError>;
}

/// Table layout exposed to the SQL planner.
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<OrderedIndex>,
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub attr_id: i32,
}

/// An online ordered index; only the leading column matters for planning.
#[derive(Debug, Clone)]
pub struct OrderedIndex {
    pub name: String,
    pub first_column: String,
    pub online: bool,
}

impl TableSchema {
    pub fn attr_id(&self, column: &str) -> Option<i32> {
        self.columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.attr_id)
    }
}

/// Bound sense of the native index-scan API. The storage API inverts the
/// naming sense relative to the range: an inclusive low bound is `Le`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBound {
    Eq,
    Le,
    Lt,
    Ge,
    Gt,
}

/// One `setBound` call; a range is a short sequence of these followed by an
/// implicit end-of-bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundSpec {
    pub bound: IndexBound,
    pub value: i64,
}

/// Residual row filter attached to a scan, in the shape the native scan
/// filter API consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    And(Vec<ScanFilter>),
    Or(Vec<ScanFilter>),
    Not(Box<ScanFilter>),
    Cmp {
        cond: FilterCond,
        attr_id: i32,
        operand: FilterOperand,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterCond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperand {
    Column(i32),
    Int(i64),
    /// Packed `year << 9 | month << 5 | day`.
    Date(u32),
}

/// Aggregator program in storage terms: column references resolved to
/// attr ids, ready to be shipped to data nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggInstr {
    LoadColumn { attr_id: i32, reg: u32 },
    LoadInt64 { value: i64, reg: u32 },
    Mov { dest: u32, src: u32 },
    Add { dest: u32, src: u32 },
    Sub { dest: u32, src: u32 },
    Mul { dest: u32, src: u32 },
    Div { dest: u32, src: u32 },
    DivInt { dest: u32, src: u32 },
    Rem { dest: u32, src: u32 },
    Sum { agg: u32, reg: u32 },
    Min { agg: u32, reg: u32 },
    Max { agg: u32, reg: u32 },
    Count { agg: u32, reg: u32 },
}

/// Scan access path after planning, in backend form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanAccess {
    Table,
    Index {
        index_name: String,
        /// One entry per range; each entry is the `setBound` sequence.
        ranges: Vec<Vec<BoundSpec>>,
    },
}

#[derive(Debug, Clone)]
pub struct AggScanRequest {
    pub db: String,
    pub table: String,
    pub access: ScanAccess,
    pub filter: Option<ScanFilter>,
    pub group_by: Vec<i32>,
    pub program: Vec<AggInstr>,
}

/// Group-by column value in a result record.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanValue {
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int24(i32),
    UInt24(u32),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    /// Fixed-width char, space padded.
    Char(Vec<u8>),
    Varchar(Vec<u8>),
    /// Packed `year << 9 | month << 5 | day`.
    Date(u32),
    Null,
}

/// Aggregate accumulator value in a result record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggValue {
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Null,
}

#[derive(Debug, Clone, Default)]
pub struct AggResultRecord {
    pub group_columns: Vec<ScanValue>,
    pub aggregates: Vec<AggValue>,
}

/// Scan-with-aggregation against the storage nodes.
pub trait AggClient: Send + Sync {
    fn table_schema(&self, db: &str, table: &str) -> Result<TableSchema, DalError>;
    fn scan(&self, request: &AggScanRequest) -> Result<Vec<AggResultRecord>, DalError>;
}
