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

//! Native primary-key read wire format.
//!
//! Word-aligned little-endian layout with 4-byte words. The format is
//! bit-exact for interoperability with the storage cluster's receiver; all
//! offset arithmetic is explicit and goes through [`RsBuffer::u32_at`] /
//! [`RsBuffer::set_u32_at`] to avoid endianness surprises.

use std::collections::BTreeMap;

use crate::dal::{DalError, RsBuffer};
use crate::pkread::PkReadParams;

pub const ADDRESS_SIZE: u32 = 4;

pub const RDRS_PK_REQ_ID: u32 = 0x7072_6b31; // "prk1"
pub const RDRS_PK_RESP_ID: u32 = 0x7072_6b32; // "prk2"

// Request header word indexes.
pub const PK_REQ_OP_TYPE_IDX: u32 = 0;
pub const PK_REQ_CAPACITY_IDX: u32 = 1;
pub const PK_REQ_LENGTH_IDX: u32 = 2;
pub const PK_REQ_FLAGS_IDX: u32 = 3;
pub const PK_REQ_DB_IDX: u32 = 4;
pub const PK_REQ_TABLE_IDX: u32 = 5;
pub const PK_REQ_PK_COLS_IDX: u32 = 6;
pub const PK_REQ_READ_COLS_IDX: u32 = 7;
pub const PK_REQ_OP_ID_IDX: u32 = 8;
pub const PK_REQ_HEADER_END: u32 = 9 * ADDRESS_SIZE;

// Response header word indexes.
pub const PK_RESP_OP_TYPE_IDX: u32 = 0;
pub const PK_RESP_CAPACITY_IDX: u32 = 1;
pub const PK_RESP_LENGTH_IDX: u32 = 2;
pub const PK_RESP_OP_STATUS_IDX: u32 = 3;
pub const PK_RESP_OP_ID_IDX: u32 = 4;
pub const PK_RESP_COLS_IDX: u32 = 5;
pub const PK_RESP_OP_MESSAGE_IDX: u32 = 6;
pub const PK_RESP_HEADER_END: u32 = 7 * ADDRESS_SIZE;

/// Column data-type codes carried in response column records. Only the
/// distinction that matters to JSON rendering is encoded: whether the value
/// text must be quoted.
pub const DATA_TYPE_NUMBER: u32 = 1;
pub const DATA_TYPE_STRING: u32 = 2;
pub const DATA_TYPE_DATETIME: u32 = 3;
pub const DATA_TYPE_BINARY_BASE64: u32 = 4;

pub fn is_string_data_type(data_type: u32) -> bool {
    matches!(
        data_type,
        DATA_TYPE_STRING | DATA_TYPE_DATETIME | DATA_TYPE_BINARY_BASE64
    )
}

fn align_word(head: u32) -> u32 {
    (head + ADDRESS_SIZE - 1) & !(ADDRESS_SIZE - 1)
}

fn check_room(buf: &RsBuffer, head: u32, need: u32) -> Result<(), DalError> {
    if (head + need) as usize > buf.capacity() {
        return Err(DalError::permanent("request buffer too small"));
    }
    Ok(())
}

/// Write a length-prefixed, NUL-terminated string at `head`; returns the new
/// head (word aligned).
fn write_str(buf: &mut RsBuffer, head: u32, s: &[u8]) -> Result<u32, DalError> {
    let total = 4 + s.len() as u32 + 1;
    check_room(buf, head, total)?;
    buf.set_u32_at(head / ADDRESS_SIZE, s.len() as u32);
    let start = head as usize + 4;
    buf.as_bytes_mut()[start..start + s.len()].copy_from_slice(s);
    buf.as_bytes_mut()[start + s.len()] = 0;
    Ok(align_word(head + total))
}

/// Read a string written by [`write_str`] at byte offset `offset`.
pub fn read_str(buf: &RsBuffer, offset: u32) -> Result<&str, DalError> {
    let len = buf.u32_at(offset / ADDRESS_SIZE) as usize;
    let start = offset as usize + 4;
    if start + len > buf.capacity() {
        return Err(DalError::permanent("string extends past buffer"));
    }
    std::str::from_utf8(&buf.as_bytes()[start..start + len])
        .map_err(|_| DalError::permanent("invalid utf-8 in buffer"))
}

fn read_bytes(buf: &RsBuffer, offset: u32) -> Result<&[u8], DalError> {
    let len = buf.u32_at(offset / ADDRESS_SIZE) as usize;
    let start = offset as usize + 4;
    if start + len > buf.capacity() {
        return Err(DalError::permanent("value extends past buffer"));
    }
    Ok(&buf.as_bytes()[start..start + len])
}

/// Encode one PK-read into the native request layout: the fixed header
/// offsets, then db, table, filter array, read-column array, operation id.
pub fn create_native_request(
    params: &PkReadParams,
    req: &mut RsBuffer,
    resp_capacity: u32,
) -> Result<(), DalError> {
    let mut head = PK_REQ_HEADER_END;

    let db_offset = head;
    head = write_str(req, head, params.db.as_bytes())?;

    let table_offset = head;
    head = write_str(req, head, params.table.as_bytes())?;

    // Filter array: count word, then one offset per (key, value) pair.
    head = align_word(head);
    let pk_offset = head;
    check_room(req, head, (1 + params.filters.len() as u32) * ADDRESS_SIZE)?;
    req.set_u32_at(head / ADDRESS_SIZE, params.filters.len() as u32);
    head += ADDRESS_SIZE;
    let mut kvi = head / ADDRESS_SIZE;
    head += params.filters.len() as u32 * ADDRESS_SIZE;

    for filter in &params.filters {
        head = align_word(head);
        let tuple_offset = head;
        check_room(req, head, 2 * ADDRESS_SIZE)?;
        head += 2 * ADDRESS_SIZE;
        let key_offset = head;
        head = write_str(req, head, filter.column.as_bytes())?;
        let value_offset = head;
        head = write_str(req, head, &filter.value)?;
        req.set_u32_at(kvi, tuple_offset);
        kvi += 1;
        req.set_u32_at(tuple_offset / ADDRESS_SIZE, key_offset);
        req.set_u32_at(tuple_offset / ADDRESS_SIZE + 1, value_offset);
    }

    // Read-column array: count word, then one offset per
    // (return_type, column_name) record.
    head = align_word(head);
    let mut read_cols_offset = 0;
    if !params.read_columns.is_empty() {
        read_cols_offset = head;
        check_room(req, head, (1 + params.read_columns.len() as u32) * ADDRESS_SIZE)?;
        req.set_u32_at(head / ADDRESS_SIZE, params.read_columns.len() as u32);
        head += ADDRESS_SIZE;
        let mut rci = head / ADDRESS_SIZE;
        head += params.read_columns.len() as u32 * ADDRESS_SIZE;
        for col in &params.read_columns {
            head = align_word(head);
            req.set_u32_at(rci, head);
            rci += 1;
            check_room(req, head, ADDRESS_SIZE)?;
            req.set_u32_at(head / ADDRESS_SIZE, col.return_type.wire_value());
            head += ADDRESS_SIZE;
            head = write_str(req, head, col.column.as_bytes())?;
        }
    }

    let mut op_id_offset = 0;
    if !params.operation_id.is_empty() {
        op_id_offset = head;
        head = write_str(req, head, params.operation_id.as_bytes())?;
    }

    req.set_u32_at(PK_REQ_OP_TYPE_IDX, RDRS_PK_REQ_ID);
    req.set_u32_at(PK_REQ_CAPACITY_IDX, resp_capacity);
    req.set_u32_at(PK_REQ_LENGTH_IDX, head);
    req.set_u32_at(PK_REQ_FLAGS_IDX, 0);
    req.set_u32_at(PK_REQ_DB_IDX, db_offset);
    req.set_u32_at(PK_REQ_TABLE_IDX, table_offset);
    req.set_u32_at(PK_REQ_PK_COLS_IDX, pk_offset);
    req.set_u32_at(PK_REQ_READ_COLS_IDX, read_cols_offset);
    req.set_u32_at(PK_REQ_OP_ID_IDX, op_id_offset);
    req.set_len(head);
    Ok(())
}

/// Decoded view of a native request, used by in-memory data clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedPkRequest {
    pub db: String,
    pub table: String,
    pub filters: Vec<(String, Vec<u8>)>,
    pub read_columns: Vec<String>,
    pub operation_id: Option<String>,
}

pub fn decode_native_request(req: &RsBuffer) -> Result<DecodedPkRequest, DalError> {
    if req.u32_at(PK_REQ_OP_TYPE_IDX) != RDRS_PK_REQ_ID {
        return Err(DalError::permanent("wrong request type"));
    }
    let mut decoded = DecodedPkRequest {
        db: read_str(req, req.u32_at(PK_REQ_DB_IDX))?.to_string(),
        table: read_str(req, req.u32_at(PK_REQ_TABLE_IDX))?.to_string(),
        ..Default::default()
    };
    let pk_offset = req.u32_at(PK_REQ_PK_COLS_IDX);
    let count = req.u32_at(pk_offset / ADDRESS_SIZE);
    for i in 0..count {
        let tuple_offset = req.u32_at(pk_offset / ADDRESS_SIZE + 1 + i);
        let key_offset = req.u32_at(tuple_offset / ADDRESS_SIZE);
        let value_offset = req.u32_at(tuple_offset / ADDRESS_SIZE + 1);
        decoded.filters.push((
            read_str(req, key_offset)?.to_string(),
            read_bytes(req, value_offset)?.to_vec(),
        ));
    }
    let read_cols_offset = req.u32_at(PK_REQ_READ_COLS_IDX);
    if read_cols_offset != 0 {
        let count = req.u32_at(read_cols_offset / ADDRESS_SIZE);
        for i in 0..count {
            let rec_offset = req.u32_at(read_cols_offset / ADDRESS_SIZE + 1 + i);
            decoded
                .read_columns
                .push(read_str(req, rec_offset + ADDRESS_SIZE)?.to_string());
        }
    }
    let op_id_offset = req.u32_at(PK_REQ_OP_ID_IDX);
    if op_id_offset != 0 {
        decoded.operation_id = Some(read_str(req, op_id_offset)?.to_string());
    }
    Ok(decoded)
}

/// One column of a response, before JSON quoting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseColumn {
    pub name: String,
    /// `None` encodes SQL NULL.
    pub value: Option<Vec<u8>>,
    pub data_type: u32,
}

/// Encode a PK-read response; used by in-memory data clients and tests.
pub fn create_native_response(
    resp: &mut RsBuffer,
    http_status: u32,
    operation_id: Option<&str>,
    columns: &[ResponseColumn],
    message: Option<&str>,
) -> Result<(), DalError> {
    let mut head = PK_RESP_HEADER_END;

    let mut op_id_offset = 0;
    if let Some(op_id) = operation_id {
        op_id_offset = head;
        head = write_str(resp, head, op_id.as_bytes())?;
    }

    let mut cols_offset = 0;
    if !columns.is_empty() {
        head = align_word(head);
        cols_offset = head;
        check_room(resp, head, (1 + 4 * columns.len() as u32) * ADDRESS_SIZE)?;
        resp.set_u32_at(head / ADDRESS_SIZE, columns.len() as u32);
        head += ADDRESS_SIZE;
        let mut record = head / ADDRESS_SIZE;
        head += 4 * columns.len() as u32 * ADDRESS_SIZE;
        for col in columns {
            head = align_word(head);
            let name_offset = head;
            head = write_str(resp, head, col.name.as_bytes())?;
            let (value_offset, is_null) = match &col.value {
                Some(value) => {
                    let off = head;
                    head = write_str(resp, head, value)?;
                    (off, 0)
                }
                None => (0, 1),
            };
            resp.set_u32_at(record, name_offset);
            resp.set_u32_at(record + 1, value_offset);
            resp.set_u32_at(record + 2, is_null);
            resp.set_u32_at(record + 3, col.data_type);
            record += 4;
        }
    }

    let mut message_offset = 0;
    if let Some(message) = message {
        message_offset = head;
        head = write_str(resp, head, message.as_bytes())?;
    }

    resp.set_u32_at(PK_RESP_OP_TYPE_IDX, RDRS_PK_RESP_ID);
    resp.set_u32_at(PK_RESP_CAPACITY_IDX, resp.capacity() as u32);
    resp.set_u32_at(PK_RESP_LENGTH_IDX, head);
    resp.set_u32_at(PK_RESP_OP_STATUS_IDX, http_status);
    resp.set_u32_at(PK_RESP_OP_ID_IDX, op_id_offset);
    resp.set_u32_at(PK_RESP_COLS_IDX, cols_offset);
    resp.set_u32_at(PK_RESP_OP_MESSAGE_IDX, message_offset);
    resp.set_len(head);
    Ok(())
}

/// A parsed PK-read response. Values are the JSON text for each column:
/// string-typed columns arrive quoted, numeric ones verbatim, NULL columns
/// as `None`.
#[derive(Debug, Clone, Default)]
pub struct PkReadResponse {
    pub status: u32,
    pub operation_id: String,
    pub data: BTreeMap<String, Option<Vec<u8>>>,
    pub message: String,
}

pub fn process_pkread_response(resp: &RsBuffer) -> Result<PkReadResponse, DalError> {
    if resp.u32_at(PK_RESP_OP_TYPE_IDX) != RDRS_PK_RESP_ID {
        return Err(DalError::permanent(
            "internal server error. Wrong response type",
        ));
    }
    let capacity = resp.u32_at(PK_RESP_CAPACITY_IDX);
    let length = resp.u32_at(PK_RESP_LENGTH_IDX);
    if capacity < length {
        return Err(DalError::permanent(format!(
            "internal server error. response buffer may be corrupt. \
             Buffer capacity: {capacity}, data length: {length}"
        )));
    }
    let mut parsed = PkReadResponse {
        status: resp.u32_at(PK_RESP_OP_STATUS_IDX),
        ..Default::default()
    };
    let op_id_offset = resp.u32_at(PK_RESP_OP_ID_IDX);
    if op_id_offset != 0 {
        parsed.operation_id = read_str(resp, op_id_offset)?.to_string();
    }
    if parsed.status == 200 {
        let cols_offset = resp.u32_at(PK_RESP_COLS_IDX);
        if cols_offset != 0 {
            let count = resp.u32_at(cols_offset / ADDRESS_SIZE);
            for i in 0..count {
                let record = cols_offset / ADDRESS_SIZE + 1 + i * 4;
                let name = read_str(resp, resp.u32_at(record))?.to_string();
                let is_null = resp.u32_at(record + 2);
                if is_null != 0 {
                    parsed.data.insert(name, None);
                    continue;
                }
                let value = read_bytes(resp, resp.u32_at(record + 1))?;
                let data_type = resp.u32_at(record + 3);
                let rendered = if is_string_data_type(data_type) {
                    let text = std::str::from_utf8(value)
                        .map_err(|_| DalError::permanent("invalid utf-8 in column value"))?;
                    serde_json::to_string(text)
                        .map_err(|e| DalError::permanent(e.to_string()))?
                        .into_bytes()
                } else {
                    value.to_vec()
                };
                parsed.data.insert(name, Some(rendered));
            }
        }
    }
    let message_offset = resp.u32_at(PK_RESP_OP_MESSAGE_IDX);
    if message_offset != 0 {
        parsed.message = read_str(resp, message_offset)?.to_string();
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkread::{DataReturnType, PkFilter, PkReadColumn};

    fn sample_params() -> PkReadParams {
        PkReadParams {
            db: "fs".to_string(),
            table: "fg1_1".to_string(),
            filters: vec![PkFilter {
                column: "pk".to_string(),
                value: b"42".to_vec(),
            }],
            read_columns: vec![
                PkReadColumn {
                    column: "a".to_string(),
                    return_type: DataReturnType::Default,
                },
                PkReadColumn {
                    column: "b".to_string(),
                    return_type: DataReturnType::Default,
                },
            ],
            operation_id: "0|21".to_string(),
        }
    }

    #[test]
    fn request_round_trips() {
        let params = sample_params();
        let mut req = RsBuffer::with_capacity(4096);
        create_native_request(&params, &mut req, 8192).unwrap();
        assert_eq!(req.u32_at(PK_REQ_OP_TYPE_IDX), RDRS_PK_REQ_ID);
        assert_eq!(req.u32_at(PK_REQ_CAPACITY_IDX), 8192);
        assert_eq!(req.u32_at(PK_REQ_LENGTH_IDX), req.len());

        let decoded = decode_native_request(&req).unwrap();
        assert_eq!(decoded.db, "fs");
        assert_eq!(decoded.table, "fg1_1");
        assert_eq!(decoded.filters, vec![("pk".to_string(), b"42".to_vec())]);
        assert_eq!(decoded.read_columns, vec!["a", "b"]);
        assert_eq!(decoded.operation_id.as_deref(), Some("0|21"));
    }

    #[test]
    fn offsets_are_word_aligned() {
        let params = sample_params();
        let mut req = RsBuffer::with_capacity(4096);
        create_native_request(&params, &mut req, 8192).unwrap();
        for idx in [
            PK_REQ_DB_IDX,
            PK_REQ_TABLE_IDX,
            PK_REQ_PK_COLS_IDX,
            PK_REQ_READ_COLS_IDX,
            PK_REQ_OP_ID_IDX,
        ] {
            assert_eq!(req.u32_at(idx) % ADDRESS_SIZE, 0);
        }
    }

    #[test]
    fn response_round_trips_with_quoting() {
        let mut resp = RsBuffer::with_capacity(4096);
        create_native_response(
            &mut resp,
            200,
            Some("0|21"),
            &[
                ResponseColumn {
                    name: "a".to_string(),
                    value: Some(b"1".to_vec()),
                    data_type: DATA_TYPE_NUMBER,
                },
                ResponseColumn {
                    name: "s".to_string(),
                    value: Some(b"he\"llo".to_vec()),
                    data_type: DATA_TYPE_STRING,
                },
                ResponseColumn {
                    name: "n".to_string(),
                    value: None,
                    data_type: DATA_TYPE_NUMBER,
                },
            ],
            None,
        )
        .unwrap();

        let parsed = process_pkread_response(&resp).unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.operation_id, "0|21");
        assert_eq!(parsed.data["a"], Some(b"1".to_vec()));
        assert_eq!(parsed.data["s"], Some(b"\"he\\\"llo\"".to_vec()));
        assert_eq!(parsed.data["n"], None);
    }

    #[test]
    fn response_not_found_carries_no_columns() {
        let mut resp = RsBuffer::with_capacity(1024);
        create_native_response(&mut resp, 404, Some("1|22"), &[], Some("Not Found")).unwrap();
        let parsed = process_pkread_response(&resp).unwrap();
        assert_eq!(parsed.status, 404);
        assert!(parsed.data.is_empty());
        assert_eq!(parsed.message, "Not Found");
    }

    #[test]
    fn corrupt_capacity_is_rejected() {
        let mut resp = RsBuffer::with_capacity(1024);
        create_native_response(&mut resp, 200, None, &[], None).unwrap();
        resp.set_u32_at(PK_RESP_CAPACITY_IDX, 1);
        assert!(process_pkread_response(&resp).is_err());
    }

    #[test]
    fn tiny_buffer_is_rejected() {
        let params = sample_params();
        let mut req = RsBuffer::with_capacity(40);
        assert!(create_native_request(&params, &mut req, 8192).is_err());
    }
}
