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

//! HTTP surface: a thin layer that decodes requests, hands them to the core
//! on a blocking worker, and serializes the core's responses.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use http::{header, HeaderMap, HeaderValue, StatusCode};
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::config::AppConfig;
use crate::dal::AggClient;
use crate::error::RestError;
use crate::feature_store::types::{BatchFeatureStoreRequest, FeatureStoreRequest};
use crate::feature_store::FeatureStoreCore;
use crate::pkread::encoding::PkReadResponse;
use crate::pkread::{validate_db_identifier, PkFilter, PkReadColumn, PkReadParams};
use crate::ronsql::{self, RonSqlParams};

pub const API_VERSION: &str = "0.1.0";
const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// The API key travels in this header; the HTTP stack normalizes the name
/// to lowercase.
pub const API_KEY_HEADER: &str = "x-api-key";

pub struct ServerState {
    pub core: Arc<FeatureStoreCore>,
    pub agg_client: Arc<dyn AggClient>,
    pub config: Arc<AppConfig>,
}

type SharedState = Arc<ServerState>;

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route(&path("ping"), get(ping_handler))
        .route(&path("stat"), get(stat_handler))
        .route(&path("feature_store"), post(feature_store_handler))
        .route(&path("batch_feature_store"), post(batch_feature_store_handler))
        .route(&path("ronsql"), post(ronsql_handler))
        .route(&path(":db/:table/pk-read"), post(pk_read_handler))
        .route(&path("batch"), post(batch_pk_read_handler))
        .layer((
            TraceLayer::new_for_http(),
            // Graceful shutdown waits for outstanding requests; the timeout
            // keeps them from hanging forever.
            TimeoutLayer::new(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)),
        ))
        .with_state(state)
}

fn path(endpoint: &str) -> String {
    format!("/{API_VERSION}/{endpoint}")
}

/// Serve until `shutdown` resolves.
pub async fn try_run(
    state: SharedState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> color_eyre::Result<()> {
    let addr = format!(
        "{}:{}",
        state.config.rest.server_ip, state.config.rest.server_port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {addr}");
    let router = create_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn api_key_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn rest_error_response(err: RestError) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}

fn json_response(status: StatusCode, body: String) -> Response {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Bounds-check and parse a JSON request body.
fn parse_body<T: serde::de::DeserializeOwned>(
    state: &ServerState,
    body: &Bytes,
) -> Result<T, Response> {
    if body.len() > state.config.internal.req_buffer_size as usize {
        return Err((StatusCode::BAD_REQUEST, "Request too large").into_response());
    }
    serde_json::from_slice(body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Error:{e}")).into_response())
}

async fn ping_handler() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct StatResponse {
    #[serde(rename = "MemoryStats")]
    memory_stats: MemoryStatsPair,
    #[serde(rename = "RonDBStats")]
    rondb_stats: crate::dal::RonDbStats,
}

#[derive(Serialize)]
struct MemoryStatsPair {
    #[serde(rename = "RequestBuffers")]
    request_buffers: crate::buffers::MemoryStats,
    #[serde(rename = "ResponseBuffers")]
    response_buffers: crate::buffers::MemoryStats,
}

async fn stat_handler(State(state): State<SharedState>) -> Response {
    let stats = StatResponse {
        memory_stats: MemoryStatsPair {
            request_buffers: state.core.buffer_pool.req_stats(),
            response_buffers: state.core.buffer_pool.resp_stats(),
        },
        rondb_stats: state.core.data_client.stats(),
    };
    match serde_json::to_string(&stats) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            error!("Error serializing stats: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Serialization error").into_response()
        }
    }
}

async fn feature_store_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: FeatureStoreRequest = match parse_body(&state, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let api_key = api_key_of(&headers);
    let result = tokio::task::spawn_blocking(move || {
        state.core.feature_vector(&request, api_key.as_deref())
    })
    .await;
    match result {
        Ok(Ok(response)) => match serde_json::to_string(&response) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => {
                error!("Error serializing feature vector: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Serialization error").into_response()
            }
        },
        Ok(Err(err)) => rest_error_response(err),
        Err(e) => {
            error!("Worker panicked: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

async fn batch_feature_store_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: BatchFeatureStoreRequest = match parse_body(&state, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let api_key = api_key_of(&headers);
    let result = tokio::task::spawn_blocking(move || {
        state.core.batch_feature_vector(&request, api_key.as_deref())
    })
    .await;
    match result {
        Ok(Ok(response)) => match serde_json::to_string(&response) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => {
                error!("Error serializing batch feature vector: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Serialization error").into_response()
            }
        },
        Ok(Err(err)) => rest_error_response(err),
        Err(e) => {
            error!("Worker panicked: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

async fn ronsql_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let params: RonSqlParams = match parse_body(&state, &body) {
        Ok(params) => params,
        Err(response) => return response,
    };
    if let Err(err) = validate_db_identifier(&params.database) {
        return rest_error_response(err);
    }
    if let Err(err) = crate::pkread::validate_operation_id(
        &params.operation_id,
        state.config.internal.operation_id_max_size as usize,
    ) {
        return rest_error_response(err);
    }
    if state.config.security.api_key.use_api_keys {
        let api_key = api_key_of(&headers).unwrap_or_default();
        let database = params.database.clone();
        let auth_state = Arc::clone(&state);
        let auth = tokio::task::spawn_blocking(move || {
            auth_state
                .core
                .api_key_cache
                .validate_api_key(&api_key, &[database.as_str()])
        })
        .await;
        match auth {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let status = StatusCode::from_u16(err.status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return (status, err.to_string()).into_response();
            }
            Err(e) => {
                error!("Worker panicked: {e}");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
            }
        }
    }
    info!("Executing sql: {}", params.query);
    let result = tokio::task::spawn_blocking(move || {
        ronsql::run_query(&params, &*state.agg_client)
    })
    .await;
    match result {
        Ok(Ok(output)) => {
            let mut response = Response::new(output.body.into());
            match HeaderValue::from_str(&output.content_type) {
                Ok(value) => {
                    response.headers_mut().insert(header::CONTENT_TYPE, value);
                }
                Err(e) => error!("Invalid content type: {e}"),
            }
            response
        }
        Ok(Err(err)) => {
            let status = StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, err.to_string()).into_response()
        }
        Err(e) => {
            error!("Worker panicked: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PkReadBody {
    #[serde(default)]
    filters: Vec<PkFilterBody>,
    #[serde(default, rename = "readColumns")]
    read_columns: Vec<PkReadColumnBody>,
    #[serde(default, rename = "operationId")]
    operation_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PkFilterBody {
    column: String,
    value: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct PkReadColumnBody {
    column: String,
}

impl PkReadBody {
    fn into_params(self, db: String, table: String) -> PkReadParams {
        PkReadParams {
            db,
            table,
            filters: self
                .filters
                .into_iter()
                .map(|f| PkFilter {
                    column: f.column,
                    value: f.value.to_string().into_bytes(),
                })
                .collect(),
            read_columns: self
                .read_columns
                .into_iter()
                .map(|c| PkReadColumn {
                    column: c.column,
                    return_type: Default::default(),
                })
                .collect(),
            operation_id: self.operation_id,
        }
    }
}

#[derive(Serialize)]
struct PkReadRestResponse {
    #[serde(rename = "operationId", skip_serializing_if = "Option::is_none")]
    operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<BTreeMap<String, Option<Box<RawValue>>>>,
}

fn render_pk_response(response: PkReadResponse) -> (StatusCode, PkReadRestResponse) {
    let status = StatusCode::from_u16(response.status as u16)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let data = if response.status == 200 {
        let mut map = BTreeMap::new();
        for (name, value) in response.data {
            let raw = value
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .and_then(|text| RawValue::from_string(text).ok());
            map.insert(name, raw);
        }
        Some(map)
    } else {
        None
    };
    (
        status,
        PkReadRestResponse {
            operation_id: if response.operation_id.is_empty() {
                None
            } else {
                Some(response.operation_id)
            },
            data,
        },
    )
}

async fn pk_read_handler(
    State(state): State<SharedState>,
    Path((db, table)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: PkReadBody = match parse_body(&state, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let api_key = api_key_of(&headers);
    let result = tokio::task::spawn_blocking(move || {
        if state.config.security.api_key.use_api_keys {
            state
                .core
                .api_key_cache
                .validate_api_key(api_key.as_deref().unwrap_or_default(), &[db.as_str()])
                .map_err(RestError::from)?;
        }
        let params = request.into_params(db, table);
        state.core.pk_read(&params)
    })
    .await;
    match result {
        Ok(Ok(response)) => {
            let (status, body) = render_pk_response(response);
            match serde_json::to_string(&body) {
                Ok(body) => {
                    let mut response = json_response(StatusCode::OK, body);
                    *response.status_mut() = status;
                    response
                }
                Err(e) => {
                    error!("Error serializing pk-read response: {e}");
                    (StatusCode::INTERNAL_SERVER_ERROR, "Serialization error").into_response()
                }
            }
        }
        Ok(Err(err)) => rest_error_response(err),
        Err(e) => {
            error!("Worker panicked: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchPkReadBody {
    operations: Vec<BatchOperation>,
}

#[derive(Debug, Deserialize)]
struct BatchOperation {
    #[serde(rename = "method", default)]
    _method: String,
    #[serde(rename = "relative-url")]
    relative_url: String,
    body: PkReadBody,
}

#[derive(Serialize)]
struct BatchPkReadResponse {
    result: Vec<BatchSubResponse>,
}

#[derive(Serialize)]
struct BatchSubResponse {
    code: u16,
    body: PkReadRestResponse,
}

fn parse_relative_url(url: &str) -> Result<(String, String), RestError> {
    // Expected shape: {db}/{table}/pk-read
    let mut parts = url.trim_matches('/').split('/');
    let db = parts.next().unwrap_or_default();
    let table = parts.next().unwrap_or_default();
    let op = parts.next().unwrap_or_default();
    if db.is_empty() || table.is_empty() || op != "pk-read" || parts.next().is_some() {
        return Err(crate::error::READ_FROM_DB_FAIL_BAD_INPUT
            .message(format!("Invalid relative-url `{url}`")));
    }
    Ok((db.to_string(), table.to_string()))
}

async fn batch_pk_read_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: BatchPkReadBody = match parse_body(&state, &body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let api_key = api_key_of(&headers);
    let result = tokio::task::spawn_blocking(move || {
        let mut params = Vec::with_capacity(request.operations.len());
        let mut dbs: Vec<String> = Vec::new();
        for operation in request.operations {
            let (db, table) = parse_relative_url(&operation.relative_url)?;
            if !dbs.contains(&db) {
                dbs.push(db.clone());
            }
            params.push(operation.body.into_params(db, table));
        }
        if state.config.security.api_key.use_api_keys {
            let db_refs: Vec<&str> = dbs.iter().map(String::as_str).collect();
            state
                .core
                .api_key_cache
                .validate_api_key(api_key.as_deref().unwrap_or_default(), &db_refs)
                .map_err(RestError::from)?;
        }
        state.core.pk_batch(&params)
    })
    .await;
    match result {
        Ok(Ok(responses)) => {
            let result = BatchPkReadResponse {
                result: responses
                    .into_iter()
                    .map(|response| {
                        let (status, body) = render_pk_response(response);
                        BatchSubResponse {
                            code: status.as_u16(),
                            body,
                        }
                    })
                    .collect(),
            };
            match serde_json::to_string(&result) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => {
                    error!("Error serializing batch response: {e}");
                    (StatusCode::INTERNAL_SERVER_ERROR, "Serialization error").into_response()
                }
            }
        }
        Ok(Err(err)) => rest_error_response(err),
        Err(e) => {
            error!("Worker panicked: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_core, MockAggClient};
    use http::Request;
    use tower::ServiceExt as _;

    fn test_state() -> SharedState {
        let (core, data) = test_core();
        data.insert_row("fs", "fg1_1", "42", &[("a", "1"), ("b", "2")]);
        data.insert_row("fs", "fg2_1", "42", &[("c", "3")]);
        let agg_client = MockAggClient::new();
        agg_client.add_table("db", "t", &["a", "d"], &[]);
        let config = Arc::clone(&core.config);
        Arc::new(ServerState {
            core: Arc::new(core),
            agg_client: Arc::new(agg_client),
            config,
        })
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn ping_responds() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/0.1.0/ping")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stat_reports_buffer_pools() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/0.1.0/stat")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("MemoryStats"));
        assert!(body.contains("RonDBStats"));
    }

    #[tokio::test]
    async fn feature_store_round_trip() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/0.1.0/feature_store")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        r#"{"featureStoreName": "fs", "featureViewName": "fv",
                            "featureViewVersion": 1, "entries": {"pk": 42}}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert_eq!(body, r#"{"features":[1,2,3,42],"status":"COMPLETE"}"#);
    }

    #[tokio::test]
    async fn feature_store_bad_body_is_400() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/0.1.0/feature_store")
                    .body(axum::body::Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pk_read_round_trip() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/0.1.0/fs/fg1_1/pk-read")
                    .body(axum::body::Body::from(
                        r#"{"filters": [{"column": "pk", "value": 42}],
                            "readColumns": [{"column": "a"}],
                            "operationId": "op1"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert_eq!(body, r#"{"operationId":"op1","data":{"a":1}}"#);
    }

    #[tokio::test]
    async fn pk_read_missing_row_is_404() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/0.1.0/fs/fg1_1/pk-read")
                    .body(axum::body::Body::from(
                        r#"{"filters": [{"column": "pk", "value": 7}],
                            "readColumns": [{"column": "a"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn batch_pk_read_round_trip() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/0.1.0/batch")
                    .body(axum::body::Body::from(
                        r#"{"operations": [
                            {"method": "POST", "relative-url": "fs/fg1_1/pk-read",
                             "body": {"filters": [{"column": "pk", "value": 42}],
                                      "readColumns": [{"column": "a"}, {"column": "b"}]}},
                            {"method": "POST", "relative-url": "fs/fg2_1/pk-read",
                             "body": {"filters": [{"column": "pk", "value": 42}],
                                      "readColumns": [{"column": "c"}]}}
                        ]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["result"][0]["code"], 200);
        assert_eq!(parsed["result"][0]["body"]["data"]["a"], 1);
        assert_eq!(parsed["result"][1]["body"]["data"]["c"], 3);
    }

    #[tokio::test]
    async fn ronsql_rejects_bad_database() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/0.1.0/ronsql")
                    .body(axum::body::Body::from(
                        r#"{"query": "SELECT SUM(a) FROM t", "database": "bad db name!"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ronsql_executes() {
        let state = test_state();
        let response = create_router(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/0.1.0/ronsql")
                    .body(axum::body::Body::from(
                        r#"{"query": "SELECT SUM(a) FROM t", "database": "db"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            HeaderValue::from_static("application/json")
        );
        let body = body_string(response).await;
        assert!(body.starts_with("{\"data\":\n["));
    }
}
