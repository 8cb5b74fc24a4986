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

//! Configuration management handling
//!
//! Configuration is a JSON file; every option has a default so an empty (or
//! absent) file is a valid configuration. Keys beginning with `#` are
//! comments and are stripped before deserialization. `validate` collects
//! every problem instead of stopping at the first.

use std::path::Path;

use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONFIG_FILE_ENV: &str = "RDRS_CONFIG_FILE";

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct InternalConfig {
    #[serde(rename = "ReqBufferSize")]
    pub req_buffer_size: u32,
    #[serde(rename = "RespBufferSize")]
    pub resp_buffer_size: u32,
    #[serde(rename = "PreAllocatedBuffers")]
    pub pre_allocated_buffers: u32,
    #[serde(rename = "BatchMaxSize")]
    pub batch_max_size: u32,
    #[serde(rename = "OperationIDMaxSize")]
    pub operation_id_max_size: u32,
}

impl Default for InternalConfig {
    fn default() -> Self {
        InternalConfig {
            req_buffer_size: 1024 * 1024,
            resp_buffer_size: 5 * 1024 * 1024,
            pre_allocated_buffers: 32,
            batch_max_size: 256,
            operation_id_max_size: 256,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RestConfig {
    #[serde(rename = "Enable")]
    pub enable: bool,
    #[serde(rename = "ServerIP")]
    pub server_ip: String,
    #[serde(rename = "ServerPort")]
    pub server_port: u16,
    #[serde(rename = "NumThreads")]
    pub num_threads: usize,
}

impl Default for RestConfig {
    fn default() -> Self {
        RestConfig {
            enable: true,
            server_ip: "0.0.0.0".to_string(),
            server_port: 5406,
            num_threads: 16,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct GrpcConfig {
    #[serde(rename = "Enable")]
    pub enable: bool,
    #[serde(rename = "ServerIP")]
    pub server_ip: String,
    #[serde(rename = "ServerPort")]
    pub server_port: u16,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        GrpcConfig {
            enable: false,
            server_ip: "0.0.0.0".to_string(),
            server_port: 4406,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Mgmd {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "Port")]
    pub port: u16,
}

impl Default for Mgmd {
    fn default() -> Self {
        Mgmd {
            ip: "localhost".to_string(),
            port: 13000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RonDbConfig {
    #[serde(rename = "Mgmds")]
    pub mgmds: Vec<Mgmd>,
    // Only one connection is currently supported.
    #[serde(rename = "ConnectionPoolSize")]
    pub connection_pool_size: u32,
    #[serde(rename = "NodeIDs")]
    pub node_ids: Vec<u32>,
    #[serde(rename = "ConnectionRetries")]
    pub connection_retries: u32,
    #[serde(rename = "ConnectionRetryDelayInSec")]
    pub connection_retry_delay_in_sec: u32,
    #[serde(rename = "OpRetryOnTransientErrorsCount")]
    pub op_retry_on_transient_errors_count: u32,
    #[serde(rename = "OpRetryInitialDelayInMS")]
    pub op_retry_initial_delay_in_ms: u32,
    #[serde(rename = "OpRetryJitterInMS")]
    pub op_retry_jitter_in_ms: u32,
}

impl Default for RonDbConfig {
    fn default() -> Self {
        RonDbConfig {
            mgmds: vec![Mgmd::default()],
            connection_pool_size: 1,
            node_ids: vec![0],
            connection_retries: 5,
            connection_retry_delay_in_sec: 5,
            op_retry_on_transient_errors_count: 3,
            op_retry_initial_delay_in_ms: 500,
            op_retry_jitter_in_ms: 100,
        }
    }
}

impl RonDbConfig {
    pub fn connect_string(&self) -> String {
        self.mgmds
            .iter()
            .map(|m| format!("{}:{}", m.ip, m.port))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    #[serde(rename = "EnableTLS")]
    pub enable_tls: bool,
    #[serde(rename = "RequireAndVerifyClientCert")]
    pub require_and_verify_client_cert: bool,
    #[serde(rename = "CertificateFile")]
    pub certificate_file: String,
    #[serde(rename = "PrivateKeyFile")]
    pub private_key_file: String,
    #[serde(rename = "RootCACertFile")]
    pub root_ca_cert_file: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiKeyConfig {
    #[serde(rename = "UseHopsworksAPIKeys")]
    pub use_api_keys: bool,
    #[serde(rename = "CacheRefreshIntervalMS")]
    pub cache_refresh_interval_ms: u32,
    #[serde(rename = "CacheUnusedEntriesEvictionMS")]
    pub cache_unused_entries_eviction_ms: u32,
    #[serde(rename = "CacheRefreshIntervalJitterMS")]
    pub cache_refresh_interval_jitter_ms: u32,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        ApiKeyConfig {
            use_api_keys: true,
            cache_refresh_interval_ms: 10_000,
            cache_unused_entries_eviction_ms: 60_000,
            cache_refresh_interval_jitter_ms: 1_000,
        }
    }
}

impl ApiKeyConfig {
    pub fn cache_settings(&self) -> crate::cache::CacheSettings {
        crate::cache::CacheSettings {
            refresh_interval_ms: self.cache_refresh_interval_ms,
            unused_eviction_ms: self.cache_unused_entries_eviction_ms,
            refresh_interval_jitter_ms: self.cache_refresh_interval_jitter_ms,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    #[serde(rename = "TLS")]
    pub tls: TlsConfig,
    #[serde(rename = "APIKey")]
    pub api_key: ApiKeyConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    #[serde(rename = "Level")]
    pub level: String,
    #[serde(rename = "FilePath")]
    pub file_path: String,
    #[serde(rename = "MaxSizeMB")]
    pub max_size_mb: u32,
    #[serde(rename = "MaxBackups")]
    pub max_backups: u32,
    #[serde(rename = "MaxAge")]
    pub max_age: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "warn".to_string(),
            file_path: String::new(),
            max_size_mb: 100,
            max_backups: 10,
            max_age: 30,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(rename = "Internal")]
    pub internal: InternalConfig,
    #[serde(rename = "PIDFile")]
    pub pid_file: String,
    #[serde(rename = "REST")]
    pub rest: RestConfig,
    #[serde(rename = "GRPC")]
    pub grpc: GrpcConfig,
    #[serde(rename = "RonDB")]
    pub rondb: RonDbConfig,
    #[serde(rename = "RonDBMetadataCluster")]
    pub rondb_metadata_cluster: Option<RonDbConfig>,
    #[serde(rename = "Security")]
    pub security: SecurityConfig,
    #[serde(rename = "Log")]
    pub log: LogConfig,
}

impl AppConfig {
    /// The metadata cluster defaults to the data cluster when absent.
    pub fn metadata_cluster(&self) -> &RonDbConfig {
        self.rondb_metadata_cluster.as_ref().unwrap_or(&self.rondb)
    }

    /// Collect every configuration problem; an empty list means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let internal = &self.internal;
        if internal.req_buffer_size < 256 {
            problems.push("ReqBufferSize should be >= 256".to_string());
        }
        if internal.resp_buffer_size < 256 {
            problems.push("RespBufferSize should be >= 256".to_string());
        }
        if internal.req_buffer_size % 4 != 0 || internal.resp_buffer_size % 4 != 0 {
            problems.push("Buffer sizes must be multiples of 4".to_string());
        }
        if self.rest.enable {
            if self.rest.server_ip.is_empty() {
                problems.push("REST server IP cannot be empty".to_string());
            }
            if self.rest.server_port == 0 {
                problems.push("REST server port cannot be zero".to_string());
            }
            if self.rest.num_threads == 0 {
                problems.push("REST NumThreads cannot be zero".to_string());
            }
        } else {
            problems.push("REST must be enabled".to_string());
        }
        if self.grpc.enable {
            problems.push("gRPC not supported".to_string());
        }
        for cluster in std::iter::once(&self.rondb).chain(self.rondb_metadata_cluster.iter()) {
            if cluster.mgmds.is_empty() {
                problems.push("at least one Management server has to be defined".to_string());
            }
            if cluster.mgmds.len() > 1 {
                problems.push(
                    "we do not support specifying more than one Management server yet".to_string(),
                );
            }
            if cluster.connection_pool_size != 1 {
                problems.push(
                    "wrong connection pool size. Currently only 1 RonDB connection is supported"
                        .to_string(),
                );
            }
            if cluster.node_ids.len() != cluster.connection_pool_size as usize {
                problems.push(
                    "wrong number of NodeIDs. The number of node ids must match the connection \
                     pool size"
                        .to_string(),
                );
            }
        }
        let tls = &self.security.tls;
        if tls.enable_tls && (tls.certificate_file.is_empty() || tls.private_key_file.is_empty()) {
            problems.push(
                "cannot enable TLS if `CertificateFile` or `PrivateKeyFile` is not set".to_string(),
            );
        }
        if !tls.enable_tls && tls.require_and_verify_client_cert {
            problems.push("cannot require client certificates if TLS is not enabled".to_string());
        }
        let api_key = &self.security.api_key;
        if api_key.cache_refresh_interval_ms == 0 {
            problems.push("cache refresh interval cannot be 0".to_string());
        }
        if api_key.cache_unused_entries_eviction_ms == 0 {
            problems.push("cache unused entries eviction cannot be 0".to_string());
        }
        if api_key.cache_refresh_interval_ms > api_key.cache_unused_entries_eviction_ms {
            problems.push(
                "cache refresh interval cannot be greater than cache unused entries eviction"
                    .to_string(),
            );
        }
        if api_key.cache_refresh_interval_jitter_ms >= api_key.cache_refresh_interval_ms {
            problems.push(
                "cache refresh interval must be smaller than cache refresh interval jitter"
                    .to_string(),
            );
        }
        problems
    }
}

/// Remove `#`-prefixed comment keys anywhere in the tree.
fn strip_comment_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !key.starts_with('#'));
            for v in map.values_mut() {
                strip_comment_keys(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                strip_comment_keys(v);
            }
        }
        _ => {}
    }
}

pub fn parse_config(contents: &str) -> Result<AppConfig, serde_json::Error> {
    let mut value: Value = serde_json::from_str(contents)?;
    strip_comment_keys(&mut value);
    serde_json::from_value(value)
}

/// Load the config from `path`, falling back to defaults when no file was
/// given or it does not exist. A file that exists but fails to parse is an
/// error; serving with silently wrong settings is worse than not starting.
pub fn create_config(path: Option<&Path>) -> Result<AppConfig, String> {
    let Some(path) = path else {
        debug!("No config, using default");
        return Ok(AppConfig::default());
    };
    if !path.exists() {
        debug!("Config file {} does not exist, using default", path.display());
        return Ok(AppConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Error reading config {}: {e}", path.display()))?;
    match parse_config(&contents) {
        Ok(config) => {
            debug!("Parsed config: {config:?}");
            Ok(config)
        }
        Err(err) => {
            error!("Error parsing config: {err:?}");
            Err(format!("Error parsing config {}: {err}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.internal.req_buffer_size, 1024 * 1024);
        assert_eq!(config.rest.server_port, 5406);
        assert_eq!(config.metadata_cluster().connection_pool_size, 1);
    }

    #[test]
    fn comment_keys_are_ignored() {
        let config = parse_config(
            r##"{
                "#comment": "this is ignored",
                "REST": {"#note": "also ignored", "ServerPort": 9999}
            }"##,
        )
        .unwrap();
        assert_eq!(config.rest.server_port, 9999);
    }

    #[test]
    fn metadata_cluster_falls_back_to_data_cluster() {
        let config =
            parse_config(r#"{"RonDB": {"Mgmds": [{"IP": "10.0.0.1", "Port": 1186}]}}"#).unwrap();
        assert_eq!(config.metadata_cluster().mgmds[0].ip, "10.0.0.1");
        let config = parse_config(
            r#"{"RonDBMetadataCluster": {"Mgmds": [{"IP": "10.0.0.2", "Port": 1186}]}}"#,
        )
        .unwrap();
        assert_eq!(config.metadata_cluster().mgmds[0].ip, "10.0.0.2");
    }

    #[test]
    fn validation_catches_problems() {
        let mut config = AppConfig::default();
        config.internal.req_buffer_size = 100;
        config.rondb.connection_pool_size = 2;
        config.security.api_key.cache_refresh_interval_jitter_ms = 20_000;
        config.security.tls.enable_tls = true;
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("ReqBufferSize")));
        assert!(problems.iter().any(|p| p.contains("connection pool size")));
        assert!(problems.iter().any(|p| p.contains("NodeIDs")));
        assert!(problems.iter().any(|p| p.contains("jitter")));
        assert!(problems.iter().any(|p| p.contains("TLS")));
    }

    #[test]
    fn connect_string_joins_mgmds() {
        let config = AppConfig::default();
        assert_eq!(config.rondb.connect_string(), "localhost:13000");
    }

    #[test]
    fn bad_json_is_an_error_not_a_default() {
        assert!(parse_config("{not json").is_err());
    }
}
