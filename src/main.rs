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

use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use log::{error, info, LevelFilter};
use rdrs2::args::RdrsArgs;
use rdrs2::buffers::BufferPool;
use rdrs2::cache::api_key::ApiKeyCache;
use rdrs2::cache::fs_cache::FsMetadataCache;
use rdrs2::config::{create_config, AppConfig};
use rdrs2::dal::native::NativeClient;
use rdrs2::feature_store::FeatureStoreCore;
use rdrs2::server::{self, ServerState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let _ = color_eyre::install();
    let args = match RdrsArgs::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let failed = err.use_stderr();
            let _ = err.print();
            return if failed { 1 } else { 0 };
        }
    };

    if args.help_config {
        print_config_help();
        return 0;
    }

    let config = match create_config(args.config_path().as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };

    init_logging(&config);

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("Configuration problem: {problem}");
        }
        return 1;
    }

    if args.print_config {
        match serde_json::to_string_pretty(&config) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => {
                eprintln!("Error rendering config: {err}");
                return 1;
            }
        }
        return 0;
    }

    // The main runtime only shuttles network IO; request handling runs on
    // blocking worker threads.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(config.rest.num_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to build runtime: {err}");
            return 1;
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(exit_code) => exit_code,
        Err(err) => {
            error!("Startup failure: {err:?}");
            eprintln!("Startup failure: {err}");
            1
        }
    }
}

fn init_logging(config: &AppConfig) {
    let level = config
        .log
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Warn);
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level.to_string()),
    );
    if !config.log.file_path.is_empty() {
        match std::fs::File::create(&config.log.file_path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(err) => eprintln!("Cannot open log file {}: {err}", config.log.file_path),
        }
    }
    let _ = builder.try_init();

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tower_http=warn,axum=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init();
}

/// Removes the PID file when the process leaves `serve`.
struct PidFile(Option<String>);

impl PidFile {
    fn write(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Ok(PidFile(None));
        }
        std::fs::write(path, std::process::id().to_string())?;
        Ok(PidFile(Some(path.to_string())))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Some(path) = &self.0 {
            if let Err(err) = std::fs::remove_file(path) {
                error!("Failed to remove PID file {path}: {err}");
            }
        }
    }
}

async fn serve(config: AppConfig) -> Result<i32> {
    let config = Arc::new(config);
    let _pid_file = PidFile::write(&config.pid_file)?;

    let data_client = NativeClient::connect(&config.rondb)
        .map_err(|e| color_eyre::eyre::eyre!("data cluster connection failed: {e}"))?;
    let metadata_client = NativeClient::connect(config.metadata_cluster())
        .map_err(|e| color_eyre::eyre::eyre!("metadata cluster connection failed: {e}"))?;

    let cache_settings = config.security.api_key.cache_settings();
    let core = Arc::new(FeatureStoreCore {
        config: Arc::clone(&config),
        metadata_cache: FsMetadataCache::new(cache_settings),
        metadata_backend: Arc::clone(&metadata_client) as _,
        api_key_cache: ApiKeyCache::new(Arc::clone(&metadata_client) as _, cache_settings),
        data_client: Arc::clone(&data_client) as _,
        buffer_pool: Arc::new(BufferPool::new(
            config.internal.req_buffer_size as usize,
            config.internal.resp_buffer_size as usize,
            config.internal.pre_allocated_buffers as usize,
        )),
    });
    let state = Arc::new(ServerState {
        core: Arc::clone(&core),
        agg_client: data_client as _,
        config: Arc::clone(&config),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<i32>();
    tokio::spawn(wait_for_signal(shutdown_tx));

    let shutdown = async move {
        if let Ok(code) = shutdown_rx.await {
            info!("Shutdown signal received");
            SIGNAL_EXIT_CODE.store(code, std::sync::atomic::Ordering::Release);
        }
    };
    server::try_run(state, shutdown).await?;
    let exit_code = SIGNAL_EXIT_CODE.load(std::sync::atomic::Ordering::Acquire);

    // In-flight requests have completed; drain the caches before dropping
    // them so no entry is freed while held.
    tokio::task::spawn_blocking(move || {
        core.api_key_cache.cleanup();
        core.metadata_cache.cleanup();
    })
    .await?;

    Ok(exit_code)
}

static SIGNAL_EXIT_CODE: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(0);

#[cfg(unix)]
async fn wait_for_signal(shutdown_tx: tokio::sync::oneshot::Sender<i32>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!("Cannot install SIGTERM handler: {err}");
            return;
        }
    };
    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => 128 + 2,
        _ = sigterm.recv() => 0,
    };
    let _ = shutdown_tx.send(code);
}

#[cfg(not(unix))]
async fn wait_for_signal(shutdown_tx: tokio::sync::oneshot::Sender<i32>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        let _ = shutdown_tx.send(128 + 2);
    }
}

fn print_config_help() {
    println!(
        "Configuration is read from a JSON file (--config PATH or the {env} \
         environment variable). Keys beginning with '#' are comments. All \
         options with their defaults:\n",
        env = rdrs2::config::CONFIG_FILE_ENV
    );
    let defaults = AppConfig::default();
    match serde_json::to_string_pretty(&defaults) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => eprintln!("Error rendering defaults: {err}"),
    }
    println!(
        "\nNotes:\n\
         - Internal.ReqBufferSize / RespBufferSize: bytes, >= 256, multiples of 4.\n\
         - RonDB.ConnectionPoolSize: currently only 1 is supported.\n\
         - RonDBMetadataCluster: same shape as RonDB; defaults to RonDB if absent.\n\
         - Security.APIKey.CacheUnusedEntriesEvictionMS must exceed CacheRefreshIntervalMS,\n\
           and CacheRefreshIntervalJitterMS must be below CacheRefreshIntervalMS.\n\
         - Log.Level: error, warn, info, debug or trace."
    );
}
