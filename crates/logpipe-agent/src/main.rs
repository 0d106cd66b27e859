// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod stdin;

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logpipe::config::{Config, InputKind};
use logpipe::offsets::OffsetStore;
use logpipe::plugins::inputs::FileInput;
use logpipe::{Pipeline, PluginRegistry};

use crate::stdin::StdinInput;

enum Reader {
    Stdin(Arc<StdinInput>),
    File(Arc<FileInput>),
}

impl Reader {
    async fn run(self, pipeline: Arc<Pipeline>, cancel: CancellationToken) -> u64 {
        match self {
            Reader::Stdin(input) => input.run(pipeline, cancel).await,
            Reader::File(input) => input.run(pipeline, cancel).await,
        }
    }
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("LOGPIPE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
    debug!("Logging subsystem enabled");

    let config_path = env::args_os()
        .nth(1)
        .or_else(|| env::var_os("LOGPIPE_CONFIG"))
        .map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), logpipe::Error> {
    let registry = PluginRegistry::default();
    let builder = config.pipeline_builder(&registry)?;

    let persistence_cancel = CancellationToken::new();
    let mut persistence: Option<JoinHandle<()>> = None;
    let mut stdin: Option<Arc<StdinInput>> = None;
    let (reader, builder) = match config.input.kind {
        InputKind::Stdin => {
            let input = Arc::new(StdinInput::default());
            stdin = Some(Arc::clone(&input));
            let builder = builder.input(input.clone());
            (Reader::Stdin(input), builder)
        }
        InputKind::File => {
            let store = Arc::new(OffsetStore::load(&config.input.offsets_file).await?);
            let input = Arc::new(FileInput::new(
                config.input.paths.clone(),
                store,
                Duration::from_millis(config.input.persistence_interval_ms),
            ));
            persistence = Some(tokio::spawn(
                Arc::clone(&input).run_persistence(persistence_cancel.clone()),
            ));
            let builder = builder.input(input.clone());
            (Reader::File(input), builder)
        }
    };

    let pipeline = builder.start()?;
    let reader_cancel = CancellationToken::new();
    let mut reader_task = tokio::spawn(reader.run(Arc::clone(&pipeline), reader_cancel.clone()));

    tokio::select! {
        submitted = &mut reader_task => {
            match submitted {
                Ok(submitted) => info!("Input exhausted after {submitted} records"),
                Err(e) => error!("Input task failed: {e}"),
            }
        }
        () = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        () = pipeline.wait_fatal() => {}
    }

    reader_cancel.cancel();
    if !reader_task.is_finished() {
        if let Err(e) = reader_task.await {
            error!("Input task failed: {e}");
        }
    }
    let result = pipeline.stop().await;
    info!("Pipeline stats: {:?}", pipeline.stats());
    if let Some(stdin) = stdin {
        info!("Stdin acknowledged up to offset {}", stdin.committed());
    }

    persistence_cancel.cancel();
    if let Some(persistence) = persistence {
        if let Err(e) = persistence.await {
            error!("Offset persistence task failed: {e}");
        }
    }
    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
