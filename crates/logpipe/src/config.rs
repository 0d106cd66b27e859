// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline configuration.
//!
//! Sources are merged in this order, later ones winning:
//!
//! 1. defaults (see [`crate::constants`]);
//! 2. an optional YAML file;
//! 3. `LOGPIPE_` environment variables, `__` separating nested keys, e.g.
//!    `LOGPIPE_PIPELINE__CAPACITY=4096` or `LOGPIPE_OUTPUT__TYPE=http`.
//!
//! ```yaml
//! pipeline:
//!   capacity: 4096
//!   decoder: json
//!   stream_field: stream
//! actions:
//!   - type: discard
//!     match_fields:
//!       path: '/^GET /health/'
//!   - type: mask
//!     params:
//!       pattern: 'password=\S+'
//! output:
//!   type: http
//!   batch_size: 500
//!   retry:
//!     strategy: linear_backoff
//!     attempts: 3
//!     delay_ms: 250
//!   params:
//!     endpoint: https://logs.example.com/v1/input
//! input:
//!   type: file
//!   paths: [/var/log/app.log]
//! ```
//!
//! Zero values meaning "one per logical CPU" (`processors`, `workers`) are
//! resolved when settings are built.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;
use serde_json::Value;

use crate::action::{ActionSpec, MatchConditions, MatchMode};
use crate::batcher::BatcherSettings;
use crate::constants::{
    DEFAULT_BATCH_FLUSH_TIMEOUT, DEFAULT_BATCH_SIZE, DEFAULT_CAPACITY,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAINTENANCE_INTERVAL, DEFAULT_MAX_EVENT_SIZE,
    DEFAULT_STREAM_BLOCK_TIMEOUT, DEFAULT_STREAM_QUEUE_SIZE,
};
use crate::decoder::decoder_for;
use crate::errors::ConfigError;
use crate::pipeline::{available_cpus, PipelineBuilder, PipelineSettings};
use crate::registry::PluginRegistry;
use crate::retry::RetryStrategy;

const ENV_PREFIX: &str = "LOGPIPE_";

#[allow(clippy::cast_possible_truncation)]
fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub capacity: usize,
    /// 0 runs one processor per logical CPU.
    pub processors: usize,
    pub stream_queue_size: usize,
    pub decoder: String,
    pub stream_field: Option<String>,
    pub max_event_size: usize,
    pub stream_block_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            processors: 0,
            stream_queue_size: DEFAULT_STREAM_QUEUE_SIZE,
            decoder: "json".to_string(),
            stream_field: None,
            max_event_size: DEFAULT_MAX_EVENT_SIZE,
            stream_block_timeout_ms: millis(DEFAULT_STREAM_BLOCK_TIMEOUT),
            heartbeat_interval_ms: millis(DEFAULT_HEARTBEAT_INTERVAL),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActionConfig {
    #[serde(rename = "type")]
    pub kind: String,
    /// Name used in stats, defaults to the type.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub match_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub match_invert: bool,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub batch_size: usize,
    pub batch_flush_timeout_ms: u64,
    /// 0 runs one worker per logical CPU.
    pub workers: usize,
    pub maintenance_interval_ms: u64,
    pub retry: RetryStrategy,
    pub fatal_on_failure: bool,
    pub params: Value,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            kind: "stdout".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_flush_timeout_ms: millis(DEFAULT_BATCH_FLUSH_TIMEOUT),
            workers: 0,
            maintenance_interval_ms: millis(DEFAULT_MAINTENANCE_INTERVAL),
            retry: RetryStrategy::default(),
            fatal_on_failure: false,
            params: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    #[default]
    Stdin,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    #[serde(rename = "type")]
    pub kind: InputKind,
    pub paths: Vec<PathBuf>,
    pub offsets_file: PathBuf,
    pub persistence_interval_ms: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            kind: InputKind::Stdin,
            paths: Vec::new(),
            offsets_file: PathBuf::from("offsets.json"),
            persistence_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub actions: Vec<ActionConfig>,
    pub output: OutputConfig,
    pub input: InputConfig,
}

impl Config {
    /// Loads the configuration from `path` (when given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks what can be checked without building plugins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.capacity == 0 {
            return Err(ConfigError::Zero("pipeline.capacity"));
        }
        if self.pipeline.stream_queue_size == 0 {
            return Err(ConfigError::Zero("pipeline.stream_queue_size"));
        }
        if self.pipeline.max_event_size == 0 {
            return Err(ConfigError::Zero("pipeline.max_event_size"));
        }
        if self.pipeline.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Zero("pipeline.heartbeat_interval_ms"));
        }
        if self.output.batch_size == 0 {
            return Err(ConfigError::Zero("output.batch_size"));
        }
        if self.output.batch_flush_timeout_ms == 0 {
            return Err(ConfigError::Zero("output.batch_flush_timeout_ms"));
        }
        if self.output.maintenance_interval_ms == 0 {
            return Err(ConfigError::Zero("output.maintenance_interval_ms"));
        }
        if self.input.kind == InputKind::File {
            if self.input.paths.is_empty() {
                return Err(ConfigError::InvalidParams {
                    plugin: "file".to_string(),
                    reason: "at least one path is required".to_string(),
                });
            }
            if self.input.persistence_interval_ms == 0 {
                return Err(ConfigError::Zero("input.persistence_interval_ms"));
            }
        }
        decoder_for(&self.pipeline.decoder, None)?;
        Ok(())
    }

    #[must_use]
    pub fn pipeline_settings(&self) -> PipelineSettings {
        let pipeline = &self.pipeline;
        PipelineSettings {
            capacity: pipeline.capacity,
            processors: match pipeline.processors {
                0 => available_cpus(),
                n => n,
            },
            stream_queue_size: pipeline.stream_queue_size,
            max_event_size: pipeline.max_event_size,
            stream_block_timeout: Duration::from_millis(pipeline.stream_block_timeout_ms),
            heartbeat_interval: Duration::from_millis(pipeline.heartbeat_interval_ms),
        }
    }

    #[must_use]
    pub fn batcher_settings(&self) -> BatcherSettings {
        let output = &self.output;
        BatcherSettings {
            batch_size: output.batch_size,
            flush_timeout: Duration::from_millis(output.batch_flush_timeout_ms),
            workers: match output.workers {
                0 => available_cpus(),
                n => n,
            },
            maintenance_interval: Duration::from_millis(output.maintenance_interval_ms),
            retry: output.retry.clone(),
            fatal_on_failure: output.fatal_on_failure,
        }
    }

    /// Builds the action chain, in configuration order.
    pub fn action_specs(&self, registry: &PluginRegistry) -> Result<Vec<ActionSpec>, ConfigError> {
        self.actions
            .iter()
            .map(|action| {
                let factory = registry.action(&action.kind, &action.params)?;
                let conditions = MatchConditions::new(
                    &action.match_fields,
                    action.match_mode,
                    action.match_invert,
                )?;
                let name = action.name.clone().unwrap_or_else(|| action.kind.clone());
                Ok(ActionSpec::new(name, factory).with_conditions(conditions))
            })
            .collect()
    }

    /// Everything but the input, ready to be started.
    pub fn pipeline_builder(
        &self,
        registry: &PluginRegistry,
    ) -> Result<PipelineBuilder, ConfigError> {
        let output = registry.output(&self.output.kind, &self.output.params)?;
        let decoder = decoder_for(&self.pipeline.decoder, self.pipeline.stream_field.clone())?;
        Ok(PipelineBuilder::new(self.pipeline_settings(), output)
            .batcher(self.batcher_settings())
            .actions(self.action_specs(registry)?)
            .decoder(decoder))
    }
}
