// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::batcher::Batch;
use crate::errors::{ConfigError, OutputError};
use crate::output::Output;

/// Accepts and drops everything. Useful to measure the engine alone.
#[derive(Debug, Default)]
pub struct DevNullOutput {
    events: AtomicU64,
}

impl DevNullOutput {
    /// Events received so far.
    #[must_use]
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Output for DevNullOutput {
    async fn send(&self, batch: &Batch) -> Result<(), OutputError> {
        self.events.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

pub fn factory(_params: &Value) -> Result<Arc<dyn Output>, ConfigError> {
    Ok(Arc::new(DevNullOutput::default()))
}
