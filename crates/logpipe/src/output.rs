// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Output plugin contract and the router processors hand finished events to.

use std::sync::Arc;

use async_trait::async_trait;

use crate::batcher::{Batch, Batcher};
use crate::errors::{Error, OutputError};
use crate::event::{Event, Stage};

/// A sink receiving sealed batches.
///
/// `send` may be called concurrently from several output workers, each with
/// its own batch. A failed send is retried according to the configured
/// [`crate::retry::RetryStrategy`] unless the error is
/// [`OutputError::Permanent`].
#[async_trait]
pub trait Output: Send + Sync {
    async fn send(&self, batch: &Batch) -> Result<(), OutputError>;

    /// Periodic hook, run from an output worker between batches.
    async fn maintenance(&self) {}

    /// Called once after the last batch was committed.
    async fn stop(&self) {}
}

/// Entry point of the output side for processors.
#[derive(Debug, Clone)]
pub struct Router {
    batcher: Arc<Batcher>,
}

impl Router {
    #[must_use]
    pub fn new(batcher: Arc<Batcher>) -> Self {
        Self { batcher }
    }

    /// Queues an event that went through the whole chain for delivery.
    pub async fn out(&self, mut event: Box<Event>) -> Result<(), Error> {
        event.stage = Stage::Output;
        event.commit_only = false;
        self.batcher.add(event).await
    }

    /// Queues an event for commit only. It keeps its place in the commit
    /// order but is never sent.
    pub async fn commit(&self, mut event: Box<Event>) -> Result<(), Error> {
        event.stage = Stage::Output;
        event.commit_only = true;
        self.batcher.add(event).await
    }
}
