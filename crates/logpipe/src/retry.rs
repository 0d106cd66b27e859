// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::errors::OutputError;

/// How a failed send is retried.
///
/// `attempts` counts every call, the first one included.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryStrategy {
    Immediate {
        attempts: u32,
    },
    LinearBackoff {
        attempts: u32,
        delay_ms: u64,
    },
    ExponentialBackoff {
        attempts: u32,
        base_ms: u64,
        max_ms: u64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::ExponentialBackoff {
            attempts: 5,
            base_ms: 100,
            max_ms: 10_000,
        }
    }
}

impl RetryStrategy {
    #[must_use]
    pub fn attempts(&self) -> u32 {
        let attempts = match self {
            RetryStrategy::Immediate { attempts }
            | RetryStrategy::LinearBackoff { attempts, .. }
            | RetryStrategy::ExponentialBackoff { attempts, .. } => *attempts,
        };
        attempts.max(1)
    }

    /// Pause before the attempt following `failed` failed attempts.
    #[must_use]
    pub fn delay(&self, failed: u32) -> Duration {
        match self {
            RetryStrategy::Immediate { .. } => Duration::ZERO,
            RetryStrategy::LinearBackoff { delay_ms, .. } => {
                Duration::from_millis(delay_ms.saturating_mul(u64::from(failed)))
            }
            RetryStrategy::ExponentialBackoff {
                base_ms, max_ms, ..
            } => {
                let factor = 1_u64
                    .checked_shl(failed.saturating_sub(1))
                    .unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor).min(*max_ms))
            }
        }
    }

    /// Calls `op` until it succeeds, fails permanently or runs out of
    /// attempts. The last error is returned.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T, OutputError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OutputError>>,
    {
        let attempts = self.attempts();
        let mut failed = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e @ OutputError::Permanent(_)) => return Err(e),
                Err(e) => {
                    failed += 1;
                    if failed >= attempts {
                        return Err(e);
                    }
                    let delay = self.delay(failed);
                    debug!("RETRY | attempt {failed}/{attempts} failed: {e}, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
