// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::errors::Error;

/// First fatal error raised by any component of a pipeline.
///
/// Raising it stores the error (later ones are only logged) and cancels the
/// token every long running task of the pipeline can watch. After that, the
/// commit path stops acknowledging offsets to the input.
#[derive(Debug, Default)]
pub struct FatalSignal {
    error: Mutex<Option<Error>>,
    token: CancellationToken,
}

impl FatalSignal {
    pub fn raise(&self, error: Error) {
        error!("PIPELINE | fatal error: {error}");
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.token.cancel();
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a fatal error was raised.
    pub async fn raised(&self) {
        self.token.cancelled().await;
    }

    /// Takes the stored error, leaving the signal raised.
    pub fn take(&self) -> Option<Error> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
