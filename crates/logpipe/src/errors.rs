// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types of the event engine.
//!
//! Recoverable conditions (backpressure, transient send failures) never show
//! up here: they are absorbed by the component that owns the resource. What
//! remains is either returned to the caller that can act on it (decode
//! failures, configuration errors) or is fatal for the pipeline.

use crate::event::SourceId;
use ustr::Ustr;

/// Returned by [`crate::pool::EventPool`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The pool was closed while the caller was waiting for a slot.
    #[error("event pool is closed")]
    Closed,
    /// An event was released whose slot is not currently handed out.
    #[error("event slot {0} released while not in use")]
    NotInUse(usize),
    /// The slot index does not belong to this pool.
    #[error("event slot {0} is out of range for a pool of {1}")]
    UnknownSlot(usize, usize),
}

/// A raw record could not be turned into a document.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a json object, got {0}")]
    NotAnObject(&'static str),
    #[error("record is not valid utf-8")]
    Utf8,
}

/// Returned by [`crate::output::Output::send`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputError {
    /// Worth another attempt (network error, 5xx, timeout).
    #[error("retryable send failure: {0}")]
    Retryable(String),
    /// Retrying cannot help (4xx, malformed payload).
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

/// The offset checkpoint file could not be read or written.
#[derive(Debug, thiserror::Error)]
pub enum OffsetError {
    #[error("offset store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("offset store is corrupted: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration could not be loaded or does not describe a valid pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("unknown {kind} plugin: {name}")]
    UnknownPlugin { kind: &'static str, name: String },
    #[error("invalid params for {plugin}: {reason}")]
    InvalidParams { plugin: String, reason: String },
    #[error("invalid match condition on field {field}: {source}")]
    InvalidMatch {
        field: String,
        #[source]
        source: regex::Error,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("unknown decoder: {0}")]
    UnknownDecoder(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Load(Box::new(e))
    }
}

/// Pipeline level errors.
///
/// Everything except [`Error::Stopped`], [`Error::Decode`],
/// [`Error::TooLarge`] and the startup errors is fatal: it means delivery
/// guarantees are already broken and the pipeline shuts itself down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pipeline is stopped")]
    Stopped,
    #[error("failed to decode record from source {source_id}: {error}")]
    Decode {
        source_id: SourceId,
        #[source]
        error: DecodeError,
    },
    #[error("record of {size} bytes exceeds the {max} bytes limit")]
    TooLarge { size: usize, max: usize },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("action {action} (index {index}) returned Hold but did not take the event")]
    HoldRejected { action: String, index: usize },
    #[error("offset regression on source {source_id} stream {stream}: committed {offset} after {last}")]
    OffsetRegression {
        source_id: SourceId,
        stream: Ustr,
        offset: i64,
        last: i64,
    },
    #[error("processor {id} panicked: {reason}")]
    ProcessorPanicked { id: usize, reason: String },
    #[error("batch {seq} could not be delivered: {error}")]
    DeliveryFailed {
        seq: u64,
        #[source]
        error: OutputError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Offsets(#[from] OffsetError),
}

impl Error {
    /// Whether the error breaks delivery guarantees and must stop the pipeline.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Stopped
                | Error::Decode { .. }
                | Error::TooLarge { .. }
                | Error::Config(_)
                | Error::Offsets(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = Error::OffsetRegression {
            source_id: SourceId(7),
            stream: ustr::ustr("stdout"),
            offset: 10,
            last: 20,
        };
        assert_eq!(
            error.to_string(),
            "offset regression on source 7 stream stdout: committed 10 after 20"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(!Error::Stopped.is_fatal());
        assert!(!Error::TooLarge { size: 2, max: 1 }.is_fatal());
        assert!(Error::Pool(PoolError::NotInUse(3)).is_fatal());
        assert!(Error::HoldRejected {
            action: "join".to_string(),
            index: 0
        }
        .is_fatal());
    }
}
