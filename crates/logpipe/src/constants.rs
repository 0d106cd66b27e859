// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Default limits and intervals for the event engine.
//!
//! Every value here can be overridden through [`crate::config`]; these are the
//! values used when a setting is absent.

use std::time::Duration;

/// Default number of event slots in the [`crate::pool::EventPool`].
///
/// This is the hard cap on events in flight across the whole pipeline: an
/// event occupies its slot from `submit` until its batch is committed.
pub const DEFAULT_CAPACITY: usize = 1_024;

/// Default bound of a single stream queue before producers are suspended.
pub const DEFAULT_STREAM_QUEUE_SIZE: usize = 256;

/// Records larger than this are skipped by the input side with a warning.
///
/// # Value: 1MB (1,048,576 bytes)
pub const DEFAULT_MAX_EVENT_SIZE: usize = 1_024 * 1_024;

/// How long a processor may wait on a same-stream follow-up event before the
/// heartbeat releases it with a timeout event.
pub const DEFAULT_STREAM_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Period of the streamer heartbeat that sweeps blocked streams.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of events per output batch.
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Default age after which a partially filled batch is sealed.
pub const DEFAULT_BATCH_FLUSH_TIMEOUT: Duration = Duration::from_millis(200);

/// Default period of the output maintenance hook.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// Stream name used when the decoder does not provide one.
pub const DEFAULT_STREAM_NAME: &str = "not_set";

/// Number of reusable batches allocated per output worker.
///
/// Two per worker lets one batch be filled while another is in transmission.
pub(crate) const BATCHES_PER_WORKER: usize = 2;
