// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # logpipe
//!
//! Event execution engine for log collection pipelines.
//!
//! Records pushed by an input are decoded into pooled [`event::Event`]s,
//! queued on the stream they belong to, driven through a chain of actions by
//! a set of processors and delivered in batches by parallel output workers.
//! Whatever the order batches finish in, commits reach the input in the
//! order the batches were sealed, so every stream is acknowledged in order
//! and a restart replays at most what was in flight.
//!
//! - [`pool`]: fixed number of reusable events, the bound on memory;
//! - [`stream`] / [`streamer`]: per (source, stream) queues handed to one
//!   processor at a time;
//! - [`processor`]: runs the [`action`] chain;
//! - [`batcher`]: size and time bounded batches with ordered commits;
//! - [`pipeline`]: wires all of the above.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod action;
pub mod batcher;
pub mod config;
pub mod constants;
pub mod decoder;
pub mod errors;
pub mod event;
pub mod fatal;
pub mod input;
pub mod offsets;
pub mod output;
pub mod pipeline;
pub mod plugins;
pub mod pool;
pub mod processor;
pub mod registry;
pub mod retry;
pub mod stats;
pub mod stream;
pub mod streamer;

pub use action::{Action, ActionController, ActionResult, ActionSpec, MatchConditions};
pub use batcher::{Batch, BatcherSettings};
pub use config::Config;
pub use errors::{ConfigError, Error};
pub use event::{Event, SourceId};
pub use input::Input;
pub use output::Output;
pub use pipeline::{Pipeline, PipelineBuilder, PipelineSettings};
pub use registry::PluginRegistry;
