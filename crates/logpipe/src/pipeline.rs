// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wiring of the engine: pool, streamer, processors and batcher.
//!
//! ```text
//!  submit ──> EventPool.get ──> decode ──> Stream.put
//!                                              │
//!                        Processor 1..P <── Streamer.reserve
//!                              │
//!                          Router ──> Batcher ──> Output.send
//!                                        │
//!                                   CommitPath ──> Input.commit ──> EventPool.release
//! ```

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hashbrown::HashMap;
use tokio::sync::RwLock;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ustr::Ustr;

use crate::action::ActionSpec;
use crate::batcher::{Batcher, BatcherSettings, Committer, DeadLetter};
use crate::constants::{
    DEFAULT_CAPACITY, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_EVENT_SIZE,
    DEFAULT_STREAM_BLOCK_TIMEOUT, DEFAULT_STREAM_QUEUE_SIZE,
};
use crate::decoder::{Decoder, JsonDecoder};
use crate::errors::{ConfigError, Error, PoolError};
use crate::event::{Event, SeqId, SourceId};
use crate::fatal::FatalSignal;
use crate::input::Input;
use crate::output::{Output, Router};
use crate::pool::EventPool;
use crate::processor::Processor;
use crate::stats::{ChainCounters, PipelineStats};
use crate::streamer::Streamer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Events in flight across the whole pipeline.
    pub capacity: usize,
    pub processors: usize,
    pub stream_queue_size: usize,
    pub max_event_size: usize,
    pub stream_block_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            processors: available_cpus(),
            stream_queue_size: DEFAULT_STREAM_QUEUE_SIZE,
            max_event_size: DEFAULT_MAX_EVENT_SIZE,
            stream_block_timeout: DEFAULT_STREAM_BLOCK_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

pub(crate) fn available_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Used when the pipeline is built without an input to acknowledge to.
struct NoCheckpoint;

impl Input for NoCheckpoint {
    fn commit(&self, _event: &Event) {}
}

/// Last stop of every event: checks offsets, acknowledges to the input and
/// gives the slot back to the pool.
struct CommitPath {
    pool: Arc<EventPool>,
    input: Arc<dyn Input>,
    fatal: Arc<FatalSignal>,
    last_offsets: Mutex<HashMap<(SourceId, Ustr), i64>>,
}

impl CommitPath {
    fn check_offset(&self, event: &Event) -> Result<(), Error> {
        let mut last_offsets = self
            .last_offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let key = (event.source_id, event.stream_name);
        if let Some(&last) = last_offsets.get(&key) {
            if event.offset <= last {
                return Err(Error::OffsetRegression {
                    source_id: event.source_id,
                    stream: event.stream_name,
                    offset: event.offset,
                    last,
                });
            }
        }
        last_offsets.insert(key, event.offset);
        Ok(())
    }
}

impl Committer for CommitPath {
    fn commit(&self, event: Box<Event>) {
        // once fatal, nothing is acknowledged anymore so the input replays it
        if event.is_pooled() && !self.fatal.is_raised() {
            match self.check_offset(&event) {
                Ok(()) => self.input.commit(&event),
                Err(e) => self.fatal.raise(e),
            }
        }
        if let Err(e) = self.pool.release(event) {
            self.fatal.raise(e.into());
        }
    }

    fn release(&self, event: Box<Event>) {
        if let Err(e) = self.pool.release(event) {
            self.fatal.raise(e.into());
        }
    }
}

pub struct PipelineBuilder {
    settings: PipelineSettings,
    batcher: BatcherSettings,
    actions: Vec<ActionSpec>,
    output: Arc<dyn Output>,
    input: Arc<dyn Input>,
    decoder: Arc<dyn Decoder>,
    dead_letter: Option<DeadLetter>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(settings: PipelineSettings, output: Arc<dyn Output>) -> Self {
        Self {
            settings,
            batcher: BatcherSettings::default(),
            actions: Vec::new(),
            output,
            input: Arc::new(NoCheckpoint),
            decoder: Arc::new(JsonDecoder::default()),
            dead_letter: None,
        }
    }

    #[must_use]
    pub fn batcher(mut self, settings: BatcherSettings) -> Self {
        self.batcher = settings;
        self
    }

    /// Appends an action to the chain.
    #[must_use]
    pub fn action(mut self, spec: ActionSpec) -> Self {
        self.actions.push(spec);
        self
    }

    #[must_use]
    pub fn actions(mut self, specs: impl IntoIterator<Item = ActionSpec>) -> Self {
        self.actions.extend(specs);
        self
    }

    #[must_use]
    pub fn input(mut self, input: Arc<dyn Input>) -> Self {
        self.input = input;
        self
    }

    #[must_use]
    pub fn decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = decoder;
        self
    }

    #[must_use]
    pub fn dead_letter(mut self, dead_letter: DeadLetter) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    /// Validates the settings and spawns every task of the pipeline.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<Arc<Pipeline>, ConfigError> {
        let settings = self.settings;
        if settings.capacity == 0 {
            return Err(ConfigError::Zero("capacity"));
        }
        if settings.processors == 0 {
            return Err(ConfigError::Zero("processors"));
        }
        if settings.stream_queue_size == 0 {
            return Err(ConfigError::Zero("stream_queue_size"));
        }
        if settings.max_event_size == 0 {
            return Err(ConfigError::Zero("max_event_size"));
        }
        if settings.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("heartbeat_interval"));
        }
        if self.batcher.batch_size == 0 {
            return Err(ConfigError::Zero("batch_size"));
        }
        if self.batcher.workers == 0 {
            return Err(ConfigError::Zero("workers"));
        }
        if self.batcher.flush_timeout.is_zero() {
            return Err(ConfigError::Zero("flush_timeout"));
        }
        if self.batcher.maintenance_interval.is_zero() {
            return Err(ConfigError::Zero("maintenance_interval"));
        }

        let fatal = Arc::new(FatalSignal::default());
        let pool = Arc::new(EventPool::new(settings.capacity));
        let streamer = Arc::new(Streamer::new(
            settings.stream_queue_size,
            settings.stream_block_timeout,
        ));
        let committer = Arc::new(CommitPath {
            pool: Arc::clone(&pool),
            input: self.input,
            fatal: Arc::clone(&fatal),
            last_offsets: Mutex::new(HashMap::new()),
        });
        let mut batcher = Batcher::new(
            self.batcher,
            Arc::clone(&self.output),
            committer,
            Arc::clone(&fatal),
        );
        if let Some(dead_letter) = self.dead_letter {
            batcher = batcher.with_dead_letter(dead_letter);
        }
        let batcher = Arc::new(batcher);
        batcher.start();

        let specs: Arc<[ActionSpec]> = self.actions.into();
        let counters = Arc::new(ChainCounters::new(
            specs.iter().map(|spec| spec.name.clone()).collect(),
        ));
        let processors = (0..settings.processors)
            .map(|id| {
                let processor = Processor::new(
                    id,
                    Arc::clone(&streamer),
                    Router::new(Arc::clone(&batcher)),
                    Arc::clone(&specs),
                    Arc::clone(&counters),
                    Arc::clone(&fatal),
                );
                supervise(id, tokio::spawn(processor.run()), Arc::clone(&fatal))
            })
            .collect();

        let heartbeat_cancel = CancellationToken::new();
        let heartbeat = tokio::spawn(
            Arc::clone(&streamer).run_heartbeat(settings.heartbeat_interval, heartbeat_cancel.clone()),
        );

        info!(
            "PIPELINE | started with {} processors, {} actions, capacity {}",
            settings.processors,
            specs.len(),
            settings.capacity
        );

        Ok(Arc::new(Pipeline {
            settings,
            pool,
            streamer,
            batcher,
            output: self.output,
            decoder: self.decoder,
            counters,
            fatal,
            accepting: RwLock::new(true),
            processors: Mutex::new(processors),
            heartbeat: Mutex::new(Some(heartbeat)),
            heartbeat_cancel,
        }))
    }
}

/// Turns a processor panic into a fatal error as soon as it happens.
fn supervise(id: usize, task: JoinHandle<()>, fatal: Arc<FatalSignal>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = task.await {
            fatal.raise(Error::ProcessorPanicked {
                id,
                reason: panic_reason(e),
            });
        }
    })
}

fn panic_reason(error: JoinError) -> String {
    if error.is_cancelled() {
        return "task was cancelled".to_string();
    }
    let payload: Box<dyn Any + Send> = error.into_panic();
    if let Some(reason) = payload.downcast_ref::<&str>() {
        (*reason).to_string()
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub struct Pipeline {
    settings: PipelineSettings,
    pool: Arc<EventPool>,
    streamer: Arc<Streamer>,
    batcher: Arc<Batcher>,
    output: Arc<dyn Output>,
    decoder: Arc<dyn Decoder>,
    counters: Arc<ChainCounters>,
    fatal: Arc<FatalSignal>,
    accepting: RwLock<bool>,
    processors: Mutex<Vec<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    heartbeat_cancel: CancellationToken,
}

impl Pipeline {
    #[must_use]
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Decodes `raw` and queues it on its stream.
    ///
    /// Suspends while the pool is exhausted or the stream queue is full.
    /// `offset` is handed back to the input through [`Input::commit`] once
    /// the record is delivered, and must grow with every record of a stream.
    pub async fn submit(
        &self,
        source_id: SourceId,
        source_name: &str,
        offset: i64,
        raw: &[u8],
    ) -> Result<SeqId, Error> {
        let accepting = self.accepting.read().await;
        if !*accepting || self.fatal.is_raised() {
            return Err(Error::Stopped);
        }
        if raw.len() > self.settings.max_event_size {
            warn!(
                "PIPELINE | skipping record of {} bytes from {source_name} at offset {offset}, the limit is {} bytes",
                raw.len(),
                self.settings.max_event_size
            );
            return Err(Error::TooLarge {
                size: raw.len(),
                max: self.settings.max_event_size,
            });
        }

        // a fatal error may leave slots or streams nobody drains anymore, so
        // every wait below gives up once it is raised
        let mut event = tokio::select! {
            event = self.pool.get() => event.map_err(|e| match e {
                PoolError::Closed => Error::Stopped,
                other => Error::Pool(other),
            })?,
            () = self.fatal.raised() => return Err(Error::Stopped),
        };
        event.source_id = source_id;
        event.source_name = Ustr::from(source_name);
        event.offset = offset;
        event.size = raw.len();
        if let Err(error) = self.decoder.decode(raw, &mut event) {
            self.pool.release(event)?;
            return Err(Error::Decode { source_id, error });
        }

        let stream = self.streamer.stream(source_id, event.stream_name);
        let seq_id = tokio::select! {
            seq_id = stream.put(event) => seq_id,
            () = self.fatal.raised() => return Err(Error::Stopped),
        };
        drop(accepting);
        Ok(seq_id)
    }

    /// Resolves once a fatal error was raised. [`Pipeline::stop`] returns it.
    pub async fn wait_fatal(&self) {
        self.fatal.raised().await;
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.fatal.is_raised()
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            events_in_use: self.pool.in_use(),
            streams: self.streamer.stream_count(),
            actions: self.counters.snapshot(),
            batcher: self.batcher.counters().snapshot(),
        }
    }

    /// Drains everything in flight and stops every task.
    ///
    /// Returns the first fatal error raised during the pipeline's life.
    pub async fn stop(&self) -> Result<(), Error> {
        *self.accepting.write().await = false;
        debug!("PIPELINE | input closed, draining");

        self.streamer.stop();
        let processors =
            std::mem::take(&mut *self.processors.lock().unwrap_or_else(PoisonError::into_inner));
        for processor in processors {
            if let Err(e) = processor.await {
                error!("PIPELINE | processor supervisor failed: {e}");
            }
        }

        self.heartbeat_cancel.cancel();
        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(heartbeat) = heartbeat {
            if let Err(e) = heartbeat.await {
                error!("PIPELINE | heartbeat failed: {e}");
            }
        }

        self.batcher.stop().await;
        self.output.stop().await;
        self.pool.close();
        info!("PIPELINE | stopped");

        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("settings", &self.settings)
            .field("batcher", &self.batcher)
            .finish_non_exhaustive()
    }
}
