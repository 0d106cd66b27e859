// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size and time bounded batching with ordered commits.
//!
//! ```text
//!             add()                seal (seq = n)
//!   events ─────────> open batch ─────────────────> full queue
//!                         ^                             │
//!                         │ free batch                  │ worker 1..W
//!                         │                             v
//!                    free queue <──── swap events ── send (retry)
//!                                            │
//!                                            v
//!                                 wait until gate == n
//!                                 commit events, gate = n + 1
//! ```
//!
//! Batches are allocated once (`BATCHES_PER_WORKER` per worker) and
//! recycled. A worker hands its batch back to the free queue before waiting
//! for its commit turn, so a slow commit never starves the producers of
//! batches.
//!
//! The commit gate is separate from the open batch lock: waiting for a turn
//! never blocks `add` or sealing.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::constants::{
    BATCHES_PER_WORKER, DEFAULT_BATCH_FLUSH_TIMEOUT, DEFAULT_BATCH_SIZE,
    DEFAULT_MAINTENANCE_INTERVAL,
};
use crate::errors::{Error, OutputError};
use crate::event::Event;
use crate::fatal::FatalSignal;
use crate::output::Output;
use crate::retry::RetryStrategy;
use crate::stats::BatcherCounters;

/// Acknowledges events back to their input once their batch is committed.
pub trait Committer: Send + Sync {
    fn commit(&self, event: Box<Event>);

    /// Gives back an event that will never be committed, without
    /// acknowledging it to the input.
    fn release(&self, event: Box<Event>);
}

/// Receives batches whose delivery failed for good.
pub type DeadLetter = Arc<dyn Fn(&Batch, &OutputError) + Send + Sync>;

/// A group of events sent to the output in one call.
pub struct Batch {
    events: Vec<Box<Event>>,
    seq: u64,
    created: Instant,
    deliverable: usize,
}

impl Batch {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            seq: 0,
            created: Instant::now(),
            deliverable: 0,
        }
    }

    pub(crate) fn push(&mut self, event: Box<Event>) {
        if !event.commit_only {
            self.deliverable += 1;
        }
        self.events.push(event);
    }

    fn reset(&mut self) {
        self.events.clear();
        self.seq = 0;
        self.deliverable = 0;
    }

    /// Position of the batch in seal order, starting at 1.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Number of events to deliver.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deliverable
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deliverable == 0
    }

    /// Events to deliver, in the order they were added. Entries queued only
    /// for their commit are skipped.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events
            .iter()
            .filter(|event| !event.commit_only)
            .map(|event| &**event)
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("seq", &self.seq)
            .field("entries", &self.events.len())
            .field("deliverable", &self.deliverable)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatcherSettings {
    pub batch_size: usize,
    pub flush_timeout: Duration,
    pub workers: usize,
    pub maintenance_interval: Duration,
    pub retry: RetryStrategy,
    /// Stop the pipeline instead of dead-lettering a batch that could not be
    /// delivered.
    pub fatal_on_failure: bool,
}

impl Default for BatcherSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_timeout: DEFAULT_BATCH_FLUSH_TIMEOUT,
            workers: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            retry: RetryStrategy::default(),
            fatal_on_failure: false,
        }
    }
}

struct OpenState {
    current: Option<Batch>,
    free_rx: mpsc::Receiver<Batch>,
    next_seq: u64,
    full_tx: Option<mpsc::Sender<Batch>>,
}

pub struct Batcher {
    settings: BatcherSettings,
    open: tokio::sync::Mutex<OpenState>,
    free_tx: mpsc::Sender<Batch>,
    full_rx: tokio::sync::Mutex<mpsc::Receiver<Batch>>,
    commit_gate: watch::Sender<u64>,
    output: Arc<dyn Output>,
    committer: Arc<dyn Committer>,
    dead_letter: DeadLetter,
    fatal: Arc<FatalSignal>,
    counters: Arc<BatcherCounters>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ticker_cancel: CancellationToken,
}

impl Batcher {
    #[must_use]
    pub fn new(
        settings: BatcherSettings,
        output: Arc<dyn Output>,
        committer: Arc<dyn Committer>,
        fatal: Arc<FatalSignal>,
    ) -> Self {
        let settings = BatcherSettings {
            batch_size: settings.batch_size.max(1),
            workers: settings.workers.max(1),
            ..settings
        };
        let total = settings.workers * BATCHES_PER_WORKER;
        let (free_tx, free_rx) = mpsc::channel(total);
        for _ in 0..total {
            // the channel is sized for every batch, this cannot fail
            let _ = free_tx.try_send(Batch::with_capacity(settings.batch_size));
        }
        let (full_tx, full_rx) = mpsc::channel(total);
        let (commit_gate, _) = watch::channel(1);

        Self {
            settings,
            open: tokio::sync::Mutex::new(OpenState {
                current: None,
                free_rx,
                next_seq: 1,
                full_tx: Some(full_tx),
            }),
            free_tx,
            full_rx: tokio::sync::Mutex::new(full_rx),
            commit_gate,
            output,
            committer,
            dead_letter: Arc::new(log_dead_letter),
            fatal,
            counters: Arc::new(BatcherCounters::default()),
            tasks: Mutex::new(Vec::new()),
            ticker_cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_dead_letter(mut self, dead_letter: DeadLetter) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    /// Spawns the output workers and the flush ticker.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for id in 0..self.settings.workers {
            tasks.push(tokio::spawn(Arc::clone(self).run_worker(id)));
        }
        tasks.push(tokio::spawn(Arc::clone(self).run_flush_ticker()));
        debug!(
            "BATCHER | started {} workers, batch size {}",
            self.settings.workers, self.settings.batch_size
        );
    }

    #[must_use]
    pub fn settings(&self) -> &BatcherSettings {
        &self.settings
    }

    #[must_use]
    pub fn counters(&self) -> &BatcherCounters {
        &self.counters
    }

    /// Appends an event to the open batch, sealing it when full.
    ///
    /// Suspends while every batch is in use.
    pub async fn add(&self, event: Box<Event>) -> Result<(), Error> {
        let mut open = self.open.lock().await;
        if open.full_tx.is_none() {
            self.committer.release(event);
            return Err(Error::Stopped);
        }
        let mut batch = match open.current.take() {
            Some(batch) => batch,
            None => {
                let Some(mut batch) = open.free_rx.recv().await else {
                    self.committer.release(event);
                    return Err(Error::Stopped);
                };
                batch.created = Instant::now();
                batch
            }
        };
        batch.push(event);
        if batch.events.len() >= self.settings.batch_size {
            self.seal(&mut open, batch).await;
        } else {
            open.current = Some(batch);
        }
        Ok(())
    }

    /// Seals the open batch whatever its age.
    pub async fn flush(&self) {
        let mut open = self.open.lock().await;
        if let Some(batch) = open.current.take() {
            self.seal(&mut open, batch).await;
        }
    }

    async fn flush_expired(&self) {
        let mut open = self.open.lock().await;
        match open.current.take() {
            Some(batch) if batch.age() >= self.settings.flush_timeout => {
                self.seal(&mut open, batch).await;
            }
            other => open.current = other,
        }
    }

    async fn seal(&self, open: &mut OpenState, mut batch: Batch) {
        batch.seq = open.next_seq;
        open.next_seq += 1;
        self.counters.batches_sealed.fetch_add(1, Ordering::Relaxed);

        let Some(full_tx) = open.full_tx.as_ref() else {
            error!("BATCHER | batch {} sealed after stop", batch.seq);
            self.release_all(batch);
            return;
        };
        // the full queue holds every batch there is, so this never waits
        if let Err(e) = full_tx.send(batch).await {
            error!("BATCHER | full queue closed, dropping batch {}", e.0.seq);
            self.release_all(e.0);
        }
    }

    /// Returns the events of a batch that can no longer be delivered.
    fn release_all(&self, mut batch: Batch) {
        for event in batch.events.drain(..) {
            self.committer.release(event);
        }
    }

    async fn run_flush_ticker(self: Arc<Self>) {
        let period = (self.settings.flush_timeout / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.ticker_cancel.cancelled() => return,
                _ = ticker.tick() => self.flush_expired().await,
            }
        }
    }

    async fn next_full(&self) -> Option<Batch> {
        self.full_rx.lock().await.recv().await
    }

    async fn run_worker(self: Arc<Self>, id: usize) {
        let interval = self.settings.maintenance_interval;
        let mut maintenance =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut scratch = Vec::with_capacity(self.settings.batch_size);

        loop {
            let batch = tokio::select! {
                batch = self.next_full() => batch,
                _ = maintenance.tick() => {
                    self.output.maintenance().await;
                    continue;
                }
            };
            let Some(batch) = batch else {
                break;
            };
            self.deliver(batch, &mut scratch).await;
        }
        debug!("BATCHER | worker {id} stopped");
    }

    async fn deliver(&self, mut batch: Batch, scratch: &mut Vec<Box<Event>>) {
        let seq = batch.seq;
        if !batch.is_empty() {
            let result = self
                .settings
                .retry
                .run(|| self.output.send(&batch))
                .await;
            if let Err(error) = result {
                self.counters
                    .send_failures
                    .fetch_add(1, Ordering::Relaxed);
                if self.settings.fatal_on_failure {
                    self.fatal.raise(Error::DeliveryFailed { seq, error });
                } else {
                    (self.dead_letter)(&batch, &error);
                }
            }
        }

        std::mem::swap(&mut batch.events, scratch);
        batch.reset();
        if self.free_tx.send(batch).await.is_err() {
            error!("BATCHER | free queue closed");
        }

        self.wait_turn(seq).await;
        let committed = scratch.len() as u64;
        for event in scratch.drain(..) {
            self.committer.commit(event);
        }
        self.counters
            .events_committed
            .fetch_add(committed, Ordering::Relaxed);
        self.counters
            .batches_committed
            .fetch_add(1, Ordering::Relaxed);
        self.commit_gate.send_modify(|next| *next += 1);
    }

    async fn wait_turn(&self, seq: u64) {
        let mut gate = self.commit_gate.subscribe();
        // the sender lives as long as self, the wait only ends on our turn
        let _ = gate.wait_for(|next| *next == seq).await;
    }

    /// Seals the open batch, lets the workers drain the queue and waits
    /// for every commit.
    pub async fn stop(&self) {
        self.ticker_cancel.cancel();
        {
            let mut open = self.open.lock().await;
            if let Some(batch) = open.current.take() {
                self.seal(&mut open, batch).await;
            }
            open.full_tx = None;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                error!("BATCHER | task failed: {e}");
            }
        }
        debug!(
            "BATCHER | stopped after {} committed batches",
            self.counters
                .batches_committed
                .load(Ordering::Relaxed)
        );
    }
}

impl fmt::Debug for Batcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batcher")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn log_dead_letter(batch: &Batch, error: &OutputError) {
    error!(
        "BATCHER | dropping batch {} of {} events after retries: {error}",
        batch.seq(),
        batch.len()
    );
}
