// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registry of streams and scheduler handing them to processors.
//!
//! The streamer owns two independent locks:
//!
//! - the registry, mapping `(source id, stream name)` to its [`Stream`];
//! - the [`Scheduler`], holding the ready set (non empty streams no
//!   processor has reserved yet) and the blocked set (streams whose
//!   processor waits on a same-stream follow-up event).
//!
//! Neither lock is ever held while a stream lock is taken, which is what lets
//! a stream call back into the scheduler from inside `put`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hashbrown::HashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ustr::Ustr;

use crate::event::SourceId;
use crate::stream::Stream;

#[derive(Default)]
struct SchedState {
    ready: VecDeque<Arc<Stream>>,
    blocked: HashMap<u64, Arc<Stream>>,
    stopping: bool,
}

/// Ready/blocked bookkeeping shared by the streamer and its streams.
#[derive(Default)]
pub struct Scheduler {
    state: Mutex<SchedState>,
    ready_notify: Notify,
}

impl Scheduler {
    /// Registers a stream that just went from idle to ready and wakes one
    /// waiting processor.
    pub(crate) fn push_ready(&self, stream: Arc<Stream>) {
        self.lock().ready.push_back(stream);
        self.ready_notify.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn pop_ready(&self) -> Option<Arc<Stream>> {
        self.lock().ready.pop_front()
    }

    pub(crate) fn mark_blocked(&self, stream: Arc<Stream>) {
        self.lock().blocked.insert(stream.id(), stream);
    }

    pub(crate) fn unmark_blocked(&self, id: u64) {
        self.lock().blocked.remove(&id);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.lock().stopping
    }

    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    #[must_use]
    pub fn blocked_len(&self) -> usize {
        self.lock().blocked.len()
    }

    fn blocked_streams(&self) -> Vec<Arc<Stream>> {
        self.lock().blocked.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Streamer {
    streams: Mutex<HashMap<(SourceId, Ustr), Arc<Stream>>>,
    scheduler: Arc<Scheduler>,
    next_id: AtomicU64,
    stream_queue_size: usize,
    block_timeout: Duration,
}

impl Streamer {
    #[must_use]
    pub fn new(stream_queue_size: usize, block_timeout: Duration) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            scheduler: Arc::new(Scheduler::default()),
            next_id: AtomicU64::new(1),
            stream_queue_size,
            block_timeout,
        }
    }

    /// Returns the stream for `(source_id, name)`, creating it on first use.
    pub fn stream(&self, source_id: SourceId, name: Ustr) -> Arc<Stream> {
        let mut streams = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let stream = streams.entry((source_id, name)).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            debug!("STREAMER | new stream {id} for source {source_id} ({name})");
            Arc::new(Stream::new(
                id,
                source_id,
                name,
                self.stream_queue_size,
                Arc::clone(&self.scheduler),
            ))
        });
        Arc::clone(stream)
    }

    /// Waits until a stream is ready and reserves it for the caller.
    ///
    /// Returns `None` once the streamer is stopping and nothing is left in the
    /// ready set, which is the signal for a processor to exit.
    pub async fn reserve(&self) -> Option<Arc<Stream>> {
        loop {
            let notified = self.scheduler.ready_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.scheduler.lock();
                if let Some(stream) = state.ready.pop_front() {
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        // a single notify_one may have been consumed by us while
                        // several streams became ready
                        self.scheduler.ready_notify.notify_one();
                    }
                    stream.attach();
                    return Some(stream);
                }
                if state.stopping {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops handing out streams once the ready set is drained and releases
    /// every blocked stream with a timeout event.
    pub fn stop(&self) {
        self.scheduler.lock().stopping = true;
        let blocked = self.scheduler.blocked_streams();
        for stream in &blocked {
            stream.unblock();
        }
        debug!(
            "STREAMER | stopping, released {} blocked streams",
            blocked.len()
        );
        self.scheduler.ready_notify.notify_waiters();
    }

    /// Releases streams blocked for longer than the block timeout. Returns how
    /// many were released.
    pub fn sweep_blocked(&self) -> usize {
        let mut released = 0;
        for stream in self.scheduler.blocked_streams() {
            let Some(waited) = stream.blocked_for() else {
                continue;
            };
            if waited >= self.block_timeout && stream.unblock() {
                warn!(
                    "STREAMER | stream {} of source {} blocked for {} ms, releasing it with a timeout event; consider increasing the number of processors",
                    stream.name(),
                    stream.source_id(),
                    waited.as_millis()
                );
                released += 1;
            }
        }
        released
    }

    /// Runs the periodic blocked-stream sweep until `cancel` fires.
    pub async fn run_heartbeat(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("STREAMER | heartbeat stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep_blocked();
                }
            }
        }
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}
