// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ordered queue of the events of one (source, stream name) pair.
//!
//! A stream moves through four states:
//!
//! ```text
//!            put                 reserve
//!   Idle ──────────> Ready ──────────────> Attached
//!    ^                                      │   ^
//!    │          instant_get on empty        │   │ event or timeout
//!    └──────────────────────────────────────┘   │
//!                         block_get on empty    │
//!                       Attached ──────────> Blocked
//! ```
//!
//! The state lives under the stream's own lock, together with the queue, so
//! "drained, going idle" and "new event, becoming ready" cannot interleave.
//! Only the processor that reserved a stream calls `instant_get` and
//! `block_get` on it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use ustr::Ustr;

use crate::event::{Event, SeqId, SourceId, Stage};
use crate::streamer::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Registered, empty, nobody working on it.
    Idle,
    /// Non empty, waiting in the ready set for a processor.
    Ready,
    /// Reserved by exactly one processor.
    Attached,
    /// Its processor waits for the next event of this stream.
    Blocked,
}

struct Inner {
    queue: VecDeque<Box<Event>>,
    state: StreamState,
    next_seq: SeqId,
    blocked_since: Option<Instant>,
    timed_out: bool,
}

enum Wake {
    Event(Box<Event>),
    Timeout,
    Pending,
}

pub struct Stream {
    id: u64,
    source_id: SourceId,
    name: Ustr,
    capacity: usize,
    inner: Mutex<Inner>,
    /// Signalled on every put, waited on by `block_get`.
    arrived: Notify,
    /// Signalled on every pop, waited on by producers of a full queue.
    drained: Notify,
    scheduler: Arc<Scheduler>,
}

impl Stream {
    pub(crate) fn new(
        id: u64,
        source_id: SourceId,
        name: Ustr,
        capacity: usize,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            id,
            source_id,
            name,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity.max(1)),
                state: StreamState::Idle,
                next_seq: 0,
                blocked_since: None,
                timed_out: false,
            }),
            arrived: Notify::new(),
            drained: Notify::new(),
            scheduler,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    #[must_use]
    pub fn name(&self) -> Ustr {
        self.name
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends the event and returns its sequence number in this stream.
    ///
    /// Suspends while the queue is full. An idle stream becomes ready and is
    /// handed to the scheduler; a blocked stream wakes its processor.
    pub async fn put(self: &Arc<Self>, mut event: Box<Event>) -> SeqId {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_put(event) {
                Ok(seq_id) => return seq_id,
                Err(full) => event = full,
            }
            notified.await;
        }
    }

    /// Appends the event if the queue has room, hands it back otherwise.
    fn try_put(self: &Arc<Self>, mut event: Box<Event>) -> Result<SeqId, Box<Event>> {
        let mut inner = self.lock();
        if inner.queue.len() >= self.capacity {
            return Err(event);
        }
        inner.next_seq += 1;
        let seq_id = inner.next_seq;
        event.seq_id = seq_id;
        event.stage = Stage::Stream;
        event.stream = Some(Arc::clone(self));
        inner.queue.push_back(event);

        let became_ready = match inner.state {
            StreamState::Idle => {
                inner.state = StreamState::Ready;
                true
            }
            StreamState::Blocked => {
                self.arrived.notify_one();
                false
            }
            StreamState::Ready | StreamState::Attached => false,
        };
        drop(inner);

        if became_ready {
            self.scheduler.push_ready(Arc::clone(self));
        }
        Ok(seq_id)
    }

    /// Pops the next event without waiting. On an empty queue the stream is
    /// detached (back to idle) and `None` is returned.
    pub fn instant_get(&self) -> Option<Box<Event>> {
        let mut inner = self.lock();
        match inner.queue.pop_front() {
            Some(mut event) => {
                drop(inner);
                self.drained.notify_one();
                event.stage = Stage::Processor;
                Some(event)
            }
            None => {
                inner.state = StreamState::Idle;
                None
            }
        }
    }

    /// Waits for the next event of this very stream.
    ///
    /// The stream stays reserved by the caller while it waits. If nothing
    /// arrives before the streamer heartbeat gives up on it (or the streamer
    /// stops), a timeout event is returned instead.
    pub async fn block_get(self: &Arc<Self>) -> Box<Event> {
        {
            let mut inner = self.lock();
            if let Some(event) = self.pop_locked(&mut inner) {
                return event;
            }
            inner.state = StreamState::Blocked;
            inner.blocked_since = Some(Instant::now());
            inner.timed_out = false;
        }
        self.scheduler.mark_blocked(Arc::clone(self));

        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.wake_blocked() {
                Wake::Event(event) => return event,
                Wake::Timeout => return Event::timeout(self),
                Wake::Pending => notified.await,
            }
        }
    }

    /// Leaves the blocked state if an event arrived, the heartbeat gave up
    /// on the stream or the streamer is stopping.
    fn wake_blocked(&self) -> Wake {
        let stopping = self.scheduler.is_stopping();
        let mut inner = self.lock();
        let event = match self.pop_locked(&mut inner) {
            Some(event) => Some(event),
            None if inner.timed_out || stopping => None,
            None => return Wake::Pending,
        };
        inner.state = StreamState::Attached;
        inner.blocked_since = None;
        inner.timed_out = false;
        drop(inner);
        self.scheduler.unmark_blocked(self.id);

        match event {
            Some(event) => Wake::Event(event),
            None => Wake::Timeout,
        }
    }

    /// Forces a blocked stream onto the timeout path. Returns whether the
    /// stream was actually blocked.
    pub(crate) fn unblock(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != StreamState::Blocked || inner.timed_out {
            return false;
        }
        inner.timed_out = true;
        drop(inner);
        self.arrived.notify_one();
        true
    }

    /// How long the attached processor has been waiting on this stream.
    #[must_use]
    pub fn blocked_for(&self) -> Option<Duration> {
        self.lock().blocked_since.map(|since| since.elapsed())
    }

    pub(crate) fn attach(&self) {
        self.lock().state = StreamState::Attached;
    }

    fn pop_locked(&self, inner: &mut Inner) -> Option<Box<Event>> {
        let mut event = inner.queue.pop_front()?;
        self.drained.notify_one();
        event.stage = Stage::Processor;
        Some(event)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("source_id", &self.source_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
