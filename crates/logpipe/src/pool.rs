// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed capacity arena of reusable events.
//!
//! The pool pre-allocates `capacity` events. Slot ids are kept in an order
//! table whose first `in_use` entries are the slots currently handed out:
//!
//! ```text
//!   order:  [ 3 | 0 | 5 | 1 ‖ 2 | 4 ]
//!             in use (4)     free
//! ```
//!
//! `get` hands out `order[in_use]` and bumps the counter. `release` swaps the
//! released slot with the last in-use entry and shrinks the counter, so no
//! allocation happens on the hot path.
//!
//! The pool is exact-capacity: `capacity` slots allow `capacity` events in
//! flight. When every slot is out, `get` suspends until one is released,
//! which is how backpressure reaches the inputs.

use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

use crate::errors::PoolError;
use crate::event::{Event, Stage};

struct State {
    slots: Vec<Option<Box<Event>>>,
    order: Vec<usize>,
    positions: Vec<usize>,
    in_use: usize,
    closed: bool,
}

pub struct EventPool {
    capacity: usize,
    state: Mutex<State>,
    released: Notify,
}

impl EventPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|slot| Some(Box::new(Event::pooled(slot))))
            .collect();
        Self {
            capacity,
            state: Mutex::new(State {
                slots,
                order: (0..capacity).collect(),
                positions: (0..capacity).collect(),
                in_use: 0,
                closed: false,
            }),
            released: Notify::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    /// Hands out a reset event, waiting for a release when the pool is
    /// exhausted. Returns [`PoolError::Closed`] once the pool is closed.
    pub async fn get(&self) -> Result<Box<Event>, PoolError> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.try_get()? {
                return Ok(event);
            }
            notified.await;
        }
    }

    /// Non blocking variant of [`EventPool::get`].
    pub fn try_get(&self) -> Result<Option<Box<Event>>, PoolError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        if state.in_use >= self.capacity {
            return Ok(None);
        }
        let slot = state.order[state.in_use];
        let Some(event) = state.slots[slot].take() else {
            // the order table and the slots disagree, which only happens if a
            // slot was handed out twice
            return Err(PoolError::NotInUse(slot));
        };
        state.in_use += 1;
        if state.in_use < self.capacity {
            // more room left, let the next waiter in as well
            self.released.notify_one();
        }
        Ok(Some(event))
    }

    /// Returns the event's slot to the free region.
    ///
    /// Events that do not come from a pool (timeout, synthetic) are dropped.
    pub fn release(&self, mut event: Box<Event>) -> Result<(), PoolError> {
        let Some(slot) = event.slot else {
            return Ok(());
        };
        let mut state = self.lock();
        if slot >= self.capacity {
            return Err(PoolError::UnknownSlot(slot, self.capacity));
        }
        let position = state.positions[slot];
        if position >= state.in_use || state.slots[slot].is_some() {
            return Err(PoolError::NotInUse(slot));
        }

        let last = state.in_use - 1;
        let last_slot = state.order[last];
        state.order.swap(position, last);
        state.positions[last_slot] = position;
        state.positions[slot] = last;
        state.in_use = last;

        event.reset();
        event.stage = Stage::Free;
        state.slots[slot] = Some(event);
        drop(state);

        self.released.notify_one();
        Ok(())
    }

    /// Wakes every waiter with [`PoolError::Closed`]. Releases keep working so
    /// in-flight events can still be committed.
    pub fn close(&self) {
        let in_use = {
            let mut state = self.lock();
            state.closed = true;
            state.in_use
        };
        debug!("POOL | closed with {in_use} events in flight");
        self.released.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // a poisoned pool means a panic happened while the order table was
        // being rewritten; the data is still consistent per slot so keep going
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
