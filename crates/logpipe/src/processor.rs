// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker driving events through the action chain.
//!
//! A processor reserves one stream at a time and drains it. Each event runs
//! from its action cursor to the end of the chain unless an action stops it:
//!
//! | result   | what happens to the event                                   |
//! |----------|-------------------------------------------------------------|
//! | Pass     | next action; after the last one it goes to the router       |
//! | Discard  | queued for commit only                                      |
//! | Collapse | queued for commit only, the next event of the same stream   |
//! |          | is awaited and starts the chain from the first action       |
//! | Hold     | ownership moves to the action, which later commits or       |
//! |          | propagates it through its [`ActionController`]              |
//!
//! Timeout events go through the chain like any other event but are never
//! committed and are dropped at the end of it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::action::{Action, ActionController, ActionResult, ActionSpec, Control};
use crate::errors::Error;
use crate::event::Event;
use crate::fatal::FatalSignal;
use crate::output::Router;
use crate::stats::ChainCounters;
use crate::stream::Stream;
use crate::streamer::Streamer;

enum Outcome {
    End,
    Discard,
    Collapse,
    Hold(usize),
}

pub struct Processor {
    id: usize,
    streamer: Arc<Streamer>,
    router: Router,
    specs: Arc<[ActionSpec]>,
    actions: Vec<Box<dyn Action>>,
    counters: Arc<ChainCounters>,
    control_tx: Option<mpsc::UnboundedSender<Control>>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    fatal: Arc<FatalSignal>,
}

impl Processor {
    #[must_use]
    pub fn new(
        id: usize,
        streamer: Arc<Streamer>,
        router: Router,
        specs: Arc<[ActionSpec]>,
        counters: Arc<ChainCounters>,
        fatal: Arc<FatalSignal>,
    ) -> Self {
        let actions = specs.iter().map(|spec| (spec.factory)()).collect();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            id,
            streamer,
            router,
            specs,
            actions,
            counters,
            control_tx: Some(control_tx),
            control_rx,
            fatal,
        }
    }

    /// Runs until the streamer is stopped and drained.
    pub async fn run(mut self) {
        if let Some(control_tx) = self.control_tx.take() {
            for (index, action) in self.actions.iter_mut().enumerate() {
                action.start(ActionController::new(index, control_tx.clone()));
            }
        }
        debug!("PROCESSOR | {} started with {} actions", self.id, self.actions.len());

        loop {
            tokio::select! {
                biased;
                Some(control) = self.control_rx.recv() => self.on_control(control).await,
                stream = self.streamer.reserve() => {
                    let Some(stream) = stream else {
                        break;
                    };
                    while let Some(event) = stream.instant_get() {
                        self.process(event, Some(&stream)).await;
                    }
                }
            }
        }

        for action in &mut self.actions {
            action.stop();
        }
        // whatever the actions gave back while stopping
        while let Ok(control) = self.control_rx.try_recv() {
            self.on_control(control).await;
        }
        debug!("PROCESSOR | {} stopped", self.id);
    }

    async fn on_control(&mut self, control: Control) {
        match control {
            Control::Commit(event) => self.commit(event).await,
            Control::Propagate(event) => self.process(event, None).await,
        }
    }

    /// Runs one event to completion. `stream` is the stream the processor is
    /// attached to; propagated events have none and cannot collapse.
    ///
    /// Boxed because releasing held events may re-enter it.
    fn process<'a>(
        &'a mut self,
        mut event: Box<Event>,
        stream: Option<&'a Arc<Stream>>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let outcome = self.run_chain(&mut event);
                // events an action released while handling this one go first
                self.drain_control().await;

                match outcome {
                    Outcome::End => {
                        if event.is_timeout() {
                            return;
                        }
                        if let Err(e) = self.router.out(event).await {
                            error!("PROCESSOR | {} failed to route event: {e}", self.id);
                        }
                        return;
                    }
                    Outcome::Discard => {
                        self.commit(event).await;
                        return;
                    }
                    Outcome::Collapse => {
                        let was_timeout = event.is_timeout();
                        self.commit(event).await;
                        let Some(stream) = stream else {
                            return;
                        };
                        if was_timeout {
                            // nothing arrived before the deadline, do not wait twice
                            return;
                        }
                        event = stream.block_get().await;
                    }
                    Outcome::Hold(index) => {
                        let Some(action) = self.actions.get_mut(index) else {
                            return;
                        };
                        if let Err(event) = action.hold(event) {
                            self.fatal.raise(Error::HoldRejected {
                                action: self.specs[index].name.clone(),
                                index,
                            });
                            self.commit(event).await;
                        }
                        return;
                    }
                }
            }
        })
    }

    fn run_chain(&mut self, event: &mut Event) -> Outcome {
        for index in event.action..self.actions.len() {
            event.action = index;
            let counters = self.counters.get(index);
            if !self.specs[index].conditions.matches(event) {
                if let Some(counters) = counters {
                    counters.record_not_matched();
                }
                continue;
            }
            let result = self.actions[index].process(event);
            if let Some(counters) = counters {
                counters.record(result);
            }
            match result {
                ActionResult::Pass => {}
                ActionResult::Discard => return Outcome::Discard,
                ActionResult::Collapse => return Outcome::Collapse,
                ActionResult::Hold => return Outcome::Hold(index),
            }
        }
        event.action = self.actions.len();
        Outcome::End
    }

    async fn drain_control(&mut self) {
        while let Ok(control) = self.control_rx.try_recv() {
            match control {
                Control::Commit(event) => self.commit(event).await,
                Control::Propagate(event) => self.process(event, None).await,
            }
        }
    }

    /// Timeout events are dropped, everything else keeps its place in the
    /// commit order.
    async fn commit(&mut self, event: Box<Event>) {
        if event.is_timeout() {
            return;
        }
        if let Err(e) = self.router.commit(event).await {
            error!("PROCESSOR | {} failed to commit event: {e}", self.id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::action::{ActionFactory, MatchConditions, MatchMode};
    use crate::batcher::{Batch, Batcher, BatcherSettings, Committer};
    use crate::errors::OutputError;
    use crate::event::{EventKind, SourceId};
    use crate::output::Output;
    use crate::pool::EventPool;
    use crate::retry::RetryStrategy;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use ustr::Ustr;

    #[derive(Default)]
    struct Sink {
        messages: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl Output for Sink {
        async fn send(&self, batch: &Batch) -> Result<(), OutputError> {
            let mut messages = self.messages.lock().unwrap();
            messages.extend(batch.iter().map(|e| e.root.clone()));
            Ok(())
        }
    }

    struct Release {
        pool: Arc<EventPool>,
        offsets: Mutex<Vec<i64>>,
    }

    impl Committer for Release {
        fn commit(&self, event: Box<Event>) {
            if event.is_pooled() {
                self.offsets.lock().unwrap().push(event.offset);
            }
            self.pool.release(event).unwrap();
        }

        fn release(&self, event: Box<Event>) {
            self.pool.release(event).unwrap();
        }
    }

    struct Harness {
        pool: Arc<EventPool>,
        streamer: Arc<Streamer>,
        batcher: Arc<Batcher>,
        sink: Arc<Sink>,
        committed: Arc<Release>,
        fatal: Arc<FatalSignal>,
        processors: Vec<tokio::task::JoinHandle<()>>,
    }

    impl Harness {
        fn start(specs: Vec<ActionSpec>, processors: usize) -> Self {
            let pool = Arc::new(EventPool::new(32));
            let streamer = Arc::new(Streamer::new(16, Duration::from_millis(50)));
            let sink = Arc::new(Sink::default());
            let committed = Arc::new(Release {
                pool: Arc::clone(&pool),
                offsets: Mutex::new(Vec::new()),
            });
            let fatal = Arc::new(FatalSignal::default());
            let batcher = Arc::new(Batcher::new(
                BatcherSettings {
                    batch_size: 4,
                    flush_timeout: Duration::from_millis(10),
                    workers: 2,
                    maintenance_interval: Duration::from_secs(60),
                    retry: RetryStrategy::Immediate { attempts: 1 },
                    fatal_on_failure: false,
                },
                sink.clone(),
                committed.clone(),
                fatal.clone(),
            ));
            batcher.start();

            let specs: Arc<[ActionSpec]> = specs.into();
            let counters = Arc::new(ChainCounters::new(
                specs.iter().map(|s| s.name.clone()).collect(),
            ));
            let processors = (0..processors)
                .map(|id| {
                    let processor = Processor::new(
                        id,
                        Arc::clone(&streamer),
                        Router::new(Arc::clone(&batcher)),
                        Arc::clone(&specs),
                        Arc::clone(&counters),
                        Arc::clone(&fatal),
                    );
                    tokio::spawn(processor.run())
                })
                .collect();
            Self {
                pool,
                streamer,
                batcher,
                sink,
                committed,
                fatal,
                processors,
            }
        }

        async fn put(&self, source: u64, stream: &str, offset: i64, message: &str) {
            let mut event = self.pool.get().await.unwrap();
            event.root = json!({ "message": message });
            event.source_id = SourceId(source);
            event.stream_name = Ustr::from(stream);
            event.offset = offset;
            self.streamer
                .stream(SourceId(source), Ustr::from(stream))
                .put(event)
                .await;
        }

        async fn stop(mut self) -> Self {
            self.streamer.stop();
            for processor in self.processors.drain(..) {
                processor.await.unwrap();
            }
            self.batcher.stop().await;
            self
        }

        fn messages(&self) -> Vec<String> {
            self.sink
                .messages
                .lock()
                .unwrap()
                .iter()
                .map(|m| m["message"].as_str().unwrap_or_default().to_string())
                .collect()
        }
    }

    fn action<A, F>(name: &str, build: F) -> ActionSpec
    where
        A: Action + 'static,
        F: Fn() -> A + Send + Sync + 'static,
    {
        let factory: ActionFactory = Arc::new(move || Box::new(build()) as Box<dyn Action>);
        ActionSpec::new(name, factory)
    }

    struct DropContaining(&'static str);

    impl Action for DropContaining {
        fn process(&mut self, event: &mut Event) -> ActionResult {
            match event.field_str("message") {
                Some(m) if m.contains(self.0) => ActionResult::Discard,
                _ => ActionResult::Pass,
            }
        }
    }

    struct Upper;

    impl Action for Upper {
        fn process(&mut self, event: &mut Event) -> ActionResult {
            if let Some(m) = event.field_str("message").map(|m| m.to_uppercase()) {
                event.set_field("message", json!(m));
            }
            ActionResult::Pass
        }
    }

    /// Glues every event ending with `+` to the following one.
    #[derive(Default)]
    struct Glue {
        pending: String,
    }

    impl Action for Glue {
        fn process(&mut self, event: &mut Event) -> ActionResult {
            if event.is_timeout() {
                if self.pending.is_empty() {
                    return ActionResult::Pass;
                }
                event.kind = EventKind::Synthetic;
                event.set_field("message", json!(std::mem::take(&mut self.pending)));
                return ActionResult::Pass;
            }
            let message = event.field_str("message").unwrap_or_default().into_owned();
            if let Some(head) = message.strip_suffix('+') {
                self.pending.push_str(head);
                return ActionResult::Collapse;
            }
            if !self.pending.is_empty() {
                let joined = std::mem::take(&mut self.pending) + &message;
                event.set_field("message", json!(joined));
            }
            ActionResult::Pass
        }
    }

    /// Holds every event whose message starts with `hold`, releases it when
    /// the next event comes in.
    #[derive(Default)]
    struct HoldOne {
        controller: Option<ActionController>,
        held: Option<Box<Event>>,
    }

    impl Action for HoldOne {
        fn start(&mut self, controller: ActionController) {
            self.controller = Some(controller);
        }

        fn process(&mut self, event: &mut Event) -> ActionResult {
            if let (Some(held), Some(controller)) = (self.held.take(), &self.controller) {
                controller.propagate(held).unwrap();
            }
            match event.field_str("message") {
                Some(m) if m.starts_with("hold") => ActionResult::Hold,
                _ => ActionResult::Pass,
            }
        }

        fn hold(&mut self, event: Box<Event>) -> Result<(), Box<Event>> {
            self.held = Some(event);
            Ok(())
        }

        fn stop(&mut self) {
            if let (Some(held), Some(controller)) = (self.held.take(), &self.controller) {
                controller.commit(held).unwrap();
            }
        }
    }

    struct ClaimsToHold;

    impl Action for ClaimsToHold {
        fn process(&mut self, _event: &mut Event) -> ActionResult {
            ActionResult::Hold
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stream_order_with_two_processors() {
        let harness = Harness::start(vec![action("upper", || Upper)], 2);
        for (offset, message) in ["a", "b", "c"].iter().enumerate() {
            harness.put(1, "stdout", offset as i64 + 1, message).await;
        }
        let harness = harness.stop().await;
        assert_eq!(harness.messages(), vec!["A", "B", "C"]);
        assert_eq!(*harness.committed.offsets.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(harness.pool.in_use(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_discard_is_committed_in_order() {
        let harness = Harness::start(
            vec![action("drop", || DropContaining("debug")), action("upper", || Upper)],
            2,
        );
        harness.put(1, "stdout", 10, "one").await;
        harness.put(1, "stdout", 20, "debug two").await;
        harness.put(1, "stdout", 30, "three").await;
        let harness = harness.stop().await;

        assert_eq!(harness.messages(), vec!["ONE", "THREE"]);
        assert_eq!(*harness.committed.offsets.lock().unwrap(), vec![10, 20, 30]);
        assert_eq!(harness.pool.in_use(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_match_conditions_skip_action() {
        let fields = BTreeMap::from([("message".to_string(), "/^x/".to_string())]);
        let conditions = MatchConditions::new(&fields, MatchMode::And, false).unwrap();
        let harness = Harness::start(
            vec![action("upper", || Upper).with_conditions(conditions)],
            1,
        );
        harness.put(1, "stdout", 1, "xy").await;
        harness.put(1, "stdout", 2, "ab").await;
        let harness = harness.stop().await;
        assert_eq!(harness.messages(), vec!["XY", "ab"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_collapse_waits_on_same_stream() {
        let harness = Harness::start(vec![action("glue", Glue::default)], 2);
        harness.put(1, "stdout", 1, "first+").await;
        // another stream gets busy while the first one waits for its follow-up
        harness.put(2, "stdout", 1, "other").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        harness.put(1, "stdout", 2, "second").await;
        let harness = harness.stop().await;

        let mut messages = harness.messages();
        messages.sort();
        assert_eq!(messages, vec!["firstsecond", "other"]);
        assert_eq!(harness.pool.in_use(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_collapse_timeout_flushes_pending() {
        let harness = Harness::start(vec![action("glue", Glue::default)], 1);
        harness.put(1, "stdout", 1, "dangling+").await;
        // the streamer block timeout is 50ms, nothing else arrives
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.streamer.sweep_blocked();
        tokio::time::sleep(Duration::from_millis(60)).await;
        harness.streamer.sweep_blocked();
        let harness = harness.stop().await;

        assert_eq!(harness.messages(), vec!["dangling"]);
        assert_eq!(*harness.committed.offsets.lock().unwrap(), vec![1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_held_event_is_propagated_in_order() {
        let harness = Harness::start(
            vec![action("hold", HoldOne::default), action("upper", || Upper)],
            1,
        );
        harness.put(1, "stdout", 1, "hold me").await;
        harness.put(1, "stdout", 2, "next").await;
        harness.put(1, "stdout", 3, "hold again").await;
        let harness = harness.stop().await;

        assert_eq!(harness.messages(), vec!["HOLD ME", "NEXT"]);
        // the last held event is committed when the action stops
        assert_eq!(*harness.committed.offsets.lock().unwrap(), vec![1, 2, 3]);
        assert!(!harness.fatal.is_raised());
    }

    #[tokio::test]
    async fn test_hold_without_taking_ownership_is_fatal() {
        let harness = Harness::start(vec![action("liar", || ClaimsToHold)], 1);
        harness.put(1, "stdout", 1, "x").await;
        let harness = harness.stop().await;

        assert!(matches!(
            harness.fatal.take(),
            Some(Error::HoldRejected { index: 0, .. })
        ));
        assert_eq!(harness.pool.in_use(), 0);
    }
}
