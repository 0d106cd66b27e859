// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use logpipe::action::MatchMode;
use logpipe::batcher::DeadLetter;
use logpipe::decoder::JsonDecoder;
use logpipe::errors::OutputError;
use logpipe::retry::RetryStrategy;
use logpipe::{
    Action, ActionResult, ActionSpec, Batch, BatcherSettings, Event, Input, MatchConditions,
    Output, PipelineBuilder, PipelineSettings, PluginRegistry, SourceId,
};
use serde_json::json;
use tokio::time::{sleep, timeout, Duration};

/// Remembers every delivered message and the order batches finished in.
#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<String>>,
    batch_sizes: Mutex<BTreeMap<u64, usize>>,
    completed: Mutex<Vec<u64>>,
    slow_batch: Option<(u64, Duration)>,
}

impl Recorder {
    fn slow(seq: u64, delay: Duration) -> Self {
        Self {
            slow_batch: Some((seq, delay)),
            ..Default::default()
        }
    }

    fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Output for Recorder {
    async fn send(&self, batch: &Batch) -> Result<(), OutputError> {
        if let Some((seq, delay)) = self.slow_batch {
            if batch.seq() == seq {
                sleep(delay).await;
            }
        }
        self.messages.lock().unwrap().extend(
            batch
                .iter()
                .filter_map(|event| event.field_str("message").map(|m| m.into_owned())),
        );
        self.batch_sizes
            .lock()
            .unwrap()
            .insert(batch.seq(), batch.len());
        self.completed.lock().unwrap().push(batch.seq());
        Ok(())
    }
}

/// Acknowledged offsets, per stream and overall.
#[derive(Default)]
struct Checkpoints {
    all: Mutex<Vec<i64>>,
    per_stream: Mutex<HashMap<String, Vec<i64>>>,
}

impl Input for Checkpoints {
    fn commit(&self, event: &Event) {
        self.all.lock().unwrap().push(event.offset);
        self.per_stream
            .lock()
            .unwrap()
            .entry(event.stream_name.to_string())
            .or_default()
            .push(event.offset);
    }
}

/// Passes everything, noting the message of each event it sees.
struct Observe(Arc<Mutex<Vec<String>>>);

impl Action for Observe {
    fn process(&mut self, event: &mut Event) -> ActionResult {
        if let Some(message) = event.field_str("message") {
            self.0.lock().unwrap().push(message.into_owned());
        }
        ActionResult::Pass
    }
}

fn observe(seen: &Arc<Mutex<Vec<String>>>) -> ActionSpec {
    let seen = Arc::clone(seen);
    ActionSpec::new(
        "observe",
        Arc::new(move || Box::new(Observe(Arc::clone(&seen))) as Box<dyn Action>),
    )
}

fn settings(processors: usize) -> PipelineSettings {
    PipelineSettings {
        capacity: 32,
        processors,
        stream_queue_size: 8,
        max_event_size: 1024,
        stream_block_timeout: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(10),
    }
}

fn batcher(batch_size: usize, flush_timeout: Duration, workers: usize) -> BatcherSettings {
    BatcherSettings {
        batch_size,
        flush_timeout,
        workers,
        maintenance_interval: Duration::from_secs(60),
        retry: RetryStrategy::Immediate { attempts: 1 },
        fatal_on_failure: false,
    }
}

fn record(stream: &str, message: &str) -> Vec<u8> {
    json!({"stream": stream, "message": message})
        .to_string()
        .into_bytes()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_stream_is_seen_in_order_by_concurrent_processors() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let output = Arc::new(Recorder::default());
    let pipeline = PipelineBuilder::new(settings(2), output.clone())
        .batcher(batcher(2, Duration::from_millis(10), 1))
        .action(observe(&seen))
        .start()
        .unwrap();

    for (offset, message) in ["a", "b", "c"].into_iter().enumerate() {
        let raw = json!({ "message": message }).to_string();
        pipeline
            .submit(SourceId(1), "app.log", offset as i64 + 1, raw.as_bytes())
            .await
            .unwrap();
    }
    pipeline.stop().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(output.messages(), vec!["a", "b", "c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commits_are_monotonic_across_streams_and_processors() {
    const STREAMS: usize = 4;
    const PER_STREAM: usize = 50;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let input = Arc::new(Checkpoints::default());
    let output = Arc::new(Recorder::default());
    let pipeline = PipelineBuilder::new(settings(4), output.clone())
        .batcher(batcher(7, Duration::from_millis(5), 3))
        .decoder(Arc::new(JsonDecoder::new(Some("stream".to_string()))))
        .action(observe(&seen))
        .input(input.clone())
        .start()
        .unwrap();

    let mut offset = 0;
    for i in 0..PER_STREAM {
        for s in 0..STREAMS {
            offset += 1;
            let raw = record(&format!("s{s}"), &format!("s{s}-{i}"));
            pipeline
                .submit(SourceId(1), "docker.log", offset, &raw)
                .await
                .unwrap();
        }
    }
    pipeline.stop().await.unwrap();

    let total = STREAMS * PER_STREAM;
    assert_eq!(input.all.lock().unwrap().len(), total);
    let per_stream = input.per_stream.lock().unwrap();
    assert_eq!(per_stream.len(), STREAMS);
    for offsets in per_stream.values() {
        assert_eq!(offsets.len(), PER_STREAM);
        assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));
    }

    // within a stream the chain saw events in submission order
    let seen = seen.lock().unwrap();
    for s in 0..STREAMS {
        let prefix = format!("s{s}-");
        let order: Vec<usize> = seen
            .iter()
            .filter_map(|m| m.strip_prefix(&prefix))
            .map(|i| i.parse().unwrap())
            .collect();
        assert_eq!(order, (0..PER_STREAM).collect::<Vec<_>>());
    }

    let stats = pipeline.stats();
    assert_eq!(stats.events_in_use, 0);
    assert_eq!(stats.batcher.events_committed, total as u64);
    assert_eq!(stats.batcher.batches_committed, stats.batcher.batches_sealed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commits_follow_seal_order_when_batches_finish_out_of_order() {
    let input = Arc::new(Checkpoints::default());
    // the first batch is the last one to come back
    let output = Arc::new(Recorder::slow(1, Duration::from_millis(400)));
    let pipeline = PipelineBuilder::new(settings(1), output.clone())
        .batcher(batcher(3, Duration::from_millis(100), 3))
        .input(input.clone())
        .start()
        .unwrap();

    for offset in 1..=7 {
        let raw = json!({ "message": format!("line {offset}") }).to_string();
        pipeline
            .submit(SourceId(1), "app.log", offset, raw.as_bytes())
            .await
            .unwrap();
    }
    pipeline.stop().await.unwrap();

    assert_eq!(
        *output.batch_sizes.lock().unwrap(),
        BTreeMap::from([(1, 3), (2, 3), (3, 1)])
    );
    assert_eq!(output.completed.lock().unwrap().last(), Some(&1));
    assert_eq!(*input.all.lock().unwrap(), (1..=7).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn collapsed_events_join_with_the_next_event_of_their_own_stream() {
    let registry = PluginRegistry::default();
    let input = Arc::new(Checkpoints::default());
    let output = Arc::new(Recorder::default());
    let pipeline = PipelineBuilder::new(settings(2), output.clone())
        .batcher(batcher(4, Duration::from_millis(10), 2))
        .decoder(Arc::new(JsonDecoder::new(Some("stream".to_string()))))
        .action(ActionSpec::new(
            "join",
            registry.action("join", &serde_json::Value::Null).unwrap(),
        ))
        .input(input.clone())
        .start()
        .unwrap();

    let records = [
        ("stdout", "out 1\\"),
        ("stderr", "err 1\\"),
        ("stdout", " out 2\\"),
        ("stderr", " err 2"),
        ("stdout", " out 3"),
    ];
    for (offset, (stream, message)) in records.into_iter().enumerate() {
        pipeline
            .submit(
                SourceId(1),
                "docker.log",
                offset as i64 + 1,
                &record(stream, message),
            )
            .await
            .unwrap();
    }
    pipeline.stop().await.unwrap();

    let mut messages = output.messages();
    messages.sort();
    assert_eq!(messages, vec!["err 1 err 2", "out 1 out 2 out 3"]);

    let mut committed = input.all.lock().unwrap().clone();
    committed.sort_unstable();
    assert_eq!(committed, vec![1, 2, 3, 4, 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quiet_stream_flushes_a_pending_join() {
    let registry = PluginRegistry::default();
    let input = Arc::new(Checkpoints::default());
    let output = Arc::new(Recorder::default());
    let pipeline = PipelineBuilder::new(settings(1), output.clone())
        .batcher(batcher(4, Duration::from_millis(10), 1))
        .action(ActionSpec::new(
            "join",
            registry.action("join", &json!({"continuation": "+"})).unwrap(),
        ))
        .input(input.clone())
        .start()
        .unwrap();

    pipeline
        .submit(SourceId(1), "app.log", 10, br#"{"message":"head +"}"#)
        .await
        .unwrap();
    pipeline
        .submit(SourceId(1), "app.log", 20, br#"{"message":"tail+"}"#)
        .await
        .unwrap();

    timeout(Duration::from_secs(5), async {
        while output.messages().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pending join was never flushed");
    assert_eq!(output.messages(), vec!["head tail"]);
    assert_eq!(*input.all.lock().unwrap(), vec![10, 20]);

    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.stats().events_in_use, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn discarded_events_are_committed_in_order() {
    let registry = PluginRegistry::default();
    let input = Arc::new(Checkpoints::default());
    let output = Arc::new(Recorder::default());
    let conditions = MatchConditions::new(
        &BTreeMap::from([("level".to_string(), "debug".to_string())]),
        MatchMode::And,
        false,
    )
    .unwrap();
    let pipeline = PipelineBuilder::new(settings(2), output.clone())
        .batcher(batcher(3, Duration::from_millis(10), 1))
        .action(
            ActionSpec::new(
                "drop_debug",
                registry
                    .action("discard", &serde_json::Value::Null)
                    .unwrap(),
            )
            .with_conditions(conditions),
        )
        .input(input.clone())
        .start()
        .unwrap();

    for offset in 1..=12 {
        let level = if offset % 3 == 0 { "info" } else { "debug" };
        let raw = json!({"level": level, "message": format!("line {offset}")}).to_string();
        pipeline
            .submit(SourceId(1), "app.log", offset, raw.as_bytes())
            .await
            .unwrap();
    }
    pipeline.stop().await.unwrap();

    assert_eq!(
        output.messages(),
        vec!["line 3", "line 6", "line 9", "line 12"]
    );
    assert_eq!(*input.all.lock().unwrap(), (1..=12).collect::<Vec<_>>());

    let stats = pipeline.stats();
    assert_eq!(stats.actions[0].discarded, 8);
    assert_eq!(stats.actions[0].not_matched, 4);
}

struct Rejecting;

#[async_trait]
impl Output for Rejecting {
    async fn send(&self, _batch: &Batch) -> Result<(), OutputError> {
        Err(OutputError::Permanent("payload rejected".to_string()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_batches_go_to_the_dead_letter_and_are_still_committed() {
    let input = Arc::new(Checkpoints::default());
    let dead = Arc::new(AtomicU64::new(0));
    let dead_letter: DeadLetter = {
        let dead = Arc::clone(&dead);
        Arc::new(move |batch: &Batch, error: &OutputError| {
            assert!(matches!(error, OutputError::Permanent(_)));
            dead.fetch_add(batch.len() as u64, Ordering::Relaxed);
        })
    };
    let pipeline = PipelineBuilder::new(settings(2), Arc::new(Rejecting))
        .batcher(batcher(4, Duration::from_millis(10), 2))
        .dead_letter(dead_letter)
        .input(input.clone())
        .start()
        .unwrap();

    for offset in 1..=10 {
        pipeline
            .submit(SourceId(7), "app.log", offset, br#"{"message":"x"}"#)
            .await
            .unwrap();
    }
    pipeline.stop().await.unwrap();

    assert_eq!(dead.load(Ordering::Relaxed), 10);
    assert_eq!(*input.all.lock().unwrap(), (1..=10).collect::<Vec<_>>());
    let stats = pipeline.stats().batcher;
    assert_eq!(stats.send_failures, stats.batches_sealed);
}
