// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reads files line by line and checkpoints what was delivered.
//!
//! Each file is a source, identified by its path in the [`OffsetStore`].
//! Reading resumes at the checkpointed offset, so a restart replays at most
//! the lines that were in flight (at-least-once). Every line is submitted
//! with the offset right after its line feed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{Error, OffsetError};
use crate::event::Event;
use crate::input::Input;
use crate::offsets::OffsetStore;
use crate::pipeline::Pipeline;

pub struct FileInput {
    paths: Vec<PathBuf>,
    store: Arc<OffsetStore>,
    persistence_interval: Duration,
}

impl FileInput {
    #[must_use]
    pub fn new(paths: Vec<PathBuf>, store: Arc<OffsetStore>, persistence_interval: Duration) -> Self {
        Self {
            paths,
            store,
            persistence_interval,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<OffsetStore> {
        &self.store
    }

    /// Reads every file to its end. Returns the number of lines submitted.
    pub async fn run(&self, pipeline: Arc<Pipeline>, cancel: CancellationToken) -> u64 {
        let mut submitted = 0;
        for path in &self.paths {
            if cancel.is_cancelled() {
                break;
            }
            match self.read_file(path, &pipeline, &cancel).await {
                Ok(lines) => submitted += lines,
                Err(e) => error!("FILE | failed to read {}: {e}", path.display()),
            }
        }
        submitted
    }

    async fn read_file(
        &self,
        path: &PathBuf,
        pipeline: &Pipeline,
        cancel: &CancellationToken,
    ) -> Result<u64, std::io::Error> {
        let name = path.to_string_lossy();
        let source_id = self.store.source_id_for(&name);
        let mut file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();

        let mut offset = self
            .store
            .resume_offset(source_id)
            .and_then(|offset| u64::try_from(offset).ok())
            .unwrap_or(0);
        if offset > len {
            warn!("FILE | {name} is shorter than its checkpoint, reading it from the start");
            offset = 0;
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        debug!("FILE | reading {name} (source {source_id}) from offset {offset}");

        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut submitted = 0;
        loop {
            line.clear();
            let read = tokio::select! {
                () = cancel.cancelled() => break,
                read = reader.read_until(b'\n', &mut line) => read?,
            };
            if read == 0 {
                break;
            }
            offset += read as u64;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let end = i64::try_from(offset).unwrap_or(i64::MAX);
            match pipeline.submit(source_id, &name, end, &line).await {
                Ok(_) => submitted += 1,
                Err(Error::Stopped) => break,
                Err(e @ (Error::Decode { .. } | Error::TooLarge { .. })) => {
                    warn!("FILE | skipping line of {name} ending at offset {end}: {e}");
                }
                Err(e) => {
                    error!("FILE | stopped reading {name}: {e}");
                    break;
                }
            }
        }
        info!("FILE | submitted {submitted} lines from {name}");
        Ok(submitted)
    }

    pub async fn persist(&self) -> Result<bool, OffsetError> {
        self.store.persist().await
    }

    /// Persists the checkpoints periodically, and one last time once
    /// `cancel` fires.
    pub async fn run_persistence(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.persistence_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.persist().await {
                        error!("FILE | failed to persist offsets: {e}");
                    }
                }
            }
        }
        if let Err(e) = self.persist().await {
            error!("FILE | failed to persist offsets on shutdown: {e}");
        }
    }
}

impl Input for FileInput {
    fn commit(&self, event: &Event) {
        self.store.record(
            event.source_id,
            &event.source_name,
            &event.stream_name,
            event.offset,
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::batcher::{Batch, BatcherSettings};
    use crate::decoder::RawDecoder;
    use crate::errors::OutputError;
    use crate::output::Output;
    use crate::pipeline::{PipelineBuilder, PipelineSettings};
    use crate::retry::RetryStrategy;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl Output for Collect {
        async fn send(&self, batch: &Batch) -> Result<(), OutputError> {
            self.0.lock().unwrap().extend(
                batch
                    .iter()
                    .filter_map(|event| event.field_str("message").map(|m| m.into_owned())),
            );
            Ok(())
        }
    }

    async fn read_once(input: Arc<FileInput>) -> Vec<String> {
        let output = Arc::new(Collect::default());
        let pipeline = PipelineBuilder::new(
            PipelineSettings {
                capacity: 4,
                processors: 2,
                max_event_size: 32,
                ..PipelineSettings::default()
            },
            output.clone(),
        )
        .batcher(BatcherSettings {
            batch_size: 2,
            flush_timeout: Duration::from_millis(10),
            workers: 2,
            retry: RetryStrategy::Immediate { attempts: 1 },
            ..BatcherSettings::default()
        })
        .decoder(Arc::new(RawDecoder))
        .input(input.clone())
        .start()
        .unwrap();

        input.run(Arc::clone(&pipeline), CancellationToken::new()).await;
        pipeline.stop().await.unwrap();
        input.persist().await.unwrap();
        let lines = output.0.lock().unwrap().clone();
        lines
    }

    #[tokio::test]
    #[traced_test]
    async fn test_resumes_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        let offsets = dir.path().join("offsets.json");
        std::fs::write(&log, "one\ntwo\n\nthis line is longer than the limit\nthree\n").unwrap();

        let store = Arc::new(OffsetStore::load(&offsets).await.unwrap());
        let input = Arc::new(FileInput::new(
            vec![log.clone()],
            store,
            Duration::from_secs(60),
        ));
        assert_eq!(read_once(input).await, vec!["one", "two", "three"]);
        assert!(logs_contain("skipping line of"));

        let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        file.write_all(b"four\nfive\n").unwrap();
        drop(file);

        let store = Arc::new(OffsetStore::load(&offsets).await.unwrap());
        let source_id = store.source_id_for(&log.to_string_lossy());
        let input = Arc::new(FileInput::new(
            vec![log.clone()],
            Arc::clone(&store),
            Duration::from_secs(60),
        ));
        assert_eq!(read_once(input).await, vec!["four", "five"]);

        let len = i64::try_from(std::fs::metadata(&log).unwrap().len()).unwrap();
        assert_eq!(store.get(source_id, "not_set"), Some(len));
    }

    #[tokio::test]
    async fn test_persistence_loop_writes_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let offsets = dir.path().join("offsets.json");
        let store = Arc::new(OffsetStore::load(&offsets).await.unwrap());
        let input = Arc::new(FileInput::new(Vec::new(), store, Duration::from_secs(60)));

        let mut event = Event::synthetic(serde_json::json!({}));
        event.source_id = input.store().source_id_for("/var/log/x.log");
        event.source_name = ustr::ustr("/var/log/x.log");
        event.offset = 12;
        input.commit(&event);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&input).run_persistence(cancel.clone()));
        cancel.cancel();
        task.await.unwrap();

        let reloaded = OffsetStore::load(&offsets).await.unwrap();
        assert_eq!(reloaded.resume_offset(event.source_id), Some(12));
    }
}
