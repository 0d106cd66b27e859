// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use logpipe::{Error, Event, Input, Pipeline, SourceId};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const SOURCE_NAME: &str = "stdin";

/// Feeds lines from standard input. Nothing is checkpointed: stdin cannot be
/// replayed, the last acknowledged offset is only reported.
#[derive(Debug, Default)]
pub struct StdinInput {
    committed: AtomicI64,
}

impl StdinInput {
    /// Offset right after the last line acknowledged by the pipeline.
    pub fn committed(&self) -> i64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub async fn run(&self, pipeline: Arc<Pipeline>, cancel: CancellationToken) -> u64 {
        let reader = tokio::io::BufReader::new(tokio::io::stdin());
        self.read_lines(reader, &pipeline, &cancel).await
    }

    pub async fn read_lines<R>(
        &self,
        mut reader: R,
        pipeline: &Pipeline,
        cancel: &CancellationToken,
    ) -> u64
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = Vec::new();
        let mut offset: i64 = 0;
        let mut submitted = 0;
        loop {
            line.clear();
            let read = tokio::select! {
                () = cancel.cancelled() => break,
                read = reader.read_until(b'\n', &mut line) => read,
            };
            let read = match read {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) => {
                    error!("STDIN | read failed: {e}");
                    break;
                }
            };
            offset += i64::try_from(read).unwrap_or(i64::MAX);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match pipeline.submit(SourceId(1), SOURCE_NAME, offset, &line).await {
                Ok(_) => submitted += 1,
                Err(Error::Stopped) => break,
                Err(e @ (Error::Decode { .. } | Error::TooLarge { .. })) => {
                    warn!("STDIN | skipping line ending at offset {offset}: {e}");
                }
                Err(e) => {
                    error!("STDIN | stopped reading: {e}");
                    break;
                }
            }
        }
        debug!("STDIN | submitted {submitted} lines");
        submitted
    }
}

impl Input for StdinInput {
    fn commit(&self, event: &Event) {
        self.committed.store(event.offset, Ordering::Relaxed);
    }
}
