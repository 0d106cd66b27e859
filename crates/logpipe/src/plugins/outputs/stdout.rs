// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::batcher::Batch;
use crate::errors::{ConfigError, OutputError};
use crate::output::Output;

/// Writes every event as one json line on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutOutput;

/// Renders the deliverable events of a batch as json lines.
pub(crate) fn json_lines(batch: &Batch) -> Result<Vec<u8>, OutputError> {
    let mut buf = Vec::new();
    for event in batch.iter() {
        serde_json::to_writer(&mut buf, &event.root)
            .map_err(|e| OutputError::Permanent(e.to_string()))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

#[async_trait]
impl Output for StdoutOutput {
    async fn send(&self, batch: &Batch) -> Result<(), OutputError> {
        let lines = json_lines(batch)?;
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(&lines)
            .map_err(|e| OutputError::Retryable(e.to_string()))?;
        stdout
            .flush()
            .map_err(|e| OutputError::Retryable(e.to_string()))
    }
}

pub fn factory(_params: &Value) -> Result<Arc<dyn Output>, ConfigError> {
    Ok(Arc::new(StdoutOutput))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::Event;
    use serde_json::json;

    #[test]
    fn test_json_lines_skip_commit_only_entries() {
        let mut batch = Batch::with_capacity(3);
        batch.push(Event::synthetic(json!({"message": "a"})));
        let mut dropped = Event::synthetic(json!({"message": "dropped"}));
        dropped.commit_only = true;
        batch.push(dropped);
        batch.push(Event::synthetic(json!({"message": "b", "n": 1})));

        let lines = String::from_utf8(json_lines(&batch).unwrap()).unwrap();
        assert_eq!(lines, "{\"message\":\"a\"}\n{\"message\":\"b\",\"n\":1}\n");
    }
}
