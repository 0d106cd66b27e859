// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persisted record of the last committed offset of every stream.
//!
//! The checkpoint file is a json document keyed by source id:
//!
//! ```json
//! {
//!   "1": { "source_name": "/var/log/app.log", "streams": { "stdout": 5120 } },
//!   "2": { "source_name": "/var/log/db.log", "streams": { "not_set": 98 } }
//! }
//! ```
//!
//! It is rewritten atomically: the new content goes to a temporary file next
//! to it, is synced, then renamed over the old one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::errors::OffsetError;
use crate::event::SourceId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOffsets {
    pub source_name: String,
    pub streams: BTreeMap<String, i64>,
}

#[derive(Debug)]
pub struct OffsetStore {
    path: PathBuf,
    sources: Mutex<BTreeMap<u64, SourceOffsets>>,
    dirty: AtomicBool,
}

impl OffsetStore {
    /// Reads the checkpoint file. A missing file is an empty store.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, OffsetError> {
        let path = path.into();
        let sources = match tokio::fs::read(&path).await {
            Ok(content) if content.is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_slice(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(
            "OFFSETS | loaded {} sources from {}",
            sources.len(),
            path.display()
        );
        Ok(Self {
            path,
            sources: Mutex::new(sources),
            dirty: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Id already used for `source_name`, or the next free one.
    pub fn source_id_for(&self, source_name: &str) -> SourceId {
        let mut sources = self.lock();
        if let Some((id, _)) = sources
            .iter()
            .find(|(_, offsets)| offsets.source_name == source_name)
        {
            return SourceId(*id);
        }
        let id = sources.keys().next_back().map_or(1, |last| last + 1);
        sources.insert(
            id,
            SourceOffsets {
                source_name: source_name.to_string(),
                streams: BTreeMap::new(),
            },
        );
        SourceId(id)
    }

    #[must_use]
    pub fn get(&self, source_id: SourceId, stream: &str) -> Option<i64> {
        self.lock()
            .get(&source_id.0)
            .and_then(|offsets| offsets.streams.get(stream).copied())
    }

    /// Where reading a source should resume: the lowest committed offset over
    /// its streams, so no stream misses a record.
    #[must_use]
    pub fn resume_offset(&self, source_id: SourceId) -> Option<i64> {
        self.lock()
            .get(&source_id.0)
            .and_then(|offsets| offsets.streams.values().min().copied())
    }

    /// Remembers a committed offset. Offsets only move forward.
    pub fn record(&self, source_id: SourceId, source_name: &str, stream: &str, offset: i64) {
        let mut sources = self.lock();
        let offsets = sources.entry(source_id.0).or_default();
        if offsets.source_name.is_empty() {
            offsets.source_name = source_name.to_string();
        }
        let current = offsets.streams.entry(stream.to_string()).or_insert(offset);
        if offset > *current {
            *current = offset;
        }
        self.dirty.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<u64, SourceOffsets> {
        self.lock().clone()
    }

    /// Writes the store if anything changed since the last write.
    pub async fn persist(&self) -> Result<bool, OffsetError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let content = serde_json::to_vec_pretty(&*self.lock())?;
        if let Err(e) = self.write_atomically(&content).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!("OFFSETS | persisted to {}", self.path.display());
        Ok(true)
    }

    async fn write_atomically(&self, content: &[u8]) -> Result<(), OffsetError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, SourceOffsets>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
