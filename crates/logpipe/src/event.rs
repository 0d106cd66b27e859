// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The unit of work moved through the engine.
//!
//! An [`Event`] is a structured log document plus the bookkeeping the engine
//! needs to deliver it: where it came from (source, stream, offset), its
//! position in the stream (`seq_id`), where it is in the action chain and
//! which component currently owns it.
//!
//! Events are always moved as `Box<Event>`. Handing the box to another
//! component is the ownership transfer; no two components ever hold the same
//! event at once.

use std::fmt;
use std::sync::Arc;

use derive_more::{Display, From, Into};
use serde_json::{Map, Value};
use ustr::Ustr;

use crate::constants::DEFAULT_STREAM_NAME;
use crate::stream::Stream;

/// Stable identifier of an input source (a file, a socket, a partition).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From, Into)]
pub struct SourceId(pub u64);

/// Sequence number of an event inside its stream, starting at 1.
pub type SeqId = u64;

/// What produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Decoded from a source record; occupies a pool slot and is committed.
    Regular,
    /// Synthesised when a stream wait expired. Never committed, dropped at the
    /// end of the chain.
    Timeout,
    /// Produced by an action (usually from a timeout event). Delivered to the
    /// output but never committed to the input.
    Synthetic,
}

/// Which component holds the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Free,
    Stream,
    Processor,
    Output,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Free => "free",
            Stage::Stream => "stream",
            Stage::Processor => "processor",
            Stage::Output => "output",
        };
        f.write_str(s)
    }
}

pub struct Event {
    /// The log document. Decoders always produce an object.
    pub root: Value,
    /// Scratch space actions may use to build field values without allocating.
    pub buf: Vec<u8>,
    pub kind: EventKind,
    pub source_id: SourceId,
    pub source_name: Ustr,
    pub stream_name: Ustr,
    /// Commit token of the record in its source, usually the byte offset right
    /// after the record.
    pub offset: i64,
    pub seq_id: SeqId,
    /// Size of the raw record in bytes.
    pub size: usize,

    pub(crate) slot: Option<usize>,
    pub(crate) action: usize,
    pub(crate) stage: Stage,
    pub(crate) stream: Option<Arc<Stream>>,
    pub(crate) commit_only: bool,
}

impl Event {
    pub(crate) fn pooled(slot: usize) -> Self {
        Self {
            slot: Some(slot),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            root: Value::Object(Map::new()),
            buf: Vec::new(),
            kind: EventKind::Regular,
            source_id: SourceId(0),
            source_name: Ustr::from(""),
            stream_name: Ustr::from(DEFAULT_STREAM_NAME),
            offset: 0,
            seq_id: 0,
            size: 0,
            slot: None,
            action: 0,
            stage: Stage::Free,
            stream: None,
            commit_only: false,
        }
    }

    /// Builds the event handed to a processor whose wait on `stream` expired.
    pub(crate) fn timeout(stream: &Arc<Stream>) -> Box<Self> {
        let mut event = Self::empty();
        event.kind = EventKind::Timeout;
        event.source_id = stream.source_id();
        event.stream_name = stream.name();
        event.stage = Stage::Processor;
        event.stream = Some(Arc::clone(stream));
        Box::new(event)
    }

    /// Builds an event outside the pool, for actions that need to emit data
    /// of their own. It is delivered but never committed.
    #[must_use]
    pub fn synthetic(root: Value) -> Box<Self> {
        let mut event = Self::empty();
        event.kind = EventKind::Synthetic;
        event.root = root;
        Box::new(event)
    }

    /// Clears everything but the allocations so the slot can be reused.
    pub(crate) fn reset(&mut self) {
        match &mut self.root {
            Value::Object(map) => map.clear(),
            other => *other = Value::Object(Map::new()),
        }
        self.buf.clear();
        self.kind = EventKind::Regular;
        self.source_id = SourceId(0);
        self.source_name = Ustr::from("");
        self.stream_name = Ustr::from(DEFAULT_STREAM_NAME);
        self.offset = 0;
        self.seq_id = 0;
        self.size = 0;
        self.action = 0;
        self.stage = Stage::Free;
        self.stream = None;
        self.commit_only = false;
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind == EventKind::Timeout
    }

    /// Whether the event occupies a pool slot and must be committed.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.slot.is_some()
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Index of the action the event resumes at.
    #[must_use]
    pub fn action_cursor(&self) -> usize {
        self.action
    }

    /// Looks up a dot separated path, e.g. `k8s.pod.name`.
    #[must_use]
    pub fn field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.root, |node, key| node.as_object()?.get(key))
    }

    /// Returns the field rendered as text: strings as-is, scalars via their
    /// json representation. Objects and arrays yield `None`.
    #[must_use]
    pub fn field_str(&self, path: &str) -> Option<std::borrow::Cow<'_, str>> {
        match self.field(path)? {
            Value::String(s) => Some(std::borrow::Cow::Borrowed(s.as_str())),
            Value::Number(n) => Some(std::borrow::Cow::Owned(n.to_string())),
            Value::Bool(b) => Some(std::borrow::Cow::Owned(b.to_string())),
            Value::Null | Value::Object(_) | Value::Array(_) => None,
        }
    }

    /// Sets a field, creating intermediate objects. A non-object node on the
    /// path is replaced.
    pub fn set_field(&mut self, path: &str, value: Value) {
        let mut node = &mut self.root;
        let mut keys = path.split('.').peekable();
        while let Some(key) = keys.next() {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let Value::Object(map) = node else {
                return;
            };
            if keys.peek().is_none() {
                map.insert(key.to_string(), value);
                return;
            }
            node = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }

    pub fn remove_field(&mut self, path: &str) -> Option<Value> {
        let (parent, last) = match path.rsplit_once('.') {
            Some((parent, last)) => (Some(parent), last),
            None => (None, path),
        };
        let node = match parent {
            Some(parent) => parent
                .split('.')
                .try_fold(&mut self.root, |node, key| node.as_object_mut()?.get_mut(key))?,
            None => &mut self.root,
        };
        node.as_object_mut()?.remove(last)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("source_id", &self.source_id)
            .field("stream", &self.stream_name)
            .field("offset", &self.offset)
            .field("seq_id", &self.seq_id)
            .field("slot", &self.slot)
            .field("action", &self.action)
            .field("stage", &self.stage)
            .field("root", &self.root)
            .finish()
    }
}
