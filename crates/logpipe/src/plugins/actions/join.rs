// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Joins continued lines into one record.
//!
//! A record whose text ends with the continuation marker (a backslash by
//! default) is glued to the next record of the same stream. The partial
//! records are collapsed, so only the last one carries the joined text and
//! every one of them is still committed.
//!
//! When the stream goes quiet with a partial record pending, the timeout
//! event is turned into a synthetic record carrying what was buffered.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::action::{Action, ActionFactory, ActionResult};
use crate::errors::ConfigError;
use crate::event::{Event, EventKind};
use crate::plugins::parse_params;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JoinParams {
    #[serde(default = "default_field")]
    pub field: String,
    #[serde(default = "default_continuation")]
    pub continuation: String,
    /// Joined text never grows past this many bytes; the record that would
    /// overflow it ends the join.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

fn default_field() -> String {
    "message".to_string()
}

fn default_continuation() -> String {
    "\\".to_string()
}

fn default_max_size() -> usize {
    64 * 1024
}

#[derive(Debug)]
pub struct JoinAction {
    params: Arc<JoinParams>,
    pending: String,
}

impl JoinAction {
    #[must_use]
    pub fn new(params: Arc<JoinParams>) -> Self {
        Self {
            params,
            pending: String::new(),
        }
    }

    fn flush_into_timeout(&mut self, event: &mut Event) {
        if self.pending.is_empty() {
            return;
        }
        event.kind = EventKind::Synthetic;
        event.set_field(
            &self.params.field,
            Value::String(std::mem::take(&mut self.pending)),
        );
    }
}

impl Action for JoinAction {
    fn process(&mut self, event: &mut Event) -> ActionResult {
        if event.is_timeout() {
            self.flush_into_timeout(event);
            return ActionResult::Pass;
        }
        let Some(Value::String(text)) = event.field(&self.params.field) else {
            return ActionResult::Pass;
        };
        if let Some(head) = text.strip_suffix(self.params.continuation.as_str()) {
            if self.pending.len() + head.len() <= self.params.max_size {
                self.pending.push_str(head);
                return ActionResult::Collapse;
            }
        }
        if self.pending.is_empty() {
            return ActionResult::Pass;
        }
        let joined = std::mem::take(&mut self.pending) + text.as_str();
        event.set_field(&self.params.field, Value::String(joined));
        ActionResult::Pass
    }
}

pub fn factory(params: &Value) -> Result<ActionFactory, ConfigError> {
    let params: Arc<JoinParams> = Arc::new(parse_params("join", params)?);
    if params.continuation.is_empty() {
        return Err(ConfigError::InvalidParams {
            plugin: "join".to_string(),
            reason: "continuation must not be empty".to_string(),
        });
    }
    Ok(Arc::new(move || {
        Box::new(JoinAction::new(Arc::clone(&params))) as Box<dyn Action>
    }))
}
