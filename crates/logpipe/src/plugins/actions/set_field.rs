// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::action::{Action, ActionFactory, ActionResult};
use crate::errors::ConfigError;
use crate::event::Event;
use crate::plugins::parse_params;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SetFieldParams {
    pub field: String,
    pub value: Value,
    /// When false an existing value is kept.
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

fn default_overwrite() -> bool {
    true
}

/// Sets a constant value on a dot separated field.
#[derive(Debug, Clone)]
pub struct SetFieldAction {
    params: Arc<SetFieldParams>,
}

impl SetFieldAction {
    #[must_use]
    pub fn new(params: Arc<SetFieldParams>) -> Self {
        Self { params }
    }
}

impl Action for SetFieldAction {
    fn process(&mut self, event: &mut Event) -> ActionResult {
        if event.is_timeout() {
            return ActionResult::Pass;
        }
        if self.params.overwrite || event.field(&self.params.field).is_none() {
            event.set_field(&self.params.field, self.params.value.clone());
        }
        ActionResult::Pass
    }
}

pub fn factory(params: &Value) -> Result<ActionFactory, ConfigError> {
    let params: Arc<SetFieldParams> = Arc::new(parse_params("set_field", params)?);
    if params.field.is_empty() {
        return Err(ConfigError::InvalidParams {
            plugin: "set_field".to_string(),
            reason: "field must not be empty".to_string(),
        });
    }
    Ok(Arc::new(move || {
        Box::new(SetFieldAction::new(Arc::clone(&params))) as Box<dyn Action>
    }))
}
