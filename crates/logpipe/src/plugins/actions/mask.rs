// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Masks sensitive sequences in a text field.
//!
//! ```yaml
//! actions:
//!   - type: mask
//!     params:
//!       field: message
//!       pattern: '\d{4}-\d{4}-\d{4}-\d{4}'
//!       replace_placeholder: "[CREDIT_CARD_REDACTED]"
//! ```

use std::borrow::Cow;
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::action::{Action, ActionFactory, ActionResult};
use crate::errors::ConfigError;
use crate::event::Event;
use crate::plugins::parse_params;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MaskParams {
    #[serde(default = "default_field")]
    pub field: String,
    pub pattern: String,
    #[serde(default = "default_placeholder")]
    pub replace_placeholder: String,
}

fn default_field() -> String {
    "message".to_string()
}

fn default_placeholder() -> String {
    "[MASKED]".to_string()
}

#[derive(Debug, Clone)]
pub struct MaskAction {
    field: Arc<str>,
    regex: Regex,
    placeholder: Arc<str>,
}

impl MaskAction {
    pub fn new(params: &MaskParams) -> Result<Self, ConfigError> {
        let regex = Regex::new(&params.pattern).map_err(|e| ConfigError::InvalidParams {
            plugin: "mask".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            field: Arc::from(params.field.as_str()),
            regex,
            placeholder: Arc::from(params.replace_placeholder.as_str()),
        })
    }
}

impl Action for MaskAction {
    fn process(&mut self, event: &mut Event) -> ActionResult {
        let Some(Value::String(text)) = event.field(&self.field) else {
            return ActionResult::Pass;
        };
        let masked = match self.regex.replace_all(text, &*self.placeholder) {
            Cow::Borrowed(_) => return ActionResult::Pass,
            Cow::Owned(masked) => masked,
        };
        event.set_field(&self.field, Value::String(masked));
        ActionResult::Pass
    }
}

pub fn factory(params: &Value) -> Result<ActionFactory, ConfigError> {
    let action = MaskAction::new(&parse_params("mask", params)?)?;
    Ok(Arc::new(move || Box::new(action.clone()) as Box<dyn Action>))
}
