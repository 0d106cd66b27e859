// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use serde_json::Value;

use crate::action::{Action, ActionFactory, ActionResult};
use crate::errors::ConfigError;
use crate::event::Event;

/// Drops every event it sees. Combine with match conditions to filter.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardAction;

impl Action for DiscardAction {
    fn process(&mut self, event: &mut Event) -> ActionResult {
        if event.is_timeout() {
            return ActionResult::Pass;
        }
        ActionResult::Discard
    }
}

pub fn factory(_params: &Value) -> Result<ActionFactory, ConfigError> {
    Ok(Arc::new(|| Box::new(DiscardAction) as Box<dyn Action>))
}
