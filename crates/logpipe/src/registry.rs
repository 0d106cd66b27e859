// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Plugin lookup by configured type name.

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use serde_json::Value;

use crate::action::ActionFactory;
use crate::errors::ConfigError;
use crate::output::Output;
use crate::plugins::{actions, outputs};

/// Builds an action factory from the `params` of its configuration entry.
pub type ActionBuilder = fn(&Value) -> Result<ActionFactory, ConfigError>;

/// Builds an output from the `params` of the output configuration.
pub type OutputBuilder = fn(&Value) -> Result<Arc<dyn Output>, ConfigError>;

#[derive(Clone)]
pub struct PluginRegistry {
    actions: HashMap<String, ActionBuilder>,
    outputs: HashMap<String, OutputBuilder>,
}

impl Default for PluginRegistry {
    /// A registry holding every built-in plugin.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_action("discard", actions::discard::factory);
        registry.register_action("join", actions::join::factory);
        registry.register_action("mask", actions::mask::factory);
        registry.register_action("set_field", actions::set_field::factory);
        registry.register_output("devnull", outputs::devnull::factory);
        registry.register_output("http", outputs::http::factory);
        registry.register_output("stdout", outputs::stdout::factory);
        registry
    }
}

impl PluginRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
            outputs: HashMap::new(),
        }
    }

    /// Registers an action type, replacing any previous one of that name.
    pub fn register_action(&mut self, name: impl Into<String>, builder: ActionBuilder) {
        self.actions.insert(name.into(), builder);
    }

    pub fn register_output(&mut self, name: impl Into<String>, builder: OutputBuilder) {
        self.outputs.insert(name.into(), builder);
    }

    pub fn action(&self, name: &str, params: &Value) -> Result<ActionFactory, ConfigError> {
        let builder = self
            .actions
            .get(name)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                kind: "action",
                name: name.to_string(),
            })?;
        builder(params)
    }

    pub fn output(&self, name: &str, params: &Value) -> Result<Arc<dyn Output>, ConfigError> {
        let builder = self
            .outputs
            .get(name)
            .ok_or_else(|| ConfigError::UnknownPlugin {
                kind: "output",
                name: name.to_string(),
            })?;
        builder(params)
    }

    #[must_use]
    pub fn action_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn output_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.outputs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("actions", &self.action_names())
            .field("outputs", &self.output_names())
            .finish()
    }
}
