// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in plugins.

pub mod actions;
pub mod inputs;
pub mod outputs;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::errors::ConfigError;

/// Deserializes the `params` of a plugin. Absent params are an empty map so
/// plugins with only optional settings need no configuration at all.
pub(crate) fn parse_params<T: DeserializeOwned>(
    plugin: &str,
    params: &Value,
) -> Result<T, ConfigError> {
    let params = if params.is_null() {
        Value::Object(Map::new())
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| ConfigError::InvalidParams {
        plugin: plugin.to_string(),
        reason: e.to_string(),
    })
}
