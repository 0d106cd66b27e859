// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turning raw records into event documents.

use std::sync::Arc;

use serde_json::{Map, Value};
use ustr::Ustr;

use crate::errors::{ConfigError, DecodeError};
use crate::event::Event;

pub trait Decoder: Send + Sync {
    /// Fills `event.root` (and `event.stream_name` when the record carries
    /// one) from `raw`.
    fn decode(&self, raw: &[u8], event: &mut Event) -> Result<(), DecodeError>;
}

fn trim_line_end(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// Wraps the record text as `{"message": <text>}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    fn decode(&self, raw: &[u8], event: &mut Event) -> Result<(), DecodeError> {
        let text = std::str::from_utf8(trim_line_end(raw)).map_err(|_| DecodeError::Utf8)?;
        let mut root = Map::with_capacity(1);
        root.insert("message".to_string(), Value::String(text.to_string()));
        event.root = Value::Object(root);
        Ok(())
    }
}

/// Parses the record as a json object.
///
/// With a `stream_field`, the text of that field (dot path) names the
/// stream the event belongs to, e.g. `stream` for docker json logs where
/// stdout and stderr must be ordered separately.
#[derive(Debug, Default, Clone)]
pub struct JsonDecoder {
    stream_field: Option<String>,
}

impl JsonDecoder {
    #[must_use]
    pub fn new(stream_field: Option<String>) -> Self {
        Self { stream_field }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Decoder for JsonDecoder {
    fn decode(&self, raw: &[u8], event: &mut Event) -> Result<(), DecodeError> {
        let root: Value = serde_json::from_slice(raw)?;
        if !root.is_object() {
            return Err(DecodeError::NotAnObject(kind_of(&root)));
        }
        event.root = root;
        let stream = self.stream_field.as_deref().and_then(|field| {
            event
                .field_str(field)
                .filter(|name| !name.is_empty())
                .map(|name| Ustr::from(name.as_ref()))
        });
        if let Some(stream) = stream {
            event.stream_name = stream;
        }
        Ok(())
    }
}

/// Looks up a built-in decoder by name.
pub fn decoder_for(
    name: &str,
    stream_field: Option<String>,
) -> Result<Arc<dyn Decoder>, ConfigError> {
    match name {
        "raw" => Ok(Arc::new(RawDecoder)),
        "json" => Ok(Arc::new(JsonDecoder::new(stream_field))),
        other => Err(ConfigError::UnknownDecoder(other.to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_STREAM_NAME;
    use serde_json::json;

    fn blank() -> Event {
        let mut event = *Event::synthetic(json!({}));
        event.stream_name = Ustr::from(DEFAULT_STREAM_NAME);
        event
    }

    #[test]
    fn test_raw_strips_line_end() {
        let mut event = blank();
        RawDecoder.decode(b"hello world\r\n", &mut event).unwrap();
        assert_eq!(event.root, json!({"message": "hello world"}));
    }

    #[test]
    fn test_raw_rejects_invalid_utf8() {
        let mut event = blank();
        assert!(matches!(
            RawDecoder.decode(&[0xff, 0xfe], &mut event),
            Err(DecodeError::Utf8)
        ));
    }

    #[test]
    fn test_json_stream_field() {
        let decoder = JsonDecoder::new(Some("stream".to_string()));
        let mut event = blank();
        decoder
            .decode(br#"{"log":"boot\n","stream":"stderr"}"#, &mut event)
            .unwrap();
        assert_eq!(event.stream_name.as_str(), "stderr");
        assert_eq!(event.field_str("log").unwrap(), "boot\n");

        let mut event = blank();
        decoder.decode(br#"{"log":"x"}"#, &mut event).unwrap();
        assert_eq!(event.stream_name.as_str(), DEFAULT_STREAM_NAME);
    }

    #[test]
    fn test_json_rejects_non_objects() {
        let decoder = JsonDecoder::default();
        let mut event = blank();
        assert!(matches!(
            decoder.decode(b"[1,2]", &mut event),
            Err(DecodeError::NotAnObject("array"))
        ));
        assert!(matches!(
            decoder.decode(b"{\"broken\":", &mut event),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_unknown_decoder() {
        assert!(decoder_for("json", None).is_ok());
        assert!(matches!(
            decoder_for("cri", None),
            Err(ConfigError::UnknownDecoder(name)) if name == "cri"
        ));
    }
}
