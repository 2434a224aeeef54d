//! Per-endpoint result normalization.
//!
//! Endpoints disagree about how deeply an evaluation result is nested. A
//! [`ResultNormalizer`] turns whatever the endpoint sent into one canonical
//! [`Evaluated`] shape.

use std::sync::Arc;

use serde_json::{json, Value};

use rdbg_core::prelude::*;
use rdbg_core::DebuggerKind;

use crate::protocol::thrown_value_message;

/// Canonical evaluation result.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluated {
    pub value: Value,
    pub was_thrown: bool,
}

impl Evaluated {
    pub fn value(value: Value) -> Self {
        Self {
            value,
            was_thrown: false,
        }
    }

    /// The value, or a [`Error::RemoteScript`] when it was thrown.
    pub fn into_value(self) -> Result<Value> {
        if !self.was_thrown {
            return Ok(self.value);
        }
        let message = match &self.value {
            Value::String(s) => s.clone(),
            other => thrown_value_message(Some(other)),
        };
        Err(Error::remote_script(message))
    }
}

/// Turns the `result` document of a `Runtime.evaluate` response into the
/// evaluated value. Each response is unwrapped exactly once.
pub trait ResultNormalizer: Send + Sync {
    fn unwrap_result(&self, raw: Value) -> Result<Evaluated>;

    fn convert(&self, raw: Value) -> Result<Value> {
        self.unwrap_result(raw)?.into_value()
    }
}

/// The native endpoint answers in canonical shape:
/// `{ "result": <remote object>, "wasThrown": bool }`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeNormalizer;

impl ResultNormalizer for NativeNormalizer {
    fn unwrap_result(&self, raw: Value) -> Result<Evaluated> {
        let mut document = match raw {
            Value::Object(document)
                if document.contains_key("result") || document.contains_key("wasThrown") =>
            {
                document
            }
            other => return Ok(Evaluated::value(other)),
        };

        let was_thrown = document
            .get("wasThrown")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let value = match document.remove("result") {
            Some(Value::Object(remote)) if was_thrown => {
                Value::String(thrown_value_message(Some(&Value::Object(remote))))
            }
            Some(Value::Object(mut remote)) => match remote.remove("value") {
                Some(value) => value,
                None if remote.get("type").and_then(Value::as_str) == Some("undefined") => {
                    Value::Null
                }
                None => Value::Object(remote),
            },
            Some(other) => other,
            None => Value::Null,
        };
        Ok(Evaluated { value, was_thrown })
    }
}

/// The WebKit endpoint raises thrown results itself and reports
/// `undefined` for calls that convey no data.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebKitNormalizer;

impl ResultNormalizer for WebKitNormalizer {
    fn unwrap_result(&self, raw: Value) -> Result<Evaluated> {
        let mut document = match raw {
            Value::Object(document) => document,
            other => return NativeNormalizer.unwrap_result(other),
        };

        if document
            .get("wasThrown")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(Error::remote_script(thrown_value_message(
                document.get("result"),
            )));
        }

        // "undefined" carries no data, e.g. an async call that returned nothing
        if let Some(Value::Object(remote)) = document.get_mut("result") {
            if remote.get("type").and_then(Value::as_str) == Some("undefined") {
                remote.insert("value".to_string(), json!({}));
            }
        }

        NativeNormalizer.unwrap_result(Value::Object(document))
    }
}

/// The normalizer matching an endpoint flavour.
pub fn normalizer_for(kind: DebuggerKind) -> Arc<dyn ResultNormalizer> {
    match kind {
        DebuggerKind::Native => Arc::new(NativeNormalizer),
        DebuggerKind::WebKit => Arc::new(WebKitNormalizer),
    }
}
