//! Structured payload threaded through every activity
//!
//! A payload is a JSON object. Each activity reads what earlier steps left
//! behind and adds keys under its own namespace, so it must never drop keys
//! it does not own:
//!
//! | Owner | Keys |
//! |---|---|
//! | Activity1 | `activity1_*`, `raw_input` |
//! | Activity2 | `activity2_*`, `original_message`, `enriched_message` |
//! | Activity4 | `activity4_*`, `child_workflow_execution`, `child_transformation` |
//! | Activity3 | builds a fresh result: `workflow_completed`, `completion_time`, `validations`, `final_status`, `message`, `all_data` |
//! | WorkflowD | `parallel_results` on the consolidated input |

use chrono::{SecondsFormat, Utc};
use flowline_durable::activity::{error_types, ActivityError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Key used when the input is not structured data
pub const RAW_INPUT: &str = "raw_input";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PayloadError {
    #[error("failed to parse input: expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("failed to parse input: {0}")]
    InvalidJson(String),
}

impl From<PayloadError> for ActivityError {
    fn from(err: PayloadError) -> Self {
        ActivityError::non_retryable(err.to_string()).with_type(error_types::PARSE_ERROR)
    }
}

/// Mapping from string keys to heterogeneous values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept anything
    ///
    /// Objects are taken as they are and strings holding a JSON object are
    /// parsed. Null is an empty payload. Anything else is kept as text under
    /// [`RAW_INPUT`].
    pub fn from_lenient(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            Value::Null => Self::new(),
            Value::String(text) => match serde_json::from_str::<Map<String, Value>>(&text) {
                Ok(map) => Self(map),
                Err(_) => Self::raw(text),
            },
            other => Self::raw(other.to_string()),
        }
    }

    /// Accept only an object or a string holding one
    pub fn from_strict(value: Value) -> Result<Self, PayloadError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::String(text) => serde_json::from_str::<Map<String, Value>>(&text)
                .map(Self)
                .map_err(|e| PayloadError::InvalidJson(e.to_string())),
            other => Err(PayloadError::NotAnObject(json_type(&other))),
        }
    }

    fn raw(text: String) -> Self {
        let mut payload = Self::new();
        payload.insert(RAW_INPUT, text);
        payload
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// A value as display text: strings as they are, anything else as JSON
    ///
    /// Absent and `null` values have no text.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Whether a boolean marker is present and true
    pub fn flag(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Write the current time (RFC 3339, seconds) under `key`
    pub fn stamp(&mut self, key: impl Into<String>) {
        self.insert(key, now_rfc3339());
    }

    /// Copy every key of `other` into this payload
    ///
    /// Keys present in both take the value from `other`.
    pub fn merge(&mut self, other: Payload) {
        self.0.extend(other.0);
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        payload.into_value()
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
