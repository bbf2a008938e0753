//! Signals: messages delivered to a running workflow from outside

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named message for a running workflow
///
/// Recorded as a `SignalReceived` history event, so its delivery time is the
/// event's `recorded_at`, and handed to [`Workflow::on_signal`].
///
/// [`Workflow::on_signal`]: super::Workflow::on_signal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    pub signal_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl WorkflowSignal {
    pub fn new(signal_type: impl Into<String>, payload: Value) -> Self {
        Self {
            signal_type: signal_type.into(),
            payload,
        }
    }

    /// Ask the run to stop; outstanding work is cancelled with it
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::new(signal_types::CANCEL, serde_json::json!({ "reason": reason.into() }))
    }

    pub fn is_cancel(&self) -> bool {
        self.signal_type == signal_types::CANCEL
    }

    /// `payload.reason`, or a placeholder
    pub fn reason(&self) -> String {
        self.payload
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("no reason given")
            .to_string()
    }
}

pub mod signal_types {
    pub const CANCEL: &str = "cancel";
}
