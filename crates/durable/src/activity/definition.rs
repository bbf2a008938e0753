//! Activity trait and failure taxonomy

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Classification of a failed unit of work
///
/// Shared by activities and workflows so a failure keeps its class as it
/// travels from an activity, through a child workflow, to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retryable under the attached policy
    #[default]
    Transient,

    /// Retry budget exhausted, or a non-retryable validation error
    Terminal,

    /// The unit exceeded its allotted duration
    Timeout,

    /// Propagated from an upstream cancellation; never retried
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Terminal => write!(f, "terminal"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Error type for activity failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Failure class
    #[serde(default)]
    pub kind: FailureKind,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors will immediately fail the activity
    /// without further retry attempts.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Transient,
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Terminal,
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// The activity ran past its start-to-close timeout
    ///
    /// Retried like any transient failure.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Timeout,
            error_type: Some(error_types::TIMEOUT.to_string()),
            retryable: true,
            details: None,
        }
    }

    /// The activity was cancelled by its workflow
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Cancelled,
            error_type: Some(error_types::CANCELLED.to_string()),
            retryable: false,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Mark this error as the last word after the retry budget ran out
    ///
    /// Transient failures become terminal. Timeouts and cancellations keep
    /// their class.
    pub fn exhausted(mut self) -> Self {
        if self.kind == FailureKind::Transient {
            self.kind = FailureKind::Terminal;
        }
        self
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Well-known `error_type` values set by the engine
pub mod error_types {
    /// Start-to-close timeout
    pub const TIMEOUT: &str = "Timeout";

    /// Cancelled by the owning workflow
    pub const CANCELLED: &str = "Cancelled";

    /// Input could not be decoded into the activity's input type
    pub const PARSE_ERROR: &str = "ParseError";

    /// No worker handler for the activity type
    pub const UNKNOWN_ACTIVITY: &str = "UnknownActivity";

    /// Workflow code produced an action the engine refused
    pub const INVALID_ACTION: &str = "InvalidAction";

    /// A child run could not be created
    pub const CHILD_START_FAILED: &str = "ChildStartFailed";
}

/// An activity is a unit of work that may fail and be retried
///
/// Activities run on the worker pool, outside workflow code. They:
/// - May take a long time to complete
/// - Can fail and be retried
/// - Must tolerate being executed more than once with the same input
///
/// # Example
///
/// ```ignore
/// use flowline_durable::prelude::*;
///
/// struct SendEmailActivity;
///
/// #[async_trait]
/// impl Activity for SendEmailActivity {
///     const TYPE: &'static str = "send_email";
///     type Input = SendEmailInput;
///     type Output = SendEmailOutput;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         // Send email...
///         Ok(SendEmailOutput { message_id: "..." })
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier for this activity
    ///
    /// This is used to route tasks to the right worker handler.
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity
    ///
    /// # Errors
    ///
    /// Return `ActivityError::retryable()` for transient failures that should be retried.
    /// Return `ActivityError::non_retryable()` for permanent failures.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}
