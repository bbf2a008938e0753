//! Activity execution context

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context provided to activities during execution
///
/// The context provides:
/// - Information about the current execution attempt
/// - Cancellation detection
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     tokio::select! {
///         result = do_work(input) => result,
///         _ = ctx.cancelled() => Err(ActivityError::cancelled("workflow cancelled")),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Unique execution attempt ID
    pub attempt_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed (0 = unlimited)
    pub max_attempts: u32,

    /// Run that owns this activity
    pub run_id: Uuid,

    /// Business identifier of the owning workflow
    pub workflow_id: String,

    /// Activity ID within the workflow
    pub activity_id: String,

    /// Registered activity type
    pub activity_type: String,

    cancellation: CancellationToken,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        run_id: Uuid,
        workflow_id: impl Into<String>,
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            attempt,
            max_attempts,
            run_id,
            workflow_id: workflow_id.into(),
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Get a handle that can be used to cancel this activity
    pub fn cancellation_handle(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.max_attempts != 0 && self.attempt >= self.max_attempts
    }
}
