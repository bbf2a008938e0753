//! The four activity units
//!
//! Every activity takes a structured payload, waits out a simulated I/O
//! latency, and returns the payload with its own markers added. Markers are
//! booleans plus an RFC 3339 timestamp, so running an activity twice on the
//! same input yields outputs that differ only in their timestamp fields.

use std::time::Duration;

use async_trait::async_trait;
use flowline_durable::activity::{Activity, ActivityContext, ActivityError};
use serde_json::Value;
use tracing::{info, warn};

use crate::payload::{now_rfc3339, Payload};

// ============================================================================
// Latency
// ============================================================================

/// Scale applied to every activity's simulated latency
///
/// `1.0` reproduces the production timings; `0.0` removes the wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityLatency {
    scale: f64,
}

impl ActivityLatency {
    pub fn standard() -> Self {
        Self { scale: 1.0 }
    }

    pub fn none() -> Self {
        Self { scale: 0.0 }
    }

    /// Negative or non-finite scales are treated as zero
    pub fn scaled(scale: f64) -> Self {
        let scale = if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            0.0
        };
        Self { scale }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn apply(&self, base: Duration) -> Duration {
        base.mul_f64(self.scale)
    }
}

impl Default for ActivityLatency {
    fn default() -> Self {
        Self::standard()
    }
}

/// Wait out the simulated latency, giving up if the activity is cancelled
async fn simulate_io(ctx: &ActivityContext, duration: Duration) -> Result<(), ActivityError> {
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = ctx.cancelled() => Err(ActivityError::cancelled(format!(
            "{} cancelled during processing",
            ctx.activity_type
        ))),
    }
}

// ============================================================================
// Activity1
// ============================================================================

/// First unit of a chain: accepts any input and marks it received
#[derive(Debug, Clone, Default)]
pub struct ReceiveInput {
    latency: ActivityLatency,
}

impl ReceiveInput {
    pub const BASE_LATENCY: Duration = Duration::from_secs(1);

    pub fn new(latency: ActivityLatency) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Activity for ReceiveInput {
    const TYPE: &'static str = "Activity1";
    type Input = Value;
    type Output = Payload;

    async fn execute(&self, ctx: &ActivityContext, input: Value) -> Result<Payload, ActivityError> {
        info!(
            workflow_id = %ctx.workflow_id,
            activity_id = %ctx.activity_id,
            attempt = ctx.attempt,
            "Activity1 started"
        );
        simulate_io(ctx, self.latency.apply(Self::BASE_LATENCY)).await?;

        let mut payload = Payload::from_lenient(input);
        payload.insert("activity1_processed", true);
        payload.stamp("activity1_timestamp");
        payload.insert("activity1_message", "Input received and validated");

        info!(activity_id = %ctx.activity_id, keys = payload.len(), "Activity1 completed");
        Ok(payload)
    }
}

// ============================================================================
// Activity2
// ============================================================================

/// Validates the output of Activity1 and enriches it
#[derive(Debug, Clone, Default)]
pub struct EnrichData {
    latency: ActivityLatency,
}

impl EnrichData {
    pub const BASE_LATENCY: Duration = Duration::from_secs(2);

    pub fn new(latency: ActivityLatency) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Activity for EnrichData {
    const TYPE: &'static str = "Activity2";
    type Input = Value;
    type Output = Payload;

    async fn execute(&self, ctx: &ActivityContext, input: Value) -> Result<Payload, ActivityError> {
        info!(
            workflow_id = %ctx.workflow_id,
            activity_id = %ctx.activity_id,
            attempt = ctx.attempt,
            "Activity2 started"
        );
        simulate_io(ctx, self.latency.apply(Self::BASE_LATENCY)).await?;

        let mut payload = Payload::from_strict(input)?;
        if !payload.flag("activity1_processed") {
            warn!(activity_id = %ctx.activity_id, "Activity1 was not executed properly");
        }

        payload.insert("activity2_processed", true);
        payload.stamp("activity2_timestamp");
        payload.insert("activity2_validation", "Data validated and enriched");
        payload.insert("activity2_status", "success");

        if let Some(message) = payload.text("message") {
            payload.insert("enriched_message", format!("Processed: {}", message));
            if let Some(original) = payload.get("message").cloned() {
                payload.insert("original_message", original);
            }
        }

        info!(activity_id = %ctx.activity_id, keys = payload.len(), "Activity2 completed");
        Ok(payload)
    }
}

// ============================================================================
// Activity3
// ============================================================================

/// Closing unit: checks which steps ran and builds the final result
#[derive(Debug, Clone, Default)]
pub struct FinalizeRun {
    latency: ActivityLatency,
}

impl FinalizeRun {
    pub const BASE_LATENCY: Duration = Duration::from_secs(1);

    pub fn new(latency: ActivityLatency) -> Self {
        Self { latency }
    }

    fn validations(payload: &Payload) -> Vec<&'static str> {
        [
            ("activity1_processed", "Activity1: OK"),
            ("activity2_processed", "Activity2: OK"),
            ("activity4_processed", "Activity4 (WorkflowB): OK"),
        ]
        .into_iter()
        .filter(|(marker, _)| payload.flag(marker))
        .map(|(_, line)| line)
        .collect()
    }
}

#[async_trait]
impl Activity for FinalizeRun {
    const TYPE: &'static str = "Activity3";
    type Input = Value;
    type Output = Payload;

    async fn execute(&self, ctx: &ActivityContext, input: Value) -> Result<Payload, ActivityError> {
        info!(
            workflow_id = %ctx.workflow_id,
            activity_id = %ctx.activity_id,
            attempt = ctx.attempt,
            "Activity3 (final) started"
        );
        simulate_io(ctx, self.latency.apply(Self::BASE_LATENCY)).await?;

        let data = Payload::from_strict(input)?;
        let validations = Self::validations(&data);

        let mut result = Payload::new();
        result.insert("workflow_completed", true);
        result.insert("completion_time", now_rfc3339());
        result.insert(
            "message",
            format!(
                "{} completed successfully with {} validation(s)",
                ctx.workflow_id,
                validations.len()
            ),
        );
        result.insert("validations", validations);
        result.insert("final_status", "SUCCESS");
        result.insert("all_data", data.into_value());

        info!(activity_id = %ctx.activity_id, "Activity3 completed, workflow chain finished");
        Ok(result)
    }
}

// ============================================================================
// Activity4
// ============================================================================

/// Work done inside the child workflow
#[derive(Debug, Clone, Default)]
pub struct ChildTransform {
    latency: ActivityLatency,
}

impl ChildTransform {
    pub const BASE_LATENCY: Duration = Duration::from_millis(1500);

    pub fn new(latency: ActivityLatency) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Activity for ChildTransform {
    const TYPE: &'static str = "Activity4";
    type Input = Value;
    type Output = Payload;

    async fn execute(&self, ctx: &ActivityContext, input: Value) -> Result<Payload, ActivityError> {
        info!(
            workflow_id = %ctx.workflow_id,
            activity_id = %ctx.activity_id,
            attempt = ctx.attempt,
            "Activity4 started"
        );
        simulate_io(ctx, self.latency.apply(Self::BASE_LATENCY)).await?;

        let mut payload = Payload::from_strict(input)?;
        payload.insert("activity4_processed", true);
        payload.stamp("activity4_timestamp");
        payload.insert("activity4_message", "Processed in child workflow (WorkflowB)");
        payload.insert("child_workflow_execution", "WorkflowB");

        if let Some(enriched) = payload.text("enriched_message") {
            payload.insert("child_transformation", enriched.to_uppercase());
        }

        info!(activity_id = %ctx.activity_id, keys = payload.len(), "Activity4 completed");
        Ok(payload)
    }
}
