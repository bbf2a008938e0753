//! The catalog running on the in-process engine
//!
//! Activities keep their standard latencies; the paused tokio clock makes
//! them, the retry backoff and the timeouts instantaneous.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowline_durable::prelude::*;
use flowline_durable::workflow::HistoryEvent;
use flowline_workflows::{
    child_workflow_id, register_catalog, ActivityLatency, ChildTransform, DelegationWorkflow,
    EnrichData, FanOutWorkflow, Payload, PipelineWorkflow, TASK_QUEUE,
};
use serde_json::{json, Value};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(120);

fn builder() -> LocalEngineBuilder {
    register_catalog(
        LocalEngine::builder().with_task_queue(TASK_QUEUE),
        ActivityLatency::standard(),
    )
}

fn started(builder: LocalEngineBuilder) -> LocalEngine {
    let engine = builder.build();
    engine.start().expect("engine should start");
    engine
}

/// Activity4 replacement that always fails and counts its calls
fn failing_activity4(
    builder: LocalEngineBuilder,
    retryable: bool,
) -> (LocalEngineBuilder, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let builder = builder.register_handler(
        ChildTransform::TYPE,
        move |_ctx: ActivityContext, _input: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if retryable {
                    Err(ActivityError::retryable("downstream unavailable"))
                } else {
                    Err(ActivityError::non_retryable("downstream rejected"))
                }
            }
        },
    );
    (builder, calls)
}

async fn history(engine: &LocalEngine, run_id: Uuid) -> Vec<HistoryEvent> {
    engine.executor().history(run_id).await.expect("history")
}

async fn run_to_close(
    engine: &LocalEngine,
    workflow_type: &str,
    workflow_id: &str,
    input: Value,
) -> (RunHandle, RunDescription) {
    let client = engine.client();
    let handle = client
        .start_workflow(StartWorkflowRequest::new(workflow_type, workflow_id, input))
        .await
        .unwrap();
    let description = client
        .wait_for_completion(workflow_id, Some(handle.run_id), WAIT)
        .await
        .unwrap();
    (handle, description)
}

#[test_log::test(tokio::test(start_paused = true))]
async fn pipeline_enriches_the_message() {
    let engine = started(builder());

    let (_, done) = run_to_close(
        &engine,
        PipelineWorkflow::TYPE,
        "pipeline-1",
        json!({ "message": "hi" }),
    )
    .await;

    assert_eq!(done.status, WorkflowStatus::Completed);
    let result = done.result.unwrap();
    assert_eq!(result["message"], json!("hi"));
    assert_eq!(result["activity1_processed"], json!(true));
    assert_eq!(result["activity2_processed"], json!(true));
    assert_eq!(result["enriched_message"], json!("Processed: hi"));
    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn pipeline_accepts_plain_text() {
    let engine = started(builder());

    let (_, done) =
        run_to_close(&engine, PipelineWorkflow::TYPE, "pipeline-2", json!("just text")).await;

    assert_eq!(done.status, WorkflowStatus::Completed);
    let result = done.result.unwrap();
    assert_eq!(result["raw_input"], json!("just text"));
    assert_eq!(result["activity2_processed"], json!(true));
    assert!(result.get("enriched_message").is_none());
    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn delegation_runs_the_child_and_finalizes() {
    let engine = started(builder());
    let client = engine.client();

    let (handle, done) = run_to_close(
        &engine,
        DelegationWorkflow::TYPE,
        "order-7",
        json!({ "message": "ship it" }),
    )
    .await;

    assert_eq!(done.status, WorkflowStatus::Completed);
    let result = done.result.unwrap();
    assert_eq!(result["final_status"], json!("SUCCESS"));
    assert_eq!(result["validations"].as_array().unwrap().len(), 3);
    assert_eq!(result["all_data"]["child_transformation"], json!("PROCESSED: SHIP IT"));

    // The child id comes from the logical clock of the batch that spawned it
    let events = history(&engine, handle.run_id).await;
    let (child_id, spawned_at) = events
        .iter()
        .find_map(|e| match &e.event {
            WorkflowEvent::ChildWorkflowStarted { workflow_id, .. } => {
                Some((workflow_id.clone(), e.recorded_at))
            }
            _ => None,
        })
        .expect("child started");
    assert_eq!(child_id, child_workflow_id("order-7", spawned_at.timestamp()));

    let child = client.describe(&child_id, None).await.unwrap();
    assert_eq!(child.status, WorkflowStatus::Completed);
    assert_eq!(child.workflow_type, "WorkflowB");
    assert_eq!(child.parent_workflow_id.as_deref(), Some("order-7"));
    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn delegation_fails_when_the_child_is_rejected() {
    let (builder, calls) = failing_activity4(builder(), false);
    let engine = started(builder);

    let (_, done) = run_to_close(&engine, DelegationWorkflow::TYPE, "order-8", json!({})).await;

    assert_eq!(done.status, WorkflowStatus::Failed);
    let error = done.error.unwrap();
    assert!(error.message.starts_with("child workflow workflow-b-child-order-8-"));
    assert!(error
        .message
        .ends_with("Activity4 failed: downstream rejected"));
    assert!(!error.retryable);
    // Non-retryable: one attempt, one child run
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn delegation_retries_the_child_as_a_whole() {
    let (builder, calls) = failing_activity4(builder(), true);
    let engine = started(builder);

    let (handle, done) =
        run_to_close(&engine, DelegationWorkflow::TYPE, "order-9", json!({})).await;

    assert_eq!(done.status, WorkflowStatus::Failed);
    assert!(done
        .error
        .unwrap()
        .message
        .contains("Activity4 failed: downstream unavailable"));
    // Three child runs of three attempts each
    assert_eq!(calls.load(Ordering::SeqCst), 9);

    let retried = history(&engine, handle.run_id)
        .await
        .iter()
        .filter(|e| matches!(e.event, WorkflowEvent::ChildWorkflowRetried { .. }))
        .count();
    assert_eq!(retried, 2);
    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn fan_out_consolidates_after_every_branch() {
    let engine = started(builder());

    let (handle, done) = run_to_close(
        &engine,
        FanOutWorkflow::TYPE,
        "fan-1",
        json!({ "message": "spread" }),
    )
    .await;

    assert_eq!(done.status, WorkflowStatus::Completed);
    let result = done.result.unwrap();
    let data = &result["all_data"];
    assert_eq!(data["activity1_processed"], json!(true));
    assert_eq!(data["activity2_processed"], json!(true));
    assert_eq!(data["activity4_processed"], json!(true));
    assert_eq!(data["parallel_results"].as_array().unwrap().len(), 3);
    assert_eq!(result["validations"].as_array().unwrap().len(), 3);

    // Activity3 is scheduled only after the slowest branch reported
    let events = history(&engine, handle.run_id).await;
    let last_branch = events
        .iter()
        .filter(|e| matches!(e.event, WorkflowEvent::ActivityCompleted { .. }))
        .filter(|e| e.event.activity_id() != Some("Activity3-4"))
        .map(|e| e.sequence)
        .max()
        .unwrap();
    let consolidation = events
        .iter()
        .find(|e| {
            matches!(&e.event, WorkflowEvent::ActivityScheduled { activity_id, .. } if activity_id == "Activity3-4")
        })
        .unwrap();
    assert!(consolidation.sequence > last_branch);
    assert!(events
        .iter()
        .any(|e| matches!(&e.event, WorkflowEvent::TimerCancelled { .. })));
    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn fan_out_survives_a_branch_timeout() {
    let engine = started(builder().register_handler(
        EnrichData::TYPE,
        |ctx: ActivityContext, input: Value| async move {
            if ctx.attempt == 1 {
                // Past the 30s start-to-close limit
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            EnrichData::new(ActivityLatency::standard())
                .execute(&ctx, input)
                .await
                .map(Payload::into_value)
        },
    ));

    let (handle, done) =
        run_to_close(&engine, FanOutWorkflow::TYPE, "fan-2", json!({ "message": "x" })).await;

    assert_eq!(done.status, WorkflowStatus::Completed);
    let result = done.result.unwrap();
    assert_eq!(result["all_data"]["activity2_processed"], json!(true));

    let failures: Vec<(FailureKind, bool)> = history(&engine, handle.run_id)
        .await
        .into_iter()
        .filter_map(|e| match e.event {
            WorkflowEvent::ActivityFailed {
                error, will_retry, ..
            } => Some((error.kind, will_retry)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![(FailureKind::Timeout, true)]);
    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn fan_out_join_budget_fails_the_run() {
    let engine = started(builder());

    let (_, done) = run_to_close(
        &engine,
        FanOutWorkflow::TYPE,
        "fan-3",
        json!({ "join_budget_ms": 1200 }),
    )
    .await;

    assert_eq!(done.status, WorkflowStatus::Failed);
    let error = done.error.unwrap();
    assert_eq!(error.kind, FailureKind::Timeout);
    assert!(error.message.contains("Activity2-2"));
    assert!(error.message.contains("Activity4-3"));
    assert!(!error.message.contains("Activity1-1"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.worker().active_count(), 0);
    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn fan_out_cancel_stops_every_branch() {
    let engine = started(builder());
    let client = engine.client();

    let handle = client
        .start_workflow(StartWorkflowRequest::new(
            FanOutWorkflow::TYPE,
            "fan-4",
            json!({}),
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.worker().active_count(), 3);

    client
        .cancel_workflow("fan-4", Some(handle.run_id), "operator request")
        .await
        .unwrap();
    let done = client
        .wait_for_completion("fan-4", Some(handle.run_id), WAIT)
        .await
        .unwrap();

    assert_eq!(done.status, WorkflowStatus::Cancelled);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.worker().active_count(), 0);
    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn duplicate_workflow_id_conflicts_while_running() {
    let engine = started(builder());
    let client = engine.client();

    client
        .start_workflow(StartWorkflowRequest::new(PipelineWorkflow::TYPE, "dup", json!({})))
        .await
        .unwrap();
    let err = client
        .start_workflow(StartWorkflowRequest::new(PipelineWorkflow::TYPE, "dup", json!({})))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    engine.shutdown().await.unwrap();
}
