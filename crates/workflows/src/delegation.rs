//! Parent/child delegation (`WorkflowA` with child `WorkflowB`)
//!
//! ```text
//! WorkflowA: Start -> Activity1 -> Activity2 -> SpawnChild -> AwaitChild -> Activity3 -> Done
//! WorkflowB: Start -> Activity4 -> Done
//! ```
//!
//! The child id is built from the parent's workflow id and the logical time of
//! the event that spawns it, so a replay of the parent issues the same id.

use flowline_durable::activity::{Activity, ActivityError};
use flowline_durable::workflow::{Workflow, WorkflowAction, WorkflowContext, WorkflowError};
use serde_json::Value;
use tracing::{info, warn};

use crate::activities::{ChildTransform, EnrichData, FinalizeRun, ReceiveInput};
use crate::options::{call_activity, child_options};
use crate::pipeline::{step_activity_id, ActivityChain, ChainStep};

/// Child id for a parent run at a logical time
pub fn child_workflow_id(parent_workflow_id: &str, logical_unix_secs: i64) -> String {
    format!(
        "workflow-b-child-{}-{}",
        parent_workflow_id, logical_unix_secs
    )
}

// ============================================================================
// WorkflowA
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum DelegationState {
    /// Activity1 and Activity2
    Preparing,
    AwaitingChild { child_workflow_id: String },
    /// Activity3
    Finalizing { pending_activity: String },
    Completed,
    Failed { error: String },
}

/// `WorkflowA`: prepare, delegate to `WorkflowB`, then finalize
#[derive(Debug)]
pub struct DelegationWorkflow {
    input: Value,
    preparation: ActivityChain,
    state: DelegationState,
}

impl DelegationWorkflow {
    pub const PREPARATION: &'static [&'static str] = &[ReceiveInput::TYPE, EnrichData::TYPE];

    pub fn state(&self) -> &DelegationState {
        &self.state
    }

    fn spawn_child(&mut self, ctx: &WorkflowContext, prepared: Value) -> Vec<WorkflowAction> {
        let child_id = child_workflow_id(ctx.workflow_id(), ctx.now().timestamp());
        if !ctx.is_replaying() {
            info!(
                workflow_id = ctx.workflow_id(),
                child_workflow_id = %child_id,
                "starting child workflow (WorkflowB)"
            );
        }
        self.state = DelegationState::AwaitingChild {
            child_workflow_id: child_id.clone(),
        };
        vec![WorkflowAction::child_workflow(
            child_id,
            DelegateChildWorkflow::TYPE,
            prepared,
            child_options(),
        )]
    }

    fn finalize(&mut self, child_result: Value) -> Vec<WorkflowAction> {
        let index = Self::PREPARATION.len();
        let pending_activity = step_activity_id(FinalizeRun::TYPE, index);
        self.state = DelegationState::Finalizing {
            pending_activity: pending_activity.clone(),
        };
        vec![call_activity(pending_activity, FinalizeRun::TYPE, child_result)]
    }

    fn fail(&mut self, ctx: &WorkflowContext, error: WorkflowError) -> Vec<WorkflowAction> {
        if !ctx.is_replaying() {
            warn!(workflow_id = ctx.workflow_id(), error = %error, "WorkflowA failed");
        }
        self.state = DelegationState::Failed {
            error: error.message.clone(),
        };
        vec![WorkflowAction::fail(error)]
    }

    fn on_preparation(&mut self, ctx: &WorkflowContext, step: ChainStep) -> Vec<WorkflowAction> {
        match step {
            ChainStep::Schedule(action) => vec![action],
            ChainStep::Finished(prepared) => self.spawn_child(ctx, prepared),
            ChainStep::Failed(error) => self.fail(ctx, error),
            ChainStep::Ignored => vec![],
        }
    }
}

impl Workflow for DelegationWorkflow {
    const TYPE: &'static str = "WorkflowA";
    type Input = Value;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            preparation: ActivityChain::new(Self::PREPARATION),
            state: DelegationState::Preparing,
        }
    }

    fn on_start(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        if !ctx.is_replaying() {
            info!(workflow_id = ctx.workflow_id(), "WorkflowA started");
        }
        let step = self.preparation.start(self.input.clone());
        self.on_preparation(ctx, step)
    }

    fn on_activity_completed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> Vec<WorkflowAction> {
        match &self.state {
            DelegationState::Preparing => {
                let step = self.preparation.on_completed(activity_id, result);
                self.on_preparation(ctx, step)
            }
            DelegationState::Finalizing { pending_activity } if pending_activity == activity_id => {
                if !ctx.is_replaying() {
                    info!(workflow_id = ctx.workflow_id(), "WorkflowA completed");
                }
                self.state = DelegationState::Completed;
                vec![WorkflowAction::complete(result)]
            }
            _ => vec![],
        }
    }

    fn on_activity_failed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        match &self.state {
            DelegationState::Preparing => {
                let step = self.preparation.on_failed(activity_id, error);
                self.on_preparation(ctx, step)
            }
            DelegationState::Finalizing { pending_activity } if pending_activity == activity_id => {
                self.fail(ctx, WorkflowError::from_activity(FinalizeRun::TYPE, error))
            }
            _ => vec![],
        }
    }

    fn on_child_workflow_completed(
        &mut self,
        ctx: &WorkflowContext,
        workflow_id: &str,
        result: Value,
    ) -> Vec<WorkflowAction> {
        match &self.state {
            DelegationState::AwaitingChild { child_workflow_id } if child_workflow_id == workflow_id => {
                if !ctx.is_replaying() {
                    info!(
                        workflow_id = ctx.workflow_id(),
                        child_workflow_id = workflow_id,
                        "child workflow completed"
                    );
                }
                self.finalize(result)
            }
            _ => vec![],
        }
    }

    fn on_child_workflow_failed(
        &mut self,
        ctx: &WorkflowContext,
        workflow_id: &str,
        error: &WorkflowError,
    ) -> Vec<WorkflowAction> {
        match &self.state {
            DelegationState::AwaitingChild { child_workflow_id } if child_workflow_id == workflow_id => {
                self.fail(ctx, WorkflowError::from_child(workflow_id, error))
            }
            _ => vec![],
        }
    }

    fn is_completed(&self) -> bool {
        matches!(
            self.state,
            DelegationState::Completed | DelegationState::Failed { .. }
        )
    }
}

// ============================================================================
// WorkflowB
// ============================================================================

/// `WorkflowB`: the child, a single Activity4 step
#[derive(Debug)]
pub struct DelegateChildWorkflow {
    input: Value,
    chain: ActivityChain,
    closed: bool,
}

impl DelegateChildWorkflow {
    pub const STEPS: &'static [&'static str] = &[ChildTransform::TYPE];

    fn advance(&mut self, ctx: &WorkflowContext, step: ChainStep) -> Vec<WorkflowAction> {
        match step {
            ChainStep::Schedule(action) => vec![action],
            ChainStep::Finished(result) => {
                self.closed = true;
                vec![WorkflowAction::complete(result)]
            }
            ChainStep::Failed(error) => {
                if !ctx.is_replaying() {
                    warn!(workflow_id = ctx.workflow_id(), error = %error, "WorkflowB failed");
                }
                self.closed = true;
                vec![WorkflowAction::fail(error)]
            }
            ChainStep::Ignored => vec![],
        }
    }
}

impl Workflow for DelegateChildWorkflow {
    const TYPE: &'static str = "WorkflowB";
    type Input = Value;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            chain: ActivityChain::new(Self::STEPS),
            closed: false,
        }
    }

    fn on_start(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        let step = self.chain.start(self.input.clone());
        self.advance(ctx, step)
    }

    fn on_activity_completed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> Vec<WorkflowAction> {
        let step = self.chain.on_completed(activity_id, result);
        self.advance(ctx, step)
    }

    fn on_activity_failed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        let step = self.chain.on_failed(activity_id, error);
        self.advance(ctx, step)
    }

    fn is_completed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn ctx_at(secs: i64) -> WorkflowContext {
        let now = Utc.timestamp_opt(secs, 0).single().unwrap();
        WorkflowContext::new("order-7", Default::default(), DelegationWorkflow::TYPE, now)
    }

    fn prepare(workflow: &mut DelegationWorkflow, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        workflow.on_start(ctx);
        workflow.on_activity_completed(ctx, "Activity1-1", json!({"activity1_processed": true}));
        workflow.on_activity_completed(
            ctx,
            "Activity2-2",
            json!({"activity1_processed": true, "activity2_processed": true}),
        )
    }

    #[test]
    fn test_child_spawned_after_preparation() {
        let ctx = ctx_at(1_700_000_000);
        let mut workflow = DelegationWorkflow::new(json!({}));
        let actions = prepare(&mut workflow, &ctx);

        match actions.as_slice() {
            [WorkflowAction::ScheduleChildWorkflow {
                workflow_id,
                workflow_type,
                input,
                options,
            }] => {
                assert_eq!(workflow_id, "workflow-b-child-order-7-1700000000");
                assert_eq!(workflow_type, "WorkflowB");
                assert_eq!(input["activity2_processed"], json!(true));
                assert_eq!(options, &child_options());
            }
            other => panic!("expected child workflow, got {:?}", other),
        }
    }

    #[test]
    fn test_child_id_is_deterministic() {
        let first = prepare(&mut DelegationWorkflow::new(json!({"a": 1})), &ctx_at(42));
        let second = prepare(&mut DelegationWorkflow::new(json!({"a": 1})), &ctx_at(42));
        assert_eq!(first, second);

        let later = prepare(&mut DelegationWorkflow::new(json!({"a": 1})), &ctx_at(43));
        assert_ne!(first, later);
    }

    #[test]
    fn test_child_result_feeds_activity3() {
        let ctx = ctx_at(10);
        let mut workflow = DelegationWorkflow::new(json!({}));
        prepare(&mut workflow, &ctx);
        let child_id = child_workflow_id("order-7", 10);

        let actions =
            workflow.on_child_workflow_completed(&ctx, &child_id, json!({"activity4_processed": true}));
        match actions.as_slice() {
            [WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                ..
            }] => {
                assert_eq!(activity_id, "Activity3-3");
                assert_eq!(activity_type, "Activity3");
                assert_eq!(input, &json!({"activity4_processed": true}));
            }
            other => panic!("expected Activity3, got {:?}", other),
        }

        let actions = workflow.on_activity_completed(&ctx, "Activity3-3", json!({"final_status": "SUCCESS"}));
        assert_eq!(actions, vec![WorkflowAction::complete(json!({"final_status": "SUCCESS"}))]);
        assert!(workflow.is_completed());
    }

    #[test]
    fn test_child_failure_is_propagated() {
        let ctx = ctx_at(10);
        let mut workflow = DelegationWorkflow::new(json!({}));
        prepare(&mut workflow, &ctx);
        let child_id = child_workflow_id("order-7", 10);

        let child_error = WorkflowError::from_activity(
            ChildTransform::TYPE,
            &ActivityError::retryable("downstream unavailable").exhausted(),
        );
        let actions = workflow.on_child_workflow_failed(&ctx, &child_id, &child_error);

        match actions.as_slice() {
            [WorkflowAction::FailWorkflow { error }] => {
                assert!(error.message.contains("Activity4 failed: downstream unavailable"));
                assert!(error.message.contains(&child_id));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(matches!(workflow.state(), DelegationState::Failed { .. }));
    }

    #[test]
    fn test_unrelated_child_is_ignored() {
        let ctx = ctx_at(10);
        let mut workflow = DelegationWorkflow::new(json!({}));
        prepare(&mut workflow, &ctx);

        assert!(workflow
            .on_child_workflow_completed(&ctx, "someone-else", json!({}))
            .is_empty());
        assert!(!workflow.is_completed());
    }

    #[test]
    fn test_preparation_failure_skips_child() {
        let ctx = ctx_at(10);
        let mut workflow = DelegationWorkflow::new(json!({}));
        workflow.on_start(&ctx);

        let actions = workflow.on_activity_failed(
            &ctx,
            "Activity1-1",
            &ActivityError::non_retryable("bad input"),
        );
        match actions.as_slice() {
            [WorkflowAction::FailWorkflow { error }] => {
                assert_eq!(error.message, "Activity1 failed: bad input");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_child_workflow_runs_activity4() {
        let ctx = ctx_at(10);
        let mut child = DelegateChildWorkflow::new(json!({"enriched_message": "x"}));

        let actions = child.on_start(&ctx);
        assert!(matches!(
            actions.as_slice(),
            [WorkflowAction::ScheduleActivity { activity_type, .. }] if activity_type == "Activity4"
        ));

        let actions = child.on_activity_completed(&ctx, "Activity4-1", json!({"activity4_processed": true}));
        assert_eq!(
            actions,
            vec![WorkflowAction::complete(json!({"activity4_processed": true}))]
        );
        assert!(child.is_completed());
    }
}
