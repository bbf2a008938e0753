//! Fan-out/fan-in (`WorkflowD`)
//!
//! ```text
//! Start -> { Activity1 | Activity2 | Activity4 } -> join (all) -> Activity3 -> Done
//! ```
//!
//! The three branches get the same input and run concurrently. Each writes
//! only its own slot in a [`BranchSet`]. Nothing happens after the fan-out
//! until every branch is terminal; then the first failure in declaration
//! order fails the run, or the three results are merged and handed to
//! Activity3.
//!
//! A join budget timer bounds the wait. When it fires first, the pending
//! branches are cancelled and the run fails with a timeout.

use std::time::Duration;

use flowline_durable::activity::{Activity, ActivityError};
use flowline_durable::workflow::{
    BranchSet, JoinPolicy, Workflow, WorkflowAction, WorkflowContext, WorkflowError,
    WorkflowSignal,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::activities::{ChildTransform, EnrichData, FinalizeRun, ReceiveInput};
use crate::options::call_activity;
use crate::payload::Payload;
use crate::pipeline::step_activity_id;

pub const JOIN_BUDGET_TIMER: &str = "join-budget";

pub const DEFAULT_JOIN_BUDGET: Duration = Duration::from_secs(5 * 60);

/// Input key overriding the join budget, in milliseconds; `0` disables it
pub const JOIN_BUDGET_KEY: &str = "join_budget_ms";

/// Key holding the branch results, in declaration order, on Activity3's input
pub const PARALLEL_RESULTS: &str = "parallel_results";

#[derive(Debug, Clone, PartialEq)]
pub enum FanOutState {
    Joining,
    Consolidating { pending_activity: String },
    Completed,
    Failed { error: String },
    Cancelled,
}

/// `WorkflowD`: three concurrent branches, an explicit join, then Activity3
#[derive(Debug)]
pub struct FanOutWorkflow {
    input: Value,
    join: BranchSet,
    budget: Option<Duration>,
    state: FanOutState,
}

impl FanOutWorkflow {
    /// Branch activities in declaration order
    pub const BRANCHES: &'static [&'static str] =
        &[ReceiveInput::TYPE, EnrichData::TYPE, ChildTransform::TYPE];

    pub fn state(&self) -> &FanOutState {
        &self.state
    }

    pub fn join(&self) -> &BranchSet {
        &self.join
    }

    fn budget_from(input: &Value) -> Option<Duration> {
        match input.get(JOIN_BUDGET_KEY).and_then(Value::as_u64) {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => Some(DEFAULT_JOIN_BUDGET),
        }
    }

    fn after_join(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        if let Some((branch, error)) = self.join.first_failure() {
            let error = WorkflowError::from_activity(&branch.name, error);
            return self.fail(ctx, error);
        }

        let results = self.join.results();
        let mut consolidated = Payload::new();
        for result in &results {
            consolidated.merge(Payload::from_lenient(result.clone()));
        }
        consolidated.insert(PARALLEL_RESULTS, results);

        if !ctx.is_replaying() {
            info!(
                workflow_id = ctx.workflow_id(),
                branches = self.join.len(),
                "all parallel activities completed, consolidating"
            );
        }

        let pending_activity = step_activity_id(FinalizeRun::TYPE, Self::BRANCHES.len());
        self.state = FanOutState::Consolidating {
            pending_activity: pending_activity.clone(),
        };

        let mut actions = Vec::with_capacity(2);
        if self.budget.is_some() {
            actions.push(WorkflowAction::CancelTimer {
                timer_id: JOIN_BUDGET_TIMER.to_string(),
            });
        }
        actions.push(call_activity(
            pending_activity,
            FinalizeRun::TYPE,
            consolidated.into_value(),
        ));
        actions
    }

    fn fail(&mut self, ctx: &WorkflowContext, error: WorkflowError) -> Vec<WorkflowAction> {
        if !ctx.is_replaying() {
            warn!(workflow_id = ctx.workflow_id(), error = %error, "WorkflowD failed");
        }
        self.state = FanOutState::Failed {
            error: error.message.clone(),
        };
        vec![WorkflowAction::fail(error)]
    }
}

impl Workflow for FanOutWorkflow {
    const TYPE: &'static str = "WorkflowD";
    type Input = Value;

    fn new(input: Self::Input) -> Self {
        let budget = Self::budget_from(&input);
        Self {
            input,
            join: BranchSet::new(JoinPolicy::All),
            budget,
            state: FanOutState::Joining,
        }
    }

    fn on_start(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        if !ctx.is_replaying() {
            info!(workflow_id = ctx.workflow_id(), "WorkflowD (parallel processing) started");
        }

        let mut actions = Vec::with_capacity(Self::BRANCHES.len() + 1);
        for (index, activity_type) in Self::BRANCHES.iter().enumerate() {
            let activity_id = step_activity_id(activity_type, index);
            self.join.add(*activity_type, activity_id.clone());
            actions.push(call_activity(activity_id, activity_type, self.input.clone()));
        }
        if let Some(budget) = self.budget {
            actions.push(WorkflowAction::timer(JOIN_BUDGET_TIMER, budget));
        }
        actions
    }

    fn on_activity_completed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> Vec<WorkflowAction> {
        match &self.state {
            FanOutState::Joining => {
                if !self.join.record_success(activity_id, result) {
                    return vec![];
                }
                if !ctx.is_replaying() {
                    debug!(
                        workflow_id = ctx.workflow_id(),
                        activity_id,
                        pending = self.join.pending().len(),
                        "branch completed"
                    );
                }
                if self.join.is_resolved() {
                    self.after_join(ctx)
                } else {
                    vec![]
                }
            }
            FanOutState::Consolidating { pending_activity } if pending_activity == activity_id => {
                if !ctx.is_replaying() {
                    info!(workflow_id = ctx.workflow_id(), "WorkflowD completed");
                }
                self.state = FanOutState::Completed;
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
            FanOutState::Joining => {
                if !self.join.record_failure(activity_id, error.clone()) {
                    return vec![];
                }
                if !ctx.is_replaying() {
                    warn!(workflow_id = ctx.workflow_id(), activity_id, error = %error, "branch failed");
                }
                if self.join.is_resolved() {
                    self.after_join(ctx)
                } else {
                    vec![]
                }
            }
            FanOutState::Consolidating { pending_activity } if pending_activity == activity_id => {
                self.fail(ctx, WorkflowError::from_activity(FinalizeRun::TYPE, error))
            }
            _ => vec![],
        }
    }

    fn on_timer_fired(&mut self, ctx: &WorkflowContext, timer_id: &str) -> Vec<WorkflowAction> {
        if timer_id != JOIN_BUDGET_TIMER || self.state != FanOutState::Joining {
            return vec![];
        }
        let pending = self.join.cancel_pending();
        let budget = self.budget.unwrap_or(DEFAULT_JOIN_BUDGET);
        let error = WorkflowError::timeout(format!(
            "parallel branches did not finish within {:?}; still pending: {}",
            budget,
            pending.join(", ")
        ));
        self.fail(ctx, error)
    }

    fn on_signal(&mut self, ctx: &WorkflowContext, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        if !signal.is_cancel() {
            return vec![];
        }
        let pending = self.join.cancel_pending();
        if !ctx.is_replaying() {
            info!(
                workflow_id = ctx.workflow_id(),
                cancelled_branches = pending.len(),
                "WorkflowD cancelled"
            );
        }
        self.state = FanOutState::Cancelled;
        vec![WorkflowAction::cancel(signal.reason())]
    }

    fn is_completed(&self) -> bool {
        matches!(
            self.state,
            FanOutState::Completed | FanOutState::Failed { .. } | FanOutState::Cancelled
        )
    }
}
