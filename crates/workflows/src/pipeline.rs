//! Sequential pipeline (`WorkflowC`)
//!
//! ```text
//! Start -> Activity1 -> Activity2 -> Done
//!              |            |
//!              +------------+--> Failed
//! ```
//!
//! Each step feeds its output to the next. The first final failure fails the
//! run with the failing activity named and the reason kept as it was.

use flowline_durable::activity::{Activity, ActivityError};
use flowline_durable::workflow::{Workflow, WorkflowAction, WorkflowContext, WorkflowError};
use serde_json::Value;
use tracing::{info, warn};

use crate::activities::{EnrichData, ReceiveInput};
use crate::options::call_activity;

// ============================================================================
// Activity chain
// ============================================================================

/// What a chain wants after an activity outcome
#[derive(Debug, Clone, PartialEq)]
pub enum ChainStep {
    /// The next step was scheduled
    Schedule(WorkflowAction),
    /// The last step produced this value
    Finished(Value),
    /// A step failed for good
    Failed(WorkflowError),
    /// The outcome belongs to something else
    Ignored,
}

/// A straight line of activities, each fed the previous output
///
/// Activity ids are `<type>-<position>`, so the same chain always issues the
/// same ids.
#[derive(Debug, Clone)]
pub struct ActivityChain {
    steps: &'static [&'static str],
    /// Index of the step whose activity is outstanding
    current: Option<usize>,
    finished: bool,
}

impl ActivityChain {
    pub fn new(steps: &'static [&'static str]) -> Self {
        Self {
            steps,
            current: None,
            finished: false,
        }
    }

    /// Schedule the first step
    pub fn start(&mut self, input: Value) -> ChainStep {
        if self.steps.is_empty() {
            self.finished = true;
            return ChainStep::Finished(input);
        }
        self.schedule(0, input)
    }

    pub fn on_completed(&mut self, activity_id: &str, result: Value) -> ChainStep {
        let Some(index) = self.owning_step(activity_id) else {
            return ChainStep::Ignored;
        };
        if index + 1 < self.steps.len() {
            return self.schedule(index + 1, result);
        }
        self.current = None;
        self.finished = true;
        ChainStep::Finished(result)
    }

    pub fn on_failed(&mut self, activity_id: &str, error: &ActivityError) -> ChainStep {
        let Some(index) = self.owning_step(activity_id) else {
            return ChainStep::Ignored;
        };
        self.current = None;
        self.finished = true;
        ChainStep::Failed(WorkflowError::from_activity(self.steps[index], error))
    }

    /// Id of the outstanding activity, if any
    pub fn pending_activity(&self) -> Option<String> {
        self.current.map(|index| step_activity_id(self.steps[index], index))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn schedule(&mut self, index: usize, input: Value) -> ChainStep {
        self.current = Some(index);
        let step = self.steps[index];
        ChainStep::Schedule(call_activity(step_activity_id(step, index), step, input))
    }

    fn owning_step(&self, activity_id: &str) -> Option<usize> {
        self.current
            .filter(|&index| step_activity_id(self.steps[index], index) == activity_id)
    }
}

pub(crate) fn step_activity_id(activity_type: &str, index: usize) -> String {
    format!("{}-{}", activity_type, index + 1)
}

// ============================================================================
// Workflow
// ============================================================================

/// Run state as seen by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Running,
    Completed,
    Failed { error: String },
}

/// `WorkflowC`: Activity1 then Activity2
#[derive(Debug)]
pub struct PipelineWorkflow {
    input: Value,
    chain: ActivityChain,
    state: PipelineState,
}

impl PipelineWorkflow {
    pub const STEPS: &'static [&'static str] = &[ReceiveInput::TYPE, EnrichData::TYPE];

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    fn advance(&mut self, ctx: &WorkflowContext, step: ChainStep) -> Vec<WorkflowAction> {
        match step {
            ChainStep::Schedule(action) => vec![action],
            ChainStep::Finished(result) => {
                if !ctx.is_replaying() {
                    info!(workflow_id = ctx.workflow_id(), "WorkflowC completed");
                }
                self.state = PipelineState::Completed;
                vec![WorkflowAction::complete(result)]
            }
            ChainStep::Failed(error) => {
                if !ctx.is_replaying() {
                    warn!(workflow_id = ctx.workflow_id(), error = %error, "WorkflowC failed");
                }
                self.state = PipelineState::Failed {
                    error: error.message.clone(),
                };
                vec![WorkflowAction::fail(error)]
            }
            ChainStep::Ignored => vec![],
        }
    }
}

impl Workflow for PipelineWorkflow {
    const TYPE: &'static str = "WorkflowC";
    type Input = Value;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            chain: ActivityChain::new(Self::STEPS),
            state: PipelineState::Running,
        }
    }

    fn on_start(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        if !ctx.is_replaying() {
            info!(workflow_id = ctx.workflow_id(), "WorkflowC started");
        }
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
        !matches!(self.state, PipelineState::Running)
    }
}
