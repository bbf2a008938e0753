//! History replay and bookkeeping shared by the executor
//!
//! Replay feeds every recorded input event back through a fresh workflow
//! instance and checks that the commands it produces are the ones that were
//! recorded, in the same order.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use crate::persistence::WorkflowInfo;
use crate::workflow::{HistoryEvent, WorkflowAction, WorkflowContext, WorkflowEvent};

use super::executor::ExecutorError;
use super::registry::{AnyWorkflow, WorkflowRegistry};

/// A scheduling command, as produced by workflow code or found in history
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Activity { id: String, activity_type: String },
    Timer { id: String },
    Child { id: String, workflow_type: String },
}

impl Command {
    pub(crate) fn from_action(action: &WorkflowAction) -> Option<Self> {
        match action {
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                ..
            } => Some(Self::Activity {
                id: activity_id.clone(),
                activity_type: activity_type.clone(),
            }),
            WorkflowAction::StartTimer { timer_id, .. } => Some(Self::Timer {
                id: timer_id.clone(),
            }),
            WorkflowAction::ScheduleChildWorkflow {
                workflow_id,
                workflow_type,
                ..
            } => Some(Self::Child {
                id: workflow_id.clone(),
                workflow_type: workflow_type.clone(),
            }),
            _ => None,
        }
    }

    pub(crate) fn from_event(event: &WorkflowEvent) -> Option<Self> {
        match event {
            WorkflowEvent::ActivityScheduled {
                activity_id,
                activity_type,
                ..
            } => Some(Self::Activity {
                id: activity_id.clone(),
                activity_type: activity_type.clone(),
            }),
            WorkflowEvent::TimerStarted { timer_id, .. } => Some(Self::Timer {
                id: timer_id.clone(),
            }),
            WorkflowEvent::ChildWorkflowStarted {
                workflow_id,
                workflow_type,
                ..
            } => Some(Self::Child {
                id: workflow_id.clone(),
                workflow_type: workflow_type.clone(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activity { id, activity_type } => write!(f, "activity {} ({})", id, activity_type),
            Self::Timer { id } => write!(f, "timer {}", id),
            Self::Child { id, workflow_type } => {
                write!(f, "child workflow {} ({})", id, workflow_type)
            }
        }
    }
}

/// Rebuild a workflow instance from its recorded history
pub(crate) fn replay(
    registry: &WorkflowRegistry,
    info: &WorkflowInfo,
    history: &[HistoryEvent],
) -> Result<Box<dyn AnyWorkflow>, ExecutorError> {
    let mut workflow = registry.create(&info.workflow_type, info.input.clone())?;

    let Some(first) = history.first() else {
        return Ok(workflow);
    };
    if !matches!(first.event, WorkflowEvent::WorkflowStarted { .. }) {
        return Err(ExecutorError::ReplayError(
            "first event must be WorkflowStarted".to_string(),
        ));
    }

    let base = WorkflowContext::new(
        info.workflow_id.clone(),
        info.run_id,
        info.workflow_type.clone(),
        first.recorded_at,
    );
    let mut produced: VecDeque<Command> = VecDeque::new();

    for entry in history {
        if let Some(recorded) = Command::from_event(&entry.event) {
            match produced.pop_front() {
                Some(command) if command == recorded => {}
                Some(command) => {
                    return Err(ExecutorError::Nondeterminism(format!(
                        "history has {} at sequence {}, workflow code produced {}",
                        recorded, entry.sequence, command
                    )))
                }
                None => {
                    return Err(ExecutorError::Nondeterminism(format!(
                        "history has {} at sequence {}, workflow code produced nothing",
                        recorded, entry.sequence
                    )))
                }
            }
            continue;
        }

        let ctx = base.at(entry.recorded_at, true);
        let actions = workflow.handle(&ctx, &entry.event);
        produced.extend(actions.iter().filter_map(Command::from_action));
    }

    if let Some(command) = produced.pop_front() {
        return Err(ExecutorError::Nondeterminism(format!(
            "workflow code produced {} which is missing from history",
            command
        )));
    }

    Ok(workflow)
}

/// Work a run has started and not yet seen resolved
#[derive(Debug, Default, Clone)]
pub(crate) struct OpenWork {
    pub activities: Vec<String>,
    pub timers: Vec<String>,
    pub children: Vec<String>,
    known_activities: HashSet<String>,
    known_timers: HashSet<String>,
    known_children: HashSet<String>,
    started: bool,
}

impl OpenWork {
    pub(crate) fn from_history(history: &[HistoryEvent]) -> Self {
        let mut open = Self::default();
        for entry in history {
            open.observe(&entry.event);
        }
        open
    }

    /// Track the effect of a recorded event
    pub(crate) fn observe(&mut self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::WorkflowStarted { .. } => self.started = true,
            WorkflowEvent::ActivityScheduled { activity_id, .. } => {
                self.known_activities.insert(activity_id.clone());
                self.activities.push(activity_id.clone());
            }
            e if e.closes_activity() => {
                if let Some(id) = e.activity_id() {
                    self.activities.retain(|a| a != id);
                }
            }
            WorkflowEvent::TimerStarted { timer_id, .. } => {
                self.known_timers.insert(timer_id.clone());
                self.timers.push(timer_id.clone());
            }
            WorkflowEvent::TimerFired { timer_id } | WorkflowEvent::TimerCancelled { timer_id } => {
                self.timers.retain(|t| t != timer_id);
            }
            WorkflowEvent::ChildWorkflowStarted { workflow_id, .. } => {
                self.known_children.insert(workflow_id.clone());
                self.children.push(workflow_id.clone());
            }
            WorkflowEvent::ChildWorkflowCompleted { workflow_id, .. }
            | WorkflowEvent::ChildWorkflowFailed { workflow_id, .. } => {
                self.children.retain(|c| c != workflow_id);
            }
            _ => {}
        }
    }

    /// Whether an incoming event is still relevant
    ///
    /// Duplicate or late outcomes (at-least-once delivery, work cancelled in
    /// the meantime) are rejected.
    pub(crate) fn accepts(&self, event: &WorkflowEvent) -> bool {
        match event {
            WorkflowEvent::WorkflowStarted { .. } => !self.started,
            WorkflowEvent::ActivityCompleted { activity_id, .. }
            | WorkflowEvent::ActivityFailed { activity_id, .. } => {
                self.activities.iter().any(|a| a == activity_id)
            }
            WorkflowEvent::TimerFired { timer_id } => self.timers.iter().any(|t| t == timer_id),
            WorkflowEvent::ChildWorkflowRetried { workflow_id, .. }
            | WorkflowEvent::ChildWorkflowCompleted { workflow_id, .. }
            | WorkflowEvent::ChildWorkflowFailed { workflow_id, .. } => {
                self.children.iter().any(|c| c == workflow_id)
            }
            WorkflowEvent::SignalReceived { .. } => self.started,
            _ => false,
        }
    }

    pub(crate) fn knows_activity(&self, activity_id: &str) -> bool {
        self.known_activities.contains(activity_id)
    }

    pub(crate) fn knows_timer(&self, timer_id: &str) -> bool {
        self.known_timers.contains(timer_id)
    }

    pub(crate) fn knows_child(&self, workflow_id: &str) -> bool {
        self.known_children.contains(workflow_id)
    }
}
