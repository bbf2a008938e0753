//! Workflow registry: workflow type name -> factory
//!
//! Runs are stored by type name and JSON input; the registry turns that
//! pair back into a live instance the executor can feed history events to.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::workflow::{Workflow, WorkflowAction, WorkflowContext, WorkflowEvent};

/// A workflow instance behind its type
pub trait AnyWorkflow: Send + Sync {
    fn workflow_type(&self) -> &'static str;

    /// Route one history event to the matching handler
    ///
    /// Commands the workflow issued itself, retry bookkeeping and terminal
    /// events produce no actions.
    fn handle(&mut self, ctx: &WorkflowContext, event: &WorkflowEvent) -> Vec<WorkflowAction>;

    fn is_completed(&self) -> bool;
}

struct Instance<W>(W);

impl<W: Workflow> AnyWorkflow for Instance<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn handle(&mut self, ctx: &WorkflowContext, event: &WorkflowEvent) -> Vec<WorkflowAction> {
        let workflow = &mut self.0;
        match event {
            WorkflowEvent::WorkflowStarted { .. } => workflow.on_start(ctx),
            WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
                ..
            } => workflow.on_activity_completed(ctx, activity_id, result.clone()),
            // Failures that will be retried never reach workflow code
            WorkflowEvent::ActivityFailed {
                activity_id,
                error,
                will_retry: false,
                ..
            } => workflow.on_activity_failed(ctx, activity_id, error),
            WorkflowEvent::ChildWorkflowCompleted {
                workflow_id,
                result,
            } => workflow.on_child_workflow_completed(ctx, workflow_id, result.clone()),
            WorkflowEvent::ChildWorkflowFailed { workflow_id, error } => {
                workflow.on_child_workflow_failed(ctx, workflow_id, error)
            }
            WorkflowEvent::TimerFired { timer_id } => workflow.on_timer_fired(ctx, timer_id),
            WorkflowEvent::SignalReceived { signal } => workflow.on_signal(ctx, signal),
            _ => vec![],
        }
    }

    fn is_completed(&self) -> bool {
        self.0.is_completed()
    }
}

/// Builds an instance from the run's JSON input
pub type WorkflowFactory =
    Box<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

/// Workflow types an engine can run
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register `W` under [`Workflow::TYPE`], replacing any earlier entry
    pub fn register<W: Workflow>(&mut self) {
        let factory: WorkflowFactory = Box::new(|input: Value| {
            let input: W::Input = serde_json::from_value(input)?;
            Ok(Box::new(Instance(W::new(input))) as Box<dyn AnyWorkflow>)
        });
        self.factories.insert(W::TYPE.to_string(), factory);
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Fresh instance of `workflow_type` for `input`
    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;

        factory(input).map_err(RegistryError::Deserialization)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Registered workflow type names, sorted
    pub fn workflow_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.workflow_types())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// The input does not fit the workflow's input type
    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityError;
    use crate::workflow::{WorkflowError, WorkflowSignal};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Order {
        quantity: u32,
    }

    /// Prices an order with one activity
    struct PriceOrder {
        order: Order,
        done: bool,
    }

    impl Workflow for PriceOrder {
        const TYPE: &'static str = "price_order";
        type Input = Order;

        fn new(order: Order) -> Self {
            Self { order, done: false }
        }

        fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::schedule_activity(
                "price-1",
                "price",
                json!({ "quantity": self.order.quantity }),
            )]
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &WorkflowContext,
            _activity_id: &str,
            result: Value,
        ) -> Vec<WorkflowAction> {
            self.done = true;
            vec![WorkflowAction::complete(result)]
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &WorkflowContext,
            activity_id: &str,
            error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            self.done = true;
            vec![WorkflowAction::fail(WorkflowError::from_activity(activity_id, error))]
        }

        fn is_completed(&self) -> bool {
            self.done
        }
    }

    fn ctx() -> WorkflowContext {
        WorkflowContext::new("order-1", Uuid::now_v7(), PriceOrder::TYPE, Utc::now())
    }

    fn registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry.register::<PriceOrder>();
        registry
    }

    #[test]
    fn test_create_checks_type_and_input() {
        let registry = registry();
        assert!(registry.contains(PriceOrder::TYPE));

        let workflow = registry.create(PriceOrder::TYPE, json!({ "quantity": 3 })).unwrap();
        assert_eq!(workflow.workflow_type(), "price_order");
        assert!(!workflow.is_completed());

        assert!(matches!(
            registry.create("refund_order", json!({})),
            Err(RegistryError::UnknownWorkflowType(t)) if t == "refund_order"
        ));
        assert!(matches!(
            registry.create(PriceOrder::TYPE, json!({ "quantity": "many" })),
            Err(RegistryError::Deserialization(_))
        ));
    }

    #[test]
    fn test_handle_routes_events() {
        let mut workflow = registry().create(PriceOrder::TYPE, json!({ "quantity": 2 })).unwrap();
        let ctx = ctx();

        let actions = workflow.handle(&ctx, &WorkflowEvent::WorkflowStarted { input: json!({}) });
        assert!(matches!(
            &actions[..],
            [WorkflowAction::ScheduleActivity { activity_id, .. }] if activity_id == "price-1"
        ));

        let actions = workflow.handle(
            &ctx,
            &WorkflowEvent::ActivityCompleted {
                activity_id: "price-1".into(),
                result: json!({ "total": 20 }),
                attempt: 1,
            },
        );
        assert_eq!(actions, vec![WorkflowAction::complete(json!({ "total": 20 }))]);
        assert!(workflow.is_completed());
    }

    #[test]
    fn test_retried_failures_stay_out_of_workflow_code() {
        let mut workflow = registry().create(PriceOrder::TYPE, json!({ "quantity": 1 })).unwrap();
        let ctx = ctx();
        workflow.handle(&ctx, &WorkflowEvent::WorkflowStarted { input: json!({}) });

        let failed = |will_retry| WorkflowEvent::ActivityFailed {
            activity_id: "price-1".into(),
            error: ActivityError::retryable("pricing service down"),
            attempt: 1,
            will_retry,
        };
        assert!(workflow.handle(&ctx, &failed(true)).is_empty());
        assert!(!workflow.is_completed());

        let actions = workflow.handle(&ctx, &failed(false));
        assert!(matches!(&actions[..], [WorkflowAction::FailWorkflow { .. }]));
    }

    #[test]
    fn test_default_hooks() {
        let mut workflow = registry().create(PriceOrder::TYPE, json!({ "quantity": 1 })).unwrap();
        let ctx = ctx();

        let actions = workflow.handle(
            &ctx,
            &WorkflowEvent::ChildWorkflowFailed {
                workflow_id: "child-1".into(),
                error: WorkflowError::new("child broke"),
            },
        );
        assert!(matches!(&actions[..], [WorkflowAction::FailWorkflow { .. }]));

        let actions = workflow.handle(
            &ctx,
            &WorkflowEvent::SignalReceived {
                signal: WorkflowSignal::cancel("stop"),
            },
        );
        assert!(matches!(&actions[..], [WorkflowAction::CancelWorkflow { .. }]));

        assert!(workflow
            .handle(&ctx, &WorkflowEvent::TimerCancelled { timer_id: "t".into() })
            .is_empty());
    }

    #[test]
    fn test_workflow_types_sorted() {
        let registry = registry();
        assert_eq!(registry.workflow_types(), vec!["price_order".to_string()]);
        assert_eq!(registry.len(), 1);
        assert!(format!("{:?}", registry).contains("price_order"));
    }
}
