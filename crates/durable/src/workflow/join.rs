//! Fan-out bookkeeping for concurrent branches inside one workflow
//!
//! A workflow schedules one activity per branch in a single handler call;
//! the engine runs them concurrently and reports each outcome back to the
//! workflow, one event at a time. [`BranchSet`] records those outcomes in
//! per-branch slots and tells the workflow when the join has resolved.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::ActivityError;

/// When a [`BranchSet`] counts as resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Every branch reached a terminal state
    All,

    /// At least one branch reached a terminal state
    Any,
}

/// Terminal or pending state of a single branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BranchOutcome {
    Pending,
    Succeeded { result: Value },
    Failed { error: ActivityError },
    Cancelled,
}

impl BranchOutcome {
    /// Whether the branch is done
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One branch: a declared name, the activity id it waits on, and its slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub activity_id: String,
    pub outcome: BranchOutcome,
}

/// Slots for N concurrent branches, in declaration order
///
/// # Example
///
/// ```
/// use flowline_durable::workflow::{BranchSet, JoinPolicy};
/// use serde_json::json;
///
/// let mut join = BranchSet::new(JoinPolicy::All);
/// join.add("a", "1-a");
/// join.add("b", "2-b");
///
/// join.record_success("2-b", json!(2));
/// assert!(!join.is_resolved());
///
/// join.record_success("1-a", json!(1));
/// assert!(join.is_resolved());
/// assert_eq!(join.results(), vec![json!(1), json!(2)]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSet {
    policy: JoinPolicy,
    branches: Vec<Branch>,
}

impl BranchSet {
    /// Create an empty set with the given join policy
    pub fn new(policy: JoinPolicy) -> Self {
        Self {
            policy,
            branches: Vec::new(),
        }
    }

    /// Declare a branch; declaration order is the failure tie-break order
    pub fn add(&mut self, name: impl Into<String>, activity_id: impl Into<String>) {
        self.branches.push(Branch {
            name: name.into(),
            activity_id: activity_id.into(),
            outcome: BranchOutcome::Pending,
        });
    }

    /// Whether an activity id belongs to one of the branches
    pub fn contains(&self, activity_id: &str) -> bool {
        self.branches.iter().any(|b| b.activity_id == activity_id)
    }

    /// Store a result in the branch's own slot
    ///
    /// Returns false if the id is unknown or the slot is already terminal.
    pub fn record_success(&mut self, activity_id: &str, result: Value) -> bool {
        self.settle(activity_id, BranchOutcome::Succeeded { result })
    }

    /// Store a failure in the branch's own slot
    pub fn record_failure(&mut self, activity_id: &str, error: ActivityError) -> bool {
        self.settle(activity_id, BranchOutcome::Failed { error })
    }

    fn settle(&mut self, activity_id: &str, outcome: BranchOutcome) -> bool {
        match self
            .branches
            .iter_mut()
            .find(|b| b.activity_id == activity_id)
        {
            Some(branch) if !branch.outcome.is_terminal() => {
                branch.outcome = outcome;
                true
            }
            _ => false,
        }
    }

    /// Mark every pending branch cancelled and return their activity ids
    ///
    /// After this the set is resolved under either policy.
    pub fn cancel_pending(&mut self) -> Vec<String> {
        self.branches
            .iter_mut()
            .filter(|b| !b.outcome.is_terminal())
            .map(|b| {
                b.outcome = BranchOutcome::Cancelled;
                b.activity_id.clone()
            })
            .collect()
    }

    /// Whether the join has resolved under its policy
    pub fn is_resolved(&self) -> bool {
        if self.branches.is_empty() {
            return true;
        }
        match self.policy {
            JoinPolicy::All => self.branches.iter().all(|b| b.outcome.is_terminal()),
            JoinPolicy::Any => self.branches.iter().any(|b| b.outcome.is_terminal()),
        }
    }

    /// First failed branch in declaration order
    pub fn first_failure(&self) -> Option<(&Branch, &ActivityError)> {
        self.branches.iter().find_map(|b| match &b.outcome {
            BranchOutcome::Failed { error } => Some((b, error)),
            _ => None,
        })
    }

    /// Whether any branch was cancelled
    pub fn has_cancelled(&self) -> bool {
        self.branches
            .iter()
            .any(|b| b.outcome == BranchOutcome::Cancelled)
    }

    /// Successful results in declaration order
    pub fn results(&self) -> Vec<Value> {
        self.branches
            .iter()
            .filter_map(|b| match &b.outcome {
                BranchOutcome::Succeeded { result } => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    /// Activity ids still waiting
    pub fn pending(&self) -> Vec<&str> {
        self.branches
            .iter()
            .filter(|b| !b.outcome.is_terminal())
            .map(|b| b.activity_id.as_str())
            .collect()
    }

    /// All branches in declaration order
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    /// Number of branches
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    /// Whether no branch has been declared
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn three(policy: JoinPolicy) -> BranchSet {
        let mut set = BranchSet::new(policy);
        set.add("a", "1-a");
        set.add("b", "2-b");
        set.add("c", "3-c");
        set
    }

    #[test]
    fn test_all_waits_for_every_branch() {
        let mut set = three(JoinPolicy::All);

        set.record_success("3-c", json!("c"));
        set.record_failure("1-a", ActivityError::non_retryable("a broke"));
        assert!(!set.is_resolved());
        assert_eq!(set.pending(), vec!["2-b"]);

        set.record_success("2-b", json!("b"));
        assert!(set.is_resolved());
    }

    #[test]
    fn test_any_resolves_on_first() {
        let mut set = three(JoinPolicy::Any);
        assert!(!set.is_resolved());

        set.record_success("2-b", json!("b"));
        assert!(set.is_resolved());
    }

    #[test]
    fn test_first_failure_uses_declaration_order() {
        let mut set = three(JoinPolicy::All);

        set.record_failure("3-c", ActivityError::non_retryable("c broke"));
        set.record_failure("2-b", ActivityError::non_retryable("b broke"));
        set.record_success("1-a", json!("a"));

        let (branch, error) = set.first_failure().unwrap();
        assert_eq!(branch.name, "b");
        assert_eq!(error.message, "b broke");
    }

    #[test]
    fn test_slots_are_written_once() {
        let mut set = three(JoinPolicy::All);

        assert!(set.record_success("1-a", json!(1)));
        assert!(!set.record_success("1-a", json!(2)));
        assert!(!set.record_success("unknown", json!(3)));
        assert_eq!(set.results(), vec![json!(1)]);
    }

    #[test]
    fn test_cancel_pending_resolves_join() {
        let mut set = three(JoinPolicy::All);
        set.record_success("1-a", json!(1));

        let cancelled = set.cancel_pending();

        assert_eq!(cancelled, vec!["2-b".to_string(), "3-c".to_string()]);
        assert!(set.is_resolved());
        assert!(set.has_cancelled());
        assert!(set.first_failure().is_none());
    }
}
