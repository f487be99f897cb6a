//! Role-based visibility of assignments.
//!
//! Admins and managers get the manager view: every assignment of a test,
//! with assignee identity. Everyone else gets the self view: only their own
//! attempts, labeled without identity.
//!
//! Ordering against the aggregator matters. Assignee-facing summaries filter
//! first and aggregate the remainder; manager dashboards aggregate the full
//! set and only slice by assignee for display.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::Caller;
use crate::ledger::StepCounts;
use crate::rollup::{overall_result, test_statistics, OverallResult, TestStatistics};
use crate::types::{Assignment, AssignmentState, Id};

/// Display label used in place of the assignee in the self view.
pub const SELF_LABEL: &str = "Your execution";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewClass {
    Manager,
    SelfView,
}

impl ViewClass {
    pub fn of(caller: &Caller) -> Self {
        if caller.is_manager() {
            Self::Manager
        } else {
            Self::SelfView
        }
    }
}

/// One assignment as a given caller is allowed to see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibleAssignment {
    pub assignment_id: Id,
    pub test_id: Id,
    /// Present only in the manager view.
    pub assignee_id: Option<String>,
    pub assignee_label: String,
    pub state: AssignmentState,
    pub overall: OverallResult,
    pub counts: StepCounts,
    pub due_date: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Per-assignee slice of a manager dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssigneeRow {
    pub assignment_id: Id,
    pub assignee_id: String,
    pub state: AssignmentState,
    pub overall: OverallResult,
    pub counts: StepCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dashboard {
    pub test_id: Id,
    pub statistics: TestStatistics,
    pub assignees: Vec<AssigneeRow>,
}

/// Whether the caller may see this assignment at all.
pub fn can_view(caller: &Caller, assignment: &Assignment) -> bool {
    if assignment.is_deleted() {
        return false;
    }
    match ViewClass::of(caller) {
        ViewClass::Manager => true,
        ViewClass::SelfView => assignment.assignee_id == caller.user_id,
    }
}

/// The subset of assignments visible to the caller, in input order.
pub fn filter<'a>(caller: &Caller, assignments: &'a [Assignment]) -> Vec<&'a Assignment> {
    assignments.iter().filter(|a| can_view(caller, a)).collect()
}

/// Visible assignments projected for display.
pub fn project(caller: &Caller, assignments: &[Assignment]) -> Vec<VisibleAssignment> {
    let view = ViewClass::of(caller);
    filter(caller, assignments)
        .into_iter()
        .map(|a| {
            let (assignee_id, assignee_label) = match view {
                ViewClass::Manager => (Some(a.assignee_id.clone()), a.assignee_id.clone()),
                ViewClass::SelfView => (None, SELF_LABEL.to_string()),
            };
            VisibleAssignment {
                assignment_id: a.id.clone(),
                test_id: a.test_id.clone(),
                assignee_id,
                assignee_label,
                state: a.state,
                overall: overall_result(&a.ledger),
                counts: a.ledger.counts(),
                due_date: a.due_date,
                updated_at: a.updated_at,
            }
        })
        .collect()
}

/// Test statistics as the caller is allowed to see them.
///
/// Self view filters before aggregating; manager view aggregates everything.
pub fn statistics_for(caller: &Caller, assignments: &[Assignment]) -> TestStatistics {
    match ViewClass::of(caller) {
        ViewClass::Manager => test_statistics(assignments),
        ViewClass::SelfView => test_statistics(filter(caller, assignments)),
    }
}

/// Manager dashboard: statistics over the unfiltered set, then the
/// per-assignee slice.
pub fn manager_dashboard(test_id: &Id, assignments: &[Assignment]) -> Dashboard {
    let statistics = test_statistics(assignments);
    let mut assignees: Vec<AssigneeRow> = assignments
        .iter()
        .filter(|a| !a.is_deleted())
        .map(|a| AssigneeRow {
            assignment_id: a.id.clone(),
            assignee_id: a.assignee_id.clone(),
            state: a.state,
            overall: overall_result(&a.ledger),
            counts: a.ledger.counts(),
        })
        .collect();
    assignees.sort_by(|a, b| a.assignee_id.cmp(&b.assignee_id));

    Dashboard {
        test_id: test_id.clone(),
        statistics,
        assignees,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::types::{Role, StepResult};

    fn attempt(assignee: &str, verdicts: &[&str]) -> Assignment {
        let now = Utc::now();
        Assignment {
            id: Id::new(),
            org_id: "org".to_string(),
            test_id: Id::from_string("t1"),
            assignee_id: assignee.to_string(),
            state: AssignmentState::Done,
            ledger: Ledger::from_stored(
                verdicts
                    .iter()
                    .enumerate()
                    .map(|(i, v)| StepResult {
                        step_index: i as u32,
                        status: Some((*v).to_string()),
                        result: None,
                        notes: None,
                    })
                    .collect(),
            ),
            notes: None,
            due_date: None,
            reassign_count: 0,
            started_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn four_attempts() -> Vec<Assignment> {
        vec![
            attempt("alice", &["pass", "pass"]),
            attempt("bob", &["pass", "fail"]),
            attempt("carol", &["pass", "pass"]),
            attempt("dave", &["skip"]),
        ]
    }

    #[test]
    fn self_view_sees_only_own_attempt() {
        let assignments = four_attempts();
        let tester = Caller::new("alice", Role::Tester);

        let rows = project(&tester, &assignments);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].assignee_label, SELF_LABEL);
        assert_eq!(rows[0].assignee_id, None);
        assert_eq!(rows[0].overall, OverallResult::Passed);
    }

    #[test]
    fn manager_view_sees_all_attempts() {
        let assignments = four_attempts();
        let manager = Caller::new("mallory", Role::Manager);

        let rows = project(&manager, &assignments);
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.assignee_id.is_some()));
        assert_eq!(rows[1].assignee_label, "bob");
    }

    #[test]
    fn viewer_without_attempts_sees_nothing() {
        let assignments = four_attempts();
        let viewer = Caller::new("victor", Role::Viewer);
        assert!(project(&viewer, &assignments).is_empty());
        assert_eq!(statistics_for(&viewer, &assignments), TestStatistics::default());
    }

    #[test]
    fn deleted_assignments_are_hidden_from_everyone() {
        let mut assignments = four_attempts();
        assignments[0].deleted_at = Some(Utc::now());
        let admin = Caller::new("root", Role::Admin);
        let alice = Caller::new("alice", Role::Tester);

        assert_eq!(project(&admin, &assignments).len(), 3);
        assert!(project(&alice, &assignments).is_empty());
    }

    #[test]
    fn statistics_filter_before_aggregate_for_self_view() {
        let assignments = four_attempts();
        let bob = Caller::new("bob", Role::Tester);
        let stats = statistics_for(&bob, &assignments);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pass_rate, 0);

        let manager = Caller::new("mallory", Role::Admin);
        let stats = statistics_for(&manager, &assignments);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.passed, 2);
        assert_eq!(stats.pass_rate, 50);
    }

    #[test]
    fn dashboard_slices_after_aggregating() {
        let assignments = four_attempts();
        let dashboard = manager_dashboard(&Id::from_string("t1"), &assignments);
        assert_eq!(dashboard.statistics.total, 4);
        let names: Vec<&str> = dashboard
            .assignees
            .iter()
            .map(|r| r.assignee_id.as_str())
            .collect();
        assert_eq!(names, vec!["alice", "bob", "carol", "dave"]);
        assert_eq!(dashboard.assignees[3].overall, OverallResult::Partial);
    }
}
