//! Result rollups over step ledgers.
//!
//! Two judgment rules live here and must not be mixed:
//!
//! - [`overall_result`] is the historical rule. It reads only the ledger and
//!   is what every statistic and dashboard row is built from.
//! - [`required_step_gate`] is the in-progress rule shown to the assignee
//!   while an attempt is still open. It also reads the test definition and
//!   only lets failures of `required` steps fail the attempt.

use serde::{Deserialize, Serialize};

use crate::ledger::{Ledger, StepCounts};
use crate::types::{Assignment, AssignmentState, Id, StepVerdict, Test};

/// Derived judgment for one attempt. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallResult {
    Passed,
    Failed,
    Partial,
    InProgress,
    NoResults,
}

impl OverallResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::InProgress => "in_progress",
            Self::NoResults => "no_results",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "partial" => Some(Self::Partial),
            "in_progress" => Some(Self::InProgress),
            "no_results" => Some(Self::NoResults),
            _ => None,
        }
    }
}

/// Which rule produced a judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgmentRule {
    Rollup,
    RequiredStepGate,
}

/// A judgment tagged with the rule that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Judgment {
    pub rule: JudgmentRule,
    pub result: OverallResult,
}

/// Historical overall result of one ledger.
///
/// Failure dominates skips; a ledger of nothing but passes is `Passed`;
/// any skip without a failure is `Partial`; entries with no recognizable
/// verdict leave the attempt `InProgress`.
pub fn overall_result(ledger: &Ledger) -> OverallResult {
    if ledger.is_empty() {
        return OverallResult::NoResults;
    }
    let verdicts: Vec<Option<StepVerdict>> = ledger.verdicts().collect();
    if verdicts.contains(&Some(StepVerdict::Fail)) {
        OverallResult::Failed
    } else if verdicts.iter().all(|v| *v == Some(StepVerdict::Pass)) {
        OverallResult::Passed
    } else if verdicts.contains(&Some(StepVerdict::Skip)) {
        OverallResult::Partial
    } else {
        OverallResult::InProgress
    }
}

/// In-progress judgment for an open attempt.
///
/// When the test flags no step as required, every step counts as required.
/// Order of evaluation:
/// 1. empty ledger is `NoResults`;
/// 2. a required step resolving to `Fail` is `Failed`;
/// 3. any test step still without a verdict is `InProgress`;
/// 4. all steps passed is `Passed`;
/// 5. otherwise (skips, or failures of optional steps) `Partial`.
pub fn required_step_gate(test: &Test, ledger: &Ledger) -> OverallResult {
    if ledger.is_empty() {
        return OverallResult::NoResults;
    }
    let all_required = !test.has_required_steps();
    let verdicts: Vec<Option<StepVerdict>> = (0..test.steps.len())
        .map(|i| ledger.verdict_at(i as u32))
        .collect();

    let required_failed = test
        .steps
        .iter()
        .zip(&verdicts)
        .any(|(step, v)| (all_required || step.required) && *v == Some(StepVerdict::Fail));
    if required_failed {
        return OverallResult::Failed;
    }
    if verdicts.iter().any(Option::is_none) {
        return OverallResult::InProgress;
    }
    if verdicts.iter().all(|v| *v == Some(StepVerdict::Pass)) {
        OverallResult::Passed
    } else {
        OverallResult::Partial
    }
}

/// Aggregate statistics for one test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStatistics {
    /// Attempts with a non-empty ledger.
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    /// Whole-number percentage of `passed / total`, 0 when `total` is 0.
    pub pass_rate: u32,
}

/// Roll a set of sibling assignments up into test statistics.
///
/// Deleted assignments and attempts with an empty ledger are not counted.
pub fn test_statistics<'a, I>(assignments: I) -> TestStatistics
where
    I: IntoIterator<Item = &'a Assignment>,
{
    let mut stats = TestStatistics::default();
    for assignment in assignments {
        if assignment.is_deleted() || assignment.ledger.is_empty() {
            continue;
        }
        stats.total += 1;
        match overall_result(&assignment.ledger) {
            OverallResult::Passed => stats.passed += 1,
            OverallResult::Failed => stats.failed += 1,
            _ => {}
        }
    }
    stats.pass_rate = pass_rate(stats.passed, stats.total);
    stats
}

/// `round(passed / total * 100)` with halves rounded up.
pub fn pass_rate(passed: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let passed = u64::from(passed);
    let total = u64::from(total);
    ((passed * 200 + total) / (total * 2)) as u32
}

/// Summary of one attempt, with each judgment labeled by its rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentSummary {
    pub assignment_id: Id,
    pub state: AssignmentState,
    pub counts: StepCounts,
    /// Historical rule, always present.
    pub rollup: Judgment,
    /// In-progress rule, present only while the attempt is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<Judgment>,
}

pub fn summarize(test: &Test, assignment: &Assignment) -> AssignmentSummary {
    let gate = (assignment.state != AssignmentState::Done).then(|| Judgment {
        rule: JudgmentRule::RequiredStepGate,
        result: required_step_gate(test, &assignment.ledger),
    });
    AssignmentSummary {
        assignment_id: assignment.id.clone(),
        state: assignment.state,
        counts: assignment.ledger.counts(),
        rollup: Judgment {
            rule: JudgmentRule::Rollup,
            result: overall_result(&assignment.ledger),
        },
        gate,
    }
}
