//! Core types for the test execution workflow.
//!
//! Tests are read-only definitions; assignments are the per-person execution
//! attempts that carry a step ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::Ledger;

/// Unique identifier for tests, assignments, events, and attempt records.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Organization role of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Tester,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Tester => "tester",
            Self::Viewer => "viewer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "manager" => Some(Self::Manager),
            "tester" => Some(Self::Tester),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }

    /// Admins and managers see every assignment and may reassign.
    pub fn is_manager(&self) -> bool {
        matches!(self, Self::Admin | Self::Manager)
    }
}

/// Test definition lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// Assignment lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentState {
    Assigned,
    InProgress,
    Done,
    /// Reachable from `Assigned`/`InProgress`; no workflow operation enters it yet.
    Blocked,
}

impl AssignmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "ASSIGNED",
            Self::InProgress => "IN_PROGRESS",
            Self::Done => "DONE",
            Self::Blocked => "BLOCKED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ASSIGNED" => Some(Self::Assigned),
            "IN_PROGRESS" => Some(Self::InProgress),
            "DONE" => Some(Self::Done),
            "BLOCKED" => Some(Self::Blocked),
            _ => None,
        }
    }
}

/// Canonical per-step verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepVerdict {
    Pass,
    Fail,
    Skip,
}

impl StepVerdict {
    /// Canonical short form written by this service.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
        }
    }
}

// --- Core Types ---

/// One step of a test definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStep {
    pub title: String,
    #[serde(default)]
    pub expected_result: String,
    #[serde(default)]
    pub required: bool,
}

/// A test definition owned by an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Test {
    pub id: Id,
    pub org_id: String,
    pub title: String,
    pub steps: Vec<TestStep>,
    pub status: TestStatus,
    /// Ordinal priority, 0 (lowest) through 3 (highest).
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Test {
    pub const MAX_PRIORITY: u8 = 3;

    /// True when at least one step carries the `required` flag.
    pub fn has_required_steps(&self) -> bool {
        self.steps.iter().any(|s| s.required)
    }
}

/// A persisted per-step outcome.
///
/// Both field names are kept so records written under the legacy `result`
/// field remain readable. Verdicts are only ever read through
/// [`crate::normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl StepResult {
    /// Build a result in canonical form.
    pub fn new(step_index: u32, verdict: StepVerdict, notes: Option<String>) -> Self {
        Self {
            step_index,
            status: Some(verdict.as_str().to_string()),
            result: None,
            notes,
        }
    }
}

/// One execution attempt of a test by one assignee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Id,
    pub org_id: String,
    pub test_id: Id,
    pub assignee_id: String,
    pub state: AssignmentState,
    pub ledger: Ledger,
    pub notes: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    /// Number of times this record has been reassigned.
    pub reassign_count: u32,
    /// First open by the assignee since creation or the last reassignment.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tombstone; set records are invisible to the workflow.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Assignment {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// An organization member as seen by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub org_id: String,
    pub user_id: String,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn assignment_state_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&AssignmentState::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
        assert_eq!(
            AssignmentState::parse(AssignmentState::Done.as_str()),
            Some(AssignmentState::Done)
        );
    }

    #[test]
    fn role_manager_view() {
        assert!(Role::Admin.is_manager());
        assert!(Role::Manager.is_manager());
        assert!(!Role::Tester.is_manager());
        assert!(!Role::Viewer.is_manager());
        assert_eq!(Role::parse("tester"), Some(Role::Tester));
        assert_eq!(Role::parse("owner"), None);
    }

    #[test]
    fn test_status_default_is_draft() {
        assert_eq!(TestStatus::default(), TestStatus::Draft);
    }

    #[test]
    fn step_result_reads_legacy_field() {
        let json = r#"{"step_index":2,"result":"passed","notes":"ok"}"#;
        let step: StepResult = serde_json::from_str(json).unwrap();
        assert_eq!(step.step_index, 2);
        assert_eq!(step.status, None);
        assert_eq!(step.result.as_deref(), Some("passed"));
    }

    #[test]
    fn step_result_new_is_canonical() {
        let step = StepResult::new(0, StepVerdict::Skip, None);
        let json = serde_json::to_string(&step).unwrap();
        assert_eq!(json, r#"{"step_index":0,"status":"skip"}"#);
    }

    #[test]
    fn test_step_defaults_optional_fields() {
        let step: TestStep = serde_json::from_str(r#"{"title":"Open app"}"#).unwrap();
        assert!(!step.required);
        assert!(step.expected_result.is_empty());
    }
}
