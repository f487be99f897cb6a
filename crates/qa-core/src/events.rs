//! Event types for the assignment audit log and notifications.

use crate::rollup::OverallResult;
use crate::types::{AssignmentState, Id, StepVerdict};
use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    AssignmentCreated,
    ExecutionStarted,
    StepRecorded,
    ProgressSaved,
    ExecutionFinished,
    AssignmentReassigned,
    AssignmentDeleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssignmentCreated => "ASSIGNMENT_CREATED",
            Self::ExecutionStarted => "EXECUTION_STARTED",
            Self::StepRecorded => "STEP_RECORDED",
            Self::ProgressSaved => "PROGRESS_SAVED",
            Self::ExecutionFinished => "EXECUTION_FINISHED",
            Self::AssignmentReassigned => "ASSIGNMENT_REASSIGNED",
            Self::AssignmentDeleted => "ASSIGNMENT_DELETED",
        }
    }
}

/// Payload for ASSIGNMENT_CREATED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentCreatedPayload {
    pub assignment_id: Id,
    pub test_id: Id,
    pub assignee_id: String,
    pub created_by: String,
    /// True when the assignee started execution without a prior assignment.
    pub self_serve: bool,
}

/// Payload for EXECUTION_STARTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStartedPayload {
    pub assignment_id: Id,
    pub state: AssignmentState,
}

/// Payload for STEP_RECORDED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecordedPayload {
    pub assignment_id: Id,
    pub step_index: u32,
    pub verdict: StepVerdict,
}

/// Payload for PROGRESS_SAVED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSavedPayload {
    pub assignment_id: Id,
    pub recorded_steps: usize,
}

/// Payload for EXECUTION_FINISHED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFinishedPayload {
    pub assignment_id: Id,
    pub overall: OverallResult,
    pub recorded_steps: usize,
}

/// Payload for ASSIGNMENT_REASSIGNED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentReassignedPayload {
    pub assignment_id: Id,
    pub reassigned_by: String,
    pub previous_state: AssignmentState,
    /// Sequence number of the archived attempt, if one was archived.
    pub archived_sequence: Option<u32>,
}

/// Payload for ASSIGNMENT_DELETED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentDeletedPayload {
    pub assignment_id: Id,
    pub deleted_by: String,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    AssignmentCreated(AssignmentCreatedPayload),
    ExecutionStarted(ExecutionStartedPayload),
    StepRecorded(StepRecordedPayload),
    ProgressSaved(ProgressSavedPayload),
    ExecutionFinished(ExecutionFinishedPayload),
    AssignmentReassigned(AssignmentReassignedPayload),
    AssignmentDeleted(AssignmentDeletedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::AssignmentCreated(_) => EventType::AssignmentCreated,
            Self::ExecutionStarted(_) => EventType::ExecutionStarted,
            Self::StepRecorded(_) => EventType::StepRecorded,
            Self::ProgressSaved(_) => EventType::ProgressSaved,
            Self::ExecutionFinished(_) => EventType::ExecutionFinished,
            Self::AssignmentReassigned(_) => EventType::AssignmentReassigned,
            Self::AssignmentDeleted(_) => EventType::AssignmentDeleted,
        }
    }

    pub fn assignment_id(&self) -> &Id {
        match self {
            Self::AssignmentCreated(p) => &p.assignment_id,
            Self::ExecutionStarted(p) => &p.assignment_id,
            Self::StepRecorded(p) => &p.assignment_id,
            Self::ProgressSaved(p) => &p.assignment_id,
            Self::ExecutionFinished(p) => &p.assignment_id,
            Self::AssignmentReassigned(p) => &p.assignment_id,
            Self::AssignmentDeleted(p) => &p.assignment_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A persisted audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub assignment_id: Id,
    /// Event type name (e.g., `ASSIGNMENT_CREATED`).
    pub event_type: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// JSON payload with event-specific data.
    pub payload_json: String,
}

/// Outbound "assignment created for user X" message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub org_id: String,
    pub recipient_id: String,
    pub assignment_id: Id,
    pub test_id: Id,
    pub message: String,
}
