//! Assignment state machine.
//!
//! | from                 | operation       | to           |
//! |----------------------|-----------------|--------------|
//! | any but `Done`       | `save_progress` | `InProgress` |
//! | any but `Done`       | `finish`        | `Done`       |
//! | `Assigned`/`InProgress` | `block`      | `Blocked`    |
//! | any                  | `reassign`      | `Assigned`   |
//!
//! Transitions are pure: they mutate an in-memory [`Assignment`] and never
//! check who is asking. Authorization belongs to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::{Ledger, LedgerError};
use crate::rollup::{overall_result, OverallResult};
use crate::types::{Assignment, AssignmentState, Id, StepVerdict};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("assignment {0} is finalized")]
    Finalized(Id),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Inputs for a new assignment.
#[derive(Debug, Clone)]
pub struct NewAssignment {
    pub org_id: String,
    pub test_id: Id,
    pub assignee_id: String,
    pub due_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Immutable snapshot of an attempt taken just before it was reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: Id,
    pub assignment_id: Id,
    /// Position in the assignment's archive, starting at 1. The store assigns
    /// the final value; this one is the reassignment count at snapshot time.
    pub sequence: u32,
    pub state: AssignmentState,
    pub ledger: Ledger,
    pub notes: Option<String>,
    pub overall: OverallResult,
    pub ledger_digest: String,
    pub archived_at: DateTime<Utc>,
}

impl Assignment {
    /// A fresh assignment in `Assigned` with an empty ledger.
    pub fn create(new: NewAssignment, now: DateTime<Utc>) -> Self {
        Self {
            id: Id::new(),
            org_id: new.org_id,
            test_id: new.test_id,
            assignee_id: new.assignee_id,
            state: AssignmentState::Assigned,
            ledger: Ledger::new(),
            notes: new.notes,
            due_date: new.due_date,
            reassign_count: 0,
            started_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.state == AssignmentState::Done
    }

    /// Reject edits once the attempt is `Done`.
    pub fn ensure_editable(&self) -> Result<(), TransitionError> {
        if self.is_finalized() {
            Err(TransitionError::Finalized(self.id.clone()))
        } else {
            Ok(())
        }
    }

    /// Stamp the assignee's first open of an untouched attempt.
    ///
    /// Returns `false` when the attempt was already started or has left
    /// `Assigned`; the record is unchanged in that case.
    pub fn mark_started(&mut self, now: DateTime<Utc>) -> bool {
        if self.started_at.is_some() || self.state != AssignmentState::Assigned {
            return false;
        }
        self.started_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Upsert one step verdict. The state is left as is.
    pub fn record_step(
        &mut self,
        step_index: u32,
        verdict: StepVerdict,
        notes: Option<String>,
        step_count: usize,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_editable()?;
        self.ledger.record(step_index, verdict, notes, step_count)?;
        self.updated_at = now;
        Ok(())
    }

    /// Move to `InProgress` from any open state, optionally replacing the
    /// ledger and notes. Re-entering `InProgress` is allowed.
    pub fn save_progress(
        &mut self,
        ledger: Option<Ledger>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_editable()?;
        self.apply_edits(ledger, notes, now);
        self.state = AssignmentState::InProgress;
        Ok(())
    }

    /// Move to `Done`. The record is read-only afterwards.
    pub fn finish(
        &mut self,
        ledger: Option<Ledger>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_editable()?;
        self.apply_edits(ledger, notes, now);
        self.state = AssignmentState::Done;
        Ok(())
    }

    pub fn block(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.state {
            AssignmentState::Assigned | AssignmentState::InProgress => {
                self.state = AssignmentState::Blocked;
                self.updated_at = now;
                Ok(())
            }
            AssignmentState::Done => Err(TransitionError::Finalized(self.id.clone())),
            AssignmentState::Blocked => Err(TransitionError::InvalidTransition {
                from: self.state.as_str(),
                to: AssignmentState::Blocked.as_str(),
            }),
        }
    }

    /// Return to `Assigned` with an empty ledger and placeholder notes.
    ///
    /// Returns the snapshot of the discarded attempt when there was anything
    /// to discard (a non-empty ledger, or a state other than `Assigned`).
    pub fn reassign(&mut self, placeholder_note: &str, now: DateTime<Utc>) -> Option<AttemptRecord> {
        let discarded = !self.ledger.is_empty() || self.state != AssignmentState::Assigned;
        self.reassign_count += 1;

        let record = discarded.then(|| AttemptRecord {
            id: Id::new(),
            assignment_id: self.id.clone(),
            sequence: self.reassign_count,
            state: self.state,
            ledger: self.ledger.clone(),
            notes: self.notes.clone(),
            overall: overall_result(&self.ledger),
            ledger_digest: self.ledger.digest(),
            archived_at: now,
        });

        self.ledger.clear();
        self.notes = Some(placeholder_note.to_string());
        self.state = AssignmentState::Assigned;
        self.started_at = None;
        self.updated_at = now;
        record
    }

    fn apply_edits(&mut self, ledger: Option<Ledger>, notes: Option<String>, now: DateTime<Utc>) {
        if let Some(ledger) = ledger {
            self.ledger = ledger;
        }
        if notes.is_some() {
            self.notes = notes;
        }
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_assignment() -> Assignment {
        Assignment::create(
            NewAssignment {
                org_id: "org".to_string(),
                test_id: Id::from_string("test-1"),
                assignee_id: "alice".to_string(),
                due_date: None,
                notes: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn create_starts_assigned_and_empty() {
        let a = new_assignment();
        assert_eq!(a.state, AssignmentState::Assigned);
        assert!(a.ledger.is_empty());
        assert_eq!(a.reassign_count, 0);
    }

    #[test]
    fn save_progress_is_reentrant() {
        let mut a = new_assignment();
        a.save_progress(None, Some("first".into()), Utc::now()).unwrap();
        a.save_progress(None, None, Utc::now()).unwrap();
        assert_eq!(a.state, AssignmentState::InProgress);
        assert_eq!(a.notes.as_deref(), Some("first"));
    }

    #[test]
    fn finish_then_edit_is_rejected() {
        let mut a = new_assignment();
        a.record_step(0, StepVerdict::Pass, None, 2, Utc::now()).unwrap();
        a.finish(None, None, Utc::now()).unwrap();

        let err = a
            .record_step(1, StepVerdict::Pass, None, 2, Utc::now())
            .unwrap_err();
        assert_eq!(err, TransitionError::Finalized(a.id.clone()));
        assert!(matches!(
            a.save_progress(None, None, Utc::now()),
            Err(TransitionError::Finalized(_))
        ));
        assert!(matches!(
            a.finish(None, None, Utc::now()),
            Err(TransitionError::Finalized(_))
        ));
        assert_eq!(a.ledger.len(), 1);
    }

    #[test]
    fn reassign_reopens_with_empty_ledger() {
        let mut a = new_assignment();
        a.record_step(0, StepVerdict::Fail, None, 1, Utc::now()).unwrap();
        a.finish(None, Some("broken".into()), Utc::now()).unwrap();

        let record = a.reassign("Reassigned", Utc::now()).unwrap();
        assert_eq!(record.sequence, 1);
        assert_eq!(record.state, AssignmentState::Done);
        assert_eq!(record.overall, OverallResult::Failed);
        assert_eq!(record.notes.as_deref(), Some("broken"));
        assert_eq!(record.ledger.len(), 1);

        assert_eq!(a.state, AssignmentState::Assigned);
        assert!(a.ledger.is_empty());
        assert_eq!(a.notes.as_deref(), Some("Reassigned"));

        a.record_step(0, StepVerdict::Pass, None, 1, Utc::now()).unwrap();
        assert_eq!(a.ledger.len(), 1);
    }

    #[test]
    fn reassign_of_untouched_assignment_archives_nothing() {
        let mut a = new_assignment();
        assert!(a.reassign("Reassigned", Utc::now()).is_none());
        assert_eq!(a.reassign_count, 1);
    }

    #[test]
    fn mark_started_once_per_attempt() {
        let mut a = new_assignment();
        assert!(a.mark_started(Utc::now()));
        assert!(!a.mark_started(Utc::now()));
        assert!(a.started_at.is_some());

        a.reassign("Reassigned", Utc::now());
        assert!(a.started_at.is_none());
        assert!(a.mark_started(Utc::now()));
    }

    #[test]
    fn mark_started_ignores_attempts_already_underway() {
        let mut a = new_assignment();
        a.save_progress(None, None, Utc::now()).unwrap();
        assert!(!a.mark_started(Utc::now()));
        assert!(a.started_at.is_none());
    }

    #[test]
    fn block_only_from_open_states() {
        let mut a = new_assignment();
        a.block(Utc::now()).unwrap();
        assert_eq!(a.state, AssignmentState::Blocked);
        assert!(matches!(
            a.block(Utc::now()),
            Err(TransitionError::InvalidTransition { .. })
        ));
        a.save_progress(None, None, Utc::now()).unwrap();
        assert_eq!(a.state, AssignmentState::InProgress);
    }

    #[test]
    fn record_step_validates_index() {
        let mut a = new_assignment();
        assert!(matches!(
            a.record_step(5, StepVerdict::Pass, None, 2, Utc::now()),
            Err(TransitionError::Ledger(LedgerError::StepOutOfRange { .. }))
        ));
    }
}
