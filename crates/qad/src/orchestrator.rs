//! Workflow orchestrator.
//!
//! The façade the control plane calls. Every operation takes an explicit
//! [`RequestContext`], reads the current persisted state, applies a pure
//! transition from `qa_core`, and writes the record back. Nothing is held in
//! memory between calls; concurrent writers to one assignment are
//! last-write-wins.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use qa_core::events::{
    AssignmentCreatedPayload, AssignmentDeletedPayload, AssignmentReassignedPayload, Event,
    EventPayload, ExecutionFinishedPayload, ExecutionStartedPayload, Notification,
    ProgressSavedPayload, StepRecordedPayload,
};
use qa_core::lifecycle::{AttemptRecord, NewAssignment, TransitionError};
use qa_core::normalize::normalize_str;
use qa_core::rollup::{overall_result, summarize};
use qa_core::visibility::{self, Dashboard, VisibleAssignment};
use qa_core::{
    Assignment, AssignmentSummary, Caller, Config, Id, Ledger, RequestContext,
    StepResult, Test, TestStatistics,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ports::{AssignmentStore, IdentityProvider, NotificationSink, TestStore};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("active assignment already exists for test {test_id} and assignee {assignee_id}")]
    DuplicateAssignment { test_id: String, assignee_id: String },
    #[error("assignment {0} is finalized")]
    AssignmentFinalized(Id),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("test {test_id} is {status} and cannot be assigned")]
    NotAssignable { test_id: Id, status: &'static str },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Storage(StorageError),
}

impl WorkflowError {
    /// Stable machine-readable name of the failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateAssignment { .. } => "duplicate_assignment",
            Self::AssignmentFinalized(_) => "assignment_finalized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::NotAssignable { .. } => "not_assignable",
            Self::InvalidInput(_) => "invalid_input",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<StorageError> for WorkflowError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::TestNotFound(id) => Self::NotFound(format!("test {id}")),
            StorageError::AssignmentNotFound(id) => Self::NotFound(format!("assignment {id}")),
            StorageError::DuplicateAssignment {
                test_id,
                assignee_id,
            } => Self::DuplicateAssignment {
                test_id,
                assignee_id,
            },
            other => Self::Storage(other),
        }
    }
}

impl From<TransitionError> for WorkflowError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::Finalized(id) => Self::AssignmentFinalized(id),
            other => Self::InvalidInput(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Manager-issued assignment request.
#[derive(Debug, Clone)]
pub struct CreateAssignment {
    pub assignee_id: String,
    pub due_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Bulk update submitted by the execution dialog. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub steps: Option<Vec<StepResult>>,
    pub notes: Option<String>,
}

#[derive(Debug)]
pub struct Orchestrator<S, N> {
    store: Arc<S>,
    sink: Arc<N>,
    config: Config,
}

impl<S, N> Orchestrator<S, N>
where
    S: TestStore + AssignmentStore + IdentityProvider,
    N: NotificationSink,
{
    pub fn new(store: Arc<S>, sink: Arc<N>, config: Config) -> Self {
        Self {
            store,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the request context for a user of an organization.
    ///
    /// Non-members are refused.
    pub async fn resolve_context(&self, org_id: &str, user_id: &str) -> Result<RequestContext> {
        match self.store.role_of(org_id, user_id).await? {
            Some(role) => Ok(RequestContext::new(org_id, Caller::new(user_id, role))),
            None => Err(WorkflowError::Forbidden(format!(
                "{user_id} is not a member of {org_id}"
            ))),
        }
    }

    /// Assign a test to a member. Managers and admins only.
    pub async fn create_assignment(
        &self,
        ctx: &RequestContext,
        test_id: &Id,
        req: CreateAssignment,
    ) -> Result<Assignment> {
        require_manager(&ctx.caller, "create assignments")?;

        let test = self.store.get_test(&ctx.org_id, test_id).await?;
        self.ensure_assignable(&test)?;

        if self
            .store
            .role_of(&ctx.org_id, &req.assignee_id)
            .await?
            .is_none()
        {
            return Err(WorkflowError::NotFound(format!(
                "member {} of {}",
                req.assignee_id, ctx.org_id
            )));
        }

        let assignment = self
            .insert_new(
                ctx,
                NewAssignment {
                    org_id: ctx.org_id.clone(),
                    test_id: test.id.clone(),
                    assignee_id: req.assignee_id,
                    due_date: req.due_date,
                    notes: req.notes,
                },
                false,
            )
            .await?;

        let notification = Notification {
            org_id: ctx.org_id.clone(),
            recipient_id: assignment.assignee_id.clone(),
            assignment_id: assignment.id.clone(),
            test_id: test.id.clone(),
            message: format!(
                "assignment created for user {}: {}",
                assignment.assignee_id, test.title
            ),
        };
        if let Err(e) = self.sink.notify(&notification).await {
            warn!(assignment_id = %assignment.id, "notification delivery failed: {}", e);
        }

        Ok(assignment)
    }

    /// Load the active assignment for `(test, assignee)`, or create a
    /// self-serve one when the caller is the assignee and is allowed to
    /// self-assign.
    pub async fn start_or_load_execution(
        &self,
        ctx: &RequestContext,
        test_id: &Id,
        assignee_id: &str,
    ) -> Result<Assignment> {
        let test = self.store.get_test(&ctx.org_id, test_id).await?;

        if let Some(mut existing) = self
            .store
            .find_active_assignment(&test.id, assignee_id)
            .await?
        {
            if existing.org_id != ctx.org_id {
                return Err(WorkflowError::NotFound(format!("assignment for test {test_id}")));
            }
            ensure_visible(&ctx.caller, &existing)?;
            // Only the assignee's first open of this attempt counts as a start.
            if existing.assignee_id == ctx.caller.user_id && existing.mark_started(Utc::now()) {
                let started = started_event(&existing);
                self.store.update_assignment(&existing, &[started]).await?;
            }
            debug!(assignment_id = %existing.id, "loaded execution");
            return Ok(existing);
        }

        if assignee_id != ctx.caller.user_id || !self.config.self_serve_execution {
            return Err(WorkflowError::NotFound(format!(
                "active assignment of test {test_id} for {assignee_id}"
            )));
        }
        if !self.store.can_self_assign(ctx) {
            return Err(WorkflowError::Forbidden(format!(
                "{} may not self-assign tests",
                ctx.caller.role.as_str()
            )));
        }
        self.ensure_assignable(&test)?;

        let assignment = self
            .insert_new(
                ctx,
                NewAssignment {
                    org_id: ctx.org_id.clone(),
                    test_id: test.id.clone(),
                    assignee_id: assignee_id.to_string(),
                    due_date: None,
                    notes: None,
                },
                true,
            )
            .await?;

        Ok(assignment)
    }

    /// Upsert one step verdict. Assignee only.
    pub async fn record_step(
        &self,
        ctx: &RequestContext,
        assignment_id: &Id,
        step_index: u32,
        status: &str,
        notes: Option<String>,
    ) -> Result<Assignment> {
        let verdict = normalize_str(status)
            .ok_or_else(|| WorkflowError::InvalidInput(format!("unknown step status: {status}")))?;

        let (test, mut assignment) = self.load_for_execution(ctx, assignment_id).await?;
        assignment.record_step(step_index, verdict, notes, test.steps.len(), Utc::now())?;
        let event = EventPayload::StepRecorded(StepRecordedPayload {
            assignment_id: assignment.id.clone(),
            step_index,
            verdict,
        });
        self.store.update_assignment(&assignment, &[event]).await?;
        debug!(
            assignment_id = %assignment.id,
            step_index,
            verdict = verdict.as_str(),
            "step recorded"
        );
        Ok(assignment)
    }

    /// Persist the ledger and notes and move to `InProgress`. Assignee only.
    pub async fn save_progress(
        &self,
        ctx: &RequestContext,
        assignment_id: &Id,
        update: ExecutionUpdate,
    ) -> Result<Assignment> {
        let (test, mut assignment) = self.load_for_execution(ctx, assignment_id).await?;
        let ledger = submitted_ledger(&test, update.steps)?;
        assignment.save_progress(ledger, update.notes, Utc::now())?;
        let event = EventPayload::ProgressSaved(ProgressSavedPayload {
            assignment_id: assignment.id.clone(),
            recorded_steps: assignment.ledger.len(),
        });
        self.store.update_assignment(&assignment, &[event]).await?;
        info!(assignment_id = %assignment.id, "progress saved");
        Ok(assignment)
    }

    /// Persist the ledger and notes and finalize the attempt. Assignee only.
    pub async fn finish(
        &self,
        ctx: &RequestContext,
        assignment_id: &Id,
        update: ExecutionUpdate,
    ) -> Result<Assignment> {
        let (test, mut assignment) = self.load_for_execution(ctx, assignment_id).await?;
        let ledger = submitted_ledger(&test, update.steps)?;
        assignment.finish(ledger, update.notes, Utc::now())?;
        // Historical rule: the attempt is no longer open.
        let overall = overall_result(&assignment.ledger);
        let event = EventPayload::ExecutionFinished(ExecutionFinishedPayload {
            assignment_id: assignment.id.clone(),
            overall,
            recorded_steps: assignment.ledger.len(),
        });
        self.store.update_assignment(&assignment, &[event]).await?;
        info!(
            assignment_id = %assignment.id,
            overall = overall.as_str(),
            "execution finished"
        );
        Ok(assignment)
    }

    /// Reopen an assignment for re-execution. Managers and admins only.
    ///
    /// The discarded attempt is archived when archiving is enabled. Archive,
    /// write-back and event land together or not at all.
    pub async fn reassign(&self, ctx: &RequestContext, assignment_id: &Id) -> Result<Assignment> {
        require_manager(&ctx.caller, "reassign")?;

        let mut assignment = self.store.get_assignment(&ctx.org_id, assignment_id).await?;
        let previous_state = assignment.state;
        let record = assignment
            .reassign(&self.config.reassign_note, Utc::now())
            .filter(|_| self.config.archive_on_reassign);

        let event = AssignmentReassignedPayload {
            assignment_id: assignment.id.clone(),
            reassigned_by: ctx.caller.user_id.clone(),
            previous_state,
            archived_sequence: None,
        };
        let archived_sequence = self
            .store
            .reassign_assignment(&assignment, record.as_ref(), event)
            .await?;
        info!(
            assignment_id = %assignment.id,
            from = previous_state.as_str(),
            archived = archived_sequence.is_some(),
            "assignment reassigned"
        );
        Ok(assignment)
    }

    /// Tombstone an assignment. Managers and admins only.
    pub async fn delete_assignment(&self, ctx: &RequestContext, assignment_id: &Id) -> Result<()> {
        require_manager(&ctx.caller, "delete assignments")?;

        let assignment = self.store.get_assignment(&ctx.org_id, assignment_id).await?;
        let event = EventPayload::AssignmentDeleted(AssignmentDeletedPayload {
            assignment_id: assignment.id.clone(),
            deleted_by: ctx.caller.user_id.clone(),
        });
        self.store
            .soft_delete_assignment(&assignment.id, Utc::now(), &[event])
            .await?;
        info!(assignment_id = %assignment.id, "assignment deleted");
        Ok(())
    }

    // --- Read projections ---

    pub async fn get_assignment(
        &self,
        ctx: &RequestContext,
        assignment_id: &Id,
    ) -> Result<Assignment> {
        let assignment = self.store.get_assignment(&ctx.org_id, assignment_id).await?;
        ensure_visible(&ctx.caller, &assignment)?;
        Ok(assignment)
    }

    /// Assignments of a test as the caller may see them.
    pub async fn list_assignments(
        &self,
        ctx: &RequestContext,
        test_id: &Id,
    ) -> Result<Vec<VisibleAssignment>> {
        let assignments = self.load_siblings(ctx, test_id).await?;
        Ok(visibility::project(&ctx.caller, &assignments))
    }

    /// Test statistics. The self view filters before aggregating.
    pub async fn get_test_statistics(
        &self,
        ctx: &RequestContext,
        test_id: &Id,
    ) -> Result<TestStatistics> {
        let assignments = self.load_siblings(ctx, test_id).await?;
        Ok(visibility::statistics_for(&ctx.caller, &assignments))
    }

    /// Unfiltered statistics plus the per-assignee slice. Managers and admins only.
    pub async fn get_test_dashboard(&self, ctx: &RequestContext, test_id: &Id) -> Result<Dashboard> {
        require_manager(&ctx.caller, "view dashboards")?;
        let assignments = self.load_siblings(ctx, test_id).await?;
        Ok(visibility::manager_dashboard(test_id, &assignments))
    }

    /// Rollup result, plus the required-step gate while the attempt is open.
    pub async fn get_assignment_summary(
        &self,
        ctx: &RequestContext,
        assignment_id: &Id,
    ) -> Result<AssignmentSummary> {
        let assignment = self.get_assignment(ctx, assignment_id).await?;
        let test = self.store.get_test(&ctx.org_id, &assignment.test_id).await?;
        Ok(summarize(&test, &assignment))
    }

    pub async fn list_attempt_history(
        &self,
        ctx: &RequestContext,
        assignment_id: &Id,
    ) -> Result<Vec<AttemptRecord>> {
        let assignment = self.get_assignment(ctx, assignment_id).await?;
        Ok(self.store.list_attempts(&assignment.id).await?)
    }

    pub async fn list_events(&self, ctx: &RequestContext, assignment_id: &Id) -> Result<Vec<Event>> {
        let assignment = self.get_assignment(ctx, assignment_id).await?;
        Ok(self.store.list_events(&assignment.id).await?)
    }

    // --- Helpers ---

    fn ensure_assignable(&self, test: &Test) -> Result<()> {
        if self.config.is_assignable(test.status) {
            Ok(())
        } else {
            Err(WorkflowError::NotAssignable {
                test_id: test.id.clone(),
                status: test.status.as_str(),
            })
        }
    }

    /// Check-then-insert; the storage constraint catches the race. Self-serve
    /// creations are opened by their assignee and count as started.
    async fn insert_new(
        &self,
        ctx: &RequestContext,
        new: NewAssignment,
        self_serve: bool,
    ) -> Result<Assignment> {
        if self
            .store
            .find_active_assignment(&new.test_id, &new.assignee_id)
            .await?
            .is_some()
        {
            return Err(WorkflowError::DuplicateAssignment {
                test_id: new.test_id.to_string(),
                assignee_id: new.assignee_id,
            });
        }

        let now = Utc::now();
        let mut assignment = Assignment::create(new, now);
        let mut events = vec![EventPayload::AssignmentCreated(AssignmentCreatedPayload {
            assignment_id: assignment.id.clone(),
            test_id: assignment.test_id.clone(),
            assignee_id: assignment.assignee_id.clone(),
            created_by: ctx.caller.user_id.clone(),
            self_serve,
        })];
        if self_serve && assignment.mark_started(now) {
            events.push(started_event(&assignment));
        }
        self.store.insert_assignment(&assignment, &events).await?;
        info!(
            assignment_id = %assignment.id,
            test_id = %assignment.test_id,
            assignee = %assignment.assignee_id,
            self_serve,
            "assignment created"
        );
        Ok(assignment)
    }

    /// Load an assignment and its test for an execution mutation by the assignee.
    async fn load_for_execution(
        &self,
        ctx: &RequestContext,
        assignment_id: &Id,
    ) -> Result<(Test, Assignment)> {
        let assignment = self.store.get_assignment(&ctx.org_id, assignment_id).await?;
        if assignment.assignee_id != ctx.caller.user_id {
            return Err(WorkflowError::Forbidden(format!(
                "only {} may execute assignment {}",
                assignment.assignee_id, assignment.id
            )));
        }
        assignment.ensure_editable()?;
        let test = self.store.get_test(&ctx.org_id, &assignment.test_id).await?;
        Ok((test, assignment))
    }

    async fn load_siblings(&self, ctx: &RequestContext, test_id: &Id) -> Result<Vec<Assignment>> {
        let test = self.store.get_test(&ctx.org_id, test_id).await?;
        Ok(self.store.list_active_assignments(&test.id).await?)
    }
}

fn started_event(assignment: &Assignment) -> EventPayload {
    EventPayload::ExecutionStarted(ExecutionStartedPayload {
        assignment_id: assignment.id.clone(),
        state: assignment.state,
    })
}

fn require_manager(caller: &Caller, action: &str) -> Result<()> {
    if caller.is_manager() {
        Ok(())
    } else {
        Err(WorkflowError::Forbidden(format!(
            "{} may not {action}",
            caller.role.as_str()
        )))
    }
}

fn ensure_visible(caller: &Caller, assignment: &Assignment) -> Result<()> {
    if visibility::can_view(caller, assignment) {
        Ok(())
    } else {
        Err(WorkflowError::Forbidden(format!(
            "assignment {} belongs to another member",
            assignment.id
        )))
    }
}

fn submitted_ledger(test: &Test, steps: Option<Vec<StepResult>>) -> Result<Option<Ledger>> {
    steps
        .map(|steps| Ledger::from_submission(&steps, test.steps.len()))
        .transpose()
        .map_err(|e| WorkflowError::InvalidInput(e.to_string()))
}
