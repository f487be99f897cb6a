//! Boundary contracts consumed by the orchestrator.
//!
//! [`Storage`] implements all of them for the standalone daemon; tests swap in
//! their own sinks.

use std::future::Future;

use chrono::{DateTime, Utc};
use qa_core::events::{AssignmentReassignedPayload, Event, EventPayload, Notification};
use qa_core::lifecycle::AttemptRecord;
use qa_core::{Assignment, Id, RequestContext, Role, Test};

use crate::notify::NotifyError;
use crate::storage::{Result, Storage};

/// Read-only access to test definitions.
pub trait TestStore: Send + Sync {
    fn get_test(&self, org_id: &str, id: &Id) -> impl Future<Output = Result<Test>> + Send;
}

/// Persistence for assignments and everything hanging off them.
///
/// Every mutation takes the audit events it produces and stores them in the
/// same transaction as the write.
pub trait AssignmentStore: Send + Sync {
    fn insert_assignment(
        &self,
        assignment: &Assignment,
        events: &[EventPayload],
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_assignment(&self, org_id: &str, id: &Id)
        -> impl Future<Output = Result<Assignment>> + Send;

    fn find_active_assignment(
        &self,
        test_id: &Id,
        assignee_id: &str,
    ) -> impl Future<Output = Result<Option<Assignment>>> + Send;

    fn list_active_assignments(
        &self,
        test_id: &Id,
    ) -> impl Future<Output = Result<Vec<Assignment>>> + Send;

    fn update_assignment(
        &self,
        assignment: &Assignment,
        events: &[EventPayload],
    ) -> impl Future<Output = Result<()>> + Send;

    fn soft_delete_assignment(
        &self,
        id: &Id,
        at: DateTime<Utc>,
        events: &[EventPayload],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Archive, write back and log a reassignment as one unit. Returns the
    /// archive sequence used, if any.
    fn reassign_assignment(
        &self,
        assignment: &Assignment,
        archive: Option<&AttemptRecord>,
        event: AssignmentReassignedPayload,
    ) -> impl Future<Output = Result<Option<u32>>> + Send;

    fn list_attempts(&self, assignment_id: &Id)
        -> impl Future<Output = Result<Vec<AttemptRecord>>> + Send;

    fn list_events(&self, assignment_id: &Id) -> impl Future<Output = Result<Vec<Event>>> + Send;
}

/// Resolves organization roles.
pub trait IdentityProvider: Send + Sync {
    /// The user's role in the organization, or `None` for non-members.
    fn role_of(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<Role>>> + Send;

    /// Whether the caller may start an execution nobody assigned to them.
    fn can_self_assign(&self, ctx: &RequestContext) -> bool {
        ctx.caller.role != Role::Viewer
    }
}

/// Fire-and-forget delivery of notifications.
pub trait NotificationSink: Send + Sync {
    fn notify(
        &self,
        notification: &Notification,
    ) -> impl Future<Output = std::result::Result<(), NotifyError>> + Send;
}

impl TestStore for Storage {
    async fn get_test(&self, org_id: &str, id: &Id) -> Result<Test> {
        Storage::get_test(self, org_id, id).await
    }
}

impl AssignmentStore for Storage {
    async fn insert_assignment(&self, assignment: &Assignment, events: &[EventPayload]) -> Result<()> {
        Storage::insert_assignment(self, assignment, events).await
    }

    async fn get_assignment(&self, org_id: &str, id: &Id) -> Result<Assignment> {
        Storage::get_assignment(self, org_id, id).await
    }

    async fn find_active_assignment(
        &self,
        test_id: &Id,
        assignee_id: &str,
    ) -> Result<Option<Assignment>> {
        Storage::find_active_assignment(self, test_id, assignee_id).await
    }

    async fn list_active_assignments(&self, test_id: &Id) -> Result<Vec<Assignment>> {
        Storage::list_active_assignments(self, test_id).await
    }

    async fn update_assignment(&self, assignment: &Assignment, events: &[EventPayload]) -> Result<()> {
        Storage::update_assignment(self, assignment, events).await
    }

    async fn soft_delete_assignment(
        &self,
        id: &Id,
        at: DateTime<Utc>,
        events: &[EventPayload],
    ) -> Result<()> {
        Storage::soft_delete_assignment(self, id, at, events).await
    }

    async fn reassign_assignment(
        &self,
        assignment: &Assignment,
        archive: Option<&AttemptRecord>,
        event: AssignmentReassignedPayload,
    ) -> Result<Option<u32>> {
        Storage::reassign_assignment(self, assignment, archive, event).await
    }

    async fn list_attempts(&self, assignment_id: &Id) -> Result<Vec<AttemptRecord>> {
        Storage::list_attempts(self, assignment_id).await
    }

    async fn list_events(&self, assignment_id: &Id) -> Result<Vec<Event>> {
        Storage::list_events(self, assignment_id).await
    }
}

impl IdentityProvider for Storage {
    async fn role_of(&self, org_id: &str, user_id: &str) -> Result<Option<Role>> {
        Ok(self.get_member(org_id, user_id).await?.map(|m| m.role))
    }
}
