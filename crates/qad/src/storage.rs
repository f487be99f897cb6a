//! SQLite storage for the workflow service.
//!
//! Persists members, test definitions, assignments with their ledgers, the
//! reassignment archive, the audit log, and the notification outbox.

use chrono::{DateTime, Utc};
use qa_core::events::{AssignmentReassignedPayload, Event, EventPayload, Notification};
use qa_core::lifecycle::AttemptRecord;
use qa_core::rollup::overall_result;
use qa_core::{
    Assignment, AssignmentState, Id, Ledger, Member, OverallResult, Role, StepResult, Test,
    TestStatus, TestStep,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite, SqliteConnection};
use std::path::Path;
use thiserror::Error;

/// Explicit column list for assignment queries.
const ASSIGNMENT_COLUMNS: &str = "id, org_id, test_id, assignee_id, state, ledger_json, notes, \
    due_date, reassign_count, started_at, created_at, updated_at, deleted_at";

const TEST_COLUMNS: &str =
    "id, org_id, title, status, priority, steps_json, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("test not found: {0}")]
    TestNotFound(String),
    #[error("test id {0} belongs to another organization")]
    TestIdConflict(String),
    #[error("test {0} has open assignments; its steps cannot change until they finish")]
    TestInUse(String),
    #[error("assignment not found: {0}")]
    AssignmentNotFound(String),
    #[error("active assignment already exists for test {test_id} and assignee {assignee_id}")]
    DuplicateAssignment { test_id: String, assignee_id: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the service.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run the embedded migrations. Safe to call on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [
            include_str!("../../../migrations/0001_init.sql"),
            include_str!("../../../migrations/0002_add_assignment_started_at.sql"),
        ];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                        let msg = e.to_string();
                        if !msg.contains("duplicate column") && !msg.contains("already exists") {
                            return Err(e.into());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Member operations ---

    /// Insert or replace a member's role.
    pub async fn upsert_member(&self, member: &Member) -> Result<()> {
        sqlx::query(
            "INSERT INTO members (org_id, user_id, role, created_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(org_id, user_id) DO UPDATE SET role = excluded.role",
        )
        .bind(&member.org_id)
        .bind(&member.user_id)
        .bind(member.role.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_member(&self, org_id: &str, user_id: &str) -> Result<Option<Member>> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT org_id, user_id, role FROM members WHERE org_id = ?1 AND user_id = ?2",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(org_id, user_id, role)| Member {
            org_id,
            user_id,
            // Unknown roles get the least privilege.
            role: Role::parse(&role).unwrap_or(Role::Viewer),
        }))
    }

    pub async fn count_members(&self, org_id: &str) -> Result<usize> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM members WHERE org_id = ?1")
            .bind(org_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 as usize)
    }

    // --- Test operations ---

    /// Insert or replace a test definition. Ids are never moved between
    /// organizations, and the step list of a test with open assignments is
    /// frozen until those attempts finish.
    pub async fn upsert_test(&self, test: &Test) -> Result<()> {
        let steps_json = serde_json::to_string(&test.steps)?;
        let result = sqlx::query(
            r#"
            INSERT INTO tests (id, org_id, title, status, priority, steps_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                status = excluded.status,
                priority = excluded.priority,
                steps_json = excluded.steps_json,
                updated_at = excluded.updated_at
            WHERE tests.org_id = excluded.org_id
              AND (tests.steps_json = excluded.steps_json OR NOT EXISTS (
                  SELECT 1 FROM assignments
                  WHERE assignments.test_id = tests.id
                    AND assignments.deleted_at IS NULL
                    AND assignments.state != 'DONE'))
            "#,
        )
        .bind(test.id.as_ref())
        .bind(&test.org_id)
        .bind(&test.title)
        .bind(test.status.as_str())
        .bind(i64::from(test.priority))
        .bind(&steps_json)
        .bind(test.created_at.timestamp_millis())
        .bind(test.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let owner: Option<(String,)> = sqlx::query_as("SELECT org_id FROM tests WHERE id = ?1")
                .bind(test.id.as_ref())
                .fetch_optional(&self.pool)
                .await?;
            return Err(match owner {
                Some((org_id,)) if org_id == test.org_id => {
                    StorageError::TestInUse(test.id.to_string())
                }
                _ => StorageError::TestIdConflict(test.id.to_string()),
            });
        }
        Ok(())
    }

    /// Get a test by id, scoped to an organization.
    pub async fn get_test(&self, org_id: &str, id: &Id) -> Result<Test> {
        let query = format!("SELECT {TEST_COLUMNS} FROM tests WHERE id = ?1 AND org_id = ?2");
        let row = sqlx::query_as::<_, TestRow>(&query)
            .bind(id.as_ref())
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::TestNotFound(id.to_string()))?;

        row.into_test()
    }

    // --- Assignment operations ---

    /// Insert a new assignment together with its audit events.
    ///
    /// The partial unique index on `(test_id, assignee_id)` turns a racing
    /// second insert into [`StorageError::DuplicateAssignment`].
    pub async fn insert_assignment(
        &self,
        assignment: &Assignment,
        events: &[EventPayload],
    ) -> Result<()> {
        let ledger_json = serde_json::to_string(&assignment.ledger)?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO assignments (id, org_id, test_id, assignee_id, state, ledger_json, notes,
                                     due_date, reassign_count, started_at, created_at, updated_at,
                                     deleted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(assignment.id.as_ref())
        .bind(&assignment.org_id)
        .bind(assignment.test_id.as_ref())
        .bind(&assignment.assignee_id)
        .bind(assignment.state.as_str())
        .bind(&ledger_json)
        .bind(&assignment.notes)
        .bind(assignment.due_date.map(|t| t.timestamp_millis()))
        .bind(i64::from(assignment.reassign_count))
        .bind(assignment.started_at.map(|t| t.timestamp_millis()))
        .bind(assignment.created_at.timestamp_millis())
        .bind(assignment.updated_at.timestamp_millis())
        .bind(assignment.deleted_at.map(|t| t.timestamp_millis()))
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(StorageError::DuplicateAssignment {
                    test_id: assignment.test_id.to_string(),
                    assignee_id: assignment.assignee_id.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        for payload in events {
            insert_event(&mut tx, payload).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Get a live assignment by id, scoped to an organization.
    pub async fn get_assignment(&self, org_id: &str, id: &Id) -> Result<Assignment> {
        let query = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments \
             WHERE id = ?1 AND org_id = ?2 AND deleted_at IS NULL"
        );
        let row = sqlx::query_as::<_, AssignmentRow>(&query)
            .bind(id.as_ref())
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::AssignmentNotFound(id.to_string()))?;

        row.into_assignment()
    }

    /// The live assignment for a (test, assignee) pair, if any.
    pub async fn find_active_assignment(
        &self,
        test_id: &Id,
        assignee_id: &str,
    ) -> Result<Option<Assignment>> {
        let query = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments \
             WHERE test_id = ?1 AND assignee_id = ?2 AND deleted_at IS NULL"
        );
        let row = sqlx::query_as::<_, AssignmentRow>(&query)
            .bind(test_id.as_ref())
            .bind(assignee_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(AssignmentRow::into_assignment).transpose()
    }

    /// All live assignments of a test, oldest first.
    pub async fn list_active_assignments(&self, test_id: &Id) -> Result<Vec<Assignment>> {
        let query = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments \
             WHERE test_id = ?1 AND deleted_at IS NULL ORDER BY created_at ASC, rowid ASC"
        );
        let rows = sqlx::query_as::<_, AssignmentRow>(&query)
            .bind(test_id.as_ref())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(AssignmentRow::into_assignment).collect()
    }

    /// Write back the mutable fields of a live assignment and append its
    /// audit events in one transaction. Last write wins.
    pub async fn update_assignment(
        &self,
        assignment: &Assignment,
        events: &[EventPayload],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_assignment(&mut tx, assignment).await?;
        for payload in events {
            insert_event(&mut tx, payload).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Tombstone an assignment and record who did it.
    pub async fn soft_delete_assignment(
        &self,
        id: &Id,
        at: DateTime<Utc>,
        events: &[EventPayload],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE assignments SET deleted_at = ?1, updated_at = ?1 \
             WHERE id = ?2 AND deleted_at IS NULL",
        )
        .bind(at.timestamp_millis())
        .bind(id.as_ref())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AssignmentNotFound(id.to_string()));
        }
        for payload in events {
            insert_event(&mut tx, payload).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Persist a reassignment: archive the discarded attempt, write back the
    /// reopened record, and log the event, all or nothing.
    ///
    /// The archive sequence is the next free one for the assignment, so
    /// concurrent reassignments each get their own slot. Returns the sequence
    /// used, if anything was archived.
    pub async fn reassign_assignment(
        &self,
        assignment: &Assignment,
        archive: Option<&AttemptRecord>,
        mut event: AssignmentReassignedPayload,
    ) -> Result<Option<u32>> {
        let mut tx = self.pool.begin().await?;

        let sequence = match archive {
            Some(record) => Some(insert_attempt(&mut tx, record).await?),
            None => None,
        };
        write_assignment(&mut tx, assignment).await?;

        event.archived_sequence = sequence;
        insert_event(&mut tx, &EventPayload::AssignmentReassigned(event)).await?;
        tx.commit().await?;
        Ok(sequence)
    }

    // --- Attempt archive ---

    pub async fn list_attempts(&self, assignment_id: &Id) -> Result<Vec<AttemptRecord>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            "SELECT id, assignment_id, sequence, state, ledger_json, notes, overall, \
             ledger_digest, archived_at FROM assignment_attempts \
             WHERE assignment_id = ?1 ORDER BY sequence ASC",
        )
        .bind(assignment_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AttemptRow::into_record).collect()
    }

    // --- Event operations ---

    /// List events for an assignment in insertion order.
    pub async fn list_events(&self, assignment_id: &Id) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, assignment_id, type, ts, payload_json FROM events \
             WHERE assignment_id = ?1 ORDER BY ts ASC, rowid ASC",
        )
        .bind(assignment_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    // --- Notification outbox ---

    pub async fn enqueue_notification(&self, notification: &Notification) -> Result<()> {
        sqlx::query(
            "INSERT INTO notifications (id, org_id, recipient_id, assignment_id, test_id, message, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(Id::new().as_ref())
        .bind(&notification.org_id)
        .bind(&notification.recipient_id)
        .bind(notification.assignment_id.as_ref())
        .bind(notification.test_id.as_ref())
        .bind(&notification.message)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_notifications(&self, recipient_id: &str) -> Result<Vec<Notification>> {
        let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT org_id, recipient_id, assignment_id, test_id, message FROM notifications \
             WHERE recipient_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(org_id, recipient_id, assignment_id, test_id, message)| Notification {
                    org_id,
                    recipient_id,
                    assignment_id: Id::from_string(assignment_id),
                    test_id: Id::from_string(test_id),
                    message,
                },
            )
            .collect())
    }

}

async fn write_assignment(conn: &mut SqliteConnection, assignment: &Assignment) -> Result<()> {
    let ledger_json = serde_json::to_string(&assignment.ledger)?;
    let result = sqlx::query(
        "UPDATE assignments SET state = ?1, ledger_json = ?2, notes = ?3, due_date = ?4, \
         reassign_count = ?5, started_at = ?6, updated_at = ?7 \
         WHERE id = ?8 AND deleted_at IS NULL",
    )
    .bind(assignment.state.as_str())
    .bind(&ledger_json)
    .bind(&assignment.notes)
    .bind(assignment.due_date.map(|t| t.timestamp_millis()))
    .bind(i64::from(assignment.reassign_count))
    .bind(assignment.started_at.map(|t| t.timestamp_millis()))
    .bind(assignment.updated_at.timestamp_millis())
    .bind(assignment.id.as_ref())
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::AssignmentNotFound(assignment.id.to_string()));
    }
    Ok(())
}

/// Append an attempt under the next free sequence number and return it.
async fn insert_attempt(conn: &mut SqliteConnection, record: &AttemptRecord) -> Result<u32> {
    let ledger_json = serde_json::to_string(&record.ledger)?;
    let sequence: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO assignment_attempts (id, assignment_id, sequence, state, ledger_json,
                                         notes, overall, ledger_digest, archived_at)
        VALUES (?1, ?2,
                (SELECT COALESCE(MAX(sequence), 0) + 1 FROM assignment_attempts
                 WHERE assignment_id = ?2),
                ?3, ?4, ?5, ?6, ?7, ?8)
        RETURNING sequence
        "#,
    )
    .bind(record.id.as_ref())
    .bind(record.assignment_id.as_ref())
    .bind(record.state.as_str())
    .bind(&ledger_json)
    .bind(&record.notes)
    .bind(record.overall.as_str())
    .bind(&record.ledger_digest)
    .bind(record.archived_at.timestamp_millis())
    .fetch_one(conn)
    .await?;
    Ok(sequence.max(0) as u32)
}

async fn insert_event(conn: &mut SqliteConnection, payload: &EventPayload) -> Result<Event> {
    let id = Id::new();
    let now = Utc::now();
    let assignment_id = payload.assignment_id().clone();
    let event_type = payload.event_type().as_str().to_string();
    let payload_json = payload.to_json()?;

    sqlx::query(
        "INSERT INTO events (id, assignment_id, type, ts, payload_json) VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(id.as_ref())
    .bind(assignment_id.as_ref())
    .bind(&event_type)
    .bind(now.timestamp_millis())
    .bind(&payload_json)
    .execute(conn)
    .await?;

    Ok(Event {
        id,
        assignment_id,
        event_type,
        timestamp: now,
        payload_json,
    })
}

fn millis(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts).unwrap_or_default()
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct TestRow {
    id: String,
    org_id: String,
    title: String,
    status: String,
    priority: i64,
    steps_json: String,
    created_at: i64,
    updated_at: i64,
}

impl TestRow {
    fn into_test(self) -> Result<Test> {
        let steps: Vec<TestStep> = serde_json::from_str(&self.steps_json)?;
        Ok(Test {
            id: Id::from_string(self.id),
            org_id: self.org_id,
            title: self.title,
            steps,
            // Unknown statuses are treated as drafts, which cannot be assigned.
            status: TestStatus::parse(&self.status).unwrap_or(TestStatus::Draft),
            priority: self.priority.clamp(0, i64::from(Test::MAX_PRIORITY)) as u8,
            created_at: millis(self.created_at),
            updated_at: millis(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct AssignmentRow {
    id: String,
    org_id: String,
    test_id: String,
    assignee_id: String,
    state: String,
    ledger_json: String,
    notes: Option<String>,
    due_date: Option<i64>,
    reassign_count: i64,
    started_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
}

impl AssignmentRow {
    fn into_assignment(self) -> Result<Assignment> {
        // Stored verbatim so legacy vocabularies survive until rewritten.
        let results: Vec<StepResult> = serde_json::from_str(&self.ledger_json)?;
        Ok(Assignment {
            id: Id::from_string(self.id),
            org_id: self.org_id,
            test_id: Id::from_string(self.test_id),
            assignee_id: self.assignee_id,
            state: AssignmentState::parse(&self.state).unwrap_or(AssignmentState::Assigned),
            ledger: Ledger::from_stored(results),
            notes: self.notes,
            due_date: self.due_date.and_then(DateTime::from_timestamp_millis),
            reassign_count: self.reassign_count.max(0) as u32,
            started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
            created_at: millis(self.created_at),
            updated_at: millis(self.updated_at),
            deleted_at: self.deleted_at.and_then(DateTime::from_timestamp_millis),
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: String,
    assignment_id: String,
    sequence: i64,
    state: String,
    ledger_json: String,
    notes: Option<String>,
    overall: String,
    ledger_digest: String,
    archived_at: i64,
}

impl AttemptRow {
    fn into_record(self) -> Result<AttemptRecord> {
        let ledger = Ledger::from_stored(serde_json::from_str(&self.ledger_json)?);
        // Unknown labels are re-derived from the archived ledger.
        let overall =
            OverallResult::parse(&self.overall).unwrap_or_else(|| overall_result(&ledger));
        Ok(AttemptRecord {
            id: Id::from_string(self.id),
            assignment_id: Id::from_string(self.assignment_id),
            sequence: self.sequence.max(0) as u32,
            state: AssignmentState::parse(&self.state).unwrap_or(AssignmentState::Done),
            ledger,
            notes: self.notes,
            overall,
            ledger_digest: self.ledger_digest,
            archived_at: millis(self.archived_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    assignment_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: Id::from_string(self.id),
            assignment_id: Id::from_string(self.assignment_id),
            event_type: self.event_type,
            timestamp: millis(self.ts),
            payload_json: self.payload_json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qa_core::events::AssignmentCreatedPayload;
    use qa_core::StepVerdict;
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir, // Keep alive to prevent cleanup
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    fn create_test_definition() -> Test {
        let now = Utc::now();
        Test {
            id: Id::new(),
            org_id: "acme".to_string(),
            title: "Checkout flow".to_string(),
            steps: vec![
                TestStep {
                    title: "Add item".to_string(),
                    expected_result: "Cart shows 1".to_string(),
                    required: true,
                },
                TestStep {
                    title: "Pay".to_string(),
                    expected_result: "Receipt".to_string(),
                    required: false,
                },
            ],
            status: TestStatus::Active,
            priority: 2,
            created_at: now,
            updated_at: now,
        }
    }

    fn create_assignment(test_id: &Id, assignee: &str) -> Assignment {
        let now = Utc::now();
        Assignment {
            id: Id::new(),
            org_id: "acme".to_string(),
            test_id: test_id.clone(),
            assignee_id: assignee.to_string(),
            state: AssignmentState::Assigned,
            ledger: Ledger::new(),
            notes: None,
            due_date: None,
            reassign_count: 0,
            started_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn created_event(assignment: &Assignment) -> EventPayload {
        EventPayload::AssignmentCreated(AssignmentCreatedPayload {
            assignment_id: assignment.id.clone(),
            test_id: assignment.test_id.clone(),
            assignee_id: assignment.assignee_id.clone(),
            created_by: "mgr".to_string(),
            self_serve: false,
        })
    }

    fn reassigned_event(assignment: &Assignment) -> AssignmentReassignedPayload {
        AssignmentReassignedPayload {
            assignment_id: assignment.id.clone(),
            reassigned_by: "mgr".to_string(),
            previous_state: AssignmentState::Done,
            archived_sequence: None,
        }
    }

    #[tokio::test]
    async fn upsert_and_get_test() {
        let ts = create_test_storage().await;
        let mut test = create_test_definition();
        ts.storage.upsert_test(&test).await.unwrap();

        let retrieved = ts.storage.get_test("acme", &test.id).await.unwrap();
        assert_eq!(retrieved.title, "Checkout flow");
        assert_eq!(retrieved.steps, test.steps);
        assert_eq!(retrieved.status, TestStatus::Active);
        assert_eq!(retrieved.priority, 2);

        test.status = TestStatus::Archived;
        ts.storage.upsert_test(&test).await.unwrap();
        let retrieved = ts.storage.get_test("acme", &test.id).await.unwrap();
        assert_eq!(retrieved.status, TestStatus::Archived);
    }

    #[tokio::test]
    async fn get_test_is_org_scoped() {
        let ts = create_test_storage().await;
        let test = create_test_definition();
        ts.storage.upsert_test(&test).await.unwrap();

        let result = ts.storage.get_test("other-org", &test.id).await;
        assert!(matches!(result, Err(StorageError::TestNotFound(_))));
    }

    #[tokio::test]
    async fn upsert_test_refuses_foreign_org_id() {
        let ts = create_test_storage().await;
        let test = create_test_definition();
        ts.storage.upsert_test(&test).await.unwrap();

        let hijack = Test {
            org_id: "other-org".to_string(),
            title: "Hijacked".to_string(),
            ..test.clone()
        };
        let result = ts.storage.upsert_test(&hijack).await;
        assert!(matches!(result, Err(StorageError::TestIdConflict(_))));
        let kept = ts.storage.get_test("acme", &test.id).await.unwrap();
        assert_eq!(kept.title, "Checkout flow");
    }

    #[tokio::test]
    async fn member_roles_round_trip() {
        let ts = create_test_storage().await;
        let member = Member {
            org_id: "acme".to_string(),
            user_id: "alice".to_string(),
            role: Role::Tester,
        };
        ts.storage.upsert_member(&member).await.unwrap();
        assert_eq!(
            ts.storage.get_member("acme", "alice").await.unwrap(),
            Some(member.clone())
        );

        ts.storage
            .upsert_member(&Member {
                role: Role::Manager,
                ..member
            })
            .await
            .unwrap();
        let updated = ts.storage.get_member("acme", "alice").await.unwrap().unwrap();
        assert_eq!(updated.role, Role::Manager);
        assert_eq!(ts.storage.count_members("acme").await.unwrap(), 1);
        assert!(ts.storage.get_member("acme", "bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_and_get_assignment() {
        let ts = create_test_storage().await;
        let test = create_test_definition();
        let assignment = create_assignment(&test.id, "alice");
        ts.storage.insert_assignment(&assignment, &[]).await.unwrap();

        let retrieved = ts
            .storage
            .get_assignment("acme", &assignment.id)
            .await
            .unwrap();
        assert_eq!(retrieved.id, assignment.id);
        assert_eq!(retrieved.state, AssignmentState::Assigned);
        assert!(retrieved.ledger.is_empty());
    }

    #[tokio::test]
    async fn duplicate_active_pair_is_rejected() {
        let ts = create_test_storage().await;
        let test_id = Id::new();
        ts.storage
            .insert_assignment(&create_assignment(&test_id, "alice"), &[])
            .await
            .unwrap();

        let result = ts
            .storage
            .insert_assignment(&create_assignment(&test_id, "alice"), &[])
            .await;
        assert!(matches!(
            result,
            Err(StorageError::DuplicateAssignment { .. })
        ));
    }

    #[tokio::test]
    async fn soft_delete_frees_the_pair() {
        let ts = create_test_storage().await;
        let test_id = Id::new();
        let first = create_assignment(&test_id, "alice");
        ts.storage.insert_assignment(&first, &[]).await.unwrap();
        ts.storage
            .soft_delete_assignment(&first.id, Utc::now(), &[])
            .await
            .unwrap();

        assert!(matches!(
            ts.storage.get_assignment("acme", &first.id).await,
            Err(StorageError::AssignmentNotFound(_))
        ));
        assert!(ts
            .storage
            .find_active_assignment(&test_id, "alice")
            .await
            .unwrap()
            .is_none());

        let second = create_assignment(&test_id, "alice");
        ts.storage.insert_assignment(&second, &[]).await.unwrap();
        let active = ts.storage.list_active_assignments(&test_id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
    }

    #[tokio::test]
    async fn soft_delete_twice_is_not_found() {
        let ts = create_test_storage().await;
        let a = create_assignment(&Id::new(), "alice");
        ts.storage.insert_assignment(&a, &[]).await.unwrap();
        ts.storage
            .soft_delete_assignment(&a.id, Utc::now(), &[])
            .await
            .unwrap();
        let result = ts
            .storage
            .soft_delete_assignment(&a.id, Utc::now(), &[])
            .await;
        assert!(matches!(result, Err(StorageError::AssignmentNotFound(_))));
    }

    #[tokio::test]
    async fn update_assignment_persists_ledger_and_state() {
        let ts = create_test_storage().await;
        let mut a = create_assignment(&Id::new(), "alice");
        ts.storage.insert_assignment(&a, &[]).await.unwrap();

        a.record_step(0, StepVerdict::Pass, Some("fine".into()), 2, Utc::now())
            .unwrap();
        a.save_progress(None, Some("halfway".into()), Utc::now())
            .unwrap();
        ts.storage.update_assignment(&a, &[]).await.unwrap();

        let retrieved = ts.storage.get_assignment("acme", &a.id).await.unwrap();
        assert_eq!(retrieved.state, AssignmentState::InProgress);
        assert_eq!(retrieved.notes.as_deref(), Some("halfway"));
        assert_eq!(retrieved.ledger.verdict_at(0), Some(StepVerdict::Pass));
    }

    #[tokio::test]
    async fn legacy_ledger_rows_stay_readable() {
        let ts = create_test_storage().await;
        let a = create_assignment(&Id::new(), "alice");
        ts.storage.insert_assignment(&a, &[]).await.unwrap();

        sqlx::query("UPDATE assignments SET ledger_json = ?1 WHERE id = ?2")
            .bind(r#"[{"step_index":0,"result":"passed"},{"step_index":1,"status":"skipped"}]"#)
            .bind(a.id.as_ref())
            .execute(&ts.storage.pool)
            .await
            .unwrap();

        let retrieved = ts.storage.get_assignment("acme", &a.id).await.unwrap();
        assert_eq!(retrieved.ledger.verdict_at(0), Some(StepVerdict::Pass));
        assert_eq!(retrieved.ledger.verdict_at(1), Some(StepVerdict::Skip));
        assert_eq!(
            retrieved.ledger.get(0).unwrap().result.as_deref(),
            Some("passed")
        );
    }

    #[tokio::test]
    async fn reassign_archives_in_sequence() {
        let ts = create_test_storage().await;
        let mut a = create_assignment(&Id::new(), "alice");
        ts.storage.insert_assignment(&a, &[]).await.unwrap();

        a.record_step(0, StepVerdict::Fail, None, 1, Utc::now()).unwrap();
        a.finish(None, None, Utc::now()).unwrap();
        let first = a.reassign("again", Utc::now()).unwrap();
        let seq = ts
            .storage
            .reassign_assignment(&a, Some(&first), reassigned_event(&a))
            .await
            .unwrap();
        assert_eq!(seq, Some(1));

        a.record_step(0, StepVerdict::Pass, None, 1, Utc::now()).unwrap();
        a.finish(None, None, Utc::now()).unwrap();
        let second = a.reassign("again", Utc::now()).unwrap();
        let seq = ts
            .storage
            .reassign_assignment(&a, Some(&second), reassigned_event(&a))
            .await
            .unwrap();
        assert_eq!(seq, Some(2));

        let attempts = ts.storage.list_attempts(&a.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].sequence, 1);
        assert_eq!(attempts[0].overall, OverallResult::Failed);
        assert_eq!(attempts[1].sequence, 2);
        assert_eq!(attempts[1].overall, OverallResult::Passed);
        assert_eq!(attempts[1].ledger_digest, second.ledger_digest);

        let events = ts.storage.list_events(&a.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[1].payload_json.contains(r#""archived_sequence":2"#));
    }

    #[tokio::test]
    async fn stale_reassigns_take_distinct_sequences() {
        let ts = create_test_storage().await;
        let mut a = create_assignment(&Id::new(), "alice");
        ts.storage.insert_assignment(&a, &[]).await.unwrap();
        a.record_step(0, StepVerdict::Fail, None, 1, Utc::now()).unwrap();
        a.finish(None, None, Utc::now()).unwrap();
        ts.storage.update_assignment(&a, &[]).await.unwrap();

        // Two managers reassign from the same read.
        let mut left = ts.storage.get_assignment("acme", &a.id).await.unwrap();
        let mut right = left.clone();
        let left_record = left.reassign("again", Utc::now()).unwrap();
        let right_record = right.reassign("again", Utc::now()).unwrap();
        assert_eq!(left_record.sequence, right_record.sequence);

        let (l, r) = tokio::join!(
            ts.storage
                .reassign_assignment(&left, Some(&left_record), reassigned_event(&left)),
            ts.storage
                .reassign_assignment(&right, Some(&right_record), reassigned_event(&right)),
        );
        let mut sequences = vec![l.unwrap().unwrap(), r.unwrap().unwrap()];
        sequences.sort_unstable();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(ts.storage.list_attempts(&a.id).await.unwrap().len(), 2);
        assert_eq!(ts.storage.list_events(&a.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_reassign_leaves_no_archive_or_event() {
        let ts = create_test_storage().await;
        let mut a = create_assignment(&Id::new(), "alice");
        ts.storage.insert_assignment(&a, &[]).await.unwrap();
        a.record_step(0, StepVerdict::Pass, None, 1, Utc::now()).unwrap();
        ts.storage.update_assignment(&a, &[]).await.unwrap();
        ts.storage
            .soft_delete_assignment(&a.id, Utc::now(), &[])
            .await
            .unwrap();

        let record = a.reassign("again", Utc::now()).unwrap();
        let result = ts
            .storage
            .reassign_assignment(&a, Some(&record), reassigned_event(&a))
            .await;
        assert!(matches!(result, Err(StorageError::AssignmentNotFound(_))));
        assert!(ts.storage.list_attempts(&a.id).await.unwrap().is_empty());
        assert!(ts.storage.list_events(&a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_commit_with_their_write() {
        let ts = create_test_storage().await;
        let a = create_assignment(&Id::new(), "alice");
        ts.storage
            .insert_assignment(&a, &[created_event(&a)])
            .await
            .unwrap();

        let events = ts.storage.list_events(&a.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "ASSIGNMENT_CREATED");

        // A rejected duplicate writes no event either.
        let dup = create_assignment(&a.test_id, "alice");
        assert!(ts
            .storage
            .insert_assignment(&dup, &[created_event(&dup)])
            .await
            .is_err());
        assert!(ts.storage.list_events(&dup.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn started_at_round_trips() {
        let ts = create_test_storage().await;
        let mut a = create_assignment(&Id::new(), "alice");
        ts.storage.insert_assignment(&a, &[]).await.unwrap();
        assert!(a.mark_started(Utc::now()));
        ts.storage.update_assignment(&a, &[]).await.unwrap();

        let retrieved = ts.storage.get_assignment("acme", &a.id).await.unwrap();
        assert!(retrieved.started_at.is_some());
    }

    #[tokio::test]
    async fn upsert_test_refuses_step_changes_while_open() {
        let ts = create_test_storage().await;
        let test = create_test_definition();
        ts.storage.upsert_test(&test).await.unwrap();
        let mut a = create_assignment(&test.id, "alice");
        ts.storage.insert_assignment(&a, &[]).await.unwrap();

        let fewer_steps = Test {
            steps: vec![test.steps[1].clone()],
            ..test.clone()
        };
        let result = ts.storage.upsert_test(&fewer_steps).await;
        assert!(matches!(result, Err(StorageError::TestInUse(_))));

        // Other fields can still change.
        let renamed = Test {
            title: "Checkout v2".to_string(),
            ..test.clone()
        };
        ts.storage.upsert_test(&renamed).await.unwrap();
        let kept = ts.storage.get_test("acme", &test.id).await.unwrap();
        assert_eq!(kept.title, "Checkout v2");
        assert_eq!(kept.steps, test.steps);

        a.finish(None, None, Utc::now()).unwrap();
        ts.storage.update_assignment(&a, &[]).await.unwrap();
        ts.storage.upsert_test(&fewer_steps).await.unwrap();
        let changed = ts.storage.get_test("acme", &test.id).await.unwrap();
        assert_eq!(changed.steps.len(), 1);
    }

    #[tokio::test]
    async fn deleted_assignments_do_not_freeze_steps() {
        let ts = create_test_storage().await;
        let test = create_test_definition();
        ts.storage.upsert_test(&test).await.unwrap();
        let a = create_assignment(&test.id, "alice");
        ts.storage.insert_assignment(&a, &[]).await.unwrap();
        ts.storage
            .soft_delete_assignment(&a.id, Utc::now(), &[])
            .await
            .unwrap();

        let fewer_steps = Test {
            steps: vec![test.steps[0].clone()],
            ..test
        };
        ts.storage.upsert_test(&fewer_steps).await.unwrap();
    }

    #[tokio::test]
    async fn notifications_queue_per_recipient() {
        let ts = create_test_storage().await;
        let notification = Notification {
            org_id: "acme".to_string(),
            recipient_id: "alice".to_string(),
            assignment_id: Id::new(),
            test_id: Id::new(),
            message: "assigned".to_string(),
        };
        ts.storage.enqueue_notification(&notification).await.unwrap();

        assert_eq!(
            ts.storage.list_notifications("alice").await.unwrap(),
            vec![notification]
        );
        assert!(ts.storage.list_notifications("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let ts = create_test_storage().await;
        ts.storage.migrate_embedded().await.unwrap();
        ts.storage.migrate_embedded().await.unwrap();
    }
}
