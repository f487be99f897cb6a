//! HTTP control plane for qad.
//!
//! Local-only JSON API. Every workflow route is scoped to an organization
//! and identifies the caller through the `X-User-Id` header; the role comes
//! from the member table, never from the request.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use qa_core::events::Event;
use qa_core::lifecycle::AttemptRecord;
use qa_core::visibility::{Dashboard, VisibleAssignment};
use qa_core::{
    Assignment, AssignmentSummary, Id, Member, RequestContext, Role, StepResult, Test,
    TestStatistics, TestStatus, TestStep,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::orchestrator::{CreateAssignment, ExecutionUpdate, Orchestrator, WorkflowError};
use crate::storage::{Storage, StorageError};

/// Header carrying the calling user's id.
pub const USER_HEADER: &str = "x-user-id";

/// The orchestrator as wired by the daemon: SQLite store, outbox sink.
pub type Workflow = Orchestrator<Storage, Storage>;

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub workflow: Workflow,
    pub auth_token: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Store seeding
        .route("/orgs/{org}/members/{user}", put(put_member))
        .route("/orgs/{org}/tests/{test}", put(put_test))
        // Per-test operations
        .route(
            "/orgs/{org}/tests/{test}/assignments",
            post(create_assignment).get(list_assignments),
        )
        .route("/orgs/{org}/tests/{test}/execution", post(start_execution))
        .route("/orgs/{org}/tests/{test}/stats", get(test_statistics))
        .route("/orgs/{org}/tests/{test}/dashboard", get(test_dashboard))
        // Per-assignment operations
        .route(
            "/orgs/{org}/assignments/{id}",
            get(get_assignment).delete(delete_assignment),
        )
        .route("/orgs/{org}/assignments/{id}/steps/{index}", put(record_step))
        .route("/orgs/{org}/assignments/{id}/save", post(save_progress))
        .route("/orgs/{org}/assignments/{id}/finish", post(finish))
        .route("/orgs/{org}/assignments/{id}/reassign", post(reassign))
        .route("/orgs/{org}/assignments/{id}/summary", get(assignment_summary))
        .route("/orgs/{org}/assignments/{id}/history", get(attempt_history))
        .route("/orgs/{org}/assignments/{id}/events", get(list_events))
        // Health check
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

fn api_error(status: StatusCode, kind: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            kind: kind.to_string(),
        }),
    )
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(api_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "invalid auth token",
            )),
            None => Err(api_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing auth token",
            )),
        }
    } else {
        Ok(())
    }
}

fn caller_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing X-User-Id header",
            )
        })
}

/// Authenticate the request and resolve the caller's context in `org`.
async fn context(
    state: &AppState,
    headers: &HeaderMap,
    org: &str,
) -> Result<RequestContext, ApiError> {
    check_auth(state, headers)?;
    let user = caller_id(headers)?;
    state
        .workflow
        .resolve_context(org, &user)
        .await
        .map_err(workflow_error)
}

/// Map a workflow failure onto an HTTP status.
fn workflow_error(err: WorkflowError) -> ApiError {
    let status = match &err {
        WorkflowError::DuplicateAssignment { .. } | WorkflowError::AssignmentFinalized(_) => {
            StatusCode::CONFLICT
        }
        WorkflowError::Forbidden(_) => StatusCode::FORBIDDEN,
        WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
        WorkflowError::NotAssignable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        WorkflowError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        WorkflowError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("workflow error: {}", err);
    } else {
        warn!(kind = err.kind(), "request rejected: {}", err);
    }
    api_error(status, err.kind(), err.to_string())
}

fn storage_error(err: StorageError) -> ApiError {
    match err {
        StorageError::TestIdConflict(_) => {
            warn!("request rejected: {}", err);
            api_error(StatusCode::CONFLICT, "test_id_conflict", err.to_string())
        }
        StorageError::TestInUse(_) => {
            warn!("request rejected: {}", err);
            api_error(StatusCode::CONFLICT, "test_in_use", err.to_string())
        }
        other => workflow_error(other.into()),
    }
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

/// Request payload for PUT /orgs/{org}/members/{user}.
#[derive(Debug, Deserialize)]
pub struct PutMemberRequest {
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub struct MemberResponse {
    pub member: Member,
}

/// Request payload for PUT /orgs/{org}/tests/{test}.
#[derive(Debug, Deserialize)]
pub struct PutTestRequest {
    pub title: String,
    pub steps: Vec<TestStep>,
    #[serde(default)]
    pub status: TestStatus,
    #[serde(default)]
    pub priority: u8,
}

#[derive(Debug, Serialize)]
pub struct TestResponse {
    pub test: Test,
}

/// Request payload for POST /orgs/{org}/tests/{test}/assignments.
#[derive(Debug, Deserialize)]
pub struct CreateAssignmentRequest {
    pub assignee_id: String,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Request payload for POST /orgs/{org}/tests/{test}/execution.
#[derive(Debug, Default, Deserialize)]
pub struct StartExecutionRequest {
    /// Defaults to the caller.
    #[serde(default)]
    pub assignee_id: Option<String>,
}

/// Request payload for PUT /orgs/{org}/assignments/{id}/steps/{index}.
#[derive(Debug, Deserialize)]
pub struct RecordStepRequest {
    pub status: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Request payload for save and finish. Omitted fields keep their stored values.
#[derive(Debug, Default, Deserialize)]
pub struct ExecutionUpdateRequest {
    #[serde(default)]
    pub steps: Option<Vec<StepResult>>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl From<ExecutionUpdateRequest> for ExecutionUpdate {
    fn from(req: ExecutionUpdateRequest) -> Self {
        Self {
            steps: req.steps,
            notes: req.notes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AssignmentResponse {
    pub assignment: Assignment,
}

#[derive(Debug, Serialize)]
pub struct ListAssignmentsResponse {
    pub assignments: Vec<VisibleAssignment>,
}

#[derive(Debug, Serialize)]
pub struct StatisticsResponse {
    pub statistics: TestStatistics,
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub dashboard: Dashboard,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub summary: AssignmentSummary,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Serialize)]
pub struct ListEventsResponse {
    pub events: Vec<Event>,
}

// --- Handlers ---

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// PUT /orgs/{org}/members/{user} - Add a member or change their role.
///
/// Admin only, except for the first member of an empty organization, who
/// must be an admin.
async fn put_member(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, user)): Path<(String, String)>,
    Json(req): Json<PutMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let existing = state.storage.count_members(&org).await.map_err(storage_error)?;
    if existing == 0 {
        if req.role != Role::Admin {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "invalid_input",
                "the first member of an organization must be an admin",
            ));
        }
        info!("bootstrapping organization {} with admin {}", org, user);
    } else {
        let ctx = context(&state, &headers, &org).await?;
        if ctx.caller.role != Role::Admin {
            return Err(workflow_error(WorkflowError::Forbidden(
                "only admins may manage members".to_string(),
            )));
        }
    }

    let member = Member {
        org_id: org,
        user_id: user,
        role: req.role,
    };
    state
        .storage
        .upsert_member(&member)
        .await
        .map_err(storage_error)?;
    info!(
        "member {} of {} is now {}",
        member.user_id,
        member.org_id,
        member.role.as_str()
    );

    Ok(Json(MemberResponse { member }))
}

/// PUT /orgs/{org}/tests/{test} - Create or replace a test definition.
async fn put_test(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, test_id)): Path<(String, String)>,
    Json(req): Json<PutTestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    if !ctx.caller.is_manager() {
        return Err(workflow_error(WorkflowError::Forbidden(
            "only managers may edit tests".to_string(),
        )));
    }
    if req.priority > Test::MAX_PRIORITY {
        return Err(workflow_error(WorkflowError::InvalidInput(format!(
            "priority must be between 0 and {}",
            Test::MAX_PRIORITY
        ))));
    }

    let id = Id::from_string(test_id);
    let now = Utc::now();
    let created_at = match state.storage.get_test(&org, &id).await {
        Ok(existing) => existing.created_at,
        Err(StorageError::TestNotFound(_)) => now,
        Err(e) => return Err(storage_error(e)),
    };

    let test = Test {
        id,
        org_id: org,
        title: req.title,
        steps: req.steps,
        status: req.status,
        priority: req.priority,
        created_at,
        updated_at: now,
    };
    state.storage.upsert_test(&test).await.map_err(storage_error)?;
    info!("test {} saved ({} steps)", test.id, test.steps.len());

    Ok(Json(TestResponse { test }))
}

/// POST /orgs/{org}/tests/{test}/assignments - Assign a test.
async fn create_assignment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, test_id)): Path<(String, String)>,
    Json(req): Json<CreateAssignmentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    let assignment = state
        .workflow
        .create_assignment(
            &ctx,
            &Id::from_string(test_id),
            CreateAssignment {
                assignee_id: req.assignee_id,
                due_date: req.due_date,
                notes: req.notes,
            },
        )
        .await
        .map_err(workflow_error)?;

    Ok((StatusCode::CREATED, Json(AssignmentResponse { assignment })))
}

/// GET /orgs/{org}/tests/{test}/assignments - Visible assignments of a test.
async fn list_assignments(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, test_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    let assignments = state
        .workflow
        .list_assignments(&ctx, &Id::from_string(test_id))
        .await
        .map_err(workflow_error)?;

    Ok(Json(ListAssignmentsResponse { assignments }))
}

/// POST /orgs/{org}/tests/{test}/execution - Start or load an execution.
async fn start_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, test_id)): Path<(String, String)>,
    Json(req): Json<StartExecutionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    let assignee = req
        .assignee_id
        .unwrap_or_else(|| ctx.caller.user_id.clone());
    let assignment = state
        .workflow
        .start_or_load_execution(&ctx, &Id::from_string(test_id), &assignee)
        .await
        .map_err(workflow_error)?;

    Ok(Json(AssignmentResponse { assignment }))
}

/// GET /orgs/{org}/tests/{test}/stats
async fn test_statistics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, test_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    let statistics = state
        .workflow
        .get_test_statistics(&ctx, &Id::from_string(test_id))
        .await
        .map_err(workflow_error)?;

    Ok(Json(StatisticsResponse { statistics }))
}

/// GET /orgs/{org}/tests/{test}/dashboard
async fn test_dashboard(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, test_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    let dashboard = state
        .workflow
        .get_test_dashboard(&ctx, &Id::from_string(test_id))
        .await
        .map_err(workflow_error)?;

    Ok(Json(DashboardResponse { dashboard }))
}

/// GET /orgs/{org}/assignments/{id}
async fn get_assignment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    let assignment = state
        .workflow
        .get_assignment(&ctx, &Id::from_string(id))
        .await
        .map_err(workflow_error)?;

    Ok(Json(AssignmentResponse { assignment }))
}

/// DELETE /orgs/{org}/assignments/{id}
async fn delete_assignment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    state
        .workflow
        .delete_assignment(&ctx, &Id::from_string(id))
        .await
        .map_err(workflow_error)?;

    Ok(StatusCode::NO_CONTENT)
}

/// PUT /orgs/{org}/assignments/{id}/steps/{index}
async fn record_step(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, id, index)): Path<(String, String, u32)>,
    Json(req): Json<RecordStepRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    let assignment = state
        .workflow
        .record_step(&ctx, &Id::from_string(id), index, &req.status, req.notes)
        .await
        .map_err(workflow_error)?;

    Ok(Json(AssignmentResponse { assignment }))
}

/// POST /orgs/{org}/assignments/{id}/save
async fn save_progress(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, id)): Path<(String, String)>,
    Json(req): Json<ExecutionUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    let assignment = state
        .workflow
        .save_progress(&ctx, &Id::from_string(id), req.into())
        .await
        .map_err(workflow_error)?;

    Ok(Json(AssignmentResponse { assignment }))
}

/// POST /orgs/{org}/assignments/{id}/finish
async fn finish(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, id)): Path<(String, String)>,
    Json(req): Json<ExecutionUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    let assignment = state
        .workflow
        .finish(&ctx, &Id::from_string(id), req.into())
        .await
        .map_err(workflow_error)?;

    Ok(Json(AssignmentResponse { assignment }))
}

/// POST /orgs/{org}/assignments/{id}/reassign
async fn reassign(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    let assignment = state
        .workflow
        .reassign(&ctx, &Id::from_string(id))
        .await
        .map_err(workflow_error)?;

    Ok(Json(AssignmentResponse { assignment }))
}

/// GET /orgs/{org}/assignments/{id}/summary
async fn assignment_summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    let summary = state
        .workflow
        .get_assignment_summary(&ctx, &Id::from_string(id))
        .await
        .map_err(workflow_error)?;

    Ok(Json(SummaryResponse { summary }))
}

/// GET /orgs/{org}/assignments/{id}/history
async fn attempt_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    let attempts = state
        .workflow
        .list_attempt_history(&ctx, &Id::from_string(id))
        .await
        .map_err(workflow_error)?;

    Ok(Json(HistoryResponse { attempts }))
}

/// GET /orgs/{org}/assignments/{id}/events
async fn list_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((org, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = context(&state, &headers, &org).await?;
    let events = state
        .workflow
        .list_events(&ctx, &Id::from_string(id))
        .await
        .map_err(workflow_error)?;

    Ok(Json(ListEventsResponse { events }))
}
