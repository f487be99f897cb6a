//! HTTP client for the qad daemon.
//!
//! Every request carries the bearer token (when set) and the caller's
//! `X-User-Id`; paths are scoped to one organization.

use chrono::{DateTime, Utc};
use qa_core::events::Event;
use qa_core::lifecycle::AttemptRecord;
use qa_core::visibility::{Dashboard, VisibleAssignment};
use qa_core::{
    Assignment, AssignmentSummary, Member, Role, StepResult, Test, TestStatistics, TestStatus,
    TestStep,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: qad\n  → or set QAD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check QAD_TOKEN and QA_USER, or the --token and --user flags")]
    Unauthorized,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure qad is running\n  → check QAD_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

// --- Request payloads ---

#[derive(Debug, Serialize)]
pub struct PutMemberRequest {
    pub role: Role,
}

/// Test definition as read from a JSON or YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDefinition {
    /// Optional here; the `--id` flag wins when both are given.
    #[serde(default, skip_serializing)]
    pub id: Option<String>,
    pub title: String,
    pub steps: Vec<TestStep>,
    #[serde(default)]
    pub status: TestStatus,
    #[serde(default)]
    pub priority: u8,
}

#[derive(Debug, Serialize)]
pub struct CreateAssignmentRequest {
    pub assignee_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartExecutionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    assignee_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct RecordStepRequest {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
}

/// Body for save and finish. Omitted fields keep their stored values.
#[derive(Debug, Default, Serialize)]
pub struct ExecutionUpdateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// --- Response bodies ---

#[derive(Debug, Deserialize)]
struct MemberResponse {
    member: Member,
}

#[derive(Debug, Deserialize)]
struct TestResponse {
    test: Test,
}

#[derive(Debug, Deserialize)]
struct AssignmentResponse {
    assignment: Assignment,
}

#[derive(Debug, Deserialize)]
struct ListAssignmentsResponse {
    assignments: Vec<VisibleAssignment>,
}

#[derive(Debug, Deserialize)]
struct StatisticsResponse {
    statistics: TestStatistics,
}

#[derive(Debug, Deserialize)]
struct DashboardResponse {
    dashboard: Dashboard,
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    summary: AssignmentSummary,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Deserialize)]
struct ListEventsResponse {
    events: Vec<Event>,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub kind: String,
}

/// Default total timeout for the daemon readiness check.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness check.
const INITIAL_BACKOFF_MS: u64 = 200;

const USER_HEADER: &str = "x-user-id";

/// HTTP client for qad.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    org: String,
    user: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>, org: &str, user: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            org: org.to_string(),
            user: user.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Check if daemon is healthy by probing /health endpoint.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for daemon to become ready with exponential backoff.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    /// Wait for daemon to become ready with custom timeout.
    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;

                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    /// Build headers with optional auth token and the caller id.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&self.user) {
            headers.insert(HeaderName::from_static(USER_HEADER), value);
        }
        headers
    }

    /// URL under the caller's organization.
    fn org_url(&self, path: &str) -> String {
        format!(
            "{}/orgs/{}/{}",
            self.base_url,
            urlencoding::encode(&self.org),
            path
        )
    }

    /// Handle error response from API.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();

        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".to_string());

        match status {
            400 | 422 => ClientError::InvalidInput(message),
            403 => ClientError::Forbidden(message),
            404 => ClientError::NotFound(message),
            409 => ClientError::Conflict(message),
            _ => ClientError::HttpError { status, message },
        }
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self
            .http
            .get(self.org_url(path))
            .headers(self.headers())
            .send()
            .await?;
        self.decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let response = self
            .http
            .post(self.org_url(path))
            .headers(self.headers())
            .json(body)
            .send()
            .await?;
        self.decode(response).await
    }

    async fn put<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let response = self
            .http
            .put(self.org_url(path))
            .headers(self.headers())
            .json(body)
            .send()
            .await?;
        self.decode(response).await
    }

    /// PUT /orgs/{org}/members/{user}
    pub async fn put_member(&self, user_id: &str, role: Role) -> Result<Member, ClientError> {
        let path = format!("members/{}", urlencoding::encode(user_id));
        let body: MemberResponse = self.put(&path, &PutMemberRequest { role }).await?;
        Ok(body.member)
    }

    /// PUT /orgs/{org}/tests/{test}
    pub async fn put_test(&self, test_id: &str, def: &TestDefinition) -> Result<Test, ClientError> {
        let path = format!("tests/{}", urlencoding::encode(test_id));
        let body: TestResponse = self.put(&path, def).await?;
        Ok(body.test)
    }

    /// POST /orgs/{org}/tests/{test}/assignments
    pub async fn create_assignment(
        &self,
        test_id: &str,
        req: &CreateAssignmentRequest,
    ) -> Result<Assignment, ClientError> {
        let path = format!("tests/{}/assignments", urlencoding::encode(test_id));
        let body: AssignmentResponse = self.post(&path, req).await?;
        Ok(body.assignment)
    }

    /// GET /orgs/{org}/tests/{test}/assignments
    pub async fn list_assignments(
        &self,
        test_id: &str,
    ) -> Result<Vec<VisibleAssignment>, ClientError> {
        let path = format!("tests/{}/assignments", urlencoding::encode(test_id));
        let body: ListAssignmentsResponse = self.get(&path).await?;
        Ok(body.assignments)
    }

    /// POST /orgs/{org}/tests/{test}/execution
    pub async fn start_execution(
        &self,
        test_id: &str,
        assignee_id: Option<String>,
    ) -> Result<Assignment, ClientError> {
        let path = format!("tests/{}/execution", urlencoding::encode(test_id));
        let body: AssignmentResponse = self
            .post(&path, &StartExecutionRequest { assignee_id })
            .await?;
        Ok(body.assignment)
    }

    /// GET /orgs/{org}/tests/{test}/stats
    pub async fn test_statistics(&self, test_id: &str) -> Result<TestStatistics, ClientError> {
        let path = format!("tests/{}/stats", urlencoding::encode(test_id));
        let body: StatisticsResponse = self.get(&path).await?;
        Ok(body.statistics)
    }

    /// GET /orgs/{org}/tests/{test}/dashboard
    pub async fn test_dashboard(&self, test_id: &str) -> Result<Dashboard, ClientError> {
        let path = format!("tests/{}/dashboard", urlencoding::encode(test_id));
        let body: DashboardResponse = self.get(&path).await?;
        Ok(body.dashboard)
    }

    /// GET /orgs/{org}/assignments/{id}
    pub async fn get_assignment(&self, id: &str) -> Result<Assignment, ClientError> {
        let path = format!("assignments/{}", urlencoding::encode(id));
        let body: AssignmentResponse = self.get(&path).await?;
        Ok(body.assignment)
    }

    /// DELETE /orgs/{org}/assignments/{id}
    pub async fn delete_assignment(&self, id: &str) -> Result<(), ClientError> {
        let path = format!("assignments/{}", urlencoding::encode(id));
        let response = self
            .http
            .delete(self.org_url(&path))
            .headers(self.headers())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    /// PUT /orgs/{org}/assignments/{id}/steps/{index}
    pub async fn record_step(
        &self,
        id: &str,
        step_index: u32,
        status: &str,
        notes: Option<String>,
    ) -> Result<Assignment, ClientError> {
        let path = format!("assignments/{}/steps/{}", urlencoding::encode(id), step_index);
        let req = RecordStepRequest {
            status: status.to_string(),
            notes,
        };
        let body: AssignmentResponse = self.put(&path, &req).await?;
        Ok(body.assignment)
    }

    /// POST /orgs/{org}/assignments/{id}/save
    pub async fn save_progress(
        &self,
        id: &str,
        req: &ExecutionUpdateRequest,
    ) -> Result<Assignment, ClientError> {
        let path = format!("assignments/{}/save", urlencoding::encode(id));
        let body: AssignmentResponse = self.post(&path, req).await?;
        Ok(body.assignment)
    }

    /// POST /orgs/{org}/assignments/{id}/finish
    pub async fn finish(
        &self,
        id: &str,
        req: &ExecutionUpdateRequest,
    ) -> Result<Assignment, ClientError> {
        let path = format!("assignments/{}/finish", urlencoding::encode(id));
        let body: AssignmentResponse = self.post(&path, req).await?;
        Ok(body.assignment)
    }

    /// POST /orgs/{org}/assignments/{id}/reassign
    pub async fn reassign(&self, id: &str) -> Result<Assignment, ClientError> {
        let path = format!("assignments/{}/reassign", urlencoding::encode(id));
        let body: AssignmentResponse = self.post(&path, &serde_json::json!({})).await?;
        Ok(body.assignment)
    }

    /// GET /orgs/{org}/assignments/{id}/summary
    pub async fn summary(&self, id: &str) -> Result<AssignmentSummary, ClientError> {
        let path = format!("assignments/{}/summary", urlencoding::encode(id));
        let body: SummaryResponse = self.get(&path).await?;
        Ok(body.summary)
    }

    /// GET /orgs/{org}/assignments/{id}/history
    pub async fn history(&self, id: &str) -> Result<Vec<AttemptRecord>, ClientError> {
        let path = format!("assignments/{}/history", urlencoding::encode(id));
        let body: HistoryResponse = self.get(&path).await?;
        Ok(body.attempts)
    }

    /// GET /orgs/{org}/assignments/{id}/events
    pub async fn events(&self, id: &str) -> Result<Vec<Event>, ClientError> {
        let path = format!("assignments/{}/events", urlencoding::encode(id));
        let body: ListEventsResponse = self.get(&path).await?;
        Ok(body.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::new("http://127.0.0.1:7710/", Some("secret"), "acme corp", "alice")
    }

    #[test]
    fn org_url_encodes_org_and_trims_base() {
        let c = client();
        assert_eq!(
            c.org_url("tests/t1/stats"),
            "http://127.0.0.1:7710/orgs/acme%20corp/tests/t1/stats"
        );
    }

    #[test]
    fn headers_carry_token_and_user() {
        let headers = client().headers();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer secret");
        assert_eq!(headers.get(USER_HEADER).unwrap(), "alice");
    }

    #[test]
    fn execution_update_omits_missing_fields() {
        let json = serde_json::to_string(&ExecutionUpdateRequest::default()).unwrap();
        assert_eq!(json, "{}");

        let json = serde_json::to_string(&ExecutionUpdateRequest {
            steps: None,
            notes: Some("done".to_string()),
        })
        .unwrap();
        assert_eq!(json, r#"{"notes":"done"}"#);
    }

    #[test]
    fn test_definition_body_has_no_id() {
        let def = TestDefinition {
            id: Some("t1".to_string()),
            title: "Login".to_string(),
            steps: vec![],
            status: TestStatus::Active,
            priority: 1,
        };
        let json = serde_json::to_value(&def).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["status"], "active");
    }

    #[tokio::test]
    async fn readiness_check_times_out() {
        // Nothing listens on port 9 on a test host.
        let c = Client::new("http://127.0.0.1:9", None, "acme", "alice");
        let result = c.wait_for_ready_with_timeout(50).await;
        assert!(matches!(result, Err(ClientError::DaemonNotReady { .. })));
    }
}
