//! Admin HTTP surface: JSON in, JSON out.
//!
//! Validation errors map to 400, unknown ids to 404, operations that the
//! job's current state forbids to 409.

use super::admin::{Admin, ExecuteNow, JobPage, LogPage, SessionInfo};
use super::scheduler::SchedulerStatus;
use crate::error::Error;
use crate::schema::{
    DeliveryLog, DeliveryOutcome, Job, JobKind, JobStatus, MessageRef, MessageTemplate, NewJob,
    RetrySettings, TemplateInput,
};
use crate::services::LogStats;
use crate::store::JobStats;
use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "http: request failed");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Error::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for Error {
    fn from(rejection: QueryRejection) -> Self {
        Error::validation(rejection.body_text())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

type ApiResult<T> = Result<Json<T>, Error>;

/// Extractors whose rejections still answer with an `{ "error": ... }` body.
type JsonBody<T> = Result<Json<T>, JsonRejection>;
type QueryParams<T> = Result<Query<T>, QueryRejection>;

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub session_ref: String,
    pub destination: String,
    #[serde(default)]
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: JobKind,
    #[serde(default)]
    pub interval_days: Option<i32>,
    pub send_at: DateTime<Utc>,
}

fn default_kind() -> JobKind {
    JobKind::Once
}

impl From<CreateJobRequest> for NewJob {
    fn from(req: CreateJobRequest) -> Self {
        NewJob {
            session_ref: req.session_ref,
            destination: req.destination,
            message: MessageRef {
                template_id: req.template_id,
                text: req.text,
            },
            kind: req.kind,
            interval_days: req.interval_days,
            send_at: req.send_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<JobStatus>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub status: Option<DeliveryOutcome>,
    pub session: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteQuery {
    /// Run the executor right away instead of waiting for the next tick.
    pub run: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub scheduler: SchedulerStatus,
}

async fn create_job(
    State(admin): State<Admin>,
    body: JsonBody<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>), Error> {
    let Json(body) = body?;
    let job = admin.create_job(body.into()).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn update_job(
    State(admin): State<Admin>,
    Path(id): Path<Uuid>,
    body: JsonBody<CreateJobRequest>,
) -> ApiResult<Job> {
    let Json(body) = body?;
    Ok(Json(admin.update_job(id, body.into()).await?))
}

async fn list_jobs(State(admin): State<Admin>, q: QueryParams<ListQuery>) -> ApiResult<JobPage> {
    let Query(q) = q?;
    Ok(Json(admin.list_jobs(q.status, q.page, q.limit).await?))
}

async fn job_stats(State(admin): State<Admin>) -> ApiResult<JobStats> {
    Ok(Json(admin.job_stats().await?))
}

async fn get_job(State(admin): State<Admin>, Path(id): Path<Uuid>) -> ApiResult<Job> {
    Ok(Json(admin.get_job(id).await?))
}

async fn delete_job(State(admin): State<Admin>, Path(id): Path<Uuid>) -> Result<StatusCode, Error> {
    admin.delete_job(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn execute_now(
    State(admin): State<Admin>,
    Path(id): Path<Uuid>,
    q: QueryParams<ExecuteQuery>,
) -> ApiResult<ExecuteNow> {
    let Query(q) = q?;
    Ok(Json(admin.execute_now(id, q.run.unwrap_or(true)).await?))
}

async fn job_history(State(admin): State<Admin>, Path(id): Path<Uuid>) -> ApiResult<Vec<DeliveryLog>> {
    Ok(Json(admin.job_history(id).await?))
}

async fn get_settings(State(admin): State<Admin>) -> ApiResult<RetrySettings> {
    Ok(Json(admin.retry_settings().await?))
}

async fn put_settings(
    State(admin): State<Admin>,
    body: JsonBody<RetrySettings>,
) -> ApiResult<RetrySettings> {
    let Json(body) = body?;
    Ok(Json(admin.update_retry_settings(body).await?))
}

async fn list_templates(State(admin): State<Admin>) -> ApiResult<Vec<MessageTemplate>> {
    Ok(Json(admin.list_templates().await?))
}

async fn create_template(
    State(admin): State<Admin>,
    body: JsonBody<TemplateInput>,
) -> Result<(StatusCode, Json<MessageTemplate>), Error> {
    let Json(body) = body?;
    let template = admin.create_template(body).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn get_template(
    State(admin): State<Admin>,
    Path(id): Path<Uuid>,
) -> ApiResult<MessageTemplate> {
    Ok(Json(admin.get_template(id).await?))
}

async fn update_template(
    State(admin): State<Admin>,
    Path(id): Path<Uuid>,
    body: JsonBody<TemplateInput>,
) -> ApiResult<MessageTemplate> {
    let Json(body) = body?;
    Ok(Json(admin.update_template(id, body).await?))
}

async fn delete_template(
    State(admin): State<Admin>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Error> {
    admin.delete_template(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_logs(State(admin): State<Admin>, q: QueryParams<LogQuery>) -> ApiResult<LogPage> {
    let Query(q) = q?;
    Ok(Json(admin.list_logs(q.status, q.session, q.page, q.limit).await?))
}

async fn log_stats(State(admin): State<Admin>) -> ApiResult<LogStats> {
    Ok(Json(admin.log_stats().await?))
}

async fn list_sessions(State(admin): State<Admin>) -> Json<Vec<SessionInfo>> {
    Json(admin.list_sessions().await)
}

async fn disconnect_session(
    State(admin): State<Admin>,
    Path(name): Path<String>,
) -> Result<StatusCode, Error> {
    admin.disconnect_session(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health(State(admin): State<Admin>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        scheduler: admin.scheduler_status(),
    })
}

pub fn router(admin: Admin) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/stats", get(job_stats))
        .route("/jobs/{id}", get(get_job).put(update_job).delete(delete_job))
        .route("/jobs/{id}/execute", post(execute_now))
        .route("/jobs/{id}/history", get(job_history))
        .route("/templates", get(list_templates).post(create_template))
        .route(
            "/templates/{id}",
            get(get_template).put(update_template).delete(delete_template),
        )
        .route("/logs", get(list_logs))
        .route("/logs/stats", get(log_stats))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{name}", delete(disconnect_session))
        .with_state(admin)
}

/// Serve the admin API until `shutdown` fires; in-flight requests complete first.
pub async fn serve(
    listener: TcpListener,
    admin: Admin,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "http: admin api listening");
    }
    axum::serve(listener, router(admin))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("http: admin api stopped");
    Ok(())
}
