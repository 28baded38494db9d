//! REST API
//!
//! Clusters, servers, jobs and global config under `/v1`. Failures are
//! returned as `OperationStatus` bodies with a status code derived from the
//! error kind.

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use crate::cluster::planner::{ClusterRequest, ClusterSpec, PlanError};
use crate::cluster::ports::PortError;
use crate::cluster::resources::{OperationStatus, ResourceList};
use crate::cluster::server::ServerSpec;
use crate::cluster::service::ServiceError;
use crate::cluster::store::StoreError;
use crate::config::GlobalConfig;
use crate::runtime::backup::BackupError;
use crate::runtime::jobs::JobError;
use crate::runtime::lifecycle::{LifecycleError, OperationOptions, RestoreOptions, StopOptions};
use crate::runtime::logs::LogError;
use crate::runtime::supervisor::{ServerState, ServerStatus, SupervisorError};
use crate::runtime::LifecycleOutcome;
use crate::server::state::AppState;

// ============================================================================
// SBIO: Pure error -> status mapping (no I/O)
// ============================================================================

pub fn supervisor_status(err: &SupervisorError) -> StatusCode {
    match err {
        SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
        SupervisorError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        SupervisorError::Unavailable(_) | SupervisorError::CommandFailed { .. } => StatusCode::BAD_GATEWAY,
    }
}

pub fn lifecycle_status(err: &LifecycleError) -> StatusCode {
    match err {
        LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
        LifecycleError::OperationTimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
        LifecycleError::SupervisorUnavailable(_)
        | LifecycleError::CommandFailed { .. }
        | LifecycleError::RestartIncomplete { .. } => StatusCode::BAD_GATEWAY,
        LifecycleError::ServerRunning(_) => StatusCode::CONFLICT,
        LifecycleError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        LifecycleError::Backup(BackupError::NotFound { .. } | BackupError::NoData(_)) => StatusCode::NOT_FOUND,
        LifecycleError::Backup(BackupError::InvalidLabel(_)) => StatusCode::BAD_REQUEST,
        LifecycleError::Backup(BackupError::Io(..)) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn plan_status(err: &PlanError) -> StatusCode {
    match err {
        PlanError::Port(PortError::PortConflict { .. }) | PlanError::DuplicateServerName(_) => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    }
}

pub fn service_status(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::Plan(e) => plan_status(e),
        ServiceError::Store(StoreError::Invalid(_, e)) => plan_status(e),
        ServiceError::Store(_) | ServiceError::Artifact(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ServiceError::Lifecycle(e) => lifecycle_status(e),
        ServiceError::Job(e) => job_status(e),
        ServiceError::ClusterExists(_) | ServiceError::ServerRetiring(_) | ServiceError::NotLastOfMap { .. } => {
            StatusCode::CONFLICT
        }
        ServiceError::ClusterNotFound(_) | ServiceError::ServerNotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::InstallUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub fn job_status(err: &JobError) -> StatusCode {
    match err {
        JobError::NotFound(_) => StatusCode::NOT_FOUND,
        JobError::AlreadyFinished { .. } => StatusCode::CONFLICT,
        JobError::Journal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error response: status code plus an `OperationStatus` body
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.0.is_server_error() {
            warn!("{}: {}", self.0, self.1);
        }
        (self.0, Json(OperationStatus::failure(self.1))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(service_status(&err), err.to_string())
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        ApiError(lifecycle_status(&err), err.to_string())
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        ApiError(job_status(&err), err.to_string())
    }
}

impl From<LogError> for ApiError {
    fn from(err: LogError) -> Self {
        let status = match &err {
            LogError::Supervisor(e) => supervisor_status(e),
            LogError::Io(..) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// JSON body that may be left out entirely
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError(StatusCode::BAD_REQUEST, format!("Invalid body: {}", e)))
}

// ============================================================================
// Router
// ============================================================================

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/status", get(status))
        // Clusters
        .route("/v1/clusters", get(list_clusters).post(create_cluster))
        .route("/v1/clusters/plan", post(plan_cluster))
        .route(
            "/v1/clusters/{name}",
            get(get_cluster).put(update_cluster).delete(delete_cluster),
        )
        .route("/v1/clusters/{name}/regenerate", post(regenerate_cluster))
        .route("/v1/clusters/{name}/update", post(update_cluster_servers))
        .route("/v1/update-all", post(update_all))
        // Servers
        .route("/v1/servers", get(list_servers))
        .route("/v1/servers/{name}", get(get_server).delete(delete_server))
        .route("/v1/servers/{name}/start", post(start_server))
        .route("/v1/servers/{name}/stop", post(stop_server))
        .route("/v1/servers/{name}/restart", post(restart_server))
        .route("/v1/servers/{name}/update", post(update_server))
        .route("/v1/servers/{name}/rcon", post(rcon))
        .route("/v1/servers/{name}/logs", get(server_logs))
        .route("/v1/servers/{name}/artifacts", get(server_artifacts))
        .route("/v1/servers/{name}/backups", get(list_backups).post(create_backup))
        .route("/v1/servers/{name}/restore", post(restore_backup))
        // Jobs
        .route("/v1/jobs", get(list_jobs))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/jobs/{id}/cancel", post(cancel_job))
        .route("/v1/install", post(install_binaries))
        // Global config
        .route("/v1/global", get(get_global).put(put_global))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Health & Status
// ============================================================================

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ManagerStatus {
    status: &'static str,
    clusters: usize,
    servers: usize,
    active_jobs: usize,
}

async fn status(State(state): State<AppState>) -> ApiResult<Json<ManagerStatus>> {
    let clusters = state.service.list().await?;
    let active_jobs = state
        .service
        .jobs()
        .list()
        .iter()
        .filter(|j| !j.status.is_terminal())
        .count();
    Ok(Json(ManagerStatus {
        status: "ok",
        servers: clusters.iter().map(|c| c.servers.len()).sum(),
        clusters: clusters.len(),
        active_jobs,
    }))
}

// ============================================================================
// Clusters
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct ForceQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    cluster: ClusterSpec,
    job_id: Uuid,
}

async fn list_clusters(State(state): State<AppState>) -> ApiResult<Json<ResourceList<ClusterSpec>>> {
    let clusters = state.service.list().await?;
    Ok(Json(ResourceList::new("ClusterList", clusters)))
}

async fn create_cluster(
    State(state): State<AppState>,
    Json(request): Json<ClusterRequest>,
) -> ApiResult<impl IntoResponse> {
    let (cluster, job_id) = state.service.create(request).await?;
    Ok((StatusCode::ACCEPTED, Json(CreateResponse { cluster, job_id })))
}

async fn plan_cluster(
    State(state): State<AppState>,
    Json(request): Json<ClusterRequest>,
) -> ApiResult<Json<ClusterSpec>> {
    Ok(Json(state.service.preview(&request).await?))
}

async fn get_cluster(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<ClusterSpec>> {
    Ok(Json(state.service.get(&name).await?))
}

async fn update_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
    Json(request): Json<ClusterRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.name != name {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            format!("request names cluster '{}' but path names '{}'", request.name, name),
        ));
    }
    Ok(Json(state.service.update(request, query.force).await?))
}

async fn delete_cluster(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    let cluster = state.service.delete(&name).await?;
    Ok(Json(
        OperationStatus::success(format!("Cluster '{}' deleted", name))
            .with_details(json!({ "servers": cluster.server_names() })),
    ))
}

async fn regenerate_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ForceQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.regenerate(&name, query.force).await?))
}

async fn update_cluster_servers(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job_id = state.service.update_all(Some(name)).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": job_id }))))
}

async fn update_all(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let job_id = state.service.update_all(None).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": job_id }))))
}

// ============================================================================
// Servers
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServersQuery {
    #[serde(default)]
    include_hidden: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerView {
    cluster: String,
    spec: ServerSpec,
    status: ServerStatus,
}

async fn list_servers(
    State(state): State<AppState>,
    Query(query): Query<ServersQuery>,
) -> ApiResult<Json<ResourceList<ServerStatus>>> {
    let names: Vec<String> = state
        .service
        .servers(query.include_hidden)
        .await?
        .into_iter()
        .map(|s| s.name)
        .collect();
    let statuses = state.service.orchestrator().status_all(&names).await;
    Ok(Json(ResourceList::new("ServerList", statuses)))
}

async fn get_server(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<ServerView>> {
    let (cluster, spec) = state.service.locate(&name).await?;
    let status = state
        .service
        .orchestrator()
        .status_all(std::slice::from_ref(&name))
        .await
        .pop()
        .unwrap_or_else(|| ServerStatus::new(name.clone(), ServerState::Unknown));
    Ok(Json(ServerView {
        cluster: cluster.name,
        spec,
        status,
    }))
}

async fn delete_server(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.delete_server(&name).await?))
}

fn outcome_status(action: &str, name: &str, outcome: LifecycleOutcome) -> Json<OperationStatus> {
    Json(
        OperationStatus::success(format!("{} '{}'", action, name)).with_details(json!({ "outcome": outcome })),
    )
}

async fn start_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(options): Query<OperationOptions>,
) -> ApiResult<impl IntoResponse> {
    state.service.locate(&name).await?;
    let orchestrator = state.service.orchestrator();
    let timeout = options.timeout().unwrap_or(orchestrator.config().operation_timeout());
    let outcome = orchestrator.start_with_timeout(&name, timeout).await?;
    Ok(outcome_status("Started", &name, outcome))
}

async fn stop_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(options): Query<StopOptions>,
) -> ApiResult<impl IntoResponse> {
    state.service.locate(&name).await?;
    let outcome = state.service.orchestrator().stop_with(&name, options).await?;
    Ok(outcome_status("Stopped", &name, outcome))
}

async fn restart_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(options): Query<OperationOptions>,
) -> ApiResult<impl IntoResponse> {
    state.service.locate(&name).await?;
    let orchestrator = state.service.orchestrator();
    let timeout = options.timeout().unwrap_or(orchestrator.config().operation_timeout());
    let outcome = orchestrator.restart_with_timeout(&name, timeout).await?;
    Ok(outcome_status("Restarted", &name, outcome))
}

async fn update_server(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    let report = state.service.update_server(&name).await?;
    Ok(Json(
        OperationStatus::success(format!("Updated '{}'", name)).with_details(json!({ "artifacts": report })),
    ))
}

#[derive(Debug, Deserialize)]
struct RconRequest {
    command: String,
}

async fn rcon(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<RconRequest>,
) -> ApiResult<impl IntoResponse> {
    state.service.locate(&name).await?;
    let output = state.service.orchestrator().rcon(&name, &request.command).await?;
    Ok(Json(json!({ "server": name, "output": output })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    follow: bool,
    #[serde(default = "default_tail")]
    tail: usize,
}

fn default_tail() -> usize {
    100
}

async fn server_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    state.service.locate(&name).await?;
    if query.follow {
        let stream = state
            .logs
            .subscribe(&name)
            .await?
            .map(|line| line.map(|l| format!("{}\n", l)).map_err(std::io::Error::other));
        return Ok((StatusCode::OK, Body::from_stream(stream)).into_response());
    }
    let lines = state.logs.tail(&name, query.tail).await?;
    Ok(Json(json!({ "server": name, "lines": lines })).into_response())
}

async fn server_artifacts(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.artifacts(&name).await?))
}

#[derive(Debug, Default, Deserialize)]
struct BackupRequest {
    #[serde(default)]
    label: Option<String>,
}

async fn list_backups(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    state.service.locate(&name).await?;
    let backups = state.service.orchestrator().list_backups(&name).await?;
    Ok(Json(ResourceList::new("BackupList", backups)))
}

async fn create_backup(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    state.service.locate(&name).await?;
    let request: BackupRequest = optional_body(&body)?;
    let info = state
        .service
        .orchestrator()
        .backup(&name, request.label.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    backup: String,
    #[serde(flatten)]
    options: RestoreOptions,
}

async fn restore_backup(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult<impl IntoResponse> {
    state.service.locate(&name).await?;
    let outcome = state
        .service
        .orchestrator()
        .restore(&name, &request.backup, request.options)
        .await?;
    Ok(outcome_status("Restored", &name, outcome))
}

// ============================================================================
// Jobs
// ============================================================================

async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(ResourceList::new("JobList", state.service.jobs().list()))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    state
        .service
        .jobs()
        .status(id)
        .map(Json)
        .ok_or_else(|| ApiError::from(JobError::NotFound(id)))
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.jobs().cancel(id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct InstallRequest {
    #[serde(default)]
    validate: bool,
}

async fn install_binaries(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: InstallRequest = optional_body(&body)?;
    let job_id = state.service.install_binaries(request.validate).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": job_id }))))
}

// ============================================================================
// Global config
// ============================================================================

async fn get_global(State(state): State<AppState>) -> ApiResult<Json<GlobalConfig>> {
    Ok(Json(state.service.global().await?))
}

async fn put_global(State(state): State<AppState>, Json(config): Json<GlobalConfig>) -> ApiResult<impl IntoResponse> {
    state.service.set_global(&config).await?;
    Ok(Json(OperationStatus::success("Global config updated")))
}
