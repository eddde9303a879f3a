//! REST facade for MpiJob management
//!
//! A thin HTTP layer over the MpiJob API: submit, list, inspect, delete,
//! stream logs, and restart failed jobs. No lifecycle logic lives here; the
//! admission webhook gates what is stored and the controller owns status.
//!
//! CRUD calls run under a 30 second deadline, log retrieval under 5 minutes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::io::ReaderStream;
use tracing::{info, instrument, warn};

use crate::crd::{JobConditionType, MpiJob, ReplicaType};
use crate::{resources, Error};

const CRUD_DEADLINE: Duration = Duration::from_secs(30);
const LOG_DEADLINE: Duration = Duration::from_secs(300);

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    /// Kubernetes client for API operations
    pub client: Client,
}

/// Build the management API router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/api/v1/namespaces/{ns}/mpijobs",
            get(list_jobs).post(create_job),
        )
        .route(
            "/api/v1/namespaces/{ns}/mpijobs/{name}",
            get(get_job).delete(delete_job),
        )
        .route("/api/v1/namespaces/{ns}/mpijobs/{name}/status", get(job_status))
        .route(
            "/api/v1/namespaces/{ns}/mpijobs/{name}/logs/launcher",
            get(launcher_logs),
        )
        .route(
            "/api/v1/namespaces/{ns}/mpijobs/{name}/logs/worker/{index}",
            get(worker_logs),
        )
        .route(
            "/api/v1/namespaces/{ns}/mpijobs/{name}/restart",
            post(restart_job),
        )
        .with_state(state)
}

/// Start the management API server
pub async fn start_api_server(addr: SocketAddr, client: Client) -> Result<(), Error> {
    let app = router(ApiState { client });
    info!(addr = %addr, "starting management API");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("API listener: {e}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::config(format!("API server: {e}")))
}

// =============================================================================
// Error mapping
// =============================================================================

/// Handler-level error with an HTTP status
enum ApiError {
    /// The deadline for the operation elapsed
    Timeout,
    /// An operator error, mapped by variant
    Op(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Op(e)
    }
}

impl From<kube::Error> for ApiError {
    fn from(e: kube::Error) -> Self {
        ApiError::Op(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "deadline elapsed".to_string()),
            ApiError::Op(Error::Validation(msg)) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Op(Error::Kube(kube::Error::Api(ae))) => (
                StatusCode::from_u16(ae.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                ae.message,
            ),
            ApiError::Op(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

async fn within<T, F>(deadline: Duration, fut: F) -> Result<T, ApiError>
where
    F: std::future::Future<Output = Result<T, ApiError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Timeout),
    }
}

// =============================================================================
// CRUD handlers
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    label_selector: Option<String>,
    limit: Option<u32>,
    #[serde(rename = "continue")]
    continue_token: Option<String>,
}

#[instrument(skip(state))]
async fn list_jobs(
    State(state): State<ApiState>,
    Path(ns): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    within(CRUD_DEADLINE, async move {
        let api: Api<MpiJob> = Api::namespaced(state.client.clone(), &ns);
        let mut params = ListParams::default();
        if let Some(selector) = query.label_selector {
            params = params.labels(&selector);
        }
        if let Some(limit) = query.limit {
            params = params.limit(limit);
        }
        if let Some(token) = query.continue_token {
            params = params.continue_token(&token);
        }
        let list = api.list(&params).await?;
        Ok(Json(list).into_response())
    })
    .await
}

#[instrument(skip(state, job), fields(job = %job.name_any()))]
async fn create_job(
    State(state): State<ApiState>,
    Path(ns): Path<String>,
    Json(job): Json<MpiJob>,
) -> Result<Response, ApiError> {
    within(CRUD_DEADLINE, async move {
        if job.metadata.name.as_deref().unwrap_or("").is_empty() {
            return Err(Error::validation("metadata.name is required").into());
        }
        // Role presence only; the admission webhook runs the full battery.
        for role in [ReplicaType::Launcher, ReplicaType::Worker] {
            if !job.spec.replica_specs.contains_key(&role) {
                return Err(
                    Error::validation(format!("replicaSpecs must define the {role} role")).into(),
                );
            }
        }
        let api: Api<MpiJob> = Api::namespaced(state.client.clone(), &ns);
        let created = api.create(&PostParams::default(), &job).await?;
        Ok((StatusCode::CREATED, Json(created)).into_response())
    })
    .await
}

#[instrument(skip(state))]
async fn get_job(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    within(CRUD_DEADLINE, async move {
        let api: Api<MpiJob> = Api::namespaced(state.client.clone(), &ns);
        let job = api.get(&name).await?;
        Ok(Json(job).into_response())
    })
    .await
}

#[instrument(skip(state))]
async fn delete_job(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    within(CRUD_DEADLINE, async move {
        let api: Api<MpiJob> = Api::namespaced(state.client.clone(), &ns);
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            // Deleting an already absent job is success
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        Ok(StatusCode::NO_CONTENT.into_response())
    })
    .await
}

#[instrument(skip(state))]
async fn job_status(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    within(CRUD_DEADLINE, async move {
        let api: Api<MpiJob> = Api::namespaced(state.client.clone(), &ns);
        let job = api.get(&name).await?;
        let status = job.status.clone().unwrap_or_default();
        let body = serde_json::json!({
            "name": name,
            "namespace": ns,
            "phase": status.phase(),
            "workers": status.worker_summary(),
            "durationSeconds": status.duration().map(|d| d.num_seconds()),
            "status": status,
        });
        Ok(Json(body).into_response())
    })
    .await
}

// =============================================================================
// Log handlers
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogQuery {
    follow: Option<bool>,
    tail_lines: Option<i64>,
    since_seconds: Option<i64>,
}

impl LogQuery {
    fn to_params(&self) -> LogParams {
        LogParams {
            follow: self.follow.unwrap_or(false),
            tail_lines: self.tail_lines,
            since_seconds: self.since_seconds,
            ..Default::default()
        }
    }
}

#[instrument(skip(state))]
async fn launcher_logs(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    pod_logs(state, ns, resources::launcher_pod_name(&name), query).await
}

#[instrument(skip(state))]
async fn worker_logs(
    State(state): State<ApiState>,
    Path((ns, name, index)): Path<(String, String, i32)>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    pod_logs(state, ns, resources::worker_pod_name(&name, index), query).await
}

/// Pass-through to the per-pod log endpoint
///
/// Follow requests stream the body for as long as the client holds the
/// connection; plain requests return the buffered log under the deadline.
/// Aggregating logs across all pods of a job is not offered here.
async fn pod_logs(
    state: ApiState,
    ns: String,
    pod_name: String,
    query: LogQuery,
) -> Result<Response, ApiError> {
    let api: Api<Pod> = Api::namespaced(state.client.clone(), &ns);
    let params = query.to_params();

    if params.follow {
        let reader = api
            .log_stream(&pod_name, &params)
            .await
            .map_err(ApiError::from)?;
        // log_stream yields a futures-io reader; bridge it into tokio's
        // AsyncRead before chunking it onto the response body.
        return Ok(Body::from_stream(ReaderStream::new(reader.compat())).into_response());
    }

    within(LOG_DEADLINE, async move {
        let logs = api.logs(&pod_name, &params).await?;
        Ok(logs.into_response())
    })
    .await
}

// =============================================================================
// Restart
// =============================================================================

/// Restart a failed job as a fresh copy
///
/// Permitted only in the terminal Failed state. The original is deleted and
/// the spec resubmitted under `{name}-retry-{unix}` with identity and status
/// cleared, giving the retry a clean lifecycle from admission onward.
#[instrument(skip(state))]
async fn restart_job(
    State(state): State<ApiState>,
    Path((ns, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    within(CRUD_DEADLINE, async move {
        let api: Api<MpiJob> = Api::namespaced(state.client.clone(), &ns);
        let job = api.get(&name).await?;

        let failed = job
            .status
            .as_ref()
            .is_some_and(|s| s.has_condition(JobConditionType::Failed));
        if !failed {
            return Err(Error::validation(format!(
                "job {name} is not in a Failed state, refusing to restart"
            ))
            .into());
        }

        let retry = build_retry_job(&job);
        let retry_name = retry.name_any();
        api.delete(&name, &DeleteParams::default()).await?;
        let created = api.create(&PostParams::default(), &retry).await?;
        info!(original = %name, retry = %retry_name, "restarted failed job");
        Ok((StatusCode::CREATED, Json(created)).into_response())
    })
    .await
}

fn build_retry_job(job: &MpiJob) -> MpiJob {
    let mut retry = MpiJob::new(
        &format!("{}-retry-{}", job.name_any(), Utc::now().timestamp()),
        job.spec.clone(),
    );
    retry.metadata.namespace = job.namespace();
    retry.metadata.labels = job.metadata.labels.clone();
    retry.metadata.annotations = job.metadata.annotations.clone();
    if retry.metadata.labels.is_none() {
        warn!(job = %job.name_any(), "restarting a job without labels");
    }
    retry
}
