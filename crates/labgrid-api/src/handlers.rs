//! REST API handlers.
//!
//! Each handler calls into the lock service or the inventory and returns the
//! `{success, data, error}` JSON envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use labgrid_scheduler::{
    ClaimRequest, MachineFilter, PublicStatus, ReleaseRequest, ReleaseTarget, SchedulerError,
    SiteUpdate,
};
use labgrid_state::split_list;
use serde::Deserialize;
use tracing::{error, warn};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Map a scheduler error onto an HTTP status.
fn scheduler_error(err: SchedulerError) -> Response {
    let status = match &err {
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        SchedulerError::NotFound { .. } => StatusCode::NOT_FOUND,
        SchedulerError::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "request failed");
    } else {
        warn!(error = %err, "request rejected");
    }
    error_response(&err.to_string(), status)
}

// ── Global resources ───────────────────────────────────────────

/// POST /api/v1/globalresources/lock
///
/// Responds with `{name, data}`, or an empty object when nothing is free.
pub async fn claim_resource(
    State(state): State<ApiState>,
    Json(req): Json<ClaimRequest>,
) -> Response {
    match state.locks.claim(&req).await {
        Ok(Some(claim)) => ApiResponse::ok(serde_json::json!(claim)).into_response(),
        Ok(None) => ApiResponse::ok(serde_json::json!({})).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// DELETE /api/v1/globalresources/lock
pub async fn release_resource(
    State(state): State<ApiState>,
    Json(req): Json<ReleaseRequest>,
) -> Response {
    let target = match ReleaseTarget::try_from(req) {
        Ok(target) => target,
        Err(e) => return scheduler_error(e),
    };
    match state.locks.release(&target).await {
        Ok(released) => ApiResponse::ok(serde_json::json!({ "released": released })).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/globalresources
pub async fn list_resources(State(state): State<ApiState>) -> Response {
    match state.locks.list() {
        Ok(resources) => ApiResponse::ok(resources).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/globalresources/{name}
pub async fn get_resource(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.locks.get(&name) {
        Ok(resource) => ApiResponse::ok(resource).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Machines ───────────────────────────────────────────────────

/// Query string for machine listings. List-valued filters are comma-separated;
/// `resource` uses the `/`-separated resource grammar.
#[derive(Debug, Default, Deserialize)]
pub struct MachineQuery {
    pub machine: Option<String>,
    pub site: Option<String>,
    pub cluster: Option<String>,
    pub pool: Option<String>,
    pub status: Option<String>,
    pub user: Option<String>,
    pub resource: Option<String>,
    pub flag: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub pseudohosts: Option<bool>,
}

impl TryFrom<MachineQuery> for MachineFilter {
    type Error = SchedulerError;

    fn try_from(q: MachineQuery) -> Result<Self, Self::Error> {
        let list = |v: &Option<String>| v.as_deref().map(split_list).unwrap_or_default();
        let statuses = list(&q.status)
            .iter()
            .map(|s| s.parse::<PublicStatus>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MachineFilter {
            names: list(&q.machine),
            sites: list(&q.site),
            clusters: list(&q.cluster),
            pools: list(&q.pool),
            statuses,
            users: list(&q.user),
            resources: q.resource,
            flags: q.flag,
            // A zero limit means "no limit".
            limit: q.limit.filter(|&n| n > 0),
            offset: q.offset.unwrap_or(0),
            pseudo_hosts: q.pseudohosts.unwrap_or(false),
        })
    }
}

/// GET /api/v1/machines
pub async fn list_machines(
    State(state): State<ApiState>,
    Query(query): Query<MachineQuery>,
) -> Response {
    let filter = match MachineFilter::try_from(query) {
        Ok(filter) => filter,
        Err(e) => return scheduler_error(e),
    };
    match state.inventory.list_machines(&filter) {
        Ok(machines) => ApiResponse::ok(machines).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/machines/{name}
pub async fn get_machine(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.inventory.machine_status(&name) {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Sites ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct SiteQuery {
    pub flag: Option<String>,
}

/// GET /api/v1/sites
pub async fn list_sites(State(state): State<ApiState>, Query(query): Query<SiteQuery>) -> Response {
    match state.inventory.list_sites(query.flag.as_deref()) {
        Ok(sites) => ApiResponse::ok(sites).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// GET /api/v1/sites/{name}
pub async fn get_site(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.inventory.get_site(&name) {
        Ok(site) => ApiResponse::ok(site).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/v1/sites/{name}
pub async fn update_site(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(update): Json<SiteUpdate>,
) -> Response {
    match state.inventory.update_site(&name, &update) {
        Ok(site) => ApiResponse::ok(site).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
pub async fn health() -> impl IntoResponse {
    ApiResponse::ok("ok")
}
