/**
 * HTTP API - Read-only view of the aggregated tree + authority admin
 *
 * ROLE: Query surface for operators, dashboards and parent nodes polling us.
 *
 * ROUTES:
 * - GET /?depth=N             full snapshot (what pollers fetch)
 * - GET /status, /uuids, /remotes[/...], /groups[/...]
 * - GET /authority, POST /authority/allow/{uuid}, /authority/revoke/{uuid}
 *
 * SECURITY:
 * - Only the /authority routes require the x-api-key header
 * - No configured key means the admin routes are closed
 */

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{info, warn};
use vigil_core::{GroupSummary, Node, ProbeResult};

use crate::authority::{Authority, AuthorityError, Clients};
use crate::mesh::Mesh;

#[derive(Clone)]
pub struct AppState {
    pub mesh: Mesh,
    pub authority: Option<Arc<Authority>>,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DepthParams {
    #[serde(default)]
    depth: i32,
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("VIGIL_API_KEY not set, admin access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "rejected admin request with bad api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    let admin = Router::new()
        .route("/authority", get(list_clients))
        .route("/authority/allow/{uuid}", post(allow_client))
        .route("/authority/revoke/{uuid}", post(revoke_client))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), require_api_key));

    Router::new()
        .route("/", get(snapshot))
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(global_status))
        .route("/uuids", get(list_uuids))
        .route("/remotes", get(list_remotes))
        .route("/remotes/{hostname}", get(get_remote))
        .route("/remotes/{hostname}/status", get(get_remote_status))
        .route("/remotes/{hostname}/probes", get(list_remote_probes))
        .route("/remotes/{hostname}/probes/{probe}", get(get_remote_probe))
        .route("/remotes/{hostname}/probes/{probe}/status", get(get_remote_probe_status))
        .route("/groups", get(list_groups))
        .route("/groups/{group}", get(get_group))
        .merge(admin)
        .with_state(app_state)
}

// GET /?depth=N
async fn snapshot(State(app): State<AppState>, Query(params): Query<DepthParams>) -> Json<Node> {
    Json(app.mesh.serialize(params.depth))
}

async fn global_status(State(app): State<AppState>) -> Json<i32> {
    Json(app.mesh.read(|root| root.global_status))
}

async fn list_uuids(State(app): State<AppState>) -> Json<Vec<String>> {
    Json(app.mesh.read(|root| root.list_uuids()))
}

async fn list_remotes(State(app): State<AppState>) -> Json<Vec<String>> {
    Json(app.mesh.read(|root| root.list_hostnames()))
}

fn find_remote<R>(app: &AppState, hostname: &str, view: impl FnOnce(&Node) -> Option<R>) -> Result<R, StatusCode> {
    app.mesh
        .read(|root| root.find_by_hostname(hostname).and_then(view))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_remote(State(app): State<AppState>, Path(hostname): Path<String>) -> Result<Json<Node>, StatusCode> {
    find_remote(&app, &hostname, |node| Some(node.clone())).map(Json)
}

async fn get_remote_status(State(app): State<AppState>, Path(hostname): Path<String>) -> Result<Json<i32>, StatusCode> {
    find_remote(&app, &hostname, |node| Some(node.global_status)).map(Json)
}

async fn list_remote_probes(
    State(app): State<AppState>,
    Path(hostname): Path<String>,
) -> Result<Json<Vec<String>>, StatusCode> {
    find_remote(&app, &hostname, |node| Some(node.local_host.probes.keys().cloned().collect())).map(Json)
}

async fn get_remote_probe(
    State(app): State<AppState>,
    Path((hostname, probe)): Path<(String, String)>,
) -> Result<Json<ProbeResult>, StatusCode> {
    find_remote(&app, &hostname, |node| node.local_host.probes.get(&probe).cloned()).map(Json)
}

async fn get_remote_probe_status(
    State(app): State<AppState>,
    Path((hostname, probe)): Path<(String, String)>,
) -> Result<Json<i32>, StatusCode> {
    find_remote(&app, &hostname, |node| node.local_host.probes.get(&probe).map(|p| p.status)).map(Json)
}

async fn list_groups(State(app): State<AppState>) -> Json<Vec<String>> {
    Json(app.mesh.read(|root| root.list_groups()))
}

async fn get_group(State(app): State<AppState>, Path(group): Path<String>) -> Result<Json<GroupSummary>, StatusCode> {
    let summary = app.mesh.read(|root| root.group_summary(&group));
    if summary.hosts.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(summary))
}

fn authority(app: &AppState) -> Result<&Arc<Authority>, StatusCode> {
    app.authority.as_ref().ok_or(StatusCode::NOT_FOUND)
}

fn admin_error(e: AuthorityError) -> StatusCode {
    match e {
        AuthorityError::UnknownUuid(_) => StatusCode::NOT_FOUND,
        e => {
            warn!(error = %e, "authority operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// GET /authority
async fn list_clients(State(app): State<AppState>) -> Result<Json<Clients>, StatusCode> {
    Ok(Json(authority(&app)?.clients()))
}

// POST /authority/allow/{uuid}
async fn allow_client(State(app): State<AppState>, Path(uuid): Path<String>) -> Result<StatusCode, StatusCode> {
    authority(&app)?.allow_client(&uuid).map_err(admin_error)?;
    info!(uuid = %uuid, "client allowed through admin API");
    Ok(StatusCode::NO_CONTENT)
}

// POST /authority/revoke/{uuid}
async fn revoke_client(State(app): State<AppState>, Path(uuid): Path<String>) -> Result<StatusCode, StatusCode> {
    authority(&app)?.revoke_client(&uuid).map_err(admin_error)?;
    info!(uuid = %uuid, "client revoked through admin API");
    Ok(StatusCode::NO_CONTENT)
}
