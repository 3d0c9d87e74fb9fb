//! HTTP API over the conversation forest.
//!
//! Every request is scoped to the owner named by the `X-User-Id` header,
//! falling back to the configured default owner.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;

use crate::ai_client::{ModelClient, ModelInfo};
use crate::db::{Database, Folder, Node, NodeView};
use crate::error::GraphError;
use crate::mutation::{DeleteMode, DeleteOutcome, MutationEngine, NodeMove};
use crate::resolver::{Direction, TreeResolver};
use crate::session::{GenerationRequest, GenerationSession, SessionEvent, SessionHandle, SessionState};

pub const OWNER_HEADER: &str = "x-user-id";

const DEFAULT_LIST_LIMIT: u32 = 100;
const MAX_LIST_LIMIT: u32 = 1000;
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

// ============================================================================
// AppState
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    db: Arc<Database>,
    resolver: Arc<TreeResolver>,
    mutations: Arc<MutationEngine>,
    sessions: Arc<GenerationSession>,
    default_owner: String,
    start_time: Instant,
}

impl AppState {
    pub fn new(
        db: Arc<Database>,
        model: Arc<dyn ModelClient>,
        default_model: impl Into<String>,
        default_owner: impl Into<String>,
    ) -> Self {
        let resolver = Arc::new(TreeResolver::new(db.clone()));
        Self {
            mutations: Arc::new(MutationEngine::new(resolver.clone())),
            sessions: Arc::new(GenerationSession::new(resolver.clone(), model, default_model)),
            resolver,
            db,
            default_owner: default_owner.into(),
            start_time: Instant::now(),
        }
    }

    fn owner(&self, headers: &HeaderMap) -> String {
        headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.default_owner.clone())
    }
}

// ============================================================================
// Error type
// ============================================================================

pub struct AppError(StatusCode, String, &'static str);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({"error": self.1, "kind": self.2}))).into_response()
    }
}

impl From<GraphError> for AppError {
    fn from(e: GraphError) -> Self {
        let status = match &e {
            GraphError::NotFound { .. } | GraphError::ParentNotFound(_) => StatusCode::NOT_FOUND,
            GraphError::Validation(_) => StatusCode::BAD_REQUEST,
            GraphError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GraphError::Integrity(_)
            | GraphError::Storage(_)
            | GraphError::Serialization(_)
            | GraphError::Poisoned => {
                tracing::error!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError(status, e.reason(), e.kind())
    }
}

fn bad_request(msg: impl Into<String>) -> AppError {
    AppError(StatusCode::BAD_REQUEST, msg.into(), "ValidationError")
}

// ============================================================================
// Request / Response types
// ============================================================================

#[derive(Deserialize)]
struct CreateQuery {
    stream: Option<bool>,
}

#[derive(Serialize)]
struct CreateNodeResponse {
    node: Node,
    state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize)]
struct NodesQuery {
    #[serde(rename = "folderId")]
    folder_id: Option<String>,
    #[serde(rename = "rootsOnly")]
    roots_only: Option<bool>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct DeleteQuery {
    mode: Option<String>,
}

#[derive(Deserialize)]
struct GraphQuery {
    direction: Option<String>,
    #[serde(rename = "childrenCount")]
    children_count: Option<bool>,
}

#[derive(Deserialize)]
struct CreateFolderRequest {
    #[serde(default)]
    name: String,
    #[serde(rename = "parentId")]
    parent_id: Option<String>,
}

#[derive(Deserialize)]
struct MoveFolderRequest {
    id: String,
    #[serde(rename = "parentId")]
    parent_id: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    nodes: i64,
    roots: i64,
    folders: i64,
    #[serde(rename = "uptimeSecs")]
    uptime_secs: u64,
}

// ============================================================================
// Node handlers
// ============================================================================

// POST /api/nodes
async fn create_node_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CreateQuery>,
    Json(req): Json<GenerationRequest>,
) -> Result<Response, AppError> {
    let owner = state.owner(&headers);

    if query.stream == Some(false) {
        let outcome = state.sessions.run_to_completion(&owner, req).await?;
        let body = CreateNodeResponse { node: outcome.node, state: outcome.state, error: outcome.error };
        return Ok((StatusCode::CREATED, Json(body)).into_response());
    }

    let SessionHandle { mut events, .. } = state.sessions.start(&owner, req)?;

    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            yield Ok::<Event, Infallible>(to_sse_event(event));
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

fn to_sse_event(event: SessionEvent) -> Event {
    match event {
        SessionEvent::Created { node_id, skipped_references } => Event::default()
            .event("created")
            .data(serde_json::json!({"nodeId": node_id, "skippedReferences": skipped_references}).to_string()),
        SessionEvent::Fragment(text) => Event::default().event("fragment").data(text),
        SessionEvent::Done(node) => Event::default()
            .event("done")
            .data(serde_json::to_string(&node).unwrap_or_default()),
        SessionEvent::Error { reason } => Event::default()
            .event("error")
            .data(serde_json::json!({"error": reason}).to_string()),
    }
}

// GET /api/nodes
async fn list_nodes_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<NodesQuery>,
) -> Result<Json<Vec<Node>>, AppError> {
    let owner = state.owner(&headers);
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let nodes = state.db.list_nodes(
        &owner,
        query.folder_id.as_deref(),
        query.roots_only.unwrap_or(false),
        limit,
    )?;
    Ok(Json(nodes))
}

// GET /api/nodes/{id}
async fn get_node_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Node>, AppError> {
    let owner = state.owner(&headers);
    let node = state.db.get_node(&owner, &id)?.ok_or_else(|| GraphError::node_not_found(&id))?;
    Ok(Json(node))
}

// PATCH /api/nodes/{id}
async fn patch_node_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(change): Json<NodeMove>,
) -> Result<Json<Node>, AppError> {
    let owner = state.owner(&headers);
    let node = state.mutations.move_node(&owner, &id, change)?;
    Ok(Json(node))
}

// POST /api/nodes/{id}/detach
async fn detach_node_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Node>, AppError> {
    let owner = state.owner(&headers);
    Ok(Json(state.mutations.cut_to_root(&owner, &id)?))
}

// DELETE /api/nodes/{id}?mode=single|subtree
async fn delete_node_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<DeleteOutcome>, AppError> {
    let owner = state.owner(&headers);
    let mode = match query.mode.as_deref() {
        None => DeleteMode::default(),
        Some(raw) => DeleteMode::from_str(raw)
            .ok_or_else(|| bad_request(format!("Invalid delete mode '{}', expected single or subtree", raw)))?,
    };
    Ok(Json(state.mutations.delete_node(&owner, &id, mode)?))
}

// GET /api/graph/{id}?direction=ancestors|descendants
async fn graph_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<GraphQuery>,
) -> Result<Json<Vec<NodeView>>, AppError> {
    let owner = state.owner(&headers);
    // Anything other than "ancestors" means descendants
    let direction = query
        .direction
        .as_deref()
        .and_then(Direction::from_str)
        .unwrap_or(Direction::Descendants);
    let views = state
        .resolver
        .graph(&owner, &id, direction, query.children_count.unwrap_or(false))?;
    Ok(Json(views))
}

// ============================================================================
// Folder handlers
// ============================================================================

// GET /api/folders
async fn list_folders_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Folder>>, AppError> {
    let owner = state.owner(&headers);
    Ok(Json(state.db.list_folders(&owner)?))
}

// POST /api/folders
async fn create_folder_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateFolderRequest>,
) -> Result<(StatusCode, Json<Folder>), AppError> {
    let owner = state.owner(&headers);
    let folder = state.mutations.create_folder(&owner, &req.name, req.parent_id.as_deref())?;
    Ok((StatusCode::CREATED, Json(folder)))
}

// PATCH /api/folders
async fn move_folder_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MoveFolderRequest>,
) -> Result<Json<Folder>, AppError> {
    let owner = state.owner(&headers);
    let folder = state.mutations.move_folder(&owner, &req.id, req.parent_id.as_deref())?;
    Ok(Json(folder))
}

// ============================================================================
// Misc handlers
// ============================================================================

// GET /api/models
async fn models_handler(State(state): State<AppState>) -> Json<Vec<ModelInfo>> {
    match state.sessions.model().list_models().await {
        Ok(models) => Json(models),
        Err(e) => {
            tracing::warn!(error = %e, "could not list models");
            Json(Vec::new())
        }
    }
}

// GET /health
async fn health_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<HealthResponse>, AppError> {
    let owner = state.owner(&headers);
    let (nodes, roots, folders) = state.db.get_stats(&owner)?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        nodes,
        roots,
        folders,
        uptime_secs: state.start_time.elapsed().as_secs(),
    }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/nodes", post(create_node_handler).get(list_nodes_handler))
        .route(
            "/api/nodes/{id}",
            get(get_node_handler).patch(patch_node_handler).delete(delete_node_handler),
        )
        .route("/api/nodes/{id}/detach", post(detach_node_handler))
        .route("/api/graph/{id}", get(graph_handler))
        .route(
            "/api/folders",
            get(list_folders_handler).post(create_folder_handler).patch(move_folder_handler),
        )
        .route("/api/models", get(models_handler))
        .route("/health", get(health_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
