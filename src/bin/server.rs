//! HTTP/WS binary: wires `Config`, `ProtectedStorage`, `Hub` and
//! `ThumbnailStore` into a runnable `axum::Router`
//! (`ServerState`/`build_router`/`AppError`/`install_tracing_subscriber`/
//! `shutdown_signal`).

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, EnvFilter};

use diagramhub::auth::{AuthOutcome, AuthVerifier, DevAuthVerifier, Identity};
use diagramhub::error::StorageError;
use diagramhub::hub::{Connection, ConnectionId, Hub};
use diagramhub::protected::ProtectedStorage;
use diagramhub::spec::{DiagramSpec, DiagramType};
use diagramhub::storage::{ListFilter, Permission, Share, SortBy, SortOrder, Storage, UpdateOutcome};
use diagramhub::thumbnails::ThumbnailStore;
use diagramhub::Config;

/// Gates `details` in the API error envelope (§6.3). Set once at startup;
/// `IntoResponse` has no access to `AppState`, so this follows the same
/// `OnceLock`-backed pattern as `install_tracing_subscriber` for process-wide,
/// set-once configuration.
static DEV_MODE: OnceLock<bool> = OnceLock::new();

type AppState = Arc<ServerState>;

struct ServerState {
    storage: Arc<ProtectedStorage>,
    hub: Arc<Hub>,
    thumbnails: Arc<ThumbnailStore>,
    auth: Arc<dyn AuthVerifier>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_tracing_subscriber();

    let config = Config::from_env()?;
    DEV_MODE.set(config.dev_mode).ok();

    std::fs::create_dir_all(&config.data_dir)?;
    let thumbnails = Arc::new(ThumbnailStore::open(config.thumbnails_dir())?);
    let storage = Storage::open(&config.db_path(), thumbnails.clone(), config.quota).await?;
    let storage = Arc::new(ProtectedStorage::new(storage));
    let hub = Arc::new(Hub::new(storage.clone()));
    let auth: Arc<dyn AuthVerifier> = Arc::new(DevAuthVerifier);

    let state: AppState = Arc::new(ServerState { storage, hub: hub.clone(), thumbnails: thumbnails.clone(), auth });

    spawn_background_tasks(thumbnails, state.storage.clone(), hub.clone());

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, data_dir = %config.data_dir.display(), "diagram workbench server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;
    Ok(())
}

fn spawn_background_tasks(thumbnails: Arc<ThumbnailStore>, storage: Arc<ProtectedStorage>, hub: Arc<Hub>) {
    // Thumbnail orphan reaper: one sweep 30s after start, then hourly (§4.3, §8 scenario 6).
    // "Orphan" is judged against the diagrams table, not against the thumbnail
    // directory's own listing — the latter would never flag anything.
    tokio::spawn({
        let thumbnails = thumbnails.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            loop {
                match storage.list(None).await {
                    Ok(diagrams) => {
                        let existing: std::collections::HashSet<String> =
                            diagrams.into_iter().map(|d| d.id).collect();
                        match thumbnails.cleanup_orphans(&existing, diagramhub::thumbnails::ORPHAN_GRACE) {
                            Ok(deleted) if !deleted.is_empty() => {
                                tracing::info!(count = deleted.len(), "reaped orphan thumbnails")
                            }
                            Ok(_) => {}
                            Err(err) => tracing::warn!(?err, "thumbnail reaper sweep failed"),
                        }
                    }
                    Err(err) => tracing::warn!(?err, "thumbnail reaper diagram listing failed"),
                }
                tokio::time::sleep(Duration::from_secs(60 * 60)).await;
            }
        }
    });

    // Hub presence reaper: half the presence timeout, per §4.7 `CleanupInactive`.
    tokio::spawn(async move {
        let interval = diagramhub::hub::PRESENCE_TIMEOUT / 2;
        loop {
            tokio::time::sleep(interval).await;
            hub.cleanup_inactive();
        }
    });
}

async fn shutdown_signal(hub: Arc<Hub>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => tracing::error!(?err, "failed to listen for shutdown signal"),
    }
    hub.close_all("server shutting down");
}

fn install_tracing_subscriber() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt().with_env_filter(filter).try_init();
    });
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(stats_handler))
        .route("/diagrams", post(create_diagram).get(list_diagrams))
        .route("/diagrams/:id", get(get_diagram).put(update_diagram).delete(delete_diagram))
        .route("/diagrams/:id/fork", post(fork_diagram))
        .route("/diagrams/:id/owner", put(set_owner))
        .route("/diagrams/:id/public", put(set_public))
        .route("/diagrams/:id/shares", get(list_shares).put(replace_shares).post(add_share))
        .route("/diagrams/:id/shares/:userId", axum::routing::delete(remove_share))
        .route("/diagrams/:id/thumbnail", get(get_thumbnail).put(put_thumbnail))
        .route("/diagrams/:id/versions", get(list_versions))
        .route("/diagrams/:id/versions/:version", get(get_version))
        .route("/diagrams/:id/restore/:version", post(restore_version))
        .route("/ws/:diagramId", get(ws_upgrade))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<AppState>) -> Result<Json<diagramhub::storage::Stats>, ApiError> {
    Ok(Json(state.storage.stats().await?))
}

// --- Diagram CRUD -----------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDiagramRequest {
    name: String,
    #[serde(default)]
    project: String,
    #[serde(rename = "type")]
    diagram_type: DiagramType,
    #[serde(default)]
    spec: Option<DiagramSpec>,
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default)]
    is_public: bool,
}

async fn create_diagram(
    State(state): State<AppState>,
    Json(req): Json<CreateDiagramRequest>,
) -> Result<Json<DiagramDto>, ApiError> {
    let spec = req.spec.unwrap_or_else(|| DiagramSpec::empty(req.diagram_type));
    let diagram = state.storage.create(req.name, req.project, spec, req.owner_id, req.is_public).await?;
    Ok(Json(DiagramDto::from(diagram)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDiagramsQuery {
    user_id: Option<String>,
    project: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    sort_by: Option<String>,
    sort_order: Option<String>,
    search: Option<String>,
    types: Option<String>,
    created_after: Option<String>,
    created_before: Option<String>,
    updated_after: Option<String>,
    updated_before: Option<String>,
}

async fn list_diagrams(
    State(state): State<AppState>,
    Query(q): Query<ListDiagramsQuery>,
) -> Result<Json<PageDto<DiagramDto>>, ApiError> {
    let mut filter = ListFilter::defaults();
    filter.project = q.project;
    if let Some(limit) = q.limit {
        filter.limit = limit;
    }
    if let Some(offset) = q.offset {
        filter.offset = offset;
    }
    filter.sort_by = q.sort_by.as_deref().map(parse_sort_by);
    filter.sort_order = q.sort_order.as_deref().map(parse_sort_order);
    filter.search = q.search;
    filter.types = q.types.map(|s| s.split(',').map(str::to_string).collect());
    filter.created_after = q.created_after;
    filter.created_before = q.created_before;
    filter.updated_after = q.updated_after;
    filter.updated_before = q.updated_before;

    let page = state.storage.list_for_user(q.user_id, filter).await?;
    Ok(Json(PageDto { data: page.data.into_iter().map(DiagramDto::from).collect(), total: page.total }))
}

fn parse_sort_by(s: &str) -> SortBy {
    match s {
        "createdAt" => SortBy::CreatedAt,
        "name" => SortBy::Name,
        _ => SortBy::UpdatedAt,
    }
}

fn parse_sort_order(s: &str) -> SortOrder {
    match s {
        "asc" => SortOrder::Asc,
        _ => SortOrder::Desc,
    }
}

async fn get_diagram(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<DiagramDto>, ApiError> {
    let diagram = state.storage.get(id).await?.ok_or(ApiError::not_found())?;
    Ok(Json(DiagramDto::from(diagram)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateDiagramRequest {
    spec: DiagramSpec,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    base_version: Option<i64>,
}

async fn update_diagram(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateDiagramRequest>,
) -> Result<Json<DiagramDto>, ApiError> {
    let outcome = state.storage.update(id.clone(), req.spec, req.message, req.base_version).await?;
    let diagram = match outcome {
        UpdateOutcome::Ok(d) => d,
        UpdateOutcome::NotFound => return Err(ApiError::not_found()),
        UpdateOutcome::Conflict { current_version } => {
            return Err(ApiError::new("VERSION_CONFLICT", format!("current version is {current_version}")))
        }
    };
    let version = diagram.version as u64;
    state.hub.broadcast_sync(&id, diagram.spec.spec.clone(), Some(version));
    Ok(Json(DiagramDto::from(diagram)))
}

async fn delete_diagram(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let deleted = state.storage.delete(id).await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForkRequest {
    name: String,
    #[serde(default)]
    project: Option<String>,
}

async fn fork_diagram(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ForkRequest>,
) -> Result<Json<DiagramDto>, ApiError> {
    let forked = state.storage.fork(id, req.name, req.project).await?.ok_or(ApiError::not_found())?;
    Ok(Json(DiagramDto::from(forked)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetOwnerRequest {
    owner_id: Option<String>,
}

async fn set_owner(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetOwnerRequest>,
) -> Result<StatusCode, ApiError> {
    ok_or_not_found(state.storage.update_owner(id, req.owner_id).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetPublicRequest {
    is_public: bool,
}

async fn set_public(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetPublicRequest>,
) -> Result<StatusCode, ApiError> {
    ok_or_not_found(state.storage.set_public(id, req.is_public).await?)
}

fn ok_or_not_found(applied: bool) -> Result<StatusCode, ApiError> {
    if applied {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found())
    }
}

async fn list_shares(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Vec<Share>>, ApiError> {
    let diagram = state.storage.get(id).await?.ok_or(ApiError::not_found())?;
    Ok(Json(diagram.shares))
}

async fn replace_shares(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(shares): Json<Vec<Share>>,
) -> Result<StatusCode, ApiError> {
    ok_or_not_found(state.storage.update_shares(id, shares).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddShareRequest {
    user_id: String,
    permission: Permission,
}

async fn add_share(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AddShareRequest>,
) -> Result<StatusCode, ApiError> {
    ok_or_not_found(state.storage.add_share(id, req.user_id, req.permission).await?)
}

async fn remove_share(
    State(state): State<AppState>,
    Path((id, user_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    ok_or_not_found(state.storage.remove_share(id, user_id).await?)
}

// --- Thumbnails ---------------------------------------------------------

async fn get_thumbnail(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    match state.thumbnails.load(&id).map_err(thumbnail_error)? {
        Some(data_url) => Ok(([("content-type", "text/plain")], data_url).into_response()),
        None => Err(ApiError::not_found()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutThumbnailRequest {
    data_url: String,
}

async fn put_thumbnail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PutThumbnailRequest>,
) -> Result<StatusCode, ApiError> {
    state.thumbnails.save(&id, &req.data_url).map_err(thumbnail_error)?;
    Ok(StatusCode::NO_CONTENT)
}

fn thumbnail_error(err: diagramhub::thumbnails::ThumbnailError) -> ApiError {
    ApiError::new("VALIDATION_ERROR", err.to_string())
}

// --- Versions -------------------------------------------------------------

async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<VersionMetaDto>>, ApiError> {
    let versions = state.storage.get_versions_metadata(id).await?;
    Ok(Json(versions.into_iter().map(VersionMetaDto::from).collect()))
}

async fn get_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, i64)>,
) -> Result<Json<VersionDto>, ApiError> {
    let version = state.storage.get_version(id, version).await?.ok_or(ApiError::not_found())?;
    Ok(Json(VersionDto::from(version)))
}

async fn restore_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, i64)>,
) -> Result<Json<DiagramDto>, ApiError> {
    let outcome = state.storage.restore_version(id, version).await?;
    match outcome {
        UpdateOutcome::Ok(d) => Ok(Json(DiagramDto::from(d))),
        UpdateOutcome::NotFound => Err(ApiError::not_found()),
        UpdateOutcome::Conflict { current_version } => {
            Err(ApiError::new("VERSION_CONFLICT", format!("current version is {current_version}")))
        }
    }
}

// --- WebSocket upgrade ----------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Path(_diagram_id): Path<String>,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    let identity = match state.auth.verify(q.token.as_deref()) {
        AuthOutcome::Anonymous => Identity::anonymous(),
        AuthOutcome::Authenticated(identity) => identity,
        AuthOutcome::Invalid => return Err(StatusCode::UNAUTHORIZED),
    };
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, identity, state)))
}

enum Outbound {
    Frame(Vec<u8>),
    Close(u16, String),
}

/// Adapts one axum [`WebSocket`] to the hub's [`Connection`] trait (C8).
///
/// `send`/`close` only enqueue onto an unbounded channel so the hub never
/// blocks on a slow peer (§4.8); a paired forwarding task drains the channel
/// onto the real socket.
struct WsConnection {
    identity: Identity,
    open: std::sync::atomic::AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Connection for WsConnection {
    fn send(&self, frame: &[u8]) {
        let _ = self.outbound.send(Outbound::Frame(frame.to_vec()));
    }

    fn close(&self, code: u16, reason: &str) {
        self.open.store(false, std::sync::atomic::Ordering::Release);
        let _ = self.outbound.send(Outbound::Close(code, reason.to_string()));
    }

    fn is_open(&self) -> bool {
        self.open.load(std::sync::atomic::Ordering::Acquire)
    }

    fn identity(&self) -> Identity {
        self.identity.clone()
    }
}

async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let forward = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let sent = match message {
                Outbound::Frame(bytes) => ws_tx.send(Message::Binary(bytes)).await,
                Outbound::Close(code, reason) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if sent.is_err() {
                break;
            }
        }
    });

    let conn: Arc<WsConnection> =
        Arc::new(WsConnection { identity, open: std::sync::atomic::AtomicBool::new(true), outbound: tx });
    let id: ConnectionId = state.hub.register(conn.clone());

    while let Some(Ok(message)) = ws_rx.next().await {
        if !conn.is_open() {
            break;
        }
        let raw = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match state.hub.check_rate_limit(id) {
            diagramhub::hub::RateLimitOutcome::Exceeded => break,
            diagramhub::hub::RateLimitOutcome::Allowed | diagramhub::hub::RateLimitOutcome::Warned(_) => {}
        }

        match diagramhub::codec::decode_client_message(&raw) {
            Ok(client_message) => state.hub.dispatch(id, client_message),
            Err(err) => {
                let frame = diagramhub::codec::encode_server_message(&diagramhub::codec::ServerMessage::error(
                    err.code(),
                    &err,
                ));
                conn.send(&frame);
            }
        }
    }

    state.hub.disconnect(id);
    forward.abort();
}

// --- DTOs and error envelope -----------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DiagramDto {
    id: String,
    name: String,
    project: String,
    spec: DiagramSpec,
    valid: bool,
    version: i64,
    owner_id: Option<String>,
    is_public: bool,
    shares: Vec<Share>,
    created_at: String,
    updated_at: String,
}

impl From<diagramhub::storage::Diagram> for DiagramDto {
    fn from(d: diagramhub::storage::Diagram) -> Self {
        Self {
            id: d.id,
            name: d.name,
            project: d.project,
            spec: d.spec.spec,
            valid: d.spec.valid,
            version: d.version,
            owner_id: d.owner_id,
            is_public: d.is_public,
            shares: d.shares,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct PageDto<T> {
    data: Vec<T>,
    total: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionDto {
    id: String,
    diagram_id: String,
    version: i64,
    spec: DiagramSpec,
    message: Option<String>,
    created_at: String,
}

impl From<diagramhub::storage::DiagramVersion> for VersionDto {
    fn from(v: diagramhub::storage::DiagramVersion) -> Self {
        Self {
            id: v.id,
            diagram_id: v.diagram_id,
            version: v.version,
            spec: v.spec.spec,
            message: v.message,
            created_at: v.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionMetaDto {
    id: String,
    diagram_id: String,
    version: i64,
    message: Option<String>,
    created_at: String,
}

impl From<diagramhub::storage::DiagramVersionMetadata> for VersionMetaDto {
    fn from(v: diagramhub::storage::DiagramVersionMetadata) -> Self {
        Self { id: v.id, diagram_id: v.diagram_id, version: v.version, message: v.message, created_at: v.created_at }
    }
}

/// The `{error:{code,message,details?}}` envelope (§6.3).
struct ApiError {
    code: String,
    message: String,
}

impl ApiError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }

    fn not_found() -> Self {
        Self::new("NOT_FOUND", "not found")
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        Self { code: err.code().to_string(), message: err.to_string() }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for_code(&self.code);
        let details = if *DEV_MODE.get().unwrap_or(&false) { Some(self.message.clone()) } else { None };
        let body = Json(serde_json::json!({ "error": ErrorBody { code: self.code, message: self.message, details } }));
        (status, body).into_response()
    }
}

fn status_for_code(code: &str) -> StatusCode {
    match code {
        "INVALID_JSON" | "VALIDATION_ERROR" | "INVALID_INPUT" | "MISSING_PARAMETER" => StatusCode::BAD_REQUEST,
        "UNAUTHORIZED" | "INVALID_TOKEN" => StatusCode::UNAUTHORIZED,
        "FORBIDDEN" | "PERMISSION_DENIED" => StatusCode::FORBIDDEN,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "VERSION_CONFLICT" | "ALREADY_EXISTS" => StatusCode::CONFLICT,
        "RATE_LIMITED" => StatusCode::TOO_MANY_REQUESTS,
        "SERVICE_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
        "BAD_GATEWAY" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
