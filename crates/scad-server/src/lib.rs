use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use http::{Method, StatusCode};
use scad_ai::{ApiKey, LanguageModel, ScriptGenerator};
use scad_compiler::{CompiledMesh, ScadCompiler};
use scad_mesh::{MeshFormat, MeshStats, parse_stl};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub mod config;
pub mod pipeline;
pub mod session;

use session::{Failure, RequestRecord, RequestState, Session, SessionLimits, SessionStore};

const INDEX_HTML: &str = include_str!("../assets/index.html");

struct Shared<M: LanguageModel> {
    generator: ScriptGenerator<M>,
    compiler: ScadCompiler,
    sessions: SessionStore,
    default_key: Option<ApiKey>,
    shutdown: Notify,
}

/// Everything a handler needs, shared across connections.
pub struct AppState<M: LanguageModel> {
    shared: Arc<Shared<M>>,
}

impl<M: LanguageModel> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: LanguageModel> AppState<M> {
    pub fn new(
        generator: ScriptGenerator<M>,
        compiler: ScadCompiler,
        default_key: Option<ApiKey>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                generator,
                compiler,
                sessions: SessionStore::new(limits),
                default_key,
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn generator(&self) -> &ScriptGenerator<M> {
        &self.shared.generator
    }

    pub fn compiler(&self) -> &ScadCompiler {
        &self.shared.compiler
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.shared.sessions
    }

    /// Cancels every compile that is currently running.
    pub fn shutdown(&self) {
        self.shared.shutdown.notify_waiters();
    }

    /// Ends idle sessions every `every` until the returned task is aborted.
    pub fn spawn_reaper(&self, every: Duration) -> JoinHandle<()>
    where
        M: 'static,
    {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let reaped = state.sessions().reap_idle().await;
                if reaped > 0 {
                    let live = state.sessions().len().await;
                    tracing::info!(reaped, live, "reaped idle sessions");
                }
            }
        })
    }

    async fn session(&self, raw_id: &str) -> Result<Arc<Session>, ApiError> {
        let id = parse_id(raw_id, "session")?;
        self.shared
            .sessions
            .get(id)
            .await
            .ok_or_else(|| ApiError::not_found(format!("unknown session {id}")))
    }
}

pub fn app<M: LanguageModel + 'static>(state: AppState<M>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/sessions", post(create_session::<M>))
        .route("/sessions/{session_id}", delete(end_session::<M>))
        .route(
            "/sessions/{session_id}/requests",
            post(submit_request::<M>).get(list_requests::<M>),
        )
        .route(
            "/sessions/{session_id}/requests/{request_id}",
            get(get_request::<M>),
        )
        .route(
            "/sessions/{session_id}/requests/{request_id}/download",
            get(download::<M>),
        )
        .route(
            "/sessions/{session_id}/requests/{request_id}/preview",
            get(preview::<M>),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

#[derive(Deserialize)]
struct SubmitRequest {
    prompt: String,
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session_id: Uuid,
    /// Whether requests without a key fall back to the server's own.
    default_key: bool,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    session_id: Uuid,
    requests: Vec<RequestView>,
}

#[derive(Debug, Serialize)]
struct RequestView {
    id: Uuid,
    prompt: String,
    state: RequestState,
    submitted_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mesh: Option<MeshView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Failure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    compile_ms: Option<f64>,
}

#[derive(Debug, Serialize)]
struct MeshView {
    format: MeshFormat,
    filename: String,
    size_bytes: usize,
    download_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview_url: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    warnings: String,
}

#[derive(Debug, Serialize)]
struct PreviewResponse {
    mesh: MeshJson,
    stats: MeshStats,
}

#[derive(Debug, Serialize)]
struct MeshJson {
    vertices: Vec<[f64; 3]>,
    triangles: Vec<[u32; 3]>,
}

impl RequestView {
    fn of(session_id: Uuid, record: &RequestRecord) -> Self {
        Self {
            id: record.id,
            prompt: record.prompt.clone(),
            state: record.state,
            submitted_at: record.submitted_at,
            script: record.script.clone(),
            mesh: record
                .ready_mesh()
                .map(|mesh| MeshView::of(session_id, record.id, mesh)),
            error: record.failure.clone(),
            generation_ms: record.generation_ms,
            compile_ms: record.compile_ms,
        }
    }
}

impl MeshView {
    fn of(session_id: Uuid, request_id: Uuid, mesh: &CompiledMesh) -> Self {
        let base = format!("/sessions/{session_id}/requests/{request_id}");
        Self {
            format: mesh.format,
            filename: mesh.format.download_name(),
            size_bytes: mesh.len(),
            download_url: format!("{base}/download"),
            preview_url: mesh.format.is_stl().then(|| format!("{base}/preview")),
            warnings: mesh.warnings.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn not_ready(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "not_ready", message)
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!("internal error: {err}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                kind: self.kind,
            }),
        )
            .into_response()
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn create_session<M: LanguageModel + 'static>(
    State(state): State<AppState<M>>,
) -> (StatusCode, Json<SessionResponse>) {
    let session = state.sessions().create().await;
    (
        StatusCode::CREATED,
        Json(SessionResponse {
            session_id: session.id(),
            default_key: state.shared.default_key.is_some(),
        }),
    )
}

async fn end_session<M: LanguageModel + 'static>(
    State(state): State<AppState<M>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&session_id, "session")?;
    if state.sessions().remove(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("unknown session {id}")))
    }
}

async fn submit_request<M: LanguageModel + 'static>(
    State(state): State<AppState<M>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<Json<RequestView>, ApiError> {
    let session = state.session(&session_id).await?;
    let request: SubmitRequest = parse_json(&body)?;
    let api_key = request
        .api_key
        .and_then(ApiKey::new)
        .or_else(|| state.shared.default_key.clone());

    let _running = session.begin_request().await;
    let record = pipeline::run_request(
        state.generator(),
        state.compiler(),
        &request.prompt,
        api_key.as_ref(),
        state.shared.shutdown.notified(),
    )
    .await
    .map_err(ApiError::internal)?;

    tracing::info!(
        session = %session.id(),
        request = %record.id,
        state = %record.state,
        "request finished"
    );
    let view = RequestView::of(session.id(), &record);
    session.push(record).await;
    Ok(Json(view))
}

async fn list_requests<M: LanguageModel + 'static>(
    State(state): State<AppState<M>>,
    Path(session_id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let session = state.session(&session_id).await?;
    let id = session.id();
    let requests = session
        .read(|history| history.iter().map(|record| RequestView::of(id, record)).collect())
        .await;
    Ok(Json(HistoryResponse {
        session_id: id,
        requests,
    }))
}

async fn get_request<M: LanguageModel + 'static>(
    State(state): State<AppState<M>>,
    Path((session_id, request_id)): Path<(String, String)>,
) -> Result<Json<RequestView>, ApiError> {
    let session = state.session(&session_id).await?;
    let request_id = parse_id(&request_id, "request")?;
    let id = session.id();
    session
        .read(|history| {
            find(history, request_id).map(|record| Json(RequestView::of(id, record)))
        })
        .await
}

async fn download<M: LanguageModel + 'static>(
    State(state): State<AppState<M>>,
    Path((session_id, request_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let session = state.session(&session_id).await?;
    let request_id = parse_id(&request_id, "request")?;
    let (format, bytes) = session
        .read(|history| {
            let mesh = ready_mesh(history, request_id)?;
            Ok::<_, ApiError>((mesh.format, mesh.bytes.clone()))
        })
        .await?;

    let disposition = format!("attachment; filename=\"{}\"", format.download_name());
    Ok((
        [
            (CONTENT_TYPE, format.mime_type().to_string()),
            (CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

async fn preview<M: LanguageModel + 'static>(
    State(state): State<AppState<M>>,
    Path((session_id, request_id)): Path<(String, String)>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let session = state.session(&session_id).await?;
    let request_id = parse_id(&request_id, "request")?;
    let mesh = session
        .read(|history| {
            let mesh = ready_mesh(history, request_id)?;
            if !mesh.format.is_stl() {
                return Err(ApiError::new(
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    "unsupported_format",
                    format!("preview is only available for STL output, not {}", mesh.format),
                ));
            }
            parse_stl(&mesh.bytes).map_err(|err| {
                ApiError::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "unreadable_mesh",
                    format!("compiled mesh could not be read: {err}"),
                )
            })
        })
        .await?;

    let stats = MeshStats::of(&mesh);
    Ok(Json(PreviewResponse {
        mesh: MeshJson {
            vertices: mesh.vertices,
            triangles: mesh.triangles,
        },
        stats,
    }))
}

fn find(
    history: &VecDeque<RequestRecord>,
    request_id: Uuid,
) -> Result<&RequestRecord, ApiError> {
    history
        .iter()
        .find(|record| record.id == request_id)
        .ok_or_else(|| ApiError::not_found(format!("unknown request {request_id}")))
}

fn ready_mesh(
    history: &VecDeque<RequestRecord>,
    request_id: Uuid,
) -> Result<&CompiledMesh, ApiError> {
    let record = find(history, request_id)?;
    record.ready_mesh().ok_or_else(|| {
        ApiError::not_ready(format!(
            "request {request_id} is {} and has no mesh",
            record.state
        ))
    })
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("invalid {what} id: {raw}")))
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("request body must not be empty"));
    }

    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("invalid JSON payload: {err}")))
}
