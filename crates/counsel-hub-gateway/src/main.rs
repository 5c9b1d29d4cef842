//! Counseling Hub Gateway: staff form, narrative generation and Hub records over HTTP.
//! Single process, in-memory sessions, config from `config/hub.toml` + `COUNSEL_HUB__*`.

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Extension, Json, Router,
};
use counsel_hub_core::{
    hub::HubError, narrative::NarrativeError, CounselingDesk, DeskError, FormInput, GateError, HubConfig,
    SaveRequest,
};
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SESSION_HEADER: &str = "x-session-token";

struct AppState {
    desk: Arc<CounselingDesk>,
}

/// Session token of an authorized request.
#[derive(Clone)]
struct Session(String);

type ApiError = (StatusCode, Json<serde_json::Value>);

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    student_id: String,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match HubConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("[HUB] configuration error: {}", e);
            std::process::exit(1);
        }
    };
    let bind = config.server.bind.clone();
    let desk = Arc::new(CounselingDesk::from_config(config));
    let app = app(desk);

    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("[HUB] cannot bind {}: {}", bind, e);
            std::process::exit(1);
        }
    };
    tracing::info!("[HUB] Counseling Hub v{} listening on {}", counsel_hub_core::version(), bind);

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        tracing::error!("[HUB] server error: {}", e);
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("[HUB] shutting down");
    }
}

fn app(desk: Arc<CounselingDesk>) -> Router {
    let state = Arc::new(AppState { desk });

    let protected = Router::new()
        .route("/api/logout", post(logout_handler))
        .route("/api/narrative", post(narrative_handler))
        .route("/api/narrative/stream", post(narrative_stream_handler))
        .route("/api/records", post(save_handler))
        .route("/api/records/history", get(history_handler))
        .route("/api/records/stats", get(stats_handler))
        .route("/api/alerts/:id/confirm", post(confirm_alert_handler))
        .route("/api/diagnostics", get(diagnostics_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session));

    Router::new()
        .route("/health", get(health))
        .route("/", get(serve_form_ui))
        .route("/api/login", post(login_handler))
        .merge(protected)
        .with_state(state)
        .layer(middleware::from_fn(log_request))
}

async fn log_request(request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    tracing::info!(
        %peer,
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "[HUB] request"
    );
    response
}

fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Every protected route needs a session token, even with an open gate: drafts and
/// pending alerts are keyed by it.
async fn require_session(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = session_token(request.headers()).map(str::to_string);
    let Some(token) = token else {
        return Err(desk_error(DeskError::Gate(GateError::Unauthorized)));
    };
    state
        .desk
        .gate()
        .authorize(Some(&token))
        .map_err(|e| desk_error(e.into()))?;
    request.extensions_mut().insert(Session(token));
    Ok(next.run(request).await)
}

fn status_for(e: &DeskError) -> StatusCode {
    match e {
        DeskError::MissingStudentId | DeskError::MissingObservation | DeskError::NoDraft => {
            StatusCode::BAD_REQUEST
        }
        DeskError::Narrative(NarrativeError::EmptyInput) => StatusCode::BAD_REQUEST,
        DeskError::UnknownAlert(_) => StatusCode::NOT_FOUND,
        DeskError::Gate(_) => StatusCode::UNAUTHORIZED,
        DeskError::Hub(HubError::SchemaDrift { .. }) => StatusCode::CONFLICT,
        DeskError::GeneratorUnavailable(_) | DeskError::HubUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        DeskError::Narrative(_) | DeskError::Hub(_) | DeskError::Notify(_) => StatusCode::BAD_GATEWAY,
    }
}

fn desk_error(e: DeskError) -> ApiError {
    let status = status_for(&e);
    if status.is_server_error() {
        tracing::error!("[HUB] {}", e);
    }
    (
        status,
        Json(serde_json::json!({
            "error": e.user_message(),
            "detail": e.to_string(),
        })),
    )
}

async fn health() -> &'static str {
    "OK"
}

/// Staff form: target type, student id, category, observation, confidential flag.
async fn serve_form_ui() -> Html<&'static str> {
    const INDEX: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/static/index.html"));
    Html(INDEX)
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = state.desk.login(&body.password).map_err(desk_error)?;
    Ok(Json(serde_json::json!({
        "token": token,
        "gate_open": state.desk.gate().is_open(),
    })))
}

async fn logout_handler(
    State(state): State<Arc<AppState>>,
    Extension(Session(session)): Extension<Session>,
) -> StatusCode {
    state.desk.logout(&session);
    StatusCode::NO_CONTENT
}

/// Write-up plus action draft in one response. The draft is kept for `/api/records`.
async fn narrative_handler(
    State(state): State<Arc<AppState>>,
    Extension(Session(session)): Extension<Session>,
    Json(form): Json<FormInput>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let view = state.desk.generate(&session, form).await.map_err(desk_error)?;
    Ok(Json(serde_json::json!(view)))
}

fn json_event(name: &str, payload: &serde_json::Value) -> Event {
    Event::default()
        .event(name)
        .json_data(payload)
        .unwrap_or_else(|_| Event::default().event(name))
}

fn error_event(e: DeskError) -> Event {
    tracing::error!("[HUB] stream: {}", e);
    json_event("error", &serde_json::json!({ "error": e.user_message() }))
}

/// Streaming write-up as SSE: `chunk` events, then one `done` event carrying the draft
/// (risk level included) or one `error` event.
async fn narrative_stream_handler(
    State(state): State<Arc<AppState>>,
    Extension(Session(session)): Extension<Session>,
    Json(form): Json<FormInput>,
) -> Result<Response, ApiError> {
    let chunks = state.desk.generate_stream(&form).await.map_err(desk_error)?;
    let desk = state.desk.clone();

    let events = stream::unfold(Some((chunks, String::new())), move |phase| {
        let desk = desk.clone();
        let session = session.clone();
        let form = form.clone();
        async move {
            let (mut chunks, mut collected) = phase?;
            let event = match chunks.next().await {
                Some(Ok(text)) => {
                    let ev = json_event("chunk", &serde_json::json!({ "text": text }));
                    collected.push_str(&text);
                    return Some((ev, Some((chunks, collected))));
                }
                Some(Err(e)) => error_event(e.into()),
                None => match desk.finish_stream(&session, form, collected).await {
                    Ok(view) => json_event("done", &serde_json::json!(view)),
                    Err(e) => error_event(e),
                },
            };
            Some((event, None))
        }
    })
    .map(Ok::<_, Infallible>);

    Ok(Sse::new(events).into_response())
}

async fn save_handler(
    State(state): State<Arc<AppState>>,
    Extension(Session(session)): Extension<Session>,
    Json(req): Json<SaveRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.desk.save(&session, req).await.map_err(desk_error)?;
    Ok(Json(serde_json::json!(outcome)))
}

async fn confirm_alert_handler(
    State(state): State<Arc<AppState>>,
    Extension(Session(session)): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state
        .desk
        .confirm_alert(&session, &id)
        .await
        .map_err(desk_error)?;
    Ok(Json(serde_json::json!({ "alert": status })))
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state.desk.history(&q.student_id).await.map_err(desk_error)?;
    Ok(Json(serde_json::json!({
        "student_id": q.student_id.trim(),
        "count": records.len(),
        "records": records,
    })))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.desk.stats().await.map_err(desk_error)?;
    Ok(Json(serde_json::json!(stats)))
}

async fn diagnostics_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.desk.diagnose().await))
}
