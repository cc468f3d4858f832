//! HTTP gateway for Quarry.
//!
//! Routes:
//!
//! - `GET    /stream?message=…&session_id=…` runs one request and streams its
//!   progress as server-sent events, ending with `end_of_stream`
//! - `GET    /history` lists persisted chat turns, oldest first
//! - `DELETE /history` clears them
//! - `GET    /health`
//!
//! Built on Axum. Dropping an SSE response (client disconnect) aborts the
//! pipeline task behind it.

use axum::{
    Router,
    extract::{Query, State},
    http::{Method, StatusCode},
    response::{
        IntoResponse, Json, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::get,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use quarry_agent::{ChatService, LlmClient, Orchestrator, Request};
use quarry_config::{AppConfig, ChatStoreKind};
use quarry_core::event::SseFrame;
use quarry_core::storage::{ChatStore, ChatTurn};
use quarry_storage::{InMemoryChatStore, SqliteChatStore};

/// Shared application state for the gateway.
pub struct GatewayState {
    pub service: ChatService,
}

type SharedState = Arc<GatewayState>;

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/stream", get(stream_handler))
        .route("/history", get(history_handler).delete(clear_history_handler))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire the configured provider, database and transcript store into a
/// [`ChatService`].
pub async fn build_service(config: &AppConfig) -> Result<ChatService, Box<dyn std::error::Error + Send + Sync>> {
    let provider = quarry_providers::build_from_config(&config.provider)?;

    let database_url = config
        .database
        .url
        .as_deref()
        .ok_or("no database configured; set QUARRY_DATABASE_URL or DATABASE_URL")?;
    let executor = quarry_storage::connect_executor(database_url, config.database.max_connections).await?;

    let chat_store: Arc<dyn ChatStore> = match config.database.chat_store {
        ChatStoreKind::Memory => Arc::new(InMemoryChatStore::new()),
        ChatStoreKind::Sqlite => {
            if config.database.chat_store_url.is_none() {
                std::fs::create_dir_all(AppConfig::config_dir())?;
            }
            Arc::new(SqliteChatStore::new(&config.database.resolved_chat_store_url()).await?)
        }
    };

    let llm = LlmClient::new(provider, config.provider.model.clone(), config.pipeline.llm_timeout());
    let mut orchestrator = Orchestrator::new(llm, executor, chat_store, config.pipeline.clone());
    if let Some(path) = &config.pipeline.schema_file {
        let schema = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read schema file {}: {e}", path.display()))?;
        orchestrator = orchestrator.with_schema(schema);
    }

    Ok(ChatService::new(Arc::new(orchestrator), config.pipeline.poll_interval()))
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let service = build_service(&config).await?;
    let app = build_router(Arc::new(GatewayState { service }));

    info!(addr = %addr, model = %config.provider.model, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Errors ---

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Deserialize)]
struct StreamParams {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
}

/// `GET /stream`: one SSE frame per pipeline event.
async fn stream_handler(
    State(state): State<SharedState>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let message = params.message.trim();
    if message.is_empty() {
        return Err(ApiError(StatusCode::BAD_REQUEST, "message must not be empty".into()));
    }

    info!(session_id = ?params.session_id, message_len = message.len(), "Stream request");
    let mut request = Request::new(message);
    if let Some(session_id) = params.session_id {
        request = request.with_session(session_id);
    }

    let stream = state.service.start(request).map(|event| {
        let frame = SseFrame::from_event(&event);
        Ok(SseEvent::default().event(frame.event).data(frame.data))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `GET /history`
async fn history_handler(State(state): State<SharedState>) -> Result<Json<Vec<ChatTurn>>, ApiError> {
    state.service.history().await.map(Json).map_err(|e| {
        error!("Failed to read chat history: {e}");
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

/// `DELETE /history`
async fn clear_history_handler(State(state): State<SharedState>) -> Result<StatusCode, ApiError> {
    state.service.clear_history().await.map_err(|e| {
        error!("Failed to clear chat history: {e}");
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    Ok(StatusCode::NO_CONTENT)
}
