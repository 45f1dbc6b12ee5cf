//! HTTP entry point (§6): `POST /message` streams an [`sse::AgentSseEvent`]
//! per turn over Server-Sent Events; `GET /health` is a bare liveness probe.
//! Grounded on `async_server.py`'s FastAPI app — one `Router` wiring the
//! two routes onto a shared `AppState`, matching the `Router`/`with_state`
//! shape `mcp_core_rust`'s HTTP transport uses for its own SSE endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::info;

use codegen_agent::auth::AuthLayer;
use codegen_agent::beam::BeamSearchActor;
use codegen_agent::config::AgentConfig;
use codegen_agent::llm::cache::DiskCache;
use codegen_agent::llm::providers::{CachedClient, RigClient};
use codegen_agent::llm::{LlmClient, ModelParams};
use codegen_agent::session::SessionRegistry;
use codegen_agent::snapshot::SnapshotSaver;
use codegen_agent::sse::{self, MessageRequest};
use codegen_agent::tools::coder_tools;
use codegen_agent::workspace::{ContainerEngine, LocalFsEngine};

struct AppState {
    registry: Arc<SessionRegistry>,
    llm_client: Arc<dyn LlmClient>,
    llm_model: String,
    actor: Arc<BeamSearchActor>,
    engine: Arc<dyn ContainerEngine>,
    snapshot_saver: Option<Arc<SnapshotSaver>>,
    auth_token: Option<String>,
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn message_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MessageRequest>,
) -> axum::response::Response {
    let session = state
        .registry
        .get_or_create(
            &request.application_id,
            &request.trace_id,
            Arc::clone(&state.llm_client),
            &state.llm_model,
            Arc::clone(&state.actor),
            Arc::clone(&state.engine),
        )
        .await;

    let rx = sse::spawn_session_stream(
        session,
        Arc::clone(&state.registry),
        request,
        state.snapshot_saver.clone(),
    );

    let stream =
        ReceiverStream::new(rx).map(|event| Ok::<Event, Infallible>(Event::default().data(event.to_sse_data())));
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

fn build_router(state: Arc<AppState>) -> Router {
    let auth = AuthLayer::new(state.auth_token.clone());
    Router::new()
        .route("/health", get(health_handler))
        .route("/message", post(message_handler).layer(auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_state(config: &AgentConfig) -> AppState {
    let cache = DiskCache::new(config.cache_dir.clone(), config.cache_mode, 1000);
    let rig_client = RigClient::new(config);
    let cached_client = CachedClient::new(rig_client, cache, config.max_retries);
    let llm_client: Arc<dyn LlmClient> = Arc::new(cached_client);

    let engine: Arc<dyn ContainerEngine> =
        Arc::new(LocalFsEngine::new(config.snapshot_store_path.join("workspaces")));

    let actor = Arc::new(BeamSearchActor {
        client: Arc::clone(&llm_client),
        model_params: ModelParams {
            model: config.llm_model.clone(),
            max_tokens: 8192,
            temperature: None,
            stop_sequences: Vec::new(),
            tools: coder_tools(),
        },
        beam_width: config.beam_width,
        max_continuation_turns: config.max_continuation_turns,
        max_depth: 6,
    });

    let snapshot_saver = SnapshotSaver::local(&config.snapshot_store_path).map(Arc::new).ok();

    AppState {
        registry: Arc::new(SessionRegistry::new()),
        llm_client,
        llm_model: config.llm_model.clone(),
        actor,
        engine,
        snapshot_saver,
        auth_token: config.auth_token.clone(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AgentConfig::default();
    let host = config.host.clone();
    let port = config.port;
    let state = Arc::new(build_state(&config));
    let app = build_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "starting codegen agent server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

