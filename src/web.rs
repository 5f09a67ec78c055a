//! Minimal HTTP/WS surface the core itself needs: health/status for an
//! external supervisor, and the fragmented-MP4 WebSocket upgrade endpoint
//! browser viewers attach to. Everything else — camera/agent
//! CRUD, auth, the document-store API — is an explicit external collaborator
//! this crate does not define routes for.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::Message, Path, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::event_session::EventSessionManager;
use crate::frame_store::FrameStore;
use crate::ws_fmp4::WsFmp4Publisher;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub frame_store: Arc<FrameStore>,
    pub sessions: Arc<EventSessionManager>,
    pub ws_fmp4: Arc<WsFmp4Publisher>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/ws/:camera_id/:agent_id", get(fmp4_ws_handler))
        .with_state(state)
}

pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.server.bind_ip, state.config.server.web_port);
    let router = app(state);

    info!(%addr, "starting web/ws server");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

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

#[derive(Serialize)]
struct StatusResponse {
    frame_store_keys: usize,
    active_sessions: usize,
    encode_queue_depth: usize,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        frame_store_keys: state.frame_store.len(),
        active_sessions: state.sessions.session_count().await,
        encode_queue_depth: state.sessions.encode_queue_depth(),
    })
}

/// Upgrades to a WebSocket, attaches a viewer to `{camera_id}:{agent_id}`'s
/// fMP4 stream, sends the init segment, then forwards media chunks until the
/// socket closes.
async fn fmp4_ws_handler(
    State(state): State<AppState>,
    Path((camera_id, agent_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = serve_viewer(state, camera_id, agent_id, socket).await {
            warn!(error = %err, "ws fmp4 viewer session ended with error");
        }
    })
    .into_response()
}

async fn serve_viewer(
    state: AppState,
    camera_id: String,
    agent_id: String,
    mut socket: axum::extract::ws::WebSocket,
) -> anyhow::Result<()> {
    let fps = state.config.video.default_fps;
    let mut viewer = state.ws_fmp4.add_viewer(&camera_id, &agent_id, fps).await?;

    // Wait up to 0.5s for the init segment to already be ready, then up to a
    // further 5s total before giving up.
    let init = match viewer.init_segment(Duration::from_millis(500)).await {
        Some(init) => Some(init),
        None => viewer.init_segment(Duration::from_secs(5)).await,
    };
    if let Some(init) = init {
        socket.send(Message::Binary(init.to_vec())).await?;
    }

    loop {
        tokio::select! {
            chunk = viewer.recv() => {
                match chunk {
                    Some(bytes) => {
                        if socket.send(Message::Binary(bytes.to_vec())).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                }
            }
            msg = socket.recv() => {
                match msg {
                    None | Some(Err(_)) => return Ok(()),
                    Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Ok(_)) => {} // viewers are receive-only; ignore inbound frames
                }
            }
        }
    }
}
