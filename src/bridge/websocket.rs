//! External listener: WebSocket bridge, health check, static assets

use crate::bridge::session::ProtocolBridge;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Path of the bridged messaging endpoint
pub const EVENTBUS_PATH: &str = "/eventbus";

/// Create the bridge router
///
/// Anything that is not the bridge or the health check is served from
/// `web_root`.
pub fn create_router(bridge: Arc<ProtocolBridge>, web_root: impl AsRef<Path>) -> Router {
    Router::new()
        .route(EVENTBUS_PATH, get(ws_handler))
        .route("/health", get(health_handler))
        .fallback_service(ServeDir::new(web_root.as_ref()))
        .layer(TraceLayer::new_for_http())
        .with_state(bridge)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(bridge): State<Arc<ProtocolBridge>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, bridge))
}

async fn handle_socket(socket: WebSocket, bridge: Arc<ProtocolBridge>) {
    let (mut sender, mut receiver) = socket.split();
    let (mut session, mut events) = bridge.open_session();
    let session_id = session.id();

    info!(session = %session_id, "Bridge client connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode bridge event");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => session.handle_text(text.as_str()).await,
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => session.handle_text(text).await,
                Err(_) => debug!(session = %session_id, "Ignoring non-UTF-8 frame"),
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Handled automatically by axum
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!(session = %session_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    debug!(session = %session_id, "Bridge client disconnected");
    drop(session);
    send_task.abort();
}

/// Serve the bridge on an already bound listener until `shutdown` resolves
pub async fn serve_bridge<F>(
    listener: TcpListener,
    bridge: Arc<ProtocolBridge>,
    web_root: impl AsRef<Path>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(bridge, web_root);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Bind `bind_addr` and serve the bridge until `shutdown` resolves
pub async fn run_bridge_server<F>(
    bind_addr: SocketAddr,
    bridge: Arc<ProtocolBridge>,
    web_root: impl AsRef<Path>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_addr).await?;
    info!(
        addr = %listener.local_addr()?,
        web_root = %web_root.as_ref().display(),
        "Bridge listening"
    );
    serve_bridge(listener, bridge, web_root, shutdown).await
}
