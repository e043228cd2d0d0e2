//! HTTP host for the signaling channel
//!
//! `GET /ws` upgrades to a WebSocket that carries JSON signaling frames,
//! `GET /health` reports registry statistics.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use voxrelay_sfu::{
    ClientEnvelope, InvalidFrame, MessageStream, RegistryStats, ServerMessage, SignalingService,
};

/// Shared state of the HTTP router
#[derive(Clone)]
pub struct AppState {
    pub signaling: SignalingService,
    pub max_message_size: usize,
    /// Flips to `true` when the process is shutting down
    pub shutdown: watch::Receiver<bool>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    stats: RegistryStats,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        stats: state.signaling.registry().stats(),
    })
}

async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("WebSocket connection established");

    let mut shutdown = state.shutdown.clone();
    tokio::select! {
        () = state.signaling.serve(WebSocketStream { socket }) => {}
        // Dropping the session on shutdown releases everything it owns
        _ = shutdown.changed() => {
            debug!("Closing WebSocket connection for shutdown");
        }
    }

    info!("WebSocket connection closed");
}

/// [`MessageStream`] over an axum WebSocket carrying JSON text frames
struct WebSocketStream {
    socket: WebSocket,
}

#[async_trait::async_trait]
impl MessageStream for WebSocketStream {
    async fn recv(&mut self) -> Option<Result<ClientEnvelope, InvalidFrame>> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return Some(ClientEnvelope::parse(text.as_str())),
                Some(Ok(Message::Binary(bytes))) => {
                    let frame = std::str::from_utf8(&bytes)
                        .map_err(|e| InvalidFrame {
                            request_id: None,
                            reason: format!("frame is not UTF-8: {e}"),
                        })
                        .and_then(ClientEnvelope::parse);
                    return Some(frame);
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket receive error");
                    return None;
                }
                // Ping/pong are answered by axum
                Some(Ok(_)) => {}
            }
        }
    }

    async fn send(&mut self, message: ServerMessage) -> Result<(), String> {
        let text = serde_json::to_string(&message).map_err(|e| e.to_string())?;
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| format!("WebSocket send error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;
    use voxrelay_sfu::{DenyListPolicy, LocalEngine, RoomId, RoomRegistry, SfuConfig, UserId};

    fn state() -> (AppState, watch::Sender<bool>) {
        let registry = Arc::new(RoomRegistry::new(SfuConfig::default(), Arc::new(LocalEngine::new())));
        let signaling = SignalingService::new(registry, Arc::new(DenyListPolicy::new()));
        let (tx, rx) = watch::channel(false);
        (
            AppState {
                signaling,
                max_message_size: 64 * 1024,
                shutdown: rx,
            },
            tx,
        )
    }

    #[tokio::test]
    async fn test_health_reports_registry_stats() {
        let (state, _tx) = state();
        let (session, _rx) = state.signaling.connect();
        session.join(RoomId::from("r1"), UserId::from("1")).await.unwrap();

        let response = create_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["stats"]["rooms"], 1);
        assert_eq!(json["stats"]["peers"], 1);
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let (state, _tx) = state();
        let response = create_router(state)
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
