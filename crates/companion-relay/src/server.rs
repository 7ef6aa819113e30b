// HTTP + WebSocket relay.
//
// Routes:
// - `GET  /`                               welcome message
// - `GET  /health`                         liveness and subscriber count
// - `GET  /static/*`                       model assets from `server.static_dir`
// - `GET  /ws/live2d`                      WebSocket subscription
// - `POST /api/v1/live2d/trigger-action`   broadcast a command to all subscribers
// - `POST /api/v1/live2d/interaction`      map avatar hit areas to an action

use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use companion_core::config::ServerConfig;
use companion_core::protocol::{
    react_to_hit, InteractionPayload, InteractionResponse, RelayMessage, TriggerAck,
    TriggerCommand,
};

use crate::error::RelayError;
use crate::hub::{BroadcastHub, Subscription};

pub const WELCOME_MESSAGE: &str = "Welcome! Model assets are served from /static/";
pub const TRIGGER_ACK_MESSAGE: &str = "Command sent to connected clients";

/// State shared by every handler.
pub struct RelayState {
    pub config: ServerConfig,
    pub hub: BroadcastHub,
}

impl RelayState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            hub: BroadcastHub::default(),
        })
    }
}

/// Build the complete relay router.
pub fn build(state: Arc<RelayState>) -> Router {
    let api = Router::new()
        .route("/trigger-action", post(trigger_action))
        .route("/interaction", post(interaction));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ws/live2d", get(ws_upgrade))
        .nest("/api/v1/live2d", api)
        .nest_service("/static", ServeDir::new(&state.config.static_dir))
        .layer(cors_layer(&state.config.cors_allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wildcard CORS unless specific origins are configured.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    let layer = CorsLayer::new().allow_headers(Any).allow_methods(Any);
    if parsed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(parsed)
    }
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn run<F>(listener: TcpListener, state: Arc<RelayState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "relay listening");
    axum::serve(listener, build(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("relay stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn root() -> Json<Value> {
    Json(json!({ "message": WELCOME_MESSAGE }))
}

async fn health(State(state): State<Arc<RelayState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "clients": state.hub.subscriber_count(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn trigger_action(
    State(state): State<Arc<RelayState>>,
    body: Result<Json<TriggerCommand>, JsonRejection>,
) -> Result<Json<TriggerAck>, RelayError> {
    let Json(command) = body?;
    if command.command_type.trim().is_empty() {
        return Err(RelayError::BadRequest("command_type must not be empty".into()));
    }

    let message = RelayMessage::from(command.clone());
    let delivered_to = state.hub.publish(&message)?;
    info!(
        command_type = %command.command_type,
        delivered_to,
        "broadcasting command"
    );

    Ok(Json(TriggerAck {
        message: TRIGGER_ACK_MESSAGE.to_string(),
        command,
        delivered_to,
    }))
}

async fn interaction(
    body: Result<Json<InteractionPayload>, JsonRejection>,
) -> Result<Json<InteractionResponse>, RelayError> {
    let Json(payload) = body?;
    info!(
        model_id = %payload.model_id,
        hit_areas = ?payload.hit_areas,
        timestamp = %payload.timestamp,
        "interaction received"
    );
    Ok(Json(react_to_hit(&payload.hit_areas)))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    // Subscribe before the handshake completes so a command sent right after
    // the client connects is not missed.
    let subscription = state.hub.subscribe();
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| async move {
        let id = subscription.id;
        info!(client = id, clients = hub.subscriber_count(), "client connected");
        forward(socket, subscription).await;
        // The subscription is dropped by now, so the count excludes this client.
        info!(client = id, clients = hub.subscriber_count(), "client disconnected");
    })
}

/// Pump hub frames into `socket` until either side goes away. Frames sent by
/// the client are read and discarded.
async fn forward(socket: WebSocket, subscription: Subscription) {
    let Subscription { id, mut rx } = subscription;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        warn!(client = id, error = %e, "send failed, dropping client");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(client = id, skipped, "client lagging, frames skipped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(client = id, error = %e, "websocket error");
                    break;
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state_with_static(dir: &str) -> Arc<RelayState> {
        RelayState::new(ServerConfig {
            static_dir: dir.to_string(),
            ..ServerConfig::default()
        })
    }

    fn state() -> Arc<RelayState> {
        state_with_static("static")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn root_returns_welcome() {
        let response = build(state())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["message"], WELCOME_MESSAGE);
    }

    #[tokio::test]
    async fn health_reports_client_count() {
        let state = state();
        let _sub = state.hub.subscribe();
        let response = build(state.clone())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["clients"], 1);
    }

    #[tokio::test]
    async fn trigger_broadcasts_to_subscribers() {
        let state = state();
        let mut sub = state.hub.subscribe();

        let response = build(state.clone())
            .oneshot(post_json(
                "/api/v1/live2d/trigger-action",
                json!({ "command_type": "motion", "payload": { "group": "Tap@Body", "index": 0, "priority": 3 } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let ack = body_json(response).await;
        assert_eq!(ack["message"], TRIGGER_ACK_MESSAGE);
        assert_eq!(ack["command"]["command_type"], "motion");
        assert_eq!(ack["delivered_to"], 1);

        let frame: Value = serde_json::from_str(&sub.rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({ "type": "motion", "data": { "group": "Tap@Body", "index": 0, "priority": 3 } })
        );
    }

    #[tokio::test]
    async fn trigger_without_subscribers_still_succeeds() {
        let response = build(state())
            .oneshot(post_json(
                "/api/v1/live2d/trigger-action",
                json!({ "command_type": "expression", "payload": { "name": "normal" } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["delivered_to"], 0);
    }

    #[tokio::test]
    async fn trigger_rejects_blank_command_type() {
        let response = build(state())
            .oneshot(post_json(
                "/api/v1/live2d/trigger-action",
                json!({ "command_type": "  ", "payload": {} }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].as_str().unwrap().contains("command_type"));
    }

    #[tokio::test]
    async fn trigger_rejects_malformed_body() {
        let response = build(state())
            .oneshot(post_json("/api/v1/live2d/trigger-action", json!({ "payload": {} })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("command_type"), "{body}");
    }

    #[tokio::test]
    async fn trigger_rejects_non_object_payload_as_json() {
        let response = build(state())
            .oneshot(post_json(
                "/api/v1/live2d/trigger-action",
                json!({ "command_type": "x", "payload": [1] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn unparseable_bodies_get_json_errors() {
        for uri in ["/api/v1/live2d/trigger-action", "/api/v1/live2d/interaction"] {
            let request = Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from("not json"))
                .unwrap();
            let response = build(state()).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(response.headers()["content-type"], "application/json", "{uri}");
            assert!(body_json(response).await["error"].is_string(), "{uri}");
        }
    }

    #[tokio::test]
    async fn interaction_rejects_missing_fields_as_json() {
        let response = build(state())
            .oneshot(post_json("/api/v1/live2d/interaction", json!({ "model_id": "hiyori" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_json(response).await["error"].as_str().unwrap().contains("hit_areas"));
    }

    #[tokio::test]
    async fn interaction_maps_head_to_talk() {
        let response = build(state())
            .oneshot(post_json(
                "/api/v1/live2d/interaction",
                json!({ "model_id": "hiyori", "hit_areas": ["Head"], "timestamp": "2024-05-01T10:00:00Z" }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["action"]["type"], "talk");
        assert_eq!(body["action"]["expression"], "Happy");
    }

    #[tokio::test]
    async fn interaction_ignores_unknown_areas() {
        let response = build(state())
            .oneshot(post_json(
                "/api/v1/live2d/interaction",
                json!({ "model_id": "hiyori", "hit_areas": [], "timestamp": "t" }),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!({ "status": "ignored", "action": null }));
    }

    #[tokio::test]
    async fn static_files_are_served() {
        let dir = std::env::temp_dir().join(format!("companion_relay_static_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("model.json"), r#"{"Version":3}"#).unwrap();

        let response = build(state_with_static(dir.to_str().unwrap()))
            .oneshot(Request::get("/static/model.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["Version"], 3);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn cors_allows_any_origin_by_default() {
        let response = build(state())
            .oneshot(
                Request::get("/")
                    .header("origin", "http://localhost:9003")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn cors_restricts_to_configured_origins() {
        let state = RelayState::new(ServerConfig {
            cors_allowed_origins: vec!["http://localhost:9003".into()],
            ..ServerConfig::default()
        });
        let response = build(state)
            .oneshot(
                Request::get("/")
                    .header("origin", "http://localhost:9003")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://localhost:9003"
        );
    }
}
