//! HTTP/WS server assembly: router, WebSocket lifecycle, startup.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use voxgate_bridge::bridge::VoxtaBridge;
use voxgate_core::events::GatewayEvent;
use voxgate_core::ids::ClientId;
use voxgate_core::state::StateStore;

use crate::event_bridge;
use crate::gateway::Gateway;
use crate::http;
use crate::subscriber::{Subscriber, SubscriberRegistry, Subscription};
use crate::wire;

/// Close codes for failed subscribe handshakes.
const CLOSE_PROTOCOL_ERROR: u16 = 4400;
const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4408;

pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            max_send_queue: 256,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub state: StateStore,
    pub gateway: Arc<Gateway>,
    pub bridge: Arc<VoxtaBridge>,
    pub registry: Arc<SubscriberRegistry>,
    pub handshake_timeout: Duration,
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(http::health))
        .route("/state", get(http::state))
        .route("/dialogue", post(http::dialogue))
        .route("/context", post(http::context))
        .route("/externalSpeakerStart", post(http::external_speaker_start))
        .route("/externalSpeakerStop", post(http::external_speaker_stop))
        .route("/ttsPlaybackStart", post(http::tts_playback_start))
        .route("/ttsPlaybackComplete", post(http::tts_playback_complete))
        .route("/debug/clients", get(http::debug_clients))
        .route("/debug/clients/{id}/history", get(http::debug_client_history))
        .route("/debug/upstream/history", get(http::debug_upstream_history))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle keeping its tasks alive.
pub async fn start(
    config: ServerConfig,
    state: StateStore,
    gateway: Arc<Gateway>,
    bridge: Arc<VoxtaBridge>,
    event_rx: broadcast::Receiver<GatewayEvent>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(SubscriberRegistry::new(config.max_send_queue));
    let fanout = event_bridge::start(Arc::clone(&registry), event_rx);

    let app_state = AppState {
        state,
        gateway,
        bridge,
        registry,
        handshake_timeout: config.handshake_timeout,
    };

    let router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(port = local_addr.port(), "voxgate server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
        _fanout: fanout,
    })
}

/// Handle returned by `start()`; dropping it does not stop the tasks.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _fanout: tokio::task::JoinHandle<()>,
}

/// Frames clients send over the WebSocket.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum ClientFrame {
    Subscribe {
        #[serde(default, alias = "client_id")]
        client_id: Option<ClientId>,
        #[serde(default)]
        events: Option<Vec<String>>,
    },
    Ping,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// The subscribe handshake: the first frame, within the timeout, must be a
/// subscribe. Anything else closes the connection with a protocol-error code.
async fn handle_socket(mut socket: WebSocket, app: AppState) {
    let first = tokio::time::timeout(app.handshake_timeout, socket.recv()).await;
    let frame = match first {
        Err(_) => {
            close_with(&mut socket, CLOSE_HANDSHAKE_TIMEOUT, "subscribe timeout").await;
            return;
        }
        Ok(Some(Ok(WsMessage::Text(text)))) => match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame @ ClientFrame::Subscribe { .. }) => frame,
            _ => {
                close_with(&mut socket, CLOSE_PROTOCOL_ERROR, "expected subscribe frame").await;
                return;
            }
        },
        Ok(_) => {
            close_with(&mut socket, CLOSE_PROTOCOL_ERROR, "expected subscribe frame").await;
            return;
        }
    };

    let ClientFrame::Subscribe { client_id, events } = frame else {
        unreachable!("handshake only accepts subscribe frames");
    };
    let client_id = client_id.unwrap_or_else(ClientId::generate);
    let subscription = Subscription::from_events(events);
    let (subscriber, rx) = app.registry.register(client_id.clone(), subscription);
    info!(client_id = %client_id, "subscriber connected");

    // Snapshot first: the convergence point for all later incremental events.
    let snapshot = wire::snapshot_frame(&app.state.snapshot());
    if socket
        .send(WsMessage::Text(snapshot.to_string().into()))
        .await
        .is_err()
    {
        app.registry.remove_if_same(&client_id, &subscriber);
        return;
    }

    run_connection(socket, Arc::clone(&subscriber), rx).await;

    app.registry.remove_if_same(&client_id, &subscriber);
    info!(client_id = %client_id, "subscriber disconnected");
}

/// Split into reader/writer tasks and run until either side finishes or the
/// subscriber is force-closed (superseded or overflowed).
async fn run_connection(
    socket: WebSocket,
    subscriber: Arc<Subscriber>,
    mut rx: tokio::sync::mpsc::Receiver<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_sub = Arc::clone(&subscriber);
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_sub.closed() => {
                    let _ = ws_tx
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: 1000,
                            reason: "superseded".into(),
                        })))
                        .await;
                    break;
                }
                frame = rx.recv() => match frame {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    let reader_sub = Arc::clone(&subscriber);
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_rx.next().await {
            match message {
                WsMessage::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Ping) => {
                        reader_sub.send_control(wire::pong_frame().to_string());
                    }
                    // A later subscribe replaces the filter in place, no new
                    // snapshot.
                    Ok(ClientFrame::Subscribe { events, .. }) => {
                        reader_sub.set_subscription(Subscription::from_events(events));
                    }
                    Err(err) => {
                        debug!(client_id = %reader_sub.id, error = %err, "ignoring client frame");
                    }
                },
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }
    subscriber.close();
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    debug!(code, reason, "closing websocket during handshake");
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::sync::{broadcast, mpsc};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
    use voxgate_bridge::bridge::BridgeConfig;

    struct TestStack {
        handle: ServerHandle,
        event_tx: broadcast::Sender<GatewayEvent>,
        state: StateStore,
    }

    async fn start_stack() -> TestStack {
        let state = StateStore::new();
        let (event_tx, event_rx) = broadcast::channel(256);
        let (reply_tx, _reply_rx) = mpsc::channel(64);
        let bridge = VoxtaBridge::new(
            BridgeConfig::default(),
            state.clone(),
            event_tx.clone(),
            reply_tx,
        );
        let gateway = Gateway::new(state.clone(), Arc::clone(&bridge), event_tx.clone());

        let config = ServerConfig {
            port: 0,
            handshake_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let handle = start(config, state.clone(), gateway, bridge, event_rx)
            .await
            .unwrap();
        TestStack {
            handle,
            event_tx,
            state,
        }
    }

    async fn ws_connect(
        port: u16,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .unwrap();
        ws
    }

    async fn next_json(
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let TungsteniteMessage::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn health_reports_upstream_connectivity() {
        let stack = start_stack().await;
        let url = format!("http://127.0.0.1:{}/health", stack.handle.port);
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["voxtaConnected"], false);
    }

    #[tokio::test]
    async fn state_endpoint_renders_snapshot() {
        let stack = start_stack().await;
        stack
            .state
            .open_chat(voxgate_core::ids::ChatId::from_raw("s1"), vec![]);

        let url = format!("http://127.0.0.1:{}/state", stack.handle.port);
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["chatActive"], true);
        assert_eq!(body["aiState"], "idle");
    }

    #[tokio::test]
    async fn dialogue_without_chat_returns_conflict() {
        let stack = start_stack().await;
        let url = format!("http://127.0.0.1:{}/dialogue", stack.handle.port);
        let response = reqwest::Client::new()
            .post(&url)
            .json(&json!({"text": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 409);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "precondition_failed");
    }

    #[tokio::test]
    async fn subscribe_gets_snapshot_then_events() {
        let stack = start_stack().await;
        let mut ws = ws_connect(stack.handle.port).await;

        ws.send(TungsteniteMessage::Text(
            json!({"type": "subscribe", "clientId": "test-client", "events": ["all"]})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

        let snapshot = next_json(&mut ws).await;
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["state"]["chatActive"], false);

        stack
            .event_tx
            .send(GatewayEvent::VoxtaConnected {})
            .unwrap();
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["type"], "voxta_connected");
        assert!(frame["timestamp"].is_f64());
    }

    #[tokio::test]
    async fn subscription_filter_is_applied() {
        let stack = start_stack().await;
        let mut ws = ws_connect(stack.handle.port).await;

        ws.send(TungsteniteMessage::Text(
            json!({"type": "subscribe", "events": ["chat_closed"]})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
        let snapshot = next_json(&mut ws).await;
        assert_eq!(snapshot["type"], "snapshot");

        stack
            .event_tx
            .send(GatewayEvent::VoxtaConnected {})
            .unwrap();
        stack.event_tx.send(GatewayEvent::ChatClosed {}).unwrap();

        // Only the matching event arrives.
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["type"], "chat_closed");
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let stack = start_stack().await;
        let mut ws = ws_connect(stack.handle.port).await;

        ws.send(TungsteniteMessage::Text(
            json!({"type": "subscribe"}).to_string().into(),
        ))
        .await
        .unwrap();
        next_json(&mut ws).await;

        ws.send(TungsteniteMessage::Text(
            json!({"type": "ping"}).to_string().into(),
        ))
        .await
        .unwrap();
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["type"], "pong");
    }

    #[tokio::test]
    async fn invalid_first_frame_closes_with_protocol_error() {
        let stack = start_stack().await;
        let mut ws = ws_connect(stack.handle.port).await;

        ws.send(TungsteniteMessage::Text(
            json!({"type": "ping"}).to_string().into(),
        ))
        .await
        .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match message {
            TungsteniteMessage::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::from(CLOSE_PROTOCOL_ERROR));
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_subscribe_times_out() {
        let stack = start_stack().await;
        let mut ws = ws_connect(stack.handle.port).await;

        let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match message {
            TungsteniteMessage::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::from(CLOSE_HANDSHAKE_TIMEOUT));
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconnect_with_same_client_id_supersedes() {
        let stack = start_stack().await;

        let mut first = ws_connect(stack.handle.port).await;
        first
            .send(TungsteniteMessage::Text(
                json!({"type": "subscribe", "clientId": "dup"}).to_string().into(),
            ))
            .await
            .unwrap();
        next_json(&mut first).await;

        let mut second = ws_connect(stack.handle.port).await;
        second
            .send(TungsteniteMessage::Text(
                json!({"type": "subscribe", "clientId": "dup"}).to_string().into(),
            ))
            .await
            .unwrap();
        next_json(&mut second).await;

        // The first connection observably closes.
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match first.next().await {
                    Some(Ok(TungsteniteMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());

        // Only the second receives subsequent broadcasts.
        stack
            .event_tx
            .send(GatewayEvent::VoxtaConnected {})
            .unwrap();
        let frame = next_json(&mut second).await;
        assert_eq!(frame["type"], "voxta_connected");
    }

    #[tokio::test]
    async fn debug_clients_lists_subscribers() {
        let stack = start_stack().await;
        let mut ws = ws_connect(stack.handle.port).await;
        ws.send(TungsteniteMessage::Text(
            json!({"type": "subscribe", "clientId": "debug-me"})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
        next_json(&mut ws).await;

        let url = format!("http://127.0.0.1:{}/debug/clients", stack.handle.port);
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["count"], 1);
        assert_eq!(body["clients"][0]["clientId"], "debug-me");

        let missing = format!(
            "http://127.0.0.1:{}/debug/clients/nobody/history",
            stack.handle.port
        );
        let response = reqwest::get(&missing).await.unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn debug_upstream_history_starts_empty() {
        let stack = start_stack().await;
        let url = format!(
            "http://127.0.0.1:{}/debug/upstream/history",
            stack.handle.port
        );
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["count"], 0);
    }
}
