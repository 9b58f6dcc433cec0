//! Low-level Voxta hub connection.
//!
//! One `VoxtaClient` is one logical connection: SignalR negotiate over HTTP,
//! WebSocket upgrade, protocol handshake, then invocation traffic. Hub-level
//! pings (type 6) are answered in place; invocations (type 1) surface their
//! first argument as the raw upstream payload.

use std::collections::VecDeque;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{decode_frames, encode_frame, ClientMessage};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("negotiate failed: {0}")]
    Negotiate(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("connection closed")]
    Closed,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    #[serde(default)]
    connection_token: Option<String>,
    #[serde(default)]
    connection_id: Option<String>,
}

pub struct VoxtaClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    queued: VecDeque<Value>,
}

impl VoxtaClient {
    /// Negotiate, upgrade and complete the hub handshake.
    pub async fn connect(base_url: &str, http: &reqwest::Client) -> Result<Self, BridgeError> {
        let base = base_url.trim_end_matches('/');
        let negotiate_url = format!("{base}/hub/negotiate?negotiateVersion=1");
        let response = http.post(&negotiate_url).send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::Negotiate(format!(
                "{negotiate_url} returned {}",
                response.status()
            )));
        }
        let negotiate: NegotiateResponse = response.json().await?;
        let token = negotiate
            .connection_token
            .or(negotiate.connection_id)
            .ok_or_else(|| BridgeError::Negotiate("no connection token".into()))?;

        let ws_base = ws_scheme(base);
        let ws_url = format!("{ws_base}/hub?id={token}");
        let (ws, _) = connect_async(&ws_url).await?;

        let mut client = Self {
            ws,
            queued: VecDeque::new(),
        };

        client
            .send_record(&serde_json::json!({"protocol": "json", "version": 1}))
            .await?;
        match client.next_record().await? {
            Some(ack) => {
                if let Some(error) = ack.get("error").and_then(Value::as_str) {
                    return Err(BridgeError::Handshake(error.to_string()));
                }
            }
            None => return Err(BridgeError::Closed),
        }

        Ok(client)
    }

    /// Send one hub invocation carrying a typed payload.
    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), BridgeError> {
        let record = serde_json::json!({
            "type": 1,
            "target": "SendMessage",
            "arguments": [message],
        });
        self.send_record(&record).await
    }

    /// Hub-level keepalive ping.
    pub async fn ping(&mut self) -> Result<(), BridgeError> {
        self.send_record(&serde_json::json!({"type": 6})).await
    }

    /// Next upstream payload, or `None` once the connection is closed.
    pub async fn recv(&mut self) -> Result<Option<Value>, BridgeError> {
        loop {
            if let Some(record) = self.queued.pop_front() {
                match record.get("type").and_then(Value::as_u64) {
                    Some(1) => {
                        if let Some(payload) = record
                            .get("arguments")
                            .and_then(Value::as_array)
                            .and_then(|args| args.first())
                        {
                            return Ok(Some(payload.clone()));
                        }
                    }
                    Some(6) => self.ping().await?,
                    Some(7) => return Ok(None),
                    _ => {}
                }
                continue;
            }
            match self.next_record().await? {
                Some(record) => self.queued.push_back(record),
                None => return Ok(None),
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }

    async fn send_record(&mut self, value: &Value) -> Result<(), BridgeError> {
        self.ws
            .send(WsMessage::Text(encode_frame(value)))
            .await
            .map_err(BridgeError::from)
    }

    async fn next_record(&mut self) -> Result<Option<Value>, BridgeError> {
        if let Some(record) = self.queued.pop_front() {
            return Ok(Some(record));
        }
        loop {
            match self.ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let mut frames = decode_frames(&text).into_iter();
                    let first = frames.next();
                    self.queued.extend(frames);
                    if let Some(first) = first {
                        return Ok(Some(first));
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }
}

/// Map the configured http(s) base to its ws(s) counterpart.
fn ws_scheme(base: &str) -> String {
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_scheme_mapping() {
        assert_eq!(ws_scheme("http://127.0.0.1:5384"), "ws://127.0.0.1:5384");
        assert_eq!(ws_scheme("https://voxta.local"), "wss://voxta.local");
        assert_eq!(ws_scheme("ws://already"), "ws://already");
    }

    #[test]
    fn negotiate_response_accepts_token_or_id() {
        let token: NegotiateResponse =
            serde_json::from_str(r#"{"connectionToken":"abc"}"#).unwrap();
        assert_eq!(token.connection_token.as_deref(), Some("abc"));

        let id: NegotiateResponse = serde_json::from_str(r#"{"connectionId":"xyz"}"#).unwrap();
        assert_eq!(id.connection_id.as_deref(), Some("xyz"));
    }
}
