//! The upstream bridge: owns the single Voxta connection, mirrors its signals
//! into the `StateStore`, and exposes the outbound operations the orchestrator
//! needs.
//!
//! Division of labor: the bridge applies chat/participant/connection mutations
//! and emits their derived events directly. Reply-lifecycle and playback
//! signals are forwarded as `ReplySignal`s — the `aiState` transition policy
//! and sentence buffering belong to the gateway orchestrator.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use voxgate_core::events::GatewayEvent;
use voxgate_core::ids::{CharacterId, MessageId};
use voxgate_core::state::{CharacterInfo, StateStore};
use voxgate_core::ActionError;

use crate::client::VoxtaClient;
use crate::protocol::{ClientMessage, ContextDefinition, ServerMessage};

const HUB_PING_INTERVAL: Duration = Duration::from_secs(15);
const OUTBOUND_QUEUE: usize = 64;

/// Reply-lifecycle and playback signals forwarded to the orchestrator.
#[derive(Clone, Debug)]
pub enum ReplySignal {
    Generating,
    Started {
        message_id: MessageId,
        character_id: Option<CharacterId>,
    },
    Chunk {
        message_id: MessageId,
        character_id: CharacterId,
        text: String,
    },
    Completed {
        message_id: MessageId,
    },
    Cancelled {
        message_id: MessageId,
    },
    PlaybackStarted {
        message_id: Option<MessageId>,
        character_id: Option<CharacterId>,
    },
    PlaybackComplete {
        message_id: Option<MessageId>,
    },
    SpeechInterrupted,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// One raw upstream exchange, kept for debugging only.
#[derive(Clone, Debug, Serialize)]
pub struct TrafficRecord {
    pub direction: Direction,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: f64,
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub base_url: String,
    pub reconnect_delay: Duration,
    pub history_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5384".into(),
            reconnect_delay: Duration::from_secs(5),
            history_capacity: 200,
        }
    }
}

pub struct VoxtaBridge {
    config: BridgeConfig,
    http: reqwest::Client,
    state: StateStore,
    event_tx: broadcast::Sender<GatewayEvent>,
    reply_tx: mpsc::Sender<ReplySignal>,
    outbound: Mutex<Option<mpsc::Sender<ClientMessage>>>,
    history: Mutex<VecDeque<TrafficRecord>>,
}

impl VoxtaBridge {
    pub fn new(
        config: BridgeConfig,
        state: StateStore,
        event_tx: broadcast::Sender<GatewayEvent>,
        reply_tx: mpsc::Sender<ReplySignal>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            http: reqwest::Client::new(),
            state,
            event_tx,
            reply_tx,
            outbound: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
        })
    }

    /// Spawn the connection task: connect, pump, and on drop retry with a
    /// fixed delay until the token is cancelled.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match VoxtaClient::connect(&bridge.config.base_url, &bridge.http).await {
                    Ok(client) => bridge.run_connection(client, &cancel).await,
                    Err(err) => {
                        debug!(error = %err, url = %bridge.config.base_url, "upstream connect failed")
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(bridge.config.reconnect_delay) => {}
                }
            }
            debug!("upstream bridge stopped");
        })
    }

    async fn run_connection(&self, mut client: VoxtaClient, cancel: &CancellationToken) {
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(OUTBOUND_QUEUE);
        *self.outbound.lock() = Some(out_tx);

        if self.state.set_connected(true) {
            self.emit(GatewayEvent::VoxtaConnected {});
        }

        let auth = ClientMessage::authenticate();
        self.record(Direction::Out, auth.kind(), to_history_value(&auth));
        if let Err(err) = client.send(&auth).await {
            warn!(error = %err, "authenticate failed");
        } else {
            let mut ping = tokio::time::interval(HUB_PING_INTERVAL);
            ping.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        client.close().await;
                        break;
                    }
                    outgoing = out_rx.recv() => {
                        match outgoing {
                            Some(message) => {
                                self.record(Direction::Out, message.kind(), to_history_value(&message));
                                if let Err(err) = client.send(&message).await {
                                    warn!(error = %err, "outbound send failed");
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = ping.tick() => {
                        if client.ping().await.is_err() {
                            break;
                        }
                    }
                    incoming = client.recv() => {
                        match incoming {
                            Ok(Some(payload)) => self.handle_upstream(payload).await,
                            Ok(None) => break,
                            Err(err) => {
                                warn!(error = %err, "upstream receive failed");
                                break;
                            }
                        }
                    }
                }
            }
        }

        *self.outbound.lock() = None;
        if self.state.set_connected(false) {
            self.emit(GatewayEvent::VoxtaDisconnected {});
        }
    }

    /// Decode and apply one raw upstream payload. Unknown message types are
    /// recorded and ignored; a fault here must never take down the connection.
    pub async fn handle_upstream(&self, raw: Value) {
        let kind = raw
            .get("$type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        self.record(Direction::In, &kind, raw.clone());

        match serde_json::from_value::<ServerMessage>(raw) {
            Ok(message) => self.apply(message).await,
            Err(err) => trace!(kind = %kind, error = %err, "ignoring upstream message"),
        }
    }

    async fn apply(&self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { session_id } => {
                debug!(session_id = ?session_id, "upstream ready");
            }
            ServerMessage::ChatStarted {
                chat_id,
                session_id,
                context,
            } => {
                let Some(id) = session_id.or(chat_id) else {
                    warn!("chatStarted without chat or session id");
                    return;
                };
                let characters = context.characters;
                if self.state.open_chat(id, characters.clone()) {
                    self.emit(GatewayEvent::ChatStarted { characters });
                }
            }
            ServerMessage::ChatClosed { .. } => {
                if self.state.close_chat() {
                    self.emit(GatewayEvent::ChatClosed {});
                }
            }
            ServerMessage::ReplyGenerating { .. } => {
                self.signal(ReplySignal::Generating).await;
            }
            ServerMessage::ReplyStart {
                message_id,
                sender_id,
            } => {
                self.state.set_last_message(Some(message_id.clone()));
                self.state.set_current_speaker(sender_id.clone());
                self.signal(ReplySignal::Started {
                    message_id,
                    character_id: sender_id,
                })
                .await;
            }
            ServerMessage::ReplyChunk {
                message_id,
                sender_id,
                text,
                ..
            } => {
                self.signal(ReplySignal::Chunk {
                    message_id,
                    character_id: sender_id,
                    text,
                })
                .await;
            }
            ServerMessage::ReplyEnd { message_id } => {
                self.signal(ReplySignal::Completed { message_id }).await;
            }
            ServerMessage::ReplyCancelled { message_id } => {
                self.signal(ReplySignal::Cancelled { message_id }).await;
            }
            ServerMessage::SpeechPlaybackStart {
                message_id,
                sender_id,
            } => {
                self.signal(ReplySignal::PlaybackStarted {
                    message_id,
                    character_id: sender_id,
                })
                .await;
            }
            ServerMessage::SpeechPlaybackComplete { message_id } => {
                self.signal(ReplySignal::PlaybackComplete { message_id }).await;
            }
            ServerMessage::InterruptSpeech {} => {
                self.signal(ReplySignal::SpeechInterrupted).await;
            }
            ServerMessage::ParticipantsUpdated { participants } => {
                let characters: Vec<CharacterInfo> =
                    participants.into_iter().map(Into::into).collect();
                self.state.set_characters(characters.clone());
                self.emit(GatewayEvent::CharactersUpdated { characters });
            }
            ServerMessage::Action {
                value,
                arguments,
                sender_id,
                ..
            } => {
                self.emit(GatewayEvent::AppTrigger {
                    name: value,
                    arguments: flatten_arguments(arguments),
                    character_id: sender_id,
                });
            }
        }
    }

    // ── Outbound operations ──────────────────────────────────────────────

    pub async fn send_dialogue(&self, text: String, do_reply: bool) -> Result<(), ActionError> {
        let session_id = self.session()?;
        self.dispatch(ClientMessage::Send {
            session_id,
            text,
            do_reply,
            do_user_inference: true,
            do_character_inference: true,
        })
        .await
    }

    pub async fn update_context(
        &self,
        context_key: String,
        content: String,
        description: Option<String>,
    ) -> Result<(), ActionError> {
        let session_id = self.session()?;
        self.dispatch(ClientMessage::UpdateContext {
            session_id,
            context_key,
            contexts: vec![ContextDefinition {
                text: content,
                description,
            }],
        })
        .await
    }

    /// Interrupt whatever the upstream is generating or playing.
    pub async fn interrupt(&self) -> Result<(), ActionError> {
        let session_id = self.session()?;
        self.dispatch(ClientMessage::Interrupt { session_id }).await
    }

    pub async fn speech_playback_start(&self, message_id: MessageId) -> Result<(), ActionError> {
        let session_id = self.session()?;
        self.dispatch(ClientMessage::SpeechPlaybackStart {
            session_id,
            message_id,
        })
        .await
    }

    pub async fn speech_playback_complete(&self, message_id: MessageId) -> Result<(), ActionError> {
        let session_id = self.session()?;
        self.dispatch(ClientMessage::SpeechPlaybackComplete {
            session_id,
            message_id,
        })
        .await
    }

    /// Ask the upstream engine to generate a spoken reply.
    pub async fn request_reply(&self, character_id: CharacterId) -> Result<(), ActionError> {
        let session_id = self.session()?;
        self.dispatch(ClientMessage::CharacterSpeechRequest {
            session_id,
            character_id,
        })
        .await
    }

    /// Raw traffic history, oldest first.
    pub fn history(&self) -> Vec<TrafficRecord> {
        self.history.lock().iter().cloned().collect()
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn dispatch(&self, message: ClientMessage) -> Result<(), ActionError> {
        if !self.state.connected() {
            return Err(ActionError::UpstreamUnavailable);
        }
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or(ActionError::UpstreamUnavailable)?;
        sender
            .send(message)
            .await
            .map_err(|_| ActionError::UpstreamUnavailable)
    }

    fn session(&self) -> Result<voxgate_core::ids::ChatId, ActionError> {
        self.state
            .chat_session_id()
            .ok_or_else(|| ActionError::PreconditionFailed("no active chat".into()))
    }

    fn emit(&self, event: GatewayEvent) {
        // Err just means no subscribers yet.
        let _ = self.event_tx.send(event);
    }

    async fn signal(&self, signal: ReplySignal) {
        if self.reply_tx.send(signal).await.is_err() {
            warn!("reply signal dropped, orchestrator loop gone");
        }
    }

    fn record(&self, direction: Direction, kind: &str, data: Value) {
        let mut history = self.history.lock();
        while history.len() >= self.config.history_capacity {
            history.pop_front();
        }
        history.push_back(TrafficRecord {
            direction,
            kind: kind.to_string(),
            data,
            timestamp: unix_now(),
        });
    }
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn to_history_value(message: &ClientMessage) -> Value {
    serde_json::to_value(message).unwrap_or(Value::Null)
}

/// Voxta wraps action arguments in a single-element array; unwrap it so
/// downstream consumers get the object directly.
fn flatten_arguments(arguments: Value) -> Value {
    match arguments {
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        other => other,
    }
}
