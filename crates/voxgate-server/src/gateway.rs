//! The orchestrator: owns the `aiState` transition policy and the validated
//! action API.
//!
//! Two independent drivers move `aiState`: the upstream reply lifecycle
//! (forwarded by the bridge as `ReplySignal`s) and the external TTS bridge
//! reporting its own playback out of band. Both funnel through this component,
//! and every mutation goes through the serialized `StateStore`, so the two
//! paths cannot race each other into a lost update.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voxgate_bridge::bridge::{ReplySignal, VoxtaBridge};
use voxgate_core::events::{DialogueSource, GatewayEvent};
use voxgate_core::ids::{CharacterId, MessageId};
use voxgate_core::sentence::SentenceBuffer;
use voxgate_core::state::{AiState, StateStore};
use voxgate_core::ActionError;

pub struct Gateway {
    state: StateStore,
    bridge: Arc<VoxtaBridge>,
    event_tx: broadcast::Sender<GatewayEvent>,
    sentences: Mutex<SentenceBuffer>,
    /// Set when an externally-signaled playback is pending or running, so a
    /// reply completing upstream does not drop `aiState` back to idle under
    /// audio that is still playing.
    playback_pending: AtomicBool,
}

impl Gateway {
    pub fn new(
        state: StateStore,
        bridge: Arc<VoxtaBridge>,
        event_tx: broadcast::Sender<GatewayEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            bridge,
            event_tx,
            sentences: Mutex::new(SentenceBuffer::new()),
            playback_pending: AtomicBool::new(false),
        })
    }

    /// Spawn the reply-signal processing loop. A fault while handling one
    /// signal is logged and never takes the loop down.
    pub fn start_reply_loop(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<ReplySignal>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = rx.recv() => match signal {
                        Some(signal) => gateway.handle_signal(signal).await,
                        None => break,
                    },
                }
            }
            info!("reply loop stopped");
        })
    }

    async fn handle_signal(&self, signal: ReplySignal) {
        match signal {
            ReplySignal::Generating => {
                self.playback_pending.store(false, Ordering::Relaxed);
                self.transition(AiState::Thinking);
            }
            // Speaker and message bookkeeping already applied by the bridge.
            ReplySignal::Started { .. } => {}
            ReplySignal::Chunk {
                message_id,
                character_id,
                text,
            } => {
                let sentences =
                    self.sentences
                        .lock()
                        .append_chunk(&message_id, &character_id, &text);
                for sentence in sentences {
                    self.emit(GatewayEvent::SentenceReady {
                        text: sentence.text,
                        character_id: sentence.character_id,
                        message_id: sentence.message_id,
                    });
                }
            }
            ReplySignal::Completed { message_id } => {
                let flushed = self.sentences.lock().flush(&message_id);
                if let Some(flushed) = flushed {
                    if let Some(trailing) = flushed.trailing {
                        self.emit(GatewayEvent::SentenceReady {
                            text: trailing.text,
                            character_id: trailing.character_id,
                            message_id: trailing.message_id,
                        });
                    }
                    self.emit(GatewayEvent::DialogueReceived {
                        message_id: Some(message_id),
                        text: flushed.full_text,
                        character_id: Some(flushed.character_id),
                        source: DialogueSource::Ai,
                        author: None,
                    });
                }
                if self.state.ai_state() == AiState::Thinking
                    && !self.playback_pending.load(Ordering::Relaxed)
                {
                    self.transition(AiState::Idle);
                }
            }
            ReplySignal::Cancelled { message_id } => {
                self.sentences.lock().discard(&message_id);
                self.playback_pending.store(false, Ordering::Relaxed);
                if !self.state.external_speaker_active() {
                    self.transition(AiState::Idle);
                }
            }
            ReplySignal::PlaybackStarted {
                character_id,
                message_id: _,
            } => {
                self.playback_pending.store(true, Ordering::Relaxed);
                if character_id.is_some() {
                    self.state.set_current_speaker(character_id);
                }
                self.transition(AiState::Speaking);
            }
            ReplySignal::PlaybackComplete { message_id: _ } => {
                self.playback_pending.store(false, Ordering::Relaxed);
                if !self.state.external_speaker_active() {
                    self.state.set_current_speaker(None);
                    self.transition(AiState::Idle);
                }
            }
            ReplySignal::SpeechInterrupted => {
                let dropped = self.sentences.lock().discard_all();
                if dropped > 0 {
                    debug!(dropped, "discarded in-flight accumulators on interrupt");
                }
                self.playback_pending.store(false, Ordering::Relaxed);
                if !self.state.external_speaker_active() {
                    self.transition(AiState::Idle);
                }
            }
        }
    }

    // ── Actions ──────────────────────────────────────────────────────────

    /// Relay a line of dialogue into the chat. `ai` marks completed upstream
    /// replies on the event bus and is refused here.
    pub async fn send_dialogue(
        &self,
        text: String,
        source: DialogueSource,
        author: Option<String>,
        immediate_reply: Option<bool>,
    ) -> Result<(), ActionError> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(ActionError::Validation("text must not be empty".into()));
        }
        if source == DialogueSource::Ai {
            return Err(ActionError::Validation(
                "source 'ai' is reserved for upstream replies".into(),
            ));
        }
        if !self.state.chat_active() {
            return Err(ActionError::PreconditionFailed("no active chat".into()));
        }

        let formatted = source.format(author.as_deref(), &text);
        let do_reply = immediate_reply.unwrap_or_else(|| source.default_immediate_reply());
        self.bridge.send_dialogue(formatted, do_reply).await?;

        self.emit(GatewayEvent::DialogueReceived {
            message_id: None,
            text,
            character_id: None,
            source,
            author,
        });
        Ok(())
    }

    /// Replace one keyed context block in the active chat.
    pub async fn send_context(
        &self,
        key: String,
        content: String,
        description: Option<String>,
    ) -> Result<(), ActionError> {
        if key.trim().is_empty() {
            return Err(ActionError::Validation("key must not be empty".into()));
        }
        if !self.state.chat_active() {
            return Err(ActionError::PreconditionFailed("no active chat".into()));
        }
        self.bridge.update_context(key, content, description).await
    }

    /// An external audio source (game, microphone) is about to speak: interrupt
    /// any in-flight generation and mark the speaker active. No chat-active
    /// precondition; the flag must be settable before a chat exists.
    pub async fn external_speaker_start(
        &self,
        source: String,
        reason: Option<String>,
    ) -> Result<(), ActionError> {
        if source.trim().is_empty() {
            return Err(ActionError::Validation("source must not be empty".into()));
        }
        if self.state.external_speaker_active() {
            // Already interrupted; keep the original source.
            return Ok(());
        }

        if matches!(self.state.ai_state(), AiState::Thinking | AiState::Speaking) {
            let dropped = self.sentences.lock().discard_all();
            debug!(dropped, source = %source, "external speaker interrupting reply");
            self.playback_pending.store(false, Ordering::Relaxed);
            if let Err(err) = self.bridge.interrupt().await {
                debug!(error = %err, "upstream interrupt not delivered");
            }
            // Mark the interrupted reply's audio as started so the stop side
            // can close it out with a playback completion.
            if let Some(message_id) = self.state.last_message_id() {
                if let Err(err) = self.bridge.speech_playback_start(message_id).await {
                    debug!(error = %err, "playback start not reported upstream");
                }
            }
        }

        self.state.set_external_speaker(true, Some(source.clone()));
        self.emit(GatewayEvent::ExternalSpeakerStarted { source, reason });
        Ok(())
    }

    /// The external speaker finished. Optionally asks the first chat character
    /// to respond to what was said.
    pub async fn external_speaker_stop(&self, trigger_response: bool) -> Result<(), ActionError> {
        if !self.state.external_speaker_active() {
            return Ok(());
        }
        if trigger_response && !self.state.connected() {
            return Err(ActionError::UpstreamUnavailable);
        }

        let (_, prior_source) = self.state.set_external_speaker(false, None);
        self.emit(GatewayEvent::ExternalSpeakerStopped {
            source: prior_source.unwrap_or_default(),
        });

        // Close out the last reply's audio upstream before asking for a new
        // one; best effort, the external audio is already over.
        if let Some(message_id) = self.state.last_message_id() {
            if let Err(err) = self.bridge.speech_playback_complete(message_id).await {
                debug!(error = %err, "playback completion not reported upstream");
            }
        }

        if trigger_response {
            match self.state.first_character_id() {
                Some(character_id) => self.bridge.request_reply(character_id).await?,
                None => debug!("no characters to respond after external speaker"),
            }
        }
        Ok(())
    }

    /// The TTS bridge started playing a reply. The local transition always
    /// applies; a failed upstream notification is logged, not surfaced, since
    /// the audio is already playing.
    pub async fn tts_playback_start(
        &self,
        character_id: CharacterId,
        message_id: Option<MessageId>,
    ) -> Result<(), ActionError> {
        self.playback_pending.store(true, Ordering::Relaxed);
        self.state.set_current_speaker(Some(character_id));
        self.transition(AiState::Speaking);

        if let Some(message_id) = message_id.or_else(|| self.state.last_message_id()) {
            if let Err(err) = self.bridge.speech_playback_start(message_id).await {
                warn!(error = %err, "playback start not reported upstream");
            }
        }
        Ok(())
    }

    /// The TTS bridge finished playing. An active external speaker takes
    /// precedence over reverting to idle.
    pub async fn tts_playback_complete(
        &self,
        _character_id: CharacterId,
        message_id: Option<MessageId>,
    ) -> Result<(), ActionError> {
        self.playback_pending.store(false, Ordering::Relaxed);
        if !self.state.external_speaker_active() {
            self.state.set_current_speaker(None);
            self.transition(AiState::Idle);
        }

        if let Some(message_id) = message_id.or_else(|| self.state.last_message_id()) {
            if let Err(err) = self.bridge.speech_playback_complete(message_id).await {
                warn!(error = %err, "playback completion not reported upstream");
            }
        }
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn transition(&self, new: AiState) {
        if let Some((old_state, new_state)) = self.state.set_ai_state(new) {
            self.emit(GatewayEvent::AiStateChanged {
                old_state,
                new_state,
            });
        }
    }

    fn emit(&self, event: GatewayEvent) {
        let _ = self.event_tx.send(event);
    }
}
