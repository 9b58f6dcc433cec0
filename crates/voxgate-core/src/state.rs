//! Canonical session state mirrored from the upstream engine.
//!
//! `StateStore` is the single owner of `GatewayState`. Every mutation goes
//! through `mutate`, which holds the write lock for the whole closure: mutations
//! are atomic and strictly serialized, so read-modify-write sequences (the
//! `aiState` transitions in particular) cannot lose updates between the
//! upstream-driven and externally-driven paths. `snapshot` clones under the read
//! lock and is always a consistent point-in-time copy.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ids::{CharacterId, ChatId, MessageId};

/// What the AI is currently doing, as far as downstream consumers care.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiState {
    #[default]
    Idle,
    Thinking,
    Speaking,
}

impl fmt::Display for AiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        };
        f.write_str(s)
    }
}

/// One chat participant. Immutable: replaced wholesale on updates, never
/// field-patched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterInfo {
    pub id: CharacterId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_gen_service: Option<String>,
}

/// The mirrored session state. Owned exclusively by `StateStore`.
#[derive(Clone, Debug, Default)]
pub struct GatewayState {
    pub connected: bool,
    /// Opaque upstream session id; `chat_active == chat_session_id.is_some()`.
    pub chat_session_id: Option<ChatId>,
    pub ai_state: AiState,
    pub current_speaker_id: Option<CharacterId>,
    pub external_speaker_active: bool,
    pub external_speaker_source: Option<String>,
    /// Upstream-provided participant order, not deduplicated.
    pub characters: Vec<CharacterInfo>,
    /// Most recent reply message id, used to close out playback upstream.
    pub last_message_id: Option<MessageId>,
}

impl GatewayState {
    pub fn chat_active(&self) -> bool {
        self.chat_session_id.is_some()
    }

    pub fn to_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            connected: self.connected,
            chat_active: self.chat_active(),
            ai_state: self.ai_state,
            current_speaker_id: self.current_speaker_id.clone(),
            external_speaker_active: self.external_speaker_active,
            external_speaker_source: self.external_speaker_source.clone(),
            characters: self.characters.clone(),
        }
    }
}

/// Serializable render of the state, sent on subscribe and from `GET /state`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub connected: bool,
    pub chat_active: bool,
    pub ai_state: AiState,
    pub current_speaker_id: Option<CharacterId>,
    pub external_speaker_active: bool,
    pub external_speaker_source: Option<String>,
    pub characters: Vec<CharacterInfo>,
}

/// Shared handle to the canonical state. Cheap to clone.
#[derive(Clone, Default)]
pub struct StateStore {
    inner: Arc<RwLock<GatewayState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one mutation atomically. No two mutations interleave.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut GatewayState) -> R) -> R {
        let mut state = self.inner.write();
        f(&mut state)
    }

    /// Consistent point-in-time copy, safe to call concurrently with mutations.
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.read().to_snapshot()
    }

    pub fn connected(&self) -> bool {
        self.inner.read().connected
    }

    pub fn chat_active(&self) -> bool {
        self.inner.read().chat_active()
    }

    pub fn chat_session_id(&self) -> Option<ChatId> {
        self.inner.read().chat_session_id.clone()
    }

    pub fn ai_state(&self) -> AiState {
        self.inner.read().ai_state
    }

    pub fn external_speaker_active(&self) -> bool {
        self.inner.read().external_speaker_active
    }

    pub fn last_message_id(&self) -> Option<MessageId> {
        self.inner.read().last_message_id.clone()
    }

    pub fn first_character_id(&self) -> Option<CharacterId> {
        self.inner.read().characters.first().map(|c| c.id.clone())
    }

    /// Returns true if the flag actually changed.
    pub fn set_connected(&self, connected: bool) -> bool {
        self.mutate(|s| {
            let changed = s.connected != connected;
            s.connected = connected;
            changed
        })
    }

    /// Open (or replace) the active chat. Returns false when the same chat is
    /// already open, so duplicate `chatStarted` signals stay silent.
    pub fn open_chat(&self, id: ChatId, characters: Vec<CharacterInfo>) -> bool {
        self.mutate(|s| {
            if s.chat_session_id.as_ref() == Some(&id) {
                s.characters = characters;
                return false;
            }
            s.chat_session_id = Some(id);
            s.characters = characters;
            s.current_speaker_id = None;
            s.last_message_id = None;
            true
        })
    }

    /// Close the active chat. Returns false when no chat was open (duplicate
    /// `chatClosed` signals are no-ops).
    pub fn close_chat(&self) -> bool {
        self.mutate(|s| {
            if s.chat_session_id.is_none() {
                return false;
            }
            s.chat_session_id = None;
            s.characters.clear();
            s.current_speaker_id = None;
            s.last_message_id = None;
            true
        })
    }

    /// Returns `Some((old, new))` when the state changed, `None` otherwise so
    /// callers can suppress redundant `ai_state_changed` events.
    pub fn set_ai_state(&self, new: AiState) -> Option<(AiState, AiState)> {
        self.mutate(|s| {
            let old = s.ai_state;
            if old == new {
                return None;
            }
            s.ai_state = new;
            Some((old, new))
        })
    }

    pub fn set_characters(&self, characters: Vec<CharacterInfo>) {
        self.mutate(|s| s.characters = characters);
    }

    pub fn set_current_speaker(&self, speaker: Option<CharacterId>) {
        self.mutate(|s| s.current_speaker_id = speaker);
    }

    pub fn set_last_message(&self, message_id: Option<MessageId>) {
        self.mutate(|s| s.last_message_id = message_id);
    }

    /// Returns the prior `(active, source)` pair. An inactive external speaker
    /// never carries a source.
    pub fn set_external_speaker(
        &self,
        active: bool,
        source: Option<String>,
    ) -> (bool, Option<String>) {
        self.mutate(|s| {
            let prior = (s.external_speaker_active, s.external_speaker_source.take());
            s.external_speaker_active = active;
            s.external_speaker_source = if active { source } else { None };
            prior
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn character(id: &str, name: &str) -> CharacterInfo {
        CharacterInfo {
            id: CharacterId::from_raw(id),
            name: name.into(),
            creator_notes: None,
            text_gen_service: None,
        }
    }

    #[test]
    fn chat_active_tracks_session_id_over_any_sequence() {
        let store = StateStore::new();
        let ops: &[(&str, bool)] = &[
            ("open", true),
            ("open", true),
            ("close", false),
            ("close", false),
            ("open", true),
            ("close", false),
        ];
        for (op, expect_active) in ops {
            match *op {
                "open" => {
                    store.open_chat(ChatId::from_raw("chat-1"), vec![]);
                }
                _ => {
                    store.close_chat();
                }
            }
            let snap = store.snapshot();
            assert_eq!(snap.chat_active, *expect_active);
            assert_eq!(store.chat_session_id().is_some(), *expect_active);
        }
    }

    #[test]
    fn duplicate_open_and_close_are_no_ops() {
        let store = StateStore::new();
        assert!(store.open_chat(ChatId::from_raw("c"), vec![character("1", "Apex")]));
        assert!(!store.open_chat(ChatId::from_raw("c"), vec![character("1", "Apex")]));
        assert!(store.close_chat());
        assert!(!store.close_chat());
    }

    #[test]
    fn close_chat_clears_dependent_fields() {
        let store = StateStore::new();
        store.open_chat(ChatId::from_raw("c"), vec![character("1", "Apex")]);
        store.set_current_speaker(Some(CharacterId::from_raw("1")));
        store.set_last_message(Some(MessageId::from_raw("m1")));

        store.close_chat();

        let snap = store.snapshot();
        assert!(snap.characters.is_empty());
        assert!(snap.current_speaker_id.is_none());
        assert!(store.last_message_id().is_none());
    }

    #[test]
    fn ai_state_change_reports_old_and_new() {
        let store = StateStore::new();
        assert_eq!(
            store.set_ai_state(AiState::Thinking),
            Some((AiState::Idle, AiState::Thinking))
        );
        assert_eq!(store.set_ai_state(AiState::Thinking), None);
        assert_eq!(
            store.set_ai_state(AiState::Speaking),
            Some((AiState::Thinking, AiState::Speaking))
        );
    }

    #[test]
    fn inactive_external_speaker_has_no_source() {
        let store = StateStore::new();
        store.set_external_speaker(true, Some("game".into()));
        assert!(store.external_speaker_active());

        let (was_active, prior_source) = store.set_external_speaker(false, Some("ignored".into()));
        assert!(was_active);
        assert_eq!(prior_source.as_deref(), Some("game"));

        let snap = store.snapshot();
        assert!(!snap.external_speaker_active);
        assert!(snap.external_speaker_source.is_none());
    }

    #[test]
    fn set_connected_reports_changes_only() {
        let store = StateStore::new();
        assert!(store.set_connected(true));
        assert!(!store.set_connected(true));
        assert!(store.set_connected(false));
    }

    #[test]
    fn snapshot_serializes_with_camel_case_keys() {
        let store = StateStore::new();
        store.open_chat(ChatId::from_raw("c"), vec![character("1", "Apex")]);
        let json = serde_json::to_value(store.snapshot()).unwrap();
        assert_eq!(json["chatActive"], true);
        assert_eq!(json["aiState"], "idle");
        assert_eq!(json["externalSpeakerActive"], false);
        assert_eq!(json["characters"][0]["name"], "Apex");
        // Internal chat session id never leaves the process.
        assert!(json.get("chatSessionId").is_none());
    }

    #[test]
    fn character_info_parses_upstream_payload() {
        let info: CharacterInfo = serde_json::from_value(serde_json::json!({
            "id": "char-1",
            "name": "Apex",
            "creatorNotes": "Notes",
            "textGenService": "Service"
        }))
        .unwrap();
        assert_eq!(info.creator_notes.as_deref(), Some("Notes"));
        assert_eq!(info.text_gen_service.as_deref(), Some("Service"));
    }
}
