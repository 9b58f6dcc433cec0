use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{CharacterId, MessageId};
use crate::state::{AiState, CharacterInfo};

/// State-change events fanned out to downstream subscribers.
///
/// The tag doubles as the subscription key clients send in their subscribe
/// frame. Payload fields are camelCase on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum GatewayEvent {
    ChatStarted {
        characters: Vec<CharacterInfo>,
    },
    ChatClosed {},
    AiStateChanged {
        old_state: AiState,
        new_state: AiState,
    },
    DialogueReceived {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        character_id: Option<CharacterId>,
        source: DialogueSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        author: Option<String>,
    },
    SentenceReady {
        text: String,
        character_id: CharacterId,
        message_id: MessageId,
    },
    ExternalSpeakerStarted {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ExternalSpeakerStopped {
        source: String,
    },
    CharactersUpdated {
        characters: Vec<CharacterInfo>,
    },
    AppTrigger {
        name: String,
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        character_id: Option<CharacterId>,
    },
    VoxtaConnected {},
    VoxtaDisconnected {},
}

impl GatewayEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ChatStarted { .. } => "chat_started",
            Self::ChatClosed {} => "chat_closed",
            Self::AiStateChanged { .. } => "ai_state_changed",
            Self::DialogueReceived { .. } => "dialogue_received",
            Self::SentenceReady { .. } => "sentence_ready",
            Self::ExternalSpeakerStarted { .. } => "external_speaker_started",
            Self::ExternalSpeakerStopped { .. } => "external_speaker_stopped",
            Self::CharactersUpdated { .. } => "characters_updated",
            Self::AppTrigger { .. } => "app_trigger",
            Self::VoxtaConnected {} => "voxta_connected",
            Self::VoxtaDisconnected {} => "voxta_disconnected",
        }
    }
}

/// Where a piece of dialogue originated. `Ai` is emit-only: it marks completed
/// upstream replies and is rejected as an input to the dialogue action.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogueSource {
    User,
    Game,
    Twitch,
    Ai,
}

impl DialogueSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Game => "game",
            Self::Twitch => "twitch",
            Self::Ai => "ai",
        }
    }

    /// Prefix non-user dialogue so characters can tell channels apart.
    pub fn format(&self, author: Option<&str>, text: &str) -> String {
        let prefix = match self {
            Self::User | Self::Ai => return text.to_string(),
            Self::Game => "[GAME]",
            Self::Twitch => "[TWITCH]",
        };
        match author {
            Some(author) => format!("{prefix} {author}: {text}"),
            None => format!("{prefix} {text}"),
        }
    }

    /// User dialogue expects an immediate reply; relayed channels do not.
    pub fn default_immediate_reply(&self) -> bool {
        matches!(self, Self::User)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tag_matches_event_type() {
        let events = vec![
            GatewayEvent::ChatClosed {},
            GatewayEvent::AiStateChanged {
                old_state: AiState::Idle,
                new_state: AiState::Thinking,
            },
            GatewayEvent::SentenceReady {
                text: "Hello!".into(),
                character_id: CharacterId::from_raw("c1"),
                message_id: MessageId::from_raw("m1"),
            },
            GatewayEvent::VoxtaConnected {},
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
        }
    }

    #[test]
    fn payload_fields_are_camel_case() {
        let event = GatewayEvent::AiStateChanged {
            old_state: AiState::Idle,
            new_state: AiState::Speaking,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["oldState"], "idle");
        assert_eq!(json["newState"], "speaking");

        let event = GatewayEvent::SentenceReady {
            text: "Hi.".into(),
            character_id: CharacterId::from_raw("c1"),
            message_id: MessageId::from_raw("m1"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["characterId"], "c1");
        assert_eq!(json["messageId"], "m1");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let event = GatewayEvent::DialogueReceived {
            message_id: None,
            text: "hi".into(),
            character_id: None,
            source: DialogueSource::User,
            author: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("messageId").is_none());
        assert!(json.get("author").is_none());
        assert_eq!(json["source"], "user");
    }

    #[test]
    fn serde_roundtrip() {
        let event = GatewayEvent::AppTrigger {
            name: "do_something".into(),
            arguments: serde_json::json!({"arg1": "val1"}),
            character_id: Some(CharacterId::from_raw("char-1")),
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: GatewayEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
    }

    #[test]
    fn dialogue_formatting_by_source() {
        assert_eq!(DialogueSource::User.format(None, "Hello"), "Hello");
        assert_eq!(
            DialogueSource::Game.format(Some("NPC"), "Look out!"),
            "[GAME] NPC: Look out!"
        );
        assert_eq!(DialogueSource::Game.format(None, "Door opens"), "[GAME] Door opens");
        assert_eq!(
            DialogueSource::Twitch.format(Some("viewer1"), "hi chat"),
            "[TWITCH] viewer1: hi chat"
        );
        assert_eq!(DialogueSource::Twitch.format(None, "raid!"), "[TWITCH] raid!");
    }

    #[test]
    fn immediate_reply_defaults() {
        assert!(DialogueSource::User.default_immediate_reply());
        assert!(!DialogueSource::Game.default_immediate_reply());
        assert!(!DialogueSource::Twitch.default_immediate_reply());
    }
}
