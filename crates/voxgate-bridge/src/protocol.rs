//! Typed Voxta hub messages.
//!
//! The hub speaks SignalR JSON framing: `0x1e`-terminated records, invocations
//! carrying one `$type`-tagged payload. Only the payloads the gateway acts on
//! are modeled here; anything else is logged and ignored by the bridge.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use voxgate_core::ids::{CharacterId, ChatId, MessageId};
use voxgate_core::state::CharacterInfo;

/// Record separator between SignalR JSON frames.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Inbound hub payloads, tagged by `$type`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "$type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Welcome {
        #[serde(default)]
        session_id: Option<ChatId>,
    },
    ChatStarted {
        #[serde(default)]
        chat_id: Option<ChatId>,
        #[serde(default)]
        session_id: Option<ChatId>,
        #[serde(default)]
        context: ChatContext,
    },
    ChatClosed {
        #[serde(default)]
        chat_id: Option<ChatId>,
    },
    ReplyGenerating {
        #[serde(default)]
        message_id: Option<MessageId>,
        #[serde(default)]
        sender_id: Option<CharacterId>,
    },
    ReplyStart {
        message_id: MessageId,
        #[serde(default)]
        sender_id: Option<CharacterId>,
    },
    ReplyChunk {
        message_id: MessageId,
        sender_id: CharacterId,
        text: String,
        #[serde(default)]
        start_index: u64,
    },
    ReplyEnd {
        message_id: MessageId,
    },
    ReplyCancelled {
        message_id: MessageId,
    },
    SpeechPlaybackStart {
        #[serde(default)]
        message_id: Option<MessageId>,
        #[serde(default)]
        sender_id: Option<CharacterId>,
    },
    SpeechPlaybackComplete {
        #[serde(default)]
        message_id: Option<MessageId>,
    },
    InterruptSpeech {},
    ParticipantsUpdated {
        #[serde(default)]
        participants: Vec<Participant>,
    },
    Action {
        value: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default)]
        sender_id: Option<CharacterId>,
        #[serde(default)]
        role: Option<String>,
    },
}

/// Context block inside `chatStarted`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ChatContext {
    #[serde(default)]
    pub characters: Vec<CharacterInfo>,
}

/// Participant entries key the character id as `characterId`, unlike the
/// `chatStarted` character list which uses `id`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(rename = "characterId", alias = "id")]
    pub id: CharacterId,
    pub name: String,
    #[serde(default)]
    pub creator_notes: Option<String>,
    #[serde(default)]
    pub text_gen_service: Option<String>,
}

impl From<Participant> for CharacterInfo {
    fn from(p: Participant) -> Self {
        CharacterInfo {
            id: p.id,
            name: p.name,
            creator_notes: p.creator_notes,
            text_gen_service: p.text_gen_service,
        }
    }
}

/// Outbound hub payloads, tagged by `$type`.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "$type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Authenticate {
        client: String,
        client_version: String,
        scope: Vec<String>,
        capabilities: Capabilities,
    },
    Send {
        session_id: ChatId,
        text: String,
        do_reply: bool,
        do_user_inference: bool,
        do_character_inference: bool,
    },
    Interrupt {
        session_id: ChatId,
    },
    UpdateContext {
        session_id: ChatId,
        context_key: String,
        contexts: Vec<ContextDefinition>,
    },
    SpeechPlaybackStart {
        session_id: ChatId,
        message_id: MessageId,
    },
    SpeechPlaybackComplete {
        session_id: ChatId,
        message_id: MessageId,
    },
    CharacterSpeechRequest {
        session_id: ChatId,
        character_id: CharacterId,
    },
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub audio_input: String,
    pub audio_output: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ContextDefinition {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ClientMessage {
    pub fn authenticate() -> Self {
        Self::Authenticate {
            client: "Voxgate".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            scope: vec!["role:app".into(), "broadcast:write".into()],
            capabilities: Capabilities {
                audio_input: "None".into(),
                audio_output: "Url".into(),
            },
        }
    }

    /// Short name for traffic history records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Send { .. } => "send",
            Self::Interrupt { .. } => "interrupt",
            Self::UpdateContext { .. } => "updateContext",
            Self::SpeechPlaybackStart { .. } => "speechPlaybackStart",
            Self::SpeechPlaybackComplete { .. } => "speechPlaybackComplete",
            Self::CharacterSpeechRequest { .. } => "characterSpeechRequest",
        }
    }
}

/// Serialize one SignalR record with its terminator.
pub fn encode_frame(value: &Value) -> String {
    let mut text = value.to_string();
    text.push(RECORD_SEPARATOR);
    text
}

/// Split a WebSocket text message into its JSON records. A single message may
/// carry several; trailing garbage is dropped with a log line rather than
/// failing the connection.
pub fn decode_frames(text: &str) -> Vec<Value> {
    text.split(RECORD_SEPARATOR)
        .filter(|part| !part.is_empty())
        .filter_map(|part| match serde_json::from_str(part) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed hub record");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_started_parses_characters() {
        let msg: ServerMessage = serde_json::from_value(serde_json::json!({
            "$type": "chatStarted",
            "chatId": "chat-123",
            "sessionId": "session-123",
            "context": {
                "characters": [{
                    "id": "char-1",
                    "name": "Apex",
                    "creatorNotes": "Notes",
                    "textGenService": "Service"
                }]
            }
        }))
        .unwrap();
        let ServerMessage::ChatStarted { chat_id, session_id, context } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(chat_id.unwrap().as_str(), "chat-123");
        assert_eq!(session_id.unwrap().as_str(), "session-123");
        assert_eq!(context.characters[0].name, "Apex");
        assert_eq!(context.characters[0].creator_notes.as_deref(), Some("Notes"));
    }

    #[test]
    fn reply_chunk_parses_camel_case_fields() {
        let msg: ServerMessage = serde_json::from_value(serde_json::json!({
            "$type": "replyChunk",
            "messageId": "m1",
            "senderId": "c1",
            "text": "h",
            "startIndex": 0
        }))
        .unwrap();
        let ServerMessage::ReplyChunk { message_id, sender_id, text, start_index } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(message_id.as_str(), "m1");
        assert_eq!(sender_id.as_str(), "c1");
        assert_eq!(text, "h");
        assert_eq!(start_index, 0);
    }

    #[test]
    fn participants_accept_character_id_key() {
        let msg: ServerMessage = serde_json::from_value(serde_json::json!({
            "$type": "participantsUpdated",
            "participants": [{"characterId": "char-2", "name": "Bob"}]
        }))
        .unwrap();
        let ServerMessage::ParticipantsUpdated { participants } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(participants[0].id.as_str(), "char-2");
        assert_eq!(participants[0].name, "Bob");
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let result: Result<ServerMessage, _> = serde_json::from_value(serde_json::json!({
            "$type": "somethingNew",
            "val": 1
        }));
        assert!(result.is_err());
    }

    #[test]
    fn outbound_send_serializes_with_type_tag() {
        let msg = ClientMessage::Send {
            session_id: ChatId::from_raw("sess-1"),
            text: "hello".into(),
            do_reply: true,
            do_user_inference: true,
            do_character_inference: true,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["$type"], "send");
        assert_eq!(json["sessionId"], "sess-1");
        assert_eq!(json["doReply"], true);
    }

    #[test]
    fn frame_roundtrip_splits_multiple_records() {
        let a = serde_json::json!({"type": 6});
        let b = serde_json::json!({"type": 1, "target": "ReceiveMessage"});
        let wire = format!("{}{}", encode_frame(&a), encode_frame(&b));
        let frames = decode_frames(&wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["type"], 6);
        assert_eq!(frames[1]["target"], "ReceiveMessage");
    }

    #[test]
    fn malformed_record_is_dropped_not_fatal() {
        let wire = format!("not-json{}{{\"type\":6}}{}", RECORD_SEPARATOR, RECORD_SEPARATOR);
        let frames = decode_frames(&wire);
        assert_eq!(frames.len(), 1);
    }
}
