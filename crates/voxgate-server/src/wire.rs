//! Downstream wire frames.
//!
//! Subscribers receive JSON frames of the shape `{type, data, timestamp}`,
//! with the event payload under `data` and a unix-epoch float timestamp.
//! Snapshot, pong and handshake-error frames share the envelope style.

use serde_json::{json, Value};

use voxgate_core::events::GatewayEvent;
use voxgate_core::state::StateSnapshot;

/// Current unix time as a float with sub-second precision.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Wrap an event into its wire envelope. The serde tag becomes the frame
/// `type`; the remaining payload fields move under `data`.
pub fn event_frame(event: &GatewayEvent) -> Value {
    let mut payload = serde_json::to_value(event).unwrap_or_else(|_| json!({}));
    if let Some(map) = payload.as_object_mut() {
        map.remove("type");
    }
    json!({
        "type": event.event_type(),
        "data": payload,
        "timestamp": unix_now(),
    })
}

/// The full-state frame sent right after a successful subscribe.
pub fn snapshot_frame(snapshot: &StateSnapshot) -> Value {
    json!({
        "type": "snapshot",
        "state": snapshot,
        "timestamp": unix_now(),
    })
}

pub fn pong_frame() -> Value {
    json!({"type": "pong", "timestamp": unix_now()})
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxgate_core::ids::{CharacterId, MessageId};
    use voxgate_core::state::{AiState, StateStore};

    #[test]
    fn event_frame_moves_payload_under_data() {
        let event = GatewayEvent::SentenceReady {
            text: "Hello!".into(),
            character_id: CharacterId::from_raw("c1"),
            message_id: MessageId::from_raw("m1"),
        };
        let frame = event_frame(&event);
        assert_eq!(frame["type"], "sentence_ready");
        assert_eq!(frame["data"]["text"], "Hello!");
        assert_eq!(frame["data"]["characterId"], "c1");
        assert!(frame["data"].get("type").is_none());
        assert!(frame["timestamp"].as_f64().unwrap() > 1.7e9);
    }

    #[test]
    fn empty_payload_events_have_empty_data() {
        let frame = event_frame(&GatewayEvent::VoxtaConnected {});
        assert_eq!(frame["type"], "voxta_connected");
        assert_eq!(frame["data"], json!({}));
    }

    #[test]
    fn snapshot_frame_carries_state() {
        let store = StateStore::new();
        store.set_ai_state(AiState::Thinking);
        let frame = snapshot_frame(&store.snapshot());
        assert_eq!(frame["type"], "snapshot");
        assert_eq!(frame["state"]["aiState"], "thinking");
        assert_eq!(frame["state"]["chatActive"], false);
    }

    #[test]
    fn pong_frame_shape() {
        let frame = pong_frame();
        assert_eq!(frame["type"], "pong");
        assert!(frame["timestamp"].is_f64());
    }
}
