pub mod bridge;
pub mod client;
pub mod protocol;

pub use bridge::{BridgeConfig, Direction, ReplySignal, TrafficRecord, VoxtaBridge};
pub use client::{BridgeError, VoxtaClient};
pub use protocol::{ClientMessage, ServerMessage};
