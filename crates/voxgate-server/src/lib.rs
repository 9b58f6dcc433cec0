pub mod event_bridge;
pub mod gateway;
pub mod http;
pub mod server;
pub mod subscriber;
pub mod wire;

pub use gateway::Gateway;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use subscriber::{Subscriber, SubscriberRegistry, Subscription};
