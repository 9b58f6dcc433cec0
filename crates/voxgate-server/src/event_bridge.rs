use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use voxgate_core::events::GatewayEvent;

use crate::subscriber::SubscriberRegistry;

/// Forward the internal event bus into the subscriber registry. Runs until the
/// bus closes; lagging only ever skips events for everyone equally, per-client
/// backpressure is the registry's problem.
pub fn start(
    registry: Arc<SubscriberRegistry>,
    mut rx: broadcast::Receiver<GatewayEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => registry.broadcast(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event fan-out lagged, events not delivered");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("event bus closed, stopping fan-out");
                    break;
                }
            }
        }
    })
}
