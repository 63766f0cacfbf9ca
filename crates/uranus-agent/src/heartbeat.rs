use std::sync::Arc;
use std::time::Duration;

use liburanus::{Outbound, Transport};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uranus_protocol::{HeartbeatMessage, Topics, now_millis};

pub fn heartbeat_message(agent_id: &str) -> HeartbeatMessage {
    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    HeartbeatMessage {
        uuid: agent_id.to_string(),
        hostname,
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: now_millis(),
    }
}

/// Publish a heartbeat immediately and then every `every` until shutdown.
pub async fn run_heartbeat(
    transport: Arc<dyn Transport>,
    topics: Topics,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let message = heartbeat_message(topics.agent_id());
        match transport
            .publish(&topics.heartbeat(), Outbound::Heartbeat(message))
            .await
        {
            Ok(()) => debug!("heartbeat sent"),
            Err(err) => warn!(error = %err, "heartbeat publish failed"),
        }
    }
}
