//! Periodic liveness probing of client connections.
//!
//! Detects half-open sockets that never signal closure. A terminated
//! connection's socket task wakes up and runs the same cleanup as a graceful
//! close, so the queue never keeps entries for dead peers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registry::ConnectionRegistry;

/// Shortest period the loop will run at
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Start the heartbeat loop. The first round runs one full interval after start.
pub fn spawn_heartbeat(registry: Arc<ConnectionRegistry>, interval: Duration) -> JoinHandle<()> {
    // tokio::time::interval panics on a zero period
    let interval = interval.max(MIN_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // consume first immediate tick

        loop {
            ticker.tick().await;
            let probed = registry.len();
            let terminated = registry.sweep();
            if terminated.is_empty() {
                debug!(probed, "Heartbeat round");
            } else {
                info!(probed, terminated = terminated.len(), "Heartbeat terminated connections");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probe_terminates() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut silent = registry.register();
        let mut chatty = registry.register();

        let task = spawn_heartbeat(Arc::clone(&registry), Duration::from_secs(30));

        // Round 1: both probed
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(silent.outbound.recv().await, Some(Outbound::Ping));
        assert_eq!(chatty.outbound.recv().await, Some(Outbound::Ping));
        registry.mark_alive(&chatty.id);

        // Round 2: the silent one is gone, the chatty one is probed again
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!registry.is_open(&silent.id));
        assert!(registry.is_open(&chatty.id));
        assert_eq!(chatty.outbound.recv().await, Some(Outbound::Ping));

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_keeps_running() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut handle = registry.register();

        let task = spawn_heartbeat(Arc::clone(&registry), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!task.is_finished());
        assert_eq!(handle.outbound.recv().await, Some(Outbound::Ping));
        assert!(!registry.is_open(&handle.id));

        task.abort();
    }
}
