//! Background expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::Engine;

/// Handle to a running sweep.
pub struct ExpirySweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ExpirySweeper {
    /// Start sweeping every `config.expire_sweep_interval_secs`.
    #[must_use]
    pub fn spawn(engine: Arc<Engine>) -> Self {
        let interval = engine.config().sweep_interval();
        Self::spawn_with_interval(engine, interval)
    }

    /// Start sweeping every `interval`.
    #[must_use]
    pub fn spawn_with_interval(engine: Arc<Engine>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Starting node expiry sweep");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match engine.expire_nodes().await {
                            Ok(removed) if removed.is_empty() => {
                                debug!("Expiry sweep removed nothing");
                            }
                            Ok(removed) => {
                                info!(count = removed.len(), "Expiry sweep removed nodes");
                            }
                            Err(e) => error!(error = %e, "Expiry sweep failed"),
                        }
                    }
                }
            }
            info!("Node expiry sweep stopped");
        });

        Self { cancel, handle }
    }

    /// Token that stops the sweep when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the sweep and wait for the task to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Expiry sweep task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;
    use crate::config::EngineConfig;
    use crate::models::{HardwareIdentity, Node};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_sweep_removes_stale_nodes_and_stops() {
        let engine = Arc::new(
            Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default()).unwrap(),
        );
        let facts = BTreeMap::from([("k".to_string(), "v".to_string())]);
        let node = engine
            .register(&HardwareIdentity::from_uuid("OLD"), None, facts)
            .await
            .unwrap();
        let mut node = engine.get_node(&node.uuid).await.unwrap();
        node.last_checkin = Utc::now() - ChronoDuration::seconds(3_600);
        engine.documents().persist(&node).await.unwrap();

        let sweeper =
            ExpirySweeper::spawn_with_interval(Arc::clone(&engine), Duration::from_millis(10));
        for _ in 0..100 {
            if engine.documents().all::<Node>().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.documents().all::<Node>().await.unwrap().is_empty());
        sweeper.shutdown().await;
    }
}
