//! Periodic liveness probe. Not on the critical path of data correctness.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use shared::counter;

use crate::metrics_defs::HEARTBEAT_TICKS;

/// Spawns a loop that calls `health` every `interval` and records the
/// outcome. Returns the task handle and a flag holding the latest result.
pub fn spawn<F, Fut>(
    interval: Duration,
    health: F,
    mut shutdown: broadcast::Receiver<()>,
) -> (JoinHandle<()>, Arc<AtomicBool>)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
{
    let alive = Arc::new(AtomicBool::new(false));
    let alive_out = alive.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("heartbeat stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let healthy = health().await;
                    alive.store(healthy, Ordering::Relaxed);
                    counter!(HEARTBEAT_TICKS, "healthy" => if healthy { "true" } else { "false" })
                        .increment(1);
                    tracing::debug!(healthy, "heartbeat");
                }
            }
        }
    });

    (handle, alive_out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_health_result_each_tick() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (handle, alive) = spawn(
            Duration::from_millis(10),
            || async { true },
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(alive.load(Ordering::Relaxed));

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
