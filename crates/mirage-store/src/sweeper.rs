use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::SessionStore;

/// Background task enforcing session TTL and cap on a fixed interval.
pub struct EvictionSweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl EvictionSweeper {
    /// Start sweeping. The task stops when `cancel` (or a parent token) fires.
    pub fn spawn(store: Arc<SessionStore>, interval: Duration, cancel: CancellationToken) -> Self {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = store.sweep();
                        if report.total() > 0 {
                            tracing::info!(
                                expired = report.expired,
                                over_cap = report.over_cap,
                                remaining = store.session_count(),
                                "session sweep"
                            );
                        }
                    }
                }
            }
            tracing::debug!("eviction sweeper stopped");
        });
        Self { cancel, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "eviction sweeper task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use mirage_core::clock::{ManualClock, SequentialIds};

    fn store(clock: Arc<ManualClock>) -> Arc<SessionStore> {
        Arc::new(SessionStore::new(
            StoreConfig {
                session_ttl: Some(Duration::from_secs(30)),
                session_cap: 100,
            },
            clock,
            Arc::new(SequentialIds::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_expired_sessions_on_tick() {
        let clock = Arc::new(ManualClock::epoch());
        let store = store(clock.clone());
        let id = store.open_session(None).id().clone();
        let sweeper = EvictionSweeper::spawn(Arc::clone(&store), Duration::from_secs(10), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(store.contains(&id));

        clock.advance(chrono::Duration::seconds(60));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!store.contains(&id));

        sweeper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_loop() {
        let clock = Arc::new(ManualClock::epoch());
        let parent = CancellationToken::new();
        let sweeper = EvictionSweeper::spawn(store(clock), Duration::from_secs(5), parent.child_token());

        parent.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(sweeper.is_finished());
        sweeper.shutdown().await;
    }
}
