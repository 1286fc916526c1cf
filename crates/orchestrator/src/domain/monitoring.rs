//! Resource usage history of the containers the UI is looking at.
//!
//! [`MonitoringManager::monitor`] opens the stats stream of a container and
//! records one [`StatsInfo`] per sample. Samples older than the history
//! window are dropped whenever a new one arrives, and the whole history of a
//! container goes away with the container.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use api_types::{StatsHistory, StatsInfo};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::sync;
use crate::core::{Result, UpdateNotifier};
use crate::platform::container::{ContainerEngine, ContainerEventRegistry, ContainerStats, ContainerStatus};

/// How long samples are kept.
pub const MAX_STATS_AGE: Duration = Duration::from_secs(5 * 60);

pub struct MonitoringManager {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn ContainerEngine>,
    events: Arc<ContainerEventRegistry>,
    history: RwLock<HashMap<String, StatsHistory>>,
    monitors: Mutex<HashMap<String, CancellationToken>>,
    notifier: UpdateNotifier<Vec<StatsHistory>>,
    token: CancellationToken,
    max_age: Duration,
}

impl MonitoringManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, events: Arc<ContainerEventRegistry>) -> Self {
        Self::with_max_age(engine, events, MAX_STATS_AGE)
    }

    pub fn with_max_age(
        engine: Arc<dyn ContainerEngine>,
        events: Arc<ContainerEventRegistry>,
        max_age: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                events,
                history: RwLock::new(HashMap::new()),
                monitors: Mutex::new(HashMap::new()),
                notifier: UpdateNotifier::new(),
                token: CancellationToken::new(),
                max_age,
            }),
        }
    }

    /// Starts sampling `container_id`; no-op while it is already sampled.
    ///
    /// Sampling ends when the stream fails or ends, on [`Self::stop`], or
    /// when the container is removed. Only removal clears the history.
    ///
    /// # Errors
    ///
    /// - [`crate::core::OrchestratorError::ExternalOperation`] if the stats stream cannot be opened
    #[tracing::instrument(skip(self))]
    pub async fn monitor(&self, container_id: &str) -> Result<()> {
        if self.is_monitored(container_id) {
            return Ok(());
        }
        let mut container_events = self.inner.events.subscribe(container_id);
        let mut samples = self.inner.engine.stats_container(container_id).await?;

        let token = {
            let mut monitors = sync::lock(&self.inner.monitors);
            if monitors.contains_key(container_id) {
                return Ok(());
            }
            let token = self.inner.token.child_token();
            monitors.insert(container_id.to_string(), token.clone());
            token
        };
        info!("Monitoring container");

        let inner = Arc::clone(&self.inner);
        let id = container_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    sample = samples.next() => match sample {
                        Some(Ok(sample)) => inner.push(&id, &sample, Utc::now().timestamp_millis()),
                        Some(Err(e)) => {
                            warn!(container_id = %id, "Cannot stats container: {e}");
                            break;
                        }
                        None => break,
                    },
                    status = container_events.recv() => match status {
                        Some(ContainerStatus::Remove) | None => {
                            inner.clear(&id);
                            break;
                        }
                        Some(_) => {}
                    },
                }
            }
            token.cancel();
            inner.release(&id);
            debug!(container_id = %id, "Stopped monitoring container");
        });
        Ok(())
    }

    /// Stops sampling `container_id`, keeping what was collected.
    pub fn stop(&self, container_id: &str) {
        if let Some(token) = sync::lock(&self.inner.monitors).remove(container_id) {
            token.cancel();
        }
    }

    pub fn is_monitored(&self, container_id: &str) -> bool {
        sync::lock(&self.inner.monitors).contains_key(container_id)
    }

    pub fn clear(&self, container_id: &str) {
        self.inner.clear(container_id);
    }

    /// Histories of every container, by container id.
    pub fn stats(&self) -> Vec<StatsHistory> {
        self.inner.stats()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<StatsHistory>> {
        self.inner.notifier.subscribe()
    }

    pub fn dispose(&self) {
        self.inner.token.cancel();
        sync::lock(&self.inner.monitors).clear();
    }
}

impl Inner {
    fn stats(&self) -> Vec<StatsHistory> {
        let mut stats: Vec<StatsHistory> = sync::read(&self.history).values().cloned().collect();
        stats.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        stats
    }

    fn notify(&self) {
        self.notifier.notify(self.stats());
    }

    /// Records a sample taken at `timestamp` (epoch milliseconds).
    fn push(&self, container_id: &str, sample: &ContainerStats, timestamp: i64) {
        let max_age = i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX);
        let limit = timestamp.saturating_sub(max_age);
        {
            let mut history = sync::write(&self.history);
            let entry = history
                .entry(container_id.to_string())
                .or_insert_with(|| StatsHistory {
                    container_id: container_id.to_string(),
                    stats: Vec::new(),
                });
            entry.stats.retain(|s| s.timestamp > limit);
            entry.stats.push(StatsInfo {
                timestamp,
                cpu_usage: sample.cpu_usage,
                memory_usage: sample.memory_usage,
            });
        }
        self.notify();
    }

    fn clear(&self, container_id: &str) {
        if sync::write(&self.history).remove(container_id).is_some() {
            self.notify();
        }
    }

    /// Forgets the monitor of `container_id` unless a newer one replaced it.
    fn release(&self, container_id: &str) {
        let mut monitors = sync::lock(&self.monitors);
        if monitors.get(container_id).is_some_and(|t| t.is_cancelled()) {
            monitors.remove(container_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::platform::container::EngineEvent;
    use crate::testing::{eventually, MockContainerEngine};

    struct Fixture {
        engine: Arc<MockContainerEngine>,
        events: Arc<ContainerEventRegistry>,
        manager: MonitoringManager,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(MockContainerEngine::new());
        let events = Arc::new(ContainerEventRegistry::new());
        let manager = MonitoringManager::new(engine.clone(), events.clone());
        Fixture {
            engine,
            events,
            manager,
        }
    }

    fn sample(cpu_usage: u64) -> ContainerStats {
        ContainerStats {
            cpu_usage,
            memory_usage: 1024,
        }
    }

    fn timestamps(manager: &MonitoringManager, id: &str) -> Vec<i64> {
        manager
            .stats()
            .into_iter()
            .find(|h| h.container_id == id)
            .map(|h| h.stats.iter().map(|s| s.timestamp).collect())
            .unwrap_or_default()
    }

    #[test]
    fn samples_older_than_the_window_are_pruned() {
        let f = fixture();
        let minute = 60_000;
        let t0 = 1_700_000_000_000;

        f.manager.inner.push("c1", &sample(1), t0);
        f.manager.inner.push("c1", &sample(2), t0 + 2 * minute);
        f.manager.inner.push("c2", &sample(3), t0);
        f.manager.inner.push("c1", &sample(4), t0 + 6 * minute);

        assert_eq!(timestamps(&f.manager, "c1"), vec![t0 + 2 * minute, t0 + 6 * minute]);
        // other containers are only pruned by their own samples
        assert_eq!(timestamps(&f.manager, "c2"), vec![t0]);
    }

    #[test]
    fn a_sample_exactly_at_the_limit_is_dropped() {
        let f = fixture();
        let window = i64::try_from(MAX_STATS_AGE.as_millis()).unwrap();

        f.manager.inner.push("c1", &sample(1), 0);
        f.manager.inner.push("c1", &sample(2), window);

        assert_eq!(timestamps(&f.manager, "c1"), vec![window]);
    }

    #[tokio::test]
    async fn samples_are_published_until_the_container_is_removed() {
        let f = fixture();
        let mut updates = f.manager.subscribe();

        f.manager.monitor("c1").await.unwrap();
        f.engine.emit_stats("c1", 500, 2048);

        let update = updates.recv().await.unwrap();
        assert_eq!(update.len(), 1);
        assert_eq!(update[0].container_id, "c1");
        assert_eq!(update[0].stats[0].cpu_usage, 500);
        assert_eq!(update[0].stats[0].memory_usage, 2048);

        f.events.dispatch(EngineEvent::Container {
            id: "c1".to_string(),
            status: ContainerStatus::Remove,
        });
        assert!(eventually(|| f.manager.stats().is_empty()).await);
        assert!(eventually(|| !f.manager.is_monitored("c1")).await);
    }

    #[tokio::test]
    async fn monitoring_twice_opens_one_stream() {
        let f = fixture();

        f.manager.monitor("c1").await.unwrap();
        f.manager.monitor("c1").await.unwrap();

        assert_eq!(f.engine.count_calls("stats_container:c1"), 1);
        assert!(f.manager.is_monitored("c1"));
    }

    #[tokio::test]
    async fn stream_failures_stop_monitoring_but_keep_history() {
        let f = fixture();
        f.manager.monitor("c1").await.unwrap();
        f.engine.emit_stats("c1", 1, 1);
        assert!(eventually(|| timestamps(&f.manager, "c1").len() == 1).await);

        f.engine.fail_stats("c1");

        assert!(eventually(|| !f.manager.is_monitored("c1")).await);
        assert_eq!(timestamps(&f.manager, "c1").len(), 1);
        // a new monitor can be started afterwards
        f.manager.monitor("c1").await.unwrap();
        assert_eq!(f.engine.count_calls("stats_container:c1"), 2);
    }

    #[tokio::test]
    async fn unavailable_stats_are_reported() {
        let f = fixture();
        f.engine.fail_on("stats_container");

        let result = f.manager.monitor("c1").await;

        assert!(result.is_err());
        assert!(!f.manager.is_monitored("c1"));
    }

    #[tokio::test]
    async fn stop_keeps_the_collected_samples() {
        let f = fixture();
        f.manager.monitor("c1").await.unwrap();
        f.engine.emit_stats("c1", 1, 1);
        assert!(eventually(|| timestamps(&f.manager, "c1").len() == 1).await);

        f.manager.stop("c1");

        assert!(!f.manager.is_monitored("c1"));
        assert_eq!(timestamps(&f.manager, "c1").len(), 1);
    }
}
