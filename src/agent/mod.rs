use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::dispatch::{Dispatcher, SignalKey};
use crate::export::health::HealthMetrics;
use crate::ingest::{Ingestor, SyntheticSource};
use crate::rollup::{DetailSummaryBuilder, MemoryStore, RollupService};

/// Rollup service over the bundled in-memory store.
pub type LocalRollupService =
    RollupService<Arc<MemoryStore>, DetailSummaryBuilder<Arc<MemoryStore>>, Arc<MemoryStore>>;

/// Ingestor over the bundled in-memory store.
pub type LocalIngestor = Ingestor<
    Arc<MemoryStore>,
    Arc<MemoryStore>,
    DetailSummaryBuilder<Arc<MemoryStore>>,
    Arc<MemoryStore>,
>;

/// Agent orchestrates all components: health server, dispatcher, rollup
/// service and the optional synthetic source.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    store: Arc<MemoryStore>,
    dispatcher: Arc<Dispatcher<SignalKey>>,
    service: Arc<LocalRollupService>,
    ingestor: Arc<LocalIngestor>,
    synthetic: Option<SyntheticSource>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, wiring the store, dispatcher and rollup service.
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate()?;

        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let dispatcher = Arc::new(
            Dispatcher::new(cfg.dispatcher.clone()).context("creating dispatcher")?,
        );
        let outcome_health = Arc::clone(&health);
        dispatcher.on_outcome(Box::new(move |outcome| {
            outcome_health.observe_outcome(outcome);
        }));

        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(
            RollupService::new(
                Arc::clone(&store),
                DetailSummaryBuilder::new(Arc::clone(&store), cfg.rollup.top_n),
                Arc::clone(&store),
            )
            .with_metrics(Arc::clone(&health)),
        );
        let ingestor = Arc::new(
            Ingestor::new(
                Arc::clone(&store),
                Arc::clone(&dispatcher),
                Arc::clone(&service),
            )
            .with_metrics(Arc::clone(&health)),
        );

        Ok(Self {
            cfg,
            health,
            store,
            dispatcher,
            service,
            ingestor,
            synthetic: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server first so probes respond.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Launch the dispatcher worker pool.
        self.dispatcher
            .start(self.cancel.child_token())
            .await
            .context("starting dispatcher")?;

        self.spawn_pending_reporter();

        // 2. Drive ingestion from the synthetic source when configured.
        if self.cfg.synthetic.enabled {
            let source = SyntheticSource::new(self.cfg.synthetic.clone())
                .with_metrics(Arc::clone(&self.health));
            source
                .start(self.cancel.child_token(), Arc::clone(&self.ingestor))
                .await;
            self.synthetic = Some(source);
        }

        info!(
            pool_size = self.cfg.dispatcher.pool_size,
            window = ?self.cfg.dispatcher.window,
            top_n = self.cfg.rollup.top_n,
            synthetic = self.cfg.synthetic.enabled,
            "rollupd started",
        );

        Ok(())
    }

    /// Stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Producers first, then the workers that drain them.
        if let Some(source) = &self.synthetic {
            source.wait_for_shutdown().await;
        }

        self.dispatcher.wait_for_shutdown().await;

        let pending = self.dispatcher.pending_len();
        if pending > 0 {
            info!(pending, "dispatcher stopped with pending work");
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    pub fn ingestor(&self) -> Arc<LocalIngestor> {
        Arc::clone(&self.ingestor)
    }

    pub fn rollups(&self) -> Arc<LocalRollupService> {
        Arc::clone(&self.service)
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.health)
    }

    /// Periodically publishes the dispatcher's pending-key count.
    fn spawn_pending_reporter(&self) {
        let cancel = self.cancel.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let health = Arc::clone(&self.health);
        let period = self.cfg.dispatcher.window.min(Duration::from_secs(5));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let pending = dispatcher.pending_len();
                        health.dispatch_pending_keys.set(pending as f64);
                        debug!(
                            pending,
                            tracked = dispatcher.tracked_keys(),
                            "dispatcher table size",
                        );
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::dispatch::{ProjectId, UserId};
    use crate::rollup::RawEvent;

    fn local_config() -> Config {
        let mut cfg = Config::default();
        cfg.health.addr = "127.0.0.1:0".to_string();
        cfg.dispatcher.window = Duration::from_millis(100);
        cfg
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut cfg = local_config();
        cfg.dispatcher.pool_size = 0;

        assert!(Agent::new(cfg).is_err());
    }

    #[tokio::test]
    async fn test_agent_rolls_up_recorded_events() {
        let mut agent = Agent::new(local_config()).unwrap();
        agent.start().await.unwrap();

        let (project, user) = (ProjectId::new_v4(), UserId::new_v4());
        for url in ["/", "/docs", "/docs"] {
            agent
                .ingestor()
                .record(RawEvent {
                    project_id: project,
                    user_id: user,
                    event_type: "pageview".to_string(),
                    page_url: Some(url.to_string()),
                    received_at: Utc::now(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        agent.stop().await.unwrap();

        let recent = agent.rollups().find_recent(project, user, 5).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].total_events, 3);
        assert_eq!(recent[0].top_urls[0].name, "/docs");
        assert_eq!(agent.health().signals_submitted.get(), 3.0);
        assert_eq!(
            agent
                .health()
                .dispatch_executions
                .with_label_values(&["completed"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_agent_synthetic_source_produces_snapshots() {
        let mut cfg = local_config();
        cfg.synthetic.enabled = true;
        cfg.synthetic.rate = 100;
        cfg.synthetic.projects = 2;

        let mut agent = Agent::new(cfg).unwrap();
        agent.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        agent.stop().await.unwrap();

        assert!(agent.store().event_count() > 0);
        assert!(agent.store().snapshot_count() > 0);
        assert!(agent.health().synthetic_events.get() > 0.0);
    }
}
