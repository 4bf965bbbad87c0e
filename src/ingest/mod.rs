//! Ingestion glue: record an event, then signal a rollup for its pair.

pub mod synthetic;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::dispatch::{Dispatcher, SignalKey};
use crate::export::HealthMetrics;
use crate::rollup::{
    rollup_work, EligibilityGate, EventSink, RawEvent, RollupService, SnapshotBuilder,
    SnapshotStore,
};

pub use synthetic::{EventGenerator, SyntheticSource};

/// Records events and submits the follow-up rollup signal.
pub struct Ingestor<E, G, B, S> {
    sink: E,
    dispatcher: Arc<Dispatcher<SignalKey>>,
    service: Arc<RollupService<G, B, S>>,
    health: Option<Arc<HealthMetrics>>,
}

impl<E, G, B, S> Ingestor<E, G, B, S>
where
    E: EventSink,
    G: EligibilityGate + 'static,
    B: SnapshotBuilder + 'static,
    S: SnapshotStore + 'static,
{
    pub fn new(
        sink: E,
        dispatcher: Arc<Dispatcher<SignalKey>>,
        service: Arc<RollupService<G, B, S>>,
    ) -> Self {
        Self {
            sink,
            dispatcher,
            service,
            health: None,
        }
    }

    pub fn with_metrics(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Appends `event` and, once it is durable, signals a rollup for its
    /// `(user, project)` pair. Waits while the dispatcher buffer is full.
    pub async fn record(&self, event: RawEvent) -> Result<()> {
        let key = SignalKey::new(event.user_id, event.project_id);

        self.sink
            .append(event)
            .await
            .with_context(|| format!("recording event for {key}"))?;

        self.dispatcher
            .submit(rollup_work(Arc::clone(&self.service), key))
            .await
            .with_context(|| format!("submitting rollup signal for {key}"))?;

        if let Some(health) = &self.health {
            health.signals_submitted.inc();
        }

        Ok(())
    }
}
