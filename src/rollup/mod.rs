//! Idempotent per-project rollup snapshots.

pub mod builder;
pub mod memory;
pub mod model;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::dispatch::{ProjectId, SignalKey, UserId, WorkSignal};
use crate::export::HealthMetrics;

pub use builder::{fold_detail_rows, DetailKind, DetailSummaryBuilder};
pub use memory::MemoryStore;
pub use model::{
    Breakdown, DetailRow, LastVisitor, RawEvent, RollupSnapshot, RollupSummary, RollupTotals,
};
pub use store::{AggregateSource, EligibilityGate, EventSink, SnapshotBuilder, SnapshotStore};

/// A failed rollup run. Nothing was persisted.
#[derive(Debug, Error)]
pub enum RollupError {
    #[error("checking rollup eligibility for project {project_id}")]
    Eligibility {
        project_id: ProjectId,
        #[source]
        source: anyhow::Error,
    },

    #[error("building rollup for project {project_id}")]
    Build {
        project_id: ProjectId,
        #[source]
        source: anyhow::Error,
    },

    #[error("persisting rollup for project {project_id}")]
    Persist {
        project_id: ProjectId,
        #[source]
        source: anyhow::Error,
    },
}

impl RollupError {
    /// Metric label for the stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Eligibility { .. } => "eligibility",
            Self::Build { .. } => "build",
            Self::Persist { .. } => "persist",
        }
    }
}

/// What a rollup run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupRunOutcome {
    /// No events since the latest snapshot.
    Skipped,
    Persisted {
        aggregated_at: DateTime<Utc>,
        total_events: i64,
    },
}

/// Runs gate, builder and store in order for one project/user pair.
///
/// Runs for the same project are serialized so the eligibility check and
/// the insert cannot interleave with another run for that project.
pub struct RollupService<G, B, S> {
    gate: G,
    builder: B,
    store: S,
    in_flight: DashMap<ProjectId, Arc<tokio::sync::Mutex<()>>>,
    health: Option<Arc<HealthMetrics>>,
}

impl<G, B, S> RollupService<G, B, S>
where
    G: EligibilityGate,
    B: SnapshotBuilder,
    S: SnapshotStore,
{
    pub fn new(gate: G, builder: B, store: S) -> Self {
        Self {
            gate,
            builder,
            store,
            in_flight: DashMap::new(),
            health: None,
        }
    }

    /// Records run results into the given metrics.
    pub fn with_metrics(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Recomputes and persists a snapshot if the project has new events.
    pub async fn run(
        &self,
        project_id: ProjectId,
        user_id: UserId,
    ) -> Result<RollupRunOutcome, RollupError> {
        let result = self.run_exclusive(project_id, user_id).await;

        if let Some(health) = &self.health {
            match &result {
                Ok(RollupRunOutcome::Skipped) => health.rollup_runs_skipped.inc(),
                Ok(RollupRunOutcome::Persisted { .. }) => health.rollup_snapshots_written.inc(),
                Err(e) => health.rollup_errors.with_label_values(&[e.stage()]).inc(),
            }
        }

        result
    }

    async fn run_exclusive(
        &self,
        project_id: ProjectId,
        user_id: UserId,
    ) -> Result<RollupRunOutcome, RollupError> {
        let flight = self.flight(project_id);
        let _guard = flight.lock().await;

        // Stamped before the gate so events landing mid-run count toward the next one.
        let aggregated_at = Utc::now();

        let new_events = self
            .gate
            .count_new_since(project_id)
            .await
            .map_err(|source| RollupError::Eligibility { project_id, source })?;

        if new_events < 1 {
            debug!(project = %project_id, "no new events since last rollup");
            return Ok(RollupRunOutcome::Skipped);
        }

        let summary = self
            .builder
            .build_rollup(project_id, user_id)
            .await
            .map_err(|source| RollupError::Build { project_id, source })?;

        let snapshot = RollupSnapshot::new(project_id, user_id, summary, aggregated_at);

        self.store
            .insert(&snapshot)
            .await
            .map_err(|source| RollupError::Persist { project_id, source })?;

        info!(
            project = %project_id,
            user = %user_id,
            new_events,
            total_events = snapshot.total_events,
            "rollup snapshot persisted",
        );

        Ok(RollupRunOutcome::Persisted {
            aggregated_at,
            total_events: snapshot.total_events,
        })
    }

    /// Latest snapshots for the pair, newest first.
    pub async fn find_recent(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        limit: usize,
    ) -> anyhow::Result<Vec<RollupSnapshot>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.store.find_recent(project_id, user_id, limit).await
    }

    fn flight(&self, project_id: ProjectId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.in_flight.entry(project_id).or_default().value())
    }
}

/// Builds the dispatcher signal that runs `service` for `key`.
pub fn rollup_work<G, B, S>(service: Arc<RollupService<G, B, S>>, key: SignalKey) -> WorkSignal<SignalKey>
where
    G: EligibilityGate + 'static,
    B: SnapshotBuilder + 'static,
    S: SnapshotStore + 'static,
{
    WorkSignal::new(key, move || async move {
        service
            .run(key.project_id, key.user_id)
            .await
            .map(|_| ())
            .map_err(anyhow::Error::from)
    })
}
