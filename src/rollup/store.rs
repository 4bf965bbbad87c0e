//! Collaborator contracts the rollup pipeline talks to.

use std::sync::Arc;

use anyhow::Result;

use super::model::{DetailRow, RawEvent, RollupSnapshot, RollupSummary, RollupTotals};
use crate::dispatch::{ProjectId, UserId};

/// Counts raw events recorded since a project's latest snapshot.
pub trait EligibilityGate: Send + Sync {
    /// Returns the count since the latest snapshot, or since the project
    /// started when it has none.
    fn count_new_since(
        &self,
        project_id: ProjectId,
    ) -> impl std::future::Future<Output = Result<i64>> + Send;
}

/// Computes totals and top-N breakdowns for a project/user pair.
pub trait SnapshotBuilder: Send + Sync {
    fn build_rollup(
        &self,
        project_id: ProjectId,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<RollupSummary>> + Send;
}

/// Append-only snapshot history.
pub trait SnapshotStore: Send + Sync {
    /// Persists one new row. There is no update path.
    fn insert(
        &self,
        snapshot: &RollupSnapshot,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Most recent snapshots for the pair, newest first.
    fn find_recent(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<RollupSnapshot>>> + Send;
}

/// Raw aggregate queries behind `DetailSummaryBuilder`.
pub trait AggregateSource: Send + Sync {
    fn totals(
        &self,
        project_id: ProjectId,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<RollupTotals>> + Send;

    /// Flat list of tagged rows, at most `limit` per tag.
    fn detail_rows(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<DetailRow>>> + Send;
}

/// Durable destination for ingested events.
pub trait EventSink: Send + Sync {
    fn append(&self, event: RawEvent) -> impl std::future::Future<Output = Result<()>> + Send;
}

impl<T: EligibilityGate> EligibilityGate for Arc<T> {
    async fn count_new_since(&self, project_id: ProjectId) -> Result<i64> {
        (**self).count_new_since(project_id).await
    }
}

impl<T: SnapshotBuilder> SnapshotBuilder for Arc<T> {
    async fn build_rollup(&self, project_id: ProjectId, user_id: UserId) -> Result<RollupSummary> {
        (**self).build_rollup(project_id, user_id).await
    }
}

impl<T: SnapshotStore> SnapshotStore for Arc<T> {
    async fn insert(&self, snapshot: &RollupSnapshot) -> Result<()> {
        (**self).insert(snapshot).await
    }

    async fn find_recent(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<RollupSnapshot>> {
        (**self).find_recent(project_id, user_id, limit).await
    }
}

impl<T: AggregateSource> AggregateSource for Arc<T> {
    async fn totals(&self, project_id: ProjectId, user_id: UserId) -> Result<RollupTotals> {
        (**self).totals(project_id, user_id).await
    }

    async fn detail_rows(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<DetailRow>> {
        (**self).detail_rows(project_id, user_id, limit).await
    }
}

impl<T: EventSink> EventSink for Arc<T> {
    async fn append(&self, event: RawEvent) -> Result<()> {
        (**self).append(event).await
    }
}
