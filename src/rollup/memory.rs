use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use parking_lot::RwLock;

use super::builder::DetailKind;
use super::model::{DetailRow, RawEvent, RollupSnapshot, RollupTotals};
use super::store::{AggregateSource, EligibilityGate, EventSink, SnapshotStore};
use crate::dispatch::{ProjectId, UserId};

/// In-process event log and snapshot history.
///
/// Breakdowns rank by count descending, then name ascending.
#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<Vec<RawEvent>>,
    snapshots: RwLock<Vec<RollupSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Snapshots for a project in insertion order.
    pub fn snapshots_for(&self, project_id: ProjectId) -> Vec<RollupSnapshot> {
        self.snapshots
            .read()
            .iter()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect()
    }
}

impl EventSink for MemoryStore {
    async fn append(&self, event: RawEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }
}

impl EligibilityGate for MemoryStore {
    async fn count_new_since(&self, project_id: ProjectId) -> Result<i64> {
        let since = self
            .snapshots
            .read()
            .iter()
            .filter(|s| s.project_id == project_id)
            .map(|s| s.aggregated_at)
            .max();

        let count = self
            .events
            .read()
            .iter()
            .filter(|e| e.project_id == project_id)
            .filter(|e| since.map_or(true, |since| e.received_at > since))
            .count();

        Ok(count as i64)
    }
}

impl AggregateSource for MemoryStore {
    async fn totals(&self, project_id: ProjectId, user_id: UserId) -> Result<RollupTotals> {
        let events = self.events.read();

        let mut totals = RollupTotals::default();
        let mut event_types = HashSet::new();
        let mut visitors = HashSet::new();
        let mut locations = HashSet::new();
        let mut page_urls = HashSet::new();

        for event in events
            .iter()
            .filter(|e| e.project_id == project_id && e.user_id == user_id)
        {
            totals.total_events += 1;
            event_types.insert(event.event_type.as_str());
            if let Some(ip) = event.ip {
                visitors.insert(ip);
            }
            if let Some(country) = event.country.as_deref() {
                locations.insert(country);
            }
            if let Some(url) = event.page_url.as_deref() {
                page_urls.insert(url);
            }
        }

        totals.total_event_types = event_types.len() as i64;
        totals.total_unique_users = visitors.len() as i64;
        totals.total_locations = locations.len() as i64;
        totals.total_unique_page_urls = page_urls.len() as i64;

        Ok(totals)
    }

    async fn detail_rows(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<DetailRow>> {
        let events = self.events.read();
        let scoped: Vec<&RawEvent> = events
            .iter()
            .filter(|e| e.project_id == project_id && e.user_id == user_id)
            .collect();

        let mut rows = Vec::new();

        for kind in DetailKind::ALL {
            if kind == DetailKind::LastVisitedUser {
                continue;
            }

            let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
            for event in &scoped {
                if let Some(name) = breakdown_field(event, kind) {
                    *counts.entry(name).or_default() += 1;
                }
            }

            // BTreeMap yields names ascending; a stable sort keeps that as the tie-break.
            let mut ranked: Vec<(&str, i64)> = counts.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1));

            rows.extend(
                ranked
                    .into_iter()
                    .take(limit)
                    .map(|(name, total)| DetailRow::new(kind.tag(), Some(name), total.to_string())),
            );
        }

        let mut recent: Vec<&RawEvent> = scoped.iter().copied().filter(|e| e.ip.is_some()).collect();
        recent.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        rows.extend(recent.into_iter().take(limit).map(|e| {
            DetailRow::new(
                DetailKind::LastVisitedUser.tag(),
                e.ip.map(|ip| ip.to_string()).as_deref(),
                e.received_at.to_rfc3339(),
            )
        }));

        Ok(rows)
    }
}

impl SnapshotStore for MemoryStore {
    async fn insert(&self, snapshot: &RollupSnapshot) -> Result<()> {
        self.snapshots.write().push(snapshot.clone());
        Ok(())
    }

    async fn find_recent(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<RollupSnapshot>> {
        let mut found: Vec<RollupSnapshot> = self
            .snapshots
            .read()
            .iter()
            .filter(|s| s.project_id == project_id && s.user_id == user_id)
            .cloned()
            .collect();

        found.sort_by(|a, b| b.aggregated_at.cmp(&a.aggregated_at));
        found.truncate(limit);

        Ok(found)
    }
}

fn breakdown_field(event: &RawEvent, kind: DetailKind) -> Option<&str> {
    match kind {
        DetailKind::Url => event.page_url.as_deref(),
        DetailKind::Country => event.country.as_deref(),
        DetailKind::City => event.city.as_deref(),
        DetailKind::Browser => event.browser_name.as_deref(),
        DetailKind::Element => event.element_path.as_deref(),
        DetailKind::EventType => Some(event.event_type.as_str()),
        DetailKind::EventLabel => event.label.as_deref(),
        DetailKind::LastVisitedUser => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::rollup::model::RollupSummary;

    fn event(project_id: ProjectId, user_id: UserId, url: &str, secs: i64) -> RawEvent {
        RawEvent {
            project_id,
            user_id,
            event_type: "pageview".to_string(),
            page_url: Some(url.to_string()),
            ip: Some(format!("10.0.0.{}", secs % 250).parse().unwrap()),
            received_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
                + Duration::seconds(secs),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_count_new_since_uses_latest_project_snapshot() {
        let store = MemoryStore::new();
        let project = ProjectId::new_v4();
        let user = UserId::new_v4();

        for secs in 0..3 {
            store.append(event(project, user, "/", secs)).await.unwrap();
        }
        store.append(event(ProjectId::new_v4(), user, "/", 0)).await.unwrap();
        assert_eq!(store.count_new_since(project).await.unwrap(), 3);

        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 1).unwrap();
        store
            .insert(&RollupSnapshot::new(project, user, RollupSummary::default(), at))
            .await
            .unwrap();

        // Only the event strictly after the snapshot counts.
        assert_eq!(store.count_new_since(project).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_detail_rows_rank_by_count_then_name() {
        let store = MemoryStore::new();
        let project = ProjectId::new_v4();
        let user = UserId::new_v4();

        for (secs, url) in ["/b", "/a", "/c", "/c", "/b", "/c", "/d"].into_iter().enumerate() {
            store.append(event(project, user, url, secs as i64)).await.unwrap();
        }

        let rows = store.detail_rows(project, user, 3).await.unwrap();
        let urls: Vec<(&str, &str)> = rows
            .iter()
            .filter(|r| r.query_type == "most_visited_url")
            .map(|r| (r.name.as_deref().unwrap(), r.total.as_str()))
            .collect();

        assert_eq!(urls, vec![("/c", "3"), ("/b", "2"), ("/a", "1")]);
    }

    #[tokio::test]
    async fn test_detail_rows_last_visitors_newest_first() {
        let store = MemoryStore::new();
        let project = ProjectId::new_v4();
        let user = UserId::new_v4();

        for secs in [5, 1, 9] {
            store.append(event(project, user, "/", secs)).await.unwrap();
        }

        let rows = store.detail_rows(project, user, 2).await.unwrap();
        let visitors: Vec<&str> = rows
            .iter()
            .filter(|r| r.query_type == "last_visited_user")
            .map(|r| r.name.as_deref().unwrap())
            .collect();

        assert_eq!(visitors, vec!["10.0.0.9", "10.0.0.5"]);
    }

    #[tokio::test]
    async fn test_totals_count_distinct_dimensions() {
        let store = MemoryStore::new();
        let project = ProjectId::new_v4();
        let user = UserId::new_v4();

        let mut click = event(project, user, "/a", 1);
        click.event_type = "click".to_string();
        click.country = Some("FR".to_string());
        store.append(click).await.unwrap();
        store.append(event(project, user, "/a", 1)).await.unwrap();
        store.append(event(project, user, "/b", 2)).await.unwrap();

        let totals = store.totals(project, user).await.unwrap();

        assert_eq!(totals.total_events, 3);
        assert_eq!(totals.total_event_types, 2);
        assert_eq!(totals.total_unique_users, 2);
        assert_eq!(totals.total_locations, 1);
        assert_eq!(totals.total_unique_page_urls, 2);
    }

    #[tokio::test]
    async fn test_find_recent_newest_first_with_limit() {
        let store = MemoryStore::new();
        let project = ProjectId::new_v4();
        let user = UserId::new_v4();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        for hours in [1, 3, 2] {
            let at = base + Duration::hours(hours);
            store
                .insert(&RollupSnapshot::new(project, user, RollupSummary::default(), at))
                .await
                .unwrap();
        }

        let recent = store.find_recent(project, user, 2).await.unwrap();
        let hours: Vec<i64> = recent
            .iter()
            .map(|s| (s.aggregated_at - base).num_hours())
            .collect();
        assert_eq!(hours, vec![3, 2]);

        assert!(store.find_recent(project, user, 0).await.unwrap().is_empty());
        assert!(store
            .find_recent(project, UserId::new_v4(), 5)
            .await
            .unwrap()
            .is_empty());
    }
}
