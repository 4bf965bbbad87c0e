use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::{ProjectId, UserId};

/// Day label format used by trend views (dd/mm/YYYY).
pub const AGGREGATED_AT_LABEL_FORMAT: &str = "%d/%m/%Y";

/// One top-N breakdown entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakdown {
    pub name: String,
    pub total: i64,
}

impl Breakdown {
    pub fn new(name: impl Into<String>, total: i64) -> Self {
        Self {
            name: name.into(),
            total,
        }
    }
}

/// One recently seen visitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastVisitor {
    pub ip: Option<IpAddr>,
    pub seen_at: Option<DateTime<Utc>>,
}

/// Scalar totals of a rollup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupTotals {
    pub total_events: i64,
    pub total_event_types: i64,
    pub total_unique_users: i64,
    pub total_locations: i64,
    pub total_unique_page_urls: i64,
}

/// Computed rollup content, before it is stamped and persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupSummary {
    pub totals: RollupTotals,
    pub top_urls: Vec<Breakdown>,
    pub top_countries: Vec<Breakdown>,
    pub top_cities: Vec<Breakdown>,
    pub top_elements: Vec<Breakdown>,
    pub top_browsers: Vec<Breakdown>,
    pub top_event_types: Vec<Breakdown>,
    pub top_event_labels: Vec<Breakdown>,
    pub last_visited_users: Vec<LastVisitor>,
}

/// Immutable, timestamped rollup row. Each successful run appends one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupSnapshot {
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub total_events: i64,
    pub total_event_types: i64,
    pub total_unique_users: i64,
    pub total_locations: i64,
    pub total_unique_page_urls: i64,
    pub top_urls: Vec<Breakdown>,
    pub top_countries: Vec<Breakdown>,
    pub top_cities: Vec<Breakdown>,
    pub top_elements: Vec<Breakdown>,
    pub top_browsers: Vec<Breakdown>,
    pub top_event_types: Vec<Breakdown>,
    pub top_event_labels: Vec<Breakdown>,
    pub last_visited_users: Vec<LastVisitor>,
    pub aggregated_at: DateTime<Utc>,
    pub aggregated_at_label: String,
}

impl RollupSnapshot {
    pub fn new(
        project_id: ProjectId,
        user_id: UserId,
        summary: RollupSummary,
        aggregated_at: DateTime<Utc>,
    ) -> Self {
        let RollupSummary {
            totals,
            top_urls,
            top_countries,
            top_cities,
            top_elements,
            top_browsers,
            top_event_types,
            top_event_labels,
            last_visited_users,
        } = summary;

        Self {
            project_id,
            user_id,
            total_events: totals.total_events,
            total_event_types: totals.total_event_types,
            total_unique_users: totals.total_unique_users,
            total_locations: totals.total_locations,
            total_unique_page_urls: totals.total_unique_page_urls,
            top_urls,
            top_countries,
            top_cities,
            top_elements,
            top_browsers,
            top_event_types,
            top_event_labels,
            last_visited_users,
            aggregated_at_label: aggregated_at
                .format(AGGREGATED_AT_LABEL_FORMAT)
                .to_string(),
            aggregated_at,
        }
    }
}

/// One tagged row of the flat detail-summary query.
///
/// `total` is text because `last_visited_user` rows carry a timestamp there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailRow {
    pub query_type: String,
    pub name: Option<String>,
    pub total: String,
}

impl DetailRow {
    pub fn new(query_type: &str, name: Option<&str>, total: impl Into<String>) -> Self {
        Self {
            query_type: query_type.to_string(),
            name: name.map(str::to_string),
            total: total.into(),
        }
    }
}

/// A raw ingested event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub event_type: String,
    pub label: Option<String>,
    pub page_url: Option<String>,
    pub element_path: Option<String>,
    pub browser_name: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub ip: Option<IpAddr>,
    pub received_at: DateTime<Utc>,
}
