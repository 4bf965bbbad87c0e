use std::net::IpAddr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use super::model::{Breakdown, DetailRow, LastVisitor, RollupSummary};
use super::store::{AggregateSource, SnapshotBuilder};
use crate::dispatch::{ProjectId, UserId};

/// Tag carried by each detail row, naming the list it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetailKind {
    Url,
    Country,
    City,
    Browser,
    Element,
    EventType,
    EventLabel,
    LastVisitedUser,
}

impl DetailKind {
    pub const ALL: [DetailKind; 8] = [
        DetailKind::Url,
        DetailKind::Country,
        DetailKind::City,
        DetailKind::Browser,
        DetailKind::Element,
        DetailKind::EventType,
        DetailKind::EventLabel,
        DetailKind::LastVisitedUser,
    ];

    pub const fn tag(self) -> &'static str {
        match self {
            DetailKind::Url => "most_visited_url",
            DetailKind::Country => "most_visited_country",
            DetailKind::City => "most_visited_city",
            DetailKind::Browser => "most_used_browser",
            DetailKind::Element => "most_hit_element",
            DetailKind::EventType => "most_event_type",
            DetailKind::EventLabel => "most_event_label",
            DetailKind::LastVisitedUser => "last_visited_user",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

/// `SnapshotBuilder` that folds an `AggregateSource`'s totals and tagged
/// detail rows into a `RollupSummary`.
pub struct DetailSummaryBuilder<A> {
    source: A,
    top_n: usize,
}

impl<A: AggregateSource> DetailSummaryBuilder<A> {
    pub fn new(source: A, top_n: usize) -> Self {
        Self { source, top_n }
    }

    pub fn top_n(&self) -> usize {
        self.top_n
    }
}

impl<A: AggregateSource> SnapshotBuilder for DetailSummaryBuilder<A> {
    async fn build_rollup(&self, project_id: ProjectId, user_id: UserId) -> Result<RollupSummary> {
        let totals = self
            .source
            .totals(project_id, user_id)
            .await
            .context("querying rollup totals")?;

        let rows = self
            .source
            .detail_rows(project_id, user_id, self.top_n)
            .await
            .context("querying rollup detail rows")?;

        let mut summary = fold_detail_rows(rows);
        summary.totals = totals;

        Ok(summary)
    }
}

/// Routes each row into its list, in source order.
///
/// Unknown tags are dropped. A non-numeric total becomes 0.
pub fn fold_detail_rows(rows: Vec<DetailRow>) -> RollupSummary {
    let mut summary = RollupSummary::default();

    for row in rows {
        let Some(kind) = DetailKind::from_tag(&row.query_type) else {
            debug!(query_type = %row.query_type, "ignoring unknown detail row");
            continue;
        };

        if kind == DetailKind::LastVisitedUser {
            summary.last_visited_users.push(LastVisitor {
                ip: row.name.as_deref().and_then(parse_ip),
                seen_at: parse_timestamp(&row.total),
            });
            continue;
        }

        let entry = Breakdown {
            name: row.name.unwrap_or_default(),
            total: row.total.trim().parse().unwrap_or(0),
        };

        let list = match kind {
            DetailKind::Url => &mut summary.top_urls,
            DetailKind::Country => &mut summary.top_countries,
            DetailKind::City => &mut summary.top_cities,
            DetailKind::Browser => &mut summary.top_browsers,
            DetailKind::Element => &mut summary.top_elements,
            DetailKind::EventType => &mut summary.top_event_types,
            DetailKind::EventLabel => &mut summary.top_event_labels,
            DetailKind::LastVisitedUser => continue,
        };
        list.push(entry);
    }

    summary
}

/// Parses a bare or CIDR-notated address (`10.0.0.1/32`).
fn parse_ip(raw: &str) -> Option<IpAddr> {
    let addr = raw.split_once('/').map_or(raw, |(addr, _)| addr);
    addr.trim().parse().ok()
}

/// Accepts RFC 3339 and the `2006-01-02 15:04:05.999999-07` form databases
/// emit for timestamptz text.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
