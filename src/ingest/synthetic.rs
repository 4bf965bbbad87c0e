use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::Ingestor;
use crate::config::SyntheticConfig;
use crate::dispatch::{ProjectId, SignalKey, UserId};
use crate::export::HealthMetrics;
use crate::rollup::{EligibilityGate, EventSink, RawEvent, SnapshotBuilder, SnapshotStore};

const PAGE_URLS: &[&str] = &["/", "/pricing", "/docs", "/blog", "/signup", "/login"];
const LOCATIONS: &[(&str, &str)] = &[
    ("DE", "Berlin"),
    ("FR", "Paris"),
    ("US", "Austin"),
    ("BR", "Recife"),
    ("JP", "Osaka"),
];
const BROWSERS: &[&str] = &["Firefox", "Chrome", "Safari", "Edge"];
const EVENT_TYPES: &[&str] = &["pageview", "click", "scroll", "submit"];
const LABELS: &[&str] = &["hero-cta", "nav-docs", "footer-signup"];
const ELEMENTS: &[&str] = &["#buy", "nav > a.docs", "form#signup button"];

/// Seeded fake-event generator over a fixed set of project/user pairs.
pub struct EventGenerator {
    rng: StdRng,
    targets: Vec<SignalKey>,
}

impl EventGenerator {
    pub fn new(cfg: &SyntheticConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(cfg.seed);

        let users: Vec<UserId> = (0..cfg.users.max(1))
            .map(|_| UserId(seeded_uuid(&mut rng)))
            .collect();

        let targets = (0..cfg.projects)
            .map(|i| SignalKey::new(users[i % users.len()], ProjectId(seeded_uuid(&mut rng))))
            .collect();

        Self { rng, targets }
    }

    /// The project/user pairs events are spread over.
    pub fn targets(&self) -> &[SignalKey] {
        &self.targets
    }

    /// Produces the next event, stamped `received_at`.
    pub fn next_event(&mut self, received_at: DateTime<Utc>) -> Option<RawEvent> {
        let key = *self.targets.choose(&mut self.rng)?;
        let event_type = *EVENT_TYPES.choose(&mut self.rng)?;
        let (country, city) = *LOCATIONS.choose(&mut self.rng)?;

        let (label, element_path) = if event_type == "pageview" {
            (None, None)
        } else {
            (
                LABELS.choose(&mut self.rng).map(|s| s.to_string()),
                ELEMENTS.choose(&mut self.rng).map(|s| s.to_string()),
            )
        };

        Some(RawEvent {
            project_id: key.project_id,
            user_id: key.user_id,
            event_type: event_type.to_string(),
            label,
            page_url: PAGE_URLS.choose(&mut self.rng).map(|s| s.to_string()),
            element_path,
            browser_name: BROWSERS.choose(&mut self.rng).map(|s| s.to_string()),
            country: Some(country.to_string()),
            city: Some(city.to_string()),
            ip: Some(IpAddr::V4(Ipv4Addr::new(
                10,
                self.rng.gen(),
                self.rng.gen(),
                self.rng.gen_range(1..255),
            ))),
            received_at,
        })
    }
}

fn seeded_uuid(rng: &mut StdRng) -> Uuid {
    uuid::Builder::from_random_bytes(rng.gen()).into_uuid()
}

/// Interval between generated events. Never zero, which `interval` rejects.
fn tick_period(rate: u32) -> Duration {
    (Duration::from_secs(1) / rate.max(1)).max(Duration::from_nanos(1))
}

/// Drives an `Ingestor` with generated events at a fixed rate.
pub struct SyntheticSource {
    cfg: SyntheticConfig,
    health: Option<Arc<HealthMetrics>>,
    run_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyntheticSource {
    pub fn new(cfg: SyntheticConfig) -> Self {
        Self {
            cfg,
            health: None,
            run_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Spawns the generator loop. It runs until `ctx` is cancelled.
    pub async fn start<E, G, B, S>(&self, ctx: CancellationToken, ingestor: Arc<Ingestor<E, G, B, S>>)
    where
        E: EventSink + 'static,
        G: EligibilityGate + 'static,
        B: SnapshotBuilder + 'static,
        S: SnapshotStore + 'static,
    {
        let mut generator = EventGenerator::new(&self.cfg);
        let period = tick_period(self.cfg.rate);
        let health = self.health.clone();

        info!(
            projects = generator.targets().len(),
            rate = self.cfg.rate,
            seed = self.cfg.seed,
            "synthetic source started",
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = ticker.tick() => {
                        let Some(event) = generator.next_event(Utc::now()) else {
                            continue;
                        };

                        if let Err(e) = ingestor.record(event).await {
                            warn!(error = %e, "synthetic event rejected");
                            continue;
                        }

                        if let Some(health) = &health {
                            health.synthetic_events.inc();
                        }
                    }
                }
            }
        });

        *self.run_task.lock().await = Some(task);
    }

    /// Waits for the generator loop to finish.
    pub async fn wait_for_shutdown(&self) {
        let run_task = { self.run_task.lock().await.take() };
        if let Some(run_task) = run_task {
            if let Err(e) = run_task.await {
                warn!(error = %e, "synthetic source task join failed");
            }
        }
    }
}
