//! Traffic and resource statistics.
//!
//! The collector samples every site's counters and pool health on a fixed
//! tick, derives per-second rates from counter deltas, keeps short
//! in-memory histories for the dashboard, and flushes minute aggregates to
//! the store for long-term retention. A broadcast channel fans samples and
//! activity entries out to live dashboard sessions.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::config::StatsConfig;
use crate::dispatcher::Dispatcher;
use crate::ring::RingBuffer;
use crate::site::SiteKind;
use crate::store::{PeriodStats, PeriodType, Store};
use crate::supervisor::{PoolSnapshot, WorkerSummary};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What happened, for the activity feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    SiteRegistered,
    SiteRemoved,
    WorkerStarted,
    WorkerStopped,
    WorkerCrashed,
}

impl ActivityKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActivityKind::SiteRegistered => "site registered",
            ActivityKind::SiteRemoved => "site removed",
            ActivityKind::WorkerStarted => "worker started",
            ActivityKind::WorkerStopped => "worker stopped",
            ActivityKind::WorkerCrashed => "worker crashed",
        }
    }
}

/// One entry in the recent-activity feed.
#[derive(Debug, Clone, Serialize)]
pub struct Activity {
    pub site_id: String,
    pub site_name: String,
    pub kind: ActivityKind,
    pub detail: String,
    pub at_ms: i64,
}

impl Activity {
    pub fn new(site_id: &str, site_name: &str, kind: ActivityKind, detail: impl Into<String>) -> Self {
        Self {
            site_id: site_id.to_string(),
            site_name: site_name.to_string(),
            kind,
            detail: detail.into(),
            at_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// One point on a traffic series: cumulative counters plus the rates
/// derived against the previous point. `active_sites`, `connections`, and
/// `connection_rate` are meaningful on the global series only; per-site
/// samples leave them zero.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Sample {
    pub at_ms: i64,
    pub hits: u64,
    pub incoming_bytes: u64,
    pub outgoing_bytes: u64,
    pub hit_rate: f64,
    pub incoming_rate: f64,
    pub outgoing_rate: f64,
    pub workers: usize,
    pub active_sites: usize,
    pub connections: u64,
    pub connection_rate: f64,
    pub cpu_percent: f64,
    pub mem_mb: f64,
}

/// Per-second rate between two cumulative counter readings. Counters can
/// reset (a site record replaced mid-flight), which shows up as a negative
/// delta and is reported as zero rather than a bogus spike.
pub fn calculate_rate(previous: Option<&Sample>, prev_value: u64, value: u64, at_ms: i64) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    let elapsed_ms = at_ms - previous.at_ms;
    if elapsed_ms <= 0 || value < prev_value {
        return 0.0;
    }
    (value - prev_value) as f64 / (elapsed_ms as f64 / 1000.0)
}

/// Average rate over a trailing window of a sample series. The window
/// start is the sample immediately before the first in-window sample, so
/// the boundary interval is not lost. Fewer than two usable samples, a
/// non-positive elapsed time, or a counter reset all yield zero.
pub fn calculate_window_rate(
    samples: &[Sample],
    value: impl Fn(&Sample) -> u64,
    window_ms: i64,
    now_ms: i64,
) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let window_start = now_ms - window_ms;
    let Some(first_inside) = samples.iter().position(|s| s.at_ms >= window_start) else {
        return 0.0;
    };
    let start = &samples[first_inside.saturating_sub(1)];
    let end = &samples[samples.len() - 1];

    let elapsed_ms = end.at_ms - start.at_ms;
    let (start_value, end_value) = (value(start), value(end));
    if elapsed_ms <= 0 || end_value <= start_value {
        return 0.0;
    }
    (end_value - start_value) as f64 / (elapsed_ms as f64 / 1000.0)
}

/// Running totals between persist ticks, flushed as one minute row.
#[derive(Debug, Clone, Copy, Default)]
struct PeriodAccumulator {
    hits: u64,
    incoming_bytes: u64,
    outgoing_bytes: u64,
    cpu_sum: f64,
    max_mem_mb: f64,
    samples: u64,
}

impl PeriodAccumulator {
    fn record(&mut self, previous: Option<&Sample>, sample: &Sample) {
        if let Some(previous) = previous {
            self.hits += sample.hits.saturating_sub(previous.hits);
            self.incoming_bytes += sample
                .incoming_bytes
                .saturating_sub(previous.incoming_bytes);
            self.outgoing_bytes += sample
                .outgoing_bytes
                .saturating_sub(previous.outgoing_bytes);
        }
        self.cpu_sum += sample.cpu_percent;
        self.max_mem_mb = self.max_mem_mb.max(sample.mem_mb);
        self.samples += 1;
    }

    fn flush(&mut self) -> Option<PeriodStats> {
        if self.samples == 0 {
            return None;
        }
        let stats = PeriodStats {
            hits: self.hits,
            incoming_bytes: self.incoming_bytes,
            outgoing_bytes: self.outgoing_bytes,
            avg_cpu_percent: self.cpu_sum / self.samples as f64,
            max_mem_mb: self.max_mem_mb,
            sample_count: self.samples,
        };
        *self = Self::default();
        Some(stats)
    }
}

struct SeriesState {
    ring: RingBuffer<Sample>,
    accumulator: PeriodAccumulator,
}

impl SeriesState {
    fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
            accumulator: PeriodAccumulator::default(),
        }
    }

    fn push(&mut self, sample: Sample) {
        self.accumulator.record(self.ring.last(), &sample);
        self.ring.push(sample);
    }
}

/// Pushed to live dashboard sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatsEvent {
    Sample {
        global: Sample,
        sites: Vec<SiteSample>,
    },
    Activity {
        activity: Activity,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteSample {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub sample: Sample,
}

/// Snapshot handed to a dashboard session on connect.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardState {
    pub generated_at_ms: i64,
    pub total_hits: u64,
    pub total_connections: u64,
    pub sites: Vec<SiteOverview>,
    pub activities: Vec<Activity>,
    pub global: Sample,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteOverview {
    pub id: String,
    pub name: String,
    pub kind: &'static str,
    pub hits: u64,
    pub incoming_bytes: u64,
    pub outgoing_bytes: u64,
    pub pool: Option<PoolSnapshot>,
    pub workers: Vec<WorkerSummary>,
}

pub struct StatsCollector {
    config: StatsConfig,
    dispatcher: Arc<Dispatcher>,
    store: Arc<Store>,
    global: Mutex<SeriesState>,
    sites: DashMap<String, SeriesState>,
    activities: Mutex<RingBuffer<Activity>>,
    events: broadcast::Sender<StatsEvent>,
}

impl StatsCollector {
    pub fn new(config: StatsConfig, dispatcher: Arc<Dispatcher>, store: Arc<Store>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let history = config.sample_history;
        let activity_history = config.activity_history;
        Arc::new(Self {
            config,
            dispatcher,
            store,
            global: Mutex::new(SeriesState::new(history)),
            sites: DashMap::new(),
            activities: Mutex::new(RingBuffer::new(activity_history)),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatsEvent> {
        self.events.subscribe()
    }

    pub fn record_activity(&self, activity: Activity) {
        debug!(
            site = %activity.site_name,
            kind = activity.kind.label(),
            detail = %activity.detail,
            "activity"
        );
        self.activities.lock().push(activity.clone());
        let _ = self.events.send(StatsEvent::Activity { activity });
    }

    pub fn recent_activities(&self) -> Vec<Activity> {
        self.activities.lock().to_vec()
    }

    pub fn global_series(&self) -> Vec<Sample> {
        self.global.lock().ring.to_vec()
    }

    pub fn site_series(&self, site_id: &str) -> Vec<Sample> {
        self.sites
            .get(site_id)
            .map(|s| s.ring.to_vec())
            .unwrap_or_default()
    }

    /// One sampling pass over every site plus the global aggregate.
    pub fn sample_once(&self) {
        let at_ms = Utc::now().timestamp_millis();
        let sites = self.dispatcher.sites();

        let mut global = Sample {
            at_ms,
            active_sites: sites.len(),
            connections: self.dispatcher.connection_count(),
            ..Default::default()
        };
        let mut site_samples = Vec::with_capacity(sites.len());

        for site in &sites {
            let counters = site.counters.snapshot();
            let (workers, cpu, mem) = match site.kind().as_ref() {
                SiteKind::Node(pool) => {
                    let snapshot = pool.snapshot();
                    (
                        snapshot.running,
                        snapshot.avg_cpu_percent as f64 * snapshot.running as f64,
                        snapshot.total_mem_mb,
                    )
                }
                _ => (0, 0.0, 0.0),
            };

            let mut state = self
                .sites
                .entry(site.id.clone())
                .or_insert_with(|| SeriesState::new(self.config.sample_history));

            let mut sample = Sample {
                at_ms,
                hits: counters.hits,
                incoming_bytes: counters.incoming_bytes,
                outgoing_bytes: counters.outgoing_bytes,
                workers,
                cpu_percent: cpu,
                mem_mb: mem,
                ..Default::default()
            };
            {
                let previous = state.ring.last();
                sample.hit_rate = calculate_rate(
                    previous,
                    previous.map(|p| p.hits).unwrap_or(0),
                    sample.hits,
                    at_ms,
                );
                sample.incoming_rate = calculate_rate(
                    previous,
                    previous.map(|p| p.incoming_bytes).unwrap_or(0),
                    sample.incoming_bytes,
                    at_ms,
                );
                sample.outgoing_rate = calculate_rate(
                    previous,
                    previous.map(|p| p.outgoing_bytes).unwrap_or(0),
                    sample.outgoing_bytes,
                    at_ms,
                );
            }
            state.push(sample);

            global.hits += sample.hits;
            global.incoming_bytes += sample.incoming_bytes;
            global.outgoing_bytes += sample.outgoing_bytes;
            global.hit_rate += sample.hit_rate;
            global.incoming_rate += sample.incoming_rate;
            global.outgoing_rate += sample.outgoing_rate;
            global.workers += sample.workers;
            global.cpu_percent += sample.cpu_percent;
            global.mem_mb += sample.mem_mb;

            site_samples.push(SiteSample {
                id: site.id.clone(),
                name: site.name(),
                sample,
            });
        }

        // Series for sites that no longer exist are dropped here rather
        // than on removal, so removal stays cheap.
        let live: std::collections::HashSet<&str> = sites.iter().map(|s| s.id.as_str()).collect();
        self.sites.retain(|id, _| live.contains(id.as_str()));

        {
            let mut state = self.global.lock();
            let previous = state.ring.last().copied();
            global.connection_rate = calculate_rate(
                previous.as_ref(),
                previous.map(|p| p.connections).unwrap_or(0),
                global.connections,
                at_ms,
            );
            state.push(global);
        }

        let _ = self.events.send(StatsEvent::Sample {
            global,
            sites: site_samples,
        });
    }

    /// Flush accumulated minute buckets to the store, roll minute rows up
    /// into hours and days, and sweep expired rows.
    pub fn persist_once(&self) {
        let now = Utc::now().timestamp();
        let minute_start = now - now % 60;

        for mut entry in self.sites.iter_mut() {
            let site_id = entry.key().clone();
            if let Some(stats) = entry.value_mut().accumulator.flush() {
                if let Err(err) =
                    self.store
                        .record_period(&site_id, PeriodType::Minute, minute_start, &stats)
                {
                    warn!(site_id = %site_id, error = %err, "failed to persist minute stats");
                }
            }
        }

        if let Err(err) = self.store.rollup(now) {
            warn!(error = %err, "stats rollup failed");
        }
        if let Err(err) = self.store.apply_retention(
            now,
            self.config.minute_retention_days,
            self.config.hour_retention_days,
            self.config.day_retention_days,
        ) {
            warn!(error = %err, "stats retention sweep failed");
        }
    }

    pub fn dashboard_state(&self) -> DashboardState {
        let sites = self
            .dispatcher
            .sites()
            .iter()
            .map(|site| {
                let counters = site.counters.snapshot();
                let (pool, workers) = match site.kind().as_ref() {
                    SiteKind::Node(pool) => (Some(pool.snapshot()), pool.worker_summaries()),
                    _ => (None, Vec::new()),
                };
                SiteOverview {
                    id: site.id.clone(),
                    name: site.name(),
                    kind: site.kind().label(),
                    hits: counters.hits,
                    incoming_bytes: counters.incoming_bytes,
                    outgoing_bytes: counters.outgoing_bytes,
                    pool,
                    workers,
                }
            })
            .collect();

        DashboardState {
            generated_at_ms: Utc::now().timestamp_millis(),
            total_hits: self.dispatcher.hit_count(),
            total_connections: self.dispatcher.connection_count(),
            sites,
            activities: self.recent_activities(),
            global: self.global.lock().ring.last().copied().unwrap_or_default(),
        }
    }

    /// Spawn the sample and persist tickers plus the activity drain.
    pub fn spawn(
        self: &Arc<Self>,
        mut activity_rx: mpsc::UnboundedReceiver<Activity>,
        shutdown: watch::Receiver<bool>,
    ) {
        let collector = self.clone();
        let mut sample_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collector.config.sample_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => collector.sample_once(),
                    _ = sample_shutdown.changed() => {
                        if *sample_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let collector = self.clone();
        let mut persist_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collector.config.persist_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the first
            // flush covers a full interval.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => collector.persist_once(),
                    _ = persist_shutdown.changed() => {
                        if *persist_shutdown.borrow() {
                            // Final flush so a clean shutdown loses nothing.
                            collector.persist_once();
                            break;
                        }
                    }
                }
            }
        });

        let collector = self.clone();
        tokio::spawn(async move {
            while let Some(activity) = activity_rx.recv().await {
                collector.record_activity(activity);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dispatcher::Dispatcher;
    use crate::site::{BackendRecord, DomainRecord, SiteRecord};
    use crate::worker::{ProcessHandle, ProcessSpawner, SpawnSpec};

    struct NoopSpawner;

    impl ProcessSpawner for NoopSpawner {
        fn spawn(&self, _spec: &SpawnSpec) -> anyhow::Result<ProcessHandle> {
            anyhow::bail!("not used here")
        }
    }

    fn sample_at(at_ms: i64, hits: u64) -> Sample {
        Sample {
            at_ms,
            hits,
            ..Default::default()
        }
    }

    #[test]
    fn test_rate_requires_two_samples() {
        assert_eq!(calculate_rate(None, 0, 100, 2000), 0.0);
    }

    #[test]
    fn test_rate_from_delta() {
        let previous = sample_at(0, 10);
        // 40 hits over 2 seconds
        assert_eq!(calculate_rate(Some(&previous), 10, 50, 2000), 20.0);
    }

    #[test]
    fn test_rate_negative_delta_is_zero() {
        let previous = sample_at(0, 100);
        // Counter went backwards: site record was replaced.
        assert_eq!(calculate_rate(Some(&previous), 100, 5, 2000), 0.0);
    }

    #[test]
    fn test_rate_zero_elapsed_is_zero() {
        let previous = sample_at(1000, 10);
        assert_eq!(calculate_rate(Some(&previous), 10, 50, 1000), 0.0);
    }

    #[test]
    fn test_window_rate_uses_boundary_sample() {
        // Samples every second; window covers the last 2s only, but the
        // sample just before the window anchors the delta.
        let samples: Vec<Sample> = (0..5).map(|i| sample_at(i * 1000, i as u64 * 10)).collect();
        let rate = calculate_window_rate(&samples, |s| s.hits, 2000, 4000);
        // start = sample at 1000 (hits 10), end = sample at 4000 (hits 40)
        assert_eq!(rate, 10.0);
    }

    #[test]
    fn test_window_rate_insufficient_samples() {
        assert_eq!(calculate_window_rate(&[], |s| s.hits, 2000, 4000), 0.0);
        let one = vec![sample_at(0, 10)];
        assert_eq!(calculate_window_rate(&one, |s| s.hits, 2000, 4000), 0.0);
    }

    #[test]
    fn test_window_rate_counter_reset_is_zero() {
        let samples = vec![sample_at(0, 100), sample_at(2000, 5)];
        assert_eq!(calculate_window_rate(&samples, |s| s.hits, 5000, 2000), 0.0);
    }

    #[test]
    fn test_accumulator_sums_deltas_and_averages_cpu() {
        let mut acc = PeriodAccumulator::default();

        let first = Sample {
            at_ms: 0,
            hits: 10,
            incoming_bytes: 100,
            outgoing_bytes: 1000,
            cpu_percent: 20.0,
            mem_mb: 64.0,
            ..Default::default()
        };
        acc.record(None, &first);

        let second = Sample {
            at_ms: 2000,
            hits: 25,
            incoming_bytes: 400,
            outgoing_bytes: 1500,
            cpu_percent: 40.0,
            mem_mb: 32.0,
            ..Default::default()
        };
        acc.record(Some(&first), &second);

        let stats = acc.flush().unwrap();
        assert_eq!(stats.hits, 15);
        assert_eq!(stats.incoming_bytes, 300);
        assert_eq!(stats.outgoing_bytes, 500);
        assert_eq!(stats.avg_cpu_percent, 30.0);
        assert_eq!(stats.max_mem_mb, 64.0);
        assert_eq!(stats.sample_count, 2);

        // Flush resets; an empty accumulator yields nothing.
        assert!(acc.flush().is_none());
    }

    #[test]
    fn test_accumulator_tolerates_counter_reset() {
        let mut acc = PeriodAccumulator::default();
        let first = sample_at(0, 100);
        acc.record(None, &first);
        let reset = sample_at(2000, 5);
        acc.record(Some(&first), &reset);
        assert_eq!(acc.flush().unwrap().hits, 0);
    }

    #[test]
    fn test_series_state_keeps_bounded_history() {
        let mut state = SeriesState::new(3);
        for i in 0..10 {
            state.push(sample_at(i * 1000, i as u64));
        }
        let series = state.ring.to_vec();
        assert_eq!(series.len(), 3);
        assert_eq!(series.last().unwrap().hits, 9);
    }

    #[tokio::test]
    async fn test_global_sample_counts_sites_and_connections() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let dispatcher =
            Dispatcher::new(Arc::new(Config::default()), Arc::new(NoopSpawner), tx).unwrap();
        dispatcher.register_record(&SiteRecord {
            id: "s1".into(),
            name: "api".into(),
            domains: vec![DomainRecord {
                hostnames: vec!["api.test".into()],
                ..Default::default()
            }],
            backend: BackendRecord::Proxy {
                target: "http://127.0.0.1:9000".into(),
            },
            settings: Default::default(),
        });
        dispatcher.next_connection_id();

        let store = Arc::new(Store::open_in_memory().unwrap());
        let collector =
            StatsCollector::new(Config::default().stats, Arc::clone(&dispatcher), store);
        collector.sample_once();

        let sample = *collector.global_series().last().unwrap();
        assert_eq!(sample.active_sites, 1);
        assert_eq!(sample.connections, 1);
        // First sample has no predecessor to derive a rate from.
        assert_eq!(sample.connection_rate, 0.0);
    }

    #[test]
    fn test_activity_kind_labels() {
        assert_eq!(ActivityKind::WorkerCrashed.label(), "worker crashed");
        assert_eq!(ActivityKind::SiteRegistered.label(), "site registered");
    }
}
