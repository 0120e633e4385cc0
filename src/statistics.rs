//! Lock-light statistics.
//!
//! Buckets live per (executor, phase, metric). A [`SessionStatistics`] container belongs to
//! one executor and is only written from that executor's thread, so its mutex is never
//! contended on the hot path. Other threads get a consistent view by dispatching a task to
//! the owning executor, or by reading buckets of phases that already terminated.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use volley_macros::snapshot;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

const SIGNIFICANT_DIGITS: u8 = 3;
/// Longest trackable response time: one hour. Slower responses are clamped to it.
const HIGHEST_TRACKABLE_NANOS: u64 = 3_600_000_000_000;

fn new_histogram() -> Histogram<u64> {
    // Constant bounds that are known to be valid.
    Histogram::new_with_bounds(1, HIGHEST_TRACKABLE_NANOS, SIGNIFICANT_DIGITS)
        .expect("1ns..1h at 3 significant digits is a valid histogram")
}

/// Counters and response times for one window of time.
#[derive(Clone, Debug)]
struct Interval {
    since_millis: u64,
    histogram: Histogram<u64>,
    requests: u64,
    responses: u64,
    timeouts: u64,
    invalid: u64,
    connection_errors: u64,
    blocked_nanos: u64,
}

impl Interval {
    fn new(since_millis: u64) -> Self {
        Self {
            since_millis,
            histogram: new_histogram(),
            requests: 0,
            responses: 0,
            timeouts: 0,
            invalid: 0,
            connection_errors: 0,
            blocked_nanos: 0,
        }
    }

    fn merge(&mut self, other: &Interval) {
        self.since_millis = self.since_millis.min(other.since_millis);
        if let Err(e) = self.histogram.add(&other.histogram) {
            tracing::warn!("Cannot merge response time histograms: {e}");
        }
        self.requests += other.requests;
        self.responses += other.responses;
        self.timeouts += other.timeouts;
        self.invalid += other.invalid;
        self.connection_errors += other.connection_errors;
        self.blocked_nanos += other.blocked_nanos;
    }

    fn summary(&self, start_millis: u64, end_millis: Option<u64>) -> StatisticsSummary {
        let h = &self.histogram;
        let empty = h.is_empty();
        let at = |q: f64| if empty { 0 } else { h.value_at_quantile(q) };
        StatisticsSummary {
            start_millis,
            end_millis,
            requests: self.requests,
            responses: self.responses,
            timeouts: self.timeouts,
            invalid: self.invalid,
            connection_errors: self.connection_errors,
            blocked_nanos: self.blocked_nanos,
            min_nanos: if empty { 0 } else { h.min() },
            max_nanos: if empty { 0 } else { h.max() },
            mean_nanos: if empty { 0.0 } else { h.mean() },
            p50_nanos: at(0.5),
            p90_nanos: at(0.9),
            p99_nanos: at(0.99),
            p999_nanos: at(0.999),
        }
    }
}

/// Derived view of a bucket, safe to ship anywhere.
#[snapshot]
pub struct StatisticsSummary {
    pub start_millis: u64,
    pub end_millis: Option<u64>,
    pub requests: u64,
    pub responses: u64,
    pub timeouts: u64,
    pub invalid: u64,
    pub connection_errors: u64,
    pub blocked_nanos: u64,
    pub min_nanos: u64,
    pub max_nanos: u64,
    pub mean_nanos: f64,
    pub p50_nanos: u64,
    pub p90_nanos: u64,
    pub p99_nanos: u64,
    pub p999_nanos: u64,
}

/// One (phase, metric) bucket.
///
/// Every count carries the start timestamp of the request it belongs to. The *total*
/// interval takes everything; the *recent* interval only takes requests that started
/// after it opened, so a late timeout lands in the window its request started in.
#[derive(Clone, Debug)]
pub struct Statistics {
    start_millis: u64,
    end_millis: Option<u64>,
    total: Interval,
    recent: Interval,
}

impl Statistics {
    pub fn new(now_millis: u64) -> Self {
        Self {
            start_millis: now_millis,
            end_millis: None,
            total: Interval::new(now_millis),
            recent: Interval::new(now_millis),
        }
    }

    /// Marks the beginning of measurement. Ignored once requests have been counted.
    pub fn start(&mut self, now_millis: u64) {
        if self.total.requests == 0 {
            self.start_millis = now_millis;
            self.total.since_millis = now_millis;
            self.recent.since_millis = now_millis;
        }
    }

    pub fn end(&mut self, now_millis: u64) {
        self.end_millis = Some(now_millis);
    }

    pub fn start_millis(&self) -> u64 {
        self.start_millis
    }

    pub fn end_millis(&self) -> Option<u64> {
        self.end_millis
    }

    fn apply(&mut self, start_millis: u64, f: impl Fn(&mut Interval)) {
        f(&mut self.total);
        if start_millis >= self.recent.since_millis {
            f(&mut self.recent);
        }
    }

    pub fn increment_requests(&mut self, start_millis: u64) {
        self.apply(start_millis, |i| i.requests += 1);
    }

    pub fn increment_timeouts(&mut self, start_millis: u64) {
        self.apply(start_millis, |i| i.timeouts += 1);
    }

    pub fn increment_connection_errors(&mut self, start_millis: u64) {
        self.apply(start_millis, |i| i.connection_errors += 1);
    }

    /// Records a response. `blocked` is the time the request waited before it hit the
    /// wire; it is tracked separately so queueing shows up apart from service latency.
    pub fn record_response(
        &mut self,
        start_millis: u64,
        blocked: Duration,
        response_time: Duration,
        valid: bool,
    ) {
        let nanos = response_time.as_nanos().min(u64::MAX as u128) as u64;
        let blocked = blocked.as_nanos().min(u64::MAX as u128) as u64;
        self.apply(start_millis, |i| {
            i.responses += 1;
            i.blocked_nanos = i.blocked_nanos.saturating_add(blocked);
            i.histogram.saturating_record(nanos);
            if !valid {
                i.invalid += 1;
            }
        });
    }

    pub fn summary(&self) -> StatisticsSummary {
        self.total.summary(self.start_millis, self.end_millis)
    }

    pub fn recent_summary(&self) -> StatisticsSummary {
        self.recent.summary(self.recent.since_millis, self.end_millis)
    }

    /// Closes the recent window, returning it as a standalone bucket, and opens a new one.
    pub fn take_recent(&mut self, now_millis: u64) -> Statistics {
        let recent = std::mem::replace(&mut self.recent, Interval::new(now_millis));
        Statistics {
            start_millis: recent.since_millis,
            end_millis: Some(now_millis),
            total: recent.clone(),
            recent,
        }
    }

    /// Folds another bucket of the same (phase, metric) into this one.
    pub fn merge(&mut self, other: &Statistics) {
        self.start_millis = self.start_millis.min(other.start_millis);
        self.end_millis = match (self.end_millis, other.end_millis) {
            (Some(a), Some(b)) => Some(a.max(b)),
            // Still running somewhere
            _ => None,
        };
        self.total.merge(&other.total);
        self.recent.merge(&other.recent);
    }
}

/// A bucket copied out of its executor, tagged with where it came from.
#[derive(Clone, Debug)]
pub struct StatisticsSnapshot {
    pub phase: Arc<str>,
    pub metric: Arc<str>,
    pub executor_id: usize,
    pub statistics: Statistics,
}

#[derive(Debug)]
struct PhaseBuckets {
    phase: Arc<str>,
    /// Set when the phase starts. Buckets created later begin at this stamp.
    started_at: Option<u64>,
    metrics: BTreeMap<Arc<str>, Statistics>,
}

impl PhaseBuckets {
    fn new(phase: Arc<str>) -> Self {
        Self {
            phase,
            started_at: None,
            metrics: BTreeMap::new(),
        }
    }
}

/// Per-executor statistics container for one shared-resources group.
#[derive(Clone, Debug)]
pub struct SessionStatistics {
    executor_id: usize,
    phases: Arc<Mutex<Vec<PhaseBuckets>>>,
}

impl SessionStatistics {
    pub fn new(executor_id: usize) -> Self {
        Self {
            executor_id,
            phases: Arc::default(),
        }
    }

    pub fn executor_id(&self) -> usize {
        self.executor_id
    }

    fn index_of(phases: &mut Vec<PhaseBuckets>, phase: &Arc<str>) -> usize {
        match phases.iter().position(|p| p.phase == *phase) {
            Some(index) => index,
            None => {
                phases.push(PhaseBuckets::new(phase.clone()));
                phases.len() - 1
            }
        }
    }

    /// Marks the start of `phase`: existing buckets start now, and buckets created later
    /// start at `now_millis` too.
    pub fn start_phase(&self, phase: &Arc<str>, now_millis: u64) {
        let mut phases = self.phases.lock();
        let index = Self::index_of(&mut phases, phase);
        let buckets = &mut phases[index];
        buckets.started_at = Some(now_millis);
        buckets.metrics.values_mut().for_each(|s| s.start(now_millis));
    }

    /// Creates the (phase, metric) bucket unless it exists.
    pub fn ensure_bucket(&self, phase: &Arc<str>, metric: &Arc<str>) {
        let mut phases = self.phases.lock();
        let index = Self::index_of(&mut phases, phase);
        let buckets = &mut phases[index];
        let since = buckets.started_at.unwrap_or_else(unix_millis);
        buckets
            .metrics
            .entry(metric.clone())
            .or_insert_with(|| Statistics::new(since));
    }

    /// Runs `f` on the (phase, metric) bucket. Returns `None`, without creating
    /// anything, when the bucket does not exist (never created, or pruned).
    pub fn update<R>(
        &self,
        phase: &str,
        metric: &str,
        f: impl FnOnce(&mut Statistics) -> R,
    ) -> Option<R> {
        let mut phases = self.phases.lock();
        let buckets = phases.iter_mut().find(|p| &*p.phase == phase)?;
        buckets.metrics.get_mut(metric).map(f)
    }

    /// Applies `f` to every metric bucket of `phase`.
    pub fn apply_to_phase(&self, phase: &str, mut f: impl FnMut(&mut Statistics)) {
        let mut phases = self.phases.lock();
        for buckets in phases.iter_mut().filter(|p| &*p.phase == phase) {
            buckets.metrics.values_mut().for_each(&mut f);
        }
    }

    /// Drops every bucket of `phase`.
    pub fn prune(&self, phase: &str) {
        self.phases.lock().retain(|p| &*p.phase != phase);
    }

    pub fn phases(&self) -> Vec<Arc<str>> {
        self.phases.lock().iter().map(|p| p.phase.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.lock().is_empty()
    }

    /// Copies out all buckets, or only those of `phase`.
    pub fn snapshot(&self, phase: Option<&str>) -> Vec<StatisticsSnapshot> {
        let phases = self.phases.lock();
        phases
            .iter()
            .filter(|p| phase.is_none_or(|name| &*p.phase == name))
            .flat_map(|p| {
                p.metrics.iter().map(|(metric, statistics)| StatisticsSnapshot {
                    phase: p.phase.clone(),
                    metric: metric.clone(),
                    executor_id: self.executor_id,
                    statistics: statistics.clone(),
                })
            })
            .collect()
    }

    /// Closes the recent window of every bucket and returns the closed windows.
    pub fn take_recent(&self, now_millis: u64) -> Vec<StatisticsSnapshot> {
        let executor_id = self.executor_id;
        let mut phases = self.phases.lock();
        phases
            .iter_mut()
            .flat_map(|p| {
                let phase = p.phase.clone();
                p.metrics.iter_mut().map(move |(metric, statistics)| StatisticsSnapshot {
                    phase: phase.clone(),
                    metric: metric.clone(),
                    executor_id,
                    statistics: statistics.take_recent(now_millis),
                })
            })
            .collect()
    }
}

/// Handle to one bucket, held by requests and sessions.
#[derive(Clone, Debug)]
pub struct StatisticsRef {
    bucket: SessionStatistics,
    phase: Arc<str>,
    metric: Arc<str>,
}

impl StatisticsRef {
    pub fn new(bucket: SessionStatistics, phase: Arc<str>, metric: Arc<str>) -> Self {
        // Materialize the bucket so it is visible to start/end application right away.
        bucket.ensure_bucket(&phase, &metric);
        Self {
            bucket,
            phase,
            metric,
        }
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Runs `f` on the bucket. Writes to a bucket pruned in the meantime are dropped.
    pub fn with<R>(&self, f: impl FnOnce(&mut Statistics) -> R) -> Option<R> {
        let result = self.bucket.update(&self.phase, &self.metric, f);
        if result.is_none() {
            tracing::trace!(phase = %self.phase, "Dropping write to pruned bucket {}", self.metric);
        }
        result
    }

    pub fn increment_requests(&self, start_millis: u64) {
        self.with(|s| s.increment_requests(start_millis));
    }

    pub fn increment_timeouts(&self, start_millis: u64) {
        self.with(|s| s.increment_timeouts(start_millis));
    }

    pub fn increment_connection_errors(&self, start_millis: u64) {
        self.with(|s| s.increment_connection_errors(start_millis));
    }

    pub fn record_response(
        &self,
        start_millis: u64,
        blocked: Duration,
        response_time: Duration,
        valid: bool,
    ) {
        self.with(|s| s.record_response(start_millis, blocked, response_time, valid));
    }

    pub fn summary(&self) -> Option<StatisticsSummary> {
        self.with(|s| s.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[test]
    fn records_and_summarizes() {
        let mut stats = Statistics::new(1_000);
        stats.increment_requests(1_000);
        stats.record_response(1_000, Duration::from_micros(5), Duration::from_millis(2), true);
        stats.increment_requests(1_001);
        stats.record_response(1_001, Duration::ZERO, Duration::from_millis(4), false);
        let summary = stats.summary();
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.responses, 2);
        assert_eq!(summary.invalid, 1);
        assert_eq!(summary.blocked_nanos, 5_000);
        assert!(summary.min_nanos >= 1_990_000 && summary.min_nanos <= 2_010_000);
        assert!(summary.max_nanos >= 3_990_000 && summary.max_nanos <= 4_010_000);
    }

    #[test]
    fn empty_summary_is_zeroed() {
        let summary = Statistics::new(5).summary();
        assert_eq!(summary.responses, 0);
        assert_eq!(summary.p99_nanos, 0);
        assert_eq!(summary.mean_nanos, 0.0);
    }

    #[test]
    fn late_timeout_is_attributed_by_start_timestamp() {
        let mut stats = Statistics::new(1_000);
        stats.increment_requests(1_500);
        let closed = stats.take_recent(2_000);
        assert_eq!(closed.summary().requests, 1);
        // request started in the closed window, times out after it closed
        stats.increment_timeouts(1_500);
        assert_eq!(stats.summary().timeouts, 1);
        assert_eq!(stats.recent_summary().timeouts, 0);
        stats.increment_timeouts(2_100);
        assert_eq!(stats.recent_summary().timeouts, 1);
        assert_eq!(stats.summary().timeouts, 2);
    }

    #[test]
    fn merge_combines_counts_and_end() {
        let mut a = Statistics::new(100);
        a.record_response(100, Duration::ZERO, Duration::from_millis(1), true);
        a.end(500);
        let mut b = Statistics::new(50);
        b.record_response(60, Duration::ZERO, Duration::from_millis(3), true);
        b.end(700);
        a.merge(&b);
        let summary = a.summary();
        assert_eq!(summary.responses, 2);
        assert_eq!(summary.start_millis, 50);
        assert_eq!(summary.end_millis, Some(700));
    }

    #[test]
    fn apply_to_phase_only_touches_that_phase() {
        let stats = SessionStatistics::new(0);
        stats.ensure_bucket(&name("warmup"), &name("get"));
        stats.ensure_bucket(&name("steady"), &name("get"));
        stats.ensure_bucket(&name("steady"), &name("post"));
        stats.apply_to_phase("steady", |s| s.end(42));
        for snapshot in stats.snapshot(None) {
            let expected = (&*snapshot.phase == "steady").then_some(42);
            assert_eq!(snapshot.statistics.end_millis(), expected);
        }
        assert_eq!(stats.snapshot(Some("steady")).len(), 2);
    }

    #[test]
    fn prune_removes_every_bucket_of_the_phase() {
        let stats = SessionStatistics::new(3);
        let r = StatisticsRef::new(stats.clone(), name("old"), name("get"));
        r.increment_requests(unix_millis());
        stats.ensure_bucket(&name("new"), &name("get"));
        stats.prune("old");
        assert_eq!(stats.phases(), vec![name("new")]);
        assert!(stats.snapshot(Some("old")).is_empty());
        // a late write through an old handle does not bring the phase back
        r.record_response(unix_millis(), Duration::ZERO, Duration::from_millis(1), true);
        assert_eq!(r.summary(), None);
        assert_eq!(stats.phases(), vec![name("new")]);
    }

    #[test]
    fn take_recent_resets_window_but_keeps_total() {
        let stats = SessionStatistics::new(1);
        let r = StatisticsRef::new(stats.clone(), name("p"), name("m"));
        let start = r.with(|s| s.start_millis()).unwrap();
        r.increment_requests(start);
        let recent = stats.take_recent(start + 10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].statistics.summary().requests, 1);
        assert_eq!(recent[0].executor_id, 1);
        assert_eq!(r.with(|s| s.recent_summary().requests), Some(0));
        assert_eq!(r.summary().unwrap().requests, 1);
    }

    #[test]
    fn response_times_keep_their_magnitude() {
        let mut stats = Statistics::new(0);
        stats.record_response(0, Duration::ZERO, Duration::from_millis(2), true);
        stats.record_response(0, Duration::ZERO, Duration::from_secs(3), true);
        let summary = stats.summary();
        assert!(summary.min_nanos >= 1_990_000 && summary.min_nanos <= 2_010_000);
        assert!(summary.max_nanos >= 2_990_000_000 && summary.max_nanos <= 3_010_000_000);
        assert!(summary.mean_nanos > 1_000_000_000.0);
        // beyond the trackable range: clamped, not lost
        stats.record_response(0, Duration::ZERO, Duration::from_secs(7_200), true);
        let summary = stats.summary();
        assert_eq!(summary.responses, 3);
        assert!(summary.max_nanos >= HIGHEST_TRACKABLE_NANOS - HIGHEST_TRACKABLE_NANOS / 500);
    }

    #[test]
    fn buckets_created_after_phase_start_begin_at_the_start() {
        let stats = SessionStatistics::new(0);
        stats.ensure_bucket(&name("p"), &name("early"));
        stats.start_phase(&name("p"), 1_000);
        stats.ensure_bucket(&name("p"), &name("late"));
        stats.ensure_bucket(&name("q"), &name("other"));
        let starts: Vec<_> = stats
            .snapshot(Some("p"))
            .into_iter()
            .map(|s| (s.metric.to_string(), s.statistics.start_millis()))
            .collect();
        assert_eq!(
            starts,
            vec![("early".to_string(), 1_000), ("late".to_string(), 1_000)]
        );
        assert_ne!(stats.snapshot(Some("q"))[0].statistics.start_millis(), 1_000);
    }

    #[test]
    fn summary_serializes() {
        let summary = Statistics::new(7).summary();
        let json = serde_json::to_string(&summary).unwrap();
        let back: StatisticsSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, summary);
    }
}
