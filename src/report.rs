use serde::{Serialize, de::DeserializeOwned};
use std::{collections::BTreeMap, fmt::Debug, future::Future, io::Write, sync::Arc};
use volley_macros::snapshot;

use crate::{
    error::EngineError,
    statistics::{Statistics, StatisticsSnapshot, StatisticsSummary, unix_millis},
};

/// A [`Report`] is the processed form of collected statistics.
///
/// Reports are *pure data structures*, free of side effects and I/O. They are built from
/// statistics snapshots (typically via a [`From`] implementation) and can then be
/// serialized, logged, or consumed by a [`Reporter`].
///
/// # Example
/// ```rust
/// use volley::{Report, StatisticsReport};
///
/// fn assert_report<R: Report>() {}
/// assert_report::<StatisticsReport>();
/// ```
///
/// See also: [`Reporter`].
pub trait Report
where
    Self: Send + Sync + Debug + Serialize + DeserializeOwned,
{
}

/// A [`Reporter`] consumes a [`Report`] and performs side effects: displaying it,
/// sending it to a service, or persisting it somewhere.
///
/// # Example
/// ```rust
/// use volley::{EngineError, Report, Reporter};
/// struct MyReporter;
/// impl<R: Report> Reporter<R> for MyReporter {
///     async fn report(&self, report: &R) -> Result<(), EngineError> {
///         println!("{:?}", report);
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter<R: Report> {
    fn report(&self, report: &R) -> impl Future<Output = Result<(), EngineError>>;
}

/// Totals of one (phase, metric) pair across all executors.
#[snapshot]
pub struct RequestStats {
    pub phase: String,
    pub metric: String,
    pub summary: StatisticsSummary,
}

impl RequestStats {
    /// Responses per second over the covered interval, formatted for humans.
    /// Running phases are measured up to `now_millis`.
    pub fn throughput(&self, now_millis: u64) -> String {
        let end = self.summary.end_millis.unwrap_or(now_millis);
        if end <= self.summary.start_millis {
            return "<none>".to_string();
        }
        let elapsed = (end - self.summary.start_millis) as f64;
        let rate = 1000.0 * self.summary.responses as f64 / elapsed;
        if rate < 10_000.0 {
            format!("{rate:.2} req/s")
        } else if rate < 10_000_000.0 {
            format!("{:.2}k req/s", rate / 1_000.0)
        } else {
            format!("{:.2}M req/s", rate / 1_000_000.0)
        }
    }
}

/// One row per (phase, metric), ordered by phase then metric.
#[snapshot]
pub struct StatisticsReport {
    pub rows: Vec<RequestStats>,
}

impl From<Vec<StatisticsSnapshot>> for StatisticsReport {
    fn from(snapshots: Vec<StatisticsSnapshot>) -> Self {
        let mut merged: BTreeMap<(Arc<str>, Arc<str>), Statistics> = BTreeMap::new();
        for snapshot in snapshots {
            match merged.entry((snapshot.phase, snapshot.metric)) {
                std::collections::btree_map::Entry::Occupied(mut e) => {
                    e.get_mut().merge(&snapshot.statistics)
                }
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(snapshot.statistics);
                }
            }
        }
        let rows = merged
            .into_iter()
            .map(|((phase, metric), statistics)| RequestStats {
                phase: phase.to_string(),
                metric: metric.to_string(),
                summary: statistics.summary(),
            })
            .collect();
        Self { rows }
    }
}

impl Report for StatisticsReport {}

fn millis(nanos: f64) -> f64 {
    nanos / 1_000_000.0
}

/// Formats one row the way [`StdoutReporter`] prints it.
pub fn format_row(row: &RequestStats, now_millis: u64) -> String {
    let s = &row.summary;
    format!(
        "{}/{}: {} requests, {} responses, mean {:.2} ms, p50 {:.2} ms, p99 {:.2} ms, {} timeouts, {} errors, {} invalid, {}",
        row.phase,
        row.metric,
        s.requests,
        s.responses,
        millis(s.mean_nanos),
        millis(s.p50_nanos as f64),
        millis(s.p99_nanos as f64),
        s.timeouts,
        s.connection_errors,
        s.invalid,
        row.throughput(now_millis),
    )
}

/// Prints one line per row to stdout.
#[derive(Debug, Default)]
pub struct StdoutReporter;

impl Reporter<StatisticsReport> for StdoutReporter {
    async fn report(&self, report: &StatisticsReport) -> Result<(), EngineError> {
        let now = unix_millis();
        let mut out = std::io::stdout().lock();
        for row in &report.rows {
            writeln!(out, "{}", format_row(row, now))?;
        }
        out.flush()?;
        Ok(())
    }
}
