//! Counter window aggregation.
//!
//! Turns two snapshots of monotonic counters (window start and window end)
//! into deltas, per-second rates and per-call rates. Rows are keyed by
//! `(datname, queryid, user, instance)` and several metrics merge into one row.
//!
//! A counter that went backwards (stats reset) yields a negative delta. It is
//! reported as-is rather than dropped or clamped.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{debug, warn};

use crate::prom::expr::Selector;
use crate::prom::{MetricSample, MetricSource, PromError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// PostgreSQL page size; page-valued byte counters are divided by this.
pub const PAGE_SIZE: f64 = 8192.0;

/// Column holding the call counter, used as the per-call denominator.
pub const CALLS_COLUMN: &str = "calls";

const STATEMENTS_PREFIX: &str = "pgwatch_pg_stat_statements_";

// ---------------------------------------------------------------------------
// Row identity
// ---------------------------------------------------------------------------

/// Composite identity of one aggregated row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RowKey {
    pub datname: String,
    pub queryid: String,
    pub user: String,
    pub instance: String,
}

impl RowKey {
    pub fn from_sample(sample: &MetricSample) -> Self {
        Self {
            datname: sample.label_or_empty("datname").to_string(),
            queryid: sample.label_or_empty("queryid").to_string(),
            user: sample.label_or_empty("user").to_string(),
            instance: sample.label_or_empty("instance").to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots and deltas
// ---------------------------------------------------------------------------

/// Counter values at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterSnapshot {
    pub values: HashMap<RowKey, f64>,
    /// Latest sample timestamp, `None` when the snapshot is empty.
    pub timestamp: Option<f64>,
}

impl CounterSnapshot {
    /// Builds a snapshot; samples sharing a key are summed.
    pub fn from_samples(samples: &[MetricSample]) -> Self {
        let mut snapshot = Self::default();
        for sample in samples {
            *snapshot.values.entry(RowKey::from_sample(sample)).or_insert(0.0) += sample.value;
            snapshot.timestamp = Some(match snapshot.timestamp {
                Some(ts) => ts.max(sample.timestamp),
                None => sample.timestamp,
            });
        }
        snapshot
    }

    fn scaled(mut self, divisor: f64) -> Self {
        if divisor != 1.0 {
            for v in self.values.values_mut() {
                *v /= divisor;
            }
        }
        self
    }
}

/// Delta of one counter over the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CounterDelta {
    pub diff: f64,
    pub per_sec: f64,
    pub per_call: f64,
}

/// `diff = end - start`; rates are 0 when their denominator is 0.
pub fn counter_delta(start: f64, end: f64, duration_s: f64, calls_diff: f64) -> CounterDelta {
    let diff = end - start;
    CounterDelta {
        diff,
        per_sec: if duration_s != 0.0 { diff / duration_s } else { 0.0 },
        per_call: if calls_diff != 0.0 { diff / calls_diff } else { 0.0 },
    }
}

/// Elapsed seconds between two snapshots, taken from the samples' own
/// timestamps and falling back to `fallback_s` when either is missing.
pub fn effective_duration(start: Option<f64>, end: Option<f64>, fallback_s: f64) -> f64 {
    match (start, end) {
        (Some(s), Some(e)) => e - s,
        _ => fallback_s,
    }
}

/// Per-key delta between two snapshots. Keys absent at the window start
/// count from zero; keys absent at the end are dropped.
pub fn snapshot_diff(start: &CounterSnapshot, end: &CounterSnapshot) -> HashMap<RowKey, f64> {
    end.values
        .iter()
        .map(|(key, v)| (key.clone(), v - start.values.get(key).copied().unwrap_or(0.0)))
        .collect()
}

// ---------------------------------------------------------------------------
// Columns
// ---------------------------------------------------------------------------

/// Maps a statements metric to its report column and divisor.
///
/// `*_bytes_*_total` counters are page-valued and become `*_blks_*` block
/// counts (divisor [`PAGE_SIZE`]); everything else keeps its name minus the
/// `pgwatch_pg_stat_statements_` prefix.
pub fn column_for_metric(metric: &str) -> (String, f64) {
    let short = metric.strip_prefix(STATEMENTS_PREFIX).unwrap_or(metric);
    match short.strip_suffix("_total") {
        Some(stem) if stem.contains("_bytes_") => (stem.replacen("_bytes_", "_blks_", 1), PAGE_SIZE),
        _ => (short.to_string(), 1.0),
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Merged per-row deltas for one window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowTable {
    pub start: i64,
    pub end: i64,
    pub rows: BTreeMap<RowKey, BTreeMap<String, CounterDelta>>,
}

impl WindowTable {
    /// Sums rows that share a database; per-second and per-call rates are
    /// recomputed from the summed deltas.
    pub fn by_database(&self) -> BTreeMap<String, BTreeMap<String, CounterDelta>> {
        let mut sums: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for (key, metrics) in &self.rows {
            let db = sums.entry(key.datname.clone()).or_default();
            for (column, delta) in metrics {
                *db.entry(column.clone()).or_insert(0.0) += delta.diff;
            }
        }
        let duration = (self.end - self.start) as f64;
        sums.into_iter()
            .map(|(db, columns)| (db, deltas_from_sums(&columns, duration)))
            .collect()
    }

    /// Totals across all rows.
    pub fn totals(&self) -> BTreeMap<String, CounterDelta> {
        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        for metrics in self.rows.values() {
            for (column, delta) in metrics {
                *sums.entry(column.clone()).or_insert(0.0) += delta.diff;
            }
        }
        deltas_from_sums(&sums, (self.end - self.start) as f64)
    }
}

fn deltas_from_sums(sums: &BTreeMap<String, f64>, duration: f64) -> BTreeMap<String, CounterDelta> {
    let calls = sums.get(CALLS_COLUMN).copied().unwrap_or(0.0);
    sums.iter()
        .map(|(column, diff)| (column.clone(), counter_delta(0.0, *diff, duration, calls)))
        .collect()
}

/// Fetches start and end snapshots of `expr` with two instant queries.
pub async fn fetch_snapshots(
    source: &dyn MetricSource,
    expr: &str,
    start: i64,
    end: i64,
) -> Result<(CounterSnapshot, CounterSnapshot), PromError> {
    let start_samples = source.query_instant(expr, Some(start)).await?;
    let end_samples = source.query_instant(expr, Some(end)).await?;
    Ok((
        CounterSnapshot::from_samples(&start_samples),
        CounterSnapshot::from_samples(&end_samples),
    ))
}

/// Aggregates the given statements metrics over `[start, end]`.
///
/// A metric whose queries fail is logged and left out; the other columns
/// are still produced. Per-call rates use the `calls` column of the same
/// row, so include `pgwatch_pg_stat_statements_calls` to get them.
pub async fn aggregate_window(
    source: &dyn MetricSource,
    selectors: &[Selector],
    start: i64,
    end: i64,
) -> WindowTable {
    let fallback = (end - start) as f64;
    let mut diffs: BTreeMap<RowKey, BTreeMap<String, (f64, f64)>> = BTreeMap::new();

    for selector in selectors {
        let (column, divisor) = column_for_metric(selector.metric());
        let expr = selector.to_string();
        let (start_snap, end_snap) = match fetch_snapshots(source, &expr, start, end).await {
            Ok(snaps) => snaps,
            Err(e) => {
                warn!(metric = selector.metric(), error = %e, "counter window query failed, column omitted");
                continue;
            }
        };
        let duration = effective_duration(start_snap.timestamp, end_snap.timestamp, fallback);
        let start_snap = start_snap.scaled(divisor);
        let end_snap = end_snap.scaled(divisor);
        let rows = snapshot_diff(&start_snap, &end_snap);
        debug!(metric = selector.metric(), rows = rows.len(), duration, "counter window");
        for (key, diff) in rows {
            diffs.entry(key).or_default().insert(column.clone(), (diff, duration));
        }
    }

    let rows = diffs
        .into_iter()
        .map(|(key, columns)| {
            let calls = columns.get(CALLS_COLUMN).map(|(d, _)| *d).unwrap_or(0.0);
            let metrics = columns
                .into_iter()
                .map(|(column, (diff, duration))| {
                    (column, counter_delta(0.0, diff, duration, calls))
                })
                .collect();
            (key, metrics)
        })
        .collect();

    WindowTable { start, end, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeMetricSource, sample, sample_at};

    #[test]
    fn delta_is_end_minus_start() {
        let d = counter_delta(100.0, 160.0, 60.0, 3.0);
        assert_eq!(d.diff, 60.0);
        assert_eq!(d.per_sec, 1.0);
        assert_eq!(d.per_call, 20.0);
    }

    #[test]
    fn zero_denominators_yield_zero_rates() {
        let d = counter_delta(1.0, 5.0, 0.0, 0.0);
        assert_eq!(d.diff, 4.0);
        assert_eq!(d.per_sec, 0.0);
        assert_eq!(d.per_call, 0.0);
    }

    #[test]
    fn counter_reset_passes_through_negative() {
        let d = counter_delta(500.0, 20.0, 10.0, 1.0);
        assert_eq!(d.diff, -480.0);
        assert_eq!(d.per_sec, -48.0);
    }

    #[test]
    fn duration_prefers_sample_timestamps() {
        assert_eq!(effective_duration(Some(100.0), Some(400.0), 60.0), 300.0);
        assert_eq!(effective_duration(None, Some(400.0), 60.0), 60.0);
        assert_eq!(effective_duration(Some(100.0), None, 60.0), 60.0);
    }

    #[test]
    fn snapshot_sums_duplicate_keys() {
        let snap = CounterSnapshot::from_samples(&[
            sample_at(10.0, &[("datname", "db"), ("queryid", "1")], 2.0),
            sample_at(12.0, &[("datname", "db"), ("queryid", "1")], 3.0),
        ]);
        assert_eq!(snap.values.len(), 1);
        assert_eq!(snap.values.values().next().copied(), Some(5.0));
        assert_eq!(snap.timestamp, Some(12.0));
        assert_eq!(CounterSnapshot::from_samples(&[]).timestamp, None);
    }

    #[test]
    fn new_keys_count_from_zero() {
        let start = CounterSnapshot::from_samples(&[]);
        let end = CounterSnapshot::from_samples(&[sample(&[("queryid", "9")], 7.0)]);
        let diffs = snapshot_diff(&start, &end);
        assert_eq!(diffs.values().copied().collect::<Vec<_>>(), vec![7.0]);
    }

    #[test]
    fn page_metrics_become_block_columns() {
        assert_eq!(
            column_for_metric("pgwatch_pg_stat_statements_shared_bytes_hit_total"),
            ("shared_blks_hit".to_string(), PAGE_SIZE)
        );
        assert_eq!(
            column_for_metric("pgwatch_pg_stat_statements_exec_time_total"),
            ("exec_time_total".to_string(), 1.0)
        );
        assert_eq!(
            column_for_metric("pgwatch_pg_stat_statements_temp_bytes_written"),
            ("temp_bytes_written".to_string(), 1.0)
        );
    }

    #[tokio::test]
    async fn aggregate_merges_metrics_per_row() {
        let row = [("datname", "db1"), ("queryid", "42"), ("user", "app"), ("instance", "i")];
        let source = FakeMetricSource::new()
            .with_instant_at("calls", 1000, vec![sample_at(1000.0, &row, 10.0)])
            .with_instant_at("calls", 1060, vec![sample_at(1060.0, &row, 16.0)])
            .with_instant_at("shared_bytes_read_total", 1000, vec![sample_at(1000.0, &row, 8192.0)])
            .with_instant_at(
                "shared_bytes_read_total",
                1060,
                vec![sample_at(1060.0, &row, 8192.0 * 13.0)],
            );
        let selectors = [
            Selector::new("pgwatch_pg_stat_statements_calls"),
            Selector::new("pgwatch_pg_stat_statements_shared_bytes_read_total"),
        ];
        let table = aggregate_window(&source, &selectors, 1000, 1060).await;
        assert_eq!(table.rows.len(), 1);
        let metrics = table.rows.values().next().unwrap();
        assert_eq!(metrics["calls"].diff, 6.0);
        assert_eq!(metrics["calls"].per_sec, 0.1);
        assert_eq!(metrics["shared_blks_read"].diff, 12.0);
        assert_eq!(metrics["shared_blks_read"].per_call, 2.0);
    }

    #[tokio::test]
    async fn failed_metric_is_omitted() {
        let row = [("datname", "db1"), ("queryid", "1")];
        let source = FakeMetricSource::new()
            .with_failure("exec_time_total")
            .with_instant_at("calls", 0, vec![sample_at(0.0, &row, 1.0)])
            .with_instant_at("calls", 60, vec![sample_at(60.0, &row, 4.0)]);
        let selectors = [
            Selector::new("pgwatch_pg_stat_statements_calls"),
            Selector::new("pgwatch_pg_stat_statements_exec_time_total"),
        ];
        let table = aggregate_window(&source, &selectors, 0, 60).await;
        let metrics = table.rows.values().next().unwrap();
        assert!(metrics.contains_key("calls"));
        assert!(!metrics.contains_key("exec_time_total"));
    }

    #[test]
    fn by_database_recomputes_rates() {
        let mut table = WindowTable {
            start: 0,
            end: 10,
            rows: BTreeMap::new(),
        };
        for (qid, calls, time) in [("1", 2.0, 10.0), ("2", 3.0, 40.0)] {
            let key = RowKey {
                datname: "db".to_string(),
                queryid: qid.to_string(),
                ..Default::default()
            };
            let metrics = [
                ("calls".to_string(), counter_delta(0.0, calls, 10.0, calls)),
                ("exec_time_total".to_string(), counter_delta(0.0, time, 10.0, calls)),
            ]
            .into_iter()
            .collect();
            table.rows.insert(key, metrics);
        }
        let db = &table.by_database()["db"];
        assert_eq!(db["calls"].diff, 5.0);
        assert_eq!(db["exec_time_total"].diff, 50.0);
        assert_eq!(db["exec_time_total"].per_sec, 5.0);
        assert_eq!(db["exec_time_total"].per_call, 10.0);
        assert_eq!(table.totals()["calls"].per_sec, 0.5);
    }
}
