//! Hourly top-K attribution.
//!
//! Attributes a cumulative counter over a multi-hour window to its K largest
//! contributors on an hour-aligned grid, and reconciles everything else into
//! an "other" residual:
//!
//! 1. `end_s = floor_hour(end)`; the timeline has `hours + 1` points,
//!    `step_s` apart, ending at `end_s`.
//! 2. The K entities with the largest increase over the whole window are
//!    selected (ties broken by id, ascending).
//! 3. The unfiltered total, the union of the selected entities, and each
//!    selected entity's per-step increase are fetched, in that order.
//! 4. `other[t] = total[t] - union[t]`, clamped at zero.
//!
//! Every series is densified onto the timeline with `0.0` for missing points.
//! Selected ids go through [`build_qid_regex`] before they reach a query, and
//! a rejected id fails the whole call.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::prom::expr::{Selector, sum_by};
use crate::prom::{MetricSource, PromError, RangeSeries};
use crate::qid::{QidError, build_qid_regex};

/// Entity id used when the metric carries no per-entity label.
pub const SINGLE_ENTITY: &str = "__single__";

/// Default relative tolerance for total vs. union drift.
pub const DEFAULT_RECONCILE_TOLERANCE: f64 = 1e-6;

const HOUR: i64 = 3600;

#[derive(Debug, Error)]
pub enum TopKError {
    #[error(transparent)]
    Prom(#[from] PromError),
    #[error(transparent)]
    Qid(#[from] QidError),
}

/// Rounds an epoch timestamp down to the hour.
pub fn floor_hour(ts: i64) -> i64 {
    ts - ts.rem_euclid(HOUR)
}

// ============================================================
// Timeline & densification
// ============================================================

/// Strictly increasing alignment grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timeline {
    points: Vec<i64>,
    step_s: i64,
}

impl Timeline {
    /// `hours + 1` points spaced `step_s` apart, the last at `floor_hour(end)`.
    pub fn ending_at(end: i64, hours: u32, step_s: i64) -> Self {
        let step_s = step_s.max(1);
        let end_s = floor_hour(end);
        let points = (0..=i64::from(hours))
            .map(|i| end_s - (i64::from(hours) - i) * step_s)
            .collect();
        Self { points, step_s }
    }

    pub fn points(&self) -> &[i64] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn start(&self) -> i64 {
        self.points.first().copied().unwrap_or_default()
    }

    pub fn end(&self) -> i64 {
        self.points.last().copied().unwrap_or_default()
    }

    pub fn step_s(&self) -> i64 {
        self.step_s
    }

    /// Grid index for `ts`, snapping to the nearest point within half a step.
    fn index_of(&self, ts: i64) -> Option<usize> {
        let offset = ts - self.start();
        let idx = (offset as f64 / self.step_s as f64).round();
        if idx < 0.0 || idx as usize >= self.points.len() {
            return None;
        }
        let idx = idx as usize;
        ((ts - self.points[idx]).abs() * 2 < self.step_s).then_some(idx)
    }

    /// Fills `points` onto the grid; missing points are `0.0`, points that
    /// land on the same slot are summed, off-grid points are dropped.
    pub fn densify(&self, points: &[(i64, f64)]) -> Vec<f64> {
        let mut values = vec![0.0; self.points.len()];
        for (ts, v) in points {
            if let Some(idx) = self.index_of(*ts) {
                values[idx] += v;
            }
        }
        values
    }
}

/// Groups series by `entity_label` and densifies each group onto `timeline`.
///
/// Without an entity label every series goes to [`SINGLE_ENTITY`]. Series
/// lacking the label are ignored.
pub fn series_by_entity(
    series: &[RangeSeries],
    entity_label: Option<&str>,
    timeline: &Timeline,
) -> BTreeMap<String, Vec<f64>> {
    let mut out: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for s in series {
        let id = match entity_label {
            Some(label) => match s.label(label) {
                Some(id) => id.to_string(),
                None => continue,
            },
            None => SINGLE_ENTITY.to_string(),
        };
        let dense = timeline.densify(&s.points);
        let slot = out
            .entry(id)
            .or_insert_with(|| vec![0.0; timeline.len()]);
        for (acc, v) in slot.iter_mut().zip(dense) {
            *acc += v;
        }
    }
    out
}

/// Sums all series into one densified vector.
pub fn total_series(series: &[RangeSeries], timeline: &Timeline) -> Vec<f64> {
    series_by_entity(series, None, timeline)
        .remove(SINGLE_ENTITY)
        .unwrap_or_else(|| vec![0.0; timeline.len()])
}

fn add_into(acc: &mut [f64], other: &[f64]) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a += b;
    }
}

// ============================================================
// Reconciliation
// ============================================================

/// `other[t] = total[t] - union[t]`, never negative.
///
/// Negative drift within `tolerance` (relative to the larger magnitude of
/// total and union) is clamped silently. Larger drift is clamped too, with a
/// single warning per call.
pub fn reconcile_other(total: &[f64], union: &[f64], tolerance: f64) -> Vec<f64> {
    let mut warned = false;
    total
        .iter()
        .zip(union)
        .map(|(t, u)| {
            let other = t - u;
            if other >= 0.0 {
                return other;
            }
            let scale = t.abs().max(u.abs());
            if -other > tolerance * scale && !warned {
                warned = true;
                warn!(total = t, union = u, drift = -other, "negative 'other' clamped to 0");
            }
            0.0
        })
        .collect()
}

// ============================================================
// Selection
// ============================================================

/// Top `k` ids by value, largest first; equal values order by id ascending.
/// Non-positive totals are never selected.
pub fn select_top_k(totals: &BTreeMap<String, f64>, k: usize) -> Vec<String> {
    let mut ranked: Vec<(&String, f64)> = totals
        .iter()
        .filter(|(_, v)| **v > 0.0)
        .map(|(id, v)| (id, *v))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked.into_iter().take(k).map(|(id, _)| id.clone()).collect()
}

// ============================================================
// Aggregator
// ============================================================

/// Per-entity series and reconciled residual on a shared timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopKResult {
    pub per_entity: BTreeMap<String, Vec<f64>>,
    pub other: Vec<f64>,
    /// Independently queried total, kept for reconciliation checks.
    pub total: Vec<f64>,
    pub timeline: Vec<i64>,
}

impl TopKResult {
    /// Sum of every per-entity value over the whole timeline.
    pub fn tracked_sum(&self) -> f64 {
        self.per_entity.values().flatten().sum()
    }

    pub fn other_sum(&self) -> f64 {
        self.other.iter().sum()
    }
}

/// Runs the hourly top-K aggregation against a metric source.
pub struct HourlyTopK<'a> {
    source: &'a dyn MetricSource,
    entity_label: Option<&'a str>,
    k: usize,
    tolerance: f64,
}

impl<'a> HourlyTopK<'a> {
    /// Aggregator keyed by `queryid`.
    pub fn new(source: &'a dyn MetricSource, k: usize) -> Self {
        Self {
            source,
            entity_label: Some("queryid"),
            k,
            tolerance: DEFAULT_RECONCILE_TOLERANCE,
        }
    }

    /// Attributes to `label` instead, or to [`SINGLE_ENTITY`] with `None`.
    pub fn with_entity_label(mut self, label: Option<&'a str>) -> Self {
        self.entity_label = label;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Single-metric variant.
    pub async fn run(
        &self,
        selector: &Selector,
        end: i64,
        hours: u32,
        step_s: i64,
    ) -> Result<TopKResult, TopKError> {
        self.run_composed(std::slice::from_ref(selector), end, hours, step_s)
            .await
    }

    /// Two-metric variant: both metrics are fetched and summed before
    /// selection and reconciliation.
    pub async fn run_sum2(
        &self,
        first: &Selector,
        second: &Selector,
        end: i64,
        hours: u32,
        step_s: i64,
    ) -> Result<TopKResult, TopKError> {
        self.run_composed(&[first.clone(), second.clone()], end, hours, step_s)
            .await
    }

    async fn run_composed(
        &self,
        selectors: &[Selector],
        end: i64,
        hours: u32,
        step_s: i64,
    ) -> Result<TopKResult, TopKError> {
        let timeline = Timeline::ending_at(end, hours, step_s);
        let step_s = timeline.step_s();
        let window_s = step_s * i64::from(hours.max(1));

        let total = self.fetch_total(selectors, &timeline, step_s).await?;

        let Some(label) = self.entity_label else {
            return Ok(TopKResult {
                per_entity: BTreeMap::from([(SINGLE_ENTITY.to_string(), total.clone())]),
                other: vec![0.0; timeline.len()],
                total,
                timeline: timeline.points().to_vec(),
            });
        };

        let selected = self
            .select(selectors, label, timeline.end(), window_s)
            .await?;
        if selected.is_empty() {
            debug!("no entity contributed in window, everything is 'other'");
            return Ok(TopKResult {
                per_entity: BTreeMap::new(),
                other: reconcile_other(&total, &vec![0.0; timeline.len()], self.tolerance),
                total,
                timeline: timeline.points().to_vec(),
            });
        }

        let pattern = build_qid_regex(&selected)?;
        let filtered: Vec<Selector> = selectors
            .iter()
            .map(|s| s.clone().matches(label, &pattern))
            .collect();

        let mut union = vec![0.0; timeline.len()];
        for selector in &filtered {
            let expr = sum_by(&[], &selector.increase(step_s));
            let series = self.range(&expr, &timeline).await?;
            add_into(&mut union, &total_series(&series, &timeline));
        }

        let mut per_entity: BTreeMap<String, Vec<f64>> = selected
            .iter()
            .map(|id| (id.clone(), vec![0.0; timeline.len()]))
            .collect();
        for selector in &filtered {
            let expr = sum_by(&[label], &selector.increase(step_s));
            let series = self.range(&expr, &timeline).await?;
            for (id, values) in series_by_entity(&series, Some(label), &timeline) {
                if let Some(slot) = per_entity.get_mut(&id) {
                    add_into(slot, &values);
                }
            }
        }

        let other = reconcile_other(&total, &union, self.tolerance);
        debug!(selected = selected.len(), points = timeline.len(), "top-k aggregated");
        Ok(TopKResult {
            per_entity,
            other,
            total,
            timeline: timeline.points().to_vec(),
        })
    }

    async fn range(&self, expr: &str, timeline: &Timeline) -> Result<Vec<RangeSeries>, PromError> {
        self.source
            .query_range(expr, timeline.start(), timeline.end(), timeline.step_s())
            .await
    }

    async fn fetch_total(
        &self,
        selectors: &[Selector],
        timeline: &Timeline,
        step_s: i64,
    ) -> Result<Vec<f64>, PromError> {
        let mut total = vec![0.0; timeline.len()];
        for selector in selectors {
            let expr = sum_by(&[], &selector.increase(step_s));
            let series = self.range(&expr, timeline).await?;
            add_into(&mut total, &total_series(&series, timeline));
        }
        Ok(total)
    }

    async fn select(
        &self,
        selectors: &[Selector],
        label: &str,
        at: i64,
        window_s: i64,
    ) -> Result<Vec<String>, PromError> {
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        for selector in selectors {
            let expr = sum_by(&[label], &selector.increase(window_s));
            for sample in self.source.query_instant(&expr, Some(at)).await? {
                if let Some(id) = sample.label(label) {
                    *totals.entry(id.to_string()).or_insert(0.0) += sample.value;
                }
            }
        }
        Ok(select_top_k(&totals, self.k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeMetricSource, sample, series};

    const END: i64 = 1_700_002_800; // 2023-11-14T23:00:00Z

    #[test]
    fn floor_hour_aligns_down() {
        assert_eq!(floor_hour(END), END);
        assert_eq!(floor_hour(END + 1799), END);
        assert_eq!(floor_hour(END - 1), END - 3600);
    }

    #[test]
    fn timeline_has_hours_plus_one_points() {
        let tl = Timeline::ending_at(END + 125, 3, 3600);
        assert_eq!(tl.points(), &[END - 10800, END - 7200, END - 3600, END]);
        assert!(tl.points().windows(2).all(|w| w[0] < w[1]));
        assert_eq!(Timeline::ending_at(END, 0, 3600).points(), &[END]);
    }

    #[test]
    fn densify_fills_gaps_and_snaps() {
        let tl = Timeline::ending_at(END, 2, 3600);
        let dense = tl.densify(&[(END - 7200, 1.0), (END + 10, 2.0), (END + 99_999, 5.0)]);
        assert_eq!(dense, vec![1.0, 0.0, 2.0]);
    }

    #[test]
    fn reconcile_clamps_negative_drift() {
        let total = [10.0, 5.0, 1.0];
        let union = [4.0, 5.000_000_000_1, 3.0];
        let other = reconcile_other(&total, &union, DEFAULT_RECONCILE_TOLERANCE);
        assert_eq!(other, vec![6.0, 0.0, 0.0]);
        assert!(other.iter().all(|v| *v >= 0.0));
        // Clamping is idempotent.
        let again = reconcile_other(&other, &[0.0; 3], DEFAULT_RECONCILE_TOLERANCE);
        assert_eq!(again, other);
    }

    #[test]
    fn select_top_k_breaks_ties_by_id() {
        let totals: BTreeMap<String, f64> = [("9", 5.0), ("10", 5.0), ("3", 7.0), ("4", 0.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(select_top_k(&totals, 2), vec!["3", "10"]);
        assert_eq!(select_top_k(&totals, 10), vec!["3", "10", "9"]);
    }

    fn temp_bytes_source() -> FakeMetricSource {
        FakeMetricSource::new()
            .with_instant(
                "sum by (queryid) (increase(pgwatch_pg_stat_statements_temp_bytes_written",
                vec![
                    sample(&[("queryid", "1")], 3.0),
                    sample(&[("queryid", "2")], 4.0),
                ],
            )
            .with_range(
                "sum by (queryid) (increase(pgwatch_pg_stat_statements_temp_bytes_written",
                vec![
                    series(&[("queryid", "1")], &[(END - 3600, 1.0), (END, 2.0)]),
                    series(&[("queryid", "2")], &[(END - 3600, 0.0), (END, 4.0)]),
                ],
            )
            .with_range(
                "queryid=~",
                vec![series(&[], &[(END - 3600, 1.0), (END, 6.0)])],
            )
            .with_range(
                "sum(increase(pgwatch_pg_stat_statements_temp_bytes_written",
                vec![series(&[], &[(END - 3600, 11.0), (END, 6.0)])],
            )
    }

    #[tokio::test]
    async fn attributes_top_entities_and_reconciles_other() {
        let source = temp_bytes_source();
        let selector = Selector::new("pgwatch_pg_stat_statements_temp_bytes_written");
        let result = HourlyTopK::new(&source, 10)
            .run(&selector, END, 2, 3600)
            .await
            .unwrap();

        assert_eq!(result.timeline.len(), 3);
        assert_eq!(result.per_entity["1"], vec![0.0, 1.0, 2.0]);
        assert_eq!(result.per_entity["2"], vec![0.0, 0.0, 4.0]);
        assert_eq!(result.other, vec![0.0, 10.0, 0.0]);
        assert_eq!(result.tracked_sum(), 7.0);
        assert_eq!(result.other_sum(), 10.0);

        for values in result.per_entity.values() {
            assert_eq!(values.len(), result.timeline.len());
        }
        for t in 0..result.timeline.len() {
            let parts: f64 = result.per_entity.values().map(|v| v[t]).sum::<f64>() + result.other[t];
            assert!((parts - result.total[t]).abs() <= 1e-6 * result.total[t].abs().max(1.0));
        }
    }

    #[tokio::test]
    async fn queries_follow_total_union_entity_order() {
        let source = temp_bytes_source();
        let selector = Selector::new("pgwatch_pg_stat_statements_temp_bytes_written");
        HourlyTopK::new(&source, 10)
            .run(&selector, END, 2, 3600)
            .await
            .unwrap();
        let queries = source.queries();
        assert_eq!(queries.len(), 4);
        assert!(queries[0].starts_with("sum(increase("));
        assert!(queries[1].contains("[7200s]"));
        assert!(queries[2].starts_with("sum(increase(") && queries[2].contains(r#"queryid=~"^(?:2|1)$""#));
        assert!(queries[3].starts_with("sum by (queryid)") && queries[3].contains("queryid=~"));
    }

    #[tokio::test]
    async fn invalid_entity_id_fails_whole_call() {
        let source = FakeMetricSource::new().with_instant(
            "sum by (queryid)",
            vec![
                sample(&[("queryid", "1")], 3.0),
                sample(&[("queryid", "1|.*")], 9.0),
            ],
        );
        let err = HourlyTopK::new(&source, 5)
            .run(&Selector::new("m"), END, 1, 3600)
            .await
            .unwrap_err();
        assert!(matches!(err, TopKError::Qid(QidError::Invalid { .. })));
        assert!(source.queries().iter().all(|q| !q.contains("=~")));
    }

    #[tokio::test]
    async fn no_contributors_means_everything_is_other() {
        let source = FakeMetricSource::new()
            .with_range("sum(increase(m", vec![series(&[], &[(END, 5.0)])]);
        let result = HourlyTopK::new(&source, 5)
            .run(&Selector::new("m"), END, 1, 3600)
            .await
            .unwrap();
        assert!(result.per_entity.is_empty());
        assert_eq!(result.other, vec![0.0, 5.0]);
    }

    #[tokio::test]
    async fn single_entity_mode_uses_sentinel() {
        let source = FakeMetricSource::new()
            .with_range("sum(increase(m", vec![series(&[], &[(END - 3600, 2.0), (END, 3.0)])]);
        let result = HourlyTopK::new(&source, 5)
            .with_entity_label(None)
            .run(&Selector::new("m"), END, 1, 3600)
            .await
            .unwrap();
        assert_eq!(result.per_entity[SINGLE_ENTITY], vec![2.0, 3.0]);
        assert_eq!(result.other, vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn sum2_composes_both_metrics() {
        let source = FakeMetricSource::new()
            .with_instant("sum by (queryid) (increase(read[", vec![sample(&[("queryid", "1")], 1.0)])
            .with_instant("sum by (queryid) (increase(write[", vec![sample(&[("queryid", "2")], 5.0)])
            .with_range("sum by (queryid) (increase(read{", vec![series(&[("queryid", "1")], &[(END, 1.0)])])
            .with_range("sum by (queryid) (increase(write{", vec![series(&[("queryid", "2")], &[(END, 5.0)])])
            .with_range("sum(increase(read{", vec![series(&[], &[(END, 1.0)])])
            .with_range("sum(increase(write{", vec![series(&[], &[(END, 5.0)])])
            .with_range("sum(increase(read[", vec![series(&[], &[(END, 2.0)])])
            .with_range("sum(increase(write[", vec![series(&[], &[(END, 6.0)])]);
        let result = HourlyTopK::new(&source, 1)
            .run_sum2(&Selector::new("read"), &Selector::new("write"), END, 1, 3600)
            .await
            .unwrap();
        assert_eq!(result.per_entity.keys().collect::<Vec<_>>(), vec!["2"]);
        assert_eq!(result.per_entity["2"], vec![0.0, 5.0]);
        assert_eq!(result.total, vec![0.0, 8.0]);
        assert_eq!(result.other, vec![0.0, 2.0]);
    }

    #[tokio::test]
    async fn backend_failure_is_an_error() {
        let source = FakeMetricSource::unreachable();
        let err = HourlyTopK::new(&source, 5)
            .run(&Selector::new("m"), END, 1, 3600)
            .await
            .unwrap_err();
        assert!(matches!(err, TopKError::Prom(_)));
    }
}
