//! In-memory fakes for the metric source and the sink store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::prom::{MetricSample, MetricSource, PromError, RangeSeries};
use crate::sink::SinkStore;

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub(crate) fn sample(pairs: &[(&str, &str)], value: f64) -> MetricSample {
    sample_at(0.0, pairs, value)
}

pub(crate) fn sample_at(timestamp: f64, pairs: &[(&str, &str)], value: f64) -> MetricSample {
    MetricSample {
        timestamp,
        labels: labels(pairs),
        value,
    }
}

pub(crate) fn series(pairs: &[(&str, &str)], points: &[(i64, f64)]) -> RangeSeries {
    RangeSeries {
        labels: labels(pairs),
        points: points.to_vec(),
    }
}

struct InstantRule {
    needle: String,
    time: Option<i64>,
    samples: Vec<MetricSample>,
}

struct RangeRule {
    needle: String,
    series: Vec<RangeSeries>,
}

/// Answers queries by substring match on the expression.
///
/// Rules are tried in registration order; the first rule whose needle occurs
/// in the expression (and whose time matches, if pinned) wins. Unmatched
/// queries return an empty result. Every expression is recorded.
#[derive(Default)]
pub(crate) struct FakeMetricSource {
    instant: Vec<InstantRule>,
    range: Vec<RangeRule>,
    failures: Vec<String>,
    unreachable: bool,
    seen: Mutex<Vec<String>>,
}

impl FakeMetricSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_instant(mut self, needle: &str, samples: Vec<MetricSample>) -> Self {
        self.instant.push(InstantRule {
            needle: needle.to_string(),
            time: None,
            samples,
        });
        self
    }

    pub(crate) fn with_instant_at(
        mut self,
        needle: &str,
        time: i64,
        samples: Vec<MetricSample>,
    ) -> Self {
        self.instant.push(InstantRule {
            needle: needle.to_string(),
            time: Some(time),
            samples,
        });
        self
    }

    pub(crate) fn with_range(mut self, needle: &str, series: Vec<RangeSeries>) -> Self {
        self.range.push(RangeRule {
            needle: needle.to_string(),
            series,
        });
        self
    }

    /// Any query containing `needle` fails.
    pub(crate) fn with_failure(mut self, needle: &str) -> Self {
        self.failures.push(needle.to_string());
        self
    }

    pub(crate) fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    /// Expressions seen so far, in call order.
    pub(crate) fn queries(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn record(&self, expr: &str) -> Result<(), PromError> {
        self.seen.lock().unwrap().push(expr.to_string());
        if self.unreachable || self.failures.iter().any(|n| expr.contains(n.as_str())) {
            return Err(PromError::Api {
                endpoint: "fake",
                status: "error".to_string(),
                error: format!("injected failure for {expr}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MetricSource for FakeMetricSource {
    async fn query_instant(
        &self,
        expr: &str,
        time: Option<i64>,
    ) -> Result<Vec<MetricSample>, PromError> {
        self.record(expr)?;
        Ok(self
            .instant
            .iter()
            .find(|r| expr.contains(r.needle.as_str()) && (r.time.is_none() || r.time == time))
            .map(|r| r.samples.clone())
            .unwrap_or_default())
    }

    async fn query_range(
        &self,
        expr: &str,
        _start: i64,
        _end: i64,
        _step_s: i64,
    ) -> Result<Vec<RangeSeries>, PromError> {
        self.record(expr)?;
        Ok(self
            .range
            .iter()
            .find(|r| expr.contains(r.needle.as_str()))
            .map(|r| r.series.clone())
            .unwrap_or_default())
    }

    async fn test_connection(&self) -> bool {
        !self.unreachable
    }
}

/// Sink backed by two maps keyed by `(datname, id)`.
#[derive(Default)]
pub(crate) struct FakeSink {
    pub(crate) query_texts: HashMap<(String, String), String>,
    pub(crate) index_definitions: HashMap<(String, String), String>,
}

impl FakeSink {
    pub(crate) fn with_query(mut self, datname: &str, queryid: &str, text: &str) -> Self {
        self.query_texts
            .insert((datname.to_string(), queryid.to_string()), text.to_string());
        self
    }

    pub(crate) fn with_index(mut self, datname: &str, index: &str, ddl: &str) -> Self {
        self.index_definitions
            .insert((datname.to_string(), index.to_string()), ddl.to_string());
        self
    }
}

#[async_trait]
impl SinkStore for FakeSink {
    async fn query_text(
        &self,
        datname: &str,
        queryid: &str,
        max_chars: Option<usize>,
    ) -> Option<String> {
        self.query_texts
            .get(&(datname.to_string(), queryid.to_string()))
            .map(|t| match max_chars {
                Some(max) => t.chars().take(max).collect(),
                None => t.clone(),
            })
    }

    async fn index_definition(&self, datname: &str, index_name: &str) -> Option<String> {
        self.index_definitions
            .get(&(datname.to_string(), index_name.to_string()))
            .cloned()
    }
}
