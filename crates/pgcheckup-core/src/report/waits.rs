//! N001: wait events grouped by database, event type and query.

use std::collections::BTreeMap;

use super::data::{CheckData, TimeRange, WaitEventType, WaitEventsData, WaitEventsDatabase, WaitQuery};
use super::generator::CheckContext;
use super::metrics;
use crate::prom::MetricSample;
use crate::prom::expr::sum_by;

const GROUPING: [&str; 4] = ["datname", "wait_event_type", "wait_event", "query_id"];

pub(crate) async fn build_n001(ctx: &CheckContext<'_>) -> CheckData {
    let window_s = ctx.config.window_s;
    let expr = sum_by(
        &GROUPING,
        &ctx.db_selector(metrics::WAIT_EVENTS).increase(window_s),
    );
    let samples = ctx.instant(&expr).await.unwrap_or_default();
    CheckData::WaitEvents(WaitEventsData {
        time_range: TimeRange::new(ctx.end - window_s, ctx.end),
        databases: group_wait_events(&samples),
    })
}

/// Samples without a query id count towards the type total only.
pub(crate) fn group_wait_events(samples: &[MetricSample]) -> BTreeMap<String, WaitEventsDatabase> {
    // db -> type -> query -> event -> value
    let mut tree: BTreeMap<&str, BTreeMap<&str, (f64, BTreeMap<&str, BTreeMap<String, f64>>)>> =
        BTreeMap::new();
    for s in samples {
        let (Some(db), Some(kind)) = (
            s.label("datname").filter(|d| !d.is_empty()),
            s.label("wait_event_type").filter(|t| !t.is_empty()),
        ) else {
            continue;
        };
        if s.value <= 0.0 {
            continue;
        }
        let (total, queries) = tree.entry(db).or_default().entry(kind).or_default();
        *total += s.value;
        let query_id = s.label_or_empty("query_id");
        if query_id.is_empty() {
            continue;
        }
        *queries
            .entry(query_id)
            .or_default()
            .entry(s.label_or_empty("wait_event").to_string())
            .or_insert(0.0) += s.value;
    }

    tree.into_iter()
        .map(|(db, kinds)| {
            let wait_event_types = kinds
                .into_iter()
                .map(|(kind, (total, queries))| {
                    let mut queries_list: Vec<WaitQuery> = queries
                        .into_iter()
                        .map(|(id, wait_events)| WaitQuery {
                            query_id: id.to_string(),
                            total: wait_events.values().sum(),
                            wait_events,
                        })
                        .collect();
                    queries_list.sort_by(|a, b| {
                        b.total
                            .total_cmp(&a.total)
                            .then_with(|| a.query_id.cmp(&b.query_id))
                    });
                    (kind.to_string(), WaitEventType { total, queries_list })
                })
                .collect();
            (db.to_string(), WaitEventsDatabase { wait_event_types })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::GeneratorConfig;
    use crate::sink::NoSink;
    use crate::testutil::{FakeMetricSource, sample};

    fn wait(db: &str, kind: &str, event: &str, qid: &str, v: f64) -> MetricSample {
        sample(
            &[
                ("datname", db),
                ("wait_event_type", kind),
                ("wait_event", event),
                ("query_id", qid),
            ],
            v,
        )
    }

    #[test]
    fn groups_by_type_and_query() {
        let samples = [
            wait("app", "IO", "DataFileRead", "11", 5.0),
            wait("app", "IO", "WALWrite", "11", 1.0),
            wait("app", "IO", "DataFileRead", "22", 9.0),
            wait("app", "IO", "DataFileRead", "", 4.0),
            wait("app", "Lock", "tuple", "33", 0.0),
        ];
        let dbs = group_wait_events(&samples);
        let io = &dbs["app"].wait_event_types["IO"];
        assert_eq!(io.total, 19.0);
        let ids: Vec<&str> = io.queries_list.iter().map(|q| q.query_id.as_str()).collect();
        assert_eq!(ids, vec!["22", "11"]);
        assert_eq!(io.queries_list[1].total, 6.0);
        assert_eq!(io.queries_list[1].wait_events["WALWrite"], 1.0);
        assert!(!dbs["app"].wait_event_types.contains_key("Lock"));
    }

    #[tokio::test]
    async fn n001_queries_grouped_increase() {
        let source = FakeMetricSource::new().with_instant(
            metrics::WAIT_EVENTS,
            vec![wait("app", "LWLock", "BufferMapping", "7", 2.0)],
        );
        let config = GeneratorConfig::default();
        let ctx = CheckContext::new(&source, &NoSink, &config, "main", "n", 1_700_003_600);
        let CheckData::WaitEvents(data) = build_n001(&ctx).await else {
            panic!("unexpected payload");
        };
        assert_eq!(data.time_range.duration_s, 3600);
        assert_eq!(data.databases["app"].wait_event_types["LWLock"].queries_list[0].query_id, "7");
        let q = &source.queries()[0];
        assert!(q.starts_with("sum by (datname, wait_event_type, wait_event, query_id) (increase("));
        assert!(q.ends_with("[3600s]))"));
    }
}
