//! F004/F005: estimated heap and btree bloat.

use std::collections::BTreeMap;

use super::data::{BloatData, BloatDatabase, BloatEntry, CheckData};
use super::generator::CheckContext;
use super::metrics;
use crate::fmt::format_bytes;
use crate::prom::MetricSample;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
    datname: String,
    schema: String,
    table: String,
    index: Option<String>,
}

impl ObjectKey {
    fn from_sample(sample: &MetricSample, with_index: bool) -> Option<Self> {
        let datname = sample.label("datname").filter(|d| !d.is_empty())?;
        Some(Self {
            datname: datname.to_string(),
            schema: sample.label_or_empty("schemaname").to_string(),
            table: sample.label_or_empty("tblname").to_string(),
            index: with_index.then(|| sample.label_or_empty("idxname").to_string()),
        })
    }
}

#[derive(Default)]
struct Estimate {
    real_size: f64,
    bloat_size: f64,
    bloat_pct: f64,
}

struct BloatMetrics {
    real_size: &'static str,
    bloat_size: &'static str,
    bloat_pct: &'static str,
    with_index: bool,
}

const TABLES: BloatMetrics = BloatMetrics {
    real_size: metrics::TABLE_BLOAT_REAL_SIZE,
    bloat_size: metrics::TABLE_BLOAT_SIZE,
    bloat_pct: metrics::TABLE_BLOAT_PCT,
    with_index: false,
};

const BTREE_INDEXES: BloatMetrics = BloatMetrics {
    real_size: metrics::BTREE_BLOAT_REAL_SIZE,
    bloat_size: metrics::BTREE_BLOAT_SIZE,
    bloat_pct: metrics::BTREE_BLOAT_PCT,
    with_index: true,
};

pub(crate) async fn build_f004(ctx: &CheckContext<'_>) -> CheckData {
    CheckData::Bloat(collect(ctx, &TABLES).await)
}

pub(crate) async fn build_f005(ctx: &CheckContext<'_>) -> CheckData {
    CheckData::Bloat(collect(ctx, &BTREE_INDEXES).await)
}

async fn collect(ctx: &CheckContext<'_>, m: &BloatMetrics) -> BloatData {
    let mut estimates: BTreeMap<ObjectKey, Estimate> = BTreeMap::new();
    let fields: [(&str, fn(&mut Estimate, f64)); 3] = [
        (m.real_size, |e, v| e.real_size = v),
        (m.bloat_size, |e, v| e.bloat_size = v),
        (m.bloat_pct, |e, v| e.bloat_pct = v),
    ];
    for (metric, set) in fields {
        let Some(samples) = ctx.gauge(&ctx.db_selector(metric)).await else {
            continue;
        };
        for sample in &samples {
            if let Some(key) = ObjectKey::from_sample(sample, m.with_index) {
                set(estimates.entry(key).or_default(), sample.value);
            }
        }
    }
    assemble(estimates, ctx.config.list_limit)
}

/// Groups estimates by database, biggest bloat first, at most `limit` per
/// database. Totals cover every bloated object, not just the listed ones.
fn assemble(estimates: BTreeMap<ObjectKey, Estimate>, limit: usize) -> BloatData {
    let mut grouped: BTreeMap<String, Vec<BloatEntry>> = BTreeMap::new();
    for (key, est) in estimates {
        if est.bloat_size <= 0.0 {
            continue;
        }
        let real = est.real_size.max(0.0) as u64;
        let bloat = est.bloat_size as u64;
        grouped.entry(key.datname).or_default().push(BloatEntry {
            schema_name: key.schema,
            table_name: key.table,
            index_name: key.index,
            real_size_bytes: real,
            real_size_pretty: format_bytes(real),
            bloat_size_bytes: bloat,
            bloat_size_pretty: format_bytes(bloat),
            bloat_pct: est.bloat_pct,
        });
    }

    let databases = grouped
        .into_iter()
        .map(|(db, mut entries)| {
            entries.sort_by(|a, b| b.bloat_size_bytes.cmp(&a.bloat_size_bytes));
            let total: u64 = entries.iter().map(|e| e.bloat_size_bytes).sum();
            entries.truncate(limit);
            (
                db,
                BloatDatabase {
                    bloated_objects: entries,
                    total_bloat_size_bytes: total,
                    total_bloat_size_pretty: format_bytes(total),
                },
            )
        })
        .collect();
    BloatData { databases }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::GeneratorConfig;
    use crate::sink::NoSink;
    use crate::testutil::{FakeMetricSource, sample};

    fn table(db: &str, name: &str, v: f64) -> MetricSample {
        sample(&[("datname", db), ("schemaname", "public"), ("tblname", name)], v)
    }

    #[tokio::test]
    async fn f004_joins_estimates_and_sorts() {
        let source = FakeMetricSource::new()
            .with_instant(
                metrics::TABLE_BLOAT_REAL_SIZE,
                vec![table("app", "a", 10_240.0), table("app", "b", 4096.0), table("app", "c", 1.0)],
            )
            .with_instant(
                metrics::TABLE_BLOAT_SIZE,
                vec![table("app", "a", 1024.0), table("app", "b", 2048.0), table("app", "c", 0.0)],
            )
            .with_instant(
                metrics::TABLE_BLOAT_PCT,
                vec![table("app", "a", 10.0), table("app", "b", 50.0)],
            );
        let config = GeneratorConfig::default();
        let ctx = CheckContext::new(&source, &NoSink, &config, "main", "n", 1_700_000_000);
        let CheckData::Bloat(data) = build_f004(&ctx).await else {
            panic!("unexpected payload");
        };
        let app = &data.databases["app"];
        let names: Vec<&str> = app.bloated_objects.iter().map(|e| e.table_name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(app.total_bloat_size_bytes, 3072);
        assert_eq!(app.bloated_objects[0].bloat_pct, 50.0);
        assert!(app.bloated_objects[0].index_name.is_none());
    }

    #[test]
    fn totals_cover_objects_beyond_limit() {
        let mut estimates = BTreeMap::new();
        for (i, size) in [100.0, 300.0, 200.0].into_iter().enumerate() {
            estimates.insert(
                ObjectKey {
                    datname: "db".to_string(),
                    schema: "s".to_string(),
                    table: format!("t{i}"),
                    index: Some(format!("i{i}")),
                },
                Estimate {
                    real_size: 1000.0,
                    bloat_size: size,
                    bloat_pct: 1.0,
                },
            );
        }
        let data = assemble(estimates, 1);
        let db = &data.databases["db"];
        assert_eq!(db.bloated_objects.len(), 1);
        assert_eq!(db.bloated_objects[0].index_name.as_deref(), Some("i1"));
        assert_eq!(db.total_bloat_size_bytes, 600);
    }
}
