//! H001/H002/H004: invalid, unused and redundant indexes.
//!
//! Sizes come from the metrics backend; `CREATE INDEX` statements are looked
//! up in the sink and are `null` when the sink does not know them.

use std::collections::BTreeMap;

use super::data::{CheckData, IndexEntry, IndexesData, IndexesDatabase};
use super::generator::CheckContext;
use super::metrics;
use crate::fmt::format_bytes;
use crate::prom::MetricSample;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey {
    datname: String,
    schema: String,
    table: String,
    index: String,
}

impl IndexKey {
    fn from_sample(sample: &MetricSample) -> Option<Self> {
        let datname = sample.label("datname").filter(|d| !d.is_empty())?;
        let index = sample.label("index_name").filter(|i| !i.is_empty())?;
        Some(Self {
            datname: datname.to_string(),
            schema: sample.label_or_empty("schema_name").to_string(),
            table: sample.label_or_empty("table_name").to_string(),
            index: index.to_string(),
        })
    }
}

fn entry_for(key: &IndexKey, size: f64) -> IndexEntry {
    let size = size.max(0.0) as u64;
    IndexEntry {
        schema_name: key.schema.clone(),
        table_name: key.table.clone(),
        index_name: key.index.clone(),
        index_size_bytes: size,
        index_size_pretty: format_bytes(size),
        ..Default::default()
    }
}

async fn sizes(ctx: &CheckContext<'_>, metric: &str) -> BTreeMap<IndexKey, (IndexEntry, MetricSample)> {
    let mut out = BTreeMap::new();
    for sample in ctx.gauge(&ctx.db_selector(metric)).await.unwrap_or_default() {
        if let Some(key) = IndexKey::from_sample(&sample) {
            let entry = entry_for(&key, sample.value);
            out.insert(key, (entry, sample));
        }
    }
    out
}

pub(crate) async fn build_h001(ctx: &CheckContext<'_>) -> CheckData {
    let entries = sizes(ctx, metrics::INVALID_INDEX_SIZE)
        .await
        .into_iter()
        .map(|(k, (e, _))| (k, e))
        .collect();
    CheckData::Indexes(finish(ctx, entries).await)
}

pub(crate) async fn build_h002(ctx: &CheckContext<'_>) -> CheckData {
    let mut scans: BTreeMap<IndexKey, f64> = BTreeMap::new();
    for sample in ctx
        .gauge(&ctx.db_selector(metrics::UNUSED_INDEX_SCANS))
        .await
        .unwrap_or_default()
    {
        if let Some(key) = IndexKey::from_sample(&sample) {
            scans.insert(key, sample.value);
        }
    }
    let entries = sizes(ctx, metrics::UNUSED_INDEX_SIZE)
        .await
        .into_iter()
        .map(|(k, (mut e, _))| {
            e.idx_scan = Some(scans.get(&k).copied().unwrap_or(0.0).max(0.0));
            (k, e)
        })
        .collect();
    CheckData::Indexes(finish(ctx, entries).await)
}

pub(crate) async fn build_h004(ctx: &CheckContext<'_>) -> CheckData {
    let entries = sizes(ctx, metrics::REDUNDANT_INDEX_SIZE)
        .await
        .into_iter()
        .map(|(k, (mut e, sample))| {
            e.redundant_to = Some(sample.label_or_empty("redundant_to").to_string());
            (k, e)
        })
        .collect();
    CheckData::Indexes(finish(ctx, entries).await)
}

/// Groups by database, largest first, resolves definitions for the listed
/// indexes. Totals cover every index, not just the listed ones.
async fn finish(ctx: &CheckContext<'_>, entries: BTreeMap<IndexKey, IndexEntry>) -> IndexesData {
    let mut grouped: BTreeMap<String, Vec<IndexEntry>> = BTreeMap::new();
    for (key, entry) in entries {
        grouped.entry(key.datname).or_default().push(entry);
    }

    let mut databases = BTreeMap::new();
    for (db, mut indexes) in grouped {
        indexes.sort_by(|a, b| {
            b.index_size_bytes
                .cmp(&a.index_size_bytes)
                .then_with(|| a.index_name.cmp(&b.index_name))
        });
        let total_count = indexes.len();
        let total_size_bytes: u64 = indexes.iter().map(|e| e.index_size_bytes).sum();
        indexes.truncate(ctx.config.list_limit);
        for entry in &mut indexes {
            entry.index_definition = ctx.sink.index_definition(&db, &entry.index_name).await;
        }
        databases.insert(
            db,
            IndexesDatabase {
                indexes,
                total_count,
                total_size_bytes,
                total_size_pretty: format_bytes(total_size_bytes),
            },
        );
    }
    IndexesData { databases }
}
