//! A004: cluster information.

use std::collections::BTreeMap;

use super::data::{CheckData, ClusterInfoData, DatabaseInfo};
use super::generator::CheckContext;
use super::metrics;
use crate::fmt::{format_bytes, format_uptime};
use crate::prom::MetricSample;

fn per_database(samples: &[MetricSample]) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for s in samples {
        if let Some(db) = s.label("datname").filter(|d| !d.is_empty()) {
            *out.entry(db.to_string()).or_insert(0.0) += s.value;
        }
    }
    out
}

fn max_value(samples: &[MetricSample]) -> Option<f64> {
    samples.iter().map(|s| s.value).reduce(f64::max)
}

fn sum_value(samples: &[MetricSample]) -> Option<f64> {
    (!samples.is_empty()).then(|| samples.iter().map(|s| s.value).sum())
}

/// Percentage of block requests served from shared buffers.
pub(crate) fn cache_hit_ratio(hit: f64, read: f64) -> Option<f64> {
    let total = hit + read;
    (total > 0.0 && hit >= 0.0 && read >= 0.0).then(|| hit / total * 100.0)
}

pub(crate) async fn build_a004(ctx: &CheckContext<'_>) -> CheckData {
    let sizes = ctx
        .gauge(&ctx.db_selector(metrics::DB_SIZE))
        .await
        .map(|s| per_database(&s))
        .unwrap_or_default();
    let backends = ctx
        .gauge(&ctx.db_selector(metrics::NUMBACKENDS))
        .await
        .map(|s| per_database(&s))
        .unwrap_or_default();
    let uptime = ctx
        .gauge(&ctx.selector(metrics::POSTMASTER_UPTIME))
        .await
        .and_then(|s| max_value(&s));
    let in_recovery = ctx
        .gauge(&ctx.selector(metrics::IN_RECOVERY))
        .await
        .and_then(|s| max_value(&s));
    let hit = ctx
        .gauge(&ctx.db_selector(metrics::BLKS_HIT))
        .await
        .and_then(|s| sum_value(&s));
    let read = ctx
        .gauge(&ctx.db_selector(metrics::BLKS_READ))
        .await
        .and_then(|s| sum_value(&s));

    let mut databases: BTreeMap<String, DatabaseInfo> = sizes
        .into_iter()
        .map(|(db, size)| {
            let size_bytes = size.max(0.0) as u64;
            (
                db,
                DatabaseInfo {
                    size_bytes,
                    size_pretty: format_bytes(size_bytes),
                    backends: None,
                },
            )
        })
        .collect();
    for (db, count) in &backends {
        databases
            .entry(db.clone())
            .or_insert_with(|| DatabaseInfo {
                size_bytes: 0,
                size_pretty: format_bytes(0),
                backends: None,
            })
            .backends = Some(*count as i64);
    }

    let total_size_bytes = databases.values().map(|d| d.size_bytes).sum();
    let uptime_seconds = uptime.map(|u| u.max(0.0) as i64);
    CheckData::Cluster(ClusterInfoData {
        in_recovery: in_recovery.map(|v| v > 0.0),
        uptime_seconds,
        uptime_pretty: uptime_seconds.map(format_uptime),
        total_backends: (!backends.is_empty()).then(|| backends.values().sum::<f64>() as i64),
        cache_hit_ratio: match (hit, read) {
            (Some(h), Some(r)) => cache_hit_ratio(h, r),
            _ => None,
        },
        total_size_bytes,
        total_size_pretty: format_bytes(total_size_bytes),
        databases,
    })
}
