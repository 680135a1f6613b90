//! Settings-based checks: A003 and A007 query the backend; D004, F001 and
//! G001 are cut out of an A003 result.

use std::collections::BTreeMap;

use super::data::{
    AlteredSetting, AlteredSettingsData, CheckData, MemoryData, SampleQuery, SettingsData,
    StatementsSettingsData, TopQueriesData,
};
use super::generator::CheckContext;
use super::metrics;
use crate::prom::MetricSample;
use crate::settings::{SettingsMap, analyze_memory_settings, format_setting_value, settings_from_samples};

/// Setting sources that mean "not changed by anyone".
const UNALTERED_SOURCES: &[&str] = &["default", "override"];

/// Sample queries shown in D004.
const SAMPLE_QUERIES: usize = 5;

pub(crate) const STATEMENTS_SETTINGS: &[&str] = &[
    "compute_query_id",
    "pg_stat_kcache.linux_hz",
    "pg_stat_kcache.track",
    "pg_stat_kcache.track_planning",
    "pg_stat_statements.max",
    "pg_stat_statements.save",
    "pg_stat_statements.track",
    "pg_stat_statements.track_planning",
    "pg_stat_statements.track_utility",
    "shared_preload_libraries",
    "track_activity_query_size",
    "track_io_timing",
];

pub(crate) const AUTOVACUUM_SETTINGS: &[&str] = &[
    "autovacuum",
    "autovacuum_analyze_scale_factor",
    "autovacuum_analyze_threshold",
    "autovacuum_freeze_max_age",
    "autovacuum_max_workers",
    "autovacuum_multixact_freeze_max_age",
    "autovacuum_naptime",
    "autovacuum_vacuum_cost_delay",
    "autovacuum_vacuum_cost_limit",
    "autovacuum_vacuum_insert_scale_factor",
    "autovacuum_vacuum_insert_threshold",
    "autovacuum_vacuum_scale_factor",
    "autovacuum_vacuum_threshold",
    "autovacuum_work_mem",
    "log_autovacuum_min_duration",
    "vacuum_cost_delay",
    "vacuum_cost_limit",
    "vacuum_cost_page_dirty",
    "vacuum_cost_page_hit",
    "vacuum_cost_page_miss",
    "vacuum_freeze_min_age",
    "vacuum_freeze_table_age",
    "vacuum_multixact_freeze_min_age",
    "vacuum_multixact_freeze_table_age",
];

pub(crate) const MEMORY_SETTINGS: &[&str] = &[
    "autovacuum_work_mem",
    "effective_cache_size",
    "hash_mem_multiplier",
    "huge_pages",
    "logical_decoding_work_mem",
    "maintenance_work_mem",
    "max_connections",
    "shared_buffers",
    "temp_buffers",
    "wal_buffers",
    "work_mem",
];

pub(crate) async fn fetch_settings_samples(ctx: &CheckContext<'_>) -> Vec<MetricSample> {
    ctx.gauge(&ctx.selector(metrics::SETTINGS))
        .await
        .unwrap_or_default()
}

pub(crate) async fn build_a003(ctx: &CheckContext<'_>) -> CheckData {
    let samples = fetch_settings_samples(ctx).await;
    CheckData::Settings(SettingsData {
        settings: settings_from_samples(&samples),
    })
}

pub(crate) async fn build_a007(ctx: &CheckContext<'_>) -> CheckData {
    let samples = fetch_settings_samples(ctx).await;
    CheckData::Altered(altered_settings(&samples))
}

/// Settings whose `source` says someone changed them.
pub(crate) fn altered_settings(samples: &[MetricSample]) -> AlteredSettingsData {
    let mut altered = BTreeMap::new();
    for sample in samples {
        let (Some(name), Some(source)) = (sample.label("setting_name"), sample.label("source"))
        else {
            continue;
        };
        if source.is_empty() || UNALTERED_SOURCES.contains(&source) {
            continue;
        }
        let value = sample.label_or_empty("setting_value");
        let unit = sample.label_or_empty("unit");
        altered.insert(
            name.to_string(),
            AlteredSetting {
                value: value.to_string(),
                unit: unit.to_string(),
                pretty_value: format_setting_value(name, value, unit),
                source: source.to_string(),
            },
        );
    }
    AlteredSettingsData {
        altered_settings: altered,
    }
}

/// D004 payload: statements settings plus the most called queries of K003.
pub(crate) fn derive_d004(settings: SettingsMap, top: Option<&TopQueriesData>) -> CheckData {
    let mut sample_queries: Vec<SampleQuery> = top
        .map(|t| {
            t.top_queries
                .iter()
                .map(|q| SampleQuery {
                    queryid: q.queryid.clone(),
                    datname: q.datname.clone(),
                    calls: q.metrics.get("calls").map(|d| d.diff).unwrap_or(0.0),
                })
                .collect()
        })
        .unwrap_or_default();
    sample_queries.sort_by(|a, b| {
        b.calls
            .total_cmp(&a.calls)
            .then_with(|| a.queryid.cmp(&b.queryid))
    });
    sample_queries.truncate(SAMPLE_QUERIES);
    CheckData::StatementsSettings(StatementsSettingsData {
        settings,
        sample_queries,
    })
}

pub(crate) fn derive_f001(settings: SettingsMap) -> CheckData {
    CheckData::Settings(SettingsData { settings })
}

pub(crate) fn derive_g001(settings: SettingsMap) -> CheckData {
    let analysis = analyze_memory_settings(&settings);
    CheckData::Memory(MemoryData { settings, analysis })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::data::TopQuery;
    use crate::settings::SettingEntry;
    use crate::testutil::sample;
    use crate::window::counter_delta;

    #[test]
    fn altered_settings_skip_defaults() {
        let samples = [
            sample(
                &[
                    ("setting_name", "work_mem"),
                    ("setting_value", "65536"),
                    ("unit", "kB"),
                    ("source", "configuration file"),
                ],
                1.0,
            ),
            sample(
                &[("setting_name", "port"), ("setting_value", "5432"), ("source", "default")],
                1.0,
            ),
            sample(&[("setting_name", "nosource"), ("setting_value", "1")], 1.0),
        ];
        let data = altered_settings(&samples);
        assert_eq!(data.altered_settings.len(), 1);
        let wm = &data.altered_settings["work_mem"];
        assert_eq!(wm.pretty_value, "64 MiB");
        assert_eq!(wm.source, "configuration file");
    }

    #[test]
    fn d004_keeps_most_called_queries() {
        let top = TopQueriesData {
            top_queries: (1..=7)
                .map(|i| TopQuery {
                    queryid: i.to_string(),
                    datname: "db".to_string(),
                    metrics: [("calls".to_string(), counter_delta(0.0, f64::from(i), 60.0, 0.0))]
                        .into_iter()
                        .collect(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let CheckData::StatementsSettings(d) = derive_d004(SettingsMap::new(), Some(&top)) else {
            panic!("unexpected payload");
        };
        let ids: Vec<&str> = d.sample_queries.iter().map(|q| q.queryid.as_str()).collect();
        assert_eq!(ids, vec!["7", "6", "5", "4", "3"]);
    }

    #[test]
    fn g001_includes_memory_analysis() {
        let settings: SettingsMap = [(
            "shared_buffers".to_string(),
            SettingEntry::new("shared_buffers", "32768", "8kB"),
        )]
        .into_iter()
        .collect();
        let CheckData::Memory(d) = derive_g001(settings) else {
            panic!("unexpected payload");
        };
        assert_eq!(
            d.analysis.estimated_total_memory_usage.shared_buffers_bytes,
            256 * 1024 * 1024
        );
    }
}
