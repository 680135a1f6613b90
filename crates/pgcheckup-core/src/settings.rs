//! PostgreSQL settings (GUC) parsing, pretty printing and memory estimates.
//!
//! Settings arrive as `pgwatch_settings_configured` samples whose labels carry
//! the `pg_settings` columns. Values stay raw strings in [`SettingEntry`];
//! conversion to bytes happens only where a number is needed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fmt::{format_bytes_i64, format_kib_exact, format_ms_exact};
use crate::prom::MetricSample;

const KIB: f64 = 1024.0;

/// Size of a PostgreSQL block, the unit behind `8kB` settings.
pub const BLOCK_SIZE: i64 = 8192;

/// Settings whose values are counted in 8 kB pages when no unit is given.
const PAGE_UNIT_SETTINGS: &[&str] = &[
    "shared_buffers",
    "effective_cache_size",
    "wal_buffers",
    "temp_buffers",
];

// ============================================================
// Types
// ============================================================

/// One `pg_settings` row as reported.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SettingEntry {
    /// Raw value as PostgreSQL reports it (in `unit`).
    pub setting: String,
    pub unit: String,
    pub category: String,
    pub context: String,
    pub vartype: String,
    pub pretty_value: String,
}

impl SettingEntry {
    pub fn new(name: &str, setting: &str, unit: &str) -> Self {
        Self {
            setting: setting.to_string(),
            unit: unit.to_string(),
            pretty_value: format_setting_value(name, setting, unit),
            ..Default::default()
        }
    }
}

/// `setting_name -> entry`, ordered by name.
pub type SettingsMap = BTreeMap<String, SettingEntry>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryParseError {
    #[error("invalid memory value {raw:?}: numeric part {numeric:?} is not a number")]
    Format { raw: String, numeric: String },
}

/// Estimated memory footprint derived from settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub shared_buffers_bytes: u64,
    pub work_mem_per_connection_bytes: u64,
    pub max_work_mem_usage_bytes: u64,
    pub maintenance_work_mem_bytes: u64,
    pub effective_cache_size_bytes: u64,
    pub wal_buffers_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryAnalysis {
    pub estimated_total_memory_usage: MemoryUsage,
}

// ============================================================
// Parsing
// ============================================================

/// Parses a memory value into bytes.
///
/// - empty / whitespace-only -> `0`
/// - `"-1"` (unlimited) -> `0`
/// - bare number -> kilobytes (GUC convention), e.g. `"128"` -> `131072`
/// - `B`, `KB`, `MB`, `GB`, `TB` suffixes (case-insensitive, powers of 1024),
///   decimals allowed: `"1.5MB"` -> `1572864`
/// - suffix present but numeric part invalid (`"abc123MB"`) -> error
/// - no suffix and not a number (`"invalid"`) -> `0`
pub fn parse_memory_value(raw: &str) -> Result<i64, MemoryParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-1" {
        return Ok(0);
    }

    let upper = trimmed.to_ascii_uppercase();
    let suffixes: [(&str, f64); 5] = [
        ("TB", KIB * KIB * KIB * KIB),
        ("GB", KIB * KIB * KIB),
        ("MB", KIB * KIB),
        ("KB", KIB),
        ("B", 1.0),
    ];
    for (suffix, multiplier) in suffixes {
        if let Some(numeric) = upper.strip_suffix(suffix) {
            let numeric = numeric.trim();
            return numeric
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(|v| (v * multiplier).round() as i64)
                .ok_or_else(|| MemoryParseError::Format {
                    raw: raw.to_string(),
                    numeric: numeric.to_string(),
                });
        }
    }

    Ok(trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| (v * KIB).round() as i64)
        .unwrap_or(0))
}

/// Converts a setting's raw value and `pg_settings` unit into bytes.
///
/// `-1` and unparsable values yield `0`.
pub fn setting_to_bytes(setting: &str, unit: &str) -> i64 {
    let setting = setting.trim();
    if setting == "-1" {
        return 0;
    }
    match unit {
        "8kB" => setting
            .parse::<i64>()
            .map(|pages| pages.saturating_mul(BLOCK_SIZE))
            .unwrap_or(0),
        "" => parse_memory_value(setting).unwrap_or(0),
        _ => parse_memory_value(&format!("{setting}{unit}")).unwrap_or(0),
    }
}

// ============================================================
// Pretty printing
// ============================================================

fn looks_like_memory(name: &str) -> bool {
    PAGE_UNIT_SETTINGS.contains(&name) || name.ends_with("_mem") || name.contains("_mem_")
}

fn looks_like_timeout(name: &str) -> bool {
    name.contains("timeout") || name.ends_with("_delay") || name.ends_with("_duration")
}

/// Unit-aware rendering of a setting value.
///
/// - `8kB`: pages * 8 KiB, shown in MiB when evenly divisible
///   (`shared_buffers = 128` -> `"1 MiB"`)
/// - `kB`/`MB`: shown the same way from KiB
/// - `B`: IEC bytes
/// - `ms`: `"2 s"` for whole seconds, else `"1500 ms"`
/// - `s`, `min`, `connections`, `workers` and unknown units: unit appended
/// - no unit: guessed from the name (memory-like or timeout-like), else raw
///
/// Negative or non-integer values are returned with the unit appended, as is.
pub fn format_setting_value(name: &str, raw: &str, unit: &str) -> String {
    let raw = raw.trim();
    let number = raw.parse::<i64>().ok().filter(|v| *v >= 0);

    match (unit, number) {
        ("8kB", Some(pages)) => format_kib_exact(pages.saturating_mul(8)),
        ("kB", Some(kib)) => format_kib_exact(kib),
        ("MB", Some(mib)) => format_kib_exact(mib.saturating_mul(1024)),
        ("B", Some(bytes)) => format_bytes_i64(bytes),
        ("ms", Some(ms)) => format_ms_exact(ms),
        ("", Some(_)) if looks_like_memory(name) => {
            let unit = if PAGE_UNIT_SETTINGS.contains(&name) {
                "8kB"
            } else {
                "kB"
            };
            format_setting_value(name, raw, unit)
        }
        ("", Some(_)) if looks_like_timeout(name) => format_setting_value(name, raw, "ms"),
        ("", _) => raw.to_string(),
        (unit, _) => format!("{raw} {unit}"),
    }
}

// ============================================================
// Collection
// ============================================================

/// Builds a settings map from `pgwatch_settings_configured` samples.
///
/// Samples without a `setting_name` label are skipped. When a name repeats,
/// the sample with the latest timestamp wins. `last_over_time` stamps every
/// series with the evaluation time, so a setting changed within the lookback
/// ties; the tie goes to the lexicographically greater label set, so the
/// result does not depend on series order.
pub fn settings_from_samples(samples: &[MetricSample]) -> SettingsMap {
    let mut latest: BTreeMap<&str, &MetricSample> = BTreeMap::new();
    for sample in samples {
        let Some(name) = sample.label("setting_name") else {
            continue;
        };
        let newer = latest.get(name).is_none_or(|prev| {
            sample
                .timestamp
                .total_cmp(&prev.timestamp)
                .then_with(|| sample.labels.cmp(&prev.labels))
                .is_gt()
        });
        if newer {
            latest.insert(name, sample);
        }
    }

    latest
        .into_iter()
        .map(|(name, sample)| {
            let setting = sample.label_or_empty("setting_value");
            let unit = sample.label_or_empty("unit");
            let entry = SettingEntry {
                setting: setting.to_string(),
                unit: unit.to_string(),
                category: sample.label_or_empty("category").to_string(),
                context: sample.label_or_empty("context").to_string(),
                vartype: sample.label_or_empty("vartype").to_string(),
                pretty_value: format_setting_value(name, setting, unit),
            };
            (name.to_string(), entry)
        })
        .collect()
}

// ============================================================
// Memory analysis
// ============================================================

const DEFAULT_SHARED_BUFFERS: i64 = 128 * 1024 * 1024;
const DEFAULT_WORK_MEM: i64 = 4 * 1024 * 1024;
const DEFAULT_MAINTENANCE_WORK_MEM: i64 = 64 * 1024 * 1024;
const DEFAULT_EFFECTIVE_CACHE_SIZE: i64 = 4 * 1024 * 1024 * 1024;
const DEFAULT_MAX_CONNECTIONS: i64 = 100;
const WAL_BUFFERS_MIN: i64 = 64 * 1024;
const WAL_BUFFERS_MAX: i64 = 16 * 1024 * 1024;

fn bytes_or_default(settings: &SettingsMap, name: &str, default: i64) -> i64 {
    settings
        .get(name)
        .map(|e| setting_to_bytes(&e.setting, &e.unit))
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

/// Derives memory estimates; missing settings fall back to PostgreSQL defaults.
///
/// `wal_buffers = -1` (auto) resolves to `shared_buffers / 32` clamped to
/// `[64 KiB, 16 MiB]`.
pub fn analyze_memory_settings(settings: &SettingsMap) -> MemoryAnalysis {
    let shared_buffers = bytes_or_default(settings, "shared_buffers", DEFAULT_SHARED_BUFFERS);
    let work_mem = bytes_or_default(settings, "work_mem", DEFAULT_WORK_MEM);
    let maintenance_work_mem = bytes_or_default(
        settings,
        "maintenance_work_mem",
        DEFAULT_MAINTENANCE_WORK_MEM,
    );
    let effective_cache_size = bytes_or_default(
        settings,
        "effective_cache_size",
        DEFAULT_EFFECTIVE_CACHE_SIZE,
    );
    let max_connections = settings
        .get("max_connections")
        .and_then(|e| e.setting.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_CONNECTIONS);
    let wal_buffers_auto = (shared_buffers / 32).clamp(WAL_BUFFERS_MIN, WAL_BUFFERS_MAX);
    let wal_buffers = bytes_or_default(settings, "wal_buffers", wal_buffers_auto);

    MemoryAnalysis {
        estimated_total_memory_usage: MemoryUsage {
            shared_buffers_bytes: to_u64(shared_buffers),
            work_mem_per_connection_bytes: to_u64(work_mem),
            max_work_mem_usage_bytes: to_u64(work_mem.saturating_mul(max_connections)),
            maintenance_work_mem_bytes: to_u64(maintenance_work_mem),
            effective_cache_size_bytes: to_u64(effective_cache_size),
            wal_buffers_bytes: to_u64(wal_buffers),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, setting: &str, unit: &str) -> (String, SettingEntry) {
        (name.to_string(), SettingEntry::new(name, setting, unit))
    }

    #[test]
    fn parse_memory_value_units_are_case_insensitive() {
        assert_eq!(parse_memory_value("128mb").unwrap(), 134_217_728);
        assert_eq!(parse_memory_value("128MB").unwrap(), 134_217_728);
        assert_eq!(parse_memory_value("128Mb").unwrap(), 134_217_728);
        assert_eq!(parse_memory_value("8kB").unwrap(), 8192);
    }

    #[test]
    fn parse_memory_value_units_are_powers_of_1024() {
        let b = parse_memory_value("1B").unwrap();
        let kb = parse_memory_value("1KB").unwrap();
        let mb = parse_memory_value("1MB").unwrap();
        let gb = parse_memory_value("1GB").unwrap();
        let tb = parse_memory_value("1TB").unwrap();
        assert_eq!(b, 1);
        assert_eq!(kb, 1024 * b);
        assert_eq!(mb, 1024 * kb);
        assert_eq!(gb, 1024 * mb);
        assert_eq!(tb, 1024 * gb);
    }

    #[test]
    fn parse_memory_value_bare_number_is_kilobytes() {
        assert_eq!(parse_memory_value("128").unwrap(), 131_072);
        assert_eq!(parse_memory_value(" 4096 ").unwrap(), 4 * 1024 * 1024);
    }

    #[test]
    fn parse_memory_value_decimals_and_spacing() {
        assert_eq!(parse_memory_value("1.5MB").unwrap(), 1_572_864);
        assert_eq!(parse_memory_value("2 GB").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn parse_memory_value_special_inputs() {
        assert_eq!(parse_memory_value("").unwrap(), 0);
        assert_eq!(parse_memory_value("   ").unwrap(), 0);
        assert_eq!(parse_memory_value("-1").unwrap(), 0);
        assert_eq!(parse_memory_value("invalid").unwrap(), 0);
    }

    #[test]
    fn parse_memory_value_rejects_bad_numeric_with_unit() {
        let err = parse_memory_value("abc123MB").unwrap_err();
        assert_eq!(
            err,
            MemoryParseError::Format {
                raw: "abc123MB".to_string(),
                numeric: "ABC123".to_string(),
            }
        );
        assert!(parse_memory_value("MB").is_err());
    }

    #[test]
    fn setting_to_bytes_uses_pg_units() {
        assert_eq!(setting_to_bytes("16384", "8kB"), 128 * 1024 * 1024);
        assert_eq!(setting_to_bytes("4096", "kB"), 4 * 1024 * 1024);
        assert_eq!(setting_to_bytes("1024", "MB"), 1024 * 1024 * 1024);
        assert_eq!(setting_to_bytes("512", "B"), 512);
        assert_eq!(setting_to_bytes("-1", "8kB"), 0);
        assert_eq!(setting_to_bytes("64", ""), 65536);
        assert_eq!(setting_to_bytes("x", "8kB"), 0);
    }

    #[test]
    fn format_setting_value_page_unit() {
        assert_eq!(format_setting_value("shared_buffers", "128", "8kB"), "1 MiB");
        assert_eq!(format_setting_value("shared_buffers", "16384", "8kB"), "128 MiB");
        assert_eq!(format_setting_value("wal_buffers", "100", "8kB"), "800 KiB");
        assert_eq!(format_setting_value("wal_buffers", "-1", "8kB"), "-1 8kB");
    }

    #[test]
    fn format_setting_value_ms_unit() {
        assert_eq!(format_setting_value("x", "1500", "ms"), "1500 ms");
        assert_eq!(format_setting_value("x", "2000", "ms"), "2 s");
        assert_eq!(format_setting_value("x", "0", "ms"), "0 ms");
    }

    #[test]
    fn format_setting_value_literal_units() {
        assert_eq!(format_setting_value("autovacuum_naptime", "60", "s"), "60 s");
        assert_eq!(format_setting_value("x", "5", "min"), "5 min");
        assert_eq!(format_setting_value("x", "3", "workers"), "3 workers");
        assert_eq!(format_setting_value("x", "7", "furlongs"), "7 furlongs");
        assert_eq!(format_setting_value("work_mem", "4096", "kB"), "4 MiB");
        assert_eq!(format_setting_value("x", "2048", "B"), "2.00 KiB");
    }

    #[test]
    fn format_setting_value_without_unit_uses_name_heuristic() {
        assert_eq!(format_setting_value("shared_buffers", "128", ""), "1 MiB");
        assert_eq!(format_setting_value("work_mem", "65536", ""), "64 MiB");
        assert_eq!(
            format_setting_value("statement_timeout", "30000", ""),
            "30 s"
        );
        assert_eq!(format_setting_value("max_connections", "100", ""), "100");
        assert_eq!(format_setting_value("search_path", "public", ""), "public");
    }

    #[test]
    fn settings_tie_on_timestamp_is_order_independent() {
        let variant = |value: &str| MetricSample {
            timestamp: 10.0,
            labels: [
                ("setting_name", "work_mem"),
                ("setting_value", value),
                ("unit", "kB"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            value: 1.0,
        };
        let forward = settings_from_samples(&[variant("4096"), variant("8192")]);
        let backward = settings_from_samples(&[variant("8192"), variant("4096")]);
        assert_eq!(forward, backward);
        assert_eq!(forward["work_mem"].setting, "8192");

        // A later timestamp still beats a greater label set.
        let mut older = variant("9999");
        older.timestamp = 5.0;
        let settings = settings_from_samples(&[variant("4096"), older]);
        assert_eq!(settings["work_mem"].setting, "4096");
    }

    #[test]
    fn settings_from_samples_reads_labels() {
        let sample = MetricSample {
            timestamp: 10.0,
            labels: [
                ("setting_name", "shared_buffers"),
                ("setting_value", "16384"),
                ("unit", "8kB"),
                ("category", "Resource Usage / Memory"),
                ("context", "postmaster"),
                ("vartype", "integer"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            value: 1.0,
        };
        let stale = MetricSample {
            timestamp: 5.0,
            labels: [("setting_name", "shared_buffers"), ("setting_value", "1")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            value: 1.0,
        };
        let settings = settings_from_samples(&[sample, stale, MetricSample::default()]);
        assert_eq!(settings.len(), 1);
        let sb = &settings["shared_buffers"];
        assert_eq!(sb.setting, "16384");
        assert_eq!(sb.context, "postmaster");
        assert_eq!(sb.pretty_value, "128 MiB");
    }

    #[test]
    fn analyze_memory_settings_derives_max_work_mem() {
        let settings: SettingsMap = [
            entry("shared_buffers", "16384", "8kB"),
            entry("work_mem", "4096", "kB"),
            entry("max_connections", "200", ""),
            entry("maintenance_work_mem", "65536", "kB"),
            entry("effective_cache_size", "524288", "8kB"),
            entry("wal_buffers", "-1", "8kB"),
        ]
        .into_iter()
        .collect();
        let usage = analyze_memory_settings(&settings).estimated_total_memory_usage;
        assert_eq!(usage.shared_buffers_bytes, 128 * 1024 * 1024);
        assert_eq!(usage.work_mem_per_connection_bytes, 4 * 1024 * 1024);
        assert_eq!(usage.max_work_mem_usage_bytes, 200 * 4 * 1024 * 1024);
        assert_eq!(usage.maintenance_work_mem_bytes, 64 * 1024 * 1024);
        assert_eq!(usage.effective_cache_size_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(usage.wal_buffers_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn analyze_memory_settings_uses_defaults_when_missing() {
        let usage = analyze_memory_settings(&SettingsMap::new()).estimated_total_memory_usage;
        assert_eq!(usage.shared_buffers_bytes, 128 * 1024 * 1024);
        assert_eq!(usage.max_work_mem_usage_bytes, 100 * 4 * 1024 * 1024);
        assert_eq!(usage.wal_buffers_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn wal_buffers_auto_is_clamped() {
        let small: SettingsMap = [entry("shared_buffers", "16", "8kB")].into_iter().collect();
        assert_eq!(
            analyze_memory_settings(&small)
                .estimated_total_memory_usage
                .wal_buffers_bytes,
            64 * 1024
        );
        let big: SettingsMap = [entry("shared_buffers", "4194304", "8kB")]
            .into_iter()
            .collect();
        assert_eq!(
            analyze_memory_settings(&big)
                .estimated_total_memory_usage
                .wal_buffers_bytes,
            16 * 1024 * 1024
        );
    }
}
