//! Typed payloads stored under `results.<node>.data`.
//!
//! Each check has one payload shape; [`CheckData::empty`] gives the shape a
//! check reports when nothing could be collected, which still validates
//! against the check's schema.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{CheckId, PostgresVersion};
use crate::settings::{MemoryAnalysis, SettingsMap};
use crate::window::CounterDelta;

/// Payload of one node's result, serialized without a tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CheckData {
    Version(VersionData),
    Settings(SettingsData),
    Altered(AlteredSettingsData),
    StatementsSettings(StatementsSettingsData),
    Memory(MemoryData),
    Cluster(ClusterInfoData),
    Bloat(BloatData),
    Indexes(IndexesData),
    Aggregated(AggregatedData),
    TopQueries(TopQueriesData),
    Hourly(HourlyData),
    WaitEvents(WaitEventsData),
}

impl CheckData {
    pub fn empty(check: CheckId) -> Self {
        match check {
            CheckId::A002 => CheckData::Version(VersionData::default()),
            CheckId::A003 | CheckId::F001 => CheckData::Settings(SettingsData::default()),
            CheckId::A007 => CheckData::Altered(AlteredSettingsData::default()),
            CheckId::D004 => CheckData::StatementsSettings(StatementsSettingsData::default()),
            CheckId::G001 => CheckData::Memory(MemoryData::default()),
            CheckId::A004 => CheckData::Cluster(ClusterInfoData::default()),
            CheckId::F004 | CheckId::F005 => CheckData::Bloat(BloatData::default()),
            CheckId::H001 | CheckId::H002 | CheckId::H004 => {
                CheckData::Indexes(IndexesData::default())
            }
            CheckId::K001 => CheckData::Aggregated(AggregatedData::default()),
            CheckId::K003 => CheckData::TopQueries(TopQueriesData::default()),
            CheckId::M001 | CheckId::M002 | CheckId::M003 | CheckId::M004 => {
                CheckData::Hourly(HourlyData::default())
            }
            CheckId::N001 => CheckData::WaitEvents(WaitEventsData::default()),
        }
    }

    /// The settings map of settings-shaped payloads.
    pub fn settings(&self) -> Option<&SettingsMap> {
        match self {
            CheckData::Settings(d) => Some(&d.settings),
            CheckData::StatementsSettings(d) => Some(&d.settings),
            CheckData::Memory(d) => Some(&d.settings),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Settings family (A002, A003, A007, D004, F001, G001)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct VersionData {
    pub version: PostgresVersion,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SettingsData {
    pub settings: SettingsMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AlteredSetting {
    pub value: String,
    pub unit: String,
    pub pretty_value: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AlteredSettingsData {
    pub altered_settings: BTreeMap<String, AlteredSetting>,
}

/// A frequently called statement shown next to the pg_stat_statements settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SampleQuery {
    pub queryid: String,
    pub datname: String,
    pub calls: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StatementsSettingsData {
    pub settings: SettingsMap,
    pub sample_queries: Vec<SampleQuery>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MemoryData {
    pub settings: SettingsMap,
    pub analysis: MemoryAnalysis,
}

// ---------------------------------------------------------------------------
// Cluster information (A004)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DatabaseInfo {
    pub size_bytes: u64,
    pub size_pretty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backends: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ClusterInfoData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_recovery: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_pretty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_backends: Option<i64>,
    /// Buffer cache hit ratio in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit_ratio: Option<f64>,
    pub total_size_bytes: u64,
    pub total_size_pretty: String,
    pub databases: BTreeMap<String, DatabaseInfo>,
}

// ---------------------------------------------------------------------------
// Bloat (F004, F005)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BloatEntry {
    pub schema_name: String,
    pub table_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    pub real_size_bytes: u64,
    pub real_size_pretty: String,
    pub bloat_size_bytes: u64,
    pub bloat_size_pretty: String,
    pub bloat_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BloatDatabase {
    pub bloated_objects: Vec<BloatEntry>,
    pub total_bloat_size_bytes: u64,
    pub total_bloat_size_pretty: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BloatData {
    pub databases: BTreeMap<String, BloatDatabase>,
}

// ---------------------------------------------------------------------------
// Indexes (H001, H002, H004)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct IndexEntry {
    pub schema_name: String,
    pub table_name: String,
    pub index_name: String,
    pub index_size_bytes: u64,
    pub index_size_pretty: String,
    /// `CREATE INDEX` statement from the sink, `null` when unknown.
    pub index_definition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idx_scan: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redundant_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct IndexesDatabase {
    pub indexes: Vec<IndexEntry>,
    pub total_count: usize,
    pub total_size_bytes: u64,
    pub total_size_pretty: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct IndexesData {
    pub databases: BTreeMap<String, IndexesDatabase>,
}

// ---------------------------------------------------------------------------
// Counter window (K001, K003)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
    pub duration_s: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start: crate::fmt::format_epoch_rfc3339(start),
            end: crate::fmt::format_epoch_rfc3339(end),
            duration_s: end - start,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AggregatedData {
    pub time_range: TimeRange,
    pub totals: BTreeMap<String, CounterDelta>,
    pub databases: BTreeMap<String, BTreeMap<String, CounterDelta>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TopQuery {
    pub queryid: String,
    pub datname: String,
    pub user: String,
    pub instance: String,
    pub metrics: BTreeMap<String, CounterDelta>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TopQueriesData {
    pub time_range: TimeRange,
    pub order_by: String,
    pub limit: usize,
    pub top_queries: Vec<TopQuery>,
}

// ---------------------------------------------------------------------------
// Hourly top-K (M001..M004)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct HourlySummary {
    pub total_tracked_queries: f64,
    pub total_other: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct HourlyData {
    pub metric: String,
    pub hours: u32,
    pub step_s: i64,
    pub timeline: Vec<i64>,
    pub queries: BTreeMap<String, Vec<f64>>,
    pub other: Vec<f64>,
    pub summary: HourlySummary,
}

// ---------------------------------------------------------------------------
// Wait events (N001)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct WaitQuery {
    pub query_id: String,
    pub total: f64,
    pub wait_events: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct WaitEventType {
    pub total: f64,
    pub queries_list: Vec<WaitQuery>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct WaitEventsDatabase {
    pub wait_event_types: BTreeMap<String, WaitEventType>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct WaitEventsData {
    pub time_range: TimeRange,
    pub databases: BTreeMap<String, WaitEventsDatabase>,
}
