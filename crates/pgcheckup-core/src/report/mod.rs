//! Report envelope, check catalogue and generators.
//!
//! Every check produces one [`Report`]:
//!
//! ```text
//! { checkId, checkTitle, timestamptz, version, build_ts, generation_mode,
//!   nodes: { primary, standbys: [] },
//!   results: { <node>: { data, postgres_version?, error? } } }
//! ```
//!
//! `data` is a typed payload per check (see [`data`]); the JSON Schema for
//! each check lives in `schemas/` and is embedded at compile time (see
//! [`schema`]).

mod bloat;
mod cluster;
pub mod data;
pub mod generator;
mod hourly;
mod indexes;
pub mod metrics;
mod queries;
pub mod schema;
mod settings_checks;
mod waits;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::fmt::{format_epoch_rfc3339, now_rfc3339};
use crate::prom::PromError;
use crate::qid::QidError;
use crate::settings::SettingsMap;

pub use data::CheckData;
pub use generator::{GeneratorConfig, ReportGenerator, filter_a003_settings};

// ============================================================
// Errors
// ============================================================

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Qid(#[from] QidError),
    #[error(transparent)]
    Prom(#[from] PromError),
    #[error("{kind} document violates its schema: {errors}")]
    Schema { kind: String, errors: String },
    #[error("schema for {kind} failed to compile: {detail}")]
    SchemaCompile { kind: String, detail: String },
    #[error("deadline exceeded")]
    Deadline,
    #[error("generation task failed: {0}")]
    Task(String),
    #[error("failed to serialize {what}: {source}")]
    Json {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================
// Check catalogue
// ============================================================

/// Closed set of checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CheckId {
    A002,
    A003,
    A004,
    A007,
    D004,
    F001,
    F004,
    F005,
    G001,
    H001,
    H002,
    H004,
    K001,
    K003,
    M001,
    M002,
    M003,
    M004,
    N001,
}

impl CheckId {
    pub const ALL: [CheckId; 19] = [
        CheckId::A002,
        CheckId::A003,
        CheckId::A004,
        CheckId::A007,
        CheckId::D004,
        CheckId::F001,
        CheckId::F004,
        CheckId::F005,
        CheckId::G001,
        CheckId::H001,
        CheckId::H002,
        CheckId::H004,
        CheckId::K001,
        CheckId::K003,
        CheckId::M001,
        CheckId::M002,
        CheckId::M003,
        CheckId::M004,
        CheckId::N001,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CheckId::A002 => "A002",
            CheckId::A003 => "A003",
            CheckId::A004 => "A004",
            CheckId::A007 => "A007",
            CheckId::D004 => "D004",
            CheckId::F001 => "F001",
            CheckId::F004 => "F004",
            CheckId::F005 => "F005",
            CheckId::G001 => "G001",
            CheckId::H001 => "H001",
            CheckId::H002 => "H002",
            CheckId::H004 => "H004",
            CheckId::K001 => "K001",
            CheckId::K003 => "K003",
            CheckId::M001 => "M001",
            CheckId::M002 => "M002",
            CheckId::M003 => "M003",
            CheckId::M004 => "M004",
            CheckId::N001 => "N001",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            CheckId::A002 => "Postgres major version",
            CheckId::A003 => "Postgres settings",
            CheckId::A004 => "Cluster information",
            CheckId::A007 => "Altered settings",
            CheckId::D004 => "pg_stat_statements and pg_stat_kcache settings",
            CheckId::F001 => "Autovacuum: current settings",
            CheckId::F004 => "Autovacuum: heap bloat (estimated)",
            CheckId::F005 => "Autovacuum: index bloat (estimated)",
            CheckId::G001 => "Memory-related settings",
            CheckId::H001 => "Invalid indexes",
            CheckId::H002 => "Unused indexes",
            CheckId::H004 => "Redundant indexes",
            CheckId::K001 => "Globally aggregated query metrics",
            CheckId::K003 => "Top queries by total execution time",
            CheckId::M001 => "Top queries by execution time (hourly)",
            CheckId::M002 => "Top queries by calls (hourly)",
            CheckId::M003 => "Top queries by I/O time (hourly)",
            CheckId::M004 => "Top queries by temp bytes written (hourly)",
            CheckId::N001 => "Wait events by query",
        }
    }

    /// Checks built by filtering the A003 settings report.
    pub fn is_derived(self) -> bool {
        matches!(self, CheckId::D004 | CheckId::F001 | CheckId::G001)
    }
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CheckId::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown check '{s}'"))
    }
}

impl Serialize for CheckId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// ============================================================
// Envelope
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    SingleNode,
    Combined,
}

/// Cluster topology as reported.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Nodes {
    pub primary: String,
    pub standbys: Vec<String>,
}

impl Nodes {
    pub fn single(node: impl Into<String>) -> Self {
        Self {
            primary: node.into(),
            standbys: Vec::new(),
        }
    }

    /// Primary first, then standbys in order.
    pub fn all(&self) -> Vec<String> {
        std::iter::once(self.primary.clone())
            .chain(self.standbys.iter().cloned())
            .filter(|n| !n.is_empty())
            .collect()
    }
}

/// Version facts derived from `server_version` and `server_version_num`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PostgresVersion {
    pub version: String,
    pub server_version_num: String,
    pub server_major_ver: String,
    pub server_minor_ver: String,
}

impl PostgresVersion {
    /// Parses `server_version_num` (e.g. `160002`, `90624`).
    pub fn from_version_num(num: &str, version: &str) -> Option<Self> {
        let n = num.trim().parse::<u32>().ok().filter(|n| *n > 0)?;
        let (major, minor) = if n >= 100_000 {
            ((n / 10_000).to_string(), (n % 10_000).to_string())
        } else {
            (format!("{}.{}", n / 10_000, (n / 100) % 100), (n % 100).to_string())
        };
        let version = version
            .split_whitespace()
            .next()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{major}.{minor}"));
        Some(Self {
            version,
            server_version_num: n.to_string(),
            server_major_ver: major,
            server_minor_ver: minor,
        })
    }

    pub fn from_settings(settings: &SettingsMap) -> Option<Self> {
        let num = settings.get("server_version_num")?;
        let version = settings
            .get("server_version")
            .map(|e| e.setting.as_str())
            .unwrap_or_default();
        Self::from_version_num(&num.setting, version)
    }
}

/// One node's outcome for one check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeResult {
    pub data: CheckData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres_version: Option<PostgresVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeResult {
    pub fn ok(data: CheckData, postgres_version: Option<PostgresVersion>) -> Self {
        Self {
            data,
            postgres_version,
            error: None,
        }
    }

    /// Empty payload for `check` plus an error message.
    pub fn failed(check: CheckId, error: impl fmt::Display) -> Self {
        Self {
            data: CheckData::empty(check),
            postgres_version: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    #[serde(rename = "checkId")]
    pub check_id: CheckId,
    #[serde(rename = "checkTitle")]
    pub check_title: String,
    pub timestamptz: String,
    pub version: String,
    pub build_ts: String,
    pub generation_mode: GenerationMode,
    pub nodes: Nodes,
    pub results: BTreeMap<String, NodeResult>,
}

impl Report {
    pub fn insert_result(&mut self, node: impl Into<String>, result: NodeResult) {
        self.results.insert(node.into(), result);
    }

    /// Result of the primary node, if present.
    pub fn primary_result(&self) -> Option<&NodeResult> {
        self.results.get(&self.nodes.primary)
    }

    pub fn to_json(&self) -> Result<String, ReportError> {
        serde_json::to_string_pretty(self).map_err(|source| ReportError::Json {
            what: format!("{} report", self.check_id),
            source,
        })
    }

    /// `<cluster>_<checkId>.json`
    pub fn filename(&self, cluster: &str) -> String {
        format!("{}_{}.json", cluster, self.check_id)
    }
}

/// Either a single node or a whole topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeScope {
    Single(String),
    Topology(Nodes),
}

/// Build timestamp embedded at compile time, RFC 3339.
pub fn build_timestamp() -> String {
    format_epoch_rfc3339(crate::BUILD_EPOCH.parse::<i64>().unwrap_or(0))
}

/// Wraps check data into the report envelope.
///
/// With [`NodeScope::Single`] the report is in `single_node` mode and the node
/// is the primary. With [`NodeScope::Topology`] the report is `combined` and
/// `data` is filed under the primary; add the other nodes with
/// [`Report::insert_result`].
pub fn format_report_data(
    check: CheckId,
    data: CheckData,
    scope: NodeScope,
    postgres_version: Option<PostgresVersion>,
) -> Report {
    let (nodes, mode) = match scope {
        NodeScope::Single(node) => (Nodes::single(node), GenerationMode::SingleNode),
        NodeScope::Topology(nodes) => (nodes, GenerationMode::Combined),
    };
    let mut results = BTreeMap::new();
    results.insert(nodes.primary.clone(), NodeResult::ok(data, postgres_version));
    Report {
        check_id: check,
        check_title: check.title().to_string(),
        timestamptz: now_rfc3339(),
        version: crate::VERSION.to_string(),
        build_ts: build_timestamp(),
        generation_mode: mode,
        nodes,
        results,
    }
}
