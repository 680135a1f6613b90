//! Per-query documents.
//!
//! Query ids are collected from the K-series top query lists and the N001
//! wait event lists of a finished report batch. Each id gets one document
//! with its text (from the sink) and its counters per node and database.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::fmt::{format_epoch_rfc3339, now_rfc3339};
use crate::prom::MetricSource;
use crate::prom::expr::{Selector, sum_by};
use crate::qid::build_qid_regex;
use crate::report::data::CheckData;
use crate::report::metrics::PER_QUERY_METRICS;
use crate::report::schema::{SchemaKind, validate_serializable};
use crate::report::{CheckId, Nodes, Report, ReportError};
use crate::sink::SinkStore;
use crate::window::column_for_metric;

/// Node used when the batch names none.
pub const FALLBACK_NODE: &str = "node-01";

// ============================================================
// Extraction
// ============================================================

fn is_reportable(id: &str) -> bool {
    !id.is_empty() && id != "0"
}

/// Query ids per database found in `reports`.
///
/// Only top query lists (K checks) and wait event query lists (N001) are
/// read; D004's sample queries are not per-query material.
pub fn extract_query_ids<'a>(
    reports: impl IntoIterator<Item = &'a Report>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut ids: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut add = |db: &str, id: &str| {
        if is_reportable(id) {
            ids.entry(db.to_string()).or_default().insert(id.to_string());
        }
    };
    for report in reports {
        let is_k = report.check_id.as_str().starts_with('K');
        for result in report.results.values() {
            match &result.data {
                CheckData::TopQueries(top) if is_k => {
                    for q in &top.top_queries {
                        add(&q.datname, &q.queryid);
                    }
                }
                CheckData::WaitEvents(waits) if report.check_id == CheckId::N001 => {
                    for (db, types) in &waits.databases {
                        for kind in types.wait_event_types.values() {
                            for q in &kind.queries_list {
                                add(db, &q.query_id);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    ids
}

// ============================================================
// Documents
// ============================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct QueryMetrics {
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryTimeRange {
    pub hours: u32,
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerQueryDocument {
    pub cluster_id: String,
    pub query_id: String,
    /// `null` when the sink does not know the query.
    pub query_text: Option<String>,
    pub nodes: Nodes,
    /// node -> database -> counters
    pub results: BTreeMap<String, BTreeMap<String, QueryMetrics>>,
    pub time_range: QueryTimeRange,
    pub timestamptz: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerQueryArtifact {
    pub filename: String,
    pub document: PerQueryDocument,
    /// Set when the document was written to disk.
    pub path: Option<PathBuf>,
}

/// Which nodes to fetch counters for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSelection {
    Node(String),
    /// Every node named by the reports.
    All,
}

pub fn per_query_filename(cluster: &str, query_id: &str, include_cluster_prefix: bool) -> String {
    if include_cluster_prefix {
        format!("{cluster}_query_{query_id}.json")
    } else {
        format!("query_{query_id}.json")
    }
}

fn nodes_for(selection: &NodeSelection, reports: &[&Report]) -> Nodes {
    match selection {
        NodeSelection::Node(node) => Nodes::single(node.clone()),
        NodeSelection::All => reports
            .iter()
            .map(|r| &r.nodes)
            .find(|n| !n.primary.is_empty())
            .cloned()
            .unwrap_or_else(|| Nodes::single(FALLBACK_NODE)),
    }
}

// ============================================================
// Exporter
// ============================================================

pub struct PerQueryExporter {
    source: Arc<dyn MetricSource>,
    sink: Arc<dyn SinkStore>,
    query_text_limit: Option<usize>,
    concurrency: usize,
}

/// Parameters shared by every document of one export.
#[derive(Debug, Clone)]
struct Batch {
    cluster: String,
    nodes: Nodes,
    hours: u32,
    end: i64,
    output_dir: Option<PathBuf>,
    include_cluster_prefix: bool,
}

impl PerQueryExporter {
    pub fn new(source: Arc<dyn MetricSource>, sink: Arc<dyn SinkStore>) -> Self {
        Self {
            source,
            sink,
            query_text_limit: None,
            concurrency: 4,
        }
    }

    pub fn with_query_text_limit(mut self, limit: Option<usize>) -> Self {
        self.query_text_limit = limit;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Builds one document per query id found in `reports`, validates it and,
    /// with `output_dir`, writes it there.
    ///
    /// Every id is checked before any query is sent; one unsafe id fails the
    /// whole batch.
    #[allow(clippy::too_many_arguments)]
    pub async fn generate_per_query_jsons<'a>(
        self: &Arc<Self>,
        reports: impl IntoIterator<Item = &'a Report>,
        cluster: &str,
        selection: &NodeSelection,
        hours: u32,
        end: i64,
        output_dir: Option<&Path>,
        include_cluster_prefix: bool,
    ) -> Result<Vec<PerQueryArtifact>, ReportError> {
        let reports: Vec<&Report> = reports.into_iter().collect();
        let by_db = extract_query_ids(reports.iter().copied());

        let mut databases: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (db, ids) in &by_db {
            for id in ids {
                databases.entry(id.clone()).or_default().push(db.clone());
            }
        }
        if databases.is_empty() {
            debug!("no query ids in reports, nothing to export");
            return Ok(Vec::new());
        }
        let all_ids: Vec<&String> = databases.keys().collect();
        build_qid_regex(&all_ids)?;

        if let Some(dir) = output_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| ReportError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        let batch = Arc::new(Batch {
            cluster: cluster.to_string(),
            nodes: nodes_for(selection, &reports),
            hours,
            end,
            output_dir: output_dir.map(Path::to_path_buf),
            include_cluster_prefix,
        });
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (query_id, dbs) in databases {
            let this = Arc::clone(self);
            let batch = Arc::clone(&batch);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                this.export_one(&batch, query_id, dbs).await
            });
        }

        let mut artifacts = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let artifact = joined.map_err(|e| ReportError::Task(e.to_string()))??;
            artifacts.push(artifact);
        }
        artifacts.sort_by(|a, b| a.document.query_id.cmp(&b.document.query_id));
        info!(cluster, documents = artifacts.len(), "per-query documents generated");
        Ok(artifacts)
    }

    async fn export_one(
        &self,
        batch: &Batch,
        query_id: String,
        dbs: Vec<String>,
    ) -> Result<PerQueryArtifact, ReportError> {
        let pattern = build_qid_regex(&[query_id.as_str()])?;
        let window_s = i64::from(batch.hours) * 3600;

        let mut query_text = None;
        for db in &dbs {
            query_text = self.sink.query_text(db, &query_id, self.query_text_limit).await;
            if query_text.is_some() {
                break;
            }
        }

        let mut results = BTreeMap::new();
        for node in batch.nodes.all() {
            let per_db = self
                .node_metrics(&batch.cluster, &node, &pattern, window_s, batch.end)
                .await;
            results.insert(node, per_db);
        }

        let document = PerQueryDocument {
            cluster_id: batch.cluster.clone(),
            query_id: query_id.clone(),
            query_text,
            nodes: batch.nodes.clone(),
            results,
            time_range: QueryTimeRange {
                hours: batch.hours,
                start_time: format_epoch_rfc3339(batch.end - window_s),
                end_time: format_epoch_rfc3339(batch.end),
            },
            timestamptz: now_rfc3339(),
        };
        validate_serializable(SchemaKind::PerQuery, &document)?;

        let filename = per_query_filename(&batch.cluster, &query_id, batch.include_cluster_prefix);
        let path = match &batch.output_dir {
            Some(dir) => Some(write_document(dir, &filename, &document).await?),
            None => None,
        };
        Ok(PerQueryArtifact {
            filename,
            document,
            path,
        })
    }

    /// `database -> counters` of one query on one node.
    async fn node_metrics(
        &self,
        cluster: &str,
        node: &str,
        pattern: &str,
        window_s: i64,
        end: i64,
    ) -> BTreeMap<String, QueryMetrics> {
        let mut per_db: BTreeMap<String, QueryMetrics> = BTreeMap::new();
        for metric in PER_QUERY_METRICS {
            let (column, divisor) = column_for_metric(metric);
            let selector = Selector::new(metric)
                .eq("cluster", cluster)
                .eq("node_name", node)
                .matches("queryid", pattern);
            let expr = sum_by(&["datname"], &selector.increase(window_s));
            let samples = match self.source.query_instant(&expr, Some(end)).await {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(metric, node, error = %e, "per-query metric failed, omitting");
                    continue;
                }
            };
            for s in samples {
                let db = s.label_or_empty("datname").to_string();
                per_db
                    .entry(db)
                    .or_default()
                    .metrics
                    .insert(column.clone(), s.value / divisor);
            }
        }
        per_db
    }
}

async fn write_document(
    dir: &Path,
    filename: &str,
    document: &PerQueryDocument,
) -> Result<PathBuf, ReportError> {
    let json = serde_json::to_string_pretty(document).map_err(|source| ReportError::Json {
        what: filename.to_string(),
        source,
    })?;
    let path = dir.join(filename);
    tokio::fs::write(&path, json)
        .await
        .map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}
