//! Report orchestration.
//!
//! [`ReportGenerator`] runs every check against one cluster, either for a
//! single node or for the whole topology (`combined` mode). Checks that only
//! need the settings (D004, F001, G001) are cut out of the A003 result
//! instead of querying the backend again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::data::{CheckData, TopQueriesData, VersionData};
use super::settings_checks::{
    AUTOVACUUM_SETTINGS, MEMORY_SETTINGS, STATEMENTS_SETTINGS, derive_d004, derive_f001,
    derive_g001,
};
use super::{
    CheckId, NodeResult, NodeScope, Nodes, PostgresVersion, Report, ReportError, bloat, cluster,
    format_report_data, hourly, indexes, metrics, queries, schema, settings_checks, waits,
};
use crate::prom::expr::{Selector, literal_alternation};
use crate::prom::{MetricSample, MetricSource};
use crate::settings::{SettingsMap, settings_from_samples};
use crate::sink::SinkStore;

/// Gauges are read as their last value within this lookback.
const GAUGE_LOOKBACK_S: i64 = 3600;

/// Databases never reported on.
pub const DEFAULT_EXCLUDED_DATABASES: &[&str] = &[
    "template0",
    "template1",
    "rdsadmin",
    "azure_maintenance",
    "cloudsqladmin",
];

/// Tunables of a report run.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub excluded_databases: Vec<String>,
    /// Queries tracked individually by the hourly checks.
    pub top_k: usize,
    /// Hours covered by the hourly checks.
    pub hours: u32,
    pub step_s: i64,
    /// Counter window of K001, K003 and N001.
    pub window_s: i64,
    pub top_queries_limit: usize,
    /// Entries listed per database by the bloat and index checks.
    pub list_limit: usize,
    pub reconcile_tolerance: f64,
    /// Checks generated at the same time.
    pub concurrency: usize,
    /// Overall budget of `generate_all_reports`.
    pub deadline: Option<Duration>,
    /// Query texts are cut to this many characters.
    pub query_text_limit: Option<usize>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            excluded_databases: DEFAULT_EXCLUDED_DATABASES
                .iter()
                .map(|d| d.to_string())
                .collect(),
            top_k: 10,
            hours: 24,
            step_s: 3600,
            window_s: 3600,
            top_queries_limit: 50,
            list_limit: 100,
            reconcile_tolerance: crate::topk::DEFAULT_RECONCILE_TOLERANCE,
            concurrency: 4,
            deadline: None,
            query_text_limit: None,
        }
    }
}

// ============================================================
// Per-check context
// ============================================================

/// Everything a check builder needs for one node.
pub(crate) struct CheckContext<'a> {
    pub(crate) source: &'a dyn MetricSource,
    pub(crate) sink: &'a dyn SinkStore,
    pub(crate) config: &'a GeneratorConfig,
    pub(crate) cluster: &'a str,
    pub(crate) node: &'a str,
    /// Evaluation time, epoch seconds.
    pub(crate) end: i64,
}

impl<'a> CheckContext<'a> {
    pub(crate) fn new(
        source: &'a dyn MetricSource,
        sink: &'a dyn SinkStore,
        config: &'a GeneratorConfig,
        cluster: &'a str,
        node: &'a str,
        end: i64,
    ) -> Self {
        Self {
            source,
            sink,
            config,
            cluster,
            node,
            end,
        }
    }

    /// `metric{cluster="..",node_name=".."}`
    pub(crate) fn selector(&self, metric: &str) -> Selector {
        Selector::new(metric)
            .eq("cluster", self.cluster)
            .eq("node_name", self.node)
    }

    /// Like [`Self::selector`], minus the excluded databases.
    pub(crate) fn db_selector(&self, metric: &str) -> Selector {
        self.selector(metric)
            .not_in("datname", &self.config.excluded_databases)
    }

    /// Instant query at `end`; failures are logged and yield `None`.
    pub(crate) async fn instant(&self, expr: &str) -> Option<Vec<MetricSample>> {
        match self.source.query_instant(expr, Some(self.end)).await {
            Ok(samples) => Some(samples),
            Err(e) => {
                warn!(node = self.node, expr, error = %e, "metric query failed, omitting");
                None
            }
        }
    }

    /// Latest value of a gauge.
    pub(crate) async fn gauge(&self, selector: &Selector) -> Option<Vec<MetricSample>> {
        self.instant(&selector.last_over_time(GAUGE_LOOKBACK_S))
            .await
    }
}

// ============================================================
// Settings filtering
// ============================================================

fn filter_settings(settings: &SettingsMap, wanted: &[&str]) -> SettingsMap {
    wanted
        .iter()
        .filter_map(|name| settings.get(*name).map(|e| (name.to_string(), e.clone())))
        .collect()
}

/// Settings of the primary node of an A003 report restricted to `wanted`.
/// Names the report does not have are skipped.
pub fn filter_a003_settings(report: &Report, wanted: &[&str]) -> SettingsMap {
    filter_a003_node_settings(report, &report.nodes.primary, wanted)
}

/// [`filter_a003_settings`] for any node of a combined report.
pub(crate) fn filter_a003_node_settings(report: &Report, node: &str, wanted: &[&str]) -> SettingsMap {
    report
        .results
        .get(node)
        .and_then(|r| r.data.settings())
        .map(|s| filter_settings(s, wanted))
        .unwrap_or_default()
}

fn wanted_settings(check: CheckId) -> &'static [&'static str] {
    match check {
        CheckId::D004 => STATEMENTS_SETTINGS,
        CheckId::F001 => AUTOVACUUM_SETTINGS,
        CheckId::G001 => MEMORY_SETTINGS,
        _ => &[],
    }
}

fn derive(check: CheckId, settings: SettingsMap, top: Option<&TopQueriesData>) -> CheckData {
    match check {
        CheckId::D004 => derive_d004(settings, top),
        CheckId::F001 => derive_f001(settings),
        CheckId::G001 => derive_g001(settings),
        other => CheckData::empty(other),
    }
}

// ============================================================
// Generator
// ============================================================

pub struct ReportGenerator {
    source: Arc<dyn MetricSource>,
    sink: Arc<dyn SinkStore>,
    config: GeneratorConfig,
    versions: Mutex<HashMap<(String, String), PostgresVersion>>,
}

impl ReportGenerator {
    pub fn new(
        source: Arc<dyn MetricSource>,
        sink: Arc<dyn SinkStore>,
        config: GeneratorConfig,
    ) -> Self {
        Self {
            source,
            sink,
            config,
            versions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    fn context<'a>(&'a self, cluster: &'a str, node: &'a str, end: i64) -> CheckContext<'a> {
        CheckContext::new(
            self.source.as_ref(),
            self.sink.as_ref(),
            &self.config,
            cluster,
            node,
            end,
        )
    }

    /// Nodes of `cluster` from the recovery flag: 0 is the primary. When the
    /// backend knows nothing, `node` is the only (primary) node.
    pub async fn topology(&self, cluster: &str, node: &str, end: i64) -> Nodes {
        let expr = Selector::new(metrics::IN_RECOVERY)
            .eq("cluster", cluster)
            .last_over_time(GAUGE_LOOKBACK_S);
        let samples = match self.source.query_instant(&expr, Some(end)).await {
            Ok(samples) => samples,
            Err(e) => {
                warn!(cluster, error = %e, "topology query failed, using configured node");
                return Nodes::single(node);
            }
        };

        let mut recovery: BTreeMap<String, f64> = BTreeMap::new();
        for s in &samples {
            if let Some(name) = s.label("node_name").filter(|n| !n.is_empty()) {
                let v = recovery.entry(name.to_string()).or_insert(s.value);
                *v = v.max(s.value);
            }
        }
        if recovery.is_empty() {
            return Nodes::single(node);
        }

        let primary = recovery
            .iter()
            .find(|(_, v)| **v == 0.0)
            .map(|(n, _)| n.clone())
            .unwrap_or_else(|| node.to_string());
        let standbys = recovery
            .into_keys()
            .filter(|n| *n != primary)
            .collect();
        debug!(cluster, primary = %primary, "topology resolved");
        Nodes { primary, standbys }
    }

    /// Server version of `node`, cached per `(cluster, node)`.
    pub async fn postgres_version(
        &self,
        cluster: &str,
        node: &str,
        end: i64,
    ) -> Option<PostgresVersion> {
        let key = (cluster.to_string(), node.to_string());
        let cached = self.lock_versions().get(&key).cloned();
        if cached.is_some() {
            return cached;
        }
        let ctx = self.context(cluster, node, end);
        let selector = ctx.selector(metrics::SETTINGS).matches(
            "setting_name",
            &literal_alternation(&["server_version", "server_version_num"]),
        );
        let samples = ctx.gauge(&selector).await?;
        let version = PostgresVersion::from_settings(&settings_from_samples(&samples))?;
        self.lock_versions().insert(key, version.clone());
        Some(version)
    }

    fn lock_versions(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(String, String), PostgresVersion>> {
        self.versions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Data of an independent check for one node.
    async fn check_data(
        &self,
        ctx: &CheckContext<'_>,
        check: CheckId,
    ) -> Result<CheckData, ReportError> {
        Ok(match check {
            CheckId::A002 => CheckData::Version(VersionData {
                version: self
                    .postgres_version(ctx.cluster, ctx.node, ctx.end)
                    .await
                    .unwrap_or_default(),
            }),
            CheckId::A003 => settings_checks::build_a003(ctx).await,
            CheckId::A004 => cluster::build_a004(ctx).await,
            CheckId::A007 => settings_checks::build_a007(ctx).await,
            CheckId::F004 => bloat::build_f004(ctx).await,
            CheckId::F005 => bloat::build_f005(ctx).await,
            CheckId::H001 => indexes::build_h001(ctx).await,
            CheckId::H002 => indexes::build_h002(ctx).await,
            CheckId::H004 => indexes::build_h004(ctx).await,
            CheckId::K001 => queries::build_k001(ctx).await,
            CheckId::K003 => queries::build_k003(ctx).await,
            CheckId::M001 | CheckId::M002 | CheckId::M003 | CheckId::M004 => {
                hourly::build_hourly(ctx, check).await?
            }
            CheckId::N001 => waits::build_n001(ctx).await,
            CheckId::D004 | CheckId::F001 | CheckId::G001 => {
                return Err(ReportError::Task(format!("{check} is derived from A003")));
            }
        })
    }

    async fn node_result(&self, check: CheckId, cluster: &str, node: &str, end: i64) -> NodeResult {
        let ctx = self.context(cluster, node, end);
        let version = self.postgres_version(cluster, node, end).await;
        match self.check_data(&ctx, check).await {
            Ok(data) => NodeResult::ok(data, version),
            Err(e) => {
                warn!(check = %check, node, error = %e, "check failed");
                NodeResult {
                    postgres_version: version,
                    ..NodeResult::failed(check, e)
                }
            }
        }
    }

    async fn scope(&self, cluster: &str, node: &str, combine: bool, end: i64) -> NodeScope {
        if combine {
            NodeScope::Topology(self.topology(cluster, node, end).await)
        } else {
            NodeScope::Single(node.to_string())
        }
    }

    /// One check, evaluated now.
    pub async fn generate_report(
        &self,
        check: CheckId,
        cluster: &str,
        node: &str,
        combine: bool,
    ) -> Report {
        self.generate_report_at(check, cluster, node, combine, chrono::Utc::now().timestamp())
            .await
    }

    pub async fn generate_report_at(
        &self,
        check: CheckId,
        cluster: &str,
        node: &str,
        combine: bool,
        end: i64,
    ) -> Report {
        let scope = self.scope(cluster, node, combine, end).await;
        let nodes = scope_nodes(&scope);
        if !check.is_derived() {
            return self.collect(check, &scope, cluster, &nodes, end).await;
        }
        let a003 = self.collect(CheckId::A003, &scope, cluster, &nodes, end).await;
        let k003 = match check {
            CheckId::D004 => Some(self.collect(CheckId::K003, &scope, cluster, &nodes, end).await),
            _ => None,
        };
        let results = nodes
            .iter()
            .map(|n| (n.clone(), derive_node(check, n, &a003, k003.as_ref())))
            .collect();
        assemble(check, scope, results)
    }

    /// One independent check over `nodes`, sequentially.
    async fn collect(
        &self,
        check: CheckId,
        scope: &NodeScope,
        cluster: &str,
        nodes: &[String],
        end: i64,
    ) -> Report {
        let mut results = BTreeMap::new();
        for n in nodes {
            results.insert(n.clone(), self.node_result(check, cluster, n, end).await);
        }
        assemble(check, scope.clone(), results)
    }

    /// Every check, evaluated now.
    pub async fn generate_all_reports(
        self: &Arc<Self>,
        cluster: &str,
        node: &str,
        combine: bool,
    ) -> BTreeMap<CheckId, Report> {
        self.generate_all_reports_at(cluster, node, combine, chrono::Utc::now().timestamp())
            .await
    }

    /// Runs A003 first, the other independent checks concurrently, then
    /// derives D004, F001 and G001. Checks still running when the deadline
    /// passes are reported with an error.
    pub async fn generate_all_reports_at(
        self: &Arc<Self>,
        cluster: &str,
        node: &str,
        combine: bool,
        end: i64,
    ) -> BTreeMap<CheckId, Report> {
        let started = Instant::now();
        let deadline = self.config.deadline.map(|d| started + d);
        let scope = self.scope(cluster, node, combine, end).await;
        let nodes = scope_nodes(&scope);

        let mut results: BTreeMap<CheckId, BTreeMap<String, NodeResult>> = BTreeMap::new();
        for n in &nodes {
            let result = self
                .bounded(CheckId::A003, deadline, self.node_result(CheckId::A003, cluster, n, end))
                .await;
            results.entry(CheckId::A003).or_default().insert(n.clone(), result);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for check in CheckId::ALL
            .into_iter()
            .filter(|c| *c != CheckId::A003 && !c.is_derived())
        {
            for n in &nodes {
                let this = Arc::clone(self);
                let semaphore = Arc::clone(&semaphore);
                let cluster = cluster.to_string();
                let n = n.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let result = this
                        .bounded(check, deadline, this.node_result(check, &cluster, &n, end))
                        .await;
                    (check, n, result)
                });
            }
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((check, n, result)) => {
                    results.entry(check).or_default().insert(n, result);
                }
                Err(e) => error!(error = %e, "check task failed"),
            }
        }

        let mut reports = BTreeMap::new();
        for check in CheckId::ALL.into_iter().filter(|c| !c.is_derived()) {
            let mut per_node = results.remove(&check).unwrap_or_default();
            for n in &nodes {
                per_node.entry(n.clone()).or_insert_with(|| {
                    NodeResult::failed(check, ReportError::Task("check did not complete".into()))
                });
            }
            reports.insert(check, assemble(check, scope.clone(), per_node));
        }

        let mut derived = Vec::new();
        if let Some(a003) = reports.get(&CheckId::A003) {
            for check in CheckId::ALL.into_iter().filter(|c| c.is_derived()) {
                let per_node = nodes
                    .iter()
                    .map(|n| {
                        (n.clone(), derive_node(check, n, a003, reports.get(&CheckId::K003)))
                    })
                    .collect();
                derived.push((check, assemble(check, scope.clone(), per_node)));
            }
        }
        reports.extend(derived);
        info!(
            cluster,
            checks = reports.len(),
            nodes = nodes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reports generated"
        );
        reports
    }

    async fn bounded(
        &self,
        check: CheckId,
        deadline: Option<Instant>,
        work: impl Future<Output = NodeResult>,
    ) -> NodeResult {
        match deadline {
            Some(at) => tokio::time::timeout_at(at, work).await.unwrap_or_else(|_| {
                warn!(check = %check, "deadline exceeded");
                NodeResult::failed(check, ReportError::Deadline)
            }),
            None => work.await,
        }
    }
}

fn scope_nodes(scope: &NodeScope) -> Vec<String> {
    match scope {
        NodeScope::Single(node) => vec![node.clone()],
        NodeScope::Topology(nodes) => nodes.all(),
    }
}

/// Cuts a derived check out of the node's A003 (and, for D004, K003) result.
fn derive_node(check: CheckId, node: &str, a003: &Report, k003: Option<&Report>) -> NodeResult {
    let Some(source) = a003.results.get(node) else {
        return NodeResult::failed(check, ReportError::Task("A003 result missing".into()));
    };
    let top = k003
        .and_then(|r| r.results.get(node))
        .and_then(|r| match &r.data {
            CheckData::TopQueries(t) => Some(t),
            _ => None,
        });
    let settings = filter_a003_node_settings(a003, node, wanted_settings(check));
    NodeResult {
        data: derive(check, settings, top),
        postgres_version: source.postgres_version.clone(),
        error: source.error.clone(),
    }
}

/// Wraps per-node results into a report and validates it. A payload that
/// does not match the check's schema is replaced by the empty payload.
fn assemble(check: CheckId, scope: NodeScope, results: BTreeMap<String, NodeResult>) -> Report {
    let mut report = format_report_data(check, CheckData::empty(check), scope, None);
    report.results = results;
    if report.results.is_empty() {
        report.insert_result(
            report.nodes.primary.clone(),
            NodeResult::failed(check, "no nodes"),
        );
    }
    if let Err(e) = schema::validate_report(&report) {
        error!(check = %check, error = %e, "generated report failed validation");
        for result in report.results.values_mut() {
            *result = NodeResult {
                postgres_version: result.postgres_version.take(),
                ..NodeResult::failed(check, &e)
            };
        }
    }
    report
}
