//! pgcheckup - PostgreSQL checkup report generator.
//!
//! Queries a Prometheus-compatible backend filled by a pgwatch-style
//! collector, writes one JSON report per check plus one document per
//! interesting query, and optionally uploads them.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgcheckup_core::perquery::{NodeSelection, PerQueryArtifact, PerQueryExporter};
use pgcheckup_core::prom::{DEFAULT_TIMEOUT, MetricSource, PromClient, PromConfig, SigV4Config};
use pgcheckup_core::report::generator::DEFAULT_EXCLUDED_DATABASES;
use pgcheckup_core::report::{CheckId, GeneratorConfig, Report, ReportGenerator};
use pgcheckup_core::sink::{NoSink, PostgresSink, SinkConfig, SinkStore};
use pgcheckup_core::upload::{PER_QUERY_CHECK_ID, UploadClient, UploadConfig};

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(name = "pgcheckup", about = "PostgreSQL checkup reports from collected metrics", version = pgcheckup_core::VERSION)]
struct Args {
    /// Prometheus-compatible query API base URL.
    #[arg(long, default_value = "http://localhost:9090", env = "PGCHECKUP_PROMETHEUS_URL")]
    prometheus_url: String,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs(), env = "PGCHECKUP_TIMEOUT")]
    timeout: u64,

    /// Sign requests with AWS SigV4 for this region (credentials from AWS_* env).
    #[arg(long, env = "PGCHECKUP_SIGV4_REGION")]
    sigv4_region: Option<String>,

    /// Cluster label value.
    #[arg(long, default_value = "default", env = "PGCHECKUP_CLUSTER")]
    cluster: String,

    /// node_name label value.
    #[arg(long, default_value = "node-01", env = "PGCHECKUP_NODE_NAME")]
    node_name: String,

    /// Report every node of the cluster in each report.
    #[arg(long, env = "PGCHECKUP_COMBINE_NODES")]
    combine_nodes: bool,

    /// Only generate these checks (comma-separated, e.g. A003,K003). Default: all.
    #[arg(long, value_delimiter = ',')]
    check: Vec<CheckId>,

    /// Directory for report files.
    #[arg(short, long, default_value = "./reports", env = "PGCHECKUP_OUTPUT_DIR")]
    output_dir: PathBuf,

    /// Hours covered by hourly checks and per-query documents.
    #[arg(long, default_value = "24", env = "PGCHECKUP_HOURS")]
    hours: u32,

    /// Queries tracked individually in hourly checks.
    #[arg(long, default_value = "10", env = "PGCHECKUP_TOP_K")]
    top_k: usize,

    /// Counter window of K001/K003/N001 in seconds.
    #[arg(long, default_value = "3600", env = "PGCHECKUP_WINDOW")]
    window: i64,

    /// Rows in K003.
    #[arg(long, default_value = "50")]
    top_queries_limit: usize,

    /// Entries per database in bloat and index checks.
    #[arg(long, default_value = "100")]
    list_limit: usize,

    /// Checks generated concurrently.
    #[arg(long, default_value = "4", env = "PGCHECKUP_CONCURRENCY")]
    concurrency: usize,

    /// Overall deadline in seconds; unfinished checks are reported with an error.
    #[arg(long, env = "PGCHECKUP_DEADLINE")]
    deadline: Option<u64>,

    /// Additional databases to exclude (comma-separated).
    #[arg(long, value_delimiter = ',', env = "PGCHECKUP_EXCLUDE_DB")]
    exclude_db: Vec<String>,

    /// Evaluation time as epoch seconds. Default: now.
    #[arg(long)]
    end: Option<i64>,

    /// Write per-query documents. Disable with --per-query=false.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    per_query: bool,

    /// Truncate query texts to this many characters.
    #[arg(long, env = "PGCHECKUP_QUERY_TEXT_LIMIT")]
    query_text_limit: Option<usize>,

    /// Sink database with query texts and index definitions.
    #[arg(long, env = "PGCHECKUP_SINK_DSN")]
    sink_dsn: Option<String>,

    /// Report ingestion API base URL. Enables upload together with --upload-token.
    #[arg(long, env = "PGCHECKUP_UPLOAD_URL")]
    upload_url: Option<String>,

    /// Access token for the ingestion API.
    #[arg(long, env = "PGCHECKUP_UPLOAD_TOKEN", hide_env_values = true)]
    upload_token: Option<String>,

    /// Project name for uploaded reports.
    #[arg(long, default_value = "default", env = "PGCHECKUP_UPLOAD_PROJECT")]
    upload_project: String,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn prom_config(&self) -> PromConfig {
        PromConfig {
            url: self.prometheus_url.clone(),
            timeout: Duration::from_secs(self.timeout),
            sigv4: self.sigv4_region.clone().map(SigV4Config::from_env),
        }
    }

    fn generator_config(&self) -> GeneratorConfig {
        let mut excluded: Vec<String> = DEFAULT_EXCLUDED_DATABASES
            .iter()
            .map(|d| d.to_string())
            .collect();
        for db in &self.exclude_db {
            if !db.is_empty() && !excluded.contains(db) {
                excluded.push(db.clone());
            }
        }
        GeneratorConfig {
            excluded_databases: excluded,
            top_k: self.top_k,
            hours: self.hours,
            window_s: self.window,
            top_queries_limit: self.top_queries_limit,
            list_limit: self.list_limit,
            concurrency: self.concurrency,
            deadline: self.deadline.map(Duration::from_secs),
            query_text_limit: self.query_text_limit,
            ..GeneratorConfig::default()
        }
    }

    fn upload_config(&self) -> Option<UploadConfig> {
        match (&self.upload_url, &self.upload_token) {
            (Some(url), Some(token)) => Some(UploadConfig {
                api_url: url.clone(),
                access_token: token.clone(),
                project: self.upload_project.clone(),
                timeout: Duration::from_secs(self.timeout),
            }),
            (Some(_), None) => {
                warn!("--upload-url given without --upload-token, not uploading");
                None
            }
            _ => None,
        }
    }
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };
    let code = runtime.block_on(run(args));
    process::exit(code);
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["pgcheckup", "pgcheckup_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(args: Args) -> i32 {
    info!(
        version = pgcheckup_core::VERSION,
        cluster = %args.cluster,
        node = %args.node_name,
        url = %args.prometheus_url,
        "starting"
    );

    let client = match PromClient::new(&args.prom_config()) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "invalid metrics backend configuration");
            return 1;
        }
    };
    if !client.test_connection().await {
        error!(url = %args.prometheus_url, "metrics backend unreachable");
        return 1;
    }
    let source: Arc<dyn MetricSource> = Arc::new(client);

    let postgres_sink = args.sink_dsn.as_ref().map(|dsn| {
        Arc::new(PostgresSink::new(&SinkConfig {
            connection_string: dsn.clone(),
        }))
    });
    let sink: Arc<dyn SinkStore> = match &postgres_sink {
        Some(sink) => sink.clone(),
        None => Arc::new(NoSink),
    };

    let config = args.generator_config();
    let query_text_limit = config.query_text_limit;
    let concurrency = config.concurrency;
    let generator = Arc::new(ReportGenerator::new(source.clone(), sink.clone(), config));
    let end = args.end.unwrap_or_else(|| chrono::Utc::now().timestamp());

    let reports = if args.check.is_empty() {
        generator
            .generate_all_reports_at(&args.cluster, &args.node_name, args.combine_nodes, end)
            .await
    } else {
        let mut reports = BTreeMap::new();
        for check in &args.check {
            let report = generator
                .generate_report_at(*check, &args.cluster, &args.node_name, args.combine_nodes, end)
                .await;
            reports.insert(*check, report);
        }
        reports
    };

    let mut code = 0;
    let written = match write_reports(&args.output_dir, &args.cluster, &reports).await {
        Ok(written) => written,
        Err(e) => {
            error!(error = %e, "failed to write reports");
            code = 1;
            Vec::new()
        }
    };

    let mut per_query = Vec::new();
    if args.per_query {
        let exporter = Arc::new(
            PerQueryExporter::new(source.clone(), sink.clone())
                .with_query_text_limit(query_text_limit)
                .with_concurrency(concurrency),
        );
        let selection = if args.combine_nodes {
            NodeSelection::All
        } else {
            NodeSelection::Node(args.node_name.clone())
        };
        match exporter
            .generate_per_query_jsons(
                reports.values(),
                &args.cluster,
                &selection,
                args.hours,
                end,
                Some(args.output_dir.as_path()),
                true,
            )
            .await
        {
            Ok(artifacts) => per_query = artifacts,
            Err(e) => {
                error!(error = %e, "per-query export failed");
                code = 1;
            }
        }
    }

    if let Some(upload) = args.upload_config() {
        upload_all(&upload, end, &written, &per_query).await;
    }

    if let Some(sink) = postgres_sink {
        sink.close().await;
    }
    info!(
        reports = written.len(),
        per_query = per_query.len(),
        dir = %args.output_dir.display(),
        "done"
    );
    code
}

/// A written report: check id, file name and JSON text.
struct WrittenReport {
    check: CheckId,
    filename: String,
    json: String,
}

async fn write_reports(
    dir: &Path,
    cluster: &str,
    reports: &BTreeMap<CheckId, Report>,
) -> Result<Vec<WrittenReport>, Box<dyn std::error::Error>> {
    tokio::fs::create_dir_all(dir).await?;
    let mut written = Vec::with_capacity(reports.len());
    for (check, report) in reports {
        let json = report.to_json()?;
        let filename = report.filename(cluster);
        tokio::fs::write(dir.join(&filename), &json).await?;
        debug!(check = %check, file = %filename, "report written");
        written.push(WrittenReport {
            check: *check,
            filename,
            json,
        });
    }
    Ok(written)
}

async fn upload_all(
    config: &UploadConfig,
    epoch: i64,
    reports: &[WrittenReport],
    per_query: &[PerQueryArtifact],
) {
    let client = match UploadClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "upload disabled");
            return;
        }
    };
    let report_id = match client.create_report(epoch).await {
        Ok(Some(id)) => id,
        Ok(None) => return,
        Err(e) => {
            error!(error = %e, "failed to create upload report");
            return;
        }
    };

    for report in reports {
        match client
            .post_file(report_id, report.check.as_str(), &report.filename, &report.json)
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => warn!(file = %report.filename, error = %e, "upload failed"),
        }
    }
    for artifact in per_query {
        let json = match serde_json::to_string_pretty(&artifact.document) {
            Ok(json) => json,
            Err(e) => {
                warn!(file = %artifact.filename, error = %e, "failed to serialize");
                continue;
            }
        };
        match client
            .post_file(report_id, PER_QUERY_CHECK_ID, &artifact.filename, &json)
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => warn!(file = %artifact.filename, error = %e, "upload failed"),
        }
    }
    info!(report_id, files = reports.len() + per_query.len(), "upload complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_defaults_to_client_default() {
        let args = Args::try_parse_from(["pgcheckup"]).unwrap();
        assert_eq!(args.timeout, 10);
        assert_eq!(args.prom_config().timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn timeout_flag_overrides_default() {
        let args = Args::try_parse_from(["pgcheckup", "--timeout", "3"]).unwrap();
        assert_eq!(args.timeout, 3);
    }
}
