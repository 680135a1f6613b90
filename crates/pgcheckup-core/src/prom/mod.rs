//! Prometheus-compatible metric source.
//!
//! Issues instant (`/api/v1/query`) and range (`/api/v1/query_range`) queries.
//! Expressions are opaque strings; see [`expr`] for the selector builder that
//! keeps externally supplied values out of query syntax.
//!
//! Every request is bounded by the client timeout. Failures are always
//! returned as errors (transport, non-200, `status != "success"`, malformed
//! body) so callers can tell "no data" apart from "query failed".

pub mod expr;
mod sigv4;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use sigv4::SigV4Config;
use sigv4::Signer;

/// Default per-request timeout for backend calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const QUERY_ENDPOINT: &str = "api/v1/query";
const QUERY_RANGE_ENDPOINT: &str = "api/v1/query_range";

// ============================================================
// Errors
// ============================================================

#[derive(Debug, Error)]
pub enum PromError {
    #[error("invalid backend url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to build HTTP client: {source}")]
    BuildClient {
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },
    #[error("{endpoint} returned status '{status}': {error}")]
    Api {
        endpoint: &'static str,
        status: String,
        error: String,
    },
    #[error("malformed response from {endpoint}: {detail}")]
    Malformed {
        endpoint: &'static str,
        detail: String,
    },
    #[error("failed to sign request: {0}")]
    Signing(String),
}

// ============================================================
// Data types
// ============================================================

/// One instant-vector sample.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricSample {
    /// Evaluation timestamp (epoch seconds, may be fractional).
    pub timestamp: f64,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl MetricSample {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    /// Label value or `""` when absent.
    pub fn label_or_empty(&self, name: &str) -> &str {
        self.label(name).unwrap_or("")
    }
}

/// One range-vector series: labels plus `(timestamp, value)` points in time order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RangeSeries {
    pub labels: BTreeMap<String, String>,
    pub points: Vec<(i64, f64)>,
}

impl RangeSeries {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

// ============================================================
// Source abstraction
// ============================================================

/// Anything that can answer instant and range queries.
///
/// Report generators only depend on this trait, so tests inject fakes.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Evaluates `expr` at `time` (epoch seconds) or at "now" when `None`.
    async fn query_instant(
        &self,
        expr: &str,
        time: Option<i64>,
    ) -> Result<Vec<MetricSample>, PromError>;

    /// Evaluates `expr` over `[start, end]` every `step_s` seconds.
    async fn query_range(
        &self,
        expr: &str,
        start: i64,
        end: i64,
        step_s: i64,
    ) -> Result<Vec<RangeSeries>, PromError>;

    /// Returns true if the backend answers a trivial query.
    async fn test_connection(&self) -> bool;
}

// ============================================================
// HTTP client
// ============================================================

/// Backend connection settings.
#[derive(Debug, Clone)]
pub struct PromConfig {
    /// Base URL, e.g. `http://localhost:9090` or a managed workspace URL.
    pub url: String,
    pub timeout: Duration,
    pub sigv4: Option<SigV4Config>,
}

impl PromConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_TIMEOUT,
            sigv4: None,
        }
    }
}

/// HTTP client for the Prometheus query API.
pub struct PromClient {
    http: Client,
    base: Url,
    signer: Option<Signer>,
}

impl PromClient {
    /// Builds the client.
    ///
    /// Signing is enabled only when `config.sigv4` is set and credentials
    /// resolve; otherwise requests go out unsigned and a warning is logged.
    pub fn new(config: &PromConfig) -> Result<Self, PromError> {
        let mut base = Url::parse(&config.url).map_err(|source| PromError::InvalidUrl {
            url: config.url.clone(),
            source,
        })?;
        // Url::join drops the last path segment unless the path ends with '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .user_agent(concat!("pgcheckup/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| PromError::BuildClient { source })?;

        let signer = match config.sigv4.as_ref() {
            Some(sigv4) => {
                let signer = Signer::resolve(sigv4);
                if signer.is_none() {
                    warn!(
                        region = %sigv4.region,
                        "SigV4 enabled but no credentials resolved, sending unsigned requests"
                    );
                }
                signer
            }
            None => None,
        };

        Ok(Self { http, base, signer })
    }

    /// Returns true if requests are SigV4-signed.
    pub fn is_signed(&self) -> bool {
        self.signer.is_some()
    }

    fn endpoint_url(
        &self,
        endpoint: &'static str,
        params: &[(&str, String)],
    ) -> Result<Url, PromError> {
        let mut url = self
            .base
            .join(endpoint)
            .map_err(|source| PromError::InvalidUrl {
                url: format!("{}{}", self.base, endpoint),
                source,
            })?;
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn get(
        &self,
        endpoint: &'static str,
        params: &[(&str, String)],
    ) -> Result<String, PromError> {
        let url = self.endpoint_url(endpoint, params)?;
        let mut builder = self.http.get(url.clone());
        if let Some(signer) = &self.signer {
            for (name, value) in signer.sign("GET", &url)? {
                builder = builder.header(name, value);
            }
        }

        let response = builder
            .send()
            .await
            .map_err(|source| PromError::Request { endpoint, source })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| PromError::Request { endpoint, source })?;
        if !status.is_success() {
            return Err(PromError::Status {
                endpoint,
                status: status.as_u16(),
                body: crate::fmt::truncate_chars(&body, 512),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl MetricSource for PromClient {
    async fn query_instant(
        &self,
        expr: &str,
        time: Option<i64>,
    ) -> Result<Vec<MetricSample>, PromError> {
        let mut params = vec![("query", expr.to_string())];
        if let Some(t) = time {
            params.push(("time", t.to_string()));
        }
        debug!(expr, time, "instant query");
        let body = self.get(QUERY_ENDPOINT, &params).await?;
        parse_instant_body(&body)
    }

    async fn query_range(
        &self,
        expr: &str,
        start: i64,
        end: i64,
        step_s: i64,
    ) -> Result<Vec<RangeSeries>, PromError> {
        let params = [
            ("query", expr.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("step", format!("{}s", step_s)),
        ];
        debug!(expr, start, end, step_s, "range query");
        let body = self.get(QUERY_RANGE_ENDPOINT, &params).await?;
        parse_range_body(&body)
    }

    async fn test_connection(&self) -> bool {
        match self.query_instant("1", None).await {
            Ok(_) => {
                info!(url = %self.base, signed = self.is_signed(), "metrics backend reachable");
                true
            }
            Err(e) => {
                warn!(url = %self.base, error = %e, "metrics backend unreachable");
                false
            }
        }
    }
}

// ============================================================
// Response parsing
// ============================================================

#[derive(Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ApiData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: serde_json::Value,
}

#[derive(Deserialize)]
struct VectorItem {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

#[derive(Deserialize)]
struct MatrixItem {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    values: Vec<(f64, String)>,
}

fn unwrap_envelope(body: &str, endpoint: &'static str) -> Result<ApiData, PromError> {
    let response: ApiResponse =
        serde_json::from_str(body).map_err(|e| PromError::Malformed {
            endpoint,
            detail: e.to_string(),
        })?;
    if response.status != "success" {
        let error = match (response.error_type, response.error) {
            (Some(t), Some(e)) => format!("{t}: {e}"),
            (None, Some(e)) => e,
            (Some(t), None) => t,
            (None, None) => "no error message".to_string(),
        };
        return Err(PromError::Api {
            endpoint,
            status: response.status,
            error,
        });
    }
    response.data.ok_or_else(|| PromError::Malformed {
        endpoint,
        detail: "missing data".to_string(),
    })
}

/// Parses a sample value; non-finite values ("NaN", "+Inf") are dropped.
fn parse_value(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parses an `/api/v1/query` body into samples.
///
/// Vector and scalar results are supported; a scalar becomes one label-less sample.
pub fn parse_instant_body(body: &str) -> Result<Vec<MetricSample>, PromError> {
    let data = unwrap_envelope(body, QUERY_ENDPOINT)?;
    let malformed = |e: serde_json::Error| PromError::Malformed {
        endpoint: QUERY_ENDPOINT,
        detail: e.to_string(),
    };
    match data.result_type.as_str() {
        "vector" => {
            let items: Vec<VectorItem> = serde_json::from_value(data.result).map_err(malformed)?;
            Ok(items
                .into_iter()
                .filter_map(|item| {
                    let (ts, raw) = item.value;
                    parse_value(&raw).map(|value| MetricSample {
                        timestamp: ts,
                        labels: item.metric,
                        value,
                    })
                })
                .collect())
        }
        "scalar" => {
            let (ts, raw): (f64, String) =
                serde_json::from_value(data.result).map_err(malformed)?;
            Ok(parse_value(&raw)
                .map(|value| MetricSample {
                    timestamp: ts,
                    labels: BTreeMap::new(),
                    value,
                })
                .into_iter()
                .collect())
        }
        other => Err(PromError::Malformed {
            endpoint: QUERY_ENDPOINT,
            detail: format!("unexpected result type '{other}'"),
        }),
    }
}

/// Parses an `/api/v1/query_range` body into series.
pub fn parse_range_body(body: &str) -> Result<Vec<RangeSeries>, PromError> {
    let data = unwrap_envelope(body, QUERY_RANGE_ENDPOINT)?;
    if data.result_type != "matrix" {
        return Err(PromError::Malformed {
            endpoint: QUERY_RANGE_ENDPOINT,
            detail: format!("unexpected result type '{}'", data.result_type),
        });
    }
    let items: Vec<MatrixItem> =
        serde_json::from_value(data.result).map_err(|e| PromError::Malformed {
            endpoint: QUERY_RANGE_ENDPOINT,
            detail: e.to_string(),
        })?;
    Ok(items
        .into_iter()
        .map(|item| RangeSeries {
            labels: item.metric,
            points: item
                .values
                .into_iter()
                .filter_map(|(ts, raw)| parse_value(&raw).map(|v| (ts.round() as i64, v)))
                .collect(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vector_result() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[
            {"metric":{"__name__":"up","queryid":"42"},"value":[1700000000.5,"3.25"]},
            {"metric":{"queryid":"7"},"value":[1700000000.5,"NaN"]}
        ]}}"#;
        let samples = parse_instant_body(body).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].label("queryid"), Some("42"));
        assert_eq!(samples[0].value, 3.25);
        assert_eq!(samples[0].timestamp, 1_700_000_000.5);
    }

    #[test]
    fn parses_scalar_result() {
        let body = r#"{"status":"success","data":{"resultType":"scalar","result":[1700000000,"1"]}}"#;
        let samples = parse_instant_body(body).unwrap();
        assert_eq!(samples.len(), 1);
        assert!(samples[0].labels.is_empty());
        assert_eq!(samples[0].value, 1.0);
    }

    #[test]
    fn parses_matrix_result() {
        let body = r#"{"status":"success","data":{"resultType":"matrix","result":[
            {"metric":{"queryid":"1"},"values":[[3600,"1"],[7200,"2"],[10800,"+Inf"]]}
        ]}}"#;
        let series = parse_range_body(body).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].label("queryid"), Some("1"));
        assert_eq!(series[0].points, vec![(3600, 1.0), (7200, 2.0)]);
    }

    #[test]
    fn error_status_is_an_error_not_empty_success() {
        let body = r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#;
        let err = parse_instant_body(body).unwrap_err();
        assert!(matches!(err, PromError::Api { .. }));
        assert!(err.to_string().contains("bad_data: parse error"));
    }

    #[test]
    fn malformed_body_is_an_error() {
        assert!(matches!(
            parse_instant_body("not json"),
            Err(PromError::Malformed { .. })
        ));
        assert!(matches!(
            parse_range_body(r#"{"status":"success"}"#),
            Err(PromError::Malformed { .. })
        ));
    }

    #[test]
    fn range_rejects_vector_result_type() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert!(matches!(
            parse_range_body(body),
            Err(PromError::Malformed { .. })
        ));
    }

    #[test]
    fn endpoint_url_keeps_base_path_and_encodes_params() {
        let client = PromClient::new(&PromConfig::new("http://prom:9090/prometheus")).unwrap();
        let url = client
            .endpoint_url(QUERY_ENDPOINT, &[("query", "up{a=\"b c\"}".to_string())])
            .unwrap();
        assert_eq!(url.path(), "/prometheus/api/v1/query");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs, vec![("query".to_string(), "up{a=\"b c\"}".to_string())]);
    }

    #[test]
    fn invalid_base_url_fails_construction() {
        assert!(matches!(
            PromClient::new(&PromConfig::new("not a url")),
            Err(PromError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn unresolvable_sigv4_credentials_fall_back_to_unsigned() {
        let mut config = PromConfig::new("http://prom:9090");
        config.sigv4 = Some(SigV4Config {
            region: "us-east-1".to_string(),
            service: "aps".to_string(),
            access_key: None,
            secret_key: None,
            session_token: None,
            use_env: false,
        });
        let client = PromClient::new(&config).unwrap();
        assert!(!client.is_signed());
    }

    #[tokio::test]
    async fn unreachable_backend_fails_connection_test() {
        let mut config = PromConfig::new("http://127.0.0.1:1");
        config.timeout = Duration::from_millis(500);
        let client = PromClient::new(&config).unwrap();
        assert!(!client.test_connection().await);
    }
}
