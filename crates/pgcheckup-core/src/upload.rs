//! Client for the report ingestion API.
//!
//! A run creates one report (`/rpc/checkup_report_create`) and posts every
//! artifact to it (`/rpc/checkup_report_file_post`). A 404 from either
//! endpoint means the API does not offer uploads; it is logged and the
//! caller carries on.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

const CREATE_ENDPOINT: &str = "rpc/checkup_report_create";
const FILE_POST_ENDPOINT: &str = "rpc/checkup_report_file_post";

/// `check_id` used for per-query documents.
pub const PER_QUERY_CHECK_ID: &str = "per_query";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid upload URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to build upload client: {0}")]
    BuildClient(#[source] reqwest::Error),
    #[error("{endpoint} request failed: {source}")]
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
    #[error("{endpoint} rejected the request: {message}")]
    Rejected {
        endpoint: &'static str,
        message: String,
    },
    #[error("{endpoint} returned an unexpected body: {source}")]
    Malformed {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub api_url: String,
    pub access_token: String,
    pub project: String,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    access_token: &'a str,
    project: &'a str,
    epoch: i64,
}

#[derive(Deserialize)]
struct CreateResponse {
    report_id: i64,
}

#[derive(Serialize)]
struct FilePostRequest<'a> {
    access_token: &'a str,
    checkup_report_id: i64,
    check_id: &'a str,
    filename: &'a str,
    data: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Deserialize, Default)]
struct FilePostResponse {
    message: Option<String>,
}

pub struct UploadClient {
    http: Client,
    base: Url,
    access_token: String,
    project: String,
}

impl UploadClient {
    pub fn new(config: &UploadConfig) -> Result<Self, UploadError> {
        let mut base = Url::parse(&config.api_url).map_err(|source| UploadError::InvalidUrl {
            url: config.api_url.clone(),
            source,
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("pgcheckup/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(UploadError::BuildClient)?;
        Ok(Self {
            http,
            base,
            access_token: config.access_token.clone(),
            project: config.project.clone(),
        })
    }

    /// POSTs `body`; `Ok(None)` on 404.
    async fn post<T: Serialize>(
        &self,
        endpoint: &'static str,
        body: &T,
    ) -> Result<Option<String>, UploadError> {
        let url = self
            .base
            .join(endpoint)
            .map_err(|source| UploadError::InvalidUrl {
                url: format!("{}{}", self.base, endpoint),
                source,
            })?;
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|source| UploadError::Request { endpoint, source })?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            warn!(endpoint, "upload endpoint not available, skipping");
            return Ok(None);
        }
        let text = response
            .text()
            .await
            .map_err(|source| UploadError::Request { endpoint, source })?;
        if !status.is_success() {
            return Err(UploadError::Status {
                endpoint,
                status: status.as_u16(),
                body: crate::fmt::truncate_chars(&text, 512),
            });
        }
        Ok(Some(text))
    }

    /// Creates a report for this run; `None` when uploads are unavailable.
    pub async fn create_report(&self, epoch: i64) -> Result<Option<i64>, UploadError> {
        let request = CreateRequest {
            access_token: &self.access_token,
            project: &self.project,
            epoch,
        };
        let Some(body) = self.post(CREATE_ENDPOINT, &request).await? else {
            return Ok(None);
        };
        let created: CreateResponse = serde_json::from_str(&body).map_err(|source| {
            UploadError::Malformed {
                endpoint: CREATE_ENDPOINT,
                source,
            }
        })?;
        info!(report_id = created.report_id, project = %self.project, "upload report created");
        Ok(Some(created.report_id))
    }

    /// Attaches one JSON artifact to `report_id`. Returns false when uploads
    /// are unavailable.
    pub async fn post_file(
        &self,
        report_id: i64,
        check_id: &str,
        filename: &str,
        data: &str,
    ) -> Result<bool, UploadError> {
        let request = FilePostRequest {
            access_token: &self.access_token,
            checkup_report_id: report_id,
            check_id,
            filename,
            data,
            kind: "json",
        };
        let Some(body) = self.post(FILE_POST_ENDPOINT, &request).await? else {
            return Ok(false);
        };
        let response: FilePostResponse = if body.trim().is_empty() {
            FilePostResponse::default()
        } else {
            serde_json::from_str(&body).map_err(|source| UploadError::Malformed {
                endpoint: FILE_POST_ENDPOINT,
                source,
            })?
        };
        if let Some(message) = response.message {
            return Err(UploadError::Rejected {
                endpoint: FILE_POST_ENDPOINT,
                message,
            });
        }
        debug!(report_id, check_id, filename, "artifact uploaded");
        Ok(true)
    }
}
