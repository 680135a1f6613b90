//! AWS SigV4 signing for managed Prometheus endpoints.

use std::time::SystemTime;

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings, sign};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use http::{HeaderName, HeaderValue};
use reqwest::Url;

use super::PromError;

/// SigV4 settings. Credentials are taken from the explicit keys first and
/// then, if `use_env` is set, from `AWS_ACCESS_KEY_ID`,
/// `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`.
#[derive(Debug, Clone)]
pub struct SigV4Config {
    pub region: String,
    /// Signing service name; `aps` for Amazon Managed Service for Prometheus.
    pub service: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub use_env: bool,
}

impl SigV4Config {
    pub fn from_env(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: "aps".to_string(),
            access_key: None,
            secret_key: None,
            session_token: None,
            use_env: true,
        }
    }
}

pub(crate) struct Signer {
    identity: Identity,
    region: String,
    service: String,
}

impl Signer {
    /// Returns `None` when no complete key pair can be resolved.
    pub(crate) fn resolve(config: &SigV4Config) -> Option<Self> {
        let env = |name: &str| {
            if config.use_env {
                std::env::var(name).ok().filter(|v| !v.is_empty())
            } else {
                None
            }
        };
        let access_key = config
            .access_key
            .clone()
            .or_else(|| env("AWS_ACCESS_KEY_ID"))?;
        let secret_key = config
            .secret_key
            .clone()
            .or_else(|| env("AWS_SECRET_ACCESS_KEY"))?;
        let session_token = config
            .session_token
            .clone()
            .or_else(|| env("AWS_SESSION_TOKEN"));

        let identity: Identity =
            Credentials::new(access_key, secret_key, session_token, None, "pgcheckup").into();
        Some(Self {
            identity,
            region: config.region.clone(),
            service: config.service.clone(),
        })
    }

    /// Computes the signing headers for a body-less request to `url`.
    pub(crate) fn sign(
        &self,
        method: &str,
        url: &Url,
    ) -> Result<Vec<(HeaderName, HeaderValue)>, PromError> {
        let signing_params = v4::SigningParams::builder()
            .identity(&self.identity)
            .region(&self.region)
            .name(&self.service)
            .time(SystemTime::now())
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| PromError::Signing(e.to_string()))?
            .into();

        let signable = SignableRequest::new(
            method,
            url.as_str(),
            std::iter::empty::<(&str, &str)>(),
            SignableBody::Bytes(&[]),
        )
        .map_err(|e| PromError::Signing(e.to_string()))?;

        let (instructions, _signature) = sign(signable, &signing_params)
            .map_err(|e| PromError::Signing(e.to_string()))?
            .into_parts();

        let mut request = http::Request::builder()
            .method(method)
            .uri(url.as_str())
            .body(())
            .map_err(|e| PromError::Signing(e.to_string()))?;
        instructions.apply_to_request_http1x(&mut request);

        Ok(request
            .headers()
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect())
    }
}
