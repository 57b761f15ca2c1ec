use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

use super::CachedToken;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Lifetime assumed when the endpoint omits `expiresInMs`.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60);

#[derive(Error, Debug)]
pub enum TokenFetchError {
    #[error("invalid token endpoint configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("token endpoint did not answer within {0:?}")]
    Timeout(Duration),
}

/// A freshly issued token, before it is placed in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    pub embed_url: String,
    pub expires_in: Duration,
}

impl TokenGrant {
    pub fn into_cached(self, issued_at: OffsetDateTime) -> CachedToken {
        CachedToken {
            token: self.token,
            embed_url: self.embed_url,
            expires_at: issued_at + self.expires_in,
        }
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self, report: &str, dataset: &str) -> Result<TokenGrant, TokenFetchError>;
}

#[derive(Clone, Debug)]
pub struct TokenEndpointConfig {
    base_url: Url,
    bearer_token: Option<String>,
    timeout: Duration,
}

impl TokenEndpointConfig {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, TokenFetchError> {
        let mut base = base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(TokenFetchError::InvalidConfig(
                "token endpoint base url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            base = format!("{}{base}", infer_scheme(&base));
        }
        let parsed = Url::parse(&base).map_err(|err| {
            TokenFetchError::InvalidConfig(format!("invalid token endpoint url: {err}"))
        })?;
        if parsed.cannot_be_a_base() {
            return Err(TokenFetchError::InvalidConfig(format!(
                "token endpoint url {parsed} cannot carry a path"
            )));
        }
        Ok(Self {
            base_url: parsed,
            bearer_token: None,
            timeout: DEFAULT_FETCH_TIMEOUT,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `{base}/embed-token/{report}?datasetId={dataset}` with each part escaped.
    pub fn endpoint_for(&self, report: &str, dataset: &str) -> Result<Url, TokenFetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                TokenFetchError::InvalidConfig(format!(
                    "token endpoint url {} cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .push("embed-token")
            .push(report);
        url.query_pairs_mut().append_pair("datasetId", dataset);
        Ok(url)
    }
}

/// Loopback and private ranges default to plain http, everything else to https.
fn infer_scheme(base: &str) -> &'static str {
    let host = base
        .split(['/', ':'])
        .next()
        .unwrap_or(base)
        .to_ascii_lowercase();
    let private_172 = host
        .strip_prefix("172.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|octet| octet.parse::<u8>().ok())
        .map(|octet| (16..32).contains(&octet))
        .unwrap_or(false);
    if host == "localhost"
        || host == "0.0.0.0"
        || host.starts_with("127.")
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || private_172
    {
        "http://"
    } else {
        "https://"
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmbedTokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    embed_url: Option<String>,
    #[serde(default)]
    expires_in_ms: Option<u64>,
}

impl EmbedTokenResponse {
    fn into_grant(self) -> Result<TokenGrant, TokenFetchError> {
        let token = self
            .token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| TokenFetchError::InvalidResponse("missing token".into()))?;
        let embed_url = self
            .embed_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| TokenFetchError::InvalidResponse("missing embedUrl".into()))?;
        let expires_in = self
            .expires_in_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        Ok(TokenGrant {
            token,
            embed_url,
            expires_in,
        })
    }
}

pub struct ReqwestTokenProvider {
    client: reqwest::Client,
    config: TokenEndpointConfig,
}

impl ReqwestTokenProvider {
    pub fn new(config: TokenEndpointConfig) -> Result<Self, TokenFetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(config.timeout())
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TokenEndpointConfig {
        &self.config
    }
}

#[async_trait]
impl TokenProvider for ReqwestTokenProvider {
    async fn fetch_token(&self, report: &str, dataset: &str) -> Result<TokenGrant, TokenFetchError> {
        let endpoint = self.config.endpoint_for(report, dataset)?;
        let mut builder = self.client.get(endpoint);
        if let Some(token) = self.config.bearer_token() {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        if response.status() != StatusCode::OK {
            tracing::debug!(
                target: "report_embed::token",
                report = %report,
                status = %response.status(),
                "token endpoint rejected request"
            );
            return Err(TokenFetchError::HttpStatus(response.status()));
        }
        let body = response.json::<EmbedTokenResponse>().await?;
        body.into_grant()
    }
}
