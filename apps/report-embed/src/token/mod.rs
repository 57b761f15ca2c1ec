pub mod provider;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use provider::{ReqwestTokenProvider, TokenEndpointConfig, TokenFetchError, TokenGrant, TokenProvider};

/// Tokens are treated as expired this long before their real expiry.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Cache key: `reportIdentity:datasetIdentity`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    report: String,
    dataset: String,
}

impl TokenKey {
    pub fn new(report: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            report: report.into(),
            dataset: dataset.into(),
        }
    }

    pub fn report(&self) -> &str {
        &self.report
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.report, self.dataset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedToken {
    pub token: String,
    pub embed_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl CachedToken {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Usable only while `now` is outside the safety margin before expiry.
    pub fn is_usable_at(&self, now: OffsetDateTime, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

/// Short-lived embed tokens for the page session.
///
/// Writes only ever overwrite a key, so concurrent cycles can share one cache
/// without further coordination.
#[derive(Debug)]
pub struct TokenCache {
    safety_margin: Duration,
    entries: RwLock<HashMap<TokenKey, CachedToken>>,
}

impl TokenCache {
    pub fn new(safety_margin: Duration) -> Self {
        Self {
            safety_margin,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    pub fn get_token(&self, key: &TokenKey) -> Option<CachedToken> {
        self.get_token_at(key, OffsetDateTime::now_utc())
    }

    pub fn get_token_at(&self, key: &TokenKey, now: OffsetDateTime) -> Option<CachedToken> {
        self.lookup(key, now, self.safety_margin)
    }

    /// Same as [`TokenCache::get_token`] with a caller-chosen safety margin.
    pub fn get_token_within(&self, key: &TokenKey, margin: Duration) -> Option<CachedToken> {
        self.lookup(key, OffsetDateTime::now_utc(), margin)
    }

    fn lookup(&self, key: &TokenKey, now: OffsetDateTime, margin: Duration) -> Option<CachedToken> {
        let guard = self.entries.read();
        guard
            .get(key)
            .filter(|entry| entry.is_usable_at(now, margin))
            .cloned()
    }

    pub fn store(&self, key: TokenKey, entry: CachedToken) {
        tracing::trace!(
            target: "report_embed::token",
            key = %key,
            expires_at = %entry.expires_at,
            "caching embed token"
        );
        self.entries.write().insert(key, entry);
    }

    pub fn invalidate(&self, key: &TokenKey) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_SAFETY_MARGIN)
    }
}
