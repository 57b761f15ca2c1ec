//! Shape checks for embed URLs returned by the token endpoint.
//!
//! A non-https scheme is fatal. An unexpected host only warns, because provider
//! host lists change faster than allow-lists get updated.

use serde::Serialize;
use url::Url;

pub const DEFAULT_HOST_SUFFIX: &str = "powerbi.com";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UrlMetadata {
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub has_report_id: bool,
    pub has_group_id: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlValidation {
    pub valid: bool,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
    pub metadata: UrlMetadata,
}

impl UrlValidation {
    fn rejected(reason: impl Into<String>, metadata: UrlMetadata) -> Self {
        Self {
            valid: false,
            reasons: vec![reason.into()],
            warnings: Vec::new(),
            metadata,
        }
    }
}

pub fn validate(url: &str) -> UrlValidation {
    validate_with_host(url, DEFAULT_HOST_SUFFIX)
}

pub fn validate_with_host(raw: &str, expected_host_suffix: &str) -> UrlValidation {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return UrlValidation::rejected("embedUrl is empty", UrlMetadata::default());
    }

    let parsed = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(err) => {
            return UrlValidation::rejected(
                format!("embedUrl is not a valid url: {err}"),
                UrlMetadata::default(),
            );
        }
    };

    let metadata = UrlMetadata {
        scheme: Some(parsed.scheme().to_string()),
        host: parsed.host_str().map(str::to_string),
        has_report_id: query_value(&parsed, "reportId").is_some(),
        has_group_id: query_value(&parsed, "groupId").is_some(),
    };

    let mut reasons = Vec::new();
    let mut warnings = Vec::new();

    if parsed.scheme() != "https" {
        let prefix: String = trimmed.chars().take(20).collect();
        reasons.push(format!("embedUrl must use https (got: {prefix})"));
    }

    match metadata.host.as_deref() {
        Some(host) if host_matches(host, expected_host_suffix) => {}
        Some(host) => warnings.push(format!(
            "embedUrl host {host} is outside the expected {expected_host_suffix} domain"
        )),
        None => reasons.push("embedUrl has no host".to_string()),
    }

    if !metadata.has_report_id {
        warnings.push("embedUrl missing reportId parameter".to_string());
    }
    if !metadata.has_group_id {
        warnings.push("embedUrl missing groupId parameter (may be required)".to_string());
    }

    UrlValidation {
        valid: reasons.is_empty(),
        reasons,
        warnings,
        metadata,
    }
}

fn host_matches(host: &str, suffix: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let suffix = suffix.trim_start_matches('.').to_ascii_lowercase();
    if suffix.is_empty() {
        return true;
    }
    host == suffix || host.ends_with(&format!(".{suffix}"))
}

fn query_value(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, value)| key.eq_ignore_ascii_case(name) && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

pub fn extract_report_id(url: &str) -> Option<String> {
    Url::parse(url.trim())
        .ok()
        .and_then(|parsed| query_value(&parsed, "reportId"))
}

pub fn extract_group_id(url: &str) -> Option<String> {
    Url::parse(url.trim())
        .ok()
        .and_then(|parsed| query_value(&parsed, "groupId"))
}
