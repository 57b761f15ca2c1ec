use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::token::provider::TokenFetchError;

/// SDK detail codes that mean the viewer lacks access rather than a transient fault.
const PERMISSION_CODES: &[&str] = &["forbidden", "unauthorized", "permissiondenied"];

pub const TOKEN_EXPIRED_CODE: &str = "TokenExpired";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    TokenFetchFailed,
    InvalidConfiguration,
    RenderTimeout,
    SdkRenderError,
    PermissionDenied,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TokenFetchFailed => "TokenFetchFailed",
            ErrorKind::InvalidConfiguration => "InvalidConfiguration",
            ErrorKind::RenderTimeout => "RenderTimeout",
            ErrorKind::SdkRenderError => "SdkRenderError",
            ErrorKind::PermissionDenied => "PermissionDenied",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("failed to obtain embed token: {0}")]
    TokenFetchFailed(#[source] TokenFetchError),
    #[error("invalid embed configuration: {}", .0.join("; "))]
    InvalidConfiguration(Vec<String>),
    #[error("report did not render within {0:?}")]
    RenderTimeout(Duration),
    #[error("report failed to render: {message}")]
    SdkRenderError {
        message: String,
        detail_code: Option<String>,
    },
    #[error("report access denied: {message}")]
    PermissionDenied { message: String },
}

impl EmbedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmbedError::TokenFetchFailed(_) => ErrorKind::TokenFetchFailed,
            EmbedError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            EmbedError::RenderTimeout(_) => ErrorKind::RenderTimeout,
            EmbedError::SdkRenderError { .. } => ErrorKind::SdkRenderError,
            EmbedError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
        }
    }

    /// Configuration and access problems cannot correct themselves between attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TokenFetchFailed | ErrorKind::RenderTimeout | ErrorKind::SdkRenderError
        )
    }

    /// Classifies an SDK `error` event.
    pub fn from_report_event(message: &str, detail_code: Option<&str>) -> Self {
        let normalized = |value: &str| {
            value
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase()
        };
        let by_code = detail_code
            .map(|code| PERMISSION_CODES.contains(&normalized(code).as_str()))
            .unwrap_or(false);
        let lowered = normalized(message);
        let by_message = PERMISSION_CODES.iter().any(|code| lowered.contains(code));
        if by_code || by_message {
            return EmbedError::PermissionDenied {
                message: message.to_string(),
            };
        }
        EmbedError::SdkRenderError {
            message: message.to_string(),
            detail_code: detail_code.map(str::to_string),
        }
    }

    /// True for SDK errors reporting that the access token was rejected as expired.
    pub fn is_token_expiry(&self) -> bool {
        matches!(
            self,
            EmbedError::SdkRenderError { detail_code: Some(code), .. } if code == TOKEN_EXPIRED_CODE
        )
    }
}
