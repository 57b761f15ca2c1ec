//! Attachment point between the coordinator and the third-party embedding SDK.
//!
//! The SDK instance is owned by the adapter; containers are passed in per call
//! and never stored, so a reset always operates on what the caller hands over.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// Caller-owned view element the report is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewContainer {
    id: String,
}

impl ViewContainer {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ViewContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportEventKind {
    Loaded,
    Rendered,
    Error,
}

impl ReportEventKind {
    pub const ALL: [ReportEventKind; 3] = [
        ReportEventKind::Loaded,
        ReportEventKind::Rendered,
        ReportEventKind::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReportEventKind::Loaded => "loaded",
            ReportEventKind::Rendered => "rendered",
            ReportEventKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEvent {
    Loaded,
    Rendered,
    Error {
        message: String,
        detail_code: Option<String>,
    },
}

impl ReportEvent {
    pub fn kind(&self) -> ReportEventKind {
        match self {
            ReportEvent::Loaded => ReportEventKind::Loaded,
            ReportEvent::Rendered => ReportEventKind::Rendered,
            ReportEvent::Error { .. } => ReportEventKind::Error,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(ReportEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permissions {
    Read,
    ReadWrite,
    Copy,
    Create,
    #[default]
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayOptions {
    pub filter_pane_enabled: bool,
    pub nav_content_pane_enabled: bool,
    pub status_bar_visible: bool,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            filter_pane_enabled: true,
            nav_content_pane_enabled: true,
            status_bar_visible: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedConfiguration {
    pub report_identity: String,
    pub embed_url: String,
    #[serde(skip_serializing)]
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub token_expires_at: OffsetDateTime,
    pub permissions: Permissions,
    pub display_options: DisplayOptions,
}

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("failed to reset container {container}: {reason}")]
    Reset { container: String, reason: String },
    #[error("failed to embed into container {container}: {reason}")]
    Embed { container: String, reason: String },
}

/// A report instance as the SDK exposes it.
pub trait ReportInstance: Send + Sync {
    fn on(&self, kind: ReportEventKind, handler: EventHandler);
    fn off(&self, kind: ReportEventKind);
}

#[async_trait]
pub trait EmbedSdk: Send + Sync {
    /// Detaches whatever the container currently hosts. Must succeed on an empty container.
    async fn reset(&self, container: &ViewContainer) -> Result<(), SdkError>;

    async fn embed(
        &self,
        container: &ViewContainer,
        config: &EmbedConfiguration,
    ) -> Result<Arc<dyn ReportInstance>, SdkError>;
}

/// Embedded report plus the listeners registered on it.
///
/// Dropping the handle disposes it.
pub struct ReportHandle {
    report: Arc<dyn ReportInstance>,
    report_identity: String,
    subscriptions: Vec<ReportEventKind>,
    disposed: bool,
}

impl ReportHandle {
    fn new(report: Arc<dyn ReportInstance>, report_identity: String) -> Self {
        Self {
            report,
            report_identity,
            subscriptions: Vec::new(),
            disposed: false,
        }
    }

    fn subscribe(&mut self, kind: ReportEventKind, handler: EventHandler) {
        self.report.on(kind, handler);
        self.subscriptions.push(kind);
    }

    pub fn report_identity(&self) -> &str {
        &self.report_identity
    }

    pub fn subscriptions(&self) -> &[ReportEventKind] {
        &self.subscriptions
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Unsubscribes every listener. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        for kind in self.subscriptions.drain(..) {
            self.report.off(kind);
        }
        self.disposed = true;
        tracing::trace!(
            target: "report_embed::adapter",
            report = %self.report_identity,
            "report handle disposed"
        );
    }
}

impl fmt::Debug for ReportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportHandle")
            .field("report_identity", &self.report_identity)
            .field("subscriptions", &self.subscriptions)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Drop for ReportHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[derive(Clone)]
pub struct EmbedTargetAdapter {
    sdk: Arc<dyn EmbedSdk>,
}

impl EmbedTargetAdapter {
    pub fn new(sdk: Arc<dyn EmbedSdk>) -> Self {
        Self { sdk }
    }

    pub async fn reset(&self, container: &ViewContainer) -> Result<(), SdkError> {
        tracing::debug!(
            target: "report_embed::adapter",
            container = %container,
            "resetting embed container"
        );
        self.sdk.reset(container).await
    }

    /// Embeds and subscribes `listener` to every lifecycle event before returning.
    pub async fn embed(
        &self,
        container: &ViewContainer,
        config: &EmbedConfiguration,
        listener: EventHandler,
    ) -> Result<ReportHandle, SdkError> {
        tracing::debug!(
            target: "report_embed::adapter",
            container = %container,
            report = %config.report_identity,
            "embedding report"
        );
        let report = self.sdk.embed(container, config).await?;
        let mut handle = ReportHandle::new(report, config.report_identity.clone());
        for kind in ReportEventKind::ALL {
            handle.subscribe(kind, listener.clone());
        }
        Ok(handle)
    }

    pub fn dispose(&self, handle: &mut ReportHandle) {
        handle.dispose();
    }
}
