//! Embed session state machine.
//!
//! A single task owns all coordinator state. Callers talk to it through a
//! [`CoordinatorHandle`]; async work (container reset, token fetch, embed,
//! timers, SDK callbacks) reports back as continuations tagged with the
//! [`CycleId`] it was started under. A continuation whose cycle is no longer
//! current is logged and dropped, so a superseded attempt can never move the
//! view.

mod cycle;

pub use cycle::CycleId;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::adapter::{
    EmbedConfiguration, EmbedSdk, EmbedTargetAdapter, EventHandler, ReportEvent, ReportHandle,
    SdkError, ViewContainer,
};
use crate::config::EmbedSettings;
use crate::debug_log::{DebugLogSink, Severity};
use crate::descriptor::DashboardDescriptor;
use crate::error::EmbedError;
use crate::host::HostView;
use crate::phase::{LOADED_PERCENT, Phase};
use crate::retry::RetryState;
use crate::token::{CachedToken, TokenCache, TokenFetchError, TokenProvider};
use crate::url_check;
use cycle::Cycle;

/// Everything the coordinator needs from its surroundings.
pub struct CoordinatorParts {
    pub settings: EmbedSettings,
    pub sdk: Arc<dyn EmbedSdk>,
    pub container: ViewContainer,
    pub token_provider: Arc<dyn TokenProvider>,
    pub token_cache: Arc<TokenCache>,
    pub host: Arc<dyn HostView>,
    pub debug_log: Option<Arc<DebugLogSink>>,
}

impl CoordinatorParts {
    /// Parts with a fresh token cache using the configured safety margin and no debug log.
    pub fn new(
        settings: EmbedSettings,
        sdk: Arc<dyn EmbedSdk>,
        container: ViewContainer,
        token_provider: Arc<dyn TokenProvider>,
        host: Arc<dyn HostView>,
    ) -> Self {
        let token_cache = Arc::new(TokenCache::new(settings.safety_margin));
        Self {
            settings,
            sdk,
            container,
            token_provider,
            token_cache,
            host,
            debug_log: None,
        }
    }

    pub fn with_debug_log(mut self, sink: Arc<DebugLogSink>) -> Self {
        self.debug_log = Some(sink);
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("session coordinator has stopped")]
    Stopped,
}

enum Command {
    SwitchReport(DashboardDescriptor),
    Retry,
    Teardown,
    Shutdown(oneshot::Sender<()>),
}

enum Continuation {
    ResetFinished {
        cycle: CycleId,
        result: Result<(), SdkError>,
    },
    TokenFetched {
        cycle: CycleId,
        result: Result<CachedToken, TokenFetchError>,
    },
    Embedded {
        cycle: CycleId,
        result: Result<ReportHandle, SdkError>,
    },
    Report {
        cycle: CycleId,
        event: ReportEvent,
    },
    RenderTimedOut {
        cycle: CycleId,
    },
    RetryDue {
        cycle: CycleId,
    },
    Drain {
        cycle: CycleId,
    },
}

/// Container operations; at most one runs at a time.
enum AdapterOp {
    Reset,
    Embed(EmbedConfiguration),
}


/// Cloneable front end of a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<Phase>,
}

impl CoordinatorHandle {
    /// Starts embedding `descriptor`, or queues it behind the cycle in flight.
    pub fn switch_report(&self, descriptor: DashboardDescriptor) -> Result<(), CoordinatorError> {
        self.send(Command::SwitchReport(descriptor))
    }

    /// Restarts the last requested dashboard with a fresh retry budget.
    pub fn retry(&self) -> Result<(), CoordinatorError> {
        self.send(Command::Retry)
    }

    /// Invalidates the current cycle, drops queued requests and returns to idle.
    pub fn teardown(&self) -> Result<(), CoordinatorError> {
        self.send(Command::Teardown)
    }

    /// Tears down and waits for the coordinator task to exit.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Command::Shutdown(ack_tx))?;
        ack_rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    fn send(&self, command: Command) -> Result<(), CoordinatorError> {
        self.commands
            .send(command)
            .map_err(|_| CoordinatorError::Stopped)
    }
}

pub struct SessionCoordinator {
    settings: EmbedSettings,
    adapter: EmbedTargetAdapter,
    container: ViewContainer,
    token_provider: Arc<dyn TokenProvider>,
    token_cache: Arc<TokenCache>,
    host: Arc<dyn HostView>,
    debug_log: Option<Arc<DebugLogSink>>,
    continuations: mpsc::UnboundedSender<Continuation>,
    phase_tx: watch::Sender<Phase>,
    current: Option<Cycle>,
    queue: VecDeque<DashboardDescriptor>,
    retry: RetryState,
    last_requested: Option<DashboardDescriptor>,
    /// Report identity currently attached to the container, if any.
    last_embedded: Option<String>,
    last_percent: u8,
    adapter_busy: bool,
    deferred_op: Option<(CycleId, AdapterOp)>,
}

impl SessionCoordinator {
    /// Spawns the coordinator task on the current Tokio runtime.
    pub fn spawn(parts: CoordinatorParts) -> CoordinatorHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (continuation_tx, continuation_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);

        let coordinator = SessionCoordinator {
            settings: parts.settings,
            adapter: EmbedTargetAdapter::new(parts.sdk),
            container: parts.container,
            token_provider: parts.token_provider,
            token_cache: parts.token_cache,
            host: parts.host,
            debug_log: parts.debug_log,
            continuations: continuation_tx,
            phase_tx,
            current: None,
            queue: VecDeque::new(),
            retry: RetryState::default(),
            last_requested: None,
            last_embedded: None,
            last_percent: 0,
            adapter_busy: false,
            deferred_op: None,
        };
        tokio::spawn(coordinator.run(command_rx, continuation_rx));

        CoordinatorHandle {
            commands: command_tx,
            phase: phase_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut continuations: mpsc::UnboundedReceiver<Continuation>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.teardown();
                        break;
                    };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(continuation) = continuations.recv() => {
                    self.handle_continuation(continuation);
                }
            }
        }
        tracing::debug!(target: "report_embed::coordinator", "coordinator stopped");
    }

    /// Returns false once the coordinator should stop.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::SwitchReport(descriptor) => {
                self.last_requested = Some(descriptor.clone());
                self.request_start(descriptor);
            }
            Command::Retry => match self.last_requested.clone() {
                Some(descriptor) => self.request_start(descriptor),
                None => self.note(Severity::Warn, "retry requested before any dashboard"),
            },
            Command::Teardown => self.teardown(),
            Command::Shutdown(ack) => {
                self.teardown();
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn handle_continuation(&mut self, continuation: Continuation) {
        match continuation {
            Continuation::ResetFinished { cycle, result } => {
                self.release_adapter();
                if !self.is_live(&cycle) {
                    self.drop_stale(&cycle, "container reset");
                    return;
                }
                match result {
                    Ok(()) => self.enter_authenticating(),
                    Err(err) => self.fail(EmbedError::SdkRenderError {
                        message: err.to_string(),
                        detail_code: None,
                    }),
                }
            }
            Continuation::TokenFetched { cycle, result } => {
                if !self.is_live(&cycle) {
                    self.drop_stale(&cycle, "token response");
                    return;
                }
                match result {
                    Ok(token) => self.enter_validating(token),
                    Err(err) => self.fail(EmbedError::TokenFetchFailed(err)),
                }
            }
            Continuation::Embedded { cycle, result } => {
                if !self.is_live(&cycle) {
                    // Disposes a stale handle before the next container op starts.
                    drop(result);
                    self.drop_stale(&cycle, "embed result");
                    self.release_adapter();
                    return;
                }
                self.release_adapter();
                match result {
                    Ok(handle) => self.enter_rendering(handle),
                    Err(err) => self.fail(EmbedError::SdkRenderError {
                        message: err.to_string(),
                        detail_code: None,
                    }),
                }
            }
            Continuation::Report { cycle, event } => self.on_report_event(cycle, event),
            Continuation::RenderTimedOut { cycle } => {
                if !self.is_live(&cycle) {
                    self.drop_stale(&cycle, "render timeout");
                    return;
                }
                if self.current_phase() == Some(Phase::Rendering) {
                    self.fail(EmbedError::RenderTimeout(self.settings.render_timeout));
                }
            }
            Continuation::RetryDue { cycle } => {
                if !self.owns(&cycle) {
                    self.drop_stale(&cycle, "retry timer");
                    return;
                }
                let Some(descriptor) = self.current.as_ref().map(|c| c.descriptor.clone()) else {
                    return;
                };
                self.note(
                    Severity::Info,
                    format!(
                        "retrying {} (attempt {} of {})",
                        descriptor.id,
                        self.retry.attempt,
                        self.settings.retry.max_attempts
                    ),
                );
                self.begin_cycle(descriptor);
            }
            Continuation::Drain { cycle } => {
                let settled = self.owns(&cycle)
                    && self.current_phase().map(Phase::is_terminal).unwrap_or(false);
                if !settled {
                    return;
                }
                if let Some(next) = self.queue.pop_front() {
                    self.note(
                        Severity::Info,
                        format!(
                            "starting queued dashboard {} ({} still waiting)",
                            next.id,
                            self.queue.len()
                        ),
                    );
                    self.launch(next);
                }
            }
        }
    }

    fn request_start(&mut self, descriptor: DashboardDescriptor) {
        let busy = self
            .current_phase()
            .map(Phase::is_in_flight)
            .unwrap_or(false)
            || self.current.as_ref().map(|c| c.awaiting_retry).unwrap_or(false);
        if busy || !self.queue.is_empty() {
            self.note(
                Severity::Info,
                format!(
                    "queued dashboard {} behind the active cycle ({} waiting)",
                    descriptor.id,
                    self.queue.len() + 1
                ),
            );
            self.queue.push_back(descriptor);
            return;
        }
        self.launch(descriptor);
    }

    /// Starts a caller-requested cycle. Every switch or retry gets the full retry budget;
    /// backoff restarts go through `begin_cycle` directly and keep the count.
    fn launch(&mut self, descriptor: DashboardDescriptor) {
        self.retry.reset();
        self.begin_cycle(descriptor);
    }

    fn begin_cycle(&mut self, descriptor: DashboardDescriptor) {
        if let Some(previous) = self.current.as_ref() {
            let message = format!("superseding cycle {}", previous.id);
            self.note(Severity::Debug, message);
        }
        // Dropping the old cycle disposes its handle and aborts its timers.
        self.current = None;

        let needs_reset =
            self.last_embedded.as_deref() != Some(descriptor.report_identity.as_str());
        let message = format!(
            "embedding {} ({}) report={}",
            descriptor.title, descriptor.id, descriptor.report_identity
        );
        self.current = Some(Cycle::new(descriptor));
        self.set_phase(Phase::Preparing);
        self.note(Severity::Info, message);

        if needs_reset {
            self.last_embedded = None;
            self.run_adapter_op(AdapterOp::Reset);
        } else {
            self.enter_authenticating();
        }
    }

    fn enter_authenticating(&mut self) {
        self.set_phase(Phase::Authenticating);
        let Some(key) = self.current.as_ref().map(|c| c.descriptor.token_key()) else {
            return;
        };
        // A shared cache may carry another margin; the configured one decides here.
        if let Some(token) = self
            .token_cache
            .get_token_within(&key, self.settings.safety_margin)
        {
            self.note(Severity::Debug, format!("token cache hit for {key}"));
            self.enter_validating(token);
            return;
        }
        self.note(Severity::Debug, format!("token cache miss for {key}; fetching"));

        let Some(cycle) = self.current_id() else {
            return;
        };
        let provider = self.token_provider.clone();
        let cache = self.token_cache.clone();
        let fetch_timeout = self.settings.fetch_timeout;
        let tx = self.continuations.clone();
        let task = tokio::spawn(async move {
            let fetched = tokio::time::timeout(
                fetch_timeout,
                provider.fetch_token(key.report(), key.dataset()),
            )
            .await;
            let result = match fetched {
                Ok(Ok(grant)) => {
                    let token = grant.into_cached(OffsetDateTime::now_utc());
                    cache.store(key, token.clone());
                    Ok(token)
                }
                Ok(Err(err)) => Err(err),
                Err(_) => Err(TokenFetchError::Timeout(fetch_timeout)),
            };
            let _ = tx.send(Continuation::TokenFetched { cycle, result });
        });
        if let Some(current) = self.current.as_mut() {
            current.track(Some(task));
        }
    }

    fn enter_validating(&mut self, token: CachedToken) {
        self.set_phase(Phase::Validating);
        let validation =
            url_check::validate_with_host(&token.embed_url, &self.settings.expected_host_suffix);
        for warning in &validation.warnings {
            self.note(Severity::Warn, format!("embed url: {warning}"));
        }
        if !validation.valid {
            self.fail(EmbedError::InvalidConfiguration(validation.reasons));
            return;
        }
        self.enter_configuring(token);
    }

    fn enter_configuring(&mut self, token: CachedToken) {
        self.set_phase(Phase::Configuring);
        let Some(report_identity) = self
            .current
            .as_ref()
            .map(|c| c.descriptor.report_identity.clone())
        else {
            return;
        };
        let config = EmbedConfiguration {
            report_identity,
            embed_url: token.embed_url,
            token: token.token,
            token_expires_at: token.expires_at,
            permissions: self.settings.permissions,
            display_options: self.settings.display_options.clone(),
        };
        self.run_adapter_op(AdapterOp::Embed(config));
    }

    fn enter_rendering(&mut self, handle: ReportHandle) {
        let timer = self.schedule(self.settings.render_timeout, |cycle| {
            Continuation::RenderTimedOut { cycle }
        });
        let Some(current) = self.current.as_mut() else {
            return;
        };
        current.handle = Some(handle);
        current.arm_render_timer(timer);
        let early = std::mem::take(&mut current.early_events);
        self.set_phase(Phase::Rendering);

        for event in early {
            if self.current_phase() != Some(Phase::Rendering) {
                break;
            }
            self.apply_report_event(event);
        }
    }

    fn enter_ready(&mut self) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        current.disarm_render_timer();
        let elapsed = current.started_at.elapsed();
        self.last_embedded = Some(current.descriptor.report_identity.clone());
        self.retry.reset();
        self.set_phase(Phase::Ready);
        self.note(Severity::Info, format!("report ready after {elapsed:?}"));
        self.host.on_success();
        self.host.on_celebrate();
        self.schedule_drain();
    }

    fn on_report_event(&mut self, cycle: CycleId, event: ReportEvent) {
        if !self.is_live(&cycle) {
            match &event {
                ReportEvent::Error { message, .. } => self.note(
                    Severity::Warn,
                    format!("ignored error from superseded cycle {cycle}: {message}"),
                ),
                other => self.drop_stale(&cycle, other.kind().as_str()),
            }
            return;
        }
        match self.current_phase() {
            Some(Phase::Configuring) => {
                if let Some(current) = self.current.as_mut() {
                    current.early_events.push(event);
                }
            }
            Some(Phase::Rendering) => self.apply_report_event(event),
            Some(phase) => self.note(
                Severity::Debug,
                format!("{} event ignored in phase {phase}", event.kind().as_str()),
            ),
            None => {}
        }
    }

    fn apply_report_event(&mut self, event: ReportEvent) {
        match event {
            ReportEvent::Loaded => {
                self.note(Severity::Info, "report loaded");
                self.last_percent = LOADED_PERCENT;
                self.host.on_progress(Phase::Rendering, LOADED_PERCENT);
            }
            ReportEvent::Rendered => self.enter_ready(),
            ReportEvent::Error {
                message,
                detail_code,
            } => {
                let err = EmbedError::from_report_event(&message, detail_code.as_deref());
                if err.is_token_expiry() {
                    if let Some(key) = self.current.as_ref().map(|c| c.descriptor.token_key()) {
                        self.token_cache.invalidate(&key);
                        self.note(Severity::Debug, format!("dropped expired token for {key}"));
                    }
                }
                self.fail(err);
            }
        }
    }

    fn fail(&mut self, err: EmbedError) {
        let kind = err.kind();
        let message = err.to_string();
        let Some(current) = self.current.as_mut() else {
            return;
        };
        current.disarm_render_timer();
        if let Some(mut handle) = current.handle.take() {
            self.adapter.dispose(&mut handle);
        }
        self.last_embedded = None;

        let policy = self.settings.retry;
        if err.is_retryable() && policy.should_retry(self.retry.attempt) {
            let attempt = self.retry.record_retry();
            let delay = policy.next_delay(attempt);
            self.note(
                Severity::Warn,
                format!(
                    "{kind}: {message}; retry {attempt}/{} in {delay:?}",
                    policy.max_attempts
                ),
            );
            let timer = self.schedule(delay, |cycle| Continuation::RetryDue { cycle });
            if let Some(current) = self.current.as_mut() {
                current.awaiting_retry = true;
                current.track(timer);
            }
            return;
        }

        self.note(Severity::Error, format!("{kind}: {message}"));
        self.set_phase(Phase::Error);
        self.host.on_error(&message);
        self.schedule_drain();
    }

    fn teardown(&mut self) {
        if let Some(current) = self.current.as_ref() {
            let message = format!("view torn down; invalidating cycle {}", current.id);
            self.note(Severity::Info, message);
        }
        let was_idle = self.current.is_none();
        self.current = None;
        self.queue.clear();
        self.deferred_op = None;
        self.last_embedded = None;
        self.last_percent = 0;
        self.phase_tx.send_replace(Phase::Idle);
        if !was_idle {
            self.host.on_progress(Phase::Idle, 0);
        }
    }

    fn run_adapter_op(&mut self, op: AdapterOp) {
        let Some(cycle) = self.current_id() else {
            return;
        };
        if self.adapter_busy {
            self.note(
                Severity::Debug,
                "container busy with a superseded operation; deferring",
            );
            self.deferred_op = Some((cycle, op));
            return;
        }
        self.adapter_busy = true;

        let adapter = self.adapter.clone();
        let container = self.container.clone();
        let tx = self.continuations.clone();
        match op {
            AdapterOp::Reset => {
                tokio::spawn(async move {
                    let result = adapter.reset(&container).await;
                    let _ = tx.send(Continuation::ResetFinished { cycle, result });
                });
            }
            AdapterOp::Embed(config) => {
                let listener: EventHandler = {
                    let tx = tx.clone();
                    let cycle = cycle.clone();
                    Arc::new(move |event| {
                        let _ = tx.send(Continuation::Report {
                            cycle: cycle.clone(),
                            event,
                        });
                    })
                };
                tokio::spawn(async move {
                    let result = adapter.embed(&container, &config, listener).await;
                    let _ = tx.send(Continuation::Embedded { cycle, result });
                });
            }
        }
    }

    fn release_adapter(&mut self) {
        self.adapter_busy = false;
        if let Some((cycle, op)) = self.deferred_op.take() {
            if self.owns(&cycle) {
                self.run_adapter_op(op);
            }
        }
    }

    fn schedule_drain(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let timer = self.schedule(self.settings.settle_delay, |cycle| Continuation::Drain {
            cycle,
        });
        if let Some(current) = self.current.as_mut() {
            current.track(timer);
        }
    }

    fn schedule<F>(&self, delay: Duration, make: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce(CycleId) -> Continuation + Send + 'static,
    {
        let cycle = self.current_id()?;
        let tx = self.continuations.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(make(cycle));
        }))
    }

    fn set_phase(&mut self, phase: Phase) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        current.phase = phase;
        let percent = phase.percent().unwrap_or(self.last_percent);
        self.last_percent = percent;
        self.phase_tx.send_replace(phase);
        self.host.on_progress(phase, percent);
        self.note(Severity::Debug, format!("phase {phase} ({percent}%)"));
    }

    fn current_id(&self) -> Option<CycleId> {
        self.current.as_ref().map(|c| c.id.clone())
    }

    fn current_phase(&self) -> Option<Phase> {
        self.current.as_ref().map(|c| c.phase)
    }

    /// Current cycle and not parked on a backoff delay.
    fn is_live(&self, cycle: &CycleId) -> bool {
        self.current
            .as_ref()
            .map(|c| &c.id == cycle && !c.awaiting_retry)
            .unwrap_or(false)
    }

    fn owns(&self, cycle: &CycleId) -> bool {
        self.current
            .as_ref()
            .map(|c| &c.id == cycle)
            .unwrap_or(false)
    }

    fn drop_stale(&self, cycle: &CycleId, what: &str) {
        self.note(
            Severity::Debug,
            format!("ignored {what} from superseded cycle {cycle}"),
        );
    }

    fn note(&self, level: Severity, message: impl Into<String>) {
        let message = message.into();
        let phase = self.current_phase();
        let cycle = self.current.as_ref().map(|c| c.id.as_str());
        match level {
            Severity::Error => {
                tracing::error!(target: "report_embed::coordinator", cycle, ?phase, "{message}")
            }
            Severity::Warn => {
                tracing::warn!(target: "report_embed::coordinator", cycle, ?phase, "{message}")
            }
            Severity::Info => {
                tracing::info!(target: "report_embed::coordinator", cycle, ?phase, "{message}")
            }
            Severity::Debug => {
                tracing::debug!(target: "report_embed::coordinator", cycle, ?phase, "{message}")
            }
        }
        if let Some(sink) = &self.debug_log {
            sink.record(level, message, phase, cycle);
        }
    }
}
