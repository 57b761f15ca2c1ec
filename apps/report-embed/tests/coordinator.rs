use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use report_embed_core::adapter::{
    EmbedConfiguration, EmbedSdk, EventHandler, ReportEvent, ReportEventKind, ReportInstance,
    SdkError, ViewContainer,
};
use report_embed_core::config::{DEFAULT_SETTLE_DELAY, EmbedSettings};
use report_embed_core::debug_log::DebugLogSink;
use report_embed_core::host::HostView;
use report_embed_core::token::{
    CachedToken, TokenCache, TokenFetchError, TokenGrant, TokenKey, TokenProvider,
};
use report_embed_core::{
    CoordinatorHandle, CoordinatorParts, DashboardDescriptor, Phase, SessionCoordinator,
};
use time::OffsetDateTime;
use tokio::time::{Instant, sleep};

#[derive(Clone)]
enum Outcome {
    Render,
    Fail {
        message: &'static str,
        code: Option<&'static str>,
    },
    Silent,
}

#[derive(Default)]
struct FakeReport {
    live: Mutex<HashMap<ReportEventKind, EventHandler>>,
    /// Every handler ever attached, including disposed ones, to replay late SDK events.
    history: Mutex<HashMap<ReportEventKind, EventHandler>>,
}

impl FakeReport {
    fn emit(&self, event: ReportEvent) {
        let handler = self.live.lock().get(&event.kind()).cloned();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn emit_late(&self, event: ReportEvent) {
        let handler = self.history.lock().get(&event.kind()).cloned();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn is_subscribed(&self) -> bool {
        !self.live.lock().is_empty()
    }
}

impl ReportInstance for FakeReport {
    fn on(&self, kind: ReportEventKind, handler: EventHandler) {
        self.live.lock().insert(kind, handler.clone());
        self.history.lock().insert(kind, handler);
    }

    fn off(&self, kind: ReportEventKind) {
        self.live.lock().remove(&kind);
    }
}

struct FakeSdk {
    script: Mutex<VecDeque<Outcome>>,
    embed_delay: Duration,
    embeds: Mutex<Vec<String>>,
    embed_starts: Mutex<Vec<Instant>>,
    reports: Mutex<Vec<Arc<FakeReport>>>,
    resets: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeSdk {
    fn new(script: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            embed_delay: Duration::from_millis(20),
            embeds: Mutex::new(Vec::new()),
            embed_starts: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn push(&self, outcome: Outcome) {
        self.script.lock().push_back(outcome);
    }

    fn embeds(&self) -> Vec<String> {
        self.embeds.lock().clone()
    }

    fn report(&self, index: usize) -> Arc<FakeReport> {
        self.reports.lock()[index].clone()
    }
}

#[async_trait]
impl EmbedSdk for FakeSdk {
    async fn reset(&self, _container: &ViewContainer) -> Result<(), SdkError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(5)).await;
        Ok(())
    }

    async fn embed(
        &self,
        _container: &ViewContainer,
        config: &EmbedConfiguration,
    ) -> Result<Arc<dyn ReportInstance>, SdkError> {
        self.embed_starts.lock().push(Instant::now());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        sleep(self.embed_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.embeds.lock().push(config.report_identity.clone());
        let report = Arc::new(FakeReport::default());
        self.reports.lock().push(report.clone());

        let outcome = self.script.lock().pop_front().unwrap_or(Outcome::Render);
        let emitter = report.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            match outcome {
                Outcome::Render => {
                    emitter.emit(ReportEvent::Loaded);
                    sleep(Duration::from_millis(50)).await;
                    emitter.emit(ReportEvent::Rendered);
                }
                Outcome::Fail { message, code } => emitter.emit(ReportEvent::Error {
                    message: message.to_string(),
                    detail_code: code.map(str::to_string),
                }),
                Outcome::Silent => {}
            }
        });
        Ok(report)
    }
}

enum Answer {
    Grant { expires_in: Duration },
    Hang,
    BadUrl,
}

struct FakeProvider {
    script: Mutex<VecDeque<Answer>>,
    calls: AtomicUsize,
}

impl FakeProvider {
    fn new(script: impl IntoIterator<Item = Answer>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for FakeProvider {
    async fn fetch_token(&self, report: &str, _dataset: &str) -> Result<TokenGrant, TokenFetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self.script.lock().pop_front().unwrap_or(Answer::Grant {
            expires_in: Duration::from_millis(3_600_000),
        });
        match answer {
            Answer::Grant { expires_in } => Ok(TokenGrant {
                token: "t1".into(),
                embed_url: format!("https://provider.example/reportEmbed?reportId={report}"),
                expires_in,
            }),
            Answer::BadUrl => Ok(TokenGrant {
                token: "t1".into(),
                embed_url: format!("http://app.powerbi.com/reportEmbed?reportId={report}"),
                expires_in: Duration::from_secs(3600),
            }),
            Answer::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct RecordingHost {
    progress: Mutex<Vec<(Phase, u8)>>,
    successes: AtomicUsize,
    celebrations: AtomicUsize,
    errors: Mutex<Vec<String>>,
    failed_at: Mutex<Vec<Instant>>,
}

impl RecordingHost {
    fn phases(&self) -> Vec<Phase> {
        let mut phases: Vec<Phase> = Vec::new();
        for (phase, _) in self.progress.lock().iter() {
            if phases.last() != Some(phase) {
                phases.push(*phase);
            }
        }
        phases
    }

    fn count(&self, phase: Phase) -> usize {
        self.phases().iter().filter(|p| **p == phase).count()
    }

    fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl HostView for RecordingHost {
    fn on_progress(&self, phase: Phase, percent: u8) {
        self.progress.lock().push((phase, percent));
    }

    fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
        self.failed_at.lock().push(Instant::now());
    }

    fn on_celebrate(&self) {
        self.celebrations.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    handle: CoordinatorHandle,
    sdk: Arc<FakeSdk>,
    provider: Arc<FakeProvider>,
    host: Arc<RecordingHost>,
    cache: Arc<TokenCache>,
    log: Arc<DebugLogSink>,
}

impl Harness {
    fn start(sdk: Arc<FakeSdk>, provider: Arc<FakeProvider>) -> Self {
        Self::start_with_cache(sdk, provider, Arc::new(TokenCache::default()))
    }

    fn start_with_cache(
        sdk: Arc<FakeSdk>,
        provider: Arc<FakeProvider>,
        cache: Arc<TokenCache>,
    ) -> Self {
        let mut parts = Self::parts(EmbedSettings::default(), &sdk, &provider);
        parts.token_cache = cache;
        Self::spawn(parts, sdk, provider)
    }

    fn parts(
        settings: EmbedSettings,
        sdk: &Arc<FakeSdk>,
        provider: &Arc<FakeProvider>,
    ) -> CoordinatorParts {
        CoordinatorParts::new(
            settings,
            sdk.clone(),
            ViewContainer::new("bi-embed"),
            provider.clone(),
            Arc::new(RecordingHost::default()),
        )
    }

    /// Replaces the host and debug log in `parts` with recording ones.
    fn spawn(mut parts: CoordinatorParts, sdk: Arc<FakeSdk>, provider: Arc<FakeProvider>) -> Self {
        let host = Arc::new(RecordingHost::default());
        let log = Arc::new(DebugLogSink::default());
        parts.host = host.clone();
        parts = parts.with_debug_log(log.clone());
        let cache = parts.token_cache.clone();
        let handle = SessionCoordinator::spawn(parts);
        Self {
            handle,
            sdk,
            provider,
            host,
            cache,
            log,
        }
    }

    async fn wait_for(&self, target: Phase) {
        let mut phases = self.handle.subscribe_phase();
        tokio::time::timeout(Duration::from_secs(600), phases.wait_for(|p| *p == target))
            .await
            .expect("phase not reached in time")
            .expect("coordinator stopped");
    }

    async fn wait_for_successes(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(600);
        while self.host.successes() < count {
            assert!(Instant::now() < deadline, "only {} successes", self.host.successes());
            sleep(Duration::from_millis(50)).await;
        }
    }
}

fn r1() -> DashboardDescriptor {
    DashboardDescriptor::new("r1", "Revenue", "R1", "D1")
}

fn dashboard(n: usize) -> DashboardDescriptor {
    DashboardDescriptor::new(format!("r{n}"), format!("Report {n}"), format!("R{n}"), "D1")
}

#[tokio::test(start_paused = true)]
async fn happy_path_emits_phases_in_order() {
    let h = Harness::start(FakeSdk::new([]), FakeProvider::new([]));

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Ready).await;

    assert_eq!(
        h.host.phases(),
        vec![
            Phase::Preparing,
            Phase::Authenticating,
            Phase::Validating,
            Phase::Configuring,
            Phase::Rendering,
            Phase::Ready,
        ]
    );
    let percents: Vec<u8> = h.host.progress.lock().iter().map(|(_, p)| *p).collect();
    assert_eq!(percents, vec![10, 25, 40, 55, 70, 85, 100]);
    assert_eq!(h.host.successes(), 1);
    assert_eq!(h.host.celebrations.load(Ordering::SeqCst), 1);
    assert!(h.host.errors().is_empty());
    assert_eq!(h.log.count_containing("TokenFetchFailed"), 0);
    assert_eq!(h.handle.phase(), Phase::Ready);
}

#[tokio::test(start_paused = true)]
async fn token_timeouts_are_retried_with_backoff() {
    let provider = FakeProvider::new([Answer::Hang, Answer::Hang]);
    let h = Harness::start(FakeSdk::new([]), provider);
    let started = Instant::now();

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Ready).await;

    assert_eq!(h.host.count(Phase::Authenticating), 3);
    assert_eq!(h.host.successes(), 1);
    assert_eq!(h.provider.calls(), 3);
    assert!(started.elapsed() >= Duration::from_millis(1000 + 2000));
    assert_eq!(h.log.count_containing("TokenFetchFailed"), 2);
}

#[tokio::test(start_paused = true)]
async fn render_errors_stop_after_max_attempts() {
    let fail = Outcome::Fail {
        message: "visual crashed",
        code: None,
    };
    let sdk = FakeSdk::new([fail.clone(), fail.clone(), fail]);
    let h = Harness::start(sdk, FakeProvider::new([]));

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Error).await;
    sleep(Duration::from_secs(60)).await;

    assert_eq!(h.sdk.embeds().len(), 3);
    assert_eq!(h.host.errors().len(), 1);
    assert!(h.host.errors()[0].contains("visual crashed"));
    assert_eq!(h.host.successes(), 0);
    assert_eq!(h.handle.phase(), Phase::Error);
    assert_eq!(h.log.count_containing("retry 1/2"), 1);
    assert_eq!(h.log.count_containing("retry 2/2"), 1);
    assert!((0..3).all(|i| !h.sdk.report(i).is_subscribed()));
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_embed_one_at_a_time_in_order() {
    let h = Harness::start(FakeSdk::new([]), FakeProvider::new([]));

    for n in 1..=4 {
        h.handle.switch_report(dashboard(n)).unwrap();
    }
    h.wait_for_successes(4).await;

    assert_eq!(h.sdk.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.sdk.embeds(), vec!["R1", "R2", "R3", "R4"]);
    assert_eq!(h.sdk.resets.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn events_from_superseded_cycle_are_ignored() {
    let sdk = FakeSdk::new([
        Outcome::Fail {
            message: "transient",
            code: None,
        },
        Outcome::Silent,
    ]);
    let h = Harness::start(sdk, FakeProvider::new([]));

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Rendering).await;
    // First attempt fails and is retried; wait for the second embed to settle.
    while h.sdk.embeds().len() < 2 {
        sleep(Duration::from_millis(50)).await;
    }
    sleep(Duration::from_millis(10)).await;
    assert_eq!(h.handle.phase(), Phase::Rendering);

    let stale = h.sdk.report(0);
    assert!(!stale.is_subscribed());
    stale.emit_late(ReportEvent::Rendered);
    stale.emit_late(ReportEvent::Error {
        message: "late failure".into(),
        detail_code: None,
    });
    sleep(Duration::from_millis(10)).await;

    assert_eq!(h.handle.phase(), Phase::Rendering);
    assert_eq!(h.host.successes(), 0);
    assert!(h.host.errors().is_empty());
    assert_eq!(h.log.count_containing("late failure"), 1);
}

#[tokio::test(start_paused = true)]
async fn cached_token_outside_margin_skips_fetch() {
    let cache = Arc::new(TokenCache::default());
    cache.store(
        TokenKey::new("R1", "D1"),
        CachedToken {
            token: "cached".into(),
            embed_url: "https://app.powerbi.com/reportEmbed?reportId=R1".into(),
            expires_at: OffsetDateTime::now_utc() + time::Duration::minutes(10),
        },
    );
    let h = Harness::start_with_cache(FakeSdk::new([]), FakeProvider::new([]), cache);

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Ready).await;

    assert_eq!(h.provider.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cached_token_inside_margin_is_refreshed() {
    let cache = Arc::new(TokenCache::default());
    let key = TokenKey::new("R1", "D1");
    cache.store(
        key.clone(),
        CachedToken {
            token: "stale".into(),
            embed_url: "https://app.powerbi.com/reportEmbed?reportId=R1".into(),
            expires_at: OffsetDateTime::now_utc() + time::Duration::minutes(4),
        },
    );
    let h = Harness::start_with_cache(FakeSdk::new([]), FakeProvider::new([]), cache);

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Ready).await;

    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.cache.get_token(&key).map(|t| t.token), Some("t1".to_string()));
}

#[tokio::test(start_paused = true)]
async fn insecure_embed_url_fails_without_retry() {
    let h = Harness::start(FakeSdk::new([]), FakeProvider::new([Answer::BadUrl]));

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Error).await;
    sleep(Duration::from_secs(30)).await;

    assert_eq!(h.provider.calls(), 1);
    assert!(h.sdk.embeds().is_empty());
    assert_eq!(h.host.errors().len(), 1);
    assert!(h.host.errors()[0].contains("invalid embed configuration"));
    assert_eq!(h.log.count_containing("InvalidConfiguration"), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_rendered_event_times_out() {
    let sdk = FakeSdk::new([Outcome::Silent, Outcome::Silent, Outcome::Silent]);
    let h = Harness::start(sdk, FakeProvider::new([]));
    let started = Instant::now();

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Error).await;

    assert!(started.elapsed() >= Duration::from_secs(3 * 30 + 3));
    assert_eq!(h.sdk.embeds().len(), 3);
    assert!(h.host.errors()[0].contains("did not render"));
    assert_eq!(h.log.count_containing("RenderTimeout"), 3);
}

#[tokio::test(start_paused = true)]
async fn permission_errors_surface_immediately() {
    let sdk = FakeSdk::new([Outcome::Fail {
        message: "Access denied",
        code: Some("Forbidden"),
    }]);
    let h = Harness::start(sdk, FakeProvider::new([]));

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Error).await;
    sleep(Duration::from_secs(30)).await;

    assert_eq!(h.sdk.embeds().len(), 1);
    assert_eq!(h.host.errors().len(), 1);
    assert_eq!(h.log.count_containing("PermissionDenied"), 1);
}

#[tokio::test(start_paused = true)]
async fn error_percent_keeps_last_progress() {
    let sdk = FakeSdk::new([Outcome::Fail {
        message: "Access denied",
        code: Some("Forbidden"),
    }]);
    let h = Harness::start(sdk, FakeProvider::new([]));

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Error).await;

    let last = h.host.progress.lock().last().copied();
    assert_eq!(last, Some((Phase::Error, 70)));
}

#[tokio::test(start_paused = true)]
async fn retry_after_error_starts_a_fresh_budget() {
    let sdk = FakeSdk::new([Outcome::Fail {
        message: "Access denied",
        code: Some("Forbidden"),
    }]);
    let h = Harness::start(sdk, FakeProvider::new([]));

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Error).await;

    h.sdk.push(Outcome::Render);
    h.handle.retry().unwrap();
    h.wait_for(Phase::Ready).await;

    assert_eq!(h.sdk.embeds().len(), 2);
    assert_eq!(h.host.successes(), 1);
    assert_eq!(h.host.errors().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_without_selection_is_ignored() {
    let h = Harness::start(FakeSdk::new([]), FakeProvider::new([]));

    h.handle.retry().unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(h.handle.phase(), Phase::Idle);
    assert!(h.sdk.embeds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reloading_the_embedded_report_skips_reset() {
    let h = Harness::start(FakeSdk::new([]), FakeProvider::new([]));

    h.handle.switch_report(r1()).unwrap();
    h.wait_for_successes(1).await;
    h.handle.switch_report(r1()).unwrap();
    h.wait_for_successes(2).await;

    assert_eq!(h.sdk.resets.load(Ordering::SeqCst), 1);
    assert_eq!(h.provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_token_error_refetches() {
    let sdk = FakeSdk::new([
        Outcome::Fail {
            message: "token expired",
            code: Some("TokenExpired"),
        },
        Outcome::Render,
    ]);
    let h = Harness::start(sdk, FakeProvider::new([]));

    h.handle.switch_report(r1()).unwrap();
    h.wait_for_successes(1).await;

    assert_eq!(h.provider.calls(), 2);
    assert_eq!(h.sdk.embeds().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn teardown_drops_queue_and_ignores_late_events() {
    let sdk = FakeSdk::new([Outcome::Silent]);
    let h = Harness::start(sdk, FakeProvider::new([]));

    h.handle.switch_report(r1()).unwrap();
    h.handle.switch_report(dashboard(2)).unwrap();
    h.wait_for(Phase::Rendering).await;
    sleep(Duration::from_millis(200)).await;

    h.handle.teardown().unwrap();
    h.wait_for(Phase::Idle).await;
    h.sdk.report(0).emit_late(ReportEvent::Rendered);
    sleep(Duration::from_secs(60)).await;

    assert_eq!(h.handle.phase(), Phase::Idle);
    assert_eq!(h.sdk.embeds(), vec!["R1"]);
    assert_eq!(h.host.successes(), 0);
    assert!(h.host.errors().is_empty());
    assert!(!h.sdk.report(0).is_subscribed());
    assert_eq!(h.host.progress.lock().last().copied(), Some((Phase::Idle, 0)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_accepting_commands() {
    let h = Harness::start(FakeSdk::new([]), FakeProvider::new([]));

    h.handle.shutdown().await.unwrap();

    assert!(h.handle.switch_report(r1()).is_err());
}

#[tokio::test(start_paused = true)]
async fn reselecting_after_error_restores_retry_budget() {
    let fail = Outcome::Fail {
        message: "visual crashed",
        code: None,
    };
    let sdk = FakeSdk::new([fail.clone(), fail.clone(), fail.clone()]);
    let h = Harness::start(sdk, FakeProvider::new([]));

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Error).await;
    assert_eq!(h.sdk.embeds().len(), 3);

    h.sdk.push(fail);
    h.sdk.push(Outcome::Render);
    h.handle.switch_report(r1()).unwrap();
    h.wait_for_successes(1).await;

    assert_eq!(h.sdk.embeds().len(), 5);
    assert_eq!(h.host.errors().len(), 1);
    assert_eq!(h.handle.phase(), Phase::Ready);
}

#[tokio::test(start_paused = true)]
async fn queued_duplicate_gets_its_own_retry_budget() {
    let fail = Outcome::Fail {
        message: "visual crashed",
        code: None,
    };
    let sdk = FakeSdk::new([
        fail.clone(),
        fail.clone(),
        fail.clone(),
        fail,
        Outcome::Render,
    ]);
    let h = Harness::start(sdk, FakeProvider::new([]));

    h.handle.switch_report(r1()).unwrap();
    h.handle.switch_report(r1()).unwrap();
    h.wait_for_successes(1).await;

    assert_eq!(h.sdk.embeds().len(), 5);
    assert_eq!(h.host.errors().len(), 1);
    assert_eq!(h.handle.phase(), Phase::Ready);
}

#[tokio::test(start_paused = true)]
async fn queued_start_drains_after_error_and_settle_delay() {
    let sdk = FakeSdk::new([Outcome::Fail {
        message: "Access denied",
        code: Some("Forbidden"),
    }]);
    let h = Harness::start(sdk, FakeProvider::new([]));

    h.handle.switch_report(r1()).unwrap();
    h.handle.switch_report(dashboard(2)).unwrap();
    h.wait_for_successes(1).await;

    assert_eq!(h.sdk.embeds(), vec!["R1", "R2"]);
    assert_eq!(h.host.errors().len(), 1);
    assert_eq!(h.handle.phase(), Phase::Ready);
    let failed_at = h.host.failed_at.lock()[0];
    let second_embed = h.sdk.embed_starts.lock()[1];
    assert!(second_embed.duration_since(failed_at) >= DEFAULT_SETTLE_DELAY);
}

#[tokio::test(start_paused = true)]
async fn configured_safety_margin_governs_token_reuse() {
    let sdk = FakeSdk::new([]);
    let provider = FakeProvider::new([]);
    let settings = EmbedSettings {
        safety_margin: Duration::from_secs(20 * 60),
        ..EmbedSettings::default()
    };
    let parts = Harness::parts(settings, &sdk, &provider);
    assert_eq!(parts.token_cache.safety_margin(), Duration::from_secs(20 * 60));
    parts.token_cache.store(
        TokenKey::new("R1", "D1"),
        CachedToken {
            token: "cached".into(),
            embed_url: "https://app.powerbi.com/reportEmbed?reportId=R1".into(),
            expires_at: OffsetDateTime::now_utc() + time::Duration::minutes(10),
        },
    );
    let h = Harness::spawn(parts, sdk, provider);

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Ready).await;

    assert_eq!(h.provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn configured_margin_applies_to_a_shared_cache() {
    let cache = Arc::new(TokenCache::default());
    cache.store(
        TokenKey::new("R1", "D1"),
        CachedToken {
            token: "cached".into(),
            embed_url: "https://app.powerbi.com/reportEmbed?reportId=R1".into(),
            expires_at: OffsetDateTime::now_utc() + time::Duration::minutes(10),
        },
    );
    let sdk = FakeSdk::new([]);
    let provider = FakeProvider::new([]);
    let settings = EmbedSettings {
        safety_margin: Duration::from_secs(20 * 60),
        ..EmbedSettings::default()
    };
    let mut parts = Harness::parts(settings, &sdk, &provider);
    parts.token_cache = cache;
    let h = Harness::spawn(parts, sdk, provider);

    h.handle.switch_report(r1()).unwrap();
    h.wait_for(Phase::Ready).await;

    assert_eq!(h.provider.calls(), 1);
}
