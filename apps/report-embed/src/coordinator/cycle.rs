use std::fmt;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::adapter::{ReportEvent, ReportHandle};
use crate::descriptor::DashboardDescriptor;
use crate::phase::Phase;

/// Opaque identity of one embed attempt. Every async continuation carries the
/// id it was started under and is discarded once that id stops being current.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CycleId(String);

impl CycleId {
    pub fn fresh() -> Self {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        Self(format!("{millis}-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) struct Cycle {
    pub id: CycleId,
    pub descriptor: DashboardDescriptor,
    pub phase: Phase,
    pub started_at: Instant,
    pub handle: Option<ReportHandle>,
    /// SDK events that raced ahead of the embed call returning.
    pub early_events: Vec<ReportEvent>,
    /// Set while a backoff delay runs; events and timers of this cycle are ignored.
    pub awaiting_retry: bool,
    render_timer: Option<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
}

impl Cycle {
    pub fn new(descriptor: DashboardDescriptor) -> Self {
        Self {
            id: CycleId::fresh(),
            descriptor,
            phase: Phase::Idle,
            started_at: Instant::now(),
            handle: None,
            early_events: Vec::new(),
            awaiting_retry: false,
            render_timer: None,
            timers: Vec::new(),
        }
    }

    pub fn arm_render_timer(&mut self, timer: Option<JoinHandle<()>>) {
        self.disarm_render_timer();
        self.render_timer = timer;
    }

    pub fn disarm_render_timer(&mut self) {
        if let Some(timer) = self.render_timer.take() {
            timer.abort();
        }
    }

    pub fn track(&mut self, timer: Option<JoinHandle<()>>) {
        self.timers.retain(|timer| !timer.is_finished());
        self.timers.extend(timer);
    }

    /// Disposes the report handle and aborts every timer owned by this cycle.
    pub fn release(&mut self) {
        self.disarm_render_timer();
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        if let Some(mut handle) = self.handle.take() {
            handle.dispose();
        }
        self.early_events.clear();
    }
}

impl Drop for Cycle {
    fn drop(&mut self) {
        self.release();
    }
}
