use crate::phase::Phase;

/// Callbacks the surrounding view receives from the coordinator.
pub trait HostView: Send + Sync {
    fn on_progress(&self, phase: Phase, percent: u8);
    fn on_success(&self);
    fn on_error(&self, message: &str);

    /// One-shot cosmetic effect when a report becomes ready.
    fn on_celebrate(&self) {}
}
