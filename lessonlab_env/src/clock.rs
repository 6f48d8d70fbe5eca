//! Clock abstraction driving the auto-run scheduler.

use async_trait::async_trait;
use std::time::Duration;

/// The time source behind auto-run.
///
/// This trait abstracts the "real world" so that the scheduler can pace
/// ticks against wall-clock time in production and against a virtual clock
/// in deterministic tests.
///
/// # Implementations
///
/// - **Production**: `TokioClock` - wraps `tokio::time`
/// - **Simulation**: `VirtualClock` (in `lessonlab_sim`) - sleeping advances
///   a virtual counter and yields
#[async_trait]
pub trait SimClock: Send + Sync + 'static {
    /// Returns the current monotonic time since clock creation.
    fn now(&self) -> Duration;

    /// Suspends the calling task for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);
}
