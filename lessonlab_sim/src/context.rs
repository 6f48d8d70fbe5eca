//! Virtual clock implementing SimClock for deterministic auto-run.

use async_trait::async_trait;
use lessonlab_env::SimClock;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Clock whose time only moves when someone sleeps on it or advances it.
///
/// A scheduler driven by this clock steps as fast as the runtime allows
/// while still reporting the virtual time each tick would have taken.
/// Clones share the same timeline.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    /// Nanoseconds since the clock was created
    time_ns: Arc<Mutex<u64>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped clock for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn advance(&self, duration: Duration) {
        let mut time = self.time_ns.lock().unwrap_or_else(PoisonError::into_inner);
        *time += duration.as_nanos() as u64;
    }

    pub fn set_time(&self, time_ns: u64) {
        *self.time_ns.lock().unwrap_or_else(PoisonError::into_inner) = time_ns;
    }

    pub fn time_ns(&self) -> u64 {
        *self.time_ns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SimClock for VirtualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        // give a pending stop signal the chance to win the select
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_clock_advances() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);

        clock.advance(Duration::from_secs(1));
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now(), Duration::from_millis(1500));

        clock.set_time(7);
        assert_eq!(clock.time_ns(), 7);
    }

    #[test]
    fn test_clones_share_time() {
        let a = VirtualClock::new();
        let b = a.clone();
        a.advance(Duration::from_secs(5));
        assert_eq!(a.now(), b.now());
    }

    #[tokio::test]
    async fn test_sleep_moves_time_instantly() {
        let clock = VirtualClock::new();
        clock.sleep(Duration::from_secs(3600)).await;
        assert_eq!(clock.now(), Duration::from_secs(3600));
    }
}
