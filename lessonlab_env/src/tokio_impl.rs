//! Wall-clock pacing for auto-run.

use crate::SimClock;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// `SimClock` over Tokio's timer wheel, so a paused test runtime pauses it too.
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    /// A clock starting now, ready to hand to a `Scheduler`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self { origin: Instant::now() })
    }
}

#[async_trait]
impl SimClock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_moves_now_by_interval() {
        let clock = TokioClock::shared();
        for _ in 0..4 {
            clock.sleep(Duration::from_millis(250)).await;
        }
        assert_eq!(clock.now(), Duration::from_secs(1));
    }
}
