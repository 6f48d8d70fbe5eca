//! Auto-run scheduler.
//!
//! One spawned task alternates `clock.sleep(interval)` with a synchronous
//! `Engine::step()` under the engine mutex, so ticks never overlap. The
//! sleep races a `watch` stop channel: `pause`, `reset` and remount cut
//! off the next tick at once, while a step that already holds the lock
//! always finishes. Before every step the task also re-checks the engine's
//! run epoch, which catches a pause issued directly on the engine.

use crate::engine::Engine;
use lessonlab_env::{SimClock, SimError, Tick};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Locks the engine. Module panics are caught inside the engine, so a
/// poisoned lock still holds a consistent engine.
pub fn lock(engine: &Mutex<Engine>) -> MutexGuard<'_, Engine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Scheduler<C: SimClock> {
    engine: Arc<Mutex<Engine>>,
    clock: Arc<C>,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl<C: SimClock> Scheduler<C> {
    pub fn new(engine: Engine, clock: Arc<C>) -> Self {
        Self::from_shared(Arc::new(Mutex::new(engine)), clock)
    }

    pub fn from_shared(engine: Arc<Mutex<Engine>>, clock: Arc<C>) -> Self {
        Self {
            engine,
            clock,
            stop_tx: None,
            task: None,
        }
    }

    /// Shared handle for readers (snapshot, log) and manual steps.
    pub fn engine(&self) -> Arc<Mutex<Engine>> {
        Arc::clone(&self.engine)
    }

    pub fn clock(&self) -> &Arc<C> {
        &self.clock
    }

    pub fn mount(&mut self, id: &str) -> Result<(), SimError> {
        self.cancel();
        lock(&self.engine).mount(id)
    }

    /// Manual single step; serialized with auto-run by the engine lock.
    pub fn step(&self) -> Result<(), SimError> {
        lock(&self.engine).step()
    }

    /// Starts auto-run with no tick limit. Returns false when nothing is
    /// mounted.
    pub fn run(&mut self) -> bool {
        self.start(None)
    }

    /// Auto-runs exactly `ticks` more ticks, then pauses itself.
    pub fn run_for(&mut self, ticks: u64) -> bool {
        self.start(Some(ticks))
    }

    pub fn pause(&mut self) {
        lock(&self.engine).pause();
        self.cancel();
    }

    pub fn reset(&mut self) {
        self.cancel();
        lock(&self.engine).reset();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.engine).is_running()
    }

    pub fn tick(&self) -> Tick {
        lock(&self.engine).tick()
    }

    /// Waits for the current auto-run task to end on its own.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.stop_tx = None;
    }

    fn start(&mut self, limit: Option<u64>) -> bool {
        self.cancel();
        let (epoch, interval) = {
            let mut engine = lock(&self.engine);
            match engine.run() {
                Some(epoch) => (epoch, engine.config().tick_interval),
                None => return false,
            }
        };

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let engine = Arc::clone(&self.engine);
        let clock = Arc::clone(&self.clock);
        info!("Auto-run started: interval={:?} limit={:?}", interval, limit);

        self.task = Some(tokio::spawn(async move {
            let mut done = 0u64;
            loop {
                tokio::select! {
                    _ = clock.sleep(interval) => {}
                    _ = stop_rx.changed() => break,
                }

                let keep_going = {
                    let mut engine = lock(&engine);
                    if !engine.is_running() || engine.run_epoch() != epoch {
                        false
                    } else {
                        // failures are already logged and clear `running`
                        let _ = engine.step();
                        done += 1;
                        if limit.map(|l| done >= l).unwrap_or(false) {
                            engine.pause();
                        }
                        engine.is_running()
                    }
                };
                if !keep_going {
                    break;
                }
            }
            debug!("Auto-run task finished after {} ticks", done);
        }));
        self.stop_tx = Some(stop_tx);
        true
    }

    fn cancel(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        // the task exits on its own; a step already in progress completes
        self.task = None;
    }
}

impl<C: SimClock> Drop for Scheduler<C> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VirtualClock;
    use crate::engine::tests::Recorder;
    use crate::engine::EngineConfig;
    use lessonlab_env::TokioClock;
    use std::time::Duration;

    const INTERVAL: Duration = Duration::from_millis(500);

    fn scheduler() -> Scheduler<TokioClock> {
        let engine = Engine::new(EngineConfig::default().with_tick_interval(INTERVAL));
        Scheduler::new(engine, TokioClock::shared())
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_for_stops_itself() {
        let mut scheduler = scheduler();
        scheduler.mount("cpu").unwrap();
        assert!(scheduler.run_for(5));
        scheduler.join().await;

        assert_eq!(scheduler.tick(), 5);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_follow_the_interval() {
        let mut scheduler = scheduler();
        scheduler.mount("bits").unwrap();
        scheduler.run();

        tokio::time::sleep(INTERVAL * 3 + Duration::from_millis(100)).await;
        assert_eq!(scheduler.tick(), 3);
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_cuts_off_next_tick() {
        let mut scheduler = scheduler();
        scheduler.mount("bits").unwrap();
        scheduler.run();

        tokio::time::sleep(INTERVAL * 2 + Duration::from_millis(100)).await;
        scheduler.pause();
        let paused_at = scheduler.tick();

        tokio::time::sleep(INTERVAL * 10).await;
        assert_eq!(scheduler.tick(), paused_at);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_stops_and_rewinds() {
        let mut scheduler = scheduler();
        scheduler.mount("gates").unwrap();
        scheduler.run();

        tokio::time::sleep(INTERVAL * 2 + Duration::from_millis(100)).await;
        scheduler.reset();
        tokio::time::sleep(INTERVAL * 4).await;

        assert_eq!(scheduler.tick(), 0);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_pause_is_honored() {
        let mut scheduler = scheduler();
        scheduler.mount("bits").unwrap();
        scheduler.run();

        tokio::time::sleep(INTERVAL + Duration::from_millis(100)).await;
        lock(&scheduler.engine()).pause();
        tokio::time::sleep(INTERVAL * 4).await;

        assert_eq!(scheduler.tick(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_step_ends_the_run() {
        let mut scheduler = scheduler();
        lock(&scheduler.engine()).mount_module(Box::new(Recorder::new(Some(2))));
        scheduler.run();
        scheduler.join().await;

        assert_eq!(scheduler.tick(), 3);
        assert!(!scheduler.is_running());
        let engine = scheduler.engine();
        assert!(lock(&engine).current_log().iter().any(|e| e.is_violation()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_without_mount() {
        let mut scheduler = scheduler();
        assert!(!scheduler.run());
        scheduler.join().await;
        assert_eq!(scheduler.tick(), 0);
    }

    #[tokio::test]
    async fn test_virtual_clock_fast_forwards() {
        let engine = Engine::new(EngineConfig::default().with_tick_interval(INTERVAL));
        let clock = VirtualClock::shared();
        let mut scheduler = Scheduler::new(engine, Arc::clone(&clock));
        scheduler.mount("consensus").unwrap();

        scheduler.run_for(10);
        scheduler.join().await;

        assert_eq!(scheduler.tick(), 10);
        assert_eq!(clock.now(), INTERVAL * 10);
    }
}
