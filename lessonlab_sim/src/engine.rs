//! Engine - owns the single mounted module, the tick counter and the log.

use lessonlab_core::{ActionSpec, EventLog, Journal, Module, ModuleError, ModuleSummary, Registry, Snapshot};
use lessonlab_core::DEFAULT_LOG_CAPACITY;
use lessonlab_env::{EntrySource, LogEntry, Severity, SimError, Tick};
use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for an engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Master seed handed to every module the engine creates
    pub seed: u64,

    /// Event log capacity
    pub log_capacity: usize,

    /// Auto-run pacing
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            log_capacity: DEFAULT_LOG_CAPACITY,
            tick_interval: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

/// The simulation engine.
///
/// At most one module is mounted. `tick` resets to 0 exactly on mount and
/// reset and otherwise only grows. Nothing a module does, panics included,
/// escapes this type: failures become `[contract]` log lines and stop
/// auto-run.
pub struct Engine {
    config: EngineConfig,
    registry: Registry,
    mounted: Option<Box<dyn Module>>,
    tick: Tick,
    running: bool,

    /// Bumped whenever a run ends so a stale auto-run loop can tell
    run_epoch: u64,

    log: EventLog,
    snapshot: Option<Snapshot>,
}

impl Engine {
    /// Creates an engine over the built-in lesson registry.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_registry(config, Registry::standard())
    }

    pub fn with_registry(config: EngineConfig, registry: Registry) -> Self {
        let log = EventLog::new(config.log_capacity);
        Self {
            config,
            registry,
            mounted: None,
            tick: 0,
            running: false,
            run_epoch: 0,
            log,
            snapshot: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Modules available in `category`, in listing order.
    pub fn list_modules(&self, category: &str) -> Vec<ModuleSummary> {
        self.registry.list(category)
    }

    /// Mounts a registered module by id.
    ///
    /// An unknown id is logged as a contract violation and leaves the
    /// current mount untouched.
    pub fn mount(&mut self, id: &str) -> Result<(), SimError> {
        match self.registry.create(id, self.config.seed) {
            Ok(module) => {
                self.mount_module(module);
                Ok(())
            }
            Err(e) => {
                self.violation(format!("mount({}): {}", id, e));
                Err(e)
            }
        }
    }

    /// Mounts an already-built module, discarding the previous one.
    pub fn mount_module(&mut self, module: Box<dyn Module>) {
        self.stop();
        if let Some(old) = self.mounted.take() {
            debug!("Unmounting {}", old.descriptor().id);
        }

        let descriptor = module.descriptor();
        self.mounted = Some(module);
        self.tick = 0;
        self.log.clear();
        self.snapshot = None;

        if self.initialize() {
            self.log.record(0, Severity::Info, format!("mounted {}", descriptor.title));
        }
        info!("Mounted {} (seed={})", descriptor.id, self.config.seed);
    }

    /// Id of the mounted module.
    pub fn mounted_id(&self) -> Option<&'static str> {
        self.mounted.as_ref().map(|m| m.descriptor().id)
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    /// Advances the mounted module by one tick.
    ///
    /// Every error returned here has already been written to the log.
    pub fn step(&mut self) -> Result<(), SimError> {
        let tick = self.tick;
        let mut journal = Journal::new(tick);
        let outcome = match self.mounted.as_mut() {
            Some(module) => guard(|| module.transition(tick, &mut journal)),
            None => {
                self.violation("step() with no module mounted");
                return Err(SimError::NotMounted);
            }
        };

        // the tick is consumed even when the transition is rolled back
        self.tick += 1;

        match outcome {
            Ok(Ok(())) => {
                self.log.extend(journal.into_entries());
                self.refresh()?;
                debug!("Tick {} complete", tick);
                Ok(())
            }
            Ok(Err(e)) => {
                self.log_at(tick, format!("transition failed at tick {}: {}", tick, e));
                Err(e.into())
            }
            Err(panic) => {
                self.log_at(tick, format!("module panicked at tick {}: {}", tick, panic));
                Err(SimError::ModulePanicked(panic))
            }
        }
    }

    /// Marks auto-run as started. Returns the run's epoch, or `None` when
    /// nothing is mounted.
    ///
    /// The engine never advances on its own: ticks come from
    /// [`Scheduler`](crate::Scheduler), which calls [`Engine::step`] on its
    /// interval for as long as the epoch returned here stays current.
    pub fn run(&mut self) -> Option<u64> {
        if self.mounted.is_none() {
            self.violation("run() with no module mounted");
            return None;
        }
        if !self.running {
            self.running = true;
            self.run_epoch += 1;
            debug!("Auto-run started (epoch {})", self.run_epoch);
        }
        Some(self.run_epoch)
    }

    /// Stops auto-run before the next scheduled tick.
    pub fn pause(&mut self) {
        if self.running {
            debug!("Auto-run paused at tick {}", self.tick);
        }
        self.stop();
    }

    /// Pauses, then re-initializes the same module in place.
    pub fn reset(&mut self) {
        self.stop();
        if self.mounted.is_none() {
            self.violation("reset() with no module mounted");
            return;
        }
        self.tick = 0;
        self.log.clear();
        if self.initialize() {
            self.log.record(0, Severity::Info, "reset");
        }
        info!("Reset {}", self.mounted_id().unwrap_or("module"));
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn run_epoch(&self) -> u64 {
        self.run_epoch
    }

    /// Snapshot after the last successful init, step or action.
    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Retained log lines, oldest first.
    pub fn current_log(&self) -> Vec<LogEntry> {
        self.log.to_vec()
    }

    pub fn available_faults(&self) -> Vec<ActionSpec> {
        self.mounted.as_ref().map(|m| m.faults()).unwrap_or_default()
    }

    pub fn available_controls(&self) -> Vec<ActionSpec> {
        self.mounted.as_ref().map(|m| m.controls()).unwrap_or_default()
    }

    /// Applies a named fault; writes exactly one `fault` line either way.
    pub fn invoke_fault(&mut self, name: &str) -> Result<(), SimError> {
        self.apply(name, true)
    }

    /// Applies a named control; writes one `info` line on success.
    pub fn invoke_control(&mut self, name: &str) -> Result<(), SimError> {
        self.apply(name, false)
    }

    fn apply(&mut self, name: &str, fault: bool) -> Result<(), SimError> {
        let tick = self.tick;
        let outcome = match self.mounted.as_mut() {
            Some(module) if fault => guard(|| module.inject(name, tick)),
            Some(module) => guard(|| module.control(name, tick)),
            None => {
                self.violation(format!("action {} with no module mounted", name));
                return Err(SimError::NotMounted);
            }
        };

        match outcome {
            Ok(Ok(description)) => {
                let entry = if fault {
                    LogEntry::new(tick, Severity::Fault, EntrySource::Fault, description)
                } else {
                    LogEntry::new(tick, Severity::Info, EntrySource::Control, description)
                };
                debug!("{} {} at tick {}", if fault { "Fault" } else { "Control" }, name, tick);
                self.log.push(entry);
                self.refresh()
            }
            Ok(Err(ModuleError::UnknownAction(_))) => {
                self.violation(format!("unknown action {}", name));
                Err(SimError::UnknownAction(name.to_string()))
            }
            Ok(Err(e)) => {
                self.violation(format!("action {} failed: {}", name, e));
                Err(e.into())
            }
            Err(panic) => {
                self.violation(format!("action {} panicked: {}", name, panic));
                Err(SimError::ModulePanicked(panic))
            }
        }
    }

    /// Runs `init` on the mounted module and refreshes the snapshot.
    fn initialize(&mut self) -> bool {
        let outcome = match self.mounted.as_mut() {
            Some(module) => guard(|| module.init()),
            None => return false,
        };
        match outcome {
            Ok(Ok(_)) => self.refresh().is_ok(),
            Ok(Err(e)) => {
                self.violation(format!("init failed: {}", e));
                false
            }
            Err(panic) => {
                self.violation(format!("init panicked: {}", panic));
                false
            }
        }
    }

    /// Re-reads the module snapshot and checks that it serializes.
    ///
    /// On failure the previous snapshot is kept and the error is logged.
    fn refresh(&mut self) -> Result<(), SimError> {
        let outcome = match self.mounted.as_ref() {
            Some(module) => guard(|| module.snapshot()),
            None => {
                self.snapshot = None;
                return Err(SimError::NotMounted);
            }
        };
        match outcome.map_err(SimError::ModulePanicked).and_then(|s| s.to_json().map(|_| s)) {
            Ok(snapshot) => {
                self.snapshot = Some(snapshot);
                Ok(())
            }
            Err(e) => {
                self.violation(format!("snapshot rejected: {}", e));
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        if self.running {
            self.running = false;
            self.run_epoch += 1;
        }
    }

    fn violation(&mut self, message: impl Display) {
        let tick = self.tick;
        self.log_at(tick, message);
    }

    fn log_at(&mut self, tick: Tick, message: impl Display) {
        warn!("Contract violation at tick {}: {}", tick, message);
        self.log.push(LogEntry::violation(tick, message));
        self.stop();
    }
}

/// Runs module code, turning a panic into its message.
fn guard<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lessonlab_core::modules::bits::{BitsConfig, BitsMachine};
    use lessonlab_core::{Instance, ModuleDescriptor};
    use std::sync::{Arc, Mutex};

    /// Wraps the bits lesson, recording every tick it is handed and
    /// panicking on one chosen tick.
    pub(crate) struct Recorder {
        inner: Instance<BitsMachine>,
        pub ticks: Arc<Mutex<Vec<Tick>>>,
        panic_at: Option<Tick>,

        /// Snapshots panic once more than this many ticks were handed out
        snapshot_limit: Option<usize>,
    }

    impl Recorder {
        pub(crate) fn new(panic_at: Option<Tick>) -> Self {
            Self {
                inner: Instance::new(BitsMachine::new(BitsConfig::default()), 1),
                ticks: Arc::new(Mutex::new(Vec::new())),
                panic_at,
                snapshot_limit: None,
            }
        }

        fn with_snapshot_limit(mut self, ticks: usize) -> Self {
            self.snapshot_limit = Some(ticks);
            self
        }
    }

    impl Module for Recorder {
        fn descriptor(&self) -> ModuleDescriptor {
            ModuleDescriptor {
                id: "recorder",
                title: "Recorder",
                category: "test",
            }
        }

        fn init(&mut self) -> Result<Snapshot, ModuleError> {
            self.inner.init()
        }

        fn transition(&mut self, tick: Tick, journal: &mut Journal) -> Result<(), ModuleError> {
            self.ticks.lock().unwrap().push(tick);
            if self.panic_at == Some(tick) {
                panic!("recorder exploded");
            }
            self.inner.transition(tick, journal)
        }

        fn snapshot(&self) -> Snapshot {
            let seen = self.ticks.lock().unwrap().len();
            if self.snapshot_limit.is_some_and(|limit| seen > limit) {
                panic!("snapshot unavailable after {} ticks", seen);
            }
            self.inner.snapshot()
        }
    }

    fn engine() -> Engine {
        Engine::new(EngineConfig::default())
    }

    #[test]
    fn test_mount_starts_at_tick_zero() {
        let mut engine = engine();
        engine.mount("cpu").unwrap();

        assert_eq!(engine.tick(), 0);
        assert_eq!(engine.mounted_id(), Some("cpu"));
        assert_eq!(engine.current_log().len(), 1);
        assert_eq!(engine.current_snapshot().map(|s| s.kind()), Some("cpu"));
    }

    #[test]
    fn test_step_stamps_log_with_tick() {
        let mut engine = engine();
        engine.mount("gates").unwrap();
        for _ in 0..3 {
            engine.step().unwrap();
        }

        assert_eq!(engine.tick(), 3);
        let ticks: Vec<Tick> = engine
            .current_log()
            .iter()
            .filter(|e| e.source == EntrySource::Transition)
            .map(|e| e.tick)
            .collect();
        assert_eq!(ticks, vec![0, 1, 2]);
    }

    #[test]
    fn test_ticks_handed_out_without_gaps() {
        let mut engine = engine();
        let recorder = Recorder::new(None);
        let seen = Arc::clone(&recorder.ticks);
        engine.mount_module(Box::new(recorder));

        for _ in 0..5 {
            engine.step().unwrap();
        }
        engine.reset();
        for _ in 0..3 {
            engine.step().unwrap();
        }

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4, 0, 1, 2]);
    }

    #[test]
    fn test_remount_leaves_old_module_alone() {
        let mut engine = engine();
        let recorder = Recorder::new(None);
        let seen = Arc::clone(&recorder.ticks);
        engine.mount_module(Box::new(recorder));
        engine.step().unwrap();

        engine.mount("bits").unwrap();
        engine.step().unwrap();
        engine.invoke_fault("flip_random_bit").unwrap();
        engine.step().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0]);
        assert_eq!(engine.tick(), 2);
    }

    #[test]
    fn test_step_without_mount_is_logged() {
        let mut engine = engine();
        assert!(matches!(engine.step(), Err(SimError::NotMounted)));

        let log = engine.current_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].is_violation());
        assert!(log[0].message.starts_with(LogEntry::VIOLATION_MARKER));
        assert_eq!(engine.tick(), 0);
    }

    #[test]
    fn test_unknown_module_keeps_current_mount() {
        let mut engine = engine();
        engine.mount("bits").unwrap();
        assert!(engine.mount("warp_drive").is_err());

        assert_eq!(engine.mounted_id(), Some("bits"));
        assert!(engine.current_log().last().map(|e| e.is_violation()).unwrap_or(false));
    }

    #[test]
    fn test_panicking_module_is_contained() {
        let mut engine = engine();
        engine.mount_module(Box::new(Recorder::new(Some(2))));
        engine.run();

        engine.step().unwrap();
        engine.step().unwrap();
        let before = engine.current_snapshot().cloned();
        assert!(matches!(engine.step(), Err(SimError::ModulePanicked(_))));

        assert!(!engine.is_running());
        assert_eq!(engine.tick(), 3);
        assert_eq!(engine.current_snapshot().cloned(), before);
        let violations: Vec<LogEntry> = engine.current_log().into_iter().filter(|e| e.is_violation()).collect();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].tick, 2);

        engine.reset();
        assert_eq!(engine.tick(), 0);
        engine.step().unwrap();
    }

    #[test]
    fn test_failed_refresh_is_returned() {
        let mut engine = engine();
        engine.mount_module(Box::new(Recorder::new(None).with_snapshot_limit(2)));
        engine.run();
        engine.step().unwrap();
        engine.step().unwrap();
        let before = engine.current_snapshot().cloned();

        assert!(matches!(engine.step(), Err(SimError::ModulePanicked(_))));
        assert_eq!(engine.tick(), 3);
        assert!(!engine.is_running());
        assert_eq!(engine.current_snapshot().cloned(), before);
        let last = engine.current_log().pop().unwrap();
        assert!(last.is_violation());
        assert!(last.message.contains("snapshot rejected"));
    }

    #[test]
    fn test_run_alone_does_not_advance() {
        let mut engine = engine();
        engine.mount("gates").unwrap();
        assert_eq!(engine.run(), Some(1));
        assert_eq!(engine.run(), Some(1));

        assert!(engine.is_running());
        assert_eq!(engine.tick(), 0);
        engine.pause();
        assert!(!engine.is_running());
        assert_eq!(engine.run_epoch(), 2);
    }

    #[test]
    fn test_fault_writes_one_fault_line() {
        let mut engine = engine();
        engine.mount("consensus").unwrap();
        engine.step().unwrap();
        let written = engine.log().written();

        engine.invoke_fault("partition_node_4").unwrap();
        let fresh = engine.log().since(written);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].severity, Severity::Fault);
        assert!(fresh[0].is_injected_fault());
        assert_eq!(fresh[0].tick, 1);
        assert_eq!(engine.tick(), 1);
    }

    #[test]
    fn test_unknown_fault_is_violation() {
        let mut engine = engine();
        engine.mount("cpu").unwrap();
        assert!(matches!(engine.invoke_fault("melt"), Err(SimError::UnknownAction(_))));
        assert!(engine.current_log().last().map(|e| e.is_violation()).unwrap_or(false));
    }

    #[test]
    fn test_control_is_not_a_fault() {
        let mut engine = engine();
        engine.mount("bits").unwrap();
        engine.invoke_control("flip_bit_0").unwrap();

        let last = engine.current_log().pop().unwrap();
        assert_eq!(last.severity, Severity::Info);
        assert_eq!(last.source, EntrySource::Control);
        assert!(engine.available_controls().iter().all(|c| !c.kind.is_fault()));
    }

    #[test]
    fn test_every_fault_leaves_a_steppable_state() {
        let registry = Registry::standard();
        for id in registry.ids() {
            let mut engine = engine();
            engine.mount(id).unwrap();
            for fault in engine.available_faults() {
                engine.reset();
                engine.step().unwrap();
                engine.step().unwrap();
                engine.invoke_fault(&fault.name).unwrap();

                let snapshot = engine.current_snapshot().unwrap();
                assert!(snapshot.to_json().is_ok(), "{}::{}", id, fault.name);
                engine.step().unwrap();
                engine.invoke_fault(&fault.name).unwrap();
                engine.step().unwrap();
                assert!(
                    engine.current_log().iter().all(|e| !e.is_violation()),
                    "{}::{} produced a violation",
                    id,
                    fault.name
                );
            }
        }
    }

    #[test]
    fn test_reset_replays_identically() {
        let mut engine = engine();
        engine.mount("consensus").unwrap();

        let script = |engine: &mut Engine| -> Vec<String> {
            let mut out = Vec::new();
            for i in 0..25 {
                if i == 5 {
                    engine.invoke_fault("crash_leader").unwrap();
                }
                engine.step().unwrap();
                out.push(engine.current_snapshot().unwrap().to_json_string().unwrap());
            }
            out
        };

        let first = script(&mut engine);
        engine.reset();
        let second = script(&mut engine);
        assert_eq!(first, second);
    }

    #[test]
    fn test_log_stays_bounded() {
        let mut engine = Engine::new(EngineConfig::default().with_log_capacity(5));
        engine.mount("cpu").unwrap();
        for _ in 0..40 {
            engine.step().unwrap();
        }
        assert_eq!(engine.current_log().len(), 5);
        assert_eq!(engine.current_log().last().map(|e| e.tick), Some(39));
    }

    #[test]
    fn test_pause_and_reset_end_the_run() {
        let mut engine = engine();
        assert_eq!(engine.run(), None);

        engine.mount("bits").unwrap();
        let epoch = engine.run().unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.run(), Some(epoch));

        engine.pause();
        assert!(!engine.is_running());
        assert_ne!(engine.run_epoch(), epoch);

        engine.run();
        engine.reset();
        assert!(!engine.is_running());
        assert_eq!(engine.tick(), 0);
    }

    #[test]
    fn test_list_modules() {
        let engine = engine();
        let ids: Vec<&str> = engine.list_modules("backend").iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["request", "tcp", "database", "btree", "balancer"]);
    }
}
