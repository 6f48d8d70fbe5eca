//! The module contract.
//!
//! Two layers:
//!
//! - [`Machine`] is what a lesson author writes: a typed state, a pure
//!   `init`, a one-step `transition`, and optional fault/control tables.
//! - [`Module`] is the object-safe face the engine mounts. [`Instance`]
//!   adapts any `Machine` into a `Module`, owning the state and enforcing
//!   snapshot discipline: every transition and action runs against a
//!   scratch copy that is committed only if it finishes and passes
//!   [`Machine::check`]. Observers never see a half-updated state.

use crate::action::{ActionCx, ActionSpec, ActionTable};
use crate::journal::{Journal, StepCx};
use crate::snapshot::Snapshot;
use lessonlab_env::{SimError, Tick};
use serde::Serialize;
use std::fmt::Debug;
use thiserror::Error;

/// Errors a module can report back to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    /// The state failed its structural check
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No action with this name in the module's tables
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// A transition or action hit an internal inconsistency
    #[error("Internal failure: {0}")]
    Internal(String),
}

impl From<ModuleError> for SimError {
    fn from(err: ModuleError) -> Self {
        match err {
            ModuleError::UnknownAction(name) => SimError::UnknownAction(name),
            ModuleError::InvalidState(msg) => SimError::InvalidSnapshot(msg),
            ModuleError::Internal(msg) => SimError::InvalidSnapshot(msg),
        }
    }
}

/// Static identity of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModuleDescriptor {
    /// Registry id (e.g. `cpu`)
    pub id: &'static str,

    /// Human title
    pub title: &'static str,

    /// Registry category (e.g. `hardware`)
    pub category: &'static str,
}

/// A typed finite-state lesson model.
pub trait Machine: Send + Sized + 'static {
    /// The full world of this module at one instant.
    type State: Clone + PartialEq + Debug + Serialize + Send + 'static;

    fn descriptor(&self) -> ModuleDescriptor;

    /// Produces a valid starting state. Must be pure.
    fn init(&self) -> Self::State;

    /// Advances `state` by exactly one tick. Must be total and bounded.
    fn transition(&self, state: &mut Self::State, cx: &mut StepCx<'_>) -> Result<(), ModuleError>;

    /// Wraps a state into the tagged snapshot variant for this kind.
    fn snapshot(state: &Self::State) -> Snapshot;

    /// Structural validation run after every init, transition and action.
    fn check(&self, _state: &Self::State) -> Result<(), String> {
        Ok(())
    }

    /// Fault catalog. Empty by default.
    fn faults(&self) -> ActionTable<Self> {
        ActionTable::new()
    }

    /// Operator controls. Empty by default.
    fn controls(&self) -> ActionTable<Self> {
        ActionTable::new()
    }
}

/// Object-safe module interface the engine mounts.
///
/// Only `descriptor`, `init`, `transition` and `snapshot` are required; the
/// action surface defaults to empty catalogs.
pub trait Module: Send {
    fn descriptor(&self) -> ModuleDescriptor;

    /// Re-initializes internal state and returns the first snapshot.
    fn init(&mut self) -> Result<Snapshot, ModuleError>;

    /// Advances one tick, writing any log lines into `journal`.
    fn transition(&mut self, tick: Tick, journal: &mut Journal) -> Result<(), ModuleError>;

    /// Current snapshot.
    fn snapshot(&self) -> Snapshot;

    fn faults(&self) -> Vec<ActionSpec> {
        Vec::new()
    }

    /// Applies a fault and returns its description.
    fn inject(&mut self, name: &str, _tick: Tick) -> Result<String, ModuleError> {
        Err(ModuleError::UnknownAction(name.to_string()))
    }

    fn controls(&self) -> Vec<ActionSpec> {
        Vec::new()
    }

    /// Applies a control and returns its description.
    fn control(&mut self, name: &str, _tick: Tick) -> Result<String, ModuleError> {
        Err(ModuleError::UnknownAction(name.to_string()))
    }
}

/// A mounted [`Machine`]: configuration, live state and action tables.
pub struct Instance<M: Machine> {
    machine: M,
    seed: u64,
    state: M::State,
    faults: ActionTable<M>,
    controls: ActionTable<M>,

    /// Actions applied since the last init (feeds the action RNG)
    invocations: u64,
}

impl<M: Machine> Instance<M> {
    /// Creates an instance in its initial state.
    pub fn new(machine: M, seed: u64) -> Self {
        let state = machine.init();
        let faults = machine.faults();
        let controls = machine.controls();
        Self {
            machine,
            seed,
            state,
            faults,
            controls,
            invocations: 0,
        }
    }

    /// Creates a boxed instance ready for mounting.
    pub fn boxed(machine: M, seed: u64) -> Box<dyn Module> {
        Box::new(Self::new(machine, seed))
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn state(&self) -> &M::State {
        &self.state
    }

    fn apply(&mut self, fault: bool, name: &str, tick: Tick) -> Result<String, ModuleError> {
        let table = if fault { &self.faults } else { &self.controls };
        let (spec, run) = table
            .get(name)
            .ok_or_else(|| ModuleError::UnknownAction(name.to_string()))?;

        let mut next = self.state.clone();
        let mut cx = ActionCx::new(self.seed, tick, self.invocations);
        let description = run(&self.machine, &mut next, &mut cx)?;
        self.machine
            .check(&next)
            .map_err(|e| ModuleError::InvalidState(format!("after {}: {}", spec.name, e)))?;

        self.state = next;
        self.invocations += 1;
        Ok(description)
    }
}

impl<M: Machine> Module for Instance<M> {
    fn descriptor(&self) -> ModuleDescriptor {
        self.machine.descriptor()
    }

    fn init(&mut self) -> Result<Snapshot, ModuleError> {
        let state = self.machine.init();
        self.machine
            .check(&state)
            .map_err(|e| ModuleError::InvalidState(format!("after init: {}", e)))?;
        self.state = state;
        self.invocations = 0;
        Ok(M::snapshot(&self.state))
    }

    fn transition(&mut self, tick: Tick, journal: &mut Journal) -> Result<(), ModuleError> {
        let mut next = self.state.clone();
        let result = {
            let mut cx = StepCx::new(self.seed, journal);
            self.machine.transition(&mut next, &mut cx)
        };

        let result = result.and_then(|_| {
            self.machine
                .check(&next)
                .map_err(|e| ModuleError::InvalidState(format!("after tick {}: {}", tick, e)))
        });

        match result {
            Ok(()) => {
                self.state = next;
                Ok(())
            }
            Err(e) => {
                journal.discard();
                Err(e)
            }
        }
    }

    fn snapshot(&self) -> Snapshot {
        M::snapshot(&self.state)
    }

    fn faults(&self) -> Vec<ActionSpec> {
        self.faults.specs()
    }

    fn inject(&mut self, name: &str, tick: Tick) -> Result<String, ModuleError> {
        self.apply(true, name, tick)
    }

    fn controls(&self) -> Vec<ActionSpec> {
        self.controls.specs()
    }

    fn control(&mut self, name: &str, tick: Tick) -> Result<String, ModuleError> {
        self.apply(false, name, tick)
    }
}
