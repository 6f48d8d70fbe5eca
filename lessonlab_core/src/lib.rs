//! LessonLab Core - module contract, fault injection and lesson models
//!
//! This library holds everything that runs inside one simulation tick:
//! 1. **Contract**: [`Machine`] (typed, what a lesson author writes) and
//!    [`Module`] (object-safe, what the engine mounts), joined by [`Instance`]
//! 2. **Faults and controls**: named [`ActionTable`]s dispatched by name
//! 3. **Observation**: the tagged [`Snapshot`] and the bounded [`EventLog`]
//! 4. **Lessons**: the concrete state machines under [`modules`], listed by
//!    the [`Registry`]

pub mod action;
pub mod event_log;
pub mod journal;
pub mod module;
pub mod modules;
pub mod registry;
pub mod snapshot;

// Re-export key types for convenience
pub use action::{ActionCx, ActionKind, ActionSpec, ActionTable};
pub use event_log::{EventLog, DEFAULT_LOG_CAPACITY};
pub use journal::{derive_rng, Journal, StepCx};
pub use module::{Instance, Machine, Module, ModuleDescriptor, ModuleError};
pub use registry::{ModuleFactory, ModuleSummary, Registry};
pub use snapshot::Snapshot;
