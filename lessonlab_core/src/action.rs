//! Named action tables: operator controls and fault injection.
//!
//! Every control or fault a module offers is an explicit entry in an
//! [`ActionTable`], dispatched by name. There is no feature detection: a
//! module without faults simply has an empty table.
//!
//! # Fault rules
//!
//! - A fault only touches the state of the module it belongs to. Tick,
//!   mount and log invariants belong to the engine and are out of reach.
//! - A fault returns a one-line description; the engine turns it into
//!   exactly one `fault`-severity log line.
//! - Sticky faults are idempotent: re-applying an active condition reports
//!   that it is already active and changes nothing. Each sticky fault has a
//!   matching `Clear` entry, and `reset()` clears everything.

use crate::journal::derive_rng;
use crate::module::{Machine, ModuleError};
use lessonlab_env::Tick;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// What kind of action an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Ordinary operator toggle (not a fault)
    Control,

    /// Applies once (e.g. "corrupt next write")
    OneShot,

    /// Toggles a persistent condition until cleared or reset
    Sticky,

    /// Clears one or more sticky conditions
    Clear,
}

impl ActionKind {
    /// Returns true for the three fault kinds.
    pub fn is_fault(&self) -> bool {
        !matches!(self, ActionKind::Control)
    }
}

/// Presentation-facing description of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Dispatch name (e.g. `partition_node_4`)
    pub name: String,

    /// Human label (e.g. "Partition node 4")
    pub label: String,

    pub kind: ActionKind,
}

/// Context handed to an action body.
///
/// Offers a reproducible RNG derived from the module seed, the current tick
/// and how many actions were applied since the last init.
pub struct ActionCx {
    seed: u64,
    tick: Tick,
    invocation: u64,
}

impl ActionCx {
    pub fn new(seed: u64, tick: Tick, invocation: u64) -> Self {
        Self {
            seed,
            tick,
            invocation,
        }
    }

    /// Tick at which the action is applied.
    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn rng(&self) -> ChaCha8Rng {
        derive_rng(self.seed ^ 0xa5a5_5a5a_c3c3_3c3c, self.tick, self.invocation)
    }
}

/// Body of an action: mutates the typed state and describes what it did.
pub type ActionFn<M> = Box<
    dyn Fn(&M, &mut <M as Machine>::State, &mut ActionCx) -> Result<String, ModuleError>
        + Send
        + Sync,
>;

/// Ordered table of named actions for one machine type.
pub struct ActionTable<M: Machine> {
    entries: Vec<(ActionSpec, ActionFn<M>)>,
}

impl<M: Machine> ActionTable<M> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Builder form of [`ActionTable::push`].
    pub fn with<F>(mut self, name: impl Into<String>, label: impl Into<String>, kind: ActionKind, f: F) -> Self
    where
        F: Fn(&M, &mut M::State, &mut ActionCx) -> Result<String, ModuleError> + Send + Sync + 'static,
    {
        self.push(name, label, kind, f);
        self
    }

    /// Registers an action. A later entry with the same name shadows nothing:
    /// lookups return the first match, so names must be unique.
    pub fn push<F>(&mut self, name: impl Into<String>, label: impl Into<String>, kind: ActionKind, f: F)
    where
        F: Fn(&M, &mut M::State, &mut ActionCx) -> Result<String, ModuleError> + Send + Sync + 'static,
    {
        let spec = ActionSpec {
            name: name.into(),
            label: label.into(),
            kind,
        };
        debug_assert!(
            self.get(&spec.name).is_none(),
            "duplicate action name {}",
            spec.name
        );
        self.entries.push((spec, Box::new(f)));
    }

    /// Looks up an action by name.
    pub fn get(&self, name: &str) -> Option<(&ActionSpec, &ActionFn<M>)> {
        self.entries
            .iter()
            .find(|(spec, _)| spec.name == name)
            .map(|(spec, f)| (spec, f))
    }

    /// Enumerates the catalog in registration order.
    pub fn specs(&self) -> Vec<ActionSpec> {
        self.entries.iter().map(|(spec, _)| spec.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<M: Machine> Default for ActionTable<M> {
    fn default() -> Self {
        Self::new()
    }
}
