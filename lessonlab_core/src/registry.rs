//! Module registry: category → ordered list of mountable modules.
//!
//! Purely declarative. The registry holds factories, never live modules;
//! every `create` builds a fresh instance seeded with the caller's seed.

use crate::module::{Instance, Module};
use crate::modules::{balancer, bits, btree, cache, consensus, cpu, database, gates, memory, request, tcp};
use lessonlab_env::SimError;
use serde::Serialize;

/// Builds a fresh module from an engine seed.
pub type ModuleFactory = fn(u64) -> Box<dyn Module>;

/// What `list` hands to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    pub id: &'static str,
    pub title: &'static str,
}

struct RegistryEntry {
    id: &'static str,
    title: &'static str,
    category: &'static str,
    factory: ModuleFactory,
}

#[derive(Default)]
pub struct Registry {
    /// Registration order is listing order
    entries: Vec<RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in lesson set, in lesson order.
    pub fn standard() -> Self {
        let builtin: [(&'static str, &'static str, &'static str, ModuleFactory); 11] = [
            (bits::ID, bits::TITLE, "hardware", |seed| {
                Instance::boxed(bits::BitsMachine::new(bits::BitsConfig::default()), seed)
            }),
            (gates::ID, gates::TITLE, "hardware", |seed| {
                Instance::boxed(gates::GatesMachine, seed)
            }),
            (cpu::ID, cpu::TITLE, "hardware", |seed| {
                Instance::boxed(cpu::CpuMachine::standard(), seed)
            }),
            (memory::ID, memory::TITLE, "hardware", |seed| {
                Instance::boxed(memory::MemoryMachine::standard(), seed)
            }),
            (cache::ID, cache::TITLE, "hardware", |seed| {
                Instance::boxed(cache::CacheMachine::standard(), seed)
            }),
            (request::ID, request::TITLE, "backend", |seed| {
                Instance::boxed(request::RequestMachine::standard(), seed)
            }),
            (tcp::ID, tcp::TITLE, "backend", |seed| {
                Instance::boxed(tcp::TcpMachine::standard(), seed)
            }),
            (database::ID, database::TITLE, "backend", |seed| {
                Instance::boxed(database::DatabaseMachine::standard(), seed)
            }),
            (btree::ID, btree::TITLE, "backend", |seed| {
                Instance::boxed(btree::BTreeMachine::standard(), seed)
            }),
            (balancer::ID, balancer::TITLE, "backend", |seed| {
                Instance::boxed(balancer::BalancerMachine::standard(), seed)
            }),
            (consensus::ID, consensus::TITLE, "distributed", |seed| {
                Instance::boxed(consensus::ConsensusMachine::standard(), seed)
            }),
        ];
        Self {
            entries: builtin
                .into_iter()
                .map(|(id, title, category, factory)| RegistryEntry {
                    id,
                    title,
                    category,
                    factory,
                })
                .collect(),
        }
    }

    /// Adds a module. Ids must be unique across all categories.
    pub fn register(
        &mut self,
        id: &'static str,
        title: &'static str,
        category: &'static str,
        factory: ModuleFactory,
    ) -> Result<(), SimError> {
        if self.contains(id) {
            return Err(SimError::config(format!("module id {} registered twice", id)));
        }
        self.entries.push(RegistryEntry {
            id,
            title,
            category,
            factory,
        });
        Ok(())
    }

    /// Modules in `category`, in registration order.
    pub fn list(&self, category: &str) -> Vec<ModuleSummary> {
        self.entries
            .iter()
            .filter(|e| e.category == category)
            .map(|e| ModuleSummary {
                id: e.id,
                title: e.title,
            })
            .collect()
    }

    /// Categories in first-registration order.
    pub fn categories(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = Vec::new();
        for entry in &self.entries {
            if !out.contains(&entry.category) {
                out.push(entry.category);
            }
        }
        out
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn create(&self, id: &str, seed: u64) -> Result<Box<dyn Module>, SimError> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| (e.factory)(seed))
            .ok_or_else(|| SimError::UnknownModule(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
