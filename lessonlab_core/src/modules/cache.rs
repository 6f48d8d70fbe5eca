//! Cache/TLB: a direct-mapped cache in front of a slow backing store.
//!
//! One memory access per tick. Addresses split as
//!
//! ```text
//! block = address / line_size
//! set   = block % num_sets
//! tag   = block / num_sets
//! ```
//!
//! A valid line with a matching tag is a hit (`hit_latency` cycles);
//! anything else is a miss that loads the block from memory
//! (`miss_latency` cycles) and evicts whatever occupied the set. A small
//! direct-mapped TLB (identity-mapped pages) adds `tlb_miss_penalty` cycles
//! on a translation miss.

use crate::action::{ActionKind, ActionTable};
use crate::journal::StepCx;
use crate::module::{Machine, ModuleDescriptor, ModuleError};
use crate::snapshot::Snapshot;
use lessonlab_env::SimError;
use serde::{Deserialize, Serialize};

pub const ID: &str = "cache";
pub const TITLE: &str = "Caching: why the second time is faster";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of direct-mapped lines
    pub num_sets: u64,

    /// Bytes per line
    pub line_size: u64,

    /// First address accessed
    pub start: u64,

    /// Address increment per access
    pub stride: u64,

    /// Addresses wrap modulo this size
    pub memory_size: u64,

    pub hit_latency: u64,
    pub miss_latency: u64,

    /// Bytes per TLB page
    pub page_size: u64,

    /// Number of direct-mapped TLB entries
    pub tlb_entries: u64,

    pub tlb_miss_penalty: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_sets: 4,
            line_size: 4,
            start: 0,
            stride: 1,
            memory_size: 256,
            hit_latency: 1,
            miss_latency: 10,
            page_size: 16,
            tlb_entries: 2,
            tlb_miss_penalty: 5,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.num_sets == 0 || self.line_size == 0 || self.page_size == 0 || self.tlb_entries == 0 {
            return Err(SimError::config(
                "cache: num_sets, line_size, page_size and tlb_entries must be non-zero",
            ));
        }
        let span = self.num_sets.checked_mul(self.line_size).ok_or_else(|| {
            SimError::config(format!(
                "cache: num_sets {} * line_size {} overflows",
                self.num_sets, self.line_size
            ))
        })?;
        if self.memory_size == 0 || self.memory_size % span != 0 {
            return Err(SimError::config(format!(
                "cache: memory_size {} must be a non-zero multiple of num_sets * line_size ({})",
                self.memory_size, span
            )));
        }
        if self.start >= self.memory_size {
            return Err(SimError::config("cache: start address beyond memory"));
        }
        Ok(())
    }

    fn aliasing_stride(&self) -> u64 {
        self.num_sets * self.line_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheLine {
    pub valid: bool,
    pub tag: u64,

    /// Times this line has been (re)filled
    pub fills: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TlbEntry {
    pub valid: bool,
    pub vpn: u64,
}

/// What the last access did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub address: u64,
    pub set: u64,
    pub tag: u64,
    pub hit: bool,
    pub tlb_hit: bool,
    pub latency: u64,

    /// Tag of the previous occupant if a valid line was replaced
    pub evicted_tag: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheState {
    pub line_size: u64,
    pub lines: Vec<CacheLine>,
    pub tlb: Vec<TlbEntry>,

    /// Address the next tick will access
    pub next_address: u64,
    pub stride: u64,

    /// Pathological aliasing stride active
    pub pathological: bool,

    pub accesses: u64,
    pub hits: u64,
    pub misses: u64,
    pub tlb_hits: u64,
    pub tlb_misses: u64,
    pub total_cycles: u64,
    pub last_access: Option<AccessRecord>,
}

impl CacheState {
    /// Hit rate in percent, rounded down.
    pub fn hit_rate(&self) -> u64 {
        if self.accesses == 0 {
            0
        } else {
            self.hits * 100 / self.accesses
        }
    }
}

pub struct CacheMachine {
    config: CacheConfig,
}

impl CacheMachine {
    pub fn new(config: CacheConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn standard() -> Self {
        Self {
            config: CacheConfig::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl Machine for CacheMachine {
    type State = CacheState;

    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: ID,
            title: TITLE,
            category: "hardware",
        }
    }

    fn init(&self) -> CacheState {
        CacheState {
            line_size: self.config.line_size,
            lines: vec![CacheLine::default(); self.config.num_sets as usize],
            tlb: vec![TlbEntry::default(); self.config.tlb_entries as usize],
            next_address: self.config.start,
            stride: self.config.stride,
            pathological: false,
            accesses: 0,
            hits: 0,
            misses: 0,
            tlb_hits: 0,
            tlb_misses: 0,
            total_cycles: 0,
            last_access: None,
        }
    }

    fn transition(&self, state: &mut CacheState, cx: &mut StepCx<'_>) -> Result<(), ModuleError> {
        let c = &self.config;
        let address = state.next_address;

        // Translation
        let vpn = address / c.page_size;
        let slot = (vpn % c.tlb_entries) as usize;
        let entry = state
            .tlb
            .get_mut(slot)
            .ok_or_else(|| ModuleError::Internal(format!("TLB slot {} missing", slot)))?;
        let tlb_hit = entry.valid && entry.vpn == vpn;
        let mut latency = 0;
        if tlb_hit {
            state.tlb_hits += 1;
        } else {
            *entry = TlbEntry { valid: true, vpn };
            state.tlb_misses += 1;
            latency += c.tlb_miss_penalty;
        }

        // Lookup
        let block = address / c.line_size;
        let set = block % c.num_sets;
        let tag = block / c.num_sets;
        let line = state
            .lines
            .get_mut(set as usize)
            .ok_or_else(|| ModuleError::Internal(format!("cache set {} missing", set)))?;

        let hit = line.valid && line.tag == tag;
        let mut evicted_tag = None;
        if hit {
            state.hits += 1;
            latency += c.hit_latency;
        } else {
            if line.valid {
                evicted_tag = Some(line.tag);
            }
            line.valid = true;
            line.tag = tag;
            line.fills += 1;
            state.misses += 1;
            latency += c.miss_latency;
        }

        state.accesses += 1;
        state.total_cycles += latency;
        state.next_address = (address + state.stride) % c.memory_size;
        state.last_access = Some(AccessRecord {
            address,
            set,
            tag,
            hit,
            tlb_hit,
            latency,
            evicted_tag,
        });

        let tlb_note = if tlb_hit { "" } else { ", TLB miss" };
        if hit {
            cx.ok(format!(
                "hit  0x{:04X} set {} tag {} ({} cycles{})",
                address, set, tag, latency, tlb_note
            ));
        } else {
            let eviction = match evicted_tag {
                Some(old) => format!(", evicted tag {}", old),
                None => String::new(),
            };
            cx.info(format!(
                "miss 0x{:04X} set {} tag {}: loaded from memory ({} cycles{}{})",
                address, set, tag, latency, tlb_note, eviction
            ));
        }
        Ok(())
    }

    fn snapshot(state: &CacheState) -> Snapshot {
        Snapshot::Cache(state.clone())
    }

    fn check(&self, state: &CacheState) -> Result<(), String> {
        if state.lines.len() as u64 != self.config.num_sets {
            return Err(format!("{} lines for {} sets", state.lines.len(), self.config.num_sets));
        }
        if state.tlb.len() as u64 != self.config.tlb_entries {
            return Err(format!("{} TLB entries, expected {}", state.tlb.len(), self.config.tlb_entries));
        }
        if state.hits + state.misses != state.accesses {
            return Err(format!(
                "hits {} + misses {} != accesses {}",
                state.hits, state.misses, state.accesses
            ));
        }
        if state.next_address >= self.config.memory_size {
            return Err(format!("next address 0x{:X} beyond memory", state.next_address));
        }
        Ok(())
    }

    fn faults(&self) -> ActionTable<Self> {
        ActionTable::new()
            .with("flush", "Flush the cache and TLB", ActionKind::OneShot, |_, state: &mut CacheState, _| {
                let valid = state.lines.iter().filter(|l| l.valid).count();
                for line in state.lines.iter_mut() {
                    line.valid = false;
                }
                for entry in state.tlb.iter_mut() {
                    entry.valid = false;
                }
                Ok(format!("flushed {} valid lines and the TLB", valid))
            })
            .with(
                "pathological_stride",
                "Switch to an aliasing access pattern",
                ActionKind::Sticky,
                |m: &CacheMachine, state: &mut CacheState, _| {
                    if state.pathological {
                        return Ok("aliasing stride already active".to_string());
                    }
                    let stride = m.config.aliasing_stride();
                    state.stride = stride;
                    let aligned = (state.next_address + stride - 1) / stride * stride;
                    state.next_address = aligned % m.config.memory_size;
                    state.pathological = true;
                    Ok(format!(
                        "stride set to {} bytes: every access now maps to set {}",
                        stride,
                        (state.next_address / m.config.line_size) % m.config.num_sets
                    ))
                },
            )
            .with(
                "normal_stride",
                "Restore the normal access pattern",
                ActionKind::Clear,
                |m: &CacheMachine, state: &mut CacheState, _| {
                    if !state.pathological {
                        return Ok("access pattern already normal".to_string());
                    }
                    state.stride = m.config.stride;
                    state.pathological = false;
                    Ok(format!("stride restored to {}", m.config.stride))
                },
            )
            .with(
                "corrupt_tag",
                "Flip a bit in a cached tag",
                ActionKind::OneShot,
                |_, state: &mut CacheState, _| {
                    match state.lines.iter_mut().enumerate().find(|(_, l)| l.valid) {
                        Some((set, line)) => {
                            let before = line.tag;
                            line.tag ^= 1;
                            Ok(format!("set {} tag corrupted: {} -> {}", set, before, line.tag))
                        }
                        None => Ok("no valid line to corrupt".to_string()),
                    }
                },
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::module::{Instance, Module};

    fn run(module: &mut Instance<CacheMachine>, ticks: u64) {
        for t in 0..ticks {
            let mut journal = Journal::new(t);
            module.transition(t, &mut journal).unwrap();
        }
    }

    #[test]
    fn test_sequential_cold_misses() {
        let mut module = Instance::new(CacheMachine::standard(), 0);
        run(&mut module, 8);

        let state = module.state();
        assert_eq!(state.misses, 2);
        assert_eq!(state.hits, 6);
        assert_eq!(state.tlb_misses, 1);
    }

    #[test]
    fn test_miss_evicts_prior_occupant() {
        let config = CacheConfig {
            stride: 16,
            ..Default::default()
        };
        let mut module = Instance::new(CacheMachine::new(config).unwrap(), 0);
        run(&mut module, 2);

        let last = module.state().last_access.unwrap();
        assert!(!last.hit);
        assert_eq!(last.set, 0);
        assert_eq!(last.evicted_tag, Some(0));
    }

    #[test]
    fn test_hit_is_cheaper_than_miss() {
        let mut module = Instance::new(CacheMachine::standard(), 0);
        run(&mut module, 2);

        let last = module.state().last_access.unwrap();
        assert!(last.hit);
        assert_eq!(last.latency, 1);
    }

    #[test]
    fn test_flush_forces_misses() {
        let mut module = Instance::new(CacheMachine::standard(), 0);
        run(&mut module, 2);
        module.inject("flush", 2).unwrap();
        assert!(module.state().lines.iter().all(|l| !l.valid));

        run(&mut module, 1);
        assert!(!module.state().last_access.unwrap().hit);
    }

    #[test]
    fn test_pathological_stride_aliases_one_set() {
        let mut module = Instance::new(CacheMachine::standard(), 0);
        run(&mut module, 5);
        module.inject("pathological_stride", 5).unwrap();

        let misses_before = module.state().misses;
        for t in 0..20 {
            let mut journal = Journal::new(t);
            module.transition(t, &mut journal).unwrap();
            assert_eq!(module.state().last_access.unwrap().set, 0);
        }
        assert_eq!(module.state().misses - misses_before, 20);

        module.inject("normal_stride", 25).unwrap();
        assert_eq!(module.state().stride, 1);
    }

    #[test]
    fn test_config_rejects_unaligned_memory() {
        let config = CacheConfig {
            memory_size: 100,
            ..Default::default()
        };
        assert!(CacheMachine::new(config).is_err());
    }

    #[test]
    fn test_config_rejects_overflowing_geometry() {
        let config = CacheConfig {
            num_sets: u64::MAX / 2,
            line_size: 4,
            ..Default::default()
        };
        match CacheMachine::new(config) {
            Err(SimError::InvalidConfig(msg)) => assert!(msg.contains("overflows"), "{}", msg),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("overflowing geometry accepted"),
        }
    }
}
