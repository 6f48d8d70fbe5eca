//! Memory hierarchy: how a program travels from disk to the CPU.
//!
//! The program starts on the SSD. One tick per hop it is copied into RAM,
//! then into the CPU cache, and finally executed. Each hop costs the read
//! latency of the tier it comes from, so the snapshot shows where the time
//! goes: the SSD read dwarfs everything after it. Once running, every tick
//! executes one instruction out of the cache.
//!
//! Only the SSD is persistent. `power_loss` wipes RAM and cache and the
//! program has to be loaded again from the start.

use crate::action::{ActionKind, ActionTable};
use crate::journal::StepCx;
use crate::module::{Machine, ModuleDescriptor, ModuleError};
use crate::snapshot::Snapshot;
use lessonlab_env::SimError;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const ID: &str = "memory";
pub const TITLE: &str = "How programs load into memory";

const FILL_SALT: u64 = 0x3e3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Cells in the RAM grid
    pub ram_cells: usize,

    /// Bytes the program occupies once loaded
    pub program_bytes: usize,

    pub ssd_read_ns: u64,
    pub ram_read_ns: u64,
    pub cache_read_ns: u64,

    /// SSD latency multiplier while the disk is degraded
    pub slow_disk_factor: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ram_cells: 64,
            program_bytes: 32,
            ssd_read_ns: 100_000,
            ram_read_ns: 100,
            cache_read_ns: 1,
            slow_disk_factor: 10,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.ram_cells == 0 || self.ram_cells > 1024 {
            return Err(SimError::config(format!("memory: ram_cells {} outside 1..=1024", self.ram_cells)));
        }
        if self.program_bytes == 0 || self.program_bytes > self.ram_cells {
            return Err(SimError::config(format!(
                "memory: program of {} bytes does not fit {} RAM cells",
                self.program_bytes, self.ram_cells
            )));
        }
        if !(self.ssd_read_ns > self.ram_read_ns && self.ram_read_ns > self.cache_read_ns && self.cache_read_ns > 0) {
            return Err(SimError::config("memory: latencies must fall from SSD to RAM to cache"));
        }
        if self.slow_disk_factor == 0 {
            return Err(SimError::config("memory: slow_disk_factor must be at least 1"));
        }
        Ok(())
    }
}

/// Storage levels, slowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Ssd,
    Ram,
    Cache,
    Cpu,
}

impl Tier {
    pub fn label(&self) -> &'static str {
        match self {
            Tier::Ssd => "SSD",
            Tier::Ram => "RAM",
            Tier::Cache => "CPU cache",
            Tier::Cpu => "CPU",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryState {
    /// Fastest tier holding the program; every slower tier holds it too
    pub reached: Tier,

    /// RAM grid; `None` is an empty cell
    pub ram: Vec<Option<u8>>,

    /// Time spent moving and running the program
    pub elapsed_ns: u64,

    /// Instructions executed since the program reached the CPU
    pub executed: u64,

    /// Completed SSD to RAM loads
    pub loads: u64,

    /// Degraded-disk fault active
    pub slow_disk: bool,
}

impl MemoryState {
    pub fn ram_used(&self) -> usize {
        self.ram.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_running(&self) -> bool {
        self.reached == Tier::Cpu
    }

    fn wipe_volatile(&mut self) {
        self.reached = Tier::Ssd;
        self.ram.iter_mut().for_each(|cell| *cell = None);
    }
}

pub struct MemoryMachine {
    config: MemoryConfig,
}

impl MemoryMachine {
    pub fn new(config: MemoryConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn standard() -> Self {
        Self {
            config: MemoryConfig::default(),
        }
    }

    fn ssd_cost(&self, state: &MemoryState) -> u64 {
        if state.slow_disk {
            self.config.ssd_read_ns.saturating_mul(self.config.slow_disk_factor)
        } else {
            self.config.ssd_read_ns
        }
    }
}

impl Machine for MemoryMachine {
    type State = MemoryState;

    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: ID,
            title: TITLE,
            category: "hardware",
        }
    }

    fn init(&self) -> MemoryState {
        MemoryState {
            reached: Tier::Ssd,
            ram: vec![None; self.config.ram_cells],
            elapsed_ns: 0,
            executed: 0,
            loads: 0,
            slow_disk: false,
        }
    }

    fn transition(&self, state: &mut MemoryState, cx: &mut StepCx<'_>) -> Result<(), ModuleError> {
        let cost = match state.reached {
            Tier::Ssd => {
                let mut rng = cx.rng(FILL_SALT);
                for cell in state.ram.iter_mut().take(self.config.program_bytes) {
                    *cell = Some(rng.gen());
                }
                state.reached = Tier::Ram;
                state.loads += 1;
                let cost = self.ssd_cost(state);
                cx.info(format!(
                    "OS copied {} bytes from SSD into RAM in {} ns",
                    self.config.program_bytes, cost
                ));
                cost
            }
            Tier::Ram => {
                state.reached = Tier::Cache;
                cx.info(format!(
                    "CPU pulled the instructions from RAM into its cache in {} ns",
                    self.config.ram_read_ns
                ));
                self.config.ram_read_ns
            }
            Tier::Cache => {
                state.reached = Tier::Cpu;
                cx.ok(format!(
                    "program running after {} ns; it stays in RAM until closed",
                    state.elapsed_ns + self.config.cache_read_ns
                ));
                self.config.cache_read_ns
            }
            Tier::Cpu => {
                state.executed += 1;
                cx.info(format!("instruction #{} executed from cache", state.executed));
                self.config.cache_read_ns
            }
        };
        state.elapsed_ns = state.elapsed_ns.saturating_add(cost);
        Ok(())
    }

    fn snapshot(state: &MemoryState) -> Snapshot {
        Snapshot::Memory(state.clone())
    }

    fn check(&self, state: &MemoryState) -> Result<(), String> {
        if state.ram.len() != self.config.ram_cells {
            return Err(format!("RAM has {} cells, expected {}", state.ram.len(), self.config.ram_cells));
        }
        let expected = if state.reached >= Tier::Ram { self.config.program_bytes } else { 0 };
        let used = state.ram_used();
        if used != expected || state.ram.iter().take(expected).any(|c| c.is_none()) {
            return Err(format!(
                "{} RAM cells in use with the program at the {}",
                used,
                state.reached.label()
            ));
        }
        if state.executed > 0 && state.loads == 0 {
            return Err("instructions executed before any load".to_string());
        }
        Ok(())
    }

    fn faults(&self) -> ActionTable<Self> {
        ActionTable::new()
            .with("power_loss", "Cut the power", ActionKind::OneShot, |_, state: &mut MemoryState, _| {
                if state.reached == Tier::Ssd {
                    return Ok("power cut; nothing volatile was loaded".to_string());
                }
                let lost = state.ram_used();
                state.wipe_volatile();
                Ok(format!("power cut: {} bytes of RAM and the cache wiped, only the SSD copy survives", lost))
            })
            .with("evict_cache", "Evict the CPU cache", ActionKind::OneShot, |_, state: &mut MemoryState, _| {
                if state.reached < Tier::Cache {
                    return Ok("cache holds nothing of the program yet".to_string());
                }
                state.reached = Tier::Ram;
                Ok("cache evicted; the CPU must refetch from RAM".to_string())
            })
            .with("slow_disk", "Degrade the SSD", ActionKind::Sticky, |m: &MemoryMachine, state: &mut MemoryState, _| {
                if state.slow_disk {
                    return Ok("disk already degraded".to_string());
                }
                state.slow_disk = true;
                Ok(format!("SSD reads now {}x slower", m.config.slow_disk_factor))
            })
            .with("repair_disk", "Repair the SSD", ActionKind::Clear, |_, state: &mut MemoryState, _| {
                let was = std::mem::replace(&mut state.slow_disk, false);
                Ok(if was { "disk repaired" } else { "disk was healthy" }.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::module::{Instance, Module};

    fn run(module: &mut Instance<MemoryMachine>, from: u64, ticks: u64) {
        for t in from..from + ticks {
            let mut journal = Journal::new(t);
            module.transition(t, &mut journal).unwrap();
        }
    }

    #[test]
    fn test_program_reaches_cpu_in_three_ticks() {
        let mut module = Instance::new(MemoryMachine::standard(), 5);
        run(&mut module, 0, 3);

        let state = module.state();
        assert!(state.is_running());
        assert_eq!(state.ram_used(), 32);
        assert_eq!(state.elapsed_ns, 100_000 + 100 + 1);
        assert_eq!(state.executed, 0);

        run(&mut module, 3, 2);
        assert_eq!(module.state().executed, 2);
    }

    #[test]
    fn test_power_loss_forces_reload_from_ssd() {
        let mut module = Instance::new(MemoryMachine::standard(), 5);
        run(&mut module, 0, 4);
        module.inject("power_loss", 4).unwrap();

        assert_eq!(module.state().reached, Tier::Ssd);
        assert_eq!(module.state().ram_used(), 0);

        run(&mut module, 4, 3);
        assert!(module.state().is_running());
        assert_eq!(module.state().loads, 2);
    }

    #[test]
    fn test_evicted_cache_refetches_from_ram() {
        let mut module = Instance::new(MemoryMachine::standard(), 5);
        run(&mut module, 0, 3);
        let before = module.state().elapsed_ns;
        module.inject("evict_cache", 3).unwrap();

        run(&mut module, 3, 1);
        assert_eq!(module.state().reached, Tier::Cache);
        assert_eq!(module.state().elapsed_ns, before + 100);
        assert_eq!(module.state().loads, 1);
    }

    #[test]
    fn test_slow_disk_multiplies_load_time() {
        let mut module = Instance::new(MemoryMachine::standard(), 5);
        module.inject("slow_disk", 0).unwrap();
        run(&mut module, 0, 1);
        assert_eq!(module.state().elapsed_ns, 1_000_000);

        let msg = module.inject("repair_disk", 1).unwrap();
        assert_eq!(msg, "disk repaired");
    }

    #[test]
    fn test_ram_contents_follow_seed() {
        let mut a = Instance::new(MemoryMachine::standard(), 11);
        let mut b = Instance::new(MemoryMachine::standard(), 11);
        run(&mut a, 0, 1);
        run(&mut b, 0, 1);
        assert_eq!(a.state().ram, b.state().ram);
    }

    #[test]
    fn test_config_rejects_program_larger_than_ram() {
        let config = MemoryConfig {
            ram_cells: 16,
            program_bytes: 32,
            ..Default::default()
        };
        assert!(MemoryMachine::new(config).is_err());
    }
}
