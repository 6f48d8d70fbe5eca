//! CPU pipeline: fetch → decode → execute over a fixed program.
//!
//! One phase per tick, so an N-instruction program retires in 3N ticks.
//! Running past the last instruction, a `HALT` instruction, an illegal
//! operand or the `halt` fault all land in the terminal `Halted` phase;
//! from there every tick is a logged no-op.

use crate::action::{ActionKind, ActionTable};
use crate::journal::StepCx;
use crate::module::{Machine, ModuleDescriptor, ModuleError};
use crate::snapshot::Snapshot;
use lessonlab_env::SimError;
use serde::{Deserialize, Serialize};

pub const ID: &str = "cpu";
pub const TITLE: &str = "How the CPU runs a program";

/// Register written by the stuck-at fault.
const STUCK_REGISTER: u8 = 2;

/// Register corrupted by the bit-flip fault.
const FLIP_REGISTER: u8 = 1;

/// One instruction of the toy ISA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Instruction {
    /// `MOV Rd, imm`
    Mov { dst: u8, value: i64 },

    /// `MOV Rd, Rs`
    Copy { dst: u8, src: u8 },

    /// `ADD Rd, Ra, Rb`
    Add { dst: u8, a: u8, b: u8 },

    /// `SUB Rd, Ra, Rb`
    Sub { dst: u8, a: u8, b: u8 },

    Halt,
}

impl Instruction {
    /// Assembly rendering.
    pub fn asm(&self) -> String {
        match *self {
            Instruction::Mov { dst, value } => format!("MOV R{}, {}", dst, value),
            Instruction::Copy { dst, src } => format!("MOV R{}, R{}", dst, src),
            Instruction::Add { dst, a, b } => format!("ADD R{}, R{}, R{}", dst, a, b),
            Instruction::Sub { dst, a, b } => format!("SUB R{}, R{}, R{}", dst, a, b),
            Instruction::Halt => "HALT".to_string(),
        }
    }

    fn registers(&self) -> Vec<u8> {
        match *self {
            Instruction::Mov { dst, .. } => vec![dst],
            Instruction::Copy { dst, src } => vec![dst, src],
            Instruction::Add { dst, a, b } | Instruction::Sub { dst, a, b } => vec![dst, a, b],
            Instruction::Halt => Vec::new(),
        }
    }

    fn describe(&self) -> String {
        match *self {
            Instruction::Mov { dst, value } => format!("load {} into R{}", value, dst),
            Instruction::Copy { dst, src } => format!("copy R{} into R{}", src, dst),
            Instruction::Add { dst, a, b } => format!("add R{} and R{}, store in R{}", a, b, dst),
            Instruction::Sub { dst, a, b } => format!("subtract R{} from R{}, store in R{}", b, a, dst),
            Instruction::Halt => "stop the processor".to_string(),
        }
    }
}

/// Pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Fetch,
    Decode,
    Execute,
    Halted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuConfig {
    pub program: Vec<Instruction>,
    pub registers: usize,
}

impl Default for CpuConfig {
    /// `R0=5; R1=3; R2=R0+R1; R3=R2`
    fn default() -> Self {
        Self {
            program: vec![
                Instruction::Mov { dst: 0, value: 5 },
                Instruction::Mov { dst: 1, value: 3 },
                Instruction::Add { dst: 2, a: 0, b: 1 },
                Instruction::Copy { dst: 3, src: 2 },
            ],
            registers: 4,
        }
    }
}

impl CpuConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if !(1..=16).contains(&self.registers) {
            return Err(SimError::config(format!(
                "cpu: register count {} outside 1..=16",
                self.registers
            )));
        }
        if self.registers <= STUCK_REGISTER as usize {
            return Err(SimError::config("cpu: need at least 3 registers for the fault catalog"));
        }
        for (pc, ins) in self.program.iter().enumerate() {
            if let Some(r) = ins.registers().into_iter().find(|&r| r as usize >= self.registers) {
                return Err(SimError::config(format!(
                    "cpu: instruction {} ({}) names R{} but only {} registers exist",
                    pc,
                    ins.asm(),
                    r,
                    self.registers
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckRegister {
    pub index: u8,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    /// Instruction memory
    pub program: Vec<Instruction>,

    /// Program counter
    pub pc: usize,

    /// Register file
    pub registers: Vec<i64>,

    /// Phase the next tick will perform
    pub phase: Phase,

    /// Instruction register (set by fetch, consumed by execute)
    pub fetched: Option<Instruction>,

    /// Why the CPU halted
    pub halt_reason: Option<String>,

    /// Active stuck-at register fault
    pub stuck: Option<StuckRegister>,

    /// Instructions retired
    pub retired: u64,
}

impl CpuState {
    pub fn is_halted(&self) -> bool {
        self.phase == Phase::Halted
    }

    fn halt(&mut self, reason: impl Into<String>) {
        self.phase = Phase::Halted;
        self.fetched = None;
        self.halt_reason = Some(reason.into());
    }

    fn write(&mut self, dst: u8, value: i64) -> Option<i64> {
        match self.stuck {
            Some(stuck) if stuck.index == dst => Some(stuck.value),
            _ => {
                self.registers[dst as usize] = value;
                None
            }
        }
    }

    fn operands_valid(&self, ins: &Instruction) -> bool {
        ins.registers().iter().all(|&r| (r as usize) < self.registers.len())
    }
}

pub struct CpuMachine {
    config: CpuConfig,
}

impl CpuMachine {
    /// Creates a CPU with a validated program.
    pub fn new(config: CpuConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The default four-instruction lesson program.
    pub fn standard() -> Self {
        Self {
            config: CpuConfig::default(),
        }
    }
}

impl Machine for CpuMachine {
    type State = CpuState;

    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: ID,
            title: TITLE,
            category: "hardware",
        }
    }

    fn init(&self) -> CpuState {
        CpuState {
            program: self.config.program.clone(),
            pc: 0,
            registers: vec![0; self.config.registers],
            phase: Phase::Fetch,
            fetched: None,
            halt_reason: None,
            stuck: None,
            retired: 0,
        }
    }

    fn transition(&self, state: &mut CpuState, cx: &mut StepCx<'_>) -> Result<(), ModuleError> {
        match state.phase {
            Phase::Halted => {
                cx.info(format!(
                    "CPU halted ({}); tick ignored",
                    state.halt_reason.as_deref().unwrap_or("unknown")
                ));
            }
            Phase::Fetch => {
                if state.pc >= state.program.len() {
                    let reason = format!("PC {} out of bounds", state.pc);
                    cx.info(format!("fetch failed: {}, halting", reason));
                    state.halt(reason);
                    return Ok(());
                }
                let ins = state.program[state.pc];
                state.fetched = Some(ins);
                state.phase = Phase::Decode;
                cx.info(format!("fetch [{}]: {}", state.pc, ins.asm()));
            }
            Phase::Decode => {
                let ins = state
                    .fetched
                    .ok_or_else(|| ModuleError::Internal("decode with empty instruction register".into()))?;
                if !state.operands_valid(&ins) {
                    let reason = format!("illegal instruction {} at PC {}", ins.asm(), state.pc);
                    cx.info(format!("decode failed: {}", reason));
                    state.halt(reason);
                    return Ok(());
                }
                state.phase = Phase::Execute;
                cx.info(format!("decode: {}", ins.describe()));
            }
            Phase::Execute => {
                let ins = state
                    .fetched
                    .take()
                    .ok_or_else(|| ModuleError::Internal("execute with empty instruction register".into()))?;
                let suppressed = match ins {
                    Instruction::Mov { dst, value } => state.write(dst, value).map(|v| (dst, v)),
                    Instruction::Copy { dst, src } => {
                        let v = state.registers[src as usize];
                        state.write(dst, v).map(|v| (dst, v))
                    }
                    Instruction::Add { dst, a, b } => {
                        let v = state.registers[a as usize].wrapping_add(state.registers[b as usize]);
                        state.write(dst, v).map(|v| (dst, v))
                    }
                    Instruction::Sub { dst, a, b } => {
                        let v = state.registers[a as usize].wrapping_sub(state.registers[b as usize]);
                        state.write(dst, v).map(|v| (dst, v))
                    }
                    Instruction::Halt => {
                        state.retired += 1;
                        cx.ok("executed HALT");
                        state.halt("HALT instruction");
                        return Ok(());
                    }
                };
                state.retired += 1;
                state.pc += 1;
                state.phase = Phase::Fetch;

                match suppressed {
                    Some((dst, held)) => cx.info(format!(
                        "executed {} but R{} is stuck at {}",
                        ins.asm(),
                        dst,
                        held
                    )),
                    None => cx.ok(format!("executed {}", ins.asm())),
                }

                if state.pc >= state.program.len() {
                    cx.ok(format!("program complete after {} instructions", state.retired));
                    state.halt(format!("PC {} past end of program", state.pc));
                }
            }
        }
        Ok(())
    }

    fn snapshot(state: &CpuState) -> Snapshot {
        Snapshot::Cpu(state.clone())
    }

    fn check(&self, state: &CpuState) -> Result<(), String> {
        if state.registers.len() != self.config.registers {
            return Err(format!(
                "register file has {} entries, expected {}",
                state.registers.len(),
                self.config.registers
            ));
        }
        match state.phase {
            Phase::Decode | Phase::Execute if state.fetched.is_none() => {
                Err(format!("{:?} phase with empty instruction register", state.phase))
            }
            Phase::Halted if state.halt_reason.is_none() => Err("halted without a reason".to_string()),
            _ => Ok(()),
        }
    }

    fn faults(&self) -> ActionTable<Self> {
        ActionTable::new()
            .with("halt", "Assert the HALT line", ActionKind::OneShot, |_, state: &mut CpuState, _| {
                if state.is_halted() {
                    return Ok("CPU already halted".to_string());
                }
                state.halt("HALT fault");
                Ok(format!("HALT asserted at PC {}", state.pc))
            })
            .with(
                "stick_r2",
                "Stick R2 at its current value",
                ActionKind::Sticky,
                |_, state: &mut CpuState, _| {
                    if let Some(stuck) = state.stuck {
                        return Ok(format!("R{} already stuck at {}", stuck.index, stuck.value));
                    }
                    let value = state.registers[STUCK_REGISTER as usize];
                    state.stuck = Some(StuckRegister {
                        index: STUCK_REGISTER,
                        value,
                    });
                    Ok(format!("R{} stuck at {}", STUCK_REGISTER, value))
                },
            )
            .with("unstick", "Release the stuck register", ActionKind::Clear, |_, state: &mut CpuState, _| {
                Ok(match state.stuck.take() {
                    Some(stuck) => format!("R{} released", stuck.index),
                    None => "no register was stuck".to_string(),
                })
            })
            .with(
                "flip_r1_bit",
                "Flip the low bit of R1",
                ActionKind::OneShot,
                |_, state: &mut CpuState, _| {
                    let r = &mut state.registers[FLIP_REGISTER as usize];
                    let before = *r;
                    *r ^= 1;
                    Ok(format!("R{} bit 0 flipped: {} -> {}", FLIP_REGISTER, before, *r))
                },
            )
            .with(
                "corrupt_pc",
                "Corrupt the program counter",
                ActionKind::OneShot,
                |_, state: &mut CpuState, _| {
                    if state.is_halted() {
                        return Ok("CPU halted; PC left unchanged".to_string());
                    }
                    let before = state.pc;
                    state.pc = state.program.len() + 3;
                    Ok(format!("PC corrupted: {} -> {}", before, state.pc))
                },
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::module::{Instance, Module};

    fn run(module: &mut Instance<CpuMachine>, ticks: u64) -> Vec<lessonlab_env::LogEntry> {
        let mut lines = Vec::new();
        for t in 0..ticks {
            let mut journal = Journal::new(t);
            module.transition(t, &mut journal).unwrap();
            lines.extend(journal.into_entries());
        }
        lines
    }

    #[test]
    fn test_program_computes_r3() {
        let mut module = Instance::new(CpuMachine::standard(), 0);
        run(&mut module, 12);

        assert_eq!(module.state().registers, vec![5, 3, 8, 8]);
        assert!(module.state().is_halted());
        assert_eq!(module.state().retired, 4);
    }

    #[test]
    fn test_one_phase_per_tick() {
        let mut module = Instance::new(CpuMachine::standard(), 0);
        let mut phases = Vec::new();
        for t in 0..3 {
            let mut journal = Journal::new(t);
            module.transition(t, &mut journal).unwrap();
            phases.push(module.state().phase);
        }
        assert_eq!(phases, vec![Phase::Decode, Phase::Execute, Phase::Fetch]);
        assert_eq!(module.state().registers[0], 5);
    }

    #[test]
    fn test_halted_ticks_are_logged_noops() {
        let mut module = Instance::new(CpuMachine::standard(), 0);
        run(&mut module, 12);
        let halted = module.snapshot();

        let lines = run(&mut module, 3);
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.message.contains("halted")));
        assert_eq!(module.snapshot(), halted);
    }

    #[test]
    fn test_halt_fault_is_terminal() {
        let mut module = Instance::new(CpuMachine::standard(), 0);
        run(&mut module, 4);
        module.inject("halt", 4).unwrap();
        run(&mut module, 10);

        assert!(module.state().is_halted());
        assert_eq!(module.state().registers[1], 0);
    }

    #[test]
    fn test_stuck_register_holds_value() {
        let mut module = Instance::new(CpuMachine::standard(), 0);
        module.inject("stick_r2", 0).unwrap();
        run(&mut module, 12);

        assert_eq!(module.state().registers, vec![5, 3, 0, 0]);
    }

    #[test]
    fn test_corrupt_pc_halts_on_next_fetch() {
        let mut module = Instance::new(CpuMachine::standard(), 0);
        run(&mut module, 3);
        module.inject("corrupt_pc", 3).unwrap();
        run(&mut module, 1);

        assert!(module.state().is_halted());
        assert!(module.state().halt_reason.as_deref().unwrap().contains("out of bounds"));
    }

    #[test]
    fn test_halt_instruction() {
        let config = CpuConfig {
            program: vec![Instruction::Mov { dst: 0, value: 1 }, Instruction::Halt, Instruction::Mov { dst: 0, value: 2 }],
            registers: 4,
        };
        let mut module = Instance::new(CpuMachine::new(config).unwrap(), 0);
        run(&mut module, 9);

        assert!(module.state().is_halted());
        assert_eq!(module.state().registers[0], 1);
    }

    #[test]
    fn test_config_rejects_unknown_register() {
        let config = CpuConfig {
            program: vec![Instruction::Mov { dst: 9, value: 1 }],
            registers: 4,
        };
        assert!(CpuMachine::new(config).is_err());
    }
}
