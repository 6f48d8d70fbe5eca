//! Bits: an 8-bit register counting up one per tick.
//!
//! Covers the "what is a bit" and "bits become numbers" lessons. Every tick
//! increments the register; the snapshot carries the binary, decimal, hex
//! and printable-character views of the same byte.
//!
//! Faults:
//! - `stuck_bit_3` (sticky): bit 3 keeps its current value through every
//!   later write until `clear_stuck` or reset.
//! - `flip_random_bit` (one-shot): a seeded single-bit upset.

use crate::action::{ActionKind, ActionTable};
use crate::journal::StepCx;
use crate::module::{Machine, ModuleDescriptor, ModuleError};
use crate::snapshot::Snapshot;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const ID: &str = "bits";
pub const TITLE: &str = "Bits and binary numbers";

const STUCK_BIT: u8 = 3;

/// Configuration for the bits lesson.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitsConfig {
    /// Register value at init (the lesson opens on 0b1010_0101)
    pub initial: u8,
}

impl Default for BitsConfig {
    fn default() -> Self {
        Self { initial: 0b1010_0101 }
    }
}

/// A single stuck-at condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckBit {
    pub bit: u8,
    pub level: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitsState {
    /// Register contents
    pub value: u8,

    /// MSB-first rendering, e.g. "10100101"
    pub binary: String,

    /// Upper-case hex, e.g. "0xA5"
    pub hex: String,

    /// Printable ASCII character, if any
    pub ascii: Option<char>,

    /// Active stuck-at fault
    pub stuck: Option<StuckBit>,

    /// Number of increments performed
    pub increments: u64,
}

impl BitsState {
    fn new(value: u8) -> Self {
        let mut state = Self {
            value,
            binary: String::new(),
            hex: String::new(),
            ascii: None,
            stuck: None,
            increments: 0,
        };
        state.store(value);
        state
    }

    /// Writes a value through the stuck-at mask and refreshes the views.
    fn store(&mut self, raw: u8) {
        let value = match self.stuck {
            Some(StuckBit { bit, level: true }) => raw | (1 << bit),
            Some(StuckBit { bit, level: false }) => raw & !(1 << bit),
            None => raw,
        };
        self.value = value;
        self.binary = format!("{:08b}", value);
        self.hex = format!("0x{:02X}", value);
        self.ascii = (32..127).contains(&value).then(|| value as char);
    }

    pub fn bit(&self, index: u8) -> bool {
        self.value & (1 << index) != 0
    }
}

pub struct BitsMachine {
    config: BitsConfig,
}

impl BitsMachine {
    pub fn new(config: BitsConfig) -> Self {
        Self { config }
    }
}

impl Machine for BitsMachine {
    type State = BitsState;

    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: ID,
            title: TITLE,
            category: "hardware",
        }
    }

    fn init(&self) -> BitsState {
        BitsState::new(self.config.initial)
    }

    fn transition(&self, state: &mut BitsState, cx: &mut StepCx<'_>) -> Result<(), ModuleError> {
        let before = state.value;
        state.store(before.wrapping_add(1));
        state.increments += 1;

        if before == u8::MAX {
            cx.info("register overflowed: 0xFF + 1 wraps to 0x00");
        }
        match state.stuck {
            Some(stuck) if state.value != before.wrapping_add(1) => cx.info(format!(
                "wrote {:08b} but bit {} is stuck at {}, reads {}",
                before.wrapping_add(1),
                stuck.bit,
                stuck.level as u8,
                state.binary
            )),
            _ => cx.info(format!(
                "{} = {} = {}",
                state.binary, state.value, state.hex
            )),
        }
        Ok(())
    }

    fn snapshot(state: &BitsState) -> Snapshot {
        Snapshot::Bits(state.clone())
    }

    fn check(&self, state: &BitsState) -> Result<(), String> {
        if state.binary != format!("{:08b}", state.value) {
            return Err(format!("binary view {} out of sync with {}", state.binary, state.value));
        }
        Ok(())
    }

    fn faults(&self) -> ActionTable<Self> {
        ActionTable::new()
            .with(
                "stuck_bit_3",
                "Stick bit 3 at its current level",
                ActionKind::Sticky,
                |_, state: &mut BitsState, _| {
                    if let Some(stuck) = state.stuck {
                        return Ok(format!("bit {} already stuck at {}", stuck.bit, stuck.level as u8));
                    }
                    let level = state.bit(STUCK_BIT);
                    state.stuck = Some(StuckBit { bit: STUCK_BIT, level });
                    Ok(format!("bit {} stuck at {}", STUCK_BIT, level as u8))
                },
            )
            .with(
                "clear_stuck",
                "Release the stuck bit",
                ActionKind::Clear,
                |_, state: &mut BitsState, _| {
                    Ok(match state.stuck.take() {
                        Some(stuck) => format!("bit {} released", stuck.bit),
                        None => "no bit was stuck".to_string(),
                    })
                },
            )
            .with(
                "flip_random_bit",
                "Flip one random bit",
                ActionKind::OneShot,
                |_, state: &mut BitsState, cx| {
                    let bit: u8 = cx.rng().gen_range(0..8);
                    let raw = state.value ^ (1 << bit);
                    state.store(raw);
                    Ok(format!("bit {} flipped, register now {}", bit, state.binary))
                },
            )
    }

    fn controls(&self) -> ActionTable<Self> {
        let mut table = ActionTable::new();
        for bit in 0..8u8 {
            table.push(
                format!("flip_bit_{}", bit),
                format!("Flip bit {} (weight {})", bit, 1u16 << bit),
                ActionKind::Control,
                move |_, state: &mut BitsState, _| {
                    state.store(state.value ^ (1 << bit));
                    Ok(format!("bit {} toggled, register now {} ({})", bit, state.binary, state.value))
                },
            );
        }
        table
    }
}
