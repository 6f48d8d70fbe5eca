//! Logic gates: two inputs walking the truth table.
//!
//! Each tick advances (A, B) to the next row of 00, 01, 10, 11 and
//! re-evaluates AND, OR, NOT (of A), XOR, NAND and NOR.

use crate::action::{ActionKind, ActionTable};
use crate::journal::StepCx;
use crate::module::{Machine, ModuleDescriptor, ModuleError};
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};

pub const ID: &str = "gates";
pub const TITLE: &str = "Logic gates";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Gate {
    And,
    Or,
    Not,
    Xor,
    Nand,
    Nor,
}

impl Gate {
    pub const ALL: [Gate; 6] = [Gate::And, Gate::Or, Gate::Not, Gate::Xor, Gate::Nand, Gate::Nor];

    pub fn eval(self, a: bool, b: bool) -> bool {
        match self {
            Gate::And => a && b,
            Gate::Or => a || b,
            Gate::Not => !a,
            Gate::Xor => a ^ b,
            Gate::Nand => !(a && b),
            Gate::Nor => !(a || b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutput {
    pub gate: Gate,
    pub output: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatesState {
    pub a: bool,
    pub b: bool,
    pub outputs: Vec<GateOutput>,

    /// AND output forced high
    pub and_stuck_high: bool,
}

impl GatesState {
    fn evaluate(&mut self) {
        let (a, b, stuck) = (self.a, self.b, self.and_stuck_high);
        self.outputs = Gate::ALL
            .iter()
            .map(|&gate| GateOutput {
                gate,
                output: if gate == Gate::And && stuck { true } else { gate.eval(a, b) },
            })
            .collect();
    }

    pub fn output(&self, gate: Gate) -> bool {
        self.outputs
            .iter()
            .find(|o| o.gate == gate)
            .map(|o| o.output)
            .unwrap_or(false)
    }
}

#[derive(Default)]
pub struct GatesMachine;

impl Machine for GatesMachine {
    type State = GatesState;

    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: ID,
            title: TITLE,
            category: "hardware",
        }
    }

    fn init(&self) -> GatesState {
        let mut state = GatesState {
            a: false,
            b: false,
            outputs: Vec::new(),
            and_stuck_high: false,
        };
        state.evaluate();
        state
    }

    fn transition(&self, state: &mut GatesState, cx: &mut StepCx<'_>) -> Result<(), ModuleError> {
        let row = ((state.a as u8) << 1 | state.b as u8).wrapping_add(1) & 0b11;
        state.a = row & 0b10 != 0;
        state.b = row & 0b01 != 0;
        state.evaluate();

        let rendered: Vec<String> = state
            .outputs
            .iter()
            .map(|o| format!("{:?}={}", o.gate, o.output as u8))
            .collect();
        cx.info(format!(
            "A={} B={} -> {}",
            state.a as u8,
            state.b as u8,
            rendered.join(" ")
        ));
        Ok(())
    }

    fn snapshot(state: &GatesState) -> Snapshot {
        Snapshot::Gates(state.clone())
    }

    fn check(&self, state: &GatesState) -> Result<(), String> {
        if state.outputs.len() != Gate::ALL.len() {
            return Err(format!("expected {} gate outputs, found {}", Gate::ALL.len(), state.outputs.len()));
        }
        Ok(())
    }

    fn faults(&self) -> ActionTable<Self> {
        ActionTable::new()
            .with(
                "stuck_and_high",
                "Stick the AND output at 1",
                ActionKind::Sticky,
                |_, state: &mut GatesState, _| {
                    if state.and_stuck_high {
                        return Ok("AND output already stuck at 1".to_string());
                    }
                    state.and_stuck_high = true;
                    state.evaluate();
                    Ok("AND output stuck at 1".to_string())
                },
            )
            .with(
                "clear_stuck",
                "Release the AND output",
                ActionKind::Clear,
                |_, state: &mut GatesState, _| {
                    let was = std::mem::replace(&mut state.and_stuck_high, false);
                    state.evaluate();
                    Ok(if was { "AND output released" } else { "AND output was not stuck" }.to_string())
                },
            )
    }

    fn controls(&self) -> ActionTable<Self> {
        ActionTable::new()
            .with("toggle_a", "Toggle input A", ActionKind::Control, |_, state: &mut GatesState, _| {
                state.a = !state.a;
                state.evaluate();
                Ok(format!("A set to {}", state.a as u8))
            })
            .with("toggle_b", "Toggle input B", ActionKind::Control, |_, state: &mut GatesState, _| {
                state.b = !state.b;
                state.evaluate();
                Ok(format!("B set to {}", state.b as u8))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::module::{Instance, Module};

    #[test]
    fn test_truth_table_walk() {
        let mut module = Instance::new(GatesMachine, 0);
        let mut rows = Vec::new();
        for t in 0..4 {
            let mut journal = Journal::new(t);
            module.transition(t, &mut journal).unwrap();
            rows.push((module.state().a, module.state().b, module.state().output(Gate::Xor)));
        }
        assert_eq!(
            rows,
            vec![
                (false, true, true),
                (true, false, true),
                (true, true, false),
                (false, false, false),
            ]
        );
    }

    #[test]
    fn test_stuck_and_overrides_inputs() {
        let mut module = Instance::new(GatesMachine, 0);
        module.inject("stuck_and_high", 0).unwrap();
        assert!(module.state().output(Gate::And));
        assert!(!module.state().a && !module.state().b);

        module.inject("clear_stuck", 0).unwrap();
        assert!(!module.state().output(Gate::And));
    }

    #[test]
    fn test_controls_toggle_inputs() {
        let mut module = Instance::new(GatesMachine, 0);
        module.control("toggle_a", 0).unwrap();
        module.control("toggle_b", 0).unwrap();
        assert!(module.state().output(Gate::And));
        assert!(!module.state().output(Gate::Nor));
    }
}
