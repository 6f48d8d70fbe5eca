//! TCP transfer: reliable delivery over a lossy network.
//!
//! The message is split into one packet per character. Ticks alternate
//! between putting packets on the wire and delivering what is in flight.
//! Lost packets are noticed on the following tick and retransmitted with
//! an incremented attempt count; the receiver reassembles by sequence
//! number and discards duplicates.

use crate::action::{ActionKind, ActionTable};
use crate::journal::StepCx;
use crate::module::{Machine, ModuleDescriptor, ModuleError};
use crate::snapshot::Snapshot;
use lessonlab_env::SimError;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const ID: &str = "tcp";
pub const TITLE: &str = "How data travels across the internet";

const LOSS_SALT: u64 = 0x7c9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    pub message: String,

    /// Per-packet loss probability while the lossy-link fault is active
    pub loss_chance: f64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            message: "HELLO".to_string(),
            loss_chance: 0.5,
        }
    }
}

impl TcpConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        let len = self.message.chars().count();
        if len == 0 || len > 64 {
            return Err(SimError::config(format!("tcp: message length {} outside 1..=64", len)));
        }
        if !(0.0..=1.0).contains(&self.loss_chance) {
            return Err(SimError::config(format!("tcp: loss_chance {} outside [0, 1]", self.loss_chance)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketState {
    Pending,
    InTransit,
    Delivered,
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub seq: usize,
    pub payload: char,
    pub state: PacketState,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpState {
    pub packets: Vec<Packet>,

    /// Receiver buffer indexed by sequence number
    pub received: Vec<Option<char>>,

    /// Reassembled message once complete
    pub assembled: Option<String>,

    pub retransmissions: u64,
    pub duplicates_discarded: u64,

    /// Lossy-link fault active
    pub lossy_link: bool,

    /// Next delivery is duplicated on the wire
    pub duplicate_next: bool,
}

impl TcpState {
    pub fn count(&self, state: PacketState) -> usize {
        self.packets.iter().filter(|p| p.state == state).count()
    }

    pub fn is_complete(&self) -> bool {
        self.assembled.is_some()
    }

    /// Receiver-side acceptance; returns false for a duplicate.
    fn accept(&mut self, seq: usize, payload: char) -> bool {
        match self.received.get_mut(seq) {
            Some(slot @ None) => {
                *slot = Some(payload);
                true
            }
            _ => {
                self.duplicates_discarded += 1;
                false
            }
        }
    }
}

pub struct TcpMachine {
    config: TcpConfig,
}

impl TcpMachine {
    pub fn new(config: TcpConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn standard() -> Self {
        Self {
            config: TcpConfig::default(),
        }
    }

    fn deliver(&self, state: &mut TcpState, cx: &mut StepCx<'_>) {
        let mut rng = cx.rng(LOSS_SALT);
        let mut lost = Vec::new();
        let mut delivered = 0;

        for i in 0..state.packets.len() {
            if state.packets[i].state != PacketState::InTransit {
                continue;
            }
            if state.lossy_link && rng.gen_bool(self.config.loss_chance) {
                state.packets[i].state = PacketState::Lost;
                lost.push(state.packets[i].seq);
                continue;
            }
            state.packets[i].state = PacketState::Delivered;
            let (seq, payload) = (state.packets[i].seq, state.packets[i].payload);
            state.accept(seq, payload);
            delivered += 1;

            if state.duplicate_next {
                state.duplicate_next = false;
                state.accept(seq, payload);
                cx.info(format!("duplicate of seq {} arrived and was discarded", seq));
            }
        }

        if !lost.is_empty() {
            cx.info(format!("lossy link dropped seq {:?}", lost));
        }
        if delivered > 0 {
            cx.info(format!("{} packet(s) delivered", delivered));
        }

        if state.packets.iter().all(|p| p.state == PacketState::Delivered) {
            let message: String = state.received.iter().flatten().collect();
            cx.ok(format!(
                "all {} packets delivered; receiver reassembled \"{}\"",
                state.packets.len(),
                message
            ));
            state.assembled = Some(message);
        }
    }
}

impl Machine for TcpMachine {
    type State = TcpState;

    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: ID,
            title: TITLE,
            category: "backend",
        }
    }

    fn init(&self) -> TcpState {
        let packets: Vec<Packet> = self
            .config
            .message
            .chars()
            .enumerate()
            .map(|(seq, payload)| Packet {
                seq,
                payload,
                state: PacketState::Pending,
                attempts: 1,
            })
            .collect();
        TcpState {
            received: vec![None; packets.len()],
            packets,
            assembled: None,
            retransmissions: 0,
            duplicates_discarded: 0,
            lossy_link: false,
            duplicate_next: false,
        }
    }

    fn transition(&self, state: &mut TcpState, cx: &mut StepCx<'_>) -> Result<(), ModuleError> {
        if state.is_complete() {
            cx.info("connection idle: message already delivered");
            return Ok(());
        }

        let lost: Vec<usize> = state
            .packets
            .iter()
            .filter(|p| p.state == PacketState::Lost)
            .map(|p| p.seq)
            .collect();
        if !lost.is_empty() {
            for packet in state.packets.iter_mut().filter(|p| p.state == PacketState::Lost) {
                packet.state = PacketState::InTransit;
                packet.attempts += 1;
            }
            state.retransmissions += lost.len() as u64;
            cx.info(format!("timeout: retransmitting seq {:?}", lost));
            return Ok(());
        }

        let pending = state.count(PacketState::Pending);
        if pending > 0 {
            for packet in state.packets.iter_mut().filter(|p| p.state == PacketState::Pending) {
                packet.state = PacketState::InTransit;
            }
            cx.info(format!("sent {} packet(s)", pending));
            return Ok(());
        }

        self.deliver(state, cx);
        Ok(())
    }

    fn snapshot(state: &TcpState) -> Snapshot {
        Snapshot::Tcp(state.clone())
    }

    fn check(&self, state: &TcpState) -> Result<(), String> {
        if state.received.len() != state.packets.len() {
            return Err("receiver buffer size mismatch".to_string());
        }
        for p in &state.packets {
            if p.state == PacketState::Delivered && state.received[p.seq] != Some(p.payload) {
                return Err(format!("seq {} delivered but missing at receiver", p.seq));
            }
        }
        Ok(())
    }

    fn faults(&self) -> ActionTable<Self> {
        ActionTable::new()
            .with("drop_packet", "Drop a packet", ActionKind::OneShot, |_, state: &mut TcpState, cx| {
                let candidates: Vec<usize> = state
                    .packets
                    .iter()
                    .filter(|p| matches!(p.state, PacketState::Pending | PacketState::InTransit))
                    .map(|p| p.seq)
                    .collect();
                match candidates.choose(&mut cx.rng()) {
                    Some(&seq) => {
                        state.packets[seq].state = PacketState::Lost;
                        Ok(format!("packet seq {} ('{}') dropped", seq, state.packets[seq].payload))
                    }
                    None => Ok("no packet in flight to drop".to_string()),
                }
            })
            .with(
                "duplicate_packet",
                "Duplicate the next delivery",
                ActionKind::OneShot,
                |_, state: &mut TcpState, _| {
                    state.duplicate_next = true;
                    Ok("next delivered packet will arrive twice".to_string())
                },
            )
            .with("lossy_link", "Make the link lossy", ActionKind::Sticky, |m: &TcpMachine, state: &mut TcpState, _| {
                if state.lossy_link {
                    return Ok("link already lossy".to_string());
                }
                state.lossy_link = true;
                Ok(format!("link now drops {:.0}% of packets", m.config.loss_chance * 100.0))
            })
            .with("repair_link", "Repair the link", ActionKind::Clear, |_, state: &mut TcpState, _| {
                let was = std::mem::replace(&mut state.lossy_link, false);
                Ok(if was { "link repaired" } else { "link was healthy" }.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::module::{Instance, Module};

    fn run(module: &mut Instance<TcpMachine>, from: u64, ticks: u64) {
        for t in from..from + ticks {
            let mut journal = Journal::new(t);
            module.transition(t, &mut journal).unwrap();
        }
    }

    #[test]
    fn test_clean_transfer_takes_two_ticks() {
        let mut module = Instance::new(TcpMachine::standard(), 3);
        run(&mut module, 0, 2);

        assert_eq!(module.state().assembled.as_deref(), Some("HELLO"));
        assert_eq!(module.state().retransmissions, 0);
    }

    #[test]
    fn test_dropped_packet_is_retransmitted() {
        let mut module = Instance::new(TcpMachine::standard(), 3);
        run(&mut module, 0, 1);
        module.inject("drop_packet", 1).unwrap();
        assert_eq!(module.state().count(PacketState::Lost), 1);

        // retransmit, deliver, idle
        run(&mut module, 1, 3);
        let state = module.state();
        assert_eq!(state.assembled.as_deref(), Some("HELLO"));
        assert_eq!(state.retransmissions, 1);
        assert!(state.packets.iter().any(|p| p.attempts == 2));
    }

    #[test]
    fn test_duplicate_is_discarded() {
        let mut module = Instance::new(TcpMachine::standard(), 3);
        module.inject("duplicate_packet", 0).unwrap();
        run(&mut module, 0, 2);

        assert_eq!(module.state().duplicates_discarded, 1);
        assert_eq!(module.state().assembled.as_deref(), Some("HELLO"));
    }

    #[test]
    fn test_lossy_link_eventually_delivers_after_repair() {
        let mut module = Instance::new(TcpMachine::standard(), 3);
        module.inject("lossy_link", 0).unwrap();
        run(&mut module, 0, 6);
        module.inject("repair_link", 6).unwrap();
        run(&mut module, 6, 4);

        assert_eq!(module.state().assembled.as_deref(), Some("HELLO"));
    }

    #[test]
    fn test_idle_after_completion() {
        let mut module = Instance::new(TcpMachine::standard(), 3);
        run(&mut module, 0, 2);
        let done = module.snapshot();
        run(&mut module, 2, 3);
        assert_eq!(module.snapshot(), done);
    }
}
