//! Load balancer: horizontal scaling under Poisson traffic.
//!
//! Each tick a Poisson-distributed burst of requests arrives at the
//! balancer, joins whatever is still queued, and is spread across the live
//! servers up to their per-tick capacity. Leftover work waits in a bounded
//! backlog; anything past the backlog is dropped. Every served request
//! bumps a counter shared by all servers.

use crate::action::{ActionKind, ActionTable};
use crate::journal::StepCx;
use crate::module::{Machine, ModuleDescriptor, ModuleError};
use crate::snapshot::Snapshot;
use lessonlab_env::SimError;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};

pub const ID: &str = "balancer";
pub const TITLE: &str = "How apps handle millions of users";

const ARRIVAL_SALT: u64 = 0xa221;
const RESTART_SALT: u64 = 0x5e2b;

const MAX_SERVERS: usize = 16;
const MAX_RPS: u32 = 100;
const RPS_STEP: u32 = 5;
const SPIKE_FACTOR: u32 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    pub servers: usize,

    /// Mean arrivals per tick
    pub rps: u32,

    /// Requests one server completes per tick
    pub server_capacity: u32,

    pub queue_capacity: u32,

    /// Per-tick chance a killed server comes back
    pub restart_chance: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            servers: 3,
            rps: 5,
            server_capacity: 10,
            queue_capacity: 20,
            restart_chance: 0.2,
        }
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if !(1..=MAX_SERVERS).contains(&self.servers) {
            return Err(SimError::config(format!("balancer: {} servers outside 1..={}", self.servers, MAX_SERVERS)));
        }
        if self.rps == 0 || self.rps > MAX_RPS {
            return Err(SimError::config(format!("balancer: rps {} outside 1..={}", self.rps, MAX_RPS)));
        }
        if self.server_capacity == 0 {
            return Err(SimError::config("balancer: server_capacity must be positive"));
        }
        if !(0.0..=1.0).contains(&self.restart_chance) {
            return Err(SimError::config(format!(
                "balancer: restart_chance {} outside [0, 1]",
                self.restart_chance
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: usize,
    pub alive: bool,

    /// Requests handled on the last tick
    pub load: u32,

    pub served: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerState {
    pub servers: Vec<Server>,
    pub rps: u32,
    pub capacity_per_server: u32,

    /// Traffic spike fault active
    pub spike: bool,

    pub queue: u32,
    pub queue_capacity: u32,

    pub arrived: u64,
    pub served: u64,
    pub dropped: u64,

    /// Counter every server increments once per request
    pub counter: u64,
    pub lost_updates: u64,

    /// Next tick's counter writes race
    pub race_armed: bool,
}

impl BalancerState {
    pub fn live(&self) -> usize {
        self.servers.iter().filter(|s| s.alive).count()
    }

    /// Requests per tick the live servers can absorb.
    pub fn capacity(&self) -> u32 {
        self.live() as u32 * self.capacity_per_server
    }

    pub fn effective_rps(&self) -> u32 {
        if self.spike {
            self.rps * SPIKE_FACTOR
        } else {
            self.rps
        }
    }

    pub fn is_overloaded(&self) -> bool {
        self.effective_rps() > self.capacity()
    }
}

pub struct BalancerMachine {
    config: BalancerConfig,
}

impl BalancerMachine {
    pub fn new(config: BalancerConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn standard() -> Self {
        Self {
            config: BalancerConfig::default(),
        }
    }
}

impl Machine for BalancerMachine {
    type State = BalancerState;

    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: ID,
            title: TITLE,
            category: "backend",
        }
    }

    fn init(&self) -> BalancerState {
        BalancerState {
            servers: (0..self.config.servers)
                .map(|id| Server {
                    id,
                    alive: true,
                    load: 0,
                    served: 0,
                })
                .collect(),
            rps: self.config.rps,
            capacity_per_server: self.config.server_capacity,
            spike: false,
            queue: 0,
            queue_capacity: self.config.queue_capacity,
            arrived: 0,
            served: 0,
            dropped: 0,
            counter: 0,
            lost_updates: 0,
            race_armed: false,
        }
    }

    fn transition(&self, state: &mut BalancerState, cx: &mut StepCx<'_>) -> Result<(), ModuleError> {
        let mut restart_rng = cx.rng(RESTART_SALT);
        for server in state.servers.iter_mut().filter(|s| !s.alive) {
            if restart_rng.gen_bool(self.config.restart_chance) {
                server.alive = true;
                cx.info(format!("server {} restarted", server.id));
            }
        }

        let poisson = Poisson::new(state.effective_rps() as f64)
            .map_err(|e| ModuleError::Internal(format!("arrival distribution: {}", e)))?;
        let arrivals = poisson.sample(&mut cx.rng(ARRIVAL_SALT)) as u32;
        state.arrived += arrivals as u64;

        let mut work = state.queue + arrivals;
        let mut served = 0;
        // round-robin, one full server at a time
        for server in state.servers.iter_mut() {
            server.load = if server.alive { work.min(state.capacity_per_server) } else { 0 };
            server.served += server.load as u64;
            work -= server.load;
            served += server.load;
        }
        state.served += served as u64;

        let backlog = work.min(state.queue_capacity);
        let dropped = work - backlog;
        state.queue = backlog;
        state.dropped += dropped as u64;

        if state.race_armed && served >= 2 {
            // two servers read the same value and both write it back + 1
            state.counter += served as u64 - 1;
            state.lost_updates += 1;
            state.race_armed = false;
            cx.info(format!(
                "race on shared counter: {} requests served but counter rose by {}",
                served,
                served - 1
            ));
        } else {
            state.counter += served as u64;
        }

        if state.live() == 0 {
            cx.info(format!("all servers down; {} requests arrived with nowhere to go", arrivals));
        } else {
            cx.info(format!(
                "{} arrived, {} served by {} server(s), {} queued",
                arrivals,
                served,
                state.live(),
                state.queue
            ));
        }
        if dropped > 0 {
            cx.info(format!("backlog full: {} requests dropped", dropped));
        }
        Ok(())
    }

    fn snapshot(state: &BalancerState) -> Snapshot {
        Snapshot::Balancer(state.clone())
    }

    fn check(&self, state: &BalancerState) -> Result<(), String> {
        if state.queue > state.queue_capacity {
            return Err(format!("queue {} exceeds capacity {}", state.queue, state.queue_capacity));
        }
        if state.counter + state.lost_updates != state.served {
            return Err(format!(
                "counter {} + lost {} disagrees with served {}",
                state.counter, state.lost_updates, state.served
            ));
        }
        if let Some(s) = state.servers.iter().find(|s| s.load > state.capacity_per_server || (!s.alive && s.load > 0)) {
            return Err(format!("server {} load {} out of bounds", s.id, s.load));
        }
        Ok(())
    }

    fn faults(&self) -> ActionTable<Self> {
        ActionTable::new()
            .with("kill_server", "Kill a server", ActionKind::OneShot, |_, state: &mut BalancerState, cx| {
                let live: Vec<usize> = state.servers.iter().filter(|s| s.alive).map(|s| s.id).collect();
                match live.choose(&mut cx.rng()) {
                    Some(&id) => {
                        let server = &mut state.servers[id];
                        server.alive = false;
                        server.load = 0;
                        Ok(format!("server {} crashed; {} left", id, live.len() - 1))
                    }
                    None => Ok("no live server to kill".to_string()),
                }
            })
            .with("restart_all", "Restart every server", ActionKind::Clear, |_, state: &mut BalancerState, _| {
                let down = state.servers.iter().filter(|s| !s.alive).count();
                for server in state.servers.iter_mut() {
                    server.alive = true;
                }
                Ok(format!("{} server(s) restarted", down))
            })
            .with("traffic_spike", "Quadruple incoming traffic", ActionKind::Sticky, |_, state: &mut BalancerState, _| {
                if state.spike {
                    return Ok("traffic spike already in progress".to_string());
                }
                state.spike = true;
                Ok(format!(
                    "traffic spike: {} req/tick against capacity {}",
                    state.effective_rps(),
                    state.capacity()
                ))
            })
            .with("traffic_normal", "End the traffic spike", ActionKind::Clear, |_, state: &mut BalancerState, _| {
                let was = std::mem::replace(&mut state.spike, false);
                Ok(if was { "traffic back to normal" } else { "traffic was normal" }.to_string())
            })
            .with(
                "lost_update",
                "Race two writes to the shared counter",
                ActionKind::OneShot,
                |_, state: &mut BalancerState, _| {
                    state.race_armed = true;
                    Ok("next counter update will race without a lock".to_string())
                },
            )
    }

    fn controls(&self) -> ActionTable<Self> {
        ActionTable::new()
            .with("add_server", "Add a server", ActionKind::Control, |_, state: &mut BalancerState, _| {
                if state.servers.len() >= MAX_SERVERS {
                    return Ok(format!("already at the {} server limit", MAX_SERVERS));
                }
                let id = state.servers.len();
                state.servers.push(Server {
                    id,
                    alive: true,
                    load: 0,
                    served: 0,
                });
                Ok(format!("server {} added; capacity now {} req/tick", id, state.capacity()))
            })
            .with("rps_up", "Raise traffic", ActionKind::Control, |_, state: &mut BalancerState, _| {
                state.rps = (state.rps + RPS_STEP).min(MAX_RPS);
                Ok(format!("traffic now {} req/tick", state.rps))
            })
            .with("rps_down", "Lower traffic", ActionKind::Control, |_, state: &mut BalancerState, _| {
                state.rps = state.rps.saturating_sub(RPS_STEP).max(1);
                Ok(format!("traffic now {} req/tick", state.rps))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::module::{Instance, Module};

    fn run(module: &mut Instance<BalancerMachine>, from: u64, ticks: u64) {
        for t in from..from + ticks {
            let mut journal = Journal::new(t);
            module.transition(t, &mut journal).unwrap();
        }
    }

    #[test]
    fn test_light_load_never_queues() {
        let mut module = Instance::new(
            BalancerMachine::new(BalancerConfig {
                servers: 4,
                rps: 1,
                ..BalancerConfig::default()
            })
            .unwrap(),
            11,
        );
        run(&mut module, 0, 20);

        let state = module.state();
        assert_eq!(state.dropped, 0);
        assert_eq!(state.served, state.arrived - state.queue as u64);
        assert_eq!(state.counter, state.served);
    }

    #[test]
    fn test_spike_overflows_single_server() {
        let mut module = Instance::new(
            BalancerMachine::new(BalancerConfig {
                servers: 1,
                rps: 20,
                queue_capacity: 5,
                ..BalancerConfig::default()
            })
            .unwrap(),
            11,
        );
        module.inject("traffic_spike", 0).unwrap();
        assert!(module.state().is_overloaded());
        run(&mut module, 0, 10);

        let state = module.state();
        assert!(state.dropped > 0);
        assert_eq!(state.queue, 5);
    }

    #[test]
    fn test_lost_update_breaks_counter_once() {
        let mut module = Instance::new(
            BalancerMachine::new(BalancerConfig {
                rps: 20,
                ..BalancerConfig::default()
            })
            .unwrap(),
            5,
        );
        module.inject("lost_update", 0).unwrap();
        run(&mut module, 0, 5);

        let state = module.state();
        assert_eq!(state.lost_updates, 1);
        assert_eq!(state.counter, state.served - 1);
    }

    #[test]
    fn test_kill_and_restart() {
        let config = BalancerConfig {
            restart_chance: 0.0,
            ..BalancerConfig::default()
        };
        let mut module = Instance::new(BalancerMachine::new(config).unwrap(), 5);
        module.inject("kill_server", 0).unwrap();
        module.inject("kill_server", 0).unwrap();
        assert_eq!(module.state().live(), 1);

        run(&mut module, 0, 3);
        assert_eq!(module.state().live(), 1);

        module.inject("restart_all", 3).unwrap();
        assert_eq!(module.state().live(), 3);
    }

    #[test]
    fn test_controls_scale_out() {
        let mut module = Instance::new(BalancerMachine::standard(), 5);
        module.control("add_server", 0).unwrap();
        module.control("rps_up", 0).unwrap();
        assert_eq!(module.state().servers.len(), 4);
        assert_eq!(module.state().rps, 10);

        module.control("rps_down", 0).unwrap();
        module.control("rps_down", 0).unwrap();
        assert_eq!(module.state().rps, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = BalancerConfig {
            servers: 0,
            ..BalancerConfig::default()
        };
        assert!(BalancerMachine::new(config).is_err());
    }
}
