//! Consensus: leader election and quorum commit over a small cluster.
//!
//! Every tick each live leader heartbeats the nodes it can reach and
//! replicates one log entry. The entry commits once the leader plus the
//! followers that copied it form a strict majority of the whole cluster.
//! Followers that hear nothing count down a randomized election timer; at
//! zero they stand for election in a new term and win only with a
//! majority of votes from reachable nodes whose logs are no more up to date.
//!
//! Partitioning isolates a single node: it can neither send nor receive.
//! Crashed nodes are silent until they restart.
//!
//! Logs are compacted: each node folds committed entries into a base index
//! and keeps only a short tail, and only the most recent commit records are
//! retained. State size therefore stays constant however long the run.

use crate::action::{ActionKind, ActionTable};
use crate::journal::StepCx;
use crate::module::{Machine, ModuleDescriptor, ModuleError};
use crate::snapshot::Snapshot;
use lessonlab_env::SimError;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

pub const ID: &str = "consensus";
pub const TITLE: &str = "Consensus: agreeing when machines fail";

const TIMER_SALT: u64 = 0xe1ec;
const RESTART_SALT: u64 = 0x2e57;

/// Committed entries each node keeps visible after compaction
pub const LOG_TAIL: usize = 8;

/// Commit records retained in the state
pub const COMMIT_HISTORY: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub nodes: usize,

    /// Election timeout range in ticks, inclusive
    pub election_timeout_min: u32,
    pub election_timeout_max: u32,

    /// Per-tick chance that a crashed node comes back
    pub restart_chance: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            nodes: 5,
            election_timeout_min: 3,
            election_timeout_max: 6,
            restart_chance: 0.25,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if !(3..=9).contains(&self.nodes) {
            return Err(SimError::config(format!("consensus: {} nodes outside 3..=9", self.nodes)));
        }
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err(SimError::config(format!(
                "consensus: bad election timeout range {}..={}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if !(0.0..=1.0).contains(&self.restart_chance) {
            return Err(SimError::config(format!(
                "consensus: restart_chance {} outside [0, 1]",
                self.restart_chance
            )));
        }
        Ok(())
    }

    /// Smallest strict majority of the full cluster.
    pub fn majority(&self) -> usize {
        self.nodes / 2 + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Leader,
    Candidate,
    Follower,
}

/// One replicated log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: u64,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: usize,
    pub role: Role,
    pub term: u64,
    pub voted_for: Option<usize>,

    /// Entries folded away by compaction
    pub log_base: usize,

    /// Term of the last folded entry
    pub base_term: u64,

    /// Entries after `log_base`
    pub log: Vec<Entry>,

    /// Committed prefix length this node knows of
    pub commit: usize,

    /// Ticks left before this node stands for election
    pub countdown: u32,

    pub partitioned: bool,
    pub crashed: bool,
}

impl Node {
    fn is_live(&self) -> bool {
        !self.crashed
    }

    /// Full log length, folded entries included.
    pub fn log_len(&self) -> usize {
        self.log_base + self.log.len()
    }

    fn last_log(&self) -> (u64, usize) {
        (self.log.last().map(|e| e.term).unwrap_or(self.base_term), self.log_len())
    }

    /// Folds committed entries beyond the last `LOG_TAIL` into the base.
    fn compact(&mut self) {
        let committed = self.commit.saturating_sub(self.log_base).min(self.log.len());
        let folded = committed.min(self.log.len().saturating_sub(LOG_TAIL));
        if folded == 0 {
            return;
        }
        self.base_term = self.log[folded - 1].term;
        self.log.drain(..folded);
        self.log_base += folded;
    }

    /// Replaces this node's log with a copy of the leader's.
    fn adopt(&mut self, leader: &Node) {
        self.log_base = leader.log_base;
        self.base_term = leader.base_term;
        self.log.clone_from(&leader.log);
        self.commit = leader.commit;
    }

    fn step_down(&mut self, term: u64, countdown: u32) {
        self.role = Role::Follower;
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        self.countdown = countdown;
    }
}

/// Audit record written whenever the commit index advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Committed prefix length after this commit
    pub index: usize,
    pub term: u64,

    /// Leader plus followers holding the entry
    pub acks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusState {
    pub nodes: Vec<Node>,

    /// Highest-term live leader, if any
    pub leader: Option<usize>,

    /// Number of committed log entries
    pub commit_index: usize,

    /// Most recent commit records, oldest first
    pub commits: VecDeque<CommitRecord>,

    /// Commit records written over the whole run
    pub total_commits: usize,

    pub majority: usize,
    pub elections: u64,

    /// Next append to one follower is lost
    pub drop_next_append: bool,

    next_command: u64,
}

impl ConsensusState {
    /// Nodes `from` can exchange messages with.
    pub fn peers(&self, from: usize) -> Vec<usize> {
        let node = &self.nodes[from];
        if node.partitioned || node.crashed {
            return Vec::new();
        }
        self.nodes
            .iter()
            .filter(|p| p.id != from && !p.partitioned && !p.crashed)
            .map(|p| p.id)
            .collect()
    }

    fn current_leader(&self) -> Option<usize> {
        self.nodes
            .iter()
            .filter(|n| n.is_live() && n.role == Role::Leader)
            .max_by_key(|n| (n.term, std::cmp::Reverse(n.id)))
            .map(|n| n.id)
    }

    pub fn committed(&self) -> usize {
        self.total_commits
    }

    fn record(&mut self, commit: CommitRecord) {
        if self.commits.len() == COMMIT_HISTORY {
            self.commits.pop_front();
        }
        self.commits.push_back(commit);
        self.total_commits += 1;
        self.commit_index = commit.index;
    }
}

pub struct ConsensusMachine {
    config: ConsensusConfig,
}

impl ConsensusMachine {
    pub fn new(config: ConsensusConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn standard() -> Self {
        Self {
            config: ConsensusConfig::default(),
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    fn timeout(&self, rng: &mut ChaCha8Rng) -> u32 {
        rng.gen_range(self.config.election_timeout_min..=self.config.election_timeout_max)
    }

    /// Heartbeat plus one append from leader `l`.
    fn replicate(
        &self,
        state: &mut ConsensusState,
        l: usize,
        heard: &mut [bool],
        rng: &mut ChaCha8Rng,
        cx: &mut StepCx<'_>,
    ) {
        let reach = state.peers(l);
        let term = state.nodes[l].term;

        if let Some(higher) = reach.iter().map(|&p| state.nodes[p].term).filter(|&t| t > term).max() {
            let countdown = self.timeout(rng);
            state.nodes[l].step_down(higher, countdown);
            cx.info(format!("node {} saw term {} and stepped down as leader", l, higher));
            return;
        }

        let leader = &mut state.nodes[l];
        let retry = leader.log_len() > leader.commit && leader.log.last().map(|e| e.term == term).unwrap_or(false);
        if !retry {
            state.next_command += 1;
            let command = format!("x={}", state.next_command);
            leader.log.push(Entry { term, command });
        }
        let index = state.nodes[l].log_len();

        let dropped = if state.drop_next_append {
            state.drop_next_append = false;
            reach.first().copied()
        } else {
            None
        };
        if let Some(p) = dropped {
            cx.info(format!("append #{} to node {} was lost", index, p));
        }

        let receivers: Vec<usize> = reach.iter().copied().filter(|&p| Some(p) != dropped).collect();
        let acks = 1 + receivers.len();
        let quorum = acks >= state.majority && index > state.commit_index;
        if quorum {
            let leader = &mut state.nodes[l];
            leader.commit = index;
            leader.compact();
            state.record(CommitRecord { index, term, acks });
        }

        let leader = state.nodes[l].clone();
        for p in receivers {
            let countdown = self.timeout(rng);
            let follower = &mut state.nodes[p];
            follower.step_down(term, countdown);
            follower.adopt(&leader);
            heard[p] = true;
        }

        if quorum {
            cx.ok(format!(
                "entry #{} committed in term {} ({}/{} nodes)",
                index,
                term,
                acks,
                state.nodes.len()
            ));
        } else if index > state.commit_index {
            cx.info(format!(
                "entry #{} waiting for quorum: {} of {} needed",
                index, acks, state.majority
            ));
        }
    }

    /// Node `c` stands for election in a new term.
    fn elect(
        &self,
        state: &mut ConsensusState,
        c: usize,
        heard: &mut [bool],
        rng: &mut ChaCha8Rng,
        cx: &mut StepCx<'_>,
    ) {
        let candidate = &mut state.nodes[c];
        candidate.term += 1;
        candidate.role = Role::Candidate;
        candidate.voted_for = Some(c);
        let term = candidate.term;
        let last = candidate.last_log();

        let reach = state.peers(c);
        if let Some(higher) = reach.iter().map(|&p| state.nodes[p].term).filter(|&t| t > term).max() {
            let countdown = self.timeout(rng);
            state.nodes[c].step_down(higher, countdown);
            cx.info(format!("node {} saw term {} and abandoned its election", c, higher));
            return;
        }

        let mut votes = 1;
        for &p in &reach {
            let countdown = self.timeout(rng);
            let voter = &mut state.nodes[p];
            if voter.term < term {
                voter.step_down(term, countdown);
                if last >= voter.last_log() {
                    voter.voted_for = Some(c);
                    votes += 1;
                }
            }
            heard[p] = true;
        }

        state.elections += 1;
        let countdown = self.timeout(rng);
        let candidate = &mut state.nodes[c];
        candidate.countdown = countdown;
        if votes >= state.majority {
            candidate.role = Role::Leader;
            cx.ok(format!("node {} elected leader for term {} with {} votes", c, term, votes));
        } else {
            cx.info(format!(
                "node {} lost the election for term {}: {} of {} votes",
                c, term, votes, state.majority
            ));
        }
    }
}

impl Machine for ConsensusMachine {
    type State = ConsensusState;

    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: ID,
            title: TITLE,
            category: "distributed",
        }
    }

    fn init(&self) -> ConsensusState {
        let span = self.config.election_timeout_max - self.config.election_timeout_min + 1;
        let nodes = (0..self.config.nodes)
            .map(|id| Node {
                id,
                role: if id == 0 { Role::Leader } else { Role::Follower },
                term: 1,
                voted_for: Some(0),
                log_base: 0,
                base_term: 0,
                log: Vec::new(),
                commit: 0,
                // staggered so followers never time out together
                countdown: self.config.election_timeout_min + (id as u32 % span),
                partitioned: false,
                crashed: false,
            })
            .collect();
        ConsensusState {
            nodes,
            leader: Some(0),
            commit_index: 0,
            commits: VecDeque::new(),
            total_commits: 0,
            majority: self.config.majority(),
            elections: 0,
            drop_next_append: false,
            next_command: 0,
        }
    }

    fn transition(&self, state: &mut ConsensusState, cx: &mut StepCx<'_>) -> Result<(), ModuleError> {
        let mut restart_rng = cx.rng(RESTART_SALT);
        let mut rng = cx.rng(TIMER_SALT);
        let n = state.nodes.len();

        for id in 0..n {
            if state.nodes[id].crashed && restart_rng.gen_bool(self.config.restart_chance) {
                let countdown = self.timeout(&mut rng);
                let node = &mut state.nodes[id];
                node.crashed = false;
                node.role = Role::Follower;
                node.countdown = countdown;
                cx.info(format!("node {} restarted as follower", id));
            }
        }

        let mut heard = vec![false; n];
        let leaders: Vec<usize> = state
            .nodes
            .iter()
            .filter(|n| n.is_live() && n.role == Role::Leader)
            .map(|n| n.id)
            .collect();
        for l in leaders {
            if state.nodes[l].role == Role::Leader {
                heard[l] = true;
                self.replicate(state, l, &mut heard, &mut rng, cx);
            }
        }

        for id in 0..n {
            let node = &mut state.nodes[id];
            if heard[id] || node.crashed || node.role == Role::Leader {
                continue;
            }
            node.countdown = node.countdown.saturating_sub(1);
            if node.countdown == 0 {
                self.elect(state, id, &mut heard, &mut rng, cx);
            }
        }

        state.leader = state.current_leader();
        if state.leader.is_none() {
            cx.info("no leader: cluster is waiting for an election");
        }
        Ok(())
    }

    fn snapshot(state: &ConsensusState) -> Snapshot {
        Snapshot::Consensus(state.clone())
    }

    fn check(&self, state: &ConsensusState) -> Result<(), String> {
        if state.commits.len() > COMMIT_HISTORY || state.commits.len() > state.total_commits {
            return Err(format!(
                "{} commit records retained out of {} written",
                state.commits.len(),
                state.total_commits
            ));
        }
        let mut last: Option<usize> = None;
        for commit in &state.commits {
            if commit.acks < state.majority {
                return Err(format!(
                    "entry #{} committed with {} acks, majority is {}",
                    commit.index, commit.acks, state.majority
                ));
            }
            if let Some(prev) = last.filter(|&prev| commit.index <= prev) {
                return Err(format!("commit index went from {} to {}", prev, commit.index));
            }
            last = Some(commit.index);
        }
        let audited = last.unwrap_or(0);
        if state.commit_index != audited {
            return Err(format!("commit index {} disagrees with audit {}", state.commit_index, audited));
        }

        let mut terms = HashSet::new();
        for node in state.nodes.iter().filter(|n| n.role == Role::Leader && n.is_live()) {
            if !terms.insert(node.term) {
                return Err(format!("two leaders in term {}", node.term));
            }
        }
        for node in &state.nodes {
            if node.base_term > node.term || node.log.iter().any(|e| e.term > node.term) {
                return Err(format!("node {} holds an entry from a future term", node.id));
            }
        }
        Ok(())
    }

    fn faults(&self) -> ActionTable<Self> {
        let mut table = ActionTable::new();
        for id in 0..self.config.nodes {
            table.push(
                format!("partition_node_{}", id),
                format!("Partition node {}", id),
                ActionKind::Sticky,
                move |_, state: &mut ConsensusState, _| {
                    let node = &mut state.nodes[id];
                    if node.partitioned {
                        return Ok(format!("node {} already partitioned", id));
                    }
                    node.partitioned = true;
                    Ok(format!("node {} partitioned from the cluster", id))
                },
            );
        }
        table
            .with("heal_partition", "Heal all partitions", ActionKind::Clear, |_, state: &mut ConsensusState, _| {
                let healed: Vec<usize> = state.nodes.iter().filter(|n| n.partitioned).map(|n| n.id).collect();
                for node in state.nodes.iter_mut() {
                    node.partitioned = false;
                }
                Ok(if healed.is_empty() {
                    "no partition to heal".to_string()
                } else {
                    format!("partition healed; nodes {:?} rejoined", healed)
                })
            })
            .with("crash_leader", "Crash the leader", ActionKind::Sticky, |_, state: &mut ConsensusState, _| {
                match state.current_leader() {
                    Some(l) => {
                        let node = &mut state.nodes[l];
                        node.crashed = true;
                        node.role = Role::Follower;
                        state.leader = None;
                        Ok(format!("leader node {} crashed in term {}", l, node.term))
                    }
                    None => Ok("no live leader to crash".to_string()),
                }
            })
            .with(
                "restart_crashed",
                "Restart crashed nodes",
                ActionKind::Clear,
                |m: &ConsensusMachine, state: &mut ConsensusState, _| {
                    let crashed: Vec<usize> = state.nodes.iter().filter(|n| n.crashed).map(|n| n.id).collect();
                    for &id in &crashed {
                        let node = &mut state.nodes[id];
                        node.crashed = false;
                        node.countdown = m.config.election_timeout_max;
                    }
                    Ok(if crashed.is_empty() {
                        "no crashed node to restart".to_string()
                    } else {
                        format!("nodes {:?} restarted", crashed)
                    })
                },
            )
            .with(
                "drop_next_append",
                "Drop the next append message",
                ActionKind::OneShot,
                |_, state: &mut ConsensusState, _| {
                    state.drop_next_append = true;
                    Ok("next append to a follower will be lost".to_string())
                },
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::module::{Instance, Module};
    use proptest::prelude::*;

    fn run(module: &mut Instance<ConsensusMachine>, from: u64, ticks: u64) {
        for t in from..from + ticks {
            let mut journal = Journal::new(t);
            module.transition(t, &mut journal).unwrap();
        }
    }

    #[test]
    fn test_leader_commits_every_tick() {
        let mut module = Instance::new(ConsensusMachine::standard(), 42);
        run(&mut module, 0, 3);

        let state = module.state();
        assert_eq!(state.committed(), 3);
        assert!(state.commits.iter().all(|c| c.acks == 5));
        assert!(state.nodes.iter().all(|n| n.log_len() == 3));
    }

    #[test]
    fn test_single_partition_keeps_committing() {
        let mut module = Instance::new(ConsensusMachine::standard(), 42);
        module.inject("partition_node_4", 0).unwrap();
        run(&mut module, 0, 3);

        let state = module.state();
        assert_eq!(state.committed(), 3);
        assert!(state.commits.iter().all(|c| c.acks == 4));
        assert_eq!(state.nodes[4].log_len(), 0);
    }

    #[test]
    fn test_minority_side_cannot_commit_until_healed() {
        let mut module = Instance::new(ConsensusMachine::standard(), 42);
        for id in 2..5 {
            module.inject(&format!("partition_node_{}", id), 0).unwrap();
        }
        run(&mut module, 0, 8);
        assert_eq!(module.state().committed(), 0);

        module.inject("heal_partition", 8).unwrap();
        run(&mut module, 8, 60);
        assert!(module.state().committed() > 0);
    }

    #[test]
    fn test_crashed_leader_is_replaced() {
        let mut module = Instance::new(
            ConsensusMachine::new(ConsensusConfig {
                restart_chance: 0.0,
                ..ConsensusConfig::default()
            })
            .unwrap(),
            7,
        );
        run(&mut module, 0, 2);
        module.inject("crash_leader", 2).unwrap();
        assert_eq!(module.state().leader, None);

        run(&mut module, 2, 12);
        let state = module.state();
        let leader = state.leader.expect("a new leader");
        assert_ne!(leader, 0);
        assert!(state.nodes[leader].term > 1);
        assert!(state.committed() > 2);
    }

    #[test]
    fn test_dropped_append_delays_commit() {
        let mut module = Instance::new(ConsensusMachine::standard(), 42);
        module.inject("partition_node_3", 0).unwrap();
        module.inject("partition_node_4", 0).unwrap();
        module.inject("drop_next_append", 0).unwrap();

        run(&mut module, 0, 1);
        assert_eq!(module.state().committed(), 0);

        // the same entry is retried rather than a new one appended
        run(&mut module, 1, 1);
        assert_eq!(module.state().commits, vec![CommitRecord { index: 1, term: 1, acks: 3 }]);
    }

    #[test]
    fn test_long_run_state_stays_bounded() {
        let mut module = Instance::new(ConsensusMachine::standard(), 42);
        run(&mut module, 0, 200);
        let early = serde_json::to_string(&module.snapshot()).unwrap().len();

        run(&mut module, 200, 1800);
        let state = module.state();
        assert_eq!(state.committed(), 2000);
        assert_eq!(state.commit_index, 2000);
        assert_eq!(state.commits.len(), COMMIT_HISTORY);
        for node in &state.nodes {
            assert_eq!(node.log_len(), 2000);
            assert_eq!(node.log.len(), LOG_TAIL);
            assert_eq!(node.base_term, 1);
        }

        let late = serde_json::to_string(&module.snapshot()).unwrap().len();
        assert!(late < early + early / 4, "snapshot grew from {} to {} bytes", early, late);
    }

    #[test]
    fn test_compaction_keeps_uncommitted_entries() {
        let mut module = Instance::new(ConsensusMachine::standard(), 42);
        run(&mut module, 0, 20);
        for id in 2..5 {
            module.inject(&format!("partition_node_{}", id), 20).unwrap();
        }
        run(&mut module, 20, 3);

        let leader = &module.state().nodes[0];
        assert_eq!(leader.commit, 20);
        assert_eq!(leader.log_len(), 21);
        assert_eq!(leader.log.len(), LOG_TAIL + 1);
        assert_eq!(leader.log.last().map(|e| e.command.as_str()), Some("x=21"));
    }

    #[test]
    fn test_partition_is_idempotent() {
        let mut module = Instance::new(ConsensusMachine::standard(), 42);
        module.inject("partition_node_1", 0).unwrap();
        let once = module.snapshot();
        let msg = module.inject("partition_node_1", 0).unwrap();
        assert!(msg.contains("already"));
        assert_eq!(module.snapshot(), once);
    }

    proptest! {
        #[test]
        fn test_commits_always_have_quorum(
            seed in any::<u64>(),
            script in proptest::collection::vec((0usize..10, 1u64..4), 1..20),
        ) {
            let mut module = Instance::new(ConsensusMachine::standard(), seed);
            let faults: Vec<String> = module.faults().into_iter().map(|s| s.name).collect();
            let mut tick = 0;
            for (fault, ticks) in script {
                module.inject(&faults[fault % faults.len()], tick).unwrap();
                for _ in 0..ticks {
                    let mut journal = Journal::new(tick);
                    module.transition(tick, &mut journal).unwrap();
                    tick += 1;
                }
            }
            let state = module.state();
            prop_assert!(state.commits.iter().all(|c| c.acks >= 3));
        }
    }
}
