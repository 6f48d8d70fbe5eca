//! B-tree insert and split.
//!
//! Keys are fed from a pending queue, one insert per tick. A node that
//! grows past `max_keys` splits around its median, which is promoted into
//! the parent. Only a root split adds a level, so every leaf always sits at
//! the same depth.
//!
//! Nodes live in an arena and refer to children by index, which keeps the
//! state a plain serializable value.

use crate::action::{ActionKind, ActionTable};
use crate::journal::StepCx;
use crate::module::{Machine, ModuleDescriptor, ModuleError};
use crate::snapshot::Snapshot;
use lessonlab_env::SimError;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const ID: &str = "btree";
pub const TITLE: &str = "How databases find data fast";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BTreeConfig {
    /// Keys a node may hold before it splits
    pub max_keys: usize,

    /// Insert order
    pub keys: Vec<i64>,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            max_keys: 3,
            keys: vec![10, 20, 5, 6, 12, 30, 7, 17, 3, 25, 40, 1],
        }
    }
}

impl BTreeConfig {
    /// A shuffled run of `1..=count`, reproducible from `seed`.
    pub fn shuffled(max_keys: usize, count: i64, seed: u64) -> Self {
        let mut keys: Vec<i64> = (1..=count).collect();
        keys.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        Self { max_keys, keys }
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if !(2..=16).contains(&self.max_keys) {
            return Err(SimError::config(format!("btree: max_keys {} outside 2..=16", self.max_keys)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BNode {
    pub keys: Vec<i64>,

    /// Arena indices; empty for a leaf
    pub children: Vec<usize>,
}

impl BNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BTreeState {
    pub nodes: Vec<BNode>,
    pub root: usize,

    /// Levels, counting the root; a lone leaf has height 1
    pub height: usize,

    pub pending: VecDeque<i64>,
    pub size: usize,
    pub splits: u64,
    pub duplicates_rejected: u64,
    pub last_insert: Option<i64>,
}

impl BTreeState {
    /// Keys in sorted traversal order.
    pub fn in_order(&self) -> Vec<i64> {
        let mut out = Vec::with_capacity(self.size);
        self.walk(self.root, &mut out);
        out
    }

    fn walk(&self, id: usize, out: &mut Vec<i64>) {
        let node = &self.nodes[id];
        for (i, key) in node.keys.iter().enumerate() {
            if let Some(&child) = node.children.get(i) {
                self.walk(child, out);
            }
            out.push(*key);
        }
        if let Some(&last) = node.children.get(node.keys.len()) {
            self.walk(last, out);
        }
    }

    pub fn contains(&self, key: i64) -> bool {
        let mut id = self.root;
        loop {
            let node = &self.nodes[id];
            match node.keys.binary_search(&key) {
                Ok(_) => return true,
                Err(_) if node.is_leaf() => return false,
                Err(slot) => id = node.children[slot],
            }
        }
    }

    fn max_key(&self) -> Option<i64> {
        let mut id = self.root;
        while let Some(&last) = self.nodes[id].children.last() {
            id = last;
        }
        self.nodes[id].keys.last().copied()
    }
}

pub struct BTreeMachine {
    config: BTreeConfig,
}

impl BTreeMachine {
    pub fn new(config: BTreeConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn standard() -> Self {
        Self {
            config: BTreeConfig::default(),
        }
    }

    fn insert(&self, state: &mut BTreeState, key: i64, cx: &mut StepCx<'_>) {
        // descend, remembering (node, slot) for each level above the leaf
        let mut path = Vec::with_capacity(state.height);
        let mut id = state.root;
        loop {
            let node = &state.nodes[id];
            match node.keys.binary_search(&key) {
                Ok(_) => {
                    state.duplicates_rejected += 1;
                    cx.info(format!("key {} already present; duplicate ignored", key));
                    return;
                }
                Err(slot) if node.is_leaf() => {
                    state.nodes[id].keys.insert(slot, key);
                    break;
                }
                Err(slot) => {
                    path.push((id, slot));
                    id = node.children[slot];
                }
            }
        }
        state.size += 1;
        state.last_insert = Some(key);
        cx.info(format!("inserted {}", key));

        while state.nodes[id].keys.len() > self.config.max_keys {
            let (median, right) = split(&mut state.nodes[id]);
            let right_id = state.nodes.len();
            state.nodes.push(right);
            state.splits += 1;

            match path.pop() {
                Some((parent, slot)) => {
                    let p = &mut state.nodes[parent];
                    p.keys.insert(slot, median);
                    p.children.insert(slot + 1, right_id);
                    cx.info(format!("node split; {} promoted to parent", median));
                    id = parent;
                }
                None => {
                    let new_root = state.nodes.len();
                    state.nodes.push(BNode {
                        keys: vec![median],
                        children: vec![id, right_id],
                    });
                    state.root = new_root;
                    state.height += 1;
                    cx.ok(format!("root split on {}; height now {}", median, state.height));
                    break;
                }
            }
        }
    }
}

/// Splits an overfull node around its median. Returns the median and the
/// new right sibling; `node` keeps the left half.
fn split(node: &mut BNode) -> (i64, BNode) {
    let mid = node.keys.len() / 2;
    let right_keys = node.keys.split_off(mid + 1);
    let median = node.keys.pop().unwrap_or_default();
    let right_children = if node.is_leaf() {
        Vec::new()
    } else {
        node.children.split_off(mid + 1)
    };
    (
        median,
        BNode {
            keys: right_keys,
            children: right_children,
        },
    )
}

impl Machine for BTreeMachine {
    type State = BTreeState;

    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: ID,
            title: TITLE,
            category: "backend",
        }
    }

    fn init(&self) -> BTreeState {
        BTreeState {
            nodes: vec![BNode::default()],
            root: 0,
            height: 1,
            pending: self.config.keys.iter().copied().collect(),
            size: 0,
            splits: 0,
            duplicates_rejected: 0,
            last_insert: None,
        }
    }

    fn transition(&self, state: &mut BTreeState, cx: &mut StepCx<'_>) -> Result<(), ModuleError> {
        match state.pending.pop_front() {
            Some(key) => self.insert(state, key, cx),
            None => cx.info(format!(
                "no keys pending; tree holds {} keys in {} levels",
                state.size, state.height
            )),
        }
        Ok(())
    }

    fn snapshot(state: &BTreeState) -> Snapshot {
        Snapshot::BTree(state.clone())
    }

    fn check(&self, state: &BTreeState) -> Result<(), String> {
        let keys = state.in_order();
        if keys.len() != state.size {
            return Err(format!("size {} but {} keys reachable", state.size, keys.len()));
        }
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err("keys out of order".to_string());
        }

        let mut stack = vec![(state.root, 1usize)];
        while let Some((id, depth)) = stack.pop() {
            let node = state.nodes.get(id).ok_or_else(|| format!("dangling child {}", id))?;
            if node.keys.len() > self.config.max_keys {
                return Err(format!("node {} holds {} keys", id, node.keys.len()));
            }
            if id != state.root && node.keys.is_empty() {
                return Err(format!("node {} is empty", id));
            }
            if node.is_leaf() {
                if depth != state.height {
                    return Err(format!("leaf {} at depth {}, height {}", id, depth, state.height));
                }
            } else {
                if node.children.len() != node.keys.len() + 1 {
                    return Err(format!("node {} has {} keys, {} children", id, node.keys.len(), node.children.len()));
                }
                stack.extend(node.children.iter().map(|&c| (c, depth + 1)));
            }
        }
        Ok(())
    }

    fn faults(&self) -> ActionTable<Self> {
        ActionTable::new()
            .with(
                "duplicate_insert",
                "Deliver the last insert again",
                ActionKind::OneShot,
                |_, state: &mut BTreeState, _| match state.last_insert {
                    Some(key) => {
                        state.pending.push_front(key);
                        Ok(format!("insert of {} will be delivered twice", key))
                    }
                    None => Ok("nothing inserted yet to duplicate".to_string()),
                },
            )
            .with(
                "ascending_burst",
                "Queue a burst of ascending keys",
                ActionKind::OneShot,
                |m: &BTreeMachine, state: &mut BTreeState, _| {
                    let top = state
                        .max_key()
                        .into_iter()
                        .chain(state.pending.iter().copied())
                        .max()
                        .unwrap_or(0);
                    let Some(start) = top.checked_add(1) else {
                        return Ok(format!("no keys left above {}", top));
                    };
                    let end = start.saturating_add(m.config.max_keys as i64);
                    for key in (start..=end).rev() {
                        state.pending.push_front(key);
                    }
                    Ok(format!("queued ascending keys {}..={}", start, end))
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

    fn drain(module: &mut Instance<BTreeMachine>) {
        let mut t = 0;
        while !module.state().pending.is_empty() {
            let mut journal = Journal::new(t);
            module.transition(t, &mut journal).unwrap();
            t += 1;
        }
    }

    fn machine(keys: Vec<i64>) -> Instance<BTreeMachine> {
        Instance::new(BTreeMachine::new(BTreeConfig { max_keys: 3, keys }).unwrap(), 0)
    }

    #[test]
    fn test_fourth_key_splits_root() {
        let mut module = machine(vec![1, 2, 3, 4]);
        drain(&mut module);

        let state = module.state();
        assert_eq!(state.height, 2);
        assert_eq!(state.nodes[state.root].keys, vec![3]);
        assert_eq!(state.in_order(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_height_grows_only_on_root_split() {
        let mut module = machine((1..=30).collect());
        let mut t = 0;
        let mut height = module.state().height;
        while !module.state().pending.is_empty() {
            let mut journal = Journal::new(t);
            module.transition(t, &mut journal).unwrap();
            let now = module.state().height;
            assert!(now == height || now == height + 1);
            if now == height + 1 {
                assert!(journal.entries().iter().any(|e| e.message.contains("root split")));
            }
            height = now;
            t += 1;
        }
        assert!(height >= 3);
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let mut module = machine(vec![5, 9]);
        drain(&mut module);
        module.inject("duplicate_insert", 2).unwrap();
        drain(&mut module);

        assert_eq!(module.state().duplicates_rejected, 1);
        assert_eq!(module.state().size, 2);
    }

    #[test]
    fn test_ascending_burst_forces_right_edge_split() {
        let mut module = machine(vec![10, 20, 30]);
        drain(&mut module);
        module.inject("ascending_burst", 3).unwrap();
        assert_eq!(module.state().pending, VecDeque::from(vec![31, 32, 33, 34]));

        drain(&mut module);
        assert!(module.state().splits >= 2);
        assert_eq!(module.state().in_order(), vec![10, 20, 30, 31, 32, 33, 34]);
    }

    #[test]
    fn test_ascending_burst_near_key_limit() {
        let mut module = machine(vec![i64::MAX - 2]);
        drain(&mut module);
        let msg = module.inject("ascending_burst", 1).unwrap();
        assert_eq!(msg, format!("queued ascending keys {}..={}", i64::MAX - 1, i64::MAX));
        assert_eq!(module.state().pending, VecDeque::from(vec![i64::MAX - 1, i64::MAX]));

        drain(&mut module);
        let msg = module.inject("ascending_burst", 3).unwrap();
        assert!(msg.starts_with("no keys left"));
        assert!(module.state().pending.is_empty());
    }

    #[test]
    fn test_contains() {
        let mut module = Instance::new(BTreeMachine::standard(), 0);
        drain(&mut module);
        assert!(module.state().contains(17));
        assert!(!module.state().contains(18));
    }

    proptest! {
        #[test]
        fn test_tree_stays_sorted_and_balanced(
            keys in proptest::collection::vec(-50i64..50, 0..80),
            max_keys in 2usize..6,
        ) {
            let mut module = Instance::new(
                BTreeMachine::new(BTreeConfig { max_keys, keys: keys.clone() }).unwrap(),
                0,
            );
            let mut t = 0;
            while !module.state().pending.is_empty() {
                let mut journal = Journal::new(t);
                // check() runs after every insert
                prop_assert!(module.transition(t, &mut journal).is_ok());
                t += 1;
            }

            let mut expected = keys;
            expected.sort_unstable();
            expected.dedup();
            prop_assert_eq!(module.state().in_order(), expected);
        }

        #[test]
        fn test_shuffled_inserts_hold_every_key(
            seed in any::<u64>(),
            count in 1i64..120,
            max_keys in 2usize..8,
        ) {
            let mut module = Instance::new(BTreeMachine::new(BTreeConfig::shuffled(max_keys, count, seed)).unwrap(), seed);
            drain(&mut module);

            let state = module.state();
            prop_assert_eq!(state.size, count as usize);
            prop_assert_eq!(state.in_order(), (1..=count).collect::<Vec<_>>());
            prop_assert!(state.height >= 1);
        }
    }
}
