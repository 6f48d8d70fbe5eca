//! Database: a small `users` table answering one query per tick.
//!
//! The table opens with five rows. Each tick runs the next query: one an
//! operator queued through a control, otherwise the next step of a fixed
//! workload (select all, filter by age, look up by city, insert). Every
//! result reports how many rows the engine had to examine, which is what
//! the city index is for: with it a city lookup touches only matching
//! rows, without it every row is scanned.
//!
//! Faults:
//! - `drop_index` (sticky): city lookups fall back to a full scan until
//!   `rebuild_index`.
//! - `lock_table` (sticky): inserts wait for the lock, and give up once
//!   `max_waiting` are queued, until `release_lock` applies them.

use crate::action::{ActionKind, ActionTable};
use crate::journal::StepCx;
use crate::module::{Machine, ModuleDescriptor, ModuleError};
use crate::snapshot::Snapshot;
use lessonlab_env::SimError;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

pub const ID: &str = "database";
pub const TITLE: &str = "How databases store and find data";

const INSERT_SALT: u64 = 0xdb1;

/// Queries an operator may queue ahead of the workload
const MAX_QUEUED: usize = 8;

const NAMES: [&str; 4] = ["Fatima", "Carlos", "Mei", "Arjun"];
const CITIES: [&str; 4] = ["Lagos", "Accra", "Cairo", "Nairobi"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: u64,
    pub name: String,
    pub age: u32,
    pub city: String,
}

impl Row {
    fn new(id: u64, name: &str, age: u32, city: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            age,
            city: city.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Table contents at init
    pub seed_rows: Vec<Row>,

    /// Inserts are refused once the table holds this many rows
    pub max_rows: usize,

    /// Inserts that may wait on a locked table
    pub max_waiting: usize,

    /// Fixed cost of parsing and planning a query
    pub base_us: u64,

    /// Cost of examining one row
    pub row_us: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            seed_rows: vec![
                Row::new(1, "Amara", 28, "Lagos"),
                Row::new(2, "Kwame", 22, "Accra"),
                Row::new(3, "Zainab", 31, "Lagos"),
                Row::new(4, "Tobias", 19, "Nairobi"),
                Row::new(5, "Priya", 26, "Lagos"),
            ],
            max_rows: 32,
            max_waiting: 3,
            base_us: 200,
            row_us: 150,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.seed_rows.len() > self.max_rows || self.max_rows > 1024 {
            return Err(SimError::config(format!(
                "database: {} seed rows against max_rows {} (limit 1024)",
                self.seed_rows.len(),
                self.max_rows
            )));
        }
        if self.seed_rows.windows(2).any(|w| w[0].id >= w[1].id) {
            return Err(SimError::config("database: seed row ids must be strictly ascending"));
        }
        if self.max_waiting == 0 || self.row_us == 0 {
            return Err(SimError::config("database: max_waiting and row_us must be non-zero"));
        }
        Ok(())
    }
}

/// One statement against `users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum Query {
    SelectAll,
    AgeOver(u32),
    CityIs(String),
    Insert,
}

impl Query {
    /// The workload the lesson cycles through when nothing is queued.
    pub fn workload() -> [Query; 4] {
        [
            Query::SelectAll,
            Query::AgeOver(25),
            Query::CityIs("Lagos".to_string()),
            Query::Insert,
        ]
    }

    pub fn sql(&self) -> String {
        match self {
            Query::SelectAll => "SELECT * FROM users".to_string(),
            Query::AgeOver(age) => format!("SELECT * FROM users WHERE age > {}", age),
            Query::CityIs(city) => format!("SELECT * FROM users WHERE city = \"{}\"", city),
            Query::Insert => "INSERT INTO users (name, age, city) VALUES (...)".to_string(),
        }
    }
}

/// What the last query did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub sql: String,

    /// Ids of the returned or inserted rows
    pub rows: Vec<u64>,

    pub rows_examined: usize,
    pub used_index: bool,
    pub micros: u64,

    /// Why the statement did not apply, if it did not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refused: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseState {
    pub rows: Vec<Row>,
    pub next_id: u64,

    /// city -> row ids, ascending; `None` while the index is dropped
    pub city_index: Option<BTreeMap<String, Vec<u64>>>,

    /// Operator-queued queries, run before the workload resumes
    pub queued: VecDeque<Query>,

    /// Next workload step
    pub cursor: usize,

    pub last: Option<QueryResult>,
    pub queries: u64,

    pub locked: bool,

    /// Inserts held back by the lock
    pub waiting: Vec<Row>,

    /// Inserts refused for a full table or a lock timeout
    pub refused: u64,
}

impl DatabaseState {
    pub fn find(&self, id: u64) -> Option<&Row> {
        self.rows.binary_search_by_key(&id, |r| r.id).ok().map(|i| &self.rows[i])
    }

    fn build_index(rows: &[Row]) -> BTreeMap<String, Vec<u64>> {
        let mut index: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for row in rows {
            index.entry(row.city.clone()).or_default().push(row.id);
        }
        index
    }

    fn store(&mut self, row: Row) {
        if let Some(index) = self.city_index.as_mut() {
            index.entry(row.city.clone()).or_default().push(row.id);
        }
        self.rows.push(row);
    }
}

pub struct DatabaseMachine {
    config: DatabaseConfig,
}

impl DatabaseMachine {
    pub fn new(config: DatabaseConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn standard() -> Self {
        Self {
            config: DatabaseConfig::default(),
        }
    }

    fn cost(&self, examined: usize) -> u64 {
        self.config.base_us + self.config.row_us * examined as u64
    }

    fn random_row(id: u64, rng: &mut ChaCha8Rng) -> Row {
        let name = NAMES.choose(rng).copied().unwrap_or(NAMES[0]);
        let city = CITIES.choose(rng).copied().unwrap_or(CITIES[0]);
        Row::new(id, name, rng.gen_range(18..38), city)
    }

    fn execute(&self, state: &mut DatabaseState, query: &Query, cx: &StepCx<'_>) -> QueryResult {
        let (rows, examined, used_index, refused) = match query {
            Query::SelectAll => (state.rows.iter().map(|r| r.id).collect(), state.rows.len(), false, None),
            Query::AgeOver(age) => (
                state.rows.iter().filter(|r| r.age > *age).map(|r| r.id).collect(),
                state.rows.len(),
                false,
                None,
            ),
            Query::CityIs(city) => match state.city_index.as_ref() {
                Some(index) => {
                    let hits = index.get(city).cloned().unwrap_or_default();
                    let examined = hits.len();
                    (hits, examined, true, None)
                }
                None => (
                    state.rows.iter().filter(|r| &r.city == city).map(|r| r.id).collect(),
                    state.rows.len(),
                    false,
                    None,
                ),
            },
            Query::Insert => {
                let pending = state.rows.len() + state.waiting.len();
                if pending >= self.config.max_rows {
                    state.refused += 1;
                    (Vec::new(), 0, false, Some(format!("table full at {} rows", self.config.max_rows)))
                } else if state.locked && state.waiting.len() >= self.config.max_waiting {
                    state.refused += 1;
                    (Vec::new(), 0, false, Some("lock wait timeout".to_string()))
                } else {
                    let row = Self::random_row(state.next_id, &mut cx.rng(INSERT_SALT));
                    state.next_id += 1;
                    let id = row.id;
                    if state.locked {
                        state.waiting.push(row);
                        (Vec::new(), 0, false, Some(format!("row {} waiting for the table lock", id)))
                    } else {
                        state.store(row);
                        (vec![id], 0, false, None)
                    }
                }
            }
        };
        QueryResult {
            sql: query.sql(),
            rows,
            rows_examined: examined,
            used_index,
            micros: self.cost(examined),
            refused,
        }
    }
}

impl Machine for DatabaseMachine {
    type State = DatabaseState;

    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: ID,
            title: TITLE,
            category: "backend",
        }
    }

    fn init(&self) -> DatabaseState {
        let rows = self.config.seed_rows.clone();
        DatabaseState {
            next_id: rows.last().map(|r| r.id + 1).unwrap_or(1),
            city_index: Some(DatabaseState::build_index(&rows)),
            rows,
            queued: VecDeque::new(),
            cursor: 0,
            last: None,
            queries: 0,
            locked: false,
            waiting: Vec::new(),
            refused: 0,
        }
    }

    fn transition(&self, state: &mut DatabaseState, cx: &mut StepCx<'_>) -> Result<(), ModuleError> {
        let query = match state.queued.pop_front() {
            Some(query) => query,
            None => {
                let workload = Query::workload();
                let query = workload[state.cursor % workload.len()].clone();
                state.cursor = (state.cursor + 1) % workload.len();
                query
            }
        };

        let result = self.execute(state, &query, cx);
        state.queries += 1;
        match &result.refused {
            Some(reason) => cx.info(format!("> {} -- {}", result.sql, reason)),
            None => cx.ok(format!(
                "> {} -- {} row(s), {} examined{}, {}us",
                result.sql,
                result.rows.len(),
                result.rows_examined,
                if result.used_index { " via index" } else { "" },
                result.micros
            )),
        }
        state.last = Some(result);
        Ok(())
    }

    fn snapshot(state: &DatabaseState) -> Snapshot {
        Snapshot::Database(state.clone())
    }

    fn check(&self, state: &DatabaseState) -> Result<(), String> {
        if state.rows.windows(2).any(|w| w[0].id >= w[1].id) {
            return Err("row ids are not strictly ascending".to_string());
        }
        let highest = state.rows.iter().chain(&state.waiting).map(|r| r.id).max().unwrap_or(0);
        if state.next_id <= highest {
            return Err(format!("next id {} already used", state.next_id));
        }
        if state.rows.len() + state.waiting.len() > self.config.max_rows {
            return Err(format!("{} rows exceed max_rows {}", state.rows.len(), self.config.max_rows));
        }
        if !state.locked && !state.waiting.is_empty() {
            return Err(format!("{} inserts waiting on an unlocked table", state.waiting.len()));
        }
        if let Some(index) = &state.city_index {
            if *index != DatabaseState::build_index(&state.rows) {
                return Err("city index out of step with the table".to_string());
            }
        }
        Ok(())
    }

    fn faults(&self) -> ActionTable<Self> {
        ActionTable::new()
            .with("drop_index", "Drop the city index", ActionKind::Sticky, |_, state: &mut DatabaseState, _| {
                Ok(match state.city_index.take() {
                    Some(_) => "city index dropped; lookups by city now scan every row".to_string(),
                    None => "city index already dropped".to_string(),
                })
            })
            .with("rebuild_index", "Rebuild the city index", ActionKind::Clear, |_, state: &mut DatabaseState, _| {
                let was_missing = state.city_index.is_none();
                state.city_index = Some(DatabaseState::build_index(&state.rows));
                Ok(if was_missing {
                    format!("city index rebuilt over {} rows", state.rows.len())
                } else {
                    "city index was intact".to_string()
                })
            })
            .with("lock_table", "Lock the users table", ActionKind::Sticky, |_, state: &mut DatabaseState, _| {
                if state.locked {
                    return Ok("table already locked".to_string());
                }
                state.locked = true;
                Ok("a long transaction holds the users table lock".to_string())
            })
            .with("release_lock", "Release the table lock", ActionKind::Clear, |_, state: &mut DatabaseState, _| {
                if !state.locked {
                    return Ok("table was not locked".to_string());
                }
                state.locked = false;
                let applied = state.waiting.len();
                for row in std::mem::take(&mut state.waiting) {
                    state.store(row);
                }
                Ok(format!("lock released; {} waiting insert(s) applied", applied))
            })
    }

    fn controls(&self) -> ActionTable<Self> {
        let queries = [
            ("run_select_all", "Run SELECT *", Query::SelectAll),
            ("run_age_over_25", "Run WHERE age > 25", Query::AgeOver(25)),
            ("run_city_lagos", "Run WHERE city = Lagos", Query::CityIs("Lagos".to_string())),
            ("run_insert", "Run INSERT", Query::Insert),
        ];
        let mut table = ActionTable::new();
        for (name, label, query) in queries {
            table.push(name, label, ActionKind::Control, move |_, state: &mut DatabaseState, _| {
                if state.queued.len() >= MAX_QUEUED {
                    return Ok(format!("query queue full; {} not queued", query.sql()));
                }
                state.queued.push_back(query.clone());
                Ok(format!("queued {}", query.sql()))
            });
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::module::{Instance, Module};

    fn run(module: &mut Instance<DatabaseMachine>, from: u64, ticks: u64) {
        for t in from..from + ticks {
            let mut journal = Journal::new(t);
            module.transition(t, &mut journal).unwrap();
        }
    }

    fn last(module: &Instance<DatabaseMachine>) -> &QueryResult {
        module.state().last.as_ref().unwrap()
    }

    #[test]
    fn test_workload_matches_seed_table() {
        let mut module = Instance::new(DatabaseMachine::standard(), 3);
        run(&mut module, 0, 1);
        assert_eq!(last(&module).rows, vec![1, 2, 3, 4, 5]);

        run(&mut module, 1, 1);
        assert_eq!(last(&module).rows, vec![1, 3, 5]);

        run(&mut module, 2, 1);
        let lookup = last(&module);
        assert_eq!(lookup.rows, vec![1, 3, 5]);
        assert!(lookup.used_index);
        assert_eq!(lookup.rows_examined, 3);

        run(&mut module, 3, 1);
        assert_eq!(last(&module).rows, vec![6]);
        assert_eq!(module.state().rows.len(), 6);
        assert!(module.state().find(6).is_some());
    }

    #[test]
    fn test_dropped_index_scans_every_row() {
        let mut module = Instance::new(DatabaseMachine::standard(), 3);
        module.inject("drop_index", 0).unwrap();
        module.control("run_city_lagos", 0).unwrap();
        run(&mut module, 0, 1);

        let scan = last(&module);
        assert_eq!(scan.rows, vec![1, 3, 5]);
        assert!(!scan.used_index);
        assert_eq!(scan.rows_examined, 5);
        assert_eq!(scan.micros, 200 + 150 * 5);

        module.inject("rebuild_index", 1).unwrap();
        module.control("run_city_lagos", 1).unwrap();
        run(&mut module, 1, 1);
        assert_eq!(last(&module).micros, 200 + 150 * 3);
    }

    #[test]
    fn test_locked_table_holds_inserts_until_release() {
        let mut module = Instance::new(DatabaseMachine::standard(), 3);
        module.inject("lock_table", 0).unwrap();
        for _ in 0..5 {
            module.control("run_insert", 0).unwrap();
        }
        run(&mut module, 0, 5);

        let state = module.state();
        assert_eq!(state.waiting.len(), 3);
        assert_eq!(state.refused, 2);
        assert_eq!(state.rows.len(), 5);

        let msg = module.inject("release_lock", 5).unwrap();
        assert!(msg.contains("3 waiting"));
        assert_eq!(module.state().rows.len(), 8);
        assert!(module.state().waiting.is_empty());
    }

    #[test]
    fn test_table_stops_growing_at_max_rows() {
        let mut module = Instance::new(DatabaseMachine::standard(), 3);
        run(&mut module, 0, 400);

        let state = module.state();
        assert_eq!(state.rows.len(), 32);
        assert!(state.refused > 0);
        assert!(last(&module).rows_examined <= 32);
    }

    #[test]
    fn test_control_queue_is_bounded() {
        let mut module = Instance::new(DatabaseMachine::standard(), 3);
        for _ in 0..MAX_QUEUED {
            module.control("run_select_all", 0).unwrap();
        }
        let msg = module.control("run_select_all", 0).unwrap();
        assert!(msg.contains("queue full"));
        assert_eq!(module.state().queued.len(), MAX_QUEUED);
    }

    #[test]
    fn test_config_rejects_unsorted_seed_rows() {
        let mut config = DatabaseConfig::default();
        config.seed_rows.swap(0, 1);
        assert!(DatabaseMachine::new(config).is_err());
    }
}
