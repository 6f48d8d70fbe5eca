//! Request lifecycle: one tap on a phone, followed to the server and back.
//!
//! A request moves one stage per tick: it leaves the client, crosses the
//! network, is handled by the server, queries the database and travels
//! back as a response. Each hop adds its latency to the request's running
//! total. When a response lands the next request starts on the following
//! tick, so the lesson cycles for as long as it runs.
//!
//! Faults:
//! - `slow_query` (sticky): database queries take `slow_query_factor` times
//!   longer until `fix_query`.
//! - `server_error` (one-shot): the next request the server handles fails
//!   with a 500 before it reaches the database.
//! - `drop_request` (one-shot): the next request is lost on the way in; the
//!   client waits out its timeout and sends it again.

use crate::action::{ActionKind, ActionTable};
use crate::journal::StepCx;
use crate::module::{Machine, ModuleDescriptor, ModuleError};
use crate::snapshot::Snapshot;
use lessonlab_env::SimError;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const ID: &str = "request";
pub const TITLE: &str = "What happens when you tap a button";

const QUERY_SALT: u64 = 0x5e1;

pub const STATUS_OK: u16 = 200;
pub const STATUS_SERVER_ERROR: u16 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// One-way client to server latency
    pub network_ms: u64,

    /// Server time to parse the request and authenticate the user
    pub handler_ms: u64,

    /// Database query time, inclusive range
    pub query_ms_min: u64,
    pub query_ms_max: u64,

    /// Client-side time to turn the response into the feed
    pub render_ms: u64,

    /// How long the client waits before resending a lost request
    pub timeout_ms: u64,

    pub slow_query_factor: u64,

    /// Posts the feed query returns
    pub feed_size: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            network_ms: 80,
            handler_ms: 5,
            query_ms_min: 10,
            query_ms_max: 30,
            render_ms: 15,
            timeout_ms: 1_000,
            slow_query_factor: 50,
            feed_size: 20,
        }
    }
}

impl RequestConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.network_ms == 0 || self.timeout_ms <= 2 * self.network_ms {
            return Err(SimError::config(format!(
                "request: timeout {}ms must exceed a {}ms round trip",
                self.timeout_ms,
                2 * self.network_ms
            )));
        }
        if self.query_ms_min == 0 || self.query_ms_min > self.query_ms_max {
            return Err(SimError::config(format!(
                "request: bad query time range {}..={}",
                self.query_ms_min, self.query_ms_max
            )));
        }
        if self.slow_query_factor == 0 || self.feed_size == 0 {
            return Err(SimError::config("request: slow_query_factor and feed_size must be non-zero"));
        }
        Ok(())
    }
}

/// Where the current request is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Nothing sent yet
    Idle,

    /// On the wire towards the server
    Sent,

    /// Arrived; the server is working out who is asking for what
    Received,

    /// Waiting on the database
    Querying,

    /// Response on the wire back to the client
    Responding,

    /// Response rendered
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestState {
    pub stage: Stage,

    /// Id of the current request; 0 before the first tap
    pub request_id: u64,

    /// Latency accumulated by the current request
    pub elapsed_ms: u64,

    /// Status the server answered with, once it has
    pub status: Option<u16>,

    /// Posts carried by the current response
    pub rows: usize,

    pub completed: u64,
    pub server_errors: u64,
    pub resends: u64,

    /// Total latency of the last finished request
    pub last_latency_ms: Option<u64>,

    pub slow_query: bool,
    pub fail_next: bool,
    pub drop_next: bool,
}

impl RequestState {
    /// Requests that got an answer of any status.
    pub fn answered(&self) -> u64 {
        self.completed + self.server_errors
    }
}

pub struct RequestMachine {
    config: RequestConfig,
}

impl RequestMachine {
    pub fn new(config: RequestConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn standard() -> Self {
        Self {
            config: RequestConfig::default(),
        }
    }

    fn query_cost(&self, state: &RequestState, cx: &StepCx<'_>) -> u64 {
        let base = cx.rng(QUERY_SALT).gen_range(self.config.query_ms_min..=self.config.query_ms_max);
        if state.slow_query {
            base.saturating_mul(self.config.slow_query_factor)
        } else {
            base
        }
    }
}

impl Machine for RequestMachine {
    type State = RequestState;

    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: ID,
            title: TITLE,
            category: "backend",
        }
    }

    fn init(&self) -> RequestState {
        RequestState {
            stage: Stage::Idle,
            request_id: 0,
            elapsed_ms: 0,
            status: None,
            rows: 0,
            completed: 0,
            server_errors: 0,
            resends: 0,
            last_latency_ms: None,
            slow_query: false,
            fail_next: false,
            drop_next: false,
        }
    }

    fn transition(&self, state: &mut RequestState, cx: &mut StepCx<'_>) -> Result<(), ModuleError> {
        match state.stage {
            Stage::Idle | Stage::Done => {
                state.request_id += 1;
                state.stage = Stage::Sent;
                state.elapsed_ms = 0;
                state.status = None;
                state.rows = 0;
                cx.info(format!(
                    "tap: request #{} leaves the phone through WiFi, the ISP and the backbone",
                    state.request_id
                ));
            }
            Stage::Sent => {
                if state.drop_next {
                    state.drop_next = false;
                    state.resends += 1;
                    state.elapsed_ms += self.config.timeout_ms;
                    cx.info(format!(
                        "request #{} lost in transit; client resent it after {}ms",
                        state.request_id, self.config.timeout_ms
                    ));
                } else {
                    state.elapsed_ms += self.config.network_ms;
                    state.stage = Stage::Received;
                    cx.info(format!("server received request #{}", state.request_id));
                }
            }
            Stage::Received => {
                state.elapsed_ms += self.config.handler_ms;
                if state.fail_next {
                    state.fail_next = false;
                    state.status = Some(STATUS_SERVER_ERROR);
                    state.stage = Stage::Responding;
                    cx.info(format!("server crashed handling request #{}: 500", state.request_id));
                } else {
                    state.stage = Stage::Querying;
                    cx.info(format!(
                        "server asks the database for the {} newest posts",
                        self.config.feed_size
                    ));
                }
            }
            Stage::Querying => {
                let cost = self.query_cost(state, cx);
                state.elapsed_ms += cost;
                state.status = Some(STATUS_OK);
                state.rows = self.config.feed_size;
                state.stage = Stage::Responding;
                cx.info(format!("query returned {} rows in {}ms", state.rows, cost));
            }
            Stage::Responding => {
                state.elapsed_ms += self.config.network_ms + self.config.render_ms;
                state.stage = Stage::Done;
                state.last_latency_ms = Some(state.elapsed_ms);
                match state.status {
                    Some(STATUS_OK) => {
                        state.completed += 1;
                        cx.ok(format!(
                            "request #{}: feed of {} posts shown after {}ms",
                            state.request_id, state.rows, state.elapsed_ms
                        ));
                    }
                    status => {
                        state.server_errors += 1;
                        cx.info(format!(
                            "request #{}: app shows an error ({:?}) after {}ms",
                            state.request_id, status, state.elapsed_ms
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn snapshot(state: &RequestState) -> Snapshot {
        Snapshot::Request(state.clone())
    }

    fn check(&self, state: &RequestState) -> Result<(), String> {
        let answered = matches!(state.stage, Stage::Responding | Stage::Done);
        if answered != state.status.is_some() {
            return Err(format!("status {:?} at stage {:?}", state.status, state.stage));
        }
        if state.stage == Stage::Done && state.last_latency_ms != Some(state.elapsed_ms) {
            return Err("finished request latency not recorded".to_string());
        }
        if state.rows > 0 && state.status != Some(STATUS_OK) {
            return Err(format!("{} rows carried by a failed response", state.rows));
        }
        if state.answered() > state.request_id {
            return Err(format!("{} answers for {} requests", state.answered(), state.request_id));
        }
        Ok(())
    }

    fn faults(&self) -> ActionTable<Self> {
        ActionTable::new()
            .with("slow_query", "Slow down database queries", ActionKind::Sticky, |m: &RequestMachine, state: &mut RequestState, _| {
                if state.slow_query {
                    return Ok("queries already slow".to_string());
                }
                state.slow_query = true;
                Ok(format!("missing index: queries now {}x slower", m.config.slow_query_factor))
            })
            .with("fix_query", "Restore query speed", ActionKind::Clear, |_, state: &mut RequestState, _| {
                let was = std::mem::replace(&mut state.slow_query, false);
                Ok(if was { "index restored; queries fast again" } else { "queries were fast" }.to_string())
            })
            .with("server_error", "Fail the next request with a 500", ActionKind::OneShot, |_, state: &mut RequestState, _| {
                state.fail_next = true;
                Ok("server will fail the next request it handles".to_string())
            })
            .with("drop_request", "Lose the next request in transit", ActionKind::OneShot, |_, state: &mut RequestState, _| {
                state.drop_next = true;
                Ok("next request on the wire will be lost".to_string())
            })
    }
}
