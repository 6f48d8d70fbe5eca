//! LessonLab simulation engine and harness
//!
//! Hosts exactly one teaching module at a time and drives it one discrete
//! tick at a time, either on demand or on a paced timer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Scheduler                        │
//! │   clock.sleep(interval) ──► lock ──► Engine::step()  │
//! └───────────────────────┬──────────────────────────────┘
//!                         │ Arc<Mutex<Engine>>
//! ┌───────────────────────▼──────────────────────────────┐
//! │                       Engine                         │
//! │  Registry ──create──► Box<dyn Module>   EventLog     │
//! │  tick, running, current snapshot                     │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Module failures never escape the engine: errors and panics become
//! `[contract]` lines in the event log and stop auto-run.
//!
//! # Usage
//!
//! ```ignore
//! use lessonlab_sim::{Engine, EngineConfig};
//!
//! let mut engine = Engine::new(EngineConfig::default());
//! engine.mount("consensus")?;
//! engine.invoke_fault("partition_node_4")?;
//! for _ in 0..3 {
//!     engine.step()?;
//! }
//! println!("{}", engine.current_snapshot().unwrap().to_json_string()?);
//! ```

mod context;
mod engine;
mod exporter;
mod runner;
pub mod scenarios;
pub mod scheduler;

pub use context::VirtualClock;
pub use engine::{Engine, EngineConfig};
pub use exporter::{Frame, SessionExport};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use scheduler::Scheduler;
