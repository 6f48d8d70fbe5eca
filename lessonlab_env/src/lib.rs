//! LessonLab Environment Abstraction Layer
//!
//! Shared vocabulary for the simulation substrate plus the one piece of
//! "outside world" the engine depends on: a clock.
//!
//! # Core Concept
//!
//! Modules and the engine are synchronous and deterministic. The only
//! source of unsolicited work is the auto-run timer, and it reads time
//! through [`SimClock`] so tests can substitute a virtual clock:
//!
//! ```ignore
//! use lessonlab_env::{SimClock, TokioClock};
//!
//! async fn pace<C: SimClock>(clock: &C) {
//!     loop {
//!         clock.sleep(Duration::from_millis(500)).await;
//!         engine.lock().unwrap().step();
//!     }
//! }
//! ```

mod clock;
mod types;
mod error;
mod tokio_impl;

pub use clock::SimClock;
pub use types::{EntrySource, LogEntry, Severity, Tick};
pub use error::SimError;
pub use tokio_impl::TokioClock;
