//! Common types shared by the engine, the modules and the presentation layer.

use serde::{Deserialize, Serialize};

/// Index of one discrete transition since the last mount/reset (0-based).
pub type Tick = u64;

/// Severity tag carried by every event log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Organic, uneventful progress
    Info,

    /// A notable success (commit, hit, delivery, completion)
    Ok,

    /// An injected fault or a contract violation
    Fault,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Ok => "ok",
            Severity::Fault => "fault",
        };
        write!(f, "{}", s)
    }
}

/// Who produced a log line.
///
/// Lets the presentation layer tell an injected domain fault apart from a
/// contract violation even though both carry `Severity::Fault`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Written by a module's transition function
    Transition,

    /// Written by the fault framework for an operator-injected fault
    Fault,

    /// Written for an operator control action
    Control,

    /// Written by the engine itself (mount, reset, contract violations)
    Engine,
}

/// One line of the bounded event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Tick at which the line was produced
    pub tick: Tick,

    /// Human-readable message
    pub message: String,

    /// Severity tag
    pub severity: Severity,

    /// Producer of the line
    pub source: EntrySource,
}

impl LogEntry {
    /// Creates a new log entry.
    pub fn new(tick: Tick, severity: Severity, source: EntrySource, message: impl Into<String>) -> Self {
        Self {
            tick,
            message: message.into(),
            severity,
            source,
        }
    }

    /// Creates an engine-level contract violation entry.
    pub fn violation(tick: Tick, message: impl std::fmt::Display) -> Self {
        Self::new(
            tick,
            Severity::Fault,
            EntrySource::Engine,
            format!("{} {}", Self::VIOLATION_MARKER, message),
        )
    }

    /// Prefix that marks a contract violation in the message text.
    pub const VIOLATION_MARKER: &'static str = "[contract]";

    /// Returns true if this entry records a contract violation.
    pub fn is_violation(&self) -> bool {
        self.source == EntrySource::Engine && self.severity == Severity::Fault
    }

    /// Returns true if this entry records an operator-injected fault.
    pub fn is_injected_fault(&self) -> bool {
        self.source == EntrySource::Fault
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[t={:>4}] {:<5} {}", self.tick, self.severity, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_is_distinguishable() {
        let violation = LogEntry::violation(3, "step() with no module mounted");
        let injected = LogEntry::new(3, Severity::Fault, EntrySource::Fault, "flush");

        assert!(violation.is_violation());
        assert!(!violation.is_injected_fault());
        assert!(violation.message.starts_with(LogEntry::VIOLATION_MARKER));

        assert!(injected.is_injected_fault());
        assert!(!injected.is_violation());
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        let json = serde_json::to_string(&Severity::Fault).unwrap();
        assert_eq!(json, "\"fault\"");
    }
}
