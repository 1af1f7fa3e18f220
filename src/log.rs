//! A small recorder test scenarios use to assert scheduling order. The
//! engine itself has no notion of a log — `ScheduleLog` is plain
//! user-facing tooling a recipe's own handler closures capture and write
//! to; a handler emits a log entry from its own setup/done callback
//! rather than the scheduler writing one on its behalf. Mirrors the
//! assertable-sequence role `bpmn_lite_core::events::RuntimeEvent` plays
//! in that engine's own tests, just in-process instead of durable.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Success,
    Error,
    Canceled,
    Timeout,
    GroupSetup,
    GroupSuccess,
    GroupError,
    GroupCanceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub id: i64,
    pub phase: Phase,
}

/// Cheap to clone and share into many handler closures; every clone
/// writes to the same underlying sequence.
#[derive(Debug, Clone, Default)]
pub struct ScheduleLog(Arc<Mutex<Vec<LogEntry>>>);

impl ScheduleLog {
    pub fn new() -> Self {
        ScheduleLog::default()
    }

    pub fn record(&self, id: i64, phase: Phase) {
        tracing::trace!(node = id, phase = ?phase, "schedule log entry");
        self.0.lock().expect("schedule log poisoned").push(LogEntry { id, phase });
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.0.lock().expect("schedule log poisoned").clone()
    }
}
