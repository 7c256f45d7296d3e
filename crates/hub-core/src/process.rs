//! Process identifiers reported by shard workers.

use serde::{Deserialize, Serialize};

/// Identifier of the process hosting a user's engine.
///
/// Workers that fork one child per user report the OS pid; workers that
/// run engines in-process (or in containers) report a string name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProcessId {
    Pid(i64),
    Name(String),
}

impl ProcessId {
    /// Sentinel used on the HTTP surface when no process is known.
    pub const UNKNOWN: i64 = -1;
}
