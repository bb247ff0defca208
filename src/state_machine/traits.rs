//! State machine abstraction
//!
//! The state machine is the application logic the cluster coordinates.
//! Committed log entries are applied to it in commit order, which is
//! identical on every replica.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// A command submitted for replication: an operation name plus arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Command {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Result of applying a command to the state machine.
/// Ok(output) for successful commands, Err(message) for errors.
pub type ApplyResult = Result<String, String>;

/// State machine trait - the application logic the cluster coordinates.
///
/// Implementations must be deterministic: applying the same commands in the
/// same order must produce the same state on all replicas.
pub trait StateMachine: Send {
    /// Check a command before it is appended to the log. Rejected commands
    /// never enter the log.
    fn validate(&self, command: &Command) -> Result<(), String>;

    /// Apply a committed command to the state machine.
    fn apply(&mut self, command: &Command) -> ApplyResult;
}

/// Snapshotable state machine - supports log compaction.
///
/// Allows serializing state to bytes and restoring from bytes; used to
/// discard the log prefix a snapshot covers.
pub trait Snapshotable: StateMachine {
    /// Serialize the current state as a point-in-time image.
    fn snapshot(&self) -> Result<Vec<u8>, String>;

    /// Replace the current state with a deserialized image.
    fn restore(&mut self, data: &[u8]) -> Result<(), String>;
}

/// Shared record of applied commands for testing.
pub type AppliedCommands = Arc<Mutex<Vec<Command>>>;

/// Test state machine that records every applied command to a shared vec.
pub struct RecordingMachine {
    applied: AppliedCommands,
}

impl RecordingMachine {
    pub fn new() -> Self {
        RecordingMachine {
            applied: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create with a shared vec to inspect applied commands from outside.
    pub fn new_shared(applied: AppliedCommands) -> Self {
        RecordingMachine { applied }
    }
}

impl Default for RecordingMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for RecordingMachine {
    fn validate(&self, _command: &Command) -> Result<(), String> {
        Ok(())
    }

    fn apply(&mut self, command: &Command) -> ApplyResult {
        self.applied.lock().unwrap().push(command.clone());
        Ok(String::new())
    }
}

impl Snapshotable for RecordingMachine {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        let applied = self.applied.lock().unwrap().clone();
        serde_json::to_vec(&applied)
            .map_err(|e| format!("recording machine snapshot failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let applied: Vec<Command> = serde_json::from_slice(data)
            .map_err(|e| format!("recording machine restore failed: {}", e))?;
        *self.applied.lock().unwrap() = applied;
        Ok(())
    }
}
