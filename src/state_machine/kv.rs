//! Simple key-value store state machine
//!
//! Commands (state-changing operations that go through the log):
//! - `set key value` - set a key, returns Ok("")
//! - `delete key` - delete a key, returns Ok("") or Err("NOT_FOUND")
//!
//! For reads, use the `get()` method directly (bypasses the log).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::{ApplyResult, Command, Snapshotable, StateMachine};

/// Simple in-memory key-value store
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        KeyValueStore {
            data: HashMap::new(),
        }
    }

    /// Get a value directly (for read-only queries, bypasses the log).
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    /// Get all key-value pairs.
    pub fn all(&self) -> HashMap<String, String> {
        self.data.clone()
    }
}

/// Shared key-value store usable both as the replica's state machine and
/// for direct reads.
pub type SharedKvStore = Arc<Mutex<KeyValueStore>>;

impl StateMachine for SharedKvStore {
    fn validate(&self, command: &Command) -> Result<(), String> {
        self.lock().unwrap().validate(command)
    }

    fn apply(&mut self, command: &Command) -> ApplyResult {
        self.lock().unwrap().apply(command)
    }
}

impl Snapshotable for SharedKvStore {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        self.lock().unwrap().snapshot()
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        self.lock().unwrap().restore(data)
    }
}

impl StateMachine for KeyValueStore {
    fn validate(&self, command: &Command) -> Result<(), String> {
        match (command.name.as_str(), command.args.len()) {
            ("set", 2) => Ok(()),
            ("delete", 1) => Ok(()),
            ("set", n) => Err(format!("set expects 2 arguments, got {}", n)),
            ("delete", n) => Err(format!("delete expects 1 argument, got {}", n)),
            (other, _) => Err(format!("unknown command: {}", other)),
        }
    }

    fn apply(&mut self, command: &Command) -> ApplyResult {
        self.validate(command)?;
        match command.name.as_str() {
            "set" => {
                self.data
                    .insert(command.args[0].clone(), command.args[1].clone());
                Ok(String::new())
            }
            "delete" => {
                if self.data.remove(&command.args[0]).is_some() {
                    Ok(String::new())
                } else {
                    Err("NOT_FOUND".to_string())
                }
            }
            other => Err(format!("unknown command: {}", other)),
        }
    }
}

impl Snapshotable for KeyValueStore {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        // Clone-then-serialize: clone the map, serialize without holding
        // any locks.
        let data_clone = self.data.clone();
        serde_json::to_vec(&data_clone).map_err(|e| format!("snapshot serialization failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let restored: HashMap<String, String> = serde_json::from_slice(data)
            .map_err(|e| format!("snapshot deserialization failed: {}", e))?;
        self.data = restored;
        Ok(())
    }
}
