//! State machine layer
//!
//! - `KeyValueStore`: sample key-value state machine
//! - `RecordingMachine`: records applied commands for testing

pub mod kv;
pub mod traits;

pub use traits::{
    AppliedCommands, ApplyResult, Command, RecordingMachine, Snapshotable, StateMachine,
};
