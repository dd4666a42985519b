//! Update orchestration state machine.

pub mod machine;

pub use machine::{InvalidTransition, UpdateState, transition};
