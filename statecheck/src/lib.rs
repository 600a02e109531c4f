//! Model-based state machine testing with linearizability checking.
//!
//! This is the main entry point, re-exporting the engine from
//! `statecheck-core`.

pub use statecheck_core::*;
