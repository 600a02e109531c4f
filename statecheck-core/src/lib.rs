//! Core engine for model-based state machine testing.
//!
//! A test describes the system under test with an abstract model state and a
//! palette of [`Command`]s. The sequential engine plans random command
//! sequences, runs them against fresh systems and checks every observed
//! output against the model. The parallel engine runs branches of commands
//! concurrently against one shared system and checks that the outputs are
//! linearizable. Failures are shrunk to small counterexamples.

pub mod data;
pub mod error;
pub mod gen;
pub mod linearize;
pub mod parallel;
pub mod sequential;
pub mod shrink;
pub mod state;
pub mod tree;

// Re-export the main types
pub use data::*;
pub use error::*;
pub use gen::*;
pub use linearize::{linearize, Linearization, Operation};
pub use parallel::{execute_parallel, Parallel, ParallelSpec};
pub use sequential::{execute_sequential, ExecutedStep, Sequential, SequentialSpec};
pub use state::*;
pub use tree::*;
