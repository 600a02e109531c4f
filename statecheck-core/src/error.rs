//! Error and report types for state machine testing.

use crate::state::SymbolicId;
use std::fmt;
use thiserror::Error;

/// Misuse of a symbolic variable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VarError {
    /// The variable's producing step has not executed (or was shrunk away).
    #[error("{0} is not bound yet")]
    Unresolved(SymbolicId),

    /// The variable is bound to a value of a different type.
    #[error("{id} is not bound to a value of type {expected}")]
    TypeMismatch { id: SymbolicId, expected: &'static str },

    /// A step tried to bind a variable that already holds a value.
    #[error("{0} is already bound")]
    AlreadyBound(SymbolicId),
}

/// Failure reported by a command's `execute` or `ensure`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0}")]
    Failed(String),

    #[error("model error: {0}")]
    Var(#[from] VarError),
}

impl CommandError {
    pub fn failed(message: impl Into<String>) -> Self {
        CommandError::Failed(message.into())
    }
}

impl From<String> for CommandError {
    fn from(message: String) -> Self {
        CommandError::Failed(message)
    }
}

impl From<&str> for CommandError {
    fn from(message: &str) -> Self {
        CommandError::Failed(message.to_string())
    }
}

/// Postcondition helper: fails unless `actual == expected`.
pub fn ensure_eq<T>(expected: &T, actual: &T) -> std::result::Result<(), CommandError>
where
    T: PartialEq + fmt::Debug + ?Sized,
{
    if expected == actual {
        Ok(())
    } else {
        Err(CommandError::Failed(format!(
            "expected {expected:?}, observed {actual:?}"
        )))
    }
}

/// Engine errors. These are configuration or model bugs, not test failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// No command was applicable while planning.
    #[error("no command is applicable at step {step} in state {state}")]
    PreconditionExhausted { step: usize, state: String },

    #[error("invalid range {min}..={max}")]
    InvalidRange { min: usize, max: usize },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("generator failed: {reason}")]
    GeneratorFailed { reason: String },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// Why a single step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// `ensure` rejected the observed output.
    Postcondition(String),
    /// `execute` returned an error or panicked.
    Runtime(String),
    /// A symbolic variable was resolved before it was bound.
    Model(VarError),
}

impl FailureKind {
    pub fn is_model_error(&self) -> bool {
        matches!(self, FailureKind::Model(_))
    }

    pub(crate) fn from_execute(error: CommandError) -> Self {
        match error {
            CommandError::Failed(message) => FailureKind::Runtime(message),
            CommandError::Var(var) => FailureKind::Model(var),
        }
    }

    pub(crate) fn from_ensure(error: CommandError) -> Self {
        match error {
            CommandError::Failed(message) => FailureKind::Postcondition(message),
            CommandError::Var(var) => FailureKind::Model(var),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Postcondition(reason) => write!(f, "postcondition failed: {reason}"),
            FailureKind::Runtime(reason) => write!(f, "execution failed: {reason}"),
            FailureKind::Model(error) => write!(f, "model error: {error}"),
        }
    }
}

/// The step at which a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Index of the failing action within its sequence.
    pub step: usize,
    pub command: String,
    /// The failing action rendered as `VarN = name(input)`.
    pub action: String,
    pub kind: FailureKind,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} `{}`: {}", self.step, self.action, self.kind)
    }
}

/// How a parallel run failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParallelFailure {
    /// The sequential prefix already failed.
    Prefix(StepFailure),
    /// A branch's `execute` failed.
    Branch { branch: usize, failure: StepFailure },
    /// No interleaving of the branch traces satisfies the model.
    NotLinearizable {
        /// Observed operations per branch, `VarN = name(input) => output`.
        traces: Vec<Vec<String>>,
        /// Longest interleaving the checker validated before giving up.
        furthest: Vec<String>,
    },
}

/// A shrinking step in the failure progression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShrinkStep {
    /// The counterexample at this step.
    pub counterexample: String,
    /// The step number (0 = original, 1+ = accepted shrinks).
    pub step: usize,
}

/// The minimal failing test found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Counterexample {
    Sequential {
        actions: Vec<String>,
        failure: StepFailure,
    },
    Parallel {
        prefix: Vec<String>,
        branches: Vec<Vec<String>>,
        failure: ParallelFailure,
    },
}

impl Counterexample {
    /// Total number of actions in the counterexample.
    pub fn len(&self) -> usize {
        match self {
            Counterexample::Sequential { actions, .. } => actions.len(),
            Counterexample::Parallel {
                prefix, branches, ..
            } => prefix.len() + branches.iter().map(Vec::len).sum::<usize>(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_linearizability_failure(&self) -> bool {
        matches!(
            self,
            Counterexample::Parallel {
                failure: ParallelFailure::NotLinearizable { .. },
                ..
            }
        )
    }
}

impl fmt::Display for Counterexample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Counterexample::Sequential { actions, failure } => {
                for (i, action) in actions.iter().enumerate() {
                    let marker = if i == failure.step { "✗" } else { "│" };
                    writeln!(f, "      {marker} {action}")?;
                }
                write!(f, "    {failure}")
            }
            Counterexample::Parallel {
                prefix,
                branches,
                failure,
            } => {
                writeln!(f, "    Prefix:")?;
                for action in prefix {
                    writeln!(f, "      │ {action}")?;
                }
                for (b, branch) in branches.iter().enumerate() {
                    writeln!(f, "    Branch {}:", b + 1)?;
                    for action in branch {
                        writeln!(f, "      │ {action}")?;
                    }
                }
                match failure {
                    ParallelFailure::Prefix(step) => write!(f, "    prefix {step}"),
                    ParallelFailure::Branch { branch, failure } => {
                        write!(f, "    branch {} {failure}", branch + 1)
                    }
                    ParallelFailure::NotLinearizable { traces, furthest } => {
                        writeln!(f, "    Observed:")?;
                        for (b, trace) in traces.iter().enumerate() {
                            for op in trace {
                                writeln!(f, "      {} │ {op}", b + 1)?;
                            }
                        }
                        writeln!(f, "    Furthest interleaving:")?;
                        for op in furthest {
                            writeln!(f, "      │ {op}")?;
                        }
                        write!(f, "    no interleaving is linearizable")
                    }
                }
            }
        }
    }
}

/// Outcome of a state machine test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestResult {
    /// Every trial passed.
    Pass { tests_run: usize },

    /// A trial failed; the counterexample has been shrunk.
    Fail {
        counterexample: Counterexample,
        tests_run: usize,
        shrinks_performed: usize,
        /// The shrinking progression from the original to the minimal failure.
        shrink_steps: Vec<ShrinkStep>,
    },
}

impl TestResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, TestResult::Pass { .. })
    }

    pub fn counterexample(&self) -> Option<&Counterexample> {
        match self {
            TestResult::Pass { .. } => None,
            TestResult::Fail { counterexample, .. } => Some(counterexample),
        }
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestResult::Pass { tests_run } => {
                write!(f, "  ✓ state machine passed {tests_run} tests.")
            }
            TestResult::Fail {
                counterexample,
                tests_run,
                shrinks_performed,
                shrink_steps,
            } => {
                writeln!(
                    f,
                    "  ✗ state machine failed after {tests_run} tests and {shrinks_performed} shrinks."
                )?;

                if shrink_steps.len() > 1 {
                    writeln!(f)?;
                    writeln!(f, "    Shrinking progression:")?;
                    for step in shrink_steps {
                        if step.step == 0 {
                            writeln!(f, "      │ Original: {}", step.counterexample)?;
                        } else {
                            writeln!(f, "      │ Step {}: {}", step.step, step.counterexample)?;
                        }
                    }
                    writeln!(f)?;
                }

                writeln!(f, "    Minimal counterexample:")?;
                write!(f, "{counterexample}")
            }
        }
    }
}
