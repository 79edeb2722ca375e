//! The seam between the synthesis engine and the external test runner.
//!
//! The engine only produces candidates; executing them against the
//! instrumented target, deduplicating, measuring coverage and feeding scores
//! back all belong to the runner behind this trait.

use crate::mutator::Whence;
use thiserror::Error;

/// Why an input was generated; the runner uses this to attribute executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ExecKind {
    /// Ordinary mutation of a corpus parent.
    #[default]
    Fuzz = 0,
    /// Systematic perturbation pass driven by an external phase.
    Smash = 1,
    /// Rewrite derived from observed comparison operands.
    SonarHint = 2,
}

/// One generated input, with its provenance and scheduling hints.
#[derive(Debug)]
pub struct Candidate {
    pub data: Vec<u8>,
    pub whence: Whence,
    pub depth: usize,
    pub kind: ExecKind,
}

/// What the engine gets back from one execution.
#[derive(Debug, Default)]
pub struct ExecResult {
    /// Packed comparison telemetry emitted by the target, if any.
    pub sonar: Option<Vec<u8>>,
}

/// Errors a runner can report back into the engine's loop.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// The target could not be executed at all (as opposed to crashing,
    /// which is a result, not an error).
    #[error("target execution failed: {0}")]
    Execution(String),

    /// The runner is tearing down; the worker loop should exit quietly.
    #[error("runner is shutting down")]
    ShuttingDown,
}

/// Executes candidates produced by the engine.
pub trait Runner {
    fn run(&mut self, candidate: Candidate) -> Result<ExecResult, RunnerError>;
}
