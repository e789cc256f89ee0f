//! Transient result of evaluating one parameter vector.

use serde::{Deserialize, Serialize};

/// How an evaluation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationOutcome {
    /// The evaluator produced a usable score.
    Scored,
    /// The evaluator ran but its output record was unusable.
    MalformedOutput,
    /// The evaluator could not run or left no output record behind.
    ProcessError,
    /// The run was cancelled while the evaluator was in flight.
    Cancelled,
}

impl std::fmt::Display for EvaluationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Scored => "scored",
            Self::MalformedOutput => "malformed_output",
            Self::ProcessError => "process_error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Output of a single evaluation. Never persisted as-is; the scheduler maps it
/// onto a trial record.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub outcome: EvaluationOutcome,
    /// Present only when `outcome` is `Scored`.
    pub score: Option<f64>,
    pub iteration_reached: Option<u64>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Human readable reason for a non-scored outcome.
    pub error: Option<String>,
}

impl EvaluationResult {
    fn with_outcome(outcome: EvaluationOutcome) -> Self {
        Self {
            outcome,
            score: None,
            iteration_reached: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error: None,
        }
    }

    pub fn scored(score: f64, iteration_reached: u64) -> Self {
        Self {
            score: Some(score),
            iteration_reached: Some(iteration_reached),
            ..Self::with_outcome(EvaluationOutcome::Scored)
        }
    }

    pub fn malformed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_outcome(EvaluationOutcome::MalformedOutput)
        }
    }

    pub fn process_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_outcome(EvaluationOutcome::ProcessError)
        }
    }

    pub fn cancelled() -> Self {
        Self::with_outcome(EvaluationOutcome::Cancelled)
    }

    /// Attach the captured process streams and exit code.
    pub fn with_output(mut self, stdout: String, stderr: String, exit_code: Option<i32>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self.exit_code = exit_code;
        self
    }
}
