use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::governor::{Breach, ProcessObservation};
use crate::orchestrator::RawExecution;

/// Classified result category of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Success,
    CompileError,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    InternalError,
}

impl Outcome {
    /// False only when our own infrastructure failed
    pub fn is_program_caused(self) -> bool {
        self != Outcome::InternalError
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "Success",
            Outcome::CompileError => "Compile Error",
            Outcome::RuntimeError => "Runtime Error",
            Outcome::Timeout => "Timeout",
            Outcome::ResourceExceeded => "Resource Exceeded",
            Outcome::InternalError => "Internal Error",
        };
        f.write_str(s)
    }
}

/// Maps what the orchestrator observed to an [`Outcome`].
///
/// Only the process's own signalled status and the governor's verdict are
/// consulted; output text never decides anything.
pub fn classify(raw: &RawExecution) -> Outcome {
    match raw {
        RawExecution::Faulted { .. } => Outcome::InternalError,
        RawExecution::CompileFailed { .. } => Outcome::CompileError,
        RawExecution::Completed { run, .. } => classify_run(run),
    }
}

fn classify_run(run: &ProcessObservation) -> Outcome {
    match run.breach {
        Some(Breach::WallTime) => Outcome::Timeout,
        Some(Breach::Memory | Breach::Output) => Outcome::ResourceExceeded,
        None if run.exit_code == Some(0) => Outcome::Success,
        None => Outcome::RuntimeError,
    }
}

/// What the caller gets back for one submission
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub submission_id: u64,
    pub outcome: Outcome,
    #[serde(serialize_with = "lossy_utf8")]
    pub stdout: Vec<u8>,
    #[serde(serialize_with = "lossy_utf8")]
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub breach: Option<Breach>,
    pub duration_ms: u64,
    pub peak_memory_bytes: u64,
}

impl ExecutionResult {
    /// Builds the result from a finished execution
    ///
    /// Program-caused outcomes carry the program's (or compiler's) own output
    /// verbatim. Internal faults are summarized; `reference` lets operators
    /// find the detailed log lines.
    pub fn from_raw(submission_id: u64, raw: RawExecution, reference: &str) -> Self {
        let outcome = classify(&raw);
        match raw {
            RawExecution::CompileFailed { compile, .. } => {
                Self::from_observation(submission_id, outcome, compile)
            }
            RawExecution::Completed { run, .. } => Self::from_observation(submission_id, outcome, run),
            RawExecution::Faulted { .. } => {
                Self::internal_error(submission_id, Duration::ZERO, reference)
            }
        }
    }

    pub fn internal_error(submission_id: u64, duration: Duration, reference: &str) -> Self {
        Self {
            submission_id,
            outcome: Outcome::InternalError,
            stdout: Vec::new(),
            stderr: format!("Internal error while executing the submission (ref {reference})")
                .into_bytes(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: None,
            signal: None,
            breach: None,
            duration_ms: millis(duration),
            peak_memory_bytes: 0,
        }
    }

    fn from_observation(submission_id: u64, outcome: Outcome, obs: ProcessObservation) -> Self {
        Self {
            submission_id,
            outcome,
            stdout: obs.stdout.bytes,
            stderr: obs.stderr.bytes,
            stdout_truncated: obs.stdout.truncated,
            stderr_truncated: obs.stderr.truncated,
            exit_code: obs.exit_code,
            signal: obs.signal,
            breach: obs.breach,
            duration_ms: millis(obs.duration),
            peak_memory_bytes: obs.peak_memory_bytes,
        }
    }

    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn lossy_utf8<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}
