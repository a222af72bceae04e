use std::path::PathBuf;

use thiserror::Error;

/// Failure to materialize a fresh workspace directory.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("failed to create a workspace under {root} after {attempts} attempts: {source}")]
    Creation {
        root: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Reasons the scheduler refuses or abandons a submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The wait queue is full; the caller should back off.
    #[error("scheduler overloaded: {depth} submissions already waiting")]
    Overloaded { depth: usize },

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// The scheduler stopped before the submission was executed.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{section}.{field} must be greater than zero")]
    ZeroLimit {
        section: &'static str,
        field: &'static str,
    },

    #[error("language {0} is configured more than once")]
    DuplicateLanguage(String),

    #[error("language {0} has an empty run command")]
    EmptyRunCommand(String),

    #[error("language {0} has an empty compile command")]
    EmptyCompileCommand(String),
}
