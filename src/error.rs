//! Error Taxonomy
//!
//! Crate-wide error type covering configuration problems, step-graph
//! queries, missing upstream artifacts, and unsupported programs.
//!
//! Configuration and graph errors are fatal and surface to the CLI
//! driver before anything is submitted. Per-task errors during output
//! handling are caught at the call site and routed to the `failed`
//! bucket instead of being propagated, so a job's accounting is never
//! lost. External-program crashes and timeouts are *not* errors here;
//! they are normal classification outcomes.

use std::path::PathBuf;

use thiserror::Error;

/// All errors produced by the workflow engine.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Malformed or inconsistent step configuration.
    #[error("invalid workflow configuration: {0}")]
    Config(String),

    /// A step-graph query referenced an unknown step.
    #[error("unknown workflow step '{0}'")]
    StepNotFound(String),

    /// The initial step has no predecessor.
    #[error("step '{0}' is the initial step and has no predecessor")]
    NoPredecessor(String),

    /// A predecessor's expected output directory is absent or empty.
    #[error("missing upstream artifacts: {}", .0.display())]
    MissingUpstreamArtifacts(PathBuf),

    /// Classification or extraction requested for an unconfigured program.
    #[error("unsupported program '{0}'")]
    UnsupportedProgram(String),

    /// The batch scheduler rejected a submission.
    #[error("job submission failed: {0}")]
    Submission(String),

    /// A manifest lookup referenced a task index outside the wave.
    #[error("array task index {index} is out of range for manifest {}", .manifest.display())]
    TaskIndexOutOfRange { index: usize, manifest: PathBuf },

    /// Underlying filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FlowError>;
