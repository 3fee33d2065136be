use std::time::Duration;

use thiserror::Error;

/// The error kinds the core surfaces to callers.
///
/// Every operation returns these through `anyhow::Error`; callers that need
/// to branch on a kind downcast with [`EngineError::from_err`]. The core
/// never terminates the process - translating errors to exit codes is the
/// CLI's job.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("registry authentication required for `{registry}`")]
    AuthRequired { registry: String },

    #[error("registry `{registry}` rejected the configured credentials")]
    AuthFailed { registry: String },

    #[error("`{0}` not found")]
    NotFound(String),

    #[error("invalid build spec - {0}")]
    InvalidSpec(String),

    #[error("no container runtime backend available")]
    BackendUnavailable,

    #[error("operation `{op}` timed out after {after:?}")]
    Timeout { op: String, after: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error("payload does not match job type `{job_type}`")]
    InvalidJobPayload { job_type: String },

    #[error("unknown job type `{0}`")]
    UnknownJobType(String),

    #[error("container running `{image}` exited with status {code}")]
    NonZeroExit { image: String, code: i64 },

    #[error("image build failed:\n{log_tail}")]
    BuildFailed { log_tail: String },

    #[error("plugin handshake failed - {0}")]
    PluginHandshake(String),

    #[error("plugin exited unexpectedly - {0}")]
    PluginExit(String),
}

impl EngineError {
    /// Extracts the engine error kind from an `anyhow` chain, if present.
    pub fn from_err(err: &anyhow::Error) -> Option<&EngineError> {
        err.downcast_ref::<EngineError>()
    }

    /// Whether an operation that failed with this error may be retried.
    /// Only transient transport-level failures qualify - spec validation,
    /// non-zero exits and protocol violations never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout { .. })
    }
}

/// Wrapper marking an error as non-fatal for the pipeline. The runtime
/// demotes such errors to warnings instead of cancelling the group.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct BuildContinue(pub anyhow::Error);

/// Tags `err` so the pipeline runtime treats it as a warning.
pub fn continue_on(err: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(BuildContinue(err))
}

/// True if `err` was tagged with [`continue_on`].
pub fn is_continue(err: &anyhow::Error) -> bool {
    err.downcast_ref::<BuildContinue>().is_some()
}
