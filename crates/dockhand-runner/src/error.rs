// Error kinds the execution core distinguishes beyond plain failure.

use std::time::Duration;

/// Failures produced by the execution core itself. Engine errors pass
/// through unchanged; cancellation and timeout outcomes come from the
/// executor combinators.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Invalid configuration, unreadable event file, unresolvable platform.
    /// Fatal before or at job dispatch.
    #[error("configuration error: {0}")]
    Config(String),

    /// Expression or matrix-node evaluation failed where that is fatal.
    #[error("expression evaluation failed: {0}")]
    Evaluation(String),

    /// A user step exited non-zero.
    #[error("step '{step}' failed with exit code {exit_code}")]
    Step { step: String, exit_code: i32 },

    /// A service container failed its readiness check at runtime.
    #[error("service '{service}' did not become ready: {reason}")]
    Service { service: String, reason: String },

    /// A job finished with a failure result.
    #[error("Job '{job}' failed")]
    JobFailed { job: String },

    /// The job container outlived its allowed lifetime.
    #[error("job '{job}' exceeded max lifetime of {limit:?}")]
    Timeout { job: String, limit: Duration },
}
