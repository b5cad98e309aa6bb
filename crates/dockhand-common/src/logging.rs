// Logger bootstrap and the per-job logging scope.
// The process-wide subscriber is installed once; job output is prefixed
// with the padded display name and passed through the masker before emit.

use std::sync::Once;

use crate::masker::Masks;

static INIT: Once = Once::new();

/// Install the process-wide subscriber.
///
/// `structured` switches between human-readable and JSON line output.
/// `default_level` is used when `RUST_LOG` is not set. Calling this more
/// than once is a no-op.
pub fn init(structured: bool, default_level: &str) {
    let default_level = default_level.to_string();
    INIT.call_once(move || {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
        if structured {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .try_init()
                .ok();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()
                .ok();
        }
    });
}

/// The logging scope of one job execution.
///
/// Every line is redacted through the shared [`Masks`] set (unless secrets
/// were explicitly made visible) and prefixed with the job's padded display
/// name so concurrent jobs stay readable in interleaved output.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    display_name: String,
    masks: Masks,
    secrets_visible: bool,
    debug_enabled: bool,
}

impl JobLogger {
    pub fn new(job_id: impl Into<String>, display_name: impl Into<String>, masks: Masks) -> Self {
        Self {
            job_id: job_id.into(),
            display_name: display_name.into(),
            masks,
            secrets_visible: false,
            debug_enabled: false,
        }
    }

    /// Disable redaction. Only for explicitly insecure configurations.
    pub fn with_secrets_visible(mut self, visible: bool) -> Self {
        self.secrets_visible = visible;
        self
    }

    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug_enabled = enabled;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn masks(&self) -> &Masks {
        &self.masks
    }

    fn sanitize(&self, message: &str) -> String {
        if self.secrets_visible {
            message.to_string()
        } else {
            self.masks.apply(message)
        }
    }

    /// Raw output produced by a step (already line-split by the caller).
    pub fn output(&self, line: &str) {
        let line = self.sanitize(line);
        tracing::info!(target: "job", job_id = %self.job_id, "[{}] | {}", self.display_name, line);
    }

    pub fn info(&self, message: &str) {
        let message = self.sanitize(message);
        tracing::info!(target: "job", job_id = %self.job_id, "[{}] {}", self.display_name, message);
    }

    pub fn debug(&self, message: &str) {
        if !self.debug_enabled {
            return;
        }
        let message = self.sanitize(message);
        tracing::debug!(target: "job", job_id = %self.job_id, "[{}] {}", self.display_name, message);
    }

    pub fn warn(&self, message: &str) {
        let message = self.sanitize(message);
        tracing::warn!(target: "job", job_id = %self.job_id, "[{}] {}", self.display_name, message);
    }

    pub fn error(&self, message: &str) {
        let message = self.sanitize(message);
        tracing::error!(target: "job", job_id = %self.job_id, "[{}] {}", self.display_name, message);
    }

    /// Begin a collapsible output group.
    pub fn group(&self, title: &str) {
        let title = self.sanitize(title);
        tracing::info!(target: "job", job_id = %self.job_id, "[{}] >> {}", self.display_name, title);
    }

    pub fn end_group(&self) {
        tracing::info!(target: "job", job_id = %self.job_id, "[{}] <<", self.display_name);
    }
}
