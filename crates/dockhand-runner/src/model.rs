// The execution-facing workflow model: a Plan of Stages of Runs.
// Produced by the workflow parser; the core only consumes it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;

/// A workflow decomposed into topologically ordered stages.
///
/// Every job in stage `k` may only depend on jobs in stages before `k`.
#[derive(Debug, Default)]
pub struct Plan {
    pub stages: Vec<Stage>,
}

impl Plan {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// All runs of the plan, in stage order.
    pub fn runs(&self) -> impl Iterator<Item = &Run> {
        self.stages.iter().flat_map(|stage| stage.runs.iter())
    }

    /// Map from job id to its job, across all stages.
    pub fn jobs_by_id(&self) -> HashMap<String, Arc<Job>> {
        self.runs()
            .map(|run| (run.job_id.clone(), Arc::clone(&run.job)))
            .collect()
    }
}

/// A set of jobs with no dependencies among themselves; all of a stage's
/// runs are eligible to execute in parallel.
#[derive(Debug, Default)]
pub struct Stage {
    pub runs: Vec<Run>,
}

impl Stage {
    pub fn new(runs: Vec<Run>) -> Self {
        Self { runs }
    }
}

/// One job instance within a stage, prior to matrix expansion.
#[derive(Debug, Clone)]
pub struct Run {
    pub job_id: String,
    pub job: Arc<Job>,
}

impl Run {
    pub fn new(job_id: impl Into<String>, job: Job) -> Self {
        Self {
            job_id: job_id.into(),
            job: Arc::new(job),
        }
    }

    /// The un-interpolated display base: the authored name, or the job id.
    pub fn display_base(&self) -> String {
        self.job
            .name
            .clone()
            .unwrap_or_else(|| self.job_id.clone())
    }
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_base())
    }
}

/// The user-authored job specification.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Job {
    pub name: Option<String>,
    #[serde(rename = "runs-on")]
    pub runs_on: Vec<String>,
    pub needs: Vec<String>,
    #[serde(rename = "if")]
    pub if_condition: Option<String>,
    pub env: HashMap<String, String>,
    pub container: Option<ContainerSpec>,
    pub services: HashMap<String, ContainerSpec>,
    pub steps: Vec<Step>,
    pub strategy: Option<Strategy>,
    pub outputs: HashMap<String, String>,
    #[serde(rename = "timeout-minutes")]
    pub timeout_minutes: Option<u64>,

    #[serde(skip)]
    pub(crate) result: RwLock<JobResult>,
    #[serde(skip)]
    pub(crate) resolved_outputs: RwLock<HashMap<String, String>>,
}

impl Job {
    pub fn result(&self) -> JobResult {
        *self.result.read()
    }

    pub fn set_result(&self, result: JobResult) {
        *self.result.write() = result;
    }

    /// Record a failure unless one is already recorded.
    pub fn mark_failed(&self) {
        let mut result = self.result.write();
        if *result != JobResult::Failure {
            *result = JobResult::Failure;
        }
    }

    pub fn set_outputs(&self, outputs: HashMap<String, String>) {
        *self.resolved_outputs.write() = outputs;
    }

    pub fn outputs_snapshot(&self) -> HashMap<String, String> {
        self.resolved_outputs.read().clone()
    }
}

/// Matrix strategy attached to a job.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Strategy {
    #[serde(rename = "fail-fast")]
    pub fail_fast: Option<bool>,
    #[serde(rename = "max-parallel")]
    pub max_parallel: Option<usize>,
    #[serde(rename = "matrix")]
    pub raw_matrix: serde_yaml::Value,
}

impl Strategy {
    /// Fail-fast defaults to on when the strategy is present.
    pub fn fail_fast(&self) -> bool {
        self.fail_fast.unwrap_or(true)
    }
}

/// A container specification for the job container or a service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    pub image: String,
    pub env: HashMap<String, String>,
    pub ports: Vec<String>,
    pub volumes: Vec<String>,
    pub options: Option<String>,
}

/// A single step of a job. Only `run` steps reach this core; action
/// resolution happens upstream.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Step {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "if")]
    pub if_condition: Option<String>,
    pub run: Option<String>,
    pub shell: Option<String>,
    #[serde(rename = "working-directory")]
    pub working_directory: Option<String>,
    pub env: HashMap<String, String>,
    #[serde(rename = "continue-on-error")]
    pub continue_on_error: bool,
    #[serde(rename = "timeout-minutes")]
    pub timeout_minutes: Option<u64>,
}

impl Step {
    /// The display name: the authored name, the first script line, or the id.
    pub fn display_name(&self) -> String {
        if let Some(ref name) = self.name {
            return name.clone();
        }
        if let Some(ref run) = self.run {
            if let Some(first) = run.lines().next() {
                return first.to_string();
            }
        }
        self.id.clone().unwrap_or_else(|| "step".to_string())
    }

    /// The key under which this step's result is recorded.
    pub fn result_key(&self, index: usize) -> String {
        self.id.clone().unwrap_or_else(|| index.to_string())
    }

    /// The shell invocation for the step script, defaulting to `sh -e`.
    pub fn shell_command(&self) -> Vec<String> {
        match self.shell.as_deref() {
            Some("bash") => vec![
                "bash".to_string(),
                "--noprofile".to_string(),
                "--norc".to_string(),
                "-eo".to_string(),
                "pipefail".to_string(),
                "-c".to_string(),
            ],
            Some("sh") | None => vec!["sh".to_string(), "-e".to_string(), "-c".to_string()],
            Some(other) => vec![other.to_string(), "-c".to_string()],
        }
    }
}

/// Final result of a Run, exposed to expressions and the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobResult {
    /// Not executed (yet).
    #[default]
    Unset,
    Success,
    Failure,
    Skipped,
}

impl JobResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobResult::Unset => "",
            JobResult::Success => "success",
            JobResult::Failure => "failure",
            JobResult::Skipped => "skipped",
        }
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failure,
    Skipped,
    Cancelled,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Success => "success",
            StepOutcome::Failure => "failure",
            StepOutcome::Skipped => "skipped",
            StepOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recorded result of a completed (or skipped) step.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// The raw result of the step.
    pub outcome: StepOutcome,
    /// The result after continue-on-error is applied.
    pub conclusion: StepOutcome,
    pub outputs: HashMap<String, String>,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn new(outcome: StepOutcome, conclusion: StepOutcome) -> Self {
        Self {
            outcome,
            conclusion,
            outputs: HashMap::new(),
            completed_at: Utc::now(),
        }
    }

    pub fn skipped() -> Self {
        Self::new(StepOutcome::Skipped, StepOutcome::Skipped)
    }
}
