// The run context: the execution environment of one matrix point of one
// Run. Owned by its job executor; configuration and event payload are
// shared read-only across the plan.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use dockhand_common::Masks;

use crate::config::Config;
use crate::expression::{ContextEvaluator, ExpressionEvaluator, SharedStepResults};
use crate::matrix::MatrixPoint;
use crate::model::{Job, JobResult, Run};

/// The hot state of one executing matrix point.
pub struct RunContext {
    pub config: Arc<Config>,
    pub run: Run,
    pub matrix: MatrixPoint,
    /// The materialized event payload, shared read-only.
    pub event: Arc<serde_json::Value>,
    /// Interpolated display name, `-N` suffixed for multi-point matrices.
    pub name: String,
    /// The display name before matrix suffixing.
    pub job_name: String,
    /// Results of completed steps; written only by the step sequencer.
    pub step_results: SharedStepResults,
    /// Strings redacted from this Run's log output; shared by siblings.
    pub masks: Masks,
    /// When this context executes a reusable workflow, the invoking context.
    pub caller: Option<Weak<RunContext>>,

    needs_jobs: HashMap<String, Arc<Job>>,

    // Runtime container state, written by the owning job executor.
    pub(crate) image: RwLock<Option<String>>,
    pub(crate) container_id: RwLock<Option<String>>,
    pub(crate) service_container_ids: RwLock<Vec<String>>,
    pub(crate) network: RwLock<Option<String>>,
    /// Display name and exit code of the first hard step failure.
    pub(crate) failed_step: RwLock<Option<(String, i32)>>,
}

impl RunContext {
    /// Build the context for one (Run, matrix point) pair. The display name
    /// is interpolated immediately under a fresh evaluator.
    pub fn new(
        config: Arc<Config>,
        run: Run,
        matrix: MatrixPoint,
        event: Arc<serde_json::Value>,
        needs_jobs: HashMap<String, Arc<Job>>,
        masks: Masks,
        caller: Option<Weak<RunContext>>,
    ) -> Self {
        let mut context = Self {
            config,
            run,
            matrix,
            event,
            name: String::new(),
            job_name: String::new(),
            step_results: SharedStepResults::default(),
            masks,
            caller,
            needs_jobs,
            image: RwLock::new(None),
            container_id: RwLock::new(None),
            service_container_ids: RwLock::new(Vec::new()),
            network: RwLock::new(None),
            failed_step: RwLock::new(None),
        };
        let name = context.evaluator().interpolate(&context.run.display_base());
        context.name = name.clone();
        context.job_name = name;
        context
    }

    /// Suffix the display name with the 1-based matrix index when the Run
    /// expanded into more than one point.
    pub fn apply_matrix_index(&mut self, index: usize, total: usize) {
        if total > 1 {
            self.name = format!("{}-{}", self.job_name, index + 1);
        }
    }

    /// A fresh evaluator bound to the job's currently recorded result.
    pub fn evaluator(&self) -> ContextEvaluator {
        self.evaluator_with(self.run.job.result(), false)
    }

    /// A fresh evaluator with an explicit job status and cancellation state,
    /// used by the step sequencer while the job is in flight.
    pub fn evaluator_with(&self, status: JobResult, cancelled: bool) -> ContextEvaluator {
        ContextEvaluator::new(
            self.contexts_root(),
            Arc::clone(&self.step_results),
            status,
            cancelled,
        )
    }

    fn github_context(&self) -> serde_json::Value {
        if let Some(ref preset) = self.config.preset_github_context {
            return preset.clone();
        }
        let instance = if self.config.github_instance.is_empty() {
            "github.com"
        } else {
            &self.config.github_instance
        };
        serde_json::json!({
            "actor": self.config.actor,
            "event_name": self.config.event_name,
            "event": *self.event,
            "token": self.config.get_token(),
            "server_url": format!("https://{instance}"),
            "workspace": self.config.container_workdir(),
            "ref": format!("refs/heads/{}", self.config.default_branch),
        })
    }

    fn needs_context(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        for id in &self.run.job.needs {
            if let Some(job) = self.needs_jobs.get(id) {
                object.insert(
                    id.clone(),
                    serde_json::json!({
                        "result": job.result().as_str(),
                        "outputs": job.outputs_snapshot(),
                    }),
                );
            }
        }
        serde_json::Value::Object(object)
    }

    fn contexts_root(&self) -> serde_json::Value {
        let mut env = self.config.env.clone();
        for (key, value) in &self.run.job.env {
            env.insert(key.clone(), value.clone());
        }
        serde_json::json!({
            "github": self.github_context(),
            "env": env,
            "secrets": self.config.secrets,
            "vars": self.config.vars,
            "inputs": self.config.inputs,
            "matrix": self.matrix,
            "needs": self.needs_context(),
        })
    }

    /// The container name for this context. Deterministic for a given
    /// (job, matrix point), so a kept container can be found and reused on
    /// a later invocation.
    pub fn container_name(&self) -> String {
        let prefix = if self.config.container_name_prefix.is_empty() {
            "dockhand"
        } else {
            &self.config.container_name_prefix
        };
        let slug: String = format!("{}-{}", self.run.job_id, self.name)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("{prefix}-{}", slug.trim_matches('-'))
    }

    pub fn container_id(&self) -> Option<String> {
        self.container_id.read().clone()
    }

    /// The composed per-job executor for this context: guard, image,
    /// network, container, services, steps, outputs, teardown.
    pub fn executor(
        self: &Arc<Self>,
        engine: Arc<dyn dockhand_container::ContainerEngine>,
        logger: dockhand_common::JobLogger,
    ) -> dockhand_common::Executor {
        crate::job_executor::new_job_executor(Arc::clone(self), engine, logger)
    }
}

impl fmt::Display for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
