// The plan executor: stages in sequence, runs fanned out per stage under
// the host CPU cap, matrix points fanned out per run under the strategy
// cap, and a trailing failure aggregator over the whole plan.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use dockhand_common::{logging, Cancelled, Executor, JobLogger, Masks};
use dockhand_container::{ContainerEngine, HostProbe};

use crate::config::Config;
use crate::error::RunnerError;
use crate::expression::ExpressionEvaluator;
use crate::job_executor::is_cancellation;
use crate::matrix::{self, MatrixPoint};
use crate::model::{Job, JobResult, Plan, Run};
use crate::run_context::RunContext;

/// Default per-run matrix parallelism when the strategy does not set one.
const DEFAULT_MAX_PARALLEL: usize = 4;

/// Executes workflow plans against a container engine.
pub struct Runner {
    config: Arc<Config>,
    event: Arc<serde_json::Value>,
    engine: Arc<dyn ContainerEngine>,
    probe: Arc<dyn HostProbe>,
    caller: Option<Arc<RunContext>>,
}

impl Runner {
    /// Validate the configuration, bootstrap logging, and materialize the
    /// event payload once.
    pub fn new(
        config: Config,
        engine: Arc<dyn ContainerEngine>,
        probe: Arc<dyn HostProbe>,
    ) -> Result<Self> {
        logging::init(config.structured_logging, "info");

        let event_json = config.materialize_event_json()?;
        let event: serde_json::Value = serde_json::from_str(&event_json)
            .map_err(|error| RunnerError::Config(format!("invalid event payload: {error}")))?;

        Ok(Self {
            config: Arc::new(config),
            event: Arc::new(event),
            engine,
            probe,
            caller: None,
        })
    }

    /// Mark this runner as executing a reusable workflow on behalf of the
    /// given context.
    pub fn with_caller(mut self, caller: Arc<RunContext>) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Compose the executor for a whole plan. Nothing runs until the
    /// returned executor is invoked.
    pub fn new_plan_executor(&self, plan: &Plan) -> Executor {
        let jobs_by_id = Arc::new(plan.jobs_by_id());
        let name_width = Arc::new(AtomicUsize::new(0));

        let mut stage_executors = Vec::new();
        for stage in &plan.stages {
            let runs: Vec<Run> = stage.runs.clone();
            let config = Arc::clone(&self.config);
            let event = Arc::clone(&self.event);
            let engine = Arc::clone(&self.engine);
            let probe = Arc::clone(&self.probe);
            let jobs_by_id = Arc::clone(&jobs_by_id);
            let name_width = Arc::clone(&name_width);
            let caller = self.caller.as_ref().map(Arc::downgrade);

            stage_executors.push(Executor::new(move |cancel| async move {
                let mut run_executors = Vec::new();

                for run in &runs {
                    let raw_matrix = evaluate_raw_matrix(
                        run,
                        &config,
                        &event,
                        &jobs_by_id,
                        caller.clone(),
                    );
                    let matrixes = match matrix::select(&raw_matrix, &config.matrix_filter) {
                        Ok(points) => points,
                        Err(error) => {
                            tracing::error!("error while building matrix for '{}': {error:#}", run.job_id);
                            Vec::new()
                        }
                    };
                    tracing::debug!("final matrix for '{}': {matrixes:?}", run.job_id);

                    if matrixes.is_empty() {
                        tracing::debug!(
                            "job '{}' runs nothing: the matrix filter left no points",
                            run.job_id
                        );
                        continue;
                    }

                    let strategy_max = run
                        .job
                        .strategy
                        .as_ref()
                        .and_then(|s| s.max_parallel)
                        .unwrap_or(DEFAULT_MAX_PARALLEL)
                        .max(1);
                    let max_parallel = strategy_max.min(matrixes.len());
                    let fail_fast = run
                        .job
                        .strategy
                        .as_ref()
                        .map(|s| s.fail_fast())
                        .unwrap_or(false);

                    let masks = Masks::new();
                    for secret in config.secrets.values() {
                        masks.add(secret);
                    }
                    masks.add(&config.token);

                    let total = matrixes.len();
                    let mut contexts = Vec::with_capacity(total);
                    for (index, point) in matrixes.into_iter().enumerate() {
                        let mut rc = RunContext::new(
                            Arc::clone(&config),
                            run.clone(),
                            point,
                            Arc::clone(&event),
                            needs_for(run, &jobs_by_id),
                            masks.clone(),
                            caller.clone(),
                        );
                        rc.apply_matrix_index(index, total);
                        name_width.fetch_max(rc.name.chars().count(), Ordering::SeqCst);
                        contexts.push(Arc::new(rc));
                    }

                    let mut matrix_executors = Vec::with_capacity(contexts.len());
                    for rc in contexts {
                        let engine = Arc::clone(&engine);
                        let config = Arc::clone(&config);
                        let name_width = Arc::clone(&name_width);
                        matrix_executors.push(Executor::new(move |cancel| async move {
                            let width = name_width.load(Ordering::SeqCst);
                            let padded = format!("{:<width$}", rc.name);
                            let logger =
                                JobLogger::new(rc.run.job_id.clone(), padded, rc.masks.clone())
                                    .with_secrets_visible(config.insecure_secrets)
                                    .with_debug(config.job_logger_debug());
                            if !rc.matrix.is_empty() {
                                logger.debug(&format!("matrix: {:?}", rc.matrix));
                            }

                            let job = Arc::clone(&rc.run.job);
                            let outcome = rc.executor(engine, logger).guarded().run(cancel).await;
                            if let Err(ref error) = outcome {
                                // A panic or abrupt failure still counts
                                // against the job; cancellation does not.
                                if !is_cancellation(error) {
                                    job.mark_failed();
                                }
                            }
                            outcome
                        }));
                    }

                    run_executors.push(if fail_fast {
                        Executor::parallel_fail_fast(max_parallel, matrix_executors)
                    } else {
                        Executor::parallel(max_parallel, matrix_executors)
                    });
                }

                let ncpu = match probe.host_info(&cancel).await {
                    Ok(info) => info.ncpu.max(1),
                    Err(error) => {
                        tracing::error!("failed to obtain container engine info: {error}");
                        1
                    }
                };

                Executor::parallel(ncpu, run_executors).run(cancel).await
            }));
        }

        Executor::pipeline(stage_executors).then(handle_failure(plan))
    }

    /// Run a plan to completion under the given token.
    pub async fn run_plan(&self, plan: &Plan, cancel: CancellationToken) -> Result<()> {
        self.new_plan_executor(plan).run(cancel).await
    }
}

/// The process exit code for a plan outcome: 0 on success, 1 on any job
/// failure or cancellation.
pub fn exit_code(outcome: &Result<()>) -> i32 {
    match outcome {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn needs_for(run: &Run, jobs_by_id: &HashMap<String, Arc<Job>>) -> HashMap<String, Arc<Job>> {
    run.job
        .needs
        .iter()
        .filter_map(|id| jobs_by_id.get(id).map(|job| (id.clone(), Arc::clone(job))))
        .collect()
}

/// Best-effort evaluation of the strategy's raw matrix node, so runtime
/// values can flow into matrix dimensions. Failures are logged and the
/// node is used as-is.
fn evaluate_raw_matrix(
    run: &Run,
    config: &Arc<Config>,
    event: &Arc<serde_json::Value>,
    jobs_by_id: &HashMap<String, Arc<Job>>,
    caller: Option<std::sync::Weak<RunContext>>,
) -> serde_yaml::Value {
    let Some(ref strategy) = run.job.strategy else {
        return serde_yaml::Value::Null;
    };
    let mut node = strategy.raw_matrix.clone();
    if node.is_null() {
        return node;
    }
    let probe_rc = RunContext::new(
        Arc::clone(config),
        run.clone(),
        MatrixPoint::new(),
        Arc::clone(event),
        needs_for(run, jobs_by_id),
        Masks::new(),
        caller,
    );
    if let Err(error) = probe_rc.evaluator().evaluate_yaml_node(&mut node) {
        tracing::error!("error while evaluating matrix: {error:#}");
    }
    node
}

/// Walk the plan and report the first Run whose result is a failure; under
/// pure cancellation, report the cancellation itself.
fn handle_failure(plan: &Plan) -> Executor {
    let runs: Vec<Run> = plan.runs().cloned().collect();
    Executor::new(move |cancel| async move {
        for run in &runs {
            if run.job.result() == JobResult::Failure {
                return Err(RunnerError::JobFailed {
                    job: run.display_base(),
                }
                .into());
            }
        }
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerSpec, Stage, Step, Strategy};
    use dockhand_container::{ExecResult, MemoryEngine};
    use std::collections::HashSet;
    use std::time::Duration;

    fn shell_step(script: &str) -> Step {
        Step {
            run: Some(script.to_string()),
            ..Default::default()
        }
    }

    fn container_job(steps: Vec<Step>) -> Job {
        Job {
            container: Some(ContainerSpec {
                image: "alpine:3".to_string(),
                ..Default::default()
            }),
            steps,
            ..Default::default()
        }
    }

    fn runner_with(engine: &MemoryEngine, config: Config) -> Runner {
        Runner::new(
            config,
            Arc::new(engine.clone()) as Arc<dyn ContainerEngine>,
            Arc::new(engine.clone()) as Arc<dyn HostProbe>,
        )
        .unwrap()
    }

    fn single_stage(jobs: Vec<(&str, Job)>) -> Plan {
        Plan::new(vec![Stage::new(
            jobs.into_iter()
                .map(|(id, job)| Run::new(id, job))
                .collect(),
        )])
    }

    fn matrix_strategy(yaml: &str, max_parallel: Option<usize>, fail_fast: bool) -> Strategy {
        Strategy {
            fail_fast: Some(fail_fast),
            max_parallel,
            raw_matrix: serde_yaml::from_str(yaml).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_single_job_plan_succeeds() {
        let engine = MemoryEngine::new();
        let plan = single_stage(vec![("build", container_job(vec![shell_step("echo hi")]))]);
        let runner = runner_with(&engine, Config::default());

        runner
            .run_plan(&plan, CancellationToken::new())
            .await
            .unwrap();

        let run = plan.stages[0].runs[0].clone();
        assert_eq!(run.job.result(), JobResult::Success);
        let execs = engine
            .operations()
            .iter()
            .filter(|op| op.starts_with("exec"))
            .count();
        assert_eq!(execs, 1);
    }

    #[tokio::test]
    async fn test_matrix_with_user_filter() {
        let engine = MemoryEngine::new().with_exec_delay(Duration::from_millis(30));
        let mut job = container_job(vec![shell_step("echo ${{ matrix.os }}")]);
        job.strategy = Some(matrix_strategy("{os: [a, b, c]}", Some(2), false));

        let mut config = Config::default();
        config.matrix_filter.insert(
            "os".to_string(),
            HashSet::from(["a".to_string(), "c".to_string()]),
        );

        let plan = single_stage(vec![("job", job)]);
        let runner = runner_with(&engine, config);
        runner
            .run_plan(&plan, CancellationToken::new())
            .await
            .unwrap();

        let operations = engine.operations();
        let scripts: Vec<&String> = operations
            .iter()
            .filter(|op| op.starts_with("exec"))
            .collect();
        assert_eq!(scripts.len(), 2);
        assert!(scripts.iter().any(|op| op.contains("echo a")));
        assert!(scripts.iter().any(|op| op.contains("echo c")));
        assert!(!scripts.iter().any(|op| op.contains("echo b")));

        // Display names carry the stable -1 / -2 suffixes.
        assert!(operations
            .iter()
            .any(|op| op.starts_with("create_container") && op.contains("job-1")));
        assert!(operations
            .iter()
            .any(|op| op.starts_with("create_container") && op.contains("job-2")));

        assert!(engine.max_live_execs() <= 2);
    }

    #[tokio::test]
    async fn test_filter_that_empties_matrix_skips_job_silently() {
        let engine = MemoryEngine::new();
        let mut job = container_job(vec![shell_step("echo hi")]);
        job.strategy = Some(matrix_strategy("{os: [a, b]}", None, false));

        let mut config = Config::default();
        config
            .matrix_filter
            .insert("os".to_string(), HashSet::from(["zzz".to_string()]));

        let plan = single_stage(vec![("job", job)]);
        let runner = runner_with(&engine, config);
        runner
            .run_plan(&plan, CancellationToken::new())
            .await
            .unwrap();

        assert!(engine.operations().is_empty());
        assert_eq!(plan.stages[0].runs[0].job.result(), JobResult::Unset);
    }

    #[tokio::test]
    async fn test_parallelism_cap_on_matrix_points() {
        let engine = MemoryEngine::new().with_exec_delay(Duration::from_millis(40));
        let mut job = container_job(vec![shell_step("true")]);
        job.strategy = Some(matrix_strategy("{n: [1, 2, 3, 4]}", Some(2), false));

        let plan = single_stage(vec![("job", job)]);
        let runner = runner_with(&engine, Config::default());
        runner
            .run_plan(&plan, CancellationToken::new())
            .await
            .unwrap();

        assert!(engine.max_live_execs() <= 2);
        let execs = engine
            .operations()
            .iter()
            .filter(|op| op.starts_with("exec"))
            .count();
        assert_eq!(execs, 4);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_sibling_points_but_not_sibling_runs() {
        // Point 2 fails immediately; points 1 and 3 sleep long enough to
        // observe the fail-fast cancellation mid-exec.
        let engine = MemoryEngine::new().with_exec_delay(Duration::from_secs(5));
        engine.stub_exec(
            "point 2",
            ExecResult {
                exit_code: 1,
                output: vec![],
            },
        );

        let mut flaky = container_job(vec![shell_step("echo point ${{ matrix.n }}")]);
        flaky.strategy = Some(matrix_strategy("{n: [1, 2, 3]}", Some(3), true));
        // The sibling run has no steps, so it never touches the exec queue.
        let sibling = container_job(vec![]);

        let plan = single_stage(vec![("flaky", flaky), ("sibling", sibling)]);
        let runner = runner_with(&engine, Config::default());
        let outcome = runner.run_plan(&plan, CancellationToken::new()).await;

        let error = outcome.unwrap_err();
        // The first failure is point 2's hard step failure.
        assert!(matches!(
            error.downcast_ref::<RunnerError>(),
            Some(RunnerError::Step { exit_code: 1, .. })
        ));
        assert_eq!(plan.stages[0].runs[0].job.result(), JobResult::Failure);
        // The sibling run in the same stage still completed.
        assert_eq!(plan.stages[0].runs[1].job.result(), JobResult::Success);
    }

    #[tokio::test]
    async fn test_host_probe_failure_collapses_stage_parallelism() {
        let engine = MemoryEngine::new().with_failing_probe();
        let delayed = engine.clone().with_exec_delay(Duration::from_millis(30));

        let plan = single_stage(vec![
            ("one", container_job(vec![shell_step("true")])),
            ("two", container_job(vec![shell_step("true")])),
        ]);
        let runner = runner_with(&delayed, Config::default());
        runner
            .run_plan(&plan, CancellationToken::new())
            .await
            .unwrap();

        // Runs executed one at a time: never two job containers alive.
        assert!(engine.max_live_containers() <= 1);
    }

    #[tokio::test]
    async fn test_probe_failure_leaves_matrix_parallelism_unchanged() {
        let engine = MemoryEngine::new()
            .with_failing_probe()
            .with_exec_delay(Duration::from_millis(40));
        let mut job = container_job(vec![shell_step("true")]);
        job.strategy = Some(matrix_strategy("{n: [1, 2]}", Some(2), false));

        let plan = single_stage(vec![("job", job)]);
        let runner = runner_with(&engine, Config::default());
        runner
            .run_plan(&plan, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(engine.max_live_execs(), 2);
    }

    #[tokio::test]
    async fn test_stage_ordering_and_needs_outputs() {
        let engine = MemoryEngine::new();
        engine.push_exec_result(ExecResult {
            exit_code: 0,
            output: vec!["::set-output name=tag::v1".to_string()],
        });

        let mut emit = shell_step("echo ::set-output name=tag::v1");
        emit.id = Some("emit".to_string());
        let mut first = container_job(vec![emit]);
        first
            .outputs
            .insert("tag".to_string(), "${{ steps.emit.outputs.tag }}".to_string());

        let mut second = container_job(vec![shell_step("echo ${{ needs.build.outputs.tag }}")]);
        second.needs = vec!["build".to_string()];

        let plan = Plan::new(vec![
            Stage::new(vec![Run::new("build", first)]),
            Stage::new(vec![Run::new("deploy", second)]),
        ]);
        let runner = runner_with(&engine, Config::default());
        runner
            .run_plan(&plan, CancellationToken::new())
            .await
            .unwrap();

        // The dependent step saw the dependency's finalized output.
        assert!(engine
            .operations()
            .iter()
            .any(|op| op.starts_with("exec") && op.contains("echo v1")));
    }

    #[tokio::test]
    async fn test_failed_stage_stops_the_plan() {
        let engine = MemoryEngine::new();
        engine.push_exec_result(ExecResult {
            exit_code: 1,
            output: vec![],
        });

        let plan = Plan::new(vec![
            Stage::new(vec![Run::new(
                "first",
                container_job(vec![shell_step("exit 1")]),
            )]),
            Stage::new(vec![Run::new(
                "second",
                container_job(vec![shell_step("echo never")]),
            )]),
        ]);
        let runner = runner_with(&engine, Config::default());
        let outcome = runner.run_plan(&plan, CancellationToken::new()).await;

        assert!(outcome.is_err());
        assert_eq!(plan.stages[1].runs[0].job.result(), JobResult::Unset);
        let execs = engine
            .operations()
            .iter()
            .filter(|op| op.starts_with("exec"))
            .count();
        assert_eq!(execs, 1);
    }

    #[tokio::test]
    async fn test_failure_aggregation_and_exit_codes() {
        let engine = MemoryEngine::new();
        engine.push_exec_result(ExecResult {
            exit_code: 1,
            output: vec![],
        });
        let plan = single_stage(vec![("bad", container_job(vec![shell_step("exit 1")]))]);
        let runner = runner_with(&engine, Config::default());
        let outcome = runner.run_plan(&plan, CancellationToken::new()).await;
        assert!(outcome.is_err());
        assert_eq!(exit_code(&outcome), 1);

        let engine = MemoryEngine::new();
        let plan = single_stage(vec![("good", container_job(vec![shell_step("true")]))]);
        let runner = runner_with(&engine, Config::default());
        let outcome = runner.run_plan(&plan, CancellationToken::new()).await;
        assert_eq!(exit_code(&outcome), 0);
    }

    #[tokio::test]
    async fn test_cancelled_plan_reports_cancellation() {
        let engine = MemoryEngine::new();
        let plan = single_stage(vec![("job", container_job(vec![shell_step("true")]))]);
        let runner = runner_with(&engine, Config::default());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = runner.run_plan(&plan, cancel).await;

        let error = outcome.unwrap_err();
        assert!(dockhand_common::is_cancelled(&error));
    }

    #[tokio::test]
    async fn test_dynamic_matrix_dimension_from_event() {
        let engine = MemoryEngine::new();
        let mut config = Config::default();
        config.event_json = r#"{"target": "prod"}"#.to_string();
        config.event_name = "workflow_dispatch".to_string();

        let mut job = container_job(vec![shell_step("echo ${{ matrix.env }}")]);
        job.strategy = Some(matrix_strategy(
            "{env: ['${{ github.event.target }}']}",
            None,
            false,
        ));

        let plan = single_stage(vec![("job", job)]);
        let runner = runner_with(&engine, config);
        runner
            .run_plan(&plan, CancellationToken::new())
            .await
            .unwrap();

        assert!(engine
            .operations()
            .iter()
            .any(|op| op.starts_with("exec") && op.contains("echo prod")));
    }

    #[tokio::test]
    async fn test_zero_max_parallel_treated_as_one() {
        let engine = MemoryEngine::new().with_exec_delay(Duration::from_millis(20));
        let mut job = container_job(vec![shell_step("true")]);
        job.strategy = Some(matrix_strategy("{n: [1, 2]}", Some(0), false));

        let plan = single_stage(vec![("job", job)]);
        let runner = runner_with(&engine, Config::default());
        runner
            .run_plan(&plan, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(engine.max_live_execs(), 1);
    }
}
