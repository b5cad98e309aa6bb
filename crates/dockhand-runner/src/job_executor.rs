// Builds the full execution pipeline of one job: guard, image acquisition,
// network setup, container start, services, steps, outputs, teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use dockhand_common::{is_cancelled, Cancelled, Executor, JobLogger, TimedOut};
use dockhand_container::{ContainerCreateRequest, ContainerEngine, EngineError, ExecSpec, Health};

use crate::commands::{self, WorkflowCommand};
use crate::config::NetworkMode;
use crate::error::RunnerError;
use crate::expression::ExpressionEvaluator;
use crate::model::{JobResult, StepOutcome, StepResult};
use crate::run_context::RunContext;

/// Driver options copied from the default bridge onto per-job networks.
const NETWORK_INHERIT_OPTS: &[&str] = &[
    "com.docker.network.bridge.enable_icc",
    "com.docker.network.bridge.enable_ip_masquerade",
];

/// How often and how long to poll a service container for readiness.
const SERVICE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const SERVICE_POLL_ATTEMPTS: u32 = 30;

/// Compose the executor for one run context.
///
/// The pipeline honors the job-level `if:` guard, drives the container
/// lifecycle through the engine, and always tears down what it created.
pub fn new_job_executor(
    rc: Arc<RunContext>,
    engine: Arc<dyn ContainerEngine>,
    logger: JobLogger,
) -> Executor {
    Executor::new(move |cancel| async move {
        let job = Arc::clone(&rc.run.job);
        let job_display = rc.name.clone();

        // Job-level guard.
        let condition = job.if_condition.clone().unwrap_or_default();
        match rc.evaluator().evaluate_condition(&condition) {
            Ok(true) => {}
            Ok(false) => {
                job.set_result(JobResult::Skipped);
                logger.info("job skipped");
                return Ok(());
            }
            Err(error) => {
                job.mark_failed();
                return Err(RunnerError::Evaluation(format!(
                    "job guard '{condition}': {error:#}"
                ))
                .into());
            }
        }

        let body = Executor::pipeline(vec![
            acquire_image(Arc::clone(&rc), Arc::clone(&engine), logger.clone()),
            setup_network(Arc::clone(&rc), Arc::clone(&engine), logger.clone()),
            start_job_container(Arc::clone(&rc), Arc::clone(&engine), logger.clone()),
            start_services(Arc::clone(&rc), Arc::clone(&engine), logger.clone()),
            run_steps(Arc::clone(&rc), Arc::clone(&engine), logger.clone()),
            collect_outputs(Arc::clone(&rc)),
            report_job_failure(Arc::clone(&rc), job_display.clone()),
        ]);

        let lifetime = rc.config.container_max_lifetime;
        let body = if lifetime.is_zero() {
            body
        } else {
            body.timed(lifetime)
        };

        let teardown = teardown(Arc::clone(&rc), Arc::clone(&engine), logger.clone());
        let outcome = body.finally(teardown).run(cancel).await;

        match outcome {
            Ok(()) => {
                if job.result() == JobResult::Unset {
                    job.set_result(JobResult::Success);
                }
                logger.info(&format!("job completed ({})", job.result()));
                Ok(())
            }
            Err(error) => {
                if let Some(TimedOut(limit)) = error.downcast_ref::<TimedOut>() {
                    let limit = *limit;
                    job.mark_failed();
                    logger.error(&format!("job exceeded max lifetime of {limit:?}"));
                    return Err(RunnerError::Timeout {
                        job: rc.name.clone(),
                        limit,
                    }
                    .into());
                }
                if is_cancellation(&error) {
                    logger.info("job cancelled");
                    return Err(error);
                }
                job.mark_failed();
                logger.error(&format!("job failed: {error:#}"));
                Err(error)
            }
        }
    })
}

/// A cancellation outcome, whichever layer reported it.
pub(crate) fn is_cancellation(error: &anyhow::Error) -> bool {
    is_cancelled(error) || matches!(error.downcast_ref::<EngineError>(), Some(EngineError::Cancelled))
}

/// Turn a recorded failure result into the error the plan sees: the first
/// hard step failure when there was one, a plain job failure otherwise.
fn report_job_failure(rc: Arc<RunContext>, job_display: String) -> Executor {
    Executor::new(move |_cancel| async move {
        if rc.run.job.result() != JobResult::Failure {
            return Ok(());
        }
        match rc.failed_step.read().clone() {
            Some((step, exit_code)) => Err(RunnerError::Step { step, exit_code }.into()),
            None => Err(RunnerError::JobFailed { job: job_display }.into()),
        }
    })
}

fn acquire_image(
    rc: Arc<RunContext>,
    engine: Arc<dyn ContainerEngine>,
    logger: JobLogger,
) -> Executor {
    Executor::new(move |cancel| async move {
        let evaluator = rc.evaluator();
        let image = match rc.run.job.container {
            Some(ref container) => evaluator.interpolate(&container.image),
            None => rc.config.pick_platform(&rc.run.job.runs_on).ok_or_else(|| {
                RunnerError::Config(format!(
                    "no platform image for labels {:?}",
                    rc.run.job.runs_on
                ))
            })?,
        };
        if image.is_empty() {
            return Err(RunnerError::Config("job resolved to an empty image".to_string()).into());
        }

        let platform = platform_arg(&rc);
        if rc.config.force_pull || !engine.image_exists(&image, &cancel).await? {
            logger.info(&format!("pulling image '{image}'"));
            engine
                .pull_image(&image, platform.as_deref(), &cancel)
                .await?;
        } else {
            logger.debug(&format!("image '{image}' already present"));
        }

        *rc.image.write() = Some(image);
        Ok(())
    })
}

fn platform_arg(rc: &RunContext) -> Option<String> {
    let arch = &rc.config.container_architecture;
    if arch.is_empty() {
        None
    } else {
        Some(arch.clone())
    }
}

fn setup_network(
    rc: Arc<RunContext>,
    engine: Arc<dyn ContainerEngine>,
    logger: JobLogger,
) -> Executor {
    Executor::new(move |cancel| async move {
        if let NetworkMode::UserDefined(raw) = rc.config.network_mode() {
            let name = if raw.is_empty() {
                format!("{}-network", rc.container_name())
            } else {
                raw
            };
            if rc.config.reuse_containers && engine.network_inspect(&name, &cancel).await.is_ok() {
                logger.debug(&format!("reusing job network '{name}'"));
                *rc.network.write() = Some(name);
                return Ok(());
            }
            let inherit: Vec<String> = NETWORK_INHERIT_OPTS.iter().map(|s| s.to_string()).collect();
            engine.network_create(&name, &inherit, &cancel).await?;
            logger.debug(&format!("created job network '{name}'"));
            *rc.network.write() = Some(name);
        }
        Ok(())
    })
}

fn start_job_container(
    rc: Arc<RunContext>,
    engine: Arc<dyn ContainerEngine>,
    logger: JobLogger,
) -> Executor {
    Executor::new(move |cancel| async move {
        let image = rc
            .image
            .read()
            .clone()
            .ok_or_else(|| RunnerError::Config("job image was not resolved".to_string()))?;

        let name = rc.container_name();
        if rc.config.reuse_containers {
            if let Some(id) = engine.find_container(&name, &cancel).await? {
                engine.start_container(&id, &cancel).await?;
                logger.info(&format!("reusing job container ({image})"));
                *rc.container_id.write() = Some(id);
                return Ok(());
            }
        }

        let evaluator = rc.evaluator();
        let mut env: Vec<(String, String)> = Vec::new();
        for (key, value) in rc.config.env.iter().chain(rc.run.job.env.iter()) {
            env.push((key.clone(), evaluator.interpolate(value)));
        }

        let mut binds = Vec::new();
        if rc.config.bind_workdir {
            binds.push(format!(
                "{}:{}",
                rc.config.workdir.display(),
                rc.config.container_workdir()
            ));
        }

        let mut options: Vec<String> = rc
            .config
            .container_options
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();
        if let Some(ref container) = rc.run.job.container {
            if let Some(ref extra) = container.options {
                options.extend(extra.split_whitespace().map(|s| s.to_string()));
            }
        }

        let request = ContainerCreateRequest {
            name,
            image: image.clone(),
            // Keep the container alive; steps are exec'd into it.
            entrypoint: vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ],
            cmd: Vec::new(),
            env,
            working_dir: Some(rc.config.container_workdir()),
            network: rc
                .network
                .read()
                .clone()
                .or_else(|| rc.config.network_mode().fixed_network()),
            network_aliases: Vec::new(),
            binds,
            ports: rc
                .run
                .job
                .container
                .as_ref()
                .map(|c| c.ports.clone())
                .unwrap_or_default(),
            privileged: rc.config.privileged,
            userns_mode: (!rc.config.userns_mode.is_empty()).then(|| rc.config.userns_mode.clone()),
            cap_add: rc.config.container_cap_add.clone(),
            cap_drop: rc.config.container_cap_drop.clone(),
            platform: platform_arg(&rc),
            options,
            auto_remove: rc.config.auto_remove && !rc.config.reuse_containers,
        };

        let id = engine.create_container(&request, &cancel).await?;
        engine.start_container(&id, &cancel).await?;
        logger.info(&format!("job container started ({image})"));

        // Without a bind mount, the workdir is copied into the container.
        if !rc.config.bind_workdir && !rc.config.workdir.as_os_str().is_empty() {
            engine
                .copy_to_container(
                    &id,
                    &rc.config.workdir,
                    &rc.config.container_workdir(),
                    &cancel,
                )
                .await?;
        }

        *rc.container_id.write() = Some(id);
        Ok(())
    })
}

fn start_services(
    rc: Arc<RunContext>,
    engine: Arc<dyn ContainerEngine>,
    logger: JobLogger,
) -> Executor {
    Executor::new(move |cancel| async move {
        if rc.run.job.services.is_empty() {
            return Ok(());
        }
        let evaluator = rc.evaluator();
        for (service_name, spec) in &rc.run.job.services {
            let container_name = format!("{}-{service_name}", rc.container_name());
            if rc.config.reuse_containers {
                if let Some(id) = engine.find_container(&container_name, &cancel).await? {
                    engine.start_container(&id, &cancel).await?;
                    logger.info(&format!("reusing service container '{service_name}'"));
                    rc.service_container_ids.write().push(id.clone());
                    wait_for_service(&engine, &id, service_name, &logger, &cancel).await?;
                    continue;
                }
            }

            let image = evaluator.interpolate(&spec.image);
            if !engine.image_exists(&image, &cancel).await? {
                logger.info(&format!("pulling service image '{image}'"));
                engine
                    .pull_image(&image, platform_arg(&rc).as_deref(), &cancel)
                    .await?;
            }

            let request = ContainerCreateRequest {
                name: container_name,
                image,
                env: spec
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), evaluator.interpolate(v)))
                    .collect(),
                network: rc
                    .network
                    .read()
                    .clone()
                    .or_else(|| rc.config.network_mode().fixed_network()),
                network_aliases: vec![service_name.clone()],
                binds: spec.volumes.clone(),
                ports: spec.ports.clone(),
                options: spec
                    .options
                    .as_deref()
                    .map(|opts| opts.split_whitespace().map(|s| s.to_string()).collect())
                    .unwrap_or_default(),
                ..Default::default()
            };

            let id = engine.create_container(&request, &cancel).await?;
            engine.start_container(&id, &cancel).await?;
            rc.service_container_ids.write().push(id.clone());

            wait_for_service(&engine, &id, service_name, &logger, &cancel).await?;
        }
        Ok(())
    })
}

async fn wait_for_service(
    engine: &Arc<dyn ContainerEngine>,
    id: &str,
    name: &str,
    logger: &JobLogger,
    cancel: &CancellationToken,
) -> Result<()> {
    for _ in 0..SERVICE_POLL_ATTEMPTS {
        match engine.container_health(id, cancel).await? {
            Health::Healthy | Health::None => {
                logger.info(&format!("service '{name}' is ready"));
                return Ok(());
            }
            Health::Unhealthy => {
                return Err(RunnerError::Service {
                    service: name.to_string(),
                    reason: "reported unhealthy".to_string(),
                }
                .into());
            }
            Health::Starting => {
                logger.debug(&format!("waiting for service '{name}'"));
                tokio::select! {
                    _ = tokio::time::sleep(SERVICE_POLL_INTERVAL) => {}
                    _ = cancel.cancelled() => return Err(Cancelled.into()),
                }
            }
        }
    }
    Err(RunnerError::Service {
        service: name.to_string(),
        reason: "no healthy status before the poll deadline".to_string(),
    }
    .into())
}

fn run_steps(
    rc: Arc<RunContext>,
    engine: Arc<dyn ContainerEngine>,
    logger: JobLogger,
) -> Executor {
    Executor::new(move |cancel| async move {
        let job = Arc::clone(&rc.run.job);
        // `sequence_failed` gates the implicit success() of later steps;
        // `job_failed` also covers continue-on-error failures.
        let mut sequence_failed = false;
        let mut job_failed = false;

        for (index, step) in job.steps.iter().enumerate() {
            let key = step.result_key(index);

            if cancel.is_cancelled() {
                rc.step_results.write().insert(
                    key,
                    StepResult::new(StepOutcome::Cancelled, StepOutcome::Cancelled),
                );
                continue;
            }

            let status = if sequence_failed {
                JobResult::Failure
            } else {
                JobResult::Unset
            };
            let evaluator = rc.evaluator_with(status, false);

            let condition = step.if_condition.clone().unwrap_or_default();
            let should_run = match evaluator.evaluate_condition(&condition) {
                Ok(decision) => decision,
                Err(error) => {
                    // Fatal during step execution.
                    rc.step_results.write().insert(
                        key,
                        StepResult::new(StepOutcome::Failure, StepOutcome::Failure),
                    );
                    job.mark_failed();
                    return Err(RunnerError::Evaluation(format!(
                        "step guard '{condition}': {error:#}"
                    ))
                    .into());
                }
            };
            if !should_run {
                logger.debug(&format!("skipping step '{}'", step.display_name()));
                rc.step_results.write().insert(key, StepResult::skipped());
                continue;
            }

            let Some(ref raw_script) = step.run else {
                rc.step_results.write().insert(
                    key,
                    StepResult::new(StepOutcome::Success, StepOutcome::Success),
                );
                continue;
            };

            logger.info(&format!("run {}", step.display_name()));

            let script = evaluator.interpolate(raw_script);
            let mut env: Vec<(String, String)> = Vec::new();
            for (k, v) in rc
                .config
                .env
                .iter()
                .chain(job.env.iter())
                .chain(step.env.iter())
            {
                env.push((k.clone(), evaluator.interpolate(v)));
            }
            env.push(("CI".to_string(), "true".to_string()));
            env.push(("GITHUB_ACTOR".to_string(), rc.config.actor.clone()));
            env.push(("GITHUB_EVENT_NAME".to_string(), rc.config.event_name.clone()));
            env.push(("GITHUB_JOB".to_string(), rc.run.job_id.clone()));
            env.push((
                "GITHUB_WORKSPACE".to_string(),
                rc.config.container_workdir(),
            ));

            let container_id = rc
                .container_id()
                .ok_or_else(|| RunnerError::Config("no job container".to_string()))?;

            let mut cmd = step.shell_command();
            cmd.push(script);
            let spec = ExecSpec {
                cmd,
                env,
                working_dir: Some(
                    step.working_directory
                        .as_ref()
                        .map(|dir| evaluator.interpolate(dir))
                        .unwrap_or_else(|| rc.config.container_workdir()),
                ),
                user: None,
            };

            let exec = engine.exec(&container_id, &spec, &cancel);
            let exec_result = match step.timeout_minutes {
                Some(minutes) => {
                    match tokio::time::timeout(Duration::from_secs(minutes * 60), exec).await {
                        Ok(result) => result?,
                        Err(_) => {
                            logger.error(&format!(
                                "step '{}' timed out after {minutes} minutes",
                                step.display_name()
                            ));
                            rc.step_results.write().insert(
                                key,
                                StepResult::new(StepOutcome::Failure, StepOutcome::Failure),
                            );
                            sequence_failed = true;
                            job_failed = true;
                            continue;
                        }
                    }
                }
                None => exec.await?,
            };

            let mut outputs = HashMap::new();
            for line in &exec_result.output {
                match commands::parse(line) {
                    Some(WorkflowCommand::SetOutput { name, value }) => {
                        outputs.insert(name, value);
                    }
                    Some(WorkflowCommand::AddMask { value }) => {
                        rc.masks.add(&value);
                    }
                    Some(WorkflowCommand::Error { message }) => logger.error(&message),
                    Some(WorkflowCommand::Warning { message }) => logger.warn(&message),
                    Some(WorkflowCommand::Notice { message }) => logger.info(&message),
                    Some(WorkflowCommand::Debug { message }) => logger.debug(&message),
                    Some(WorkflowCommand::Group { title }) => logger.group(&title),
                    Some(WorkflowCommand::EndGroup) => logger.end_group(),
                    None => logger.output(line),
                }
            }

            let outcome = if exec_result.success() {
                StepOutcome::Success
            } else {
                StepOutcome::Failure
            };
            let conclusion = if outcome == StepOutcome::Failure && step.continue_on_error {
                StepOutcome::Success
            } else {
                outcome
            };

            let mut record = StepResult::new(outcome, conclusion);
            record.outputs = outputs;
            rc.step_results.write().insert(key, record);

            match outcome {
                StepOutcome::Success => {
                    logger.info(&format!("success - {}", step.display_name()));
                }
                _ => {
                    logger.error(&format!(
                        "failure - {} (exit code {})",
                        step.display_name(),
                        exec_result.exit_code
                    ));
                    job_failed = true;
                    if !step.continue_on_error {
                        sequence_failed = true;
                        let mut failed = rc.failed_step.write();
                        if failed.is_none() {
                            *failed = Some((step.display_name(), exec_result.exit_code));
                        }
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        if job_failed || sequence_failed {
            job.set_result(JobResult::Failure);
        } else if job.result() != JobResult::Failure {
            // A failed sibling matrix point must not be overwritten.
            job.set_result(JobResult::Success);
        }
        Ok(())
    })
}

fn collect_outputs(rc: Arc<RunContext>) -> Executor {
    Executor::new(move |_cancel| async move {
        let job = Arc::clone(&rc.run.job);
        if job.outputs.is_empty() {
            return Ok(());
        }
        let evaluator = rc.evaluator_with(job.result(), false);
        let resolved: HashMap<String, String> = job
            .outputs
            .iter()
            .map(|(key, template)| (key.clone(), evaluator.interpolate(template)))
            .collect();
        job.set_outputs(resolved);
        Ok(())
    })
}

fn teardown(rc: Arc<RunContext>, engine: Arc<dyn ContainerEngine>, logger: JobLogger) -> Executor {
    Executor::new(move |_cancel| async move {
        // Teardown must proceed even when the job was cancelled, so engine
        // calls run under a detached token.
        let detached = CancellationToken::new();

        if rc.config.reuse_containers {
            // The whole environment survives so the next invocation can
            // find it by name: containers, services, and network.
            logger.debug("keeping job containers and network for reuse");
            return Ok(());
        }

        let service_ids: Vec<String> = rc.service_container_ids.write().drain(..).collect();
        for id in service_ids {
            if let Err(error) = engine.remove_container(&id, true, &detached).await {
                logger.warn(&format!("failed to remove service container {id}: {error}"));
            }
        }

        let container_id = rc.container_id.write().take();
        if let Some(id) = container_id {
            if let Err(error) = engine.remove_container(&id, true, &detached).await {
                logger.warn(&format!("failed to remove job container {id}: {error}"));
            }
        }

        let network = rc.network.write().take();
        if let Some(network) = network {
            if let Err(error) = engine.network_remove(&network, &detached).await {
                logger.warn(&format!("failed to remove network {network}: {error}"));
            }
        }

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::matrix::MatrixPoint;
    use crate::model::{ContainerSpec, Job, Run, Step};
    use dockhand_common::Masks;
    use dockhand_container::{ExecResult, MemoryEngine};

    fn test_logger() -> JobLogger {
        JobLogger::new("job", "job", Masks::new())
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

    fn run_step(script: &str) -> Step {
        Step {
            run: Some(script.to_string()),
            ..Default::default()
        }
    }

    fn context(job: Job, config: Config) -> Arc<RunContext> {
        Arc::new(RunContext::new(
            Arc::new(config),
            Run::new("job", job),
            MatrixPoint::new(),
            Arc::new(serde_json::json!({})),
            HashMap::new(),
            Masks::new(),
            None,
        ))
    }

    async fn execute(rc: Arc<RunContext>, engine: MemoryEngine) -> Result<()> {
        let engine: Arc<dyn ContainerEngine> = Arc::new(engine);
        new_job_executor(rc, engine, test_logger())
            .run(CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_single_job_lifecycle() {
        let engine = MemoryEngine::new();
        let rc = context(container_job(vec![run_step("echo hi")]), Config::default());
        let job = Arc::clone(&rc.run.job);

        execute(Arc::clone(&rc), engine.clone()).await.unwrap();

        assert_eq!(job.result(), JobResult::Success);
        let operations = engine.operations();
        assert!(operations.iter().any(|op| op.starts_with("pull_image alpine:3")));
        assert!(operations.iter().any(|op| op.starts_with("create_container")));
        assert!(operations.iter().any(|op| op.starts_with("exec")));
        assert!(operations.iter().any(|op| op.starts_with("remove_container")));
        // Default network mode is user-defined: a per-job network comes and goes.
        assert!(operations.iter().any(|op| op.starts_with("network_create")));
        assert!(operations.iter().any(|op| op.starts_with("network_remove")));
        assert!(engine.network_names().is_empty());
        assert!(engine.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_fixed_network_modes_create_no_network() {
        for mode in ["host", "none", "bridge", "container:abc"] {
            let engine = MemoryEngine::new();
            let mut config = Config::default();
            config.container_network_mode = mode.to_string();
            let rc = context(container_job(vec![run_step("true")]), config);
            execute(rc, engine.clone()).await.unwrap();
            assert!(
                !engine.operations().iter().any(|op| op.starts_with("network_create")),
                "mode {mode} should not create a network"
            );
        }
    }

    #[tokio::test]
    async fn test_named_user_network_is_created_and_removed() {
        let engine = MemoryEngine::new();
        let mut config = Config::default();
        config.container_network_mode = "my-net".to_string();
        let rc = context(container_job(vec![run_step("true")]), config);
        execute(rc, engine.clone()).await.unwrap();
        assert!(engine
            .operations()
            .iter()
            .any(|op| op.starts_with("network_create my-net")));
        assert!(engine
            .operations()
            .iter()
            .any(|op| op.starts_with("network_remove my-net")));
    }

    #[tokio::test]
    async fn test_false_guard_skips_job() {
        let engine = MemoryEngine::new();
        let mut job = container_job(vec![run_step("echo hi")]);
        job.if_condition = Some("false".to_string());
        let rc = context(job, Config::default());
        let job = Arc::clone(&rc.run.job);

        execute(rc, engine.clone()).await.unwrap();

        assert_eq!(job.result(), JobResult::Skipped);
        assert!(engine.operations().is_empty());
    }

    #[tokio::test]
    async fn test_failing_step_fails_job_and_skips_rest() {
        let engine = MemoryEngine::new();
        engine.push_exec_result(ExecResult {
            exit_code: 1,
            output: vec![],
        });
        let rc = context(
            container_job(vec![run_step("exit 1"), run_step("echo unreachable")]),
            Config::default(),
        );
        let job = Arc::clone(&rc.run.job);

        let error = execute(Arc::clone(&rc), engine.clone()).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<RunnerError>(),
            Some(RunnerError::Step { exit_code: 1, .. })
        ));
        assert_eq!(job.result(), JobResult::Failure);

        let steps = rc.step_results.read();
        assert_eq!(steps.get("0").unwrap().outcome, StepOutcome::Failure);
        assert_eq!(steps.get("1").unwrap().outcome, StepOutcome::Skipped);
        // Exactly one exec happened.
        assert_eq!(
            engine.operations().iter().filter(|op| op.starts_with("exec")).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_always_step_runs_after_failure() {
        let engine = MemoryEngine::new();
        engine.push_exec_result(ExecResult {
            exit_code: 1,
            output: vec![],
        });
        let mut cleanup = run_step("echo cleanup");
        cleanup.if_condition = Some("always()".to_string());
        let rc = context(
            container_job(vec![run_step("exit 1"), cleanup]),
            Config::default(),
        );

        let _ = execute(Arc::clone(&rc), engine.clone()).await;

        let steps = rc.step_results.read();
        assert_eq!(steps.get("1").unwrap().outcome, StepOutcome::Success);
    }

    #[tokio::test]
    async fn test_continue_on_error_marks_job_failed_but_continues() {
        let engine = MemoryEngine::new();
        engine.push_exec_result(ExecResult {
            exit_code: 1,
            output: vec![],
        });
        let mut flaky = run_step("exit 1");
        flaky.continue_on_error = true;
        let rc = context(
            container_job(vec![flaky, run_step("echo still running")]),
            Config::default(),
        );
        let job = Arc::clone(&rc.run.job);

        let error = execute(Arc::clone(&rc), engine.clone()).await.unwrap_err();
        // No hard step failure, so the generic job failure is reported.
        assert!(matches!(
            error.downcast_ref::<RunnerError>(),
            Some(RunnerError::JobFailed { .. })
        ));
        assert_eq!(job.result(), JobResult::Failure);

        let steps = rc.step_results.read();
        assert_eq!(steps.get("0").unwrap().outcome, StepOutcome::Failure);
        assert_eq!(steps.get("0").unwrap().conclusion, StepOutcome::Success);
        assert_eq!(steps.get("1").unwrap().outcome, StepOutcome::Success);
    }

    #[tokio::test]
    async fn test_step_outputs_and_masks_from_commands() {
        let engine = MemoryEngine::new();
        engine.push_exec_result(ExecResult {
            exit_code: 0,
            output: vec![
                "::set-output name=version::1.2.3".to_string(),
                "::add-mask::hush".to_string(),
                "ordinary line".to_string(),
            ],
        });
        let mut step = run_step("echo outputs");
        step.id = Some("emit".to_string());
        let mut job = container_job(vec![step]);
        job.outputs.insert(
            "version".to_string(),
            "${{ steps.emit.outputs.version }}".to_string(),
        );
        let rc = context(job, Config::default());
        let job = Arc::clone(&rc.run.job);

        execute(Arc::clone(&rc), engine).await.unwrap();

        assert_eq!(
            rc.step_results.read().get("emit").unwrap().outputs["version"],
            "1.2.3"
        );
        assert_eq!(job.outputs_snapshot()["version"], "1.2.3");
        assert_eq!(rc.masks.apply("hush now"), "*** now");
    }

    #[tokio::test]
    async fn test_services_started_and_removed() {
        let engine = MemoryEngine::new();
        let mut job = container_job(vec![run_step("true")]);
        job.services.insert(
            "postgres".to_string(),
            ContainerSpec {
                image: "postgres:16".to_string(),
                ..Default::default()
            },
        );
        let rc = context(job, Config::default());

        execute(rc, engine.clone()).await.unwrap();

        let operations = engine.operations();
        assert!(operations.iter().any(|op| op.starts_with("pull_image postgres:16")));
        assert!(operations
            .iter()
            .any(|op| op.starts_with("container_health")));
        assert!(engine.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_unhealthy_service_fails_job() {
        let engine = MemoryEngine::new();
        engine.push_health(Health::Unhealthy);
        let mut job = container_job(vec![run_step("true")]);
        job.services.insert(
            "db".to_string(),
            ContainerSpec {
                image: "db:1".to_string(),
                ..Default::default()
            },
        );
        let rc = context(job, Config::default());
        let job = Arc::clone(&rc.run.job);

        let error = execute(rc, engine).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<RunnerError>(),
            Some(RunnerError::Service { .. })
        ));
        assert_eq!(job.result(), JobResult::Failure);
    }

    #[tokio::test]
    async fn test_engine_error_is_a_job_failure() {
        let engine = MemoryEngine::new();
        engine.fail_on("pull_image", "registry down");
        let rc = context(container_job(vec![run_step("true")]), Config::default());
        let job = Arc::clone(&rc.run.job);

        assert!(execute(rc, engine).await.is_err());
        assert_eq!(job.result(), JobResult::Failure);
    }

    #[tokio::test]
    async fn test_missing_platform_is_a_config_failure() {
        let engine = MemoryEngine::new();
        let job = Job {
            runs_on: vec!["ubuntu-latest".to_string()],
            steps: vec![run_step("true")],
            ..Default::default()
        };
        let rc = context(job, Config::default());

        let error = execute(rc, engine).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<RunnerError>(),
            Some(RunnerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_platform_mapping_resolves_image() {
        let engine = MemoryEngine::new();
        let mut config = Config::default();
        config
            .platforms
            .insert("ubuntu-latest".to_string(), "node:20-bullseye".to_string());
        let job = Job {
            runs_on: vec!["Ubuntu-Latest".to_string()],
            steps: vec![run_step("true")],
            ..Default::default()
        };
        let rc = context(job, config);

        execute(rc, engine.clone()).await.unwrap();
        assert!(engine
            .operations()
            .iter()
            .any(|op| op.starts_with("pull_image node:20-bullseye")));
    }

    #[tokio::test]
    async fn test_max_lifetime_times_out_job() {
        let engine = MemoryEngine::new().with_exec_delay(Duration::from_secs(60));
        let mut config = Config::default();
        config.container_max_lifetime = Duration::from_millis(50);
        let rc = context(container_job(vec![run_step("sleep 600")]), config);
        let job = Arc::clone(&rc.run.job);

        let error = execute(rc, engine.clone()).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<RunnerError>(),
            Some(RunnerError::Timeout { .. })
        ));
        assert_eq!(job.result(), JobResult::Failure);
        // Teardown still removed what was created.
        assert!(engine.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_reuse_containers_keeps_job_container() {
        let engine = MemoryEngine::new();
        let mut config = Config::default();
        config.reuse_containers = true;
        let rc = context(container_job(vec![run_step("true")]), config);

        execute(rc, engine.clone()).await.unwrap();
        assert_eq!(engine.container_names().len(), 1);
    }

    #[tokio::test]
    async fn test_reuse_containers_finds_container_on_second_invocation() {
        let engine = MemoryEngine::new();
        let mut config = Config::default();
        config.reuse_containers = true;

        for _ in 0..2 {
            let rc = context(container_job(vec![run_step("true")]), config.clone());
            execute(rc, engine.clone()).await.unwrap();
        }

        // The second invocation found the first container by name instead
        // of creating another, and the network survived with it.
        let operations = engine.operations();
        let creates = operations
            .iter()
            .filter(|op| op.starts_with("create_container"))
            .count();
        assert_eq!(creates, 1);
        let network_creates = operations
            .iter()
            .filter(|op| op.starts_with("network_create"))
            .count();
        assert_eq!(network_creates, 1);
        assert_eq!(engine.container_names().len(), 1);
    }

    #[tokio::test]
    async fn test_force_pull_pulls_even_when_present() {
        let engine = MemoryEngine::new();
        let cancel = CancellationToken::new();
        engine.pull_image("alpine:3", None, &cancel).await.unwrap();

        let mut config = Config::default();
        config.force_pull = true;
        let rc = context(container_job(vec![run_step("true")]), config);
        execute(rc, engine.clone()).await.unwrap();

        let pulls = engine
            .operations()
            .iter()
            .filter(|op| op.starts_with("pull_image"))
            .count();
        assert_eq!(pulls, 2);
    }
}
