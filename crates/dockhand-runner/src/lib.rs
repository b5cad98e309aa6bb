// dockhand-runner: the workflow execution core.
// Takes a parsed Plan and drives its jobs through containers on the host,
// honoring dependency ordering, matrix expansion, parallelism caps,
// cancellation, and aggregate failure reporting.
//
// Flow: Runner::new_plan_executor → per-stage executors → per-run matrix
// fan-out → RunContext::executor pipelines → container engine.

pub mod commands;
pub mod config;
pub mod error;
pub mod expression;
pub mod job_executor;
pub mod matrix;
pub mod model;
pub mod run_context;
pub mod runner;

pub use config::{Config, NetworkMode, PlatformPicker};
pub use error::RunnerError;
pub use expression::{ContextEvaluator, ExpressionEvaluator};
pub use matrix::MatrixPoint;
pub use model::{Job, JobResult, Plan, Run, Stage, Step, StepOutcome, StepResult, Strategy};
pub use run_context::RunContext;
pub use runner::{exit_code, Runner};
