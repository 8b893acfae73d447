//! Error taxonomy and the stable exit-code contract.
//!
//! Errors split along the line the run does: [`ConfigError`] values surface
//! before anything executes and halt the run at resolution time, while
//! [`TaskError`] values are produced by executing tasks and are collected
//! into a [`TaskAggregate`] so parallel siblings can all report. The process
//! exit code is always derived from the earliest-registered failure.

use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::process::SubprocessFailure;
use crate::subpake::SubBuildFailure;

/// Stable process exit codes.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const BUILD_FILE_NOT_FOUND: i32 = 1;
    pub const BAD_ARGUMENTS: i32 = 2;
    pub const NO_TASKS_DEFINED: i32 = 3;
    pub const NO_TASKS_SPECIFIED: i32 = 4;
    pub const MISSING_INPUT: i32 = 5;
    pub const OUTPUTS_WITHOUT_INPUTS: i32 = 6;
    pub const UNDEFINED_TASK: i32 = 7;
    pub const CYCLIC_DEPENDENCY: i32 = 8;
    pub const TASK_EXCEPTION: i32 = 9;
    pub const SUBPAKE_FAILED: i32 = 10;
    pub const SUBPROCESS_FAILED: i32 = 11;
    pub const TERMINATED: i32 = 12;
    pub const CORE_EXCEPTION: i32 = 13;
}

/// Configuration faults detected before any task body runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("task \"{0}\" is already defined")]
    TaskRedefined(String),

    #[error("reference to undefined task \"{0}\"")]
    UndefinedTask(String),

    #[error("cyclic dependency: {}", format_cycle(.0))]
    CyclicDependency(Vec<String>),

    #[error("task \"{0}\" declares outputs but no inputs")]
    OutputsWithoutInputs(String),

    #[error("no tasks are defined")]
    NoTasksDefined,

    #[error("no tasks specified and no default tasks configured")]
    NoTasksSpecified,

    #[error("build file not found: {0}")]
    BuildFileNotFound(Utf8PathBuf),

    #[error("bad arguments: {0}")]
    BadArguments(String),
}

fn format_cycle(cycle: &[String]) -> String {
    let mut out = cycle.join(" -> ");
    if let Some(first) = cycle.first() {
        out.push_str(" -> ");
        out.push_str(first);
    }
    out
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::TaskRedefined(_) => exit::CORE_EXCEPTION,
            ConfigError::UndefinedTask(_) => exit::UNDEFINED_TASK,
            ConfigError::CyclicDependency(_) => exit::CYCLIC_DEPENDENCY,
            ConfigError::OutputsWithoutInputs(_) => exit::OUTPUTS_WITHOUT_INPUTS,
            ConfigError::NoTasksDefined => exit::NO_TASKS_DEFINED,
            ConfigError::NoTasksSpecified => exit::NO_TASKS_SPECIFIED,
            ConfigError::BuildFileNotFound(_) => exit::BUILD_FILE_NOT_FOUND,
            ConfigError::BadArguments(_) => exit::BAD_ARGUMENTS,
        }
    }
}

/// Explicit early termination raised from inside a task body.
///
/// Returned through the normal error channel so in-flight siblings finish
/// before the driver honors it. A zero code is a clean exit and prints no
/// trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("build terminated explicitly (requested code {0})")]
pub struct Terminate(pub i32);

/// A failure produced while evaluating or executing a single task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("input file does not exist: {path}")]
    MissingInput { path: Utf8PathBuf },

    #[error(transparent)]
    Subprocess(#[from] SubprocessFailure),

    #[error(transparent)]
    SubBuild(#[from] SubBuildFailure),

    #[error(transparent)]
    Terminate(#[from] Terminate),

    /// An invalid input/output declaration caught at expansion time.
    #[error("{0}")]
    Pattern(String),

    /// Any other error escaping the task body.
    #[error("{0:#}")]
    Other(anyhow::Error),
}

impl TaskError {
    /// Folds an error escaping a task body back into the taxonomy, so the
    /// structured failures keep their exit codes through the `anyhow` chain.
    pub(crate) fn from_userland(error: anyhow::Error) -> Self {
        let error = match error.downcast::<SubprocessFailure>() {
            Ok(failure) => return TaskError::Subprocess(failure),
            Err(error) => error,
        };
        let error = match error.downcast::<SubBuildFailure>() {
            Ok(failure) => return TaskError::SubBuild(failure),
            Err(error) => error,
        };
        match error.downcast::<Terminate>() {
            Ok(terminate) => TaskError::Terminate(terminate),
            Err(error) => TaskError::Other(error),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            TaskError::MissingInput { .. } => exit::MISSING_INPUT,
            TaskError::Subprocess(_) => exit::SUBPROCESS_FAILED,
            TaskError::SubBuild(_) => exit::SUBPAKE_FAILED,
            TaskError::Terminate(Terminate(0)) => exit::SUCCESS,
            TaskError::Terminate(Terminate(_)) => exit::TERMINATED,
            TaskError::Pattern(_) => exit::CORE_EXCEPTION,
            TaskError::Other(_) => exit::TASK_EXCEPTION,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            TaskError::MissingInput { .. } => "missing input",
            TaskError::Subprocess(_) => "subprocess failed",
            TaskError::SubBuild(_) => "sub-build failed",
            TaskError::Terminate(_) => "terminated",
            TaskError::Pattern(_) => "invalid declaration",
            TaskError::Other(_) => "task error",
        }
    }
}

/// One failed task within a run.
#[derive(Debug)]
pub struct TaskFailure {
    /// Name of the failing task.
    pub task: String,
    /// Registration index, used to pick the failure that decides the exit
    /// code when several tasks fail in parallel.
    pub(crate) order: usize,
    pub error: TaskError,
}

/// Every execution failure collected from a run, in completion order.
#[derive(Debug, Default)]
pub struct TaskAggregate {
    pub failures: Vec<TaskFailure>,
}

impl TaskAggregate {
    pub(crate) fn push(&mut self, task: String, order: usize, error: TaskError) {
        self.failures.push(TaskFailure { task, order, error });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// The failure of the earliest-registered failing task.
    pub fn first(&self) -> Option<&TaskFailure> {
        self.failures.iter().min_by_key(|f| f.order)
    }

    pub fn exit_code(&self) -> i32 {
        self.first()
            .map(|f| f.error.exit_code())
            .unwrap_or(exit::SUCCESS)
    }
}

impl fmt::Display for TaskAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for failure in &self.failures {
            // terminate(0) is a clean exit and prints nothing.
            if matches!(failure.error, TaskError::Terminate(Terminate(0))) {
                continue;
            }
            writeln!(
                f,
                "Task \"{}\" failed: {}",
                failure.task,
                failure.error.kind()
            )?;
            writeln!(f, "{}", failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskAggregate {}

/// The top-level result type of a run.
#[derive(Debug, Error)]
pub enum PakeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Aggregate(TaskAggregate),

    /// A build file passed with `-f` exited non-zero; the child already
    /// reported its own failure, so the code is propagated transparently.
    #[error("build file {file} exited with code {code}")]
    BuildFileExit { file: Utf8PathBuf, code: i32 },
}

impl PakeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            PakeError::Config(e) => e.exit_code(),
            PakeError::Aggregate(agg) => agg.exit_code(),
            PakeError::BuildFileExit { code, .. } => *code,
        }
    }

    /// Whether this error is a clean `terminate(0)` exit.
    pub fn is_clean_exit(&self) -> bool {
        self.exit_code() == exit::SUCCESS
    }
}

/// Prints the user-facing failure report to stderr.
pub(crate) fn print_report(error: &PakeError) {
    use console::style;

    match error {
        PakeError::Config(e) => {
            eprintln!("{} {e}", style("pake:").red().bold());
        }
        PakeError::Aggregate(agg) => {
            let report = agg.to_string();
            if !report.is_empty() {
                eprint!("{}", style(report).red());
            }
        }
        PakeError::BuildFileExit { file, code } => {
            eprintln!(
                "{} build file {file} exited with code {code}",
                style("pake:").red().bold()
            );
        }
    }
}
