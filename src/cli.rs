//! The command-line surface a build program exposes.
//!
//! The library parses the build program's own argv: task names, defines,
//! concurrency, listing and dry-run switches. Every parse or validation
//! problem maps to the bad-arguments exit code rather than clap's default.

use std::io::Read;

use camino::Utf8PathBuf;
use clap::Parser;

use crate::defines::{Defines, Value, parse_define, parse_literal};
use crate::error::ConfigError;
use crate::subpake::{DEPTH_ENV, SYNC_ENV};

#[derive(Debug, Parser)]
#[command(name = "pake", disable_help_subcommand = true)]
struct Args {
    /// Tasks to run, in the requested order.
    #[arg(value_name = "TASK")]
    tasks: Vec<String>,

    /// Define a value; no '=' means boolean true.
    #[arg(short = 'D', value_name = "KEY[=VALUE]")]
    define: Vec<String>,

    /// Read a literal mapping of defines from stdin before applying -D.
    #[arg(long)]
    stdin_defines: bool,

    /// Maximum number of tasks (and in-task jobs) run in parallel.
    #[arg(short = 'j', value_name = "N", default_value_t = 1)]
    jobs: usize,

    /// List the tasks that would execute, in order, without running them.
    #[arg(short = 'n')]
    dry_run: bool,

    /// Change to this directory before running.
    #[arg(short = 'C', value_name = "DIR")]
    directory: Option<Utf8PathBuf>,

    /// List the names of all registered tasks.
    #[arg(short = 't')]
    show_tasks: bool,

    /// With -t, include task documentation (-ti).
    #[arg(short = 'i')]
    show_task_info: bool,

    /// Force output synchronization on or off for this build and its
    /// sub-builds.
    #[arg(long, value_name = "{true,false,1,0}")]
    sync_output: Option<String>,

    /// Run these build files in the given order instead of this program's
    /// own tasks.
    #[arg(short = 'f', value_name = "FILE")]
    file: Vec<Utf8PathBuf>,
}

/// The resolved run configuration. Embedders and tests can build one by
/// hand; [`Pake::init`](crate::Pake::init) fills it from argv and the
/// environment.
#[derive(Debug, Clone)]
pub struct Options {
    /// Requested task names, in request order.
    pub targets: Vec<String>,
    /// Worker count; 1 means fully in-line execution.
    pub jobs: usize,
    /// Whether per-task output buffering is enabled.
    pub sync_output: bool,
    /// Resolve and list instead of executing.
    pub dry_run: bool,
    /// List registered task names and return.
    pub show_tasks: bool,
    /// With `show_tasks`, include documentation.
    pub show_task_info: bool,
    /// Build files to run as children instead of this program's tasks.
    pub build_files: Vec<Utf8PathBuf>,
    /// Directory to change into before running.
    pub directory: Option<Utf8PathBuf>,
    /// Sub-build depth, zero at the top level.
    pub depth: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            jobs: 1,
            sync_output: true,
            dry_run: false,
            show_tasks: false,
            show_task_info: false,
            build_files: Vec::new(),
            directory: None,
            depth: 0,
        }
    }
}

fn parse_sync_value(raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::BadArguments(format!(
            "--sync-output expects true, false, 1 or 0, got \"{raw}\""
        ))),
    }
}

fn env_depth() -> usize {
    std::env::var(DEPTH_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn env_sync_default() -> Option<bool> {
    let raw = std::env::var(SYNC_ENV).ok()?;
    parse_sync_value(&raw).ok()
}

/// Parses argv into [`Options`] and the frozen [`Defines`].
///
/// `stdin` is only invoked when `--stdin-defines` was passed; injection
/// keeps the parser testable without a real pipe.
pub(crate) fn parse(
    argv: Vec<String>,
    stdin: impl FnOnce() -> std::io::Result<String>,
) -> Result<(Options, Defines), ConfigError> {
    let args =
        Args::try_parse_from(argv).map_err(|e| ConfigError::BadArguments(e.to_string()))?;

    if args.jobs < 1 {
        return Err(ConfigError::BadArguments(
            "-j expects an integer >= 1".to_string(),
        ));
    }
    if args.show_task_info && !args.show_tasks {
        return Err(ConfigError::BadArguments(
            "-i is only meaningful together with -t".to_string(),
        ));
    }
    if args.show_tasks && args.dry_run {
        return Err(ConfigError::BadArguments(
            "-t and -n cannot be combined".to_string(),
        ));
    }

    let sync_output = match &args.sync_output {
        Some(raw) => parse_sync_value(raw)?,
        None => env_sync_default().unwrap_or(true),
    };

    let mut defines = Defines::new();
    for pair in &args.define {
        let (key, value) = parse_define(pair);
        if key.is_empty() {
            return Err(ConfigError::BadArguments(format!(
                "-D expects KEY or KEY=VALUE, got \"{pair}\""
            )));
        }
        defines.set(key, value);
    }

    if args.stdin_defines {
        let payload = stdin().map_err(|e| {
            ConfigError::BadArguments(format!("failed to read defines from stdin: {e}"))
        })?;
        let payload = payload.trim();
        if !payload.is_empty() {
            let mapping = parse_literal(payload).map_err(|e| {
                ConfigError::BadArguments(format!("stdin defines are not a literal mapping: {e}"))
            })?;
            let Value::Map(pairs) = mapping else {
                return Err(ConfigError::BadArguments(
                    "stdin defines must be a literal mapping".to_string(),
                ));
            };
            defines.merge_under(pairs).map_err(ConfigError::BadArguments)?;
        }
    }

    let options = Options {
        targets: args.tasks,
        jobs: args.jobs,
        sync_output,
        dry_run: args.dry_run,
        show_tasks: args.show_tasks,
        show_task_info: args.show_task_info,
        build_files: args.file,
        directory: args.directory,
        depth: env_depth(),
    };

    Ok((options, defines))
}

pub(crate) fn read_stdin() -> std::io::Result<String> {
    let mut payload = String::new();
    std::io::stdin().read_to_string(&mut payload)?;
    Ok(payload)
}
