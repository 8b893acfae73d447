#![deny(unsafe_code, clippy::panic)]

//! A make-style build orchestrator whose build graphs are ordinary Rust
//! code.
//!
//! A build file is a small Rust program depending on this crate. It
//! registers named tasks (with dependencies, optional file inputs/outputs
//! and a body closure) and hands control to the library, which computes
//! what is out of date, schedules the stale tasks over a bounded worker
//! pool honoring the dependency order, and keeps each task's output
//! contiguous on stdout.
//!
//! ```rust,no_run
//! use pake::{Pake, args, glob, pattern};
//!
//! let mut pk = Pake::init();
//!
//! pk.task("compile")
//!     .inputs([glob("src/*.c")])
//!     .outputs([pattern("obj/%.o")])
//!     .register(|ctx| {
//!         for (input, output) in ctx.outdated_pairs() {
//!             ctx.call(args!["cc", "-c", input, "-o", output])?;
//!         }
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! pk.task("link")
//!     .depends_on(["compile"])
//!     .inputs([glob("obj/*.o")])
//!     .outputs(["main"])
//!     .register(|ctx| {
//!         ctx.call(args!["cc", ctx.inputs(), "-o", "main"])?;
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! pake::run(pk, &["link"]);
//! ```
//!
//! Tasks may spawn subprocesses ([`TaskContext::call`]), recursive builds
//! of other build files ([`TaskContext::subpake`]) and parallel sub-work on
//! the shared pool ([`TaskContext::multitask`]). Failures carry their call
//! site, command line and captured output, and map onto a stable set of
//! process exit codes (see [`error::exit`]).

mod cli;
mod context;
pub mod defines;
pub mod error;
mod executor;
mod graph;
mod output;
pub mod pattern;
pub mod process;
mod registry;
pub mod subpake;

use std::collections::BTreeMap;

pub use camino;
use camino::Utf8PathBuf;

pub use cli::Options;
pub use context::{JobHandle, Multitask, TaskContext};
pub use defines::{Defines, Value};
pub use error::{
    ConfigError, PakeError, TaskAggregate, TaskError, TaskFailure, Terminate, exit,
};
pub use output::IoGuard;
pub use pattern::{FilePattern, glob, pattern};
pub use process::{CallOptions, SubprocessFailure};
pub use registry::{TaskHandle, TaskRef};
pub use subpake::{SubBuildFailure, SubpakeOptions};

use crate::defines::serialize_exports;
use crate::error::print_report;
use crate::executor::Driver;
use crate::output::OutputQueue;
use crate::process::CallSite;
use crate::registry::{Registry, Task, TaskBody};
use crate::subpake::SubBuildEnv;

/// The build being assembled: options, defines, exports and the task
/// registry. Everything is frozen once the run starts.
pub struct Pake {
    options: Options,
    defines: Defines,
    exports: BTreeMap<String, Value>,
    registry: Registry,
}

impl Pake {
    /// Parses the build program's argv and environment. On bad arguments
    /// this prints the problem and exits with the mapped code, like the
    /// rest of the error surface.
    pub fn init() -> Self {
        match Self::init_from(std::env::args()) {
            Ok(pake) => pake,
            Err(error) => {
                print_report(&error);
                std::process::exit(error.exit_code());
            }
        }
    }

    /// [`init`](Self::init) from an explicit argv, returning errors instead
    /// of exiting.
    pub fn init_from(argv: impl IntoIterator<Item = String>) -> Result<Self, PakeError> {
        let (options, defines) = cli::parse(argv.into_iter().collect(), cli::read_stdin)?;

        if let Some(dir) = &options.directory {
            std::env::set_current_dir(dir).map_err(|e| {
                ConfigError::BadArguments(format!("cannot change directory to {dir}: {e}"))
            })?;
        }

        Ok(Self::with_defines(options, defines))
    }

    /// Builds an instance from explicit options, for embedding.
    pub fn new(options: Options) -> Self {
        Self::with_defines(options, Defines::default())
    }

    pub(crate) fn with_defines(options: Options, defines: Defines) -> Self {
        Self {
            options,
            defines,
            exports: BTreeMap::new(),
            registry: Registry::new(),
        }
    }

    /// The frozen defines map.
    pub fn defines(&self) -> &Defines {
        &self.defines
    }

    /// Looks up one define.
    pub fn get_define(&self, key: &str) -> Option<&Value> {
        self.defines.get(key)
    }

    /// This build's sub-build depth; zero for a top-level invocation.
    pub fn depth(&self) -> usize {
        self.options.depth
    }

    /// The configured worker count.
    pub fn jobs(&self) -> usize {
        self.options.jobs
    }

    /// Marks a value for propagation to sub-builds.
    pub fn export(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.exports.insert(key.into(), value.into());
    }

    /// Removes a previously exported key.
    pub fn unexport(&mut self, key: &str) {
        self.exports.remove(key);
    }

    /// Starts registering a task; finish with
    /// [`register`](TaskBuilder::register) or
    /// [`register_group`](TaskBuilder::register_group).
    pub fn task(&mut self, name: impl Into<String>) -> TaskBuilder<'_> {
        TaskBuilder {
            pake: self,
            name: name.into(),
            deps: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            doc: None,
        }
    }

    /// The explicit registration form behind the [`task`](Self::task)
    /// builder.
    pub fn add_task<F>(
        &mut self,
        name: impl Into<String>,
        body: F,
        deps: Vec<TaskRef>,
        inputs: Vec<FilePattern>,
        outputs: Vec<FilePattern>,
        doc: Option<String>,
    ) -> Result<TaskHandle, ConfigError>
    where
        F: Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.add(Task {
            name: name.into(),
            deps,
            inputs,
            outputs,
            body: Some(Box::new(body)),
            doc,
        })
    }

    /// Runs the build: requested targets, or `default_tasks` when none were
    /// requested. Listing and dry-run switches short-circuit here.
    pub fn try_run(&self, default_tasks: &[&str]) -> Result<(), PakeError> {
        if !self.options.build_files.is_empty() {
            return self.run_build_files();
        }

        if self.options.show_tasks {
            self.print_task_list();
            return Ok(());
        }

        let requested: Vec<TaskRef> = if self.options.targets.is_empty() {
            default_tasks.iter().map(|name| TaskRef::from(*name)).collect()
        } else {
            self.options.targets.iter().map(TaskRef::from).collect()
        };

        let exports_literal = serialize_exports(&self.exports);
        let driver = Driver {
            registry: &self.registry,
            defines: &self.defines,
            exports_literal: &exports_literal,
            jobs: self.options.jobs,
            sync: self.options.sync_output,
            depth: self.options.depth,
        };

        if self.options.dry_run {
            let (_, order) = driver.plan(&requested)?;
            for &index in &order {
                println!("{}", self.registry.get(index).name);
            }
            return Ok(());
        }

        let bracketed = self.options.depth > 0 || self.options.directory.is_some();
        if bracketed {
            self.directory_banner("Entering");
        }
        let outcome = driver.run(&requested);
        if bracketed {
            self.directory_banner("Exiting");
        }
        outcome
    }

    fn print_task_list(&self) {
        for task in self.registry.iter() {
            match (&task.doc, self.options.show_task_info) {
                (Some(doc), true) => println!("{:<24}{doc}", task.name),
                _ => println!("{}", task.name),
            }
        }
    }

    fn directory_banner(&self, verb: &str) {
        let cwd = std::env::current_dir()
            .ok()
            .and_then(|p| Utf8PathBuf::try_from(p).ok())
            .unwrap_or_default();
        println!("pake[{}]: {verb} Directory \"{cwd}\"", self.options.depth);
    }

    /// Runs each `-f` build file as a child build, in order, stopping at
    /// the first failure and propagating its exit code transparently.
    fn run_build_files(&self) -> Result<(), PakeError> {
        // No task queue exists at this level; stream straight through.
        let queue = OutputQueue::new(false);
        let payload = self.defines.serialize();

        for file in &self.options.build_files {
            if !file.as_std_path().exists() {
                return Err(ConfigError::BuildFileNotFound(file.clone()).into());
            }

            let mut cmd = vec![file.to_string()];
            cmd.extend(self.options.targets.iter().cloned());
            if self.options.jobs > 1 {
                cmd.push("-j".to_string());
                cmd.push(self.options.jobs.to_string());
            }

            let env = SubBuildEnv {
                exports: &payload,
                depth: self.options.depth,
                sync: self.options.sync_output,
            };

            if let Err(failure) = subpake::run(
                "",
                CallSite::here(),
                &cmd,
                &queue,
                &env,
                &SubpakeOptions::default(),
            ) {
                let code = if failure.code > 0 {
                    failure.code
                } else {
                    exit::CORE_EXCEPTION
                };
                return Err(PakeError::BuildFileExit {
                    file: file.clone(),
                    code,
                });
            }
        }

        Ok(())
    }
}

/// One task under registration; every method refines the declaration and
/// the `register` call commits it.
pub struct TaskBuilder<'a> {
    pake: &'a mut Pake,
    name: String,
    deps: Vec<TaskRef>,
    inputs: Vec<FilePattern>,
    outputs: Vec<FilePattern>,
    doc: Option<String>,
}

impl TaskBuilder<'_> {
    /// Tasks that must complete before this one, by name or handle.
    pub fn depends_on<I, R>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<TaskRef>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, input: impl Into<FilePattern>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn inputs<I, P>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<FilePattern>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    pub fn output(mut self, output: impl Into<FilePattern>) -> Self {
        self.outputs.push(output.into());
        self
    }

    pub fn outputs<I, P>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<FilePattern>,
    {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    /// Attaches a human-readable description, shown by the task listing.
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Commits the task with the given body.
    pub fn register<F>(self, body: F) -> Result<TaskHandle, ConfigError>
    where
        F: Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.commit(Some(Box::new(body)))
    }

    /// Commits a bodyless grouping task: it only aggregates dependencies.
    pub fn register_group(self) -> Result<TaskHandle, ConfigError> {
        self.commit(None)
    }

    fn commit(self, body: Option<TaskBody>) -> Result<TaskHandle, ConfigError> {
        self.pake.registry.add(Task {
            name: self.name,
            deps: self.deps,
            inputs: self.inputs,
            outputs: self.outputs,
            body,
            doc: self.doc,
        })
    }
}

/// Runs the build and exits the process with the mapped code, printing the
/// failure report first when there is one.
pub fn run(pake: Pake, default_tasks: &[&str]) -> ! {
    match pake.try_run(default_tasks) {
        Ok(()) => std::process::exit(exit::SUCCESS),
        Err(error) => {
            print_report(&error);
            std::process::exit(error.exit_code());
        }
    }
}

/// Installs a `tracing` subscriber writing diagnostics to stderr, honoring
/// `RUST_LOG`.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    #[test]
    fn init_from_parses_defines_and_targets() {
        let pake = Pake::init_from(
            ["pakefile", "build", "-D", "CC=clang", "-D", "OPT=2", "-j", "3"]
                .into_iter()
                .map(String::from),
        )
        .unwrap();

        assert_eq!(pake.get_define("CC"), Some(&Value::Str("clang".into())));
        assert_eq!(pake.get_define("OPT"), Some(&Value::Int(2)));
        assert_eq!(pake.jobs(), 3);
    }

    #[test]
    fn dry_run_lists_without_running_bodies() {
        let ran = Arc::new(Mutex::new(false));
        let ran_in_task = ran.clone();

        let mut pake = Pake::new(Options {
            dry_run: true,
            ..Options::default()
        });
        pake.task("noop")
            .register(move |_| {
                *ran_in_task.lock().unwrap() = true;
                Ok(())
            })
            .unwrap();

        pake.try_run(&["noop"]).unwrap();
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn dry_run_still_validates_the_graph() {
        let mut pake = Pake::new(Options {
            dry_run: true,
            ..Options::default()
        });
        pake.task("a").depends_on(["b"]).register(|_| Ok(())).unwrap();
        pake.task("b").depends_on(["a"]).register(|_| Ok(())).unwrap();

        let error = pake.try_run(&["a"]).unwrap_err();
        assert_eq!(error.exit_code(), exit::CYCLIC_DEPENDENCY);
    }

    #[test]
    fn task_listing_short_circuits_execution() {
        let ran = Arc::new(Mutex::new(false));
        let ran_in_task = ran.clone();

        let mut pake = Pake::new(Options {
            show_tasks: true,
            show_task_info: true,
            ..Options::default()
        });
        pake.task("documented")
            .doc("does things")
            .register(move |_| {
                *ran_in_task.lock().unwrap() = true;
                Ok(())
            })
            .unwrap();

        pake.try_run(&["documented"]).unwrap();
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn missing_build_file_maps_to_exit_one() {
        let pake = Pake::new(Options {
            build_files: vec!["no-such-pakefile".into()],
            ..Options::default()
        });

        let error = pake.try_run(&[]).unwrap_err();
        assert_eq!(error.exit_code(), exit::BUILD_FILE_NOT_FOUND);
    }

    #[test]
    fn exports_serialize_for_the_hand_off() {
        let mut pake = Pake::new(Options::default());
        pake.export("CC", "clang");
        pake.export("JOBS", 4i64);
        pake.export("EXTRA", true);
        pake.unexport("EXTRA");

        let literal = defines::serialize_exports(&pake.exports);
        let parsed = defines::parse_literal(&literal).unwrap();
        assert_eq!(
            parsed,
            Value::Map(vec![
                (Value::Str("CC".into()), Value::Str("clang".into())),
                (Value::Str("JOBS".into()), Value::Int(4)),
            ])
        );
    }

    #[test]
    fn duplicate_registration_fails_fast() {
        let mut pake = Pake::new(Options::default());
        pake.task("twice").register(|_| Ok(())).unwrap();
        let error = pake.task("twice").register(|_| Ok(())).unwrap_err();
        assert!(matches!(error, ConfigError::TaskRedefined(name) if name == "twice"));
    }

    #[test]
    fn handles_work_as_dependency_references() {
        let ran: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        let mut pake = Pake::new(Options::default());
        let first = {
            let ran = ran.clone();
            pake.task("first")
                .register(move |_| {
                    ran.lock().unwrap().push("first");
                    Ok(())
                })
                .unwrap()
        };
        {
            let ran = ran.clone();
            pake.task("second")
                .depends_on([first])
                .register(move |_| {
                    ran.lock().unwrap().push("second");
                    Ok(())
                })
                .unwrap();
        }

        pake.try_run(&["second"]).unwrap();
        assert_eq!(*ran.lock().unwrap(), ["first", "second"]);
    }
}
