//! The per-task facade a running body sees.
//!
//! A [`TaskContext`] is created right before a task body runs and dropped
//! when it returns. It carries the expanded file views, the task's output
//! queue, the frozen defines, and the doors to the three kinds of external
//! work: subprocesses, sub-builds, and sub-work submitted into the shared
//! worker pool through [`TaskContext::multitask`].
//!
//! Sub-work runs on the same bounded pool as top-level tasks: a scope
//! opened on a pool worker spawns into the pool it is running on, and a
//! scope waiting for its units participates in work stealing instead of
//! holding a worker hostage. With a single worker the scope never forms and
//! submissions execute synchronously at the submit call, which keeps the
//! semantics identical without special cases in user code.

use std::any::Any;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};

use camino::Utf8PathBuf;

use crate::defines::Defines;
use crate::error::Terminate;
use crate::output::{IoGuard, OutputQueue};
use crate::pattern::Classified;
use crate::process::{self, CallOptions, CallSite, IntoArgs, Relay, SubprocessFailure};
use crate::subpake::{self, SubBuildEnv, SubpakeOptions};

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        String::from("task panicked with unknown payload")
    }
}

/// The public surface an executing task body sees.
pub struct TaskContext<'run> {
    pub(crate) name: &'run str,
    pub(crate) queue: &'run OutputQueue,
    pub(crate) files: &'run Classified,
    pub(crate) dependency_outputs: Vec<Utf8PathBuf>,
    pub(crate) defines: &'run Defines,
    pub(crate) exports_literal: &'run str,
    pub(crate) depth: usize,
    pub(crate) jobs: usize,
}

impl<'run> TaskContext<'run> {
    /// The task's registered name.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Concrete inputs, expanded and deduplicated in declaration order.
    pub fn inputs(&self) -> &[Utf8PathBuf] {
        &self.files.inputs
    }

    /// Concrete outputs; missing files appear here too.
    pub fn outputs(&self) -> &[Utf8PathBuf] {
        &self.files.outputs
    }

    pub fn outdated_inputs(&self) -> &[Utf8PathBuf] {
        &self.files.outdated_inputs
    }

    pub fn outdated_outputs(&self) -> &[Utf8PathBuf] {
        &self.files.outdated_outputs
    }

    /// The stale `(input, output)` pairs under the element-wise pairing
    /// rule. Empty when the declaration is asymmetric.
    pub fn outdated_pairs(&self) -> &[(Utf8PathBuf, Utf8PathBuf)] {
        &self.files.outdated_pairs
    }

    /// Flattened concrete outputs of the immediate dependencies, taken at
    /// the moment this task started.
    pub fn dependency_outputs(&self) -> &[Utf8PathBuf] {
        &self.dependency_outputs
    }

    /// The frozen defines map.
    pub fn defines(&self) -> &Defines {
        self.defines
    }

    /// This build's sub-build depth; zero for the top-level invocation.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Appends a line to the task's output.
    pub fn println(&self, text: impl std::fmt::Display) {
        self.queue.println(text);
    }

    /// Appends raw bytes to the task's output.
    pub fn write(&self, bytes: &[u8]) {
        self.queue.write(bytes);
    }

    /// Acquires the output sink for a multi-write atomic section. The
    /// guard is a no-op when output synchronization is disabled.
    pub fn lock_io(&self) -> IoGuard<'run> {
        self.queue.lock()
    }

    /// Builds the error that requests early termination of the whole run
    /// with the given code. Return it from the task body:
    ///
    /// ```rust,ignore
    /// return Err(ctx.terminate(0));
    /// ```
    pub fn terminate(&self, code: i32) -> anyhow::Error {
        Terminate(code).into()
    }

    /// Runs a command, relaying its merged output into the task's output,
    /// and fails on a non-zero exit status.
    #[track_caller]
    pub fn call(&self, args: impl IntoArgs) -> anyhow::Result<i32> {
        self.call_with(args, CallOptions::default())
    }

    /// [`call`](Self::call) with explicit options.
    #[track_caller]
    pub fn call_with(&self, args: impl IntoArgs, opts: CallOptions) -> anyhow::Result<i32> {
        match self.try_call(args, opts) {
            Ok(code) => Ok(code),
            Err(failure) => Err(failure.into()),
        }
    }

    /// The error-returning variant of [`call`](Self::call): a non-zero
    /// status comes back as a structured [`SubprocessFailure`] instead of
    /// an opaque error.
    #[track_caller]
    pub fn try_call(
        &self,
        args: impl IntoArgs,
        opts: CallOptions,
    ) -> Result<i32, SubprocessFailure> {
        let site = CallSite::here();
        let cmd = args.into_args();

        if opts.print_cmd && !opts.silent {
            self.queue.println(cmd.join(" "));
        }

        let relay = if opts.silent {
            Relay::Quiet
        } else if opts.collect_output {
            Relay::Collect(self.queue)
        } else {
            Relay::Stream(self.queue)
        };

        let finished = process::run(self.name, site, &cmd, relay, None)?;
        if finished.code != 0 && !opts.ignore_errors {
            return Err(SubprocessFailure {
                task: self.name.to_string(),
                file: site.file,
                line: site.line,
                cmd,
                code: finished.code,
                output: finished.output,
            });
        }
        Ok(finished.code)
    }

    /// Runs a command quietly and returns its exit status. Output is
    /// captured for error reporting only.
    #[track_caller]
    pub fn check_call(&self, args: impl IntoArgs) -> anyhow::Result<i32> {
        let site = CallSite::here();
        let cmd = args.into_args();
        let finished = process::run(self.name, site, &cmd, Relay::Quiet, None)
            .map_err(anyhow::Error::from)?;
        if finished.code != 0 {
            return Err(SubprocessFailure {
                task: self.name.to_string(),
                file: site.file,
                line: site.line,
                cmd,
                code: finished.code,
                output: finished.output,
            }
            .into());
        }
        Ok(finished.code)
    }

    /// Runs a command quietly and returns its merged output bytes. Never
    /// relays anything to the task's output.
    #[track_caller]
    pub fn check_output(&self, args: impl IntoArgs) -> anyhow::Result<Vec<u8>> {
        let site = CallSite::here();
        let cmd = args.into_args();
        let finished = process::run(self.name, site, &cmd, Relay::Quiet, None)
            .map_err(anyhow::Error::from)?;
        if finished.code != 0 {
            return Err(SubprocessFailure {
                task: self.name.to_string(),
                file: site.file,
                line: site.line,
                cmd,
                code: finished.code,
                output: finished.output,
            }
            .into());
        }
        Ok(finished.output)
    }

    /// Runs another build file as a child build. `args` starts with the
    /// build program; the exports of this build reach it over stdin.
    #[track_caller]
    pub fn subpake(&self, args: impl IntoArgs) -> anyhow::Result<i32> {
        self.subpake_with(args, SubpakeOptions::default())
    }

    /// [`subpake`](Self::subpake) with explicit options.
    #[track_caller]
    pub fn subpake_with(&self, args: impl IntoArgs, opts: SubpakeOptions) -> anyhow::Result<i32> {
        let site = CallSite::here();
        let cmd = args.into_args();
        let env = SubBuildEnv {
            exports: self.exports_literal,
            depth: self.depth,
            sync: self.queue.synchronized(),
        };

        match subpake::run(self.name, site, &cmd, self.queue, &env, &opts) {
            Ok(code) => Ok(code),
            Err(failure) if opts.ignore_errors && failure.code != process::SPAWN_FAILED => {
                Ok(failure.code)
            }
            Err(failure) => Err(failure.into()),
        }
    }

    /// Opens a scoped sub-executor over the shared worker pool.
    ///
    /// Units submitted inside the scope run concurrently with the body,
    /// bounded by the same worker count as top-level tasks. The scope end
    /// waits for every submitted unit; if any failed, the earliest
    /// submission's error propagates out of this call. Later units still
    /// run to completion, their results are discarded.
    pub fn multitask<'env, R, F>(&'env self, f: F) -> anyhow::Result<R>
    where
        R: Send,
        F: FnOnce(&Multitask<'_, 'env>) -> anyhow::Result<R> + Send,
    {
        if self.jobs <= 1 {
            let mt = Multitask {
                scope: None,
                ledger: Mutex::new(Vec::new()),
            };
            let out = f(&mt);
            let probes = mt.ledger.into_inner().unwrap();
            finish(out, probes)
        } else {
            let (out, probes) = rayon::scope(|scope| {
                let mt = Multitask {
                    scope: Some(scope),
                    ledger: Mutex::new(Vec::new()),
                };
                let out = f(&mt);
                let probes = mt.ledger.into_inner().unwrap();
                (out, probes)
            });
            // The scope has joined every spawned unit by the time it
            // returns, so the probes are all filled.
            finish(out, probes)
        }
    }
}

fn finish<R>(
    out: anyhow::Result<R>,
    probes: Vec<Arc<dyn JobProbe>>,
) -> anyhow::Result<R> {
    let out = out?;
    for probe in probes {
        if let Some(error) = probe.take_error() {
            return Err(error);
        }
    }
    Ok(out)
}

/// The scoped sub-executor handed to a [`TaskContext::multitask`] closure.
pub struct Multitask<'s, 'env> {
    scope: Option<&'s rayon::Scope<'env>>,
    ledger: Mutex<Vec<Arc<dyn JobProbe>>>,
}

impl<'s, 'env> Multitask<'s, 'env> {
    /// Submits one unit of work into the shared pool and returns its
    /// completion handle. With a single worker the unit runs synchronously
    /// before this call returns.
    pub fn submit<T, F>(&self, f: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'env,
    {
        let slot = Arc::new(JobSlot::new());
        self.ledger
            .lock()
            .unwrap()
            .push(slot.clone() as Arc<dyn JobProbe>);

        match self.scope {
            None => slot.fill(run_unit(f)),
            Some(scope) => {
                let slot = slot.clone();
                scope.spawn(move |_| slot.fill(run_unit(f)));
            }
        }

        JobHandle { slot }
    }
}

fn run_unit<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(anyhow::anyhow!(panic_message(payload))))
}

enum SlotState<T> {
    Pending,
    Ready(anyhow::Result<T>),
    Taken,
}

struct JobSlot<T> {
    cell: Mutex<SlotState<T>>,
    cv: Condvar,
}

impl<T> JobSlot<T> {
    fn new() -> Self {
        Self {
            cell: Mutex::new(SlotState::Pending),
            cv: Condvar::new(),
        }
    }

    fn fill(&self, result: anyhow::Result<T>) {
        *self.cell.lock().unwrap() = SlotState::Ready(result);
        self.cv.notify_all();
    }
}

/// Type-erased view of a job slot, kept by the scope so errors stay
/// observable even when the caller dropped the handle.
trait JobProbe: Send + Sync {
    fn take_error(&self) -> Option<anyhow::Error>;
}

impl<T: Send> JobProbe for JobSlot<T> {
    fn take_error(&self) -> Option<anyhow::Error> {
        let mut cell = self.cell.lock().unwrap();
        if matches!(&*cell, SlotState::Ready(Err(_))) {
            if let SlotState::Ready(Err(error)) = mem::replace(&mut *cell, SlotState::Taken) {
                return Some(error);
            }
        }
        None
    }
}

/// Completion handle for one submitted unit.
pub struct JobHandle<T> {
    slot: Arc<JobSlot<T>>,
}

impl<T> JobHandle<T> {
    /// Whether the unit has finished, without blocking.
    pub fn done(&self) -> bool {
        !matches!(&*self.slot.cell.lock().unwrap(), SlotState::Pending)
    }

    /// Blocks until the unit finishes and returns its result.
    ///
    /// A unit failure is reported here *and* still propagates out of the
    /// enclosing scope; the scope keeps the original error, this call
    /// returns a rendering of it.
    pub fn wait(self) -> anyhow::Result<T> {
        let mut cell = self.slot.cell.lock().unwrap();
        while matches!(&*cell, SlotState::Pending) {
            cell = self.slot.cv.wait(cell).unwrap();
        }

        match mem::replace(&mut *cell, SlotState::Taken) {
            SlotState::Ready(Ok(value)) => Ok(value),
            SlotState::Ready(Err(error)) => {
                // The scope keeps the original for its own propagation.
                let rendered = anyhow::anyhow!("{error:#}");
                *cell = SlotState::Ready(Err(error));
                Err(rendered)
            }
            SlotState::Taken => Err(anyhow::anyhow!("job result was already taken")),
            SlotState::Pending => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::pattern::Classified;

    fn harness() -> (OutputQueue, Defines, Classified) {
        (OutputQueue::new(true), Defines::new(), Classified::default())
    }

    fn context<'a>(
        queue: &'a OutputQueue,
        defines: &'a Defines,
        files: &'a Classified,
        jobs: usize,
    ) -> TaskContext<'a> {
        TaskContext {
            name: "test-task",
            queue,
            files,
            dependency_outputs: Vec::new(),
            defines,
            exports_literal: "{}",
            depth: 0,
            jobs,
        }
    }

    #[test]
    fn println_and_write_append_to_the_queue() {
        let (queue, defines, files) = harness();
        let ctx = context(&queue, &defines, &files, 1);

        ctx.println("hello");
        ctx.write(b"raw");
        assert_eq!(queue.snapshot(), b"hello\nraw".to_vec());
    }

    #[test]
    fn call_streams_and_echoes_the_command() {
        let (queue, defines, files) = harness();
        let ctx = context(&queue, &defines, &files, 1);

        let code = ctx.call(["sh", "-c", "echo out"]).unwrap();
        assert_eq!(code, 0);

        let text = String::from_utf8(queue.snapshot()).unwrap();
        assert!(text.starts_with("sh -c echo out\n"));
        assert!(text.contains("out\n"));
    }

    #[test]
    fn failing_call_reports_the_call_site() {
        let (queue, defines, files) = harness();
        let ctx = context(&queue, &defines, &files, 1);

        let err = ctx
            .call_with(
                ["false"],
                CallOptions {
                    collect_output: true,
                    ..Default::default()
                },
            )
            .unwrap_err();

        let failure = err.downcast::<SubprocessFailure>().unwrap();
        assert_eq!(failure.cmd, vec!["false".to_string()]);
        assert_eq!(failure.code, 1);
        assert!(failure.output.is_empty());
        assert_eq!(failure.task, "test-task");
        assert!(failure.file.ends_with("context.rs"));
        assert!(failure.line > 0);
    }

    #[test]
    fn ignore_errors_returns_the_code() {
        let (queue, defines, files) = harness();
        let ctx = context(&queue, &defines, &files, 1);

        let code = ctx
            .call_with(
                ["false"],
                CallOptions {
                    ignore_errors: true,
                    print_cmd: false,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn check_output_captures_without_relaying() {
        let (queue, defines, files) = harness();
        let ctx = context(&queue, &defines, &files, 1);

        let output = ctx.check_output(["sh", "-c", "echo captured"]).unwrap();
        assert_eq!(output, b"captured\n".to_vec());
        assert!(queue.snapshot().is_empty());
    }

    #[test]
    fn multitask_runs_units_and_returns_results() {
        let (queue, defines, files) = harness();
        let ctx = context(&queue, &defines, &files, 1);

        let total = ctx
            .multitask(|mt| {
                let a = mt.submit(|| Ok(20));
                let b = mt.submit(|| Ok(22));
                Ok(a.wait()? + b.wait()?)
            })
            .unwrap();
        assert_eq!(total, 42);
    }

    #[test]
    fn multitask_propagates_the_earliest_failure() {
        let (queue, defines, files) = harness();
        let ctx = context(&queue, &defines, &files, 1);

        let ran = Arc::new(Mutex::new(Vec::new()));
        let result: anyhow::Result<()> = ctx.multitask(|mt| {
            for i in 0..3 {
                let ran = ran.clone();
                mt.submit(move || {
                    ran.lock().unwrap().push(i);
                    if i == 1 {
                        anyhow::bail!("unit {i} failed");
                    }
                    Ok(())
                });
            }
            Ok(())
        });

        let err = result.unwrap_err();
        assert!(err.to_string().contains("unit 1 failed"));
        // All three units completed despite the failure.
        assert_eq!(ran.lock().unwrap().len(), 3);
    }

    #[test]
    fn multitask_on_the_pool_propagates_failures_too() {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap();

        pool.install(|| {
            let (queue, defines, files) = harness();
            let ctx = context(&queue, &defines, &files, 4);

            let result: anyhow::Result<()> = ctx.multitask(|mt| {
                mt.submit(|| Ok(()));
                mt.submit(|| -> anyhow::Result<()> { anyhow::bail!("second unit") });
                mt.submit(|| Ok(()));
                Ok(())
            });

            let err = result.unwrap_err();
            assert!(err.to_string().contains("second unit"));
        });
    }

    #[test]
    fn multitask_unit_panic_becomes_an_error() {
        let (queue, defines, files) = harness();
        let ctx = context(&queue, &defines, &files, 1);

        let result: anyhow::Result<()> = ctx.multitask(|mt| {
            mt.submit(|| -> anyhow::Result<()> { panic!("kaboom") });
            Ok(())
        });
        assert!(result.unwrap_err().to_string().contains("kaboom"));
    }

    #[test]
    fn handle_done_after_inline_submit() {
        let (queue, defines, files) = harness();
        let ctx = context(&queue, &defines, &files, 1);

        ctx.multitask(|mt| {
            let handle = mt.submit(|| Ok(7));
            assert!(handle.done());
            assert_eq!(handle.wait().unwrap(), 7);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn terminate_builds_a_downcastable_signal() {
        let (queue, defines, files) = harness();
        let ctx = context(&queue, &defines, &files, 1);

        let err = ctx.terminate(3);
        assert_eq!(err.downcast::<Terminate>().unwrap(), Terminate(3));
    }
}
