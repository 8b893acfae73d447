//! The scheduler: walks the graph bottom-up and drives the worker pool.
//!
//! Execution is a parallel topological walk. Each task's remaining
//! dependency count is tracked; a task is handed to the pool the moment the
//! count reaches zero, and every completion event comes back over one
//! channel to the main loop, which unlocks dependents and spawns them in
//! turn. With a single worker the pool is skipped entirely and tasks run
//! inline in topological order.
//!
//! Output ordering is enforced by a flush cursor over the topological
//! order: a completed task's buffer reaches stdout only after every earlier
//! task in the order has flushed, so stdout reads the same no matter how
//! completions interleave.
//!
//! The first failure stops all new dispatch. Tasks already in flight run to
//! completion and their buffers still flush in order; the failures are then
//! aggregated and the earliest-registered one decides the exit code.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use camino::Utf8PathBuf;
use crossbeam_channel::unbounded;
use tracing::debug;

use crate::context::{TaskContext, panic_message};
use crate::defines::Defines;
use crate::error::{ConfigError, PakeError, TaskAggregate, TaskError};
use crate::graph::TaskGraph;
use crate::output::{OutputQueue, executing_banner};
use crate::pattern::classify;
use crate::registry::{Registry, TaskRef};

/// Everything the scheduler needs from the frozen build state.
pub(crate) struct Driver<'a> {
    pub registry: &'a Registry,
    pub defines: &'a Defines,
    pub exports_literal: &'a str,
    pub jobs: usize,
    pub sync: bool,
    pub depth: usize,
}

/// A finished (executed or skipped) task, as the flush loop and its
/// dependents see it.
struct Completed {
    executed: bool,
    queue: Arc<OutputQueue>,
    outputs: Vec<Utf8PathBuf>,
}

impl Driver<'_> {
    /// Resolves the requested tasks and produces the execution order,
    /// running every pre-execution validation on the way.
    pub fn plan(&self, requested: &[TaskRef]) -> Result<(TaskGraph, Vec<usize>), ConfigError> {
        if self.registry.is_empty() {
            return Err(ConfigError::NoTasksDefined);
        }
        if requested.is_empty() {
            return Err(ConfigError::NoTasksSpecified);
        }

        let mut roots = Vec::with_capacity(requested.len());
        for reference in requested {
            roots.push(self.registry.resolve(reference)?);
        }

        let graph = TaskGraph::build(self.registry)?;
        let order = graph.topological_order(self.registry, &roots)?;

        // Outputs declared without inputs are reported before anything runs.
        for &index in &order {
            let task = self.registry.get(index);
            if !task.outputs.is_empty() && task.inputs.is_empty() {
                return Err(ConfigError::OutputsWithoutInputs(task.name.clone()));
            }
        }

        Ok((graph, order))
    }

    pub fn run(&self, requested: &[TaskRef]) -> Result<(), PakeError> {
        let (graph, order) = self.plan(requested)?;
        debug!(tasks = order.len(), jobs = self.jobs, "executing task graph");

        let aggregate = if self.jobs <= 1 {
            self.run_serial(&graph, &order)
        } else {
            self.run_parallel(&graph, &order)
        };

        if aggregate.is_empty() {
            Ok(())
        } else {
            Err(PakeError::Aggregate(aggregate))
        }
    }

    /// Evaluates freshness and runs the body if the task is out of date.
    /// Returns whether the body ran, the concrete outputs for dependents,
    /// and the task's verdict.
    fn evaluate(
        &self,
        index: usize,
        dependency_outputs: Vec<Utf8PathBuf>,
        queue: &OutputQueue,
    ) -> (bool, Vec<Utf8PathBuf>, Result<(), TaskError>) {
        let task = self.registry.get(index);

        let files = match classify(&task.inputs, &task.outputs) {
            Ok(files) => files,
            Err(error) => return (false, Vec::new(), Err(error)),
        };
        let outputs = files.outputs.clone();

        if !files.outdated {
            debug!(task = %task.name, "up to date");
            return (false, outputs, Ok(()));
        }
        let Some(body) = &task.body else {
            return (false, outputs, Ok(()));
        };

        // Without buffering, the banner goes out when execution starts.
        if !self.sync {
            queue.write_banner_unsynced(&executing_banner(&task.name));
        }

        let context = TaskContext {
            name: &task.name,
            queue,
            files: &files,
            dependency_outputs,
            defines: self.defines,
            exports_literal: self.exports_literal,
            depth: self.depth,
            jobs: self.jobs,
        };

        let verdict = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            body(&context)
        })) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(TaskError::from_userland(error)),
            Err(payload) => Err(TaskError::Other(anyhow::anyhow!(panic_message(payload)))),
        };

        (true, outputs, verdict)
    }

    fn gather_dependency_outputs(
        &self,
        graph: &TaskGraph,
        index: usize,
        completed: &HashMap<usize, Completed>,
    ) -> Vec<Utf8PathBuf> {
        let mut outputs = Vec::new();
        for &dep in graph.immediate_dependencies(index) {
            if let Some(done) = completed.get(&dep) {
                outputs.extend(done.outputs.iter().cloned());
            }
        }
        outputs
    }

    fn flush(&self, name: &str, completed: &Completed) {
        let banner = completed.executed.then(|| executing_banner(name));
        completed.queue.flush_to_stdout(banner.as_deref());
    }

    /// In-line execution on the caller's thread; the execution order *is*
    /// the topological order.
    fn run_serial(&self, graph: &TaskGraph, order: &[usize]) -> TaskAggregate {
        let mut aggregate = TaskAggregate::default();
        let mut completed: HashMap<usize, Completed> = HashMap::new();

        for &index in order {
            let queue = Arc::new(OutputQueue::new(self.sync));
            let dependency_outputs = self.gather_dependency_outputs(graph, index, &completed);
            let (executed, outputs, verdict) = self.evaluate(index, dependency_outputs, &queue);

            let done = Completed {
                executed,
                queue,
                outputs,
            };
            self.flush(&self.registry.get(index).name, &done);
            completed.insert(index, done);

            if let Err(error) = verdict {
                aggregate.push(self.registry.get(index).name.clone(), index, error);
                break;
            }
        }

        aggregate
    }

    /// The parallel walk. Dependency counts gate dispatch, one channel
    /// carries completions back, and the flush cursor trails behind
    /// emitting buffers in topological order.
    fn run_parallel(&self, graph: &TaskGraph, order: &[usize]) -> TaskAggregate {
        let members: HashSet<usize> = order.iter().copied().collect();

        // Dependents within the run set, and per-task remaining counts.
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for &task in order {
            let deps: Vec<usize> = graph
                .immediate_dependencies(task)
                .iter()
                .copied()
                .filter(|d| members.contains(d))
                .collect();
            counts.insert(task, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(task);
            }
        }

        let position: HashMap<usize, usize> =
            order.iter().enumerate().map(|(pos, &t)| (t, pos)).collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()
            .expect("failed to build the worker pool");

        let (sender, receiver) =
            unbounded::<(usize, bool, Vec<Utf8PathBuf>, Result<(), TaskError>)>();

        let mut aggregate = TaskAggregate::default();
        let mut done: Vec<Option<Completed>> = Vec::with_capacity(order.len());
        done.resize_with(order.len(), || None);
        let mut completed: HashMap<usize, Completed> = HashMap::new();
        let mut cursor = 0usize;
        let mut in_flight = 0usize;
        let mut failing = false;

        pool.scope(|scope| {
            // Helper closure handing one ready task to the pool.
            let spawn = |index: usize,
                         dependency_outputs: Vec<Utf8PathBuf>,
                         in_flight: &mut usize| {
                let queue = Arc::new(OutputQueue::new(self.sync));
                let sender = sender.clone();
                let task_queue = queue.clone();
                *in_flight += 1;
                scope.spawn(move |_| {
                    let (executed, outputs, verdict) =
                        self.evaluate(index, dependency_outputs, &task_queue);
                    sender.send((index, executed, outputs, verdict)).unwrap();
                });
                queue
            };

            let mut queues: HashMap<usize, Arc<OutputQueue>> = HashMap::new();

            for &task in order {
                if counts[&task] == 0 {
                    let queue = spawn(task, Vec::new(), &mut in_flight);
                    queues.insert(task, queue);
                }
            }

            while in_flight > 0 {
                let (index, executed, outputs, verdict) = receiver.recv().unwrap();
                in_flight -= 1;

                let entry = Completed {
                    executed,
                    queue: queues.remove(&index).expect("queue for completed task"),
                    outputs,
                };

                // Advance the flush cursor over the contiguous completed
                // prefix of the topological order.
                done[position[&index]] = Some(entry);
                while cursor < order.len() && done[cursor].is_some() {
                    let entry = done[cursor].take().unwrap();
                    self.flush(&self.registry.get(order[cursor]).name, &entry);
                    completed.insert(order[cursor], entry);
                    cursor += 1;
                }

                match verdict {
                    Err(error) => {
                        aggregate.push(self.registry.get(index).name.clone(), index, error);
                        failing = true;
                    }
                    Ok(()) if !failing => {
                        for dependent in dependents.get(&index).cloned().unwrap_or_default() {
                            let count = counts.get_mut(&dependent).unwrap();
                            *count -= 1;
                            if *count == 0 {
                                // A spawned task needs its dependency
                                // outputs; deps beyond the cursor are still
                                // parked in `done`.
                                let mut dependency_outputs = Vec::new();
                                for &dep in graph.immediate_dependencies(dependent) {
                                    if let Some(done_entry) = completed.get(&dep) {
                                        dependency_outputs
                                            .extend(done_entry.outputs.iter().cloned());
                                    } else if let Some(Some(parked)) =
                                        done.get(position[&dep]).map(|o| o.as_ref())
                                    {
                                        dependency_outputs
                                            .extend(parked.outputs.iter().cloned());
                                    }
                                }
                                let queue = spawn(dependent, dependency_outputs, &mut in_flight);
                                queues.insert(dependent, queue);
                            }
                        }
                    }
                    Ok(()) => {}
                }
            }
        });

        // Quiescent now; flush whatever completed beyond a gap left by
        // never-dispatched tasks, still in topological order.
        for pos in cursor..order.len() {
            if let Some(entry) = &done[pos] {
                self.flush(&self.registry.get(order[pos]).name, entry);
            }
        }

        aggregate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;
    use std::sync::Mutex;
    use std::thread::sleep;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::cli::Options;
    use crate::error::{Terminate, exit};
    use crate::pattern::FilePattern;
    use crate::{Pake, SubprocessFailure};

    fn options(jobs: usize) -> Options {
        Options {
            jobs,
            ..Options::default()
        }
    }

    fn utf8(path: std::path::PathBuf) -> Utf8PathBuf {
        Utf8PathBuf::try_from(path).unwrap()
    }

    fn touch(dir: &TempDir, name: &str) -> Utf8PathBuf {
        let p = utf8(dir.path().join(name));
        File::create(&p).unwrap();
        p
    }

    type Trace = Arc<Mutex<Vec<String>>>;

    fn tracing_task(pake: &mut Pake, trace: &Trace, name: &str, deps: &[&str]) {
        let trace = trace.clone();
        let label = name.to_string();
        pake.task(name)
            .depends_on(deps.iter().copied())
            .register(move |_| {
                trace.lock().unwrap().push(label.clone());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn serial_execution_follows_registration_tie_broken_topological_order() {
        let trace: Trace = Arc::default();
        let mut pake = Pake::new(options(1));

        tracing_task(&mut pake, &trace, "a", &[]);
        tracing_task(&mut pake, &trace, "b", &["a"]);
        tracing_task(&mut pake, &trace, "c", &["a"]);
        tracing_task(&mut pake, &trace, "d", &["c", "b"]);

        pake.try_run(&["d"]).unwrap();
        assert_eq!(*trace.lock().unwrap(), ["a", "b", "c", "d"]);
    }

    #[test]
    fn parallel_run_respects_dependency_precedence() {
        let trace: Trace = Arc::default();
        let mut pake = Pake::new(options(4));

        tracing_task(&mut pake, &trace, "foo", &[]);
        tracing_task(&mut pake, &trace, "bar", &["foo"]);

        pake.try_run(&["bar"]).unwrap();

        let order = trace.lock().unwrap().clone();
        assert_eq!(order, ["foo", "bar"]);
    }

    #[test]
    fn phony_task_runs_every_time() {
        let trace: Trace = Arc::default();
        let mut pake = Pake::new(options(1));
        tracing_task(&mut pake, &trace, "phony", &[]);

        pake.try_run(&["phony"]).unwrap();
        pake.try_run(&["phony"]).unwrap();
        assert_eq!(trace.lock().unwrap().len(), 2);
    }

    #[test]
    fn symmetric_compile_sees_exactly_the_stale_pairs() {
        let dir = TempDir::new().unwrap();
        let a_o = touch(&dir, "a.o");
        sleep(Duration::from_millis(20));
        let a_c = touch(&dir, "a.c");
        let b_c = touch(&dir, "b.c");
        let b_o = utf8(dir.path().join("b.o"));

        let seen: Arc<Mutex<Vec<(Utf8PathBuf, Utf8PathBuf)>>> = Arc::default();
        let seen_in_task = seen.clone();

        let mut pake = Pake::new(options(1));
        pake.task("bar")
            .inputs([a_c.clone(), b_c.clone()])
            .outputs([a_o.clone(), b_o.clone()])
            .register(move |ctx| {
                seen_in_task
                    .lock()
                    .unwrap()
                    .extend(ctx.outdated_pairs().iter().cloned());
                Ok(())
            })
            .unwrap();

        pake.try_run(&["bar"]).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(a_c, a_o), (b_c, b_o)]);
    }

    #[test]
    fn up_to_date_task_is_skipped_but_feeds_dependents() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "lib.c");
        sleep(Duration::from_millis(20));
        let output = touch(&dir, "lib.o");

        let ran: Trace = Arc::default();
        let ran_in_task = ran.clone();
        let dep_outputs: Arc<Mutex<Vec<Utf8PathBuf>>> = Arc::default();
        let dep_outputs_in_task = dep_outputs.clone();

        let mut pake = Pake::new(options(1));
        pake.task("compile")
            .inputs([input])
            .outputs([output.clone()])
            .register(move |_| {
                ran_in_task.lock().unwrap().push("compile".into());
                Ok(())
            })
            .unwrap();
        pake.task("link")
            .depends_on(["compile"])
            .register(move |ctx| {
                dep_outputs_in_task
                    .lock()
                    .unwrap()
                    .extend(ctx.dependency_outputs().iter().cloned());
                Ok(())
            })
            .unwrap();

        pake.try_run(&["link"]).unwrap();

        assert!(ran.lock().unwrap().is_empty(), "fresh task must be skipped");
        assert_eq!(*dep_outputs.lock().unwrap(), vec![output]);
    }

    #[test]
    fn cycle_fails_before_any_body_runs() {
        let trace: Trace = Arc::default();
        let mut pake = Pake::new(options(1));
        tracing_task(&mut pake, &trace, "a", &["b"]);
        tracing_task(&mut pake, &trace, "b", &["a"]);

        let error = pake.try_run(&["a"]).unwrap_err();
        assert_eq!(error.exit_code(), exit::CYCLIC_DEPENDENCY);
        assert!(trace.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_input_fails_with_code_five_and_skips_the_body() {
        let trace: Trace = Arc::default();
        let trace_in_task = trace.clone();

        let mut pake = Pake::new(options(1));
        pake.task("broken")
            .inputs(["definitely-missing.c"])
            .register(move |_| {
                trace_in_task.lock().unwrap().push("ran".into());
                Ok(())
            })
            .unwrap();

        let error = pake.try_run(&["broken"]).unwrap_err();
        assert_eq!(error.exit_code(), exit::MISSING_INPUT);
        assert!(trace.lock().unwrap().is_empty());
    }

    #[test]
    fn outputs_without_inputs_is_rejected_before_running() {
        let trace: Trace = Arc::default();
        let trace_in_task = trace.clone();

        let mut pake = Pake::new(options(1));
        pake.task("bad")
            .outputs(["out.bin"])
            .register(move |_| {
                trace_in_task.lock().unwrap().push("ran".into());
                Ok(())
            })
            .unwrap();

        let error = pake.try_run(&["bad"]).unwrap_err();
        assert_eq!(error.exit_code(), exit::OUTPUTS_WITHOUT_INPUTS);
        assert!(trace.lock().unwrap().is_empty());
    }

    #[test]
    fn undefined_task_and_empty_run_sets_map_to_their_codes() {
        let pake = Pake::new(options(1));
        assert_eq!(
            pake.try_run(&["ghost"]).unwrap_err().exit_code(),
            exit::NO_TASKS_DEFINED
        );

        let mut pake = Pake::new(options(1));
        pake.task("real").register(|_| Ok(())).unwrap();
        assert_eq!(
            pake.try_run(&["ghost"]).unwrap_err().exit_code(),
            exit::UNDEFINED_TASK
        );
        assert_eq!(
            pake.try_run(&[]).unwrap_err().exit_code(),
            exit::NO_TASKS_SPECIFIED
        );
    }

    #[test]
    fn subprocess_failure_reports_command_code_and_call_site() {
        let mut pake = Pake::new(options(8));
        pake.task("shell-out")
            .register(|ctx| {
                ctx.call_with(
                    ["false"],
                    crate::CallOptions {
                        collect_output: true,
                        ..Default::default()
                    },
                )?;
                Ok(())
            })
            .unwrap();

        let error = pake.try_run(&["shell-out"]).unwrap_err();
        assert_eq!(error.exit_code(), exit::SUBPROCESS_FAILED);

        let PakeError::Aggregate(aggregate) = &error else {
            panic!("expected an aggregate");
        };
        let failure = aggregate.first().unwrap();
        assert_eq!(failure.task, "shell-out");
        let TaskError::Subprocess(sub) = &failure.error else {
            panic!("expected a subprocess failure");
        };
        assert_eq!(sub.cmd, vec!["false".to_string()]);
        assert_eq!(sub.code, 1);
        assert!(sub.output.is_empty());
        assert!(sub.file.ends_with("executor.rs"));
        assert!(sub.line > 0);
    }

    #[test]
    fn multitask_unit_failure_fails_the_task_with_code_nine() {
        let mut pake = Pake::new(options(4));
        pake.task("fan-out")
            .register(|ctx| {
                ctx.multitask(|mt| {
                    mt.submit(|| Ok(()));
                    mt.submit(|| -> anyhow::Result<()> { anyhow::bail!("middle unit") });
                    mt.submit(|| Ok(()));
                    Ok(())
                })
            })
            .unwrap();

        let error = pake.try_run(&["fan-out"]).unwrap_err();
        assert_eq!(error.exit_code(), exit::TASK_EXCEPTION);
    }

    #[test]
    fn first_failure_stops_new_dispatch() {
        let trace: Trace = Arc::default();
        let mut pake = Pake::new(options(1));

        {
            let trace = trace.clone();
            pake.task("boom")
                .register(move |_| {
                    trace.lock().unwrap().push("boom".into());
                    anyhow::bail!("exploded")
                })
                .unwrap();
        }
        tracing_task(&mut pake, &trace, "later", &[]);

        let error = pake.try_run(&["boom", "later"]).unwrap_err();
        assert_eq!(error.exit_code(), exit::TASK_EXCEPTION);
        assert_eq!(*trace.lock().unwrap(), ["boom"]);
    }

    #[test]
    fn failed_dependency_blocks_dependents() {
        let trace: Trace = Arc::default();
        let mut pake = Pake::new(options(4));

        pake.task("base")
            .register(|_| anyhow::bail!("base failed"))
            .unwrap();
        tracing_task(&mut pake, &trace, "dependent", &["base"]);

        let error = pake.try_run(&["dependent"]).unwrap_err();
        assert_eq!(error.exit_code(), exit::TASK_EXCEPTION);
        assert!(trace.lock().unwrap().is_empty());
    }

    #[test]
    fn terminate_is_honored_with_its_conventional_code() {
        let mut pake = Pake::new(options(1));
        pake.task("stop-clean")
            .register(|ctx| Err(ctx.terminate(0)))
            .unwrap();
        let error = pake.try_run(&["stop-clean"]).unwrap_err();
        assert_eq!(error.exit_code(), exit::SUCCESS);
        assert!(error.is_clean_exit());

        let mut pake = Pake::new(options(1));
        pake.task("stop-hard")
            .register(|ctx| Err(ctx.terminate(5)))
            .unwrap();
        let error = pake.try_run(&["stop-hard"]).unwrap_err();
        assert_eq!(error.exit_code(), exit::TERMINATED);

        let PakeError::Aggregate(aggregate) = &error else {
            panic!("expected an aggregate");
        };
        assert!(matches!(
            aggregate.first().unwrap().error,
            TaskError::Terminate(Terminate(5))
        ));
    }

    #[test]
    fn panicking_body_is_reported_not_propagated() {
        let mut pake = Pake::new(options(1));
        pake.task("panics")
            .register(|_| std::panic::panic_any("task blew up"))
            .unwrap();

        let error = pake.try_run(&["panics"]).unwrap_err();
        assert_eq!(error.exit_code(), exit::TASK_EXCEPTION);
    }

    #[test]
    fn parallel_independent_tasks_all_complete() {
        let trace: Trace = Arc::default();
        let mut pake = Pake::new(options(4));
        for name in ["t1", "t2", "t3", "t4", "t5", "t6"] {
            tracing_task(&mut pake, &trace, name, &[]);
        }

        pake.try_run(&["t1", "t2", "t3", "t4", "t5", "t6"]).unwrap();

        let mut ran = trace.lock().unwrap().clone();
        ran.sort();
        assert_eq!(ran, ["t1", "t2", "t3", "t4", "t5", "t6"]);
    }

    #[test]
    fn group_tasks_only_aggregate() {
        let trace: Trace = Arc::default();
        let mut pake = Pake::new(options(1));
        tracing_task(&mut pake, &trace, "a", &[]);
        tracing_task(&mut pake, &trace, "b", &[]);
        pake.task("all")
            .depends_on(["a", "b"])
            .register_group()
            .unwrap();

        pake.try_run(&["all"]).unwrap();
        assert_eq!(*trace.lock().unwrap(), ["a", "b"]);
    }

    #[test]
    fn requested_duplicate_targets_run_once() {
        let trace: Trace = Arc::default();
        let mut pake = Pake::new(options(1));
        tracing_task(&mut pake, &trace, "once", &[]);

        pake.try_run(&["once", "once"]).unwrap();
        assert_eq!(*trace.lock().unwrap(), ["once"]);
    }

    #[test]
    fn template_outputs_round_through_the_driver() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "x.c");
        touch(&dir, "y.c");
        let base = utf8(dir.path().to_path_buf());

        let seen: Arc<Mutex<Vec<Utf8PathBuf>>> = Arc::default();
        let seen_in_task = seen.clone();

        let mut pake = Pake::new(options(1));
        pake.task("objects")
            .inputs([FilePattern::Glob(format!("{base}/*.c"))])
            .outputs([FilePattern::Template(format!("{base}/%.o"))])
            .register(move |ctx| {
                seen_in_task
                    .lock()
                    .unwrap()
                    .extend(ctx.outputs().iter().cloned());
                Ok(())
            })
            .unwrap();

        pake.try_run(&["objects"]).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![base.join("x.o"), base.join("y.o")]
        );
    }

    #[test]
    fn subprocess_failure_downcasts_from_the_aggregate() {
        let mut pake = Pake::new(options(1));
        pake.task("t")
            .register(|ctx| {
                let code = ctx.try_call(
                    ["false"],
                    crate::CallOptions {
                        ignore_errors: true,
                        print_cmd: false,
                        ..Default::default()
                    },
                )?;
                anyhow::ensure!(code == 1, "expected exit 1, got {code}");
                Ok(())
            })
            .unwrap();

        pake.try_run(&["t"]).unwrap();

        // And the non-ignored variant is a typed SubprocessFailure.
        let mut pake = Pake::new(options(1));
        pake.task("t")
            .register(|ctx| {
                ctx.call(["false"])?;
                Ok(())
            })
            .unwrap();
        let error = pake.try_run(&["t"]).unwrap_err();
        let PakeError::Aggregate(aggregate) = error else {
            panic!("expected an aggregate")
        };
        assert!(matches!(
            aggregate.failures[0].error,
            TaskError::Subprocess(SubprocessFailure { code: 1, .. })
        ));
    }
}
