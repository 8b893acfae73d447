//! Recursive build invocations.
//!
//! A sub-build launches another build program as a child process. The child
//! learns its depth through the `PAKE_DEPTH` environment variable, receives
//! the parent's exports as one literal mapping on stdin (the runner appends
//! `--stdin-defines` to its command line), and inherits the parent's
//! output-synchronization policy through `PAKE_SYNC_OUTPUT` unless the call
//! overrides it explicitly. Explicit `-D` pairs in the sub-build arguments
//! win over exported values because the child merges stdin first.
//!
//! The child's combined output is bracketed by enter/exit banners and
//! relayed with the same spool-or-stream discipline as plain subprocesses.
//! Sub-builds are opaque: a cycle between parent and child build files is
//! not detected.

use std::fmt;
use std::process::Command;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::output::OutputQueue;
use crate::process::{self, CallSite, SPAWN_FAILED};

/// Environment variable carrying the 0-based build depth.
pub const DEPTH_ENV: &str = "PAKE_DEPTH";

/// Environment variable carrying the inherited output-sync policy.
pub const SYNC_ENV: &str = "PAKE_SYNC_OUTPUT";

/// Options accepted by [`TaskContext::subpake_with`](crate::TaskContext::subpake_with).
#[derive(Debug, Clone, Default)]
pub struct SubpakeOptions {
    /// Spool the child's output while it runs and relay it only on
    /// completion, under one lock acquisition.
    pub collect_output: bool,
    /// Capture output for error reporting but relay nothing, banners
    /// included.
    pub silent: bool,
    /// Return the child's exit code instead of failing on non-zero.
    pub ignore_errors: bool,
    /// Launch the child in this directory.
    pub working_dir: Option<Utf8PathBuf>,
    /// Override the inherited output-sync policy.
    pub sync_output: Option<bool>,
}

/// A sub-build exited non-zero (or failed to start).
#[derive(Debug, Error)]
pub struct SubBuildFailure {
    /// The task that launched the sub-build.
    pub task: String,
    /// Source file of the call site.
    pub file: &'static str,
    /// Line of the call site.
    pub line: u32,
    /// The exact command vector of the child.
    pub cmd: Vec<String>,
    /// Child exit status, or [`SPAWN_FAILED`] when it never started.
    pub code: i32,
    /// The child's combined output.
    pub output: Vec<u8>,
}

impl fmt::Display for SubBuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "sub-build failed in task \"{}\" at {}:{}",
            self.task, self.file, self.line
        )?;
        writeln!(f, "  command: {:?}", self.cmd)?;
        writeln!(f, "  exit status: {}", self.code)?;
        writeln!(f, "  --- captured output ---")?;
        let text = String::from_utf8_lossy(&self.output);
        for line in text.lines() {
            writeln!(f, "  {line}")?;
        }
        write!(f, "  --- end of output ---")
    }
}

/// Everything a sub-build inherits from the parent run.
pub(crate) struct SubBuildEnv<'a> {
    /// The parent's exports, already serialized as one literal mapping.
    pub exports: &'a str,
    pub depth: usize,
    pub sync: bool,
}

fn enter_banner(depth: usize) -> String {
    format!("*** enter subpake[{depth}]:\n")
}

fn exit_banner(depth: usize) -> String {
    format!("*** exit subpake[{depth}]:\n")
}

fn emit_banner(queue: &OutputQueue, text: &str) {
    if queue.synchronized() {
        queue.write(text.as_bytes());
    } else {
        queue.write_banner_unsynced(text);
    }
}

fn failure(
    task: &str,
    site: CallSite,
    cmd: &[String],
    code: i32,
    output: Vec<u8>,
) -> SubBuildFailure {
    SubBuildFailure {
        task: task.to_string(),
        file: site.file,
        line: site.line,
        cmd: cmd.to_vec(),
        code,
        output,
    }
}

/// Runs the child build program to completion and returns its exit code.
///
/// `cmd[0]` is the build file (an executable program); the rest of the
/// vector is passed through on its command line.
pub(crate) fn run(
    task: &str,
    site: CallSite,
    cmd: &[String],
    queue: &OutputQueue,
    env: &SubBuildEnv<'_>,
    opts: &SubpakeOptions,
) -> Result<i32, SubBuildFailure> {
    let fold = |e: std::io::Error| failure(task, site, cmd, SPAWN_FAILED, e.to_string().into_bytes());

    if cmd.is_empty() {
        return Err(failure(task, site, cmd, SPAWN_FAILED, b"empty command".to_vec()));
    }

    let child_depth = env.depth + 1;

    let mut command = Command::new(&cmd[0]);
    command.args(&cmd[1..]);
    command.arg("--stdin-defines");
    command.env(DEPTH_ENV, child_depth.to_string());
    match opts.sync_output {
        Some(sync) => {
            command.args(["--sync-output", if sync { "1" } else { "0" }]);
        }
        None => {
            command.env(SYNC_ENV, if env.sync { "1" } else { "0" });
        }
    }
    if let Some(dir) = &opts.working_dir {
        command.current_dir(dir);
    }

    let stdin = Some(env.exports.as_bytes());

    if opts.silent {
        let finished = process::piped(&mut command, stdin, None).map_err(fold)?;
        return Ok(finished.code);
    }

    if opts.collect_output {
        let (code, mut spool) = process::spooled(&mut command, stdin).map_err(fold)?;

        // One lock acquisition covers both banners and the whole relay.
        {
            use std::io::{Read, Seek, SeekFrom};

            spool.seek(SeekFrom::Start(0)).map_err(fold)?;
            let mut io = queue.lock();
            io.write(enter_banner(child_depth).as_bytes());
            let mut buf = [0u8; process::RELAY_CHUNK];
            loop {
                let n = spool.read(&mut buf).map_err(fold)?;
                if n == 0 {
                    break;
                }
                io.write(&buf[..n]);
            }
            io.write(exit_banner(child_depth).as_bytes());
        }

        if code != 0 {
            let output = process::read_back(&mut spool).map_err(fold)?;
            return Err(failure(task, site, cmd, code, output));
        }
        return Ok(code);
    }

    emit_banner(queue, &enter_banner(child_depth));
    let finished = process::piped(&mut command, stdin, Some(queue)).map_err(fold)?;
    emit_banner(queue, &exit_banner(child_depth));

    if finished.code != 0 {
        return Err(failure(task, site, cmd, finished.code, finished.output));
    }
    Ok(finished.code)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    fn site() -> CallSite {
        CallSite::here()
    }

    /// Writes a tiny shell script standing in for a child build program. It
    /// records its stdin, argv and environment, so the hand-off contract can
    /// be asserted from the outside.
    fn fake_build_file(dir: &TempDir, record: &str) -> String {
        let script = dir.path().join("pakefile.sh");
        let body = format!(
            "#!/bin/sh\ncat > {record}.stdin\nprintf '%s\\n' \"$@\" > {record}.argv\n\
             printf '%s' \"$PAKE_DEPTH\" > {record}.depth\n\
             printf '%s' \"$PAKE_SYNC_OUTPUT\" > {record}.sync\necho child ran\n"
        );
        fs::write(&script, body).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script.to_str().unwrap().to_string()
    }

    #[test]
    fn hands_exports_depth_and_sync_to_the_child() {
        let dir = TempDir::new().unwrap();
        let record = dir.path().join("record").to_str().unwrap().to_string();
        let script = fake_build_file(&dir, &record);

        let queue = OutputQueue::new(true);
        let env = SubBuildEnv {
            exports: "{\"CC\": \"clang\"}",
            depth: 0,
            sync: true,
        };
        let cmd = vec![script, "-D".to_string(), "CC=gcc".to_string()];

        let code = run(
            "deploy",
            site(),
            &cmd,
            &queue,
            &env,
            &SubpakeOptions::default(),
        )
        .unwrap();
        assert_eq!(code, 0);

        assert_eq!(
            fs::read_to_string(format!("{record}.stdin")).unwrap(),
            "{\"CC\": \"clang\"}"
        );
        let argv = fs::read_to_string(format!("{record}.argv")).unwrap();
        assert!(argv.contains("CC=gcc"), "explicit -D pairs pass through");
        assert!(argv.contains("--stdin-defines"));
        assert_eq!(fs::read_to_string(format!("{record}.depth")).unwrap(), "1");
        assert_eq!(fs::read_to_string(format!("{record}.sync")).unwrap(), "1");
    }

    #[test]
    fn banners_bracket_the_child_output() {
        let dir = TempDir::new().unwrap();
        let record = dir.path().join("record").to_str().unwrap().to_string();
        let script = fake_build_file(&dir, &record);

        let queue = OutputQueue::new(true);
        let env = SubBuildEnv {
            exports: "{}",
            depth: 1,
            sync: true,
        };

        run("t", site(), &[script], &queue, &env, &SubpakeOptions::default()).unwrap();

        let text = String::from_utf8(queue.snapshot()).unwrap();
        let enter = text.find("*** enter subpake[2]:").unwrap();
        let body = text.find("child ran").unwrap();
        let exit = text.find("*** exit subpake[2]:").unwrap();
        assert!(enter < body && body < exit);
    }

    #[test]
    fn collected_output_is_relayed_after_completion() {
        let dir = TempDir::new().unwrap();
        let record = dir.path().join("record").to_str().unwrap().to_string();
        let script = fake_build_file(&dir, &record);

        let queue = OutputQueue::new(true);
        let env = SubBuildEnv {
            exports: "{}",
            depth: 0,
            sync: true,
        };
        let opts = SubpakeOptions {
            collect_output: true,
            ..Default::default()
        };

        run("t", site(), &[script], &queue, &env, &opts).unwrap();
        let text = String::from_utf8(queue.snapshot()).unwrap();
        assert!(text.contains("*** enter subpake[1]:"));
        assert!(text.contains("child ran"));
        assert!(text.contains("*** exit subpake[1]:"));
    }

    #[test]
    fn nonzero_child_is_a_structured_failure() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("failing.sh");
        fs::write(&script, "#!/bin/sh\necho doomed\nexit 4\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let queue = OutputQueue::new(true);
        let env = SubBuildEnv {
            exports: "{}",
            depth: 0,
            sync: true,
        };
        let cmd = vec![script.to_str().unwrap().to_string()];

        let err = run("t", site(), &cmd, &queue, &env, &SubpakeOptions::default()).unwrap_err();
        assert_eq!(err.code, 4);
        assert_eq!(err.output, b"doomed\n".to_vec());
        assert_eq!(err.task, "t");
    }

    #[test]
    fn explicit_sync_override_becomes_a_flag() {
        let dir = TempDir::new().unwrap();
        let record = dir.path().join("record").to_str().unwrap().to_string();
        let script = fake_build_file(&dir, &record);

        let queue = OutputQueue::new(true);
        let env = SubBuildEnv {
            exports: "{}",
            depth: 0,
            sync: true,
        };
        let opts = SubpakeOptions {
            sync_output: Some(false),
            ..Default::default()
        };

        run("t", site(), &[script], &queue, &env, &opts).unwrap();
        let argv = fs::read_to_string(format!("{record}.argv")).unwrap();
        assert!(argv.contains("--sync-output"));
    }
}
