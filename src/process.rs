//! Launching external commands on behalf of a task.
//!
//! All invocation modes merge stderr into stdout and capture the combined
//! stream for error reporting. The default mode relays output into the
//! task's queue chunk by chunk as it arrives; with `collect_output` the
//! stream is spooled into an anonymous temp file while the process runs and
//! relayed afterwards under a single queue-lock acquisition, so siblings
//! running in parallel never hold the task's lock for the lifetime of a
//! process.
//!
//! A non-zero exit becomes a [`SubprocessFailure`] carrying the call site,
//! the exact command vector, the status and the captured output. Spawn
//! failures travel in the same type with a negative status, so one error
//! shape covers the whole boundary.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::output::OutputQueue;

pub(crate) const RELAY_CHUNK: usize = 8192;

/// Exit status reported when the command could not be spawned at all.
pub const SPAWN_FAILED: i32 = -1;

/// Options accepted by [`TaskContext::call_with`](crate::TaskContext::call_with).
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Spool output while the process runs and relay it only on completion.
    pub collect_output: bool,
    /// Capture output for error reporting but never relay it.
    pub silent: bool,
    /// Echo the command line into the task's output before launching.
    pub print_cmd: bool,
    /// Return the exit status instead of failing on non-zero.
    pub ignore_errors: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            collect_output: false,
            silent: false,
            print_cmd: true,
            ignore_errors: false,
        }
    }
}

/// A subprocess exited non-zero (or failed to start).
#[derive(Debug, Error)]
pub struct SubprocessFailure {
    /// The task that made the call.
    pub task: String,
    /// Source file of the call site.
    pub file: &'static str,
    /// Line of the call site.
    pub line: u32,
    /// The exact command vector.
    pub cmd: Vec<String>,
    /// Exit status, or [`SPAWN_FAILED`] when the process never started.
    pub code: i32,
    /// The merged stdout/stderr bytes captured from the process.
    pub output: Vec<u8>,
}

impl fmt::Display for SubprocessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "subprocess failed in task \"{}\" at {}:{}",
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

/// Call-site coordinates captured through `#[track_caller]`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl CallSite {
    #[track_caller]
    pub fn here() -> Self {
        let location = std::panic::Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
        }
    }
}

/// How the merged output stream is routed while the process runs.
pub(crate) enum Relay<'a> {
    /// Chunks reach the task queue as they arrive.
    Stream(&'a OutputQueue),
    /// Spool while running, relay under one lock on completion.
    Collect(&'a OutputQueue),
    /// Capture only; nothing reaches the queue.
    Quiet,
}

#[derive(Debug)]
pub(crate) struct Finished {
    pub code: i32,
    pub output: Vec<u8>,
}

/// Spawns `command` with both output streams merged into one pipe and
/// relays chunks into `queue` as they arrive. `stdin` is written to the
/// child before the read loop starts and the handle is closed right after.
pub(crate) fn piped(
    command: &mut Command,
    stdin: Option<&[u8]>,
    queue: Option<&OutputQueue>,
) -> std::io::Result<Finished> {
    let (mut reader, writer) = os_pipe::pipe()?;
    let writer_err = writer.try_clone()?;
    command.stdout(Stdio::from(writer));
    command.stderr(Stdio::from(writer_err));
    command.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    // Spawning takes the write ends; the read loop below sees EOF once the
    // child closes its copies.
    let mut child = command.spawn()?;

    if let Some(payload) = stdin {
        use std::io::Write;
        let mut handle = child.stdin.take().expect("stdin was piped");
        handle.write_all(payload)?;
        drop(handle);
    }

    let mut output = Vec::new();
    let mut buf = [0u8; RELAY_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        output.extend_from_slice(&buf[..n]);
        if let Some(queue) = queue {
            queue.write(&buf[..n]);
        }
    }

    let status = child.wait()?;
    Ok(Finished {
        code: status.code().unwrap_or(SPAWN_FAILED),
        output,
    })
}

/// Spawns `command` with both output streams appending to one anonymous
/// spool file (which is what merges them), waits, and hands the spool back.
pub(crate) fn spooled(command: &mut Command, stdin: Option<&[u8]>) -> std::io::Result<(i32, File)> {
    let spool = tempfile::tempfile()?;
    command.stdout(Stdio::from(spool.try_clone()?));
    command.stderr(Stdio::from(spool.try_clone()?));
    command.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = command.spawn()?;
    if let Some(payload) = stdin {
        use std::io::Write;
        let mut handle = child.stdin.take().expect("stdin was piped");
        handle.write_all(payload)?;
        drop(handle);
    }

    let status = child.wait()?;
    Ok((status.code().unwrap_or(SPAWN_FAILED), spool))
}

fn failure(task: &str, site: CallSite, cmd: &[String], code: i32, output: Vec<u8>) -> SubprocessFailure {
    SubprocessFailure {
        task: task.to_string(),
        file: site.file,
        line: site.line,
        cmd: cmd.to_vec(),
        code,
        output,
    }
}

/// Runs `cmd` to completion with the given relay discipline.
///
/// Returns the finished status and captured output; every failure to spawn
/// or wait is folded into a [`SubprocessFailure`] so callers see one error
/// shape.
pub(crate) fn run(
    task: &str,
    site: CallSite,
    cmd: &[String],
    relay: Relay<'_>,
    cwd: Option<&Utf8Path>,
) -> Result<Finished, SubprocessFailure> {
    let fold = |e: std::io::Error| failure(task, site, cmd, SPAWN_FAILED, e.to_string().into_bytes());

    if cmd.is_empty() {
        return Err(failure(task, site, cmd, SPAWN_FAILED, b"empty command".to_vec()));
    }

    let mut command = Command::new(&cmd[0]);
    command.args(&cmd[1..]);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    match relay {
        Relay::Collect(queue) => {
            let (code, mut spool) = spooled(&mut command, None).map_err(fold)?;
            relay_spool(queue, &mut spool).map_err(fold)?;
            let output = read_back(&mut spool).map_err(fold)?;
            Ok(Finished { code, output })
        }
        Relay::Stream(queue) => piped(&mut command, None, Some(queue)).map_err(fold),
        Relay::Quiet => piped(&mut command, None, None).map_err(fold),
    }
}

/// Copies the spool into the queue in bounded chunks under one lock
/// acquisition.
pub(crate) fn relay_spool(queue: &OutputQueue, spool: &mut File) -> std::io::Result<()> {
    spool.seek(SeekFrom::Start(0))?;
    let mut io = queue.lock();
    let mut buf = [0u8; RELAY_CHUNK];
    loop {
        let n = spool.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        io.write(&buf[..n]);
    }
}

pub(crate) fn read_back(spool: &mut File) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    spool.seek(SeekFrom::Start(0))?;
    spool.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// One command-line element before flattening: either a single argument or
/// an already-expanded list (a task's inputs or outputs, typically).
///
/// Flattening is one level deep and strings are never iterated into
/// characters; this is the single place where that rule lives.
pub struct CmdArg(Vec<String>);

impl CmdArg {
    pub fn append_to(self, args: &mut Vec<String>) {
        args.extend(self.0);
    }
}

impl From<&str> for CmdArg {
    fn from(s: &str) -> Self {
        CmdArg(vec![s.to_string()])
    }
}

impl From<String> for CmdArg {
    fn from(s: String) -> Self {
        CmdArg(vec![s])
    }
}

impl From<&String> for CmdArg {
    fn from(s: &String) -> Self {
        CmdArg(vec![s.clone()])
    }
}

impl From<&Utf8Path> for CmdArg {
    fn from(p: &Utf8Path) -> Self {
        CmdArg(vec![p.to_string()])
    }
}

impl From<Utf8PathBuf> for CmdArg {
    fn from(p: Utf8PathBuf) -> Self {
        CmdArg(vec![p.into_string()])
    }
}

impl From<&Utf8PathBuf> for CmdArg {
    fn from(p: &Utf8PathBuf) -> Self {
        CmdArg(vec![p.to_string()])
    }
}

impl From<Vec<String>> for CmdArg {
    fn from(v: Vec<String>) -> Self {
        CmdArg(v)
    }
}

impl From<&[String]> for CmdArg {
    fn from(v: &[String]) -> Self {
        CmdArg(v.to_vec())
    }
}

impl From<&Vec<String>> for CmdArg {
    fn from(v: &Vec<String>) -> Self {
        CmdArg(v.clone())
    }
}

impl From<Vec<Utf8PathBuf>> for CmdArg {
    fn from(v: Vec<Utf8PathBuf>) -> Self {
        CmdArg(v.into_iter().map(Utf8PathBuf::into_string).collect())
    }
}

impl From<&[Utf8PathBuf]> for CmdArg {
    fn from(v: &[Utf8PathBuf]) -> Self {
        CmdArg(v.iter().map(ToString::to_string).collect())
    }
}

impl From<&Vec<Utf8PathBuf>> for CmdArg {
    fn from(v: &Vec<Utf8PathBuf>) -> Self {
        CmdArg(v.iter().map(ToString::to_string).collect())
    }
}

/// Anything the subprocess entry points accept as a full command line.
pub trait IntoArgs {
    fn into_args(self) -> Vec<String>;
}

impl IntoArgs for Vec<String> {
    fn into_args(self) -> Vec<String> {
        self
    }
}

impl IntoArgs for &[String] {
    fn into_args(self) -> Vec<String> {
        self.to_vec()
    }
}

impl<const N: usize> IntoArgs for [&str; N] {
    fn into_args(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

impl IntoArgs for &[&str] {
    fn into_args(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

impl IntoArgs for Vec<&str> {
    fn into_args(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

/// Builds a flattened command vector from heterogeneous parts.
///
/// ```rust,ignore
/// let cmd = pake::args!["cc", "-c", ctx.outdated_inputs(), "-o", out];
/// ```
#[macro_export]
macro_rules! args {
    ($($part:expr),* $(,)?) => {{
        let mut parts: ::std::vec::Vec<::std::string::String> = ::std::vec::Vec::new();
        $( $crate::process::CmdArg::from($part).append_to(&mut parts); )*
        parts
    }};
}
