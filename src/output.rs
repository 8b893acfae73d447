//! Per-task output queues and the process-wide stdout flush lock.
//!
//! With output synchronization on (the default), everything a task prints,
//! directly or through a subprocess or sub-build, lands in the
//! task's private buffer and reaches stdout as one atomic flush. The flush
//! lock is the only global; it is taken per whole-buffer flush, never per
//! write, so tasks pay for serialization exactly once.
//!
//! With synchronization off, writes go straight through and the task-level
//! lock degrades to a no-op guard; interleaving is the accepted trade.

use std::fmt::Display;
use std::io::Write;
use std::sync::{LazyLock, Mutex, MutexGuard};

/// Serializes whole-buffer flushes and unsynchronized banner emission.
static FLUSH_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

pub(crate) fn executing_banner(task: &str) -> String {
    format!("===== Executing Task: \"{task}\"\n")
}

/// The append-only byte sink owned by one task for the duration of its run.
pub(crate) struct OutputQueue {
    sync: bool,
    buf: Mutex<Vec<u8>>,
}

impl OutputQueue {
    pub fn new(sync: bool) -> Self {
        Self {
            sync,
            buf: Mutex::new(Vec::new()),
        }
    }

    pub fn synchronized(&self) -> bool {
        self.sync
    }

    /// Acquires the queue for writing. All writers go through the returned
    /// guard, which is what makes multi-write sections atomic against the
    /// task's own parallel sub-work.
    pub fn lock(&self) -> IoGuard<'_> {
        if self.sync {
            IoGuard {
                buf: Some(self.buf.lock().unwrap()),
            }
        } else {
            IoGuard { buf: None }
        }
    }

    pub fn write(&self, bytes: &[u8]) {
        self.lock().write(bytes);
    }

    pub fn println(&self, text: impl Display) {
        self.lock().println(text);
    }

    /// Emits the bytes written directly to stdout in unsynchronized mode,
    /// holding the flush lock only for the banner itself.
    pub fn write_banner_unsynced(&self, banner: &str) {
        debug_assert!(!self.sync);
        let _flush = FLUSH_LOCK.lock().unwrap();
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(banner.as_bytes());
        let _ = stdout.flush();
    }

    /// Flushes the accumulated buffer to stdout as a single unit. A `None`
    /// banner means the task was skipped; nothing at all is printed unless
    /// the task produced output anyway.
    pub fn flush_to_stdout(&self, banner: Option<&str>) {
        if !self.sync {
            return;
        }

        let bytes = std::mem::take(&mut *self.buf.lock().unwrap());
        if bytes.is_empty() && banner.is_none() {
            return;
        }

        let _flush = FLUSH_LOCK.lock().unwrap();
        let mut stdout = std::io::stdout();
        if let Some(banner) = banner {
            let _ = stdout.write_all(banner.as_bytes());
        }
        let _ = stdout.write_all(&bytes);
        let _ = stdout.flush();
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }
}

/// Write access to a task's queue; holds the buffer lock in synchronized
/// mode and is a transparent pass-through otherwise.
pub struct IoGuard<'a> {
    buf: Option<MutexGuard<'a, Vec<u8>>>,
}

impl IoGuard<'_> {
    pub fn write(&mut self, bytes: &[u8]) {
        match &mut self.buf {
            Some(buf) => buf.extend_from_slice(bytes),
            None => {
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(bytes);
                let _ = stdout.flush();
            }
        }
    }

    pub fn println(&mut self, text: impl Display) {
        self.write(format!("{text}\n").as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_accumulate_in_order() {
        let queue = OutputQueue::new(true);
        queue.println("first");
        queue.write(b"second");
        assert_eq!(queue.snapshot(), b"first\nsecond".to_vec());
    }

    #[test]
    fn guard_groups_writes() {
        let queue = OutputQueue::new(true);
        {
            let mut io = queue.lock();
            io.write(b"a");
            io.write(b"b");
        }
        assert_eq!(queue.snapshot(), b"ab".to_vec());
    }

    #[test]
    fn flush_drains_the_buffer() {
        let queue = OutputQueue::new(true);
        queue.write(b"gone");
        queue.flush_to_stdout(None);
        assert!(queue.snapshot().is_empty());
    }

    #[test]
    fn unsynced_guard_is_noop() {
        let queue = OutputQueue::new(false);
        let guard = queue.lock();
        assert!(guard.buf.is_none());
    }
}
