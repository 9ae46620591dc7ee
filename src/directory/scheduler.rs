//! Close Scheduler
//!
//! One background thread running deferred tasks at their deadlines.
//! Directories use it for grace-period timers; the cache uses it for
//! delayed releases after LOG_COMPACT.
//!
//! ```text
//!   schedule(deadline, task) ──► [ channel ] ──► thread: min-heap by deadline
//!                                                   │
//!                                       recv_deadline(earliest)
//!                                                   │
//!                                             run due tasks
//! ```
//!
//! Tasks hold weak references to their targets, so a pending timer never
//! keeps a directory alive.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Schedule(Instant, Task),
    Shutdown,
}

struct Pending {
    deadline: Instant,
    seq: u64,
    task: Task,
}

// Reversed so BinaryHeap pops the earliest deadline first
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Pending {}

/// Deadline-ordered task runner on a dedicated thread
pub(crate) struct CloseScheduler {
    tx: Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl CloseScheduler {
    /// Spawn the scheduler thread
    pub(crate) fn start(name: &str) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(rx))?;
        let thread_id = handle.thread().id();

        Ok(Self {
            tx,
            handle: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    /// Run `task` once `deadline` has passed
    pub(crate) fn schedule(&self, deadline: Instant, task: Task) {
        if self.tx.send(Command::Schedule(deadline, task)).is_err() {
            debug!("close scheduler stopped; task dropped");
        }
    }

    /// Run `f` after `delay`
    pub(crate) fn schedule_after<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Instant::now() + delay, Box::new(f));
    }
}

impl Drop for CloseScheduler {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);

        // The last owner can be a task running on the scheduler thread itself
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("close scheduler thread panicked");
            }
        }
    }
}

fn run(rx: Receiver<Command>) {
    let mut heap: BinaryHeap<Pending> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let now = Instant::now();
        while heap.peek().map_or(false, |p| p.deadline <= now) {
            if let Some(pending) = heap.pop() {
                if panic::catch_unwind(AssertUnwindSafe(pending.task)).is_err() {
                    warn!("scheduled task panicked");
                }
            }
        }

        let command = match heap.peek() {
            Some(next) => match rx.recv_deadline(next.deadline) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            Command::Schedule(deadline, task) => {
                seq += 1;
                heap.push(Pending {
                    deadline,
                    seq,
                    task,
                });
            }
            Command::Shutdown => break,
        }
    }

    debug!(pending = heap.len(), "close scheduler stopped");
}
