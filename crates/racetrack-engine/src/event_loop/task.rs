//! Task structure and execution status

use super::event_loop::LoopCore;
use super::handle::IoHandle;
use crate::error::LoopError;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Status of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created, not yet handed to a loop
    Pending,
    /// Accepted by the task queue
    Scheduled,
    /// Executing on the processing thread
    Running,
    /// Ran with `RunMode::Ready`
    Completed,
    /// Ran with `RunMode::Canceled`, or dropped without running
    Canceled,
}

impl TaskStatus {
    /// Completed or Canceled
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Canceled)
    }
}

/// Why a task callback is being invoked
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Normal execution on a running loop
    Ready,
    /// The loop stopped before the task could run; only cleanup is expected
    Canceled,
}

type TaskFn = Box<dyn FnOnce(&mut TaskContext<'_>, RunMode) + Send + 'static>;

struct TaskShared {
    id: TaskId,
    name: String,
    status: Mutex<TaskStatus>,
    /// Signalled when the task reaches a terminal status
    finished: Condvar,
}

impl TaskShared {
    fn set_status(&self, status: TaskStatus) {
        let mut current = self.status.lock();
        *current = status;
        if status.is_terminal() {
            self.finished.notify_all();
        }
    }
}

/// A deferred unit of work executed on the loop's processing thread.
///
/// Whatever the callback needs is moved into the closure, so the loop owns it
/// until the task finishes.
pub struct Task {
    shared: Arc<TaskShared>,
    func: Option<TaskFn>,
}

impl Task {
    /// Create a task with a descriptive name
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: FnOnce(&mut TaskContext<'_>, RunMode) + Send + 'static,
    {
        Self {
            shared: Arc::new(TaskShared {
                id: TaskId::new(),
                name: name.into(),
                status: Mutex::new(TaskStatus::Pending),
                finished: Condvar::new(),
            }),
            func: Some(Box::new(func)),
        }
    }

    /// Task identifier
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current status
    pub fn status(&self) -> TaskStatus {
        *self.shared.status.lock()
    }

    /// Observer handle that outlives the task itself
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn mark_scheduled(&self) {
        self.shared.set_status(TaskStatus::Scheduled);
    }

    /// Invoke the callback once and record the terminal status
    pub(crate) fn run(mut self, ctx: &mut TaskContext<'_>) {
        let Some(func) = self.func.take() else {
            return;
        };
        let mode = ctx.mode;
        self.shared.set_status(TaskStatus::Running);
        func(ctx, mode);
        self.shared.set_status(match mode {
            RunMode::Ready => TaskStatus::Completed,
            RunMode::Canceled => TaskStatus::Canceled,
        });
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.func.is_some() {
            self.shared.set_status(TaskStatus::Canceled);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

/// Observer for a task's status
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    /// Task identifier
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current status
    pub fn status(&self) -> TaskStatus {
        *self.shared.status.lock()
    }

    /// Block until the task is terminal or `timeout` elapses; returns the
    /// status observed last
    pub fn wait_timeout(&self, timeout: Duration) -> TaskStatus {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        while !status.is_terminal() {
            if self
                .shared
                .finished
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                break;
            }
        }
        *status
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

/// What a running task may do with its loop.
///
/// Only handed out on the processing thread (or during destroy, after that
/// thread has exited), which makes it the single place handle metadata can be
/// torn down.
pub struct TaskContext<'a> {
    core: &'a LoopCore,
    mode: RunMode,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(core: &'a LoopCore, mode: RunMode) -> Self {
        Self { core, mode }
    }

    /// Why this task is running
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// True when the loop is being torn down
    pub fn is_canceled(&self) -> bool {
        self.mode == RunMode::Canceled
    }

    /// Tear down the handle's metadata and stop readiness notifications
    pub fn unsubscribe(&mut self, handle: IoHandle) -> Result<(), LoopError> {
        self.core.unsubscribe(handle)
    }

    /// Queue another task behind the current one
    pub fn schedule_now(&mut self, task: Task) -> Result<TaskHandle, LoopError> {
        self.core.schedule(task, None)
    }

    /// Clock reading in nanoseconds
    pub fn current_clock_time(&self) -> u64 {
        self.core.current_clock_time()
    }
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_unique() {
        let ids: Vec<_> = (0..100).map(|_| TaskId::new()).collect();
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                assert_ne!(ids[i], ids[j]);
            }
        }
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new("noop", |_, _| {});
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.name(), "noop");
    }

    #[test]
    fn test_dropped_task_is_canceled() {
        let task = Task::new("dropped", |_, _| panic!("must not run"));
        let handle = task.handle();
        task.mark_scheduled();
        assert_eq!(handle.status(), TaskStatus::Scheduled);
        drop(task);
        assert_eq!(handle.status(), TaskStatus::Canceled);
        assert_eq!(handle.wait_timeout(Duration::from_millis(1)), TaskStatus::Canceled);
    }

    #[test]
    fn test_wait_timeout_on_pending_task() {
        let task = Task::new("idle", |_, _| {});
        let handle = task.handle();
        assert_eq!(handle.wait_timeout(Duration::from_millis(5)), TaskStatus::Pending);
        drop(task);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Scheduled.is_terminal());
    }
}
