//! Task queue shared by submitters and the processing thread
//!
//! Every mutation (schedule, stop request, drain, final close) goes through one
//! lock. The loop's run state lives under the same lock so "is the loop still
//! accepting work" and "push the task" are a single step.

use super::task::Task;
use crate::error::LoopError;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Lifecycle of an event loop
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    /// Constructed, processing thread not started
    Created,
    /// Processing thread is dispatching
    Running,
    /// A stop was accepted; the processing thread has not exited yet
    StopRequested,
    /// Processing thread exited (or never started)
    Stopped,
    /// Loop resources released
    Destroyed,
}

impl RunState {
    /// New work is rejected in this state
    pub fn rejects_work(self) -> bool {
        matches!(self, RunState::Stopped | RunState::Destroyed)
    }
}

/// A task plus the clock time it may run at (`None` = as soon as possible)
pub(crate) struct Submission {
    pub(crate) task: Task,
    pub(crate) run_at: Option<u64>,
}

/// Result of a stop request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum StopRequest {
    /// Running → StopRequested; the processing thread must be woken
    Requested,
    /// The loop never ran and is now Stopped
    StoppedIdle,
    /// Some earlier call already stopped (or is stopping) the loop
    AlreadyStopping,
}

struct QueueInner {
    state: RunState,
    pending: VecDeque<Submission>,
}

pub(crate) struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                state: RunState::Created,
                pending: VecDeque::new(),
            }),
        }
    }

    pub(crate) fn state(&self) -> RunState {
        self.inner.lock().state
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Append a submission unless the loop has stopped
    pub(crate) fn submit(&self, submission: Submission) -> Result<(), LoopError> {
        let mut inner = self.inner.lock();
        if inner.state.rejects_work() {
            return Err(LoopError::LoopStopped);
        }
        submission.task.mark_scheduled();
        inner.pending.push_back(submission);
        Ok(())
    }

    /// Created → Running
    pub(crate) fn start(&self) -> Result<(), LoopError> {
        let mut inner = self.inner.lock();
        match inner.state {
            RunState::Created => {
                inner.state = RunState::Running;
                Ok(())
            }
            RunState::Running | RunState::StopRequested => Err(LoopError::AlreadyRunning),
            RunState::Stopped | RunState::Destroyed => Err(LoopError::LoopStopped),
        }
    }

    /// Undo `start` when the processing thread could not be spawned
    pub(crate) fn abort_start(&self) {
        let mut inner = self.inner.lock();
        if inner.state == RunState::Running {
            inner.state = RunState::Created;
        }
    }

    pub(crate) fn request_stop(&self) -> StopRequest {
        let mut inner = self.inner.lock();
        match inner.state {
            RunState::Running => {
                inner.state = RunState::StopRequested;
                StopRequest::Requested
            }
            RunState::Created => {
                inner.state = RunState::Stopped;
                StopRequest::StoppedIdle
            }
            RunState::StopRequested | RunState::Stopped | RunState::Destroyed => {
                StopRequest::AlreadyStopping
            }
        }
    }

    /// Move every pending submission into `out`; returns true once the loop
    /// has left Running (stop requested, or torn down underneath the thread)
    pub(crate) fn drain_into(&self, out: &mut VecDeque<Submission>) -> bool {
        let mut inner = self.inner.lock();
        out.extend(inner.pending.drain(..));
        inner.state >= RunState::StopRequested
    }

    /// Mark the loop Stopped and hand back whatever is still queued.
    ///
    /// Anything submitted before this call is returned; anything after is
    /// rejected with `LoopStopped`.
    pub(crate) fn close(&self) -> Vec<Submission> {
        let mut inner = self.inner.lock();
        if inner.state < RunState::Stopped {
            inner.state = RunState::Stopped;
        }
        inner.pending.drain(..).collect()
    }

    /// Stopped → Destroyed; returns leftovers
    pub(crate) fn destroy(&self) -> Vec<Submission> {
        let mut inner = self.inner.lock();
        inner.state = RunState::Destroyed;
        inner.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::TaskStatus;
    use std::sync::Arc;
    use std::thread;

    fn submission(name: &str) -> Submission {
        Submission {
            task: Task::new(name, |_, _| {}),
            run_at: None,
        }
    }

    #[test]
    fn test_submit_marks_scheduled() {
        let queue = TaskQueue::new();
        let sub = submission("a");
        let handle = sub.task.handle();
        queue.submit(sub).unwrap();
        assert_eq!(handle.status(), TaskStatus::Scheduled);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let queue = TaskQueue::new();
        assert_eq!(queue.state(), RunState::Created);
        queue.start().unwrap();
        assert!(matches!(queue.start(), Err(LoopError::AlreadyRunning)));
        assert_eq!(queue.request_stop(), StopRequest::Requested);
        assert_eq!(queue.request_stop(), StopRequest::AlreadyStopping);
        assert_eq!(queue.state(), RunState::StopRequested);
        queue.close();
        assert_eq!(queue.state(), RunState::Stopped);
        assert!(matches!(queue.start(), Err(LoopError::LoopStopped)));
    }

    #[test]
    fn test_stop_before_run() {
        let queue = TaskQueue::new();
        assert_eq!(queue.request_stop(), StopRequest::StoppedIdle);
        assert_eq!(queue.state(), RunState::Stopped);
    }

    #[test]
    fn test_submit_after_close_is_rejected() {
        let queue = TaskQueue::new();
        queue.start().unwrap();
        queue.submit(submission("before")).unwrap();
        let leftovers = queue.close();
        assert_eq!(leftovers.len(), 1);

        let late = submission("late");
        let handle = late.task.handle();
        assert!(matches!(queue.submit(late), Err(LoopError::LoopStopped)));
        // rejected task is dropped without running
        assert_eq!(handle.status(), TaskStatus::Canceled);
    }

    #[test]
    fn test_drain_reports_stop() {
        let queue = TaskQueue::new();
        queue.start().unwrap();
        queue.submit(submission("x")).unwrap();
        let mut out = VecDeque::new();
        assert!(!queue.drain_into(&mut out));
        assert_eq!(out.len(), 1);
        queue.request_stop();
        assert!(queue.drain_into(&mut out));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_drain_reports_destroy_while_running() {
        let queue = TaskQueue::new();
        queue.start().unwrap();
        let mut out = VecDeque::new();
        assert!(!queue.drain_into(&mut out));
        // destroyed from the processing thread without a prior stop
        queue.destroy();
        assert!(queue.drain_into(&mut out));
    }

    #[test]
    fn test_concurrent_submitters_keep_per_thread_order() {
        let queue = Arc::new(TaskQueue::new());
        queue.start().unwrap();

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        queue.submit(submission(&format!("{t}:{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let mut out = VecDeque::new();
        queue.drain_into(&mut out);
        assert_eq!(out.len(), 800);

        let mut next = [0usize; 4];
        for sub in &out {
            let (t, i) = sub.task.name().split_once(':').unwrap();
            let (t, i): (usize, usize) = (t.parse().unwrap(), i.parse().unwrap());
            assert_eq!(next[t], i, "thread {t} order broken");
            next[t] += 1;
        }
    }

    #[test]
    fn test_concurrent_stop_requests_accept_exactly_one() {
        let queue = Arc::new(TaskQueue::new());
        queue.start().unwrap();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.request_stop())
            })
            .collect();
        let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        let accepted = results
            .iter()
            .filter(|r| **r == StopRequest::Requested)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(queue.state(), RunState::StopRequested);
    }
}
