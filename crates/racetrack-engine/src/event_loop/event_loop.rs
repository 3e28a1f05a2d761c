//! The event loop: lifecycle, public operations, and the processing thread
//!
//! One processing thread owns the poller and runs a single loop: wait for
//! readiness (or a wakeup), drain the task queue, dispatch readiness events,
//! fire due timers, run ready tasks. Every other thread only touches the task
//! queue, the handle table, and the clock.

use super::clock::Clock;
use super::handle::{EventMask, HandleTable, IoEvent, IoHandle};
use super::queue::{RunState, StopRequest, Submission, TaskQueue};
use super::task::{RunMode, Task, TaskContext, TaskHandle};
use crate::error::LoopError;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Token reserved for the cross-thread waker
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Default number of readiness events fetched per poll
const DEFAULT_EVENT_CAPACITY: usize = 1024;

// ============================================================================
// Options and statistics
// ============================================================================

/// Construction options for an event loop
#[derive(Debug, Clone)]
pub struct EventLoopOptions {
    /// Readiness events fetched per poll
    pub event_capacity: usize,
    /// Name given to the processing thread
    pub thread_name: String,
}

impl Default for EventLoopOptions {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            thread_name: "racetrack-loop".to_string(),
        }
    }
}

/// Event loop statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Tasks run with `RunMode::Ready`
    pub tasks_run: u64,
    /// Tasks run with `RunMode::Canceled`
    pub tasks_canceled: u64,
    /// Readiness callbacks invoked
    pub events_dispatched: u64,
    /// Readiness events dropped because the handle had no live metadata
    pub events_dropped: u64,
    /// Calls to `stop`
    pub stop_requests: u64,
    /// Successful subscriptions
    pub subscribes: u64,
    /// Successful unsubscriptions
    pub unsubscribes: u64,
}

#[derive(Default)]
struct Counters {
    tasks_run: AtomicU64,
    tasks_canceled: AtomicU64,
    events_dispatched: AtomicU64,
    events_dropped: AtomicU64,
    stop_requests: AtomicU64,
    subscribes: AtomicU64,
    unsubscribes: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn snapshot(&self) -> LoopStats {
        let load = |c: &AtomicU64| c.load(AtomicOrdering::Relaxed);
        LoopStats {
            tasks_run: load(&self.tasks_run),
            tasks_canceled: load(&self.tasks_canceled),
            events_dispatched: load(&self.events_dispatched),
            events_dropped: load(&self.events_dropped),
            stop_requests: load(&self.stop_requests),
            subscribes: load(&self.subscribes),
            unsubscribes: load(&self.unsubscribes),
        }
    }
}

/// What `destroy` had to clean up
#[derive(Debug, Clone, Default)]
pub struct DestroyReport {
    /// Tasks still queued at destroy, run once with `RunMode::Canceled`
    pub tasks_canceled: usize,
    /// Handle metadata still present after canceled tasks ran
    pub handles_reclaimed: usize,
    /// Final statistics
    pub stats: LoopStats,
}

// ============================================================================
// Shared core
// ============================================================================

/// State shared between callers and the processing thread
pub(crate) struct LoopCore {
    clock: Arc<dyn Clock>,
    queue: TaskQueue,
    handles: HandleTable,
    registry: Registry,
    waker: Waker,
    /// Held by the processing thread around each readiness callback; `stop`
    /// passes through it so no callback starts after `stop` returns
    dispatch_gate: Mutex<()>,
    counters: Counters,
    loop_thread: OnceLock<ThreadId>,
}

impl LoopCore {
    pub(crate) fn current_clock_time(&self) -> u64 {
        self.clock.now_nanos()
    }

    pub(crate) fn schedule(&self, task: Task, run_at: Option<u64>) -> Result<TaskHandle, LoopError> {
        let handle = task.handle();
        self.queue.submit(Submission { task, run_at })?;
        self.wake();
        Ok(handle)
    }

    pub(crate) fn unsubscribe(&self, handle: IoHandle) -> Result<(), LoopError> {
        let result = self.handles.unsubscribe(&self.registry, handle);
        if !matches!(result, Err(LoopError::NotSubscribed(_))) {
            Counters::bump(&self.counters.unsubscribes);
        }
        result
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake event loop thread");
        }
    }

    fn run_task(&self, task: Task, mode: RunMode) {
        trace!(task = task.name(), id = task.id().as_u64(), ?mode, "running task");
        let mut ctx = TaskContext::new(self, mode);
        task.run(&mut ctx);
        match mode {
            RunMode::Ready => Counters::bump(&self.counters.tasks_run),
            RunMode::Canceled => Counters::bump(&self.counters.tasks_canceled),
        }
    }

    fn is_loop_thread(&self) -> bool {
        self.loop_thread.get() == Some(&thread::current().id())
    }
}

// ============================================================================
// Timers
// ============================================================================

/// Deferred task entry (min-heap by run_at, then submission order)
struct TimerEntry {
    run_at: u64,
    seq: u64,
    task: Task,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reverse for min-heap
        (other.run_at, other.seq).cmp(&(self.run_at, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

// ============================================================================
// EventLoop
// ============================================================================

/// A shared I/O event loop with one processing thread.
///
/// All operations take `&self`; the loop is meant to be owned by one driver
/// and borrowed by every thread that uses it.
pub struct EventLoop {
    core: Arc<LoopCore>,
    options: EventLoopOptions,
    /// Moved into the processing thread by `run`
    poll: Mutex<Option<Poll>>,
    thread: Mutex<Option<JoinHandle<Vec<Submission>>>>,
    /// Tasks the processing thread handed back on exit
    leftovers: Mutex<Vec<Submission>>,
    destroyed: AtomicBool,
}

impl EventLoop {
    /// Create a loop reading time from `clock`, with default options
    pub fn new<C: Clock + 'static>(clock: C) -> Result<Self, LoopError> {
        Self::with_options(Arc::new(clock), EventLoopOptions::default())
    }

    /// Create a loop with explicit options
    pub fn with_options(clock: Arc<dyn Clock>, options: EventLoopOptions) -> Result<Self, LoopError> {
        let poll = Poll::new().map_err(LoopError::Allocation)?;
        let registry = poll.registry().try_clone().map_err(LoopError::Allocation)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(LoopError::Allocation)?;

        let core = Arc::new(LoopCore {
            clock,
            queue: TaskQueue::new(),
            handles: HandleTable::new(),
            registry,
            waker,
            dispatch_gate: Mutex::new(()),
            counters: Counters::default(),
            loop_thread: OnceLock::new(),
        });

        Ok(Self {
            core,
            options,
            poll: Mutex::new(Some(poll)),
            thread: Mutex::new(None),
            leftovers: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Start the processing thread.
    pub fn run(&self) -> Result<(), LoopError> {
        self.core.queue.start()?;

        let Some(poll) = self.poll.lock().take() else {
            self.core.queue.abort_start();
            return Err(LoopError::AlreadyRunning);
        };

        let core = self.core.clone();
        let capacity = self.options.event_capacity.max(1);
        let spawned = thread::Builder::new()
            .name(self.options.thread_name.clone())
            .spawn(move || processing_loop(core, poll, capacity));

        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                info!(thread = %self.options.thread_name, "event loop running");
                Ok(())
            }
            Err(e) => {
                // The poller went down with the closure; this loop can never run
                error!(error = %e, "failed to spawn event loop thread");
                self.core.queue.close();
                Err(LoopError::ThreadLifecycle(e.to_string()))
            }
        }
    }

    /// Ask the processing thread to stop. Safe to call from any thread, any
    /// number of times; every call succeeds.
    pub fn stop(&self) -> Result<(), LoopError> {
        Counters::bump(&self.core.counters.stop_requests);
        match self.core.queue.request_stop() {
            StopRequest::Requested => {
                debug!("stop requested");
                self.core.wake();
            }
            StopRequest::StoppedIdle => debug!("stopped before running"),
            StopRequest::AlreadyStopping => trace!("stop already in progress"),
        }
        // Wait out a callback already in flight; from the loop thread the
        // next event check sees the new state
        if !self.core.is_loop_thread() {
            drop(self.core.dispatch_gate.lock());
        }
        Ok(())
    }

    /// Block until the processing thread has exited. Call `stop` first.
    pub fn wait_for_stop_completion(&self) -> Result<(), LoopError> {
        if self.core.is_loop_thread() {
            return Err(LoopError::WrongThread);
        }
        if self.core.queue.state() == RunState::Running {
            return Err(LoopError::AlreadyRunning);
        }

        let Some(handle) = self.thread.lock().take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(leftovers) => {
                self.leftovers.lock().extend(leftovers);
                Ok(())
            }
            Err(_) => Err(LoopError::ThreadLifecycle(
                "event loop thread panicked".to_string(),
            )),
        }
    }

    /// Clock reading in nanoseconds. Lock-free; any thread.
    pub fn current_clock_time(&self) -> u64 {
        self.core.current_clock_time()
    }

    /// Register for readiness events on `handle`.
    ///
    /// The handle's metadata exists before the poller can report anything
    /// for it. Subscribing an already-subscribed handle fails with
    /// `AlreadyRegistered`.
    pub fn subscribe<F>(&self, handle: IoHandle, mask: EventMask, callback: F) -> Result<(), LoopError>
    where
        F: FnMut(&IoEvent<'_>) + Send + 'static,
    {
        if self.core.queue.state().rejects_work() {
            return Err(LoopError::LoopStopped);
        }
        self.core.handles.subscribe(
            &self.core.registry,
            handle,
            mask,
            self.core.current_clock_time(),
            Box::new(callback),
        )?;
        Counters::bump(&self.core.counters.subscribes);
        Ok(())
    }

    /// Queue `task` to run as soon as possible on the processing thread.
    pub fn schedule_now(&self, task: Task) -> Result<TaskHandle, LoopError> {
        self.core.schedule(task, None)
    }

    /// Queue `task` to run once the loop clock reaches `run_at` nanoseconds.
    pub fn schedule_at(&self, task: Task, run_at: u64) -> Result<TaskHandle, LoopError> {
        self.core.schedule(task, Some(run_at))
    }

    /// Current lifecycle state
    pub fn state(&self) -> RunState {
        if self.destroyed.load(AtomicOrdering::Acquire) {
            return RunState::Destroyed;
        }
        self.core.queue.state()
    }

    /// True when called from within a task or readiness callback
    pub fn is_on_processing_thread(&self) -> bool {
        self.core.is_loop_thread()
    }

    /// True while `handle` has metadata in this loop
    pub fn is_subscribed(&self, handle: IoHandle) -> bool {
        self.core.handles.contains(handle)
    }

    /// Number of handles with metadata
    pub fn subscribed_count(&self) -> usize {
        self.core.handles.len()
    }

    /// Submissions not yet picked up by the processing thread
    pub fn pending_tasks(&self) -> usize {
        self.core.queue.len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> LoopStats {
        self.core.counters.snapshot()
    }

    /// Stop, join the processing thread, run leftover tasks as canceled, and
    /// reclaim any handle metadata still present.
    pub fn destroy(self) -> Result<DestroyReport, LoopError> {
        self.teardown()
    }

    fn teardown(&self) -> Result<DestroyReport, LoopError> {
        if self.destroyed.swap(true, AtomicOrdering::AcqRel) {
            return Ok(DestroyReport {
                stats: self.stats(),
                ..DestroyReport::default()
            });
        }

        self.stop()?;
        let joined = if self.core.is_loop_thread() {
            // Dropped from inside a task; the thread sees the destroyed state
            // on its next drain and exits on its own
            debug!("event loop destroyed from its processing thread");
            Ok(())
        } else {
            self.wait_for_stop_completion()
        };

        let mut leftovers = std::mem::take(&mut *self.leftovers.lock());
        leftovers.extend(self.core.queue.destroy());

        let tasks_canceled = leftovers.len();
        for submission in leftovers {
            self.core.run_task(submission.task, RunMode::Canceled);
        }

        let handles_reclaimed = self.core.handles.drain(&self.core.registry);
        if handles_reclaimed > 0 {
            warn!(handles_reclaimed, "handle metadata reclaimed at destroy");
        }

        let report = DestroyReport {
            tasks_canceled,
            handles_reclaimed,
            stats: self.stats(),
        };
        info!(
            tasks_canceled,
            handles_reclaimed,
            tasks_run = report.stats.tasks_run,
            "event loop destroyed"
        );
        joined.map(|()| report)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            error!(error = %e, "event loop teardown failed");
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("state", &self.state())
            .field("subscribed", &self.subscribed_count())
            .field("pending_tasks", &self.pending_tasks())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Processing thread
// ============================================================================

fn processing_loop(core: Arc<LoopCore>, mut poll: Poll, capacity: usize) -> Vec<Submission> {
    let _ = core.loop_thread.set(thread::current().id());
    let mut events = Events::with_capacity(capacity);
    let mut incoming: VecDeque<Submission> = VecDeque::new();
    let mut ready: VecDeque<Task> = VecDeque::new();
    let mut timers: BinaryHeap<TimerEntry> = BinaryHeap::new();
    let mut next_seq: u64 = 0;

    debug!("processing thread started");

    loop {
        let timeout = if !ready.is_empty() {
            Some(Duration::ZERO)
        } else {
            timers.peek().map(|entry| {
                Duration::from_nanos(entry.run_at.saturating_sub(core.current_clock_time()))
            })
        };

        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "poll failed, stopping event loop");
            break;
        }

        // === STEP 1: Drain submissions ===
        let stop_requested = core.queue.drain_into(&mut incoming);
        let now = core.current_clock_time();
        for submission in incoming.drain(..) {
            match submission.run_at {
                Some(run_at) if run_at > now => {
                    timers.push(TimerEntry {
                        run_at,
                        seq: next_seq,
                        task: submission.task,
                    });
                    next_seq += 1;
                }
                _ => ready.push_back(submission.task),
            }
        }

        // No readiness is dispatched once a stop has been accepted
        if stop_requested {
            break;
        }

        // === STEP 2: Dispatch readiness ===
        let mut stopped_mid_pass = false;
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let _gate = core.dispatch_gate.lock();
            if core.queue.state() != RunState::Running {
                stopped_mid_pass = true;
                break;
            }
            let readiness = EventMask::from_event(event);
            if core.handles.dispatch(event.token(), readiness) {
                Counters::bump(&core.counters.events_dispatched);
            } else {
                Counters::bump(&core.counters.events_dropped);
            }
        }
        if stopped_mid_pass {
            break;
        }

        // === STEP 3: Fire due timers ===
        while timers.peek().is_some_and(|entry| entry.run_at <= now) {
            if let Some(entry) = timers.pop() {
                ready.push_back(entry.task);
            }
        }

        // === STEP 4: Run ready tasks ===
        // Tasks scheduled from inside these land in the queue for the next pass
        while let Some(task) = ready.pop_front() {
            core.run_task(task, RunMode::Ready);
        }
    }

    let mut leftovers: Vec<Submission> = ready
        .into_iter()
        .map(|task| Submission { task, run_at: None })
        .collect();
    // into_sorted_vec is ascending by the reversed order, so latest first
    leftovers.extend(timers.into_sorted_vec().into_iter().rev().map(|entry| Submission {
        run_at: Some(entry.run_at),
        task: entry.task,
    }));
    leftovers.extend(core.queue.close());

    debug!(leftovers = leftovers.len(), "processing thread exiting");
    leftovers
}
