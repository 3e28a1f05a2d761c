//! Worker driver: N threads racing stop / query-clock / subscribe on one loop

use super::choice::{Choice, ChoiceSource, ExhaustivePlans, Plan};
use super::config::HarnessConfig;
use super::resource::{DispatchProbe, WorkerResource};
use crate::error::{HarnessError, LoopError};
use crate::event_loop::{
    DestroyReport, EventLoop, EventMask, IoHandle, MonotonicClock, Task, TaskHandle,
};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, trace, warn};

/// Worker lifecycle
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, no round started
    Idle,
    /// Picking this round's operation
    Choosing,
    /// Calling into the loop
    Invoking,
    /// Submitting the unsubscribe task
    CleaningUp,
    /// Finished; cleanup (if any) was submitted
    Done,
}

/// What became of a worker's unsubscribe task
#[derive(Debug, Clone)]
pub enum CleanupOutcome {
    /// The worker never subscribed
    NotNeeded,
    /// Accepted by the loop
    Scheduled(TaskHandle),
    /// Rejected with `LoopStopped`; the loop reclaims the metadata at destroy
    LoopStopped,
}

/// Per-worker result
#[derive(Debug, Clone)]
pub struct WorkerReport {
    /// Worker index
    pub worker: usize,
    /// Choices executed
    pub choices: Vec<Choice>,
    /// State when the thread returned
    pub final_state: WorkerState,
    /// Every state the worker passed through, starting at `Idle`
    pub transitions: Vec<WorkerState>,
    /// Stop calls made
    pub stops: usize,
    /// Clock readings taken, in order
    pub clock_reads: Vec<u64>,
    /// Subscribe was accepted
    pub subscribed: bool,
    /// Subscribe was refused because the loop had already stopped
    pub subscribe_rejected: bool,
    /// Cleanup outcome
    pub cleanup: CleanupOutcome,
}

/// Result of one harness run
#[derive(Debug, Clone)]
pub struct HarnessReport {
    /// The plan that was executed
    pub plan: Plan,
    /// One report per worker, in worker order
    pub workers: Vec<WorkerReport>,
    /// What the loop cleaned up on destroy
    pub destroy: DestroyReport,
    /// Readiness callbacks observed by workers' probes
    pub events_observed: u64,
}

struct Worker<'a> {
    id: usize,
    event_loop: &'a EventLoop,
    resource: &'a WorkerResource,
    probe: Arc<DispatchProbe>,
    poke: bool,
    transitions: Vec<WorkerState>,
}

impl<'a> Worker<'a> {
    fn new(
        id: usize,
        event_loop: &'a EventLoop,
        resource: &'a WorkerResource,
        probe: Arc<DispatchProbe>,
        poke: bool,
    ) -> Self {
        Self {
            id,
            event_loop,
            resource,
            probe,
            poke,
            transitions: vec![WorkerState::Idle],
        }
    }

    fn enter(&mut self, state: WorkerState) {
        trace!(worker = self.id, ?state, "worker state");
        self.transitions.push(state);
    }

    fn run(mut self, choices: Vec<Choice>) -> Result<WorkerReport, HarnessError> {
        let handle = self.resource.handle();
        let mut report = WorkerReport {
            worker: self.id,
            choices: choices.clone(),
            final_state: WorkerState::Idle,
            transitions: Vec::new(),
            stops: 0,
            clock_reads: Vec::new(),
            subscribed: false,
            subscribe_rejected: false,
            cleanup: CleanupOutcome::NotNeeded,
        };
        // Driver-level guard: one subscribe attempt per worker
        let mut attempted_subscribe = false;

        for choice in choices {
            self.enter(WorkerState::Choosing);
            debug!(worker = self.id, ?choice, "round");
            self.enter(WorkerState::Invoking);

            match choice {
                Choice::Stop => {
                    self.event_loop
                        .stop()
                        .map_err(|source| self.contract(choice, source))?;
                    report.stops += 1;
                }
                Choice::QueryClock => {
                    report.clock_reads.push(self.event_loop.current_clock_time());
                }
                Choice::Subscribe => {
                    if attempted_subscribe {
                        continue;
                    }
                    attempted_subscribe = true;
                    let probe = self.probe.clone();
                    let result = self.event_loop.subscribe(
                        handle,
                        EventMask::READABLE | EventMask::WRITABLE,
                        move |event| probe.observe(handle, event),
                    );
                    match result {
                        Ok(()) => {
                            report.subscribed = true;
                            if self.poke {
                                self.resource.poke()?;
                            }
                        }
                        Err(LoopError::LoopStopped) => {
                            debug!(worker = self.id, "subscribe refused, loop stopped");
                            report.subscribe_rejected = true;
                        }
                        Err(source) => return Err(self.contract(choice, source)),
                    }
                }
                Choice::Noop => {}
            }
        }

        if report.subscribed {
            self.enter(WorkerState::CleaningUp);
            report.cleanup = self.schedule_cleanup(handle)?;
        }

        self.enter(WorkerState::Done);
        report.final_state = WorkerState::Done;
        report.transitions = self.transitions;
        Ok(report)
    }

    fn schedule_cleanup(&self, handle: IoHandle) -> Result<CleanupOutcome, HarnessError> {
        let worker = self.id;
        let task = Task::new("cleanup", move |ctx, mode| {
            if let Err(e) = ctx.unsubscribe(handle) {
                warn!(worker, %handle, ?mode, error = %e, "cleanup unsubscribe failed");
            }
        });

        match self.event_loop.schedule_now(task) {
            Ok(task) => Ok(CleanupOutcome::Scheduled(task)),
            Err(LoopError::LoopStopped) => {
                warn!(worker, %handle, "cleanup rejected: loop stopped, metadata left for destroy");
                Ok(CleanupOutcome::LoopStopped)
            }
            Err(source) => Err(self.contract(Choice::Subscribe, source)),
        }
    }

    fn contract(&self, choice: Choice, source: LoopError) -> HarnessError {
        HarnessError::Contract {
            worker: self.id,
            choice,
            source,
        }
    }
}

/// Runs plans against a fresh event loop per run
#[derive(Debug, Clone)]
pub struct Harness {
    config: HarnessConfig,
}

impl Harness {
    /// Create a harness
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    /// Configuration in use
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Draw a plan from `source` and run it once
    pub fn run(&self, source: &mut dyn ChoiceSource) -> Result<HarnessReport, HarnessError> {
        let plan = source.plan(self.config.threads, self.config.rounds);
        self.run_plan(&plan)
    }

    /// Run `config.iterations` plans drawn from `source`
    pub fn run_iterations(&self, source: &mut dyn ChoiceSource) -> Result<RunSummary, HarnessError> {
        let mut summary = RunSummary::default();
        for _ in 0..self.config.iterations {
            summary.absorb(&self.run(source)?);
        }
        Ok(summary)
    }

    /// Run every plan for the configured threads × rounds
    pub fn run_exhaustive(&self) -> Result<RunSummary, HarnessError> {
        let plans = ExhaustivePlans::new(self.config.threads, self.config.rounds)?;
        info!(plans = plans.total(), "exhaustive exploration");
        let mut summary = RunSummary::default();
        for plan in plans {
            summary.absorb(&self.run_plan(&plan)?);
        }
        Ok(summary)
    }

    /// Run one plan: one worker thread per entry, all sharing one loop.
    pub fn run_plan(&self, plan: &[Vec<Choice>]) -> Result<HarnessReport, HarnessError> {
        // Declared before the loop so the descriptors are closed after it
        let resources = (0..plan.len())
            .map(|_| WorkerResource::new())
            .collect::<Result<Vec<_>, _>>()?;
        let probe = Arc::new(DispatchProbe::default());

        let event_loop = EventLoop::with_options(
            Arc::new(MonotonicClock::new()),
            self.config.loop_options(),
        )?;
        event_loop.run()?;
        debug!(workers = plan.len(), ?plan, "run started");

        let joined = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(plan.len());
            for (id, (choices, resource)) in plan.iter().zip(&resources).enumerate() {
                let worker =
                    Worker::new(id, &event_loop, resource, probe.clone(), self.config.poke);
                let choices = choices.clone();
                let handle = thread::Builder::new()
                    .name(format!("racetrack-worker-{id}"))
                    .spawn_scoped(scope, move || worker.run(choices))
                    .map_err(|source| HarnessError::WorkerSpawn { worker: id, source })?;
                handles.push(handle);
            }

            // Join every thread before looking at any result
            let results: Vec<_> = handles.into_iter().map(|h| h.join()).collect();
            results
                .into_iter()
                .enumerate()
                .map(|(id, joined)| {
                    joined
                        .map_err(|_| HarnessError::WorkerPanicked(id))
                        .and_then(|result| result)
                })
                .collect::<Result<Vec<_>, HarnessError>>()
        });

        let workers = joined?;
        let destroy = event_loop.destroy()?;
        let report = HarnessReport {
            plan: plan.to_vec(),
            workers,
            destroy,
            events_observed: probe.observed(),
        };

        let violations = probe.violations();
        if violations > 0 {
            return Err(HarnessError::Violations(violations));
        }
        report.verify_cleanup()?;
        debug!(
            events = report.events_observed,
            reclaimed = report.destroy.handles_reclaimed,
            "run finished"
        );
        Ok(report)
    }
}

impl HarnessReport {
    /// Every accepted cleanup task reached a terminal status, and destroy had
    /// to reclaim exactly the handles whose cleanup the loop refused.
    fn verify_cleanup(&self) -> Result<(), HarnessError> {
        let mut refused = 0;
        for worker in &self.workers {
            match &worker.cleanup {
                CleanupOutcome::Scheduled(task) if !task.status().is_terminal() => {
                    return Err(HarnessError::LostTask {
                        worker: worker.worker,
                        task: task.id().as_u64(),
                    });
                }
                CleanupOutcome::LoopStopped => refused += 1,
                _ => {}
            }
        }
        if refused != self.destroy.handles_reclaimed {
            return Err(HarnessError::LeakedMetadata {
                expected: refused,
                found: self.destroy.handles_reclaimed,
            });
        }
        Ok(())
    }
}

/// Totals across many runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Runs completed
    pub runs: u64,
    /// Stop calls
    pub stops: u64,
    /// Clock reads
    pub clock_reads: u64,
    /// Accepted subscriptions
    pub subscribes: u64,
    /// Cleanup tasks accepted by the loop
    pub cleanups_scheduled: u64,
    /// Cleanup tasks refused with `LoopStopped`
    pub cleanups_refused: u64,
    /// Tasks canceled at destroy
    pub tasks_canceled: u64,
    /// Readiness callbacks observed
    pub events_observed: u64,
    /// Readiness events dropped by the loop for dead handles
    pub events_dropped: u64,
    /// Handle metadata reclaimed at destroy
    pub handles_reclaimed: u64,
}

impl RunSummary {
    /// Add one run's report
    pub fn absorb(&mut self, report: &HarnessReport) {
        self.runs += 1;
        for worker in &report.workers {
            self.stops += worker.stops as u64;
            self.clock_reads += worker.clock_reads.len() as u64;
            self.subscribes += u64::from(worker.subscribed);
            match worker.cleanup {
                CleanupOutcome::Scheduled(_) => self.cleanups_scheduled += 1,
                CleanupOutcome::LoopStopped => self.cleanups_refused += 1,
                CleanupOutcome::NotNeeded => {}
            }
        }
        self.tasks_canceled += report.destroy.tasks_canceled as u64;
        self.events_observed += report.events_observed;
        self.events_dropped += report.destroy.stats.events_dropped;
        self.handles_reclaimed += report.destroy.handles_reclaimed as u64;
    }
}
