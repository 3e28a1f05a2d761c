//! Concurrent worker harness
//!
//! Spawns one thread per worker against a shared, running event loop. Each
//! worker executes its choice array (stop, query-clock, subscribe, no-op),
//! schedules an unsubscribe task if it subscribed, and returns a report. The
//! driver joins every worker, destroys the loop, and checks that no task or
//! handle metadata went missing.

mod choice;
mod config;
mod driver;
mod resource;

pub use choice::{
    Choice, ChoiceSource, ExhaustivePlans, Plan, RandomChoices, ScriptedChoices, NUM_API_CALLS,
};
pub use config::{HarnessConfig, DEFAULT_ROUNDS, DEFAULT_THREADS};
pub use driver::{CleanupOutcome, Harness, HarnessReport, RunSummary, WorkerReport, WorkerState};
pub use resource::{DispatchProbe, WorkerResource};
