//! Error types for the event loop and the harness

use crate::event_loop::IoHandle;
use crate::harness::Choice;
use std::io;
use thiserror::Error;

/// Errors returned by event loop operations
#[derive(Debug, Error)]
pub enum LoopError {
    /// The poller, waker or handle registry could not be created
    #[error("failed to allocate event loop resources: {0}")]
    Allocation(#[source] io::Error),

    /// `run` was called on a loop that already has a processing thread
    #[error("event loop is already running")]
    AlreadyRunning,

    /// The loop has stopped (or is being destroyed) and accepts no new work
    #[error("event loop is stopped")]
    LoopStopped,

    /// The handle already has live metadata in this loop
    #[error("handle {0} is already subscribed")]
    AlreadyRegistered(IoHandle),

    /// The handle has no metadata in this loop
    #[error("handle {0} is not subscribed")]
    NotSubscribed(IoHandle),

    /// The event mask asks for neither readable nor writable readiness
    #[error("event mask {0:?} has no readable or writable interest")]
    InvalidInterest(crate::event_loop::EventMask),

    /// The OS poller refused to register or deregister a descriptor
    #[error("failed to update readiness registration: {0}")]
    Registration(#[source] io::Error),

    /// The processing thread could not be spawned or joined
    #[error("processing thread lifecycle failure: {0}")]
    ThreadLifecycle(String),

    /// The operation would deadlock when called from the processing thread
    #[error("operation cannot be called from the event loop thread")]
    WrongThread,
}

/// Errors returned by a harness run
#[derive(Debug, Error)]
pub enum HarnessError {
    /// An event loop operation failed outside of a worker round
    #[error(transparent)]
    Loop(#[from] LoopError),

    /// A worker's operation failed where the contract requires success
    #[error("worker {worker} violated the loop contract during {choice:?}: {source}")]
    Contract {
        /// Index of the worker thread
        worker: usize,
        /// The operation being invoked
        choice: Choice,
        /// The error the loop returned
        #[source]
        source: LoopError,
    },

    /// A worker thread could not be spawned
    #[error("failed to spawn worker {worker}: {source}")]
    WorkerSpawn {
        /// Index of the worker thread
        worker: usize,
        /// Spawn failure
        #[source]
        source: io::Error,
    },

    /// A worker thread panicked before reaching its Done state
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),

    /// An accepted task never reached Completed or Canceled
    #[error("worker {worker}'s task {task} was lost by the loop")]
    LostTask {
        /// Index of the worker thread
        worker: usize,
        /// Task identifier
        task: u64,
    },

    /// Destroy reclaimed a different number of handles than were left behind
    #[error("expected {expected} handle(s) reclaimed at destroy, found {found}")]
    LeakedMetadata {
        /// Handles whose cleanup the loop refused
        expected: usize,
        /// Handles destroy actually reclaimed
        found: usize,
    },

    /// `4^(threads * rounds)` plans do not fit in a `u64`
    #[error("exhaustive grid of {threads} thread(s) x {rounds} round(s) has too many plans to enumerate")]
    PlanSpaceTooLarge {
        /// Worker threads requested
        threads: usize,
        /// Rounds per worker requested
        rounds: usize,
    },

    /// Readiness callbacks observed invalid metadata
    #[error("{0} readiness callback(s) observed dead or foreign handle metadata")]
    Violations(u64),

    /// Resource setup failed
    #[error("harness I/O failure: {0}")]
    Io(#[from] io::Error),

    /// The harness configuration file is invalid
    #[error("invalid harness configuration: {0}")]
    Config(#[from] toml::de::Error),
}
