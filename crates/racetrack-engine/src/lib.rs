//! Racetrack Engine
//!
//! This crate provides a shared I/O event loop together with a harness that
//! hammers it from many threads at once:
//! - **Event loop**: processing thread, task queue, handle table (`event_loop` module)
//! - **Harness**: worker driver, choice generators, configuration (`harness` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use racetrack_engine::harness::{Harness, HarnessConfig, RandomChoices};
//!
//! let config = HarnessConfig::default();
//! let mut choices = RandomChoices::from_seed(7);
//! let report = Harness::new(config).run(&mut choices)?;
//! println!("{} readiness events observed", report.events_observed);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Event loop: clock, handles, tasks, task queue, and the processing thread
pub mod event_loop;

/// Harness: concurrent worker driver exercising the event loop
pub mod harness;

/// Error types shared by the loop and the harness
pub mod error;

// ============================================================================
// Re-exports
// ============================================================================

pub use error::{HarnessError, LoopError};
pub use event_loop::{
    Clock, EventLoop, EventLoopOptions, EventMask, IoHandle, MonotonicClock, RunState, Task,
    TaskContext, TaskHandle, TaskStatus,
};
