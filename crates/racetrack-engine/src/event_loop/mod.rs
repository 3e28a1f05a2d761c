//! Event loop: a single processing thread for tasks and readiness dispatch
//!
//! One processing thread owns the poller. Any thread may stop the loop, read
//! its clock, subscribe handles, or schedule tasks; the processing thread
//! drains the task queue and dispatches readiness callbacks.

mod clock;
#[allow(clippy::module_inception)]
mod event_loop;
mod handle;
mod queue;
mod task;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use event_loop::{DestroyReport, EventLoop, EventLoopOptions, LoopStats};
pub use handle::{EventMask, HandleMetadata, IoCallback, IoEvent, IoHandle};
pub use queue::RunState;
pub use task::{RunMode, Task, TaskContext, TaskHandle, TaskId, TaskStatus};
