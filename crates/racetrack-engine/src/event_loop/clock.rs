//! Clock sources for the event loop

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonic time source read by the loop.
///
/// Implementations must be callable from any thread without coordination.
pub trait Clock: Send + Sync {
    /// Current reading in nanoseconds
    fn now_nanos(&self) -> u64;
}

impl<F> Clock for F
where
    F: Fn() -> u64 + Send + Sync,
{
    fn now_nanos(&self) -> u64 {
        self()
    }
}

/// High-resolution monotonic clock anchored at construction
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock reading zero now
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        // u64 nanoseconds covers ~584 years of uptime
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Clock advanced by hand (for tests)
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at `nanos`
    pub fn new(nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(nanos),
        }
    }

    /// Move the clock forward by `delta` nanoseconds
    pub fn advance(&self, delta: u64) {
        self.nanos.fetch_add(delta, Ordering::AcqRel);
    }

    /// Set the reading; never moves backwards
    pub fn set(&self, nanos: u64) {
        self.nanos.fetch_max(nanos, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::new();
        let mut last = clock.now_nanos();
        for _ in 0..1000 {
            let now = clock.now_nanos();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_manual_clock_set_is_monotonic() {
        let clock = ManualClock::new(100);
        clock.set(50);
        assert_eq!(clock.now_nanos(), 100);
        clock.set(250);
        assert_eq!(clock.now_nanos(), 250);
        clock.advance(5);
        assert_eq!(clock.now_nanos(), 255);
    }

    #[test]
    fn test_closure_clock() {
        let clock = || 42u64;
        assert_eq!(Clock::now_nanos(&clock), 42);
    }

    #[test]
    fn test_concurrent_reads() {
        let clock = Arc::new(MonotonicClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                thread::spawn(move || (0..500).map(|_| clock.now_nanos()).max())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_some());
        }
    }
}
