//! Per-worker descriptors and the readiness probe

use crate::event_loop::{IoEvent, IoHandle};
use mio::net::UnixStream;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

/// A connected stream pair. The worker subscribes `ours`; writing to `peer`
/// makes `ours` readable.
///
/// Owned by the driver for the whole run so the descriptors outlive every
/// subscription, including ones reclaimed at destroy.
#[derive(Debug)]
pub struct WorkerResource {
    ours: UnixStream,
    peer: UnixStream,
}

impl WorkerResource {
    /// Open a fresh pair
    pub fn new() -> io::Result<Self> {
        let (ours, peer) = UnixStream::pair()?;
        Ok(Self { ours, peer })
    }

    /// Handle of the subscribed end
    pub fn handle(&self) -> IoHandle {
        IoHandle::of(&self.ours)
    }

    /// Write one byte to the peer end to force a readiness event
    pub fn poke(&self) -> io::Result<()> {
        match (&self.peer).write(&[1]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Counts readiness callbacks and the ones that saw bad metadata
#[derive(Debug, Default)]
pub struct DispatchProbe {
    observed: AtomicU64,
    violations: AtomicU64,
}

impl DispatchProbe {
    /// Check one callback invocation for `expected`
    pub fn observe(&self, expected: IoHandle, event: &IoEvent<'_>) {
        self.observed.fetch_add(1, Ordering::Relaxed);
        let meta = event.metadata;
        if !meta.is_live() || meta.handle() != expected || event.handle != expected {
            self.violations.fetch_add(1, Ordering::Relaxed);
            error!(%expected, ?meta, "readiness callback saw invalid handle metadata");
        }
    }

    /// Callbacks seen
    pub fn observed(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }

    /// Callbacks that saw dead or foreign metadata
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }
}
