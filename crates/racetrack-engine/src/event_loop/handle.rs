//! I/O handles and the loop-private metadata table
//!
//! A handle is just a descriptor the caller owns. When it is subscribed the
//! loop attaches a `HandleMetadata` record to it; the record is published in
//! the table *before* the descriptor is handed to the poller, and readiness
//! dispatch only ever goes through a live record.

use crate::error::LoopError;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

// ============================================================================
// IoHandle
// ============================================================================

/// Opaque per-resource descriptor registered with the loop.
///
/// Identity is the raw descriptor. The caller keeps ownership of the resource
/// and must keep it open until the handle is unsubscribed (or the loop is
/// destroyed).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct IoHandle(RawFd);

impl IoHandle {
    /// Wrap a raw descriptor
    pub fn from_raw_fd(fd: RawFd) -> Self {
        IoHandle(fd)
    }

    /// Handle for any descriptor-backed resource
    pub fn of<S: AsRawFd + ?Sized>(source: &S) -> Self {
        IoHandle(source.as_raw_fd())
    }

    /// The wrapped descriptor
    pub fn raw_fd(self) -> RawFd {
        self.0
    }

    pub(crate) fn token(self) -> Option<Token> {
        usize::try_from(self.0).ok().map(Token)
    }

    pub(crate) fn from_token(token: Token) -> Option<Self> {
        RawFd::try_from(token.0).ok().map(IoHandle)
    }
}

impl fmt::Display for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

// ============================================================================
// EventMask
// ============================================================================

/// Set of readiness kinds
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u8);

impl EventMask {
    /// No readiness
    pub const EMPTY: EventMask = EventMask(0);
    /// Resource can be read without blocking
    pub const READABLE: EventMask = EventMask(1 << 0);
    /// Resource can be written without blocking
    pub const WRITABLE: EventMask = EventMask(1 << 1);
    /// Peer closed one or both directions
    pub const CLOSED: EventMask = EventMask(1 << 2);
    /// Resource reported an error
    pub const ERROR: EventMask = EventMask(1 << 3);

    /// Raw bits
    pub fn bits(self) -> u8 {
        self.0
    }

    /// True when every bit of `other` is set in `self`
    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when no bit is set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Poller interest for this mask. CLOSED and ERROR are always reported
    /// by the poller and cannot be requested on their own.
    pub(crate) fn interest(self) -> Option<Interest> {
        match (
            self.contains(Self::READABLE),
            self.contains(Self::WRITABLE),
        ) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    pub(crate) fn from_event(event: &mio::event::Event) -> Self {
        let mut mask = Self::EMPTY;
        if event.is_readable() {
            mask |= Self::READABLE;
        }
        if event.is_writable() {
            mask |= Self::WRITABLE;
        }
        if event.is_read_closed() || event.is_write_closed() {
            mask |= Self::CLOSED;
        }
        if event.is_error() {
            mask |= Self::ERROR;
        }
        mask
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READABLE, "READABLE"),
            (Self::WRITABLE, "WRITABLE"),
            (Self::CLOSED, "CLOSED"),
            (Self::ERROR, "ERROR"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "EMPTY")
        } else {
            write!(f, "{}", set.join(" | "))
        }
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Callback invoked on the processing thread for each readiness event
pub type IoCallback = Box<dyn FnMut(&IoEvent<'_>) + Send + 'static>;

/// Loop-private record attached to a subscribed handle
pub struct HandleMetadata {
    handle: IoHandle,
    mask: EventMask,
    subscribed_at: u64,
    /// Cleared when teardown starts; dispatch never goes through a dead record
    live: AtomicBool,
    dispatches: AtomicU64,
    callback: Mutex<IoCallback>,
}

impl HandleMetadata {
    /// Handle this record belongs to
    pub fn handle(&self) -> IoHandle {
        self.handle
    }

    /// Subscribed event mask
    pub fn mask(&self) -> EventMask {
        self.mask
    }

    /// Clock reading at subscription
    pub fn subscribed_at(&self) -> u64 {
        self.subscribed_at
    }

    /// False once unsubscribe (or destroy) has torn the record down
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Number of readiness callbacks delivered through this record
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for HandleMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleMetadata")
            .field("handle", &self.handle)
            .field("mask", &self.mask)
            .field("subscribed_at", &self.subscribed_at)
            .field("live", &self.is_live())
            .field("dispatches", &self.dispatch_count())
            .finish_non_exhaustive()
    }
}

/// A readiness notification as seen by a subscriber callback
#[derive(Debug)]
pub struct IoEvent<'a> {
    /// Handle that became ready
    pub handle: IoHandle,
    /// Readiness reported by the poller
    pub readiness: EventMask,
    /// The handle's loop-private record, live for the duration of the call
    pub metadata: &'a HandleMetadata,
}

// ============================================================================
// HandleTable
// ============================================================================

/// Table of subscribed handles, guarded by a single lock
pub(crate) struct HandleTable {
    entries: Mutex<HashMap<IoHandle, Arc<HandleMetadata>>>,
}

impl HandleTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Publish metadata for `handle`, then register it with the poller.
    ///
    /// The lock is held across registration so a concurrent subscribe of the
    /// same handle cannot interleave with the rollback path.
    pub(crate) fn subscribe(
        &self,
        registry: &Registry,
        handle: IoHandle,
        mask: EventMask,
        subscribed_at: u64,
        callback: IoCallback,
    ) -> Result<(), LoopError> {
        let interest = mask.interest().ok_or(LoopError::InvalidInterest(mask))?;
        let token = handle.token().ok_or_else(|| {
            LoopError::Registration(io::Error::new(
                io::ErrorKind::InvalidInput,
                "negative descriptor",
            ))
        })?;

        let mut entries = self.entries.lock();
        if entries.contains_key(&handle) {
            return Err(LoopError::AlreadyRegistered(handle));
        }

        entries.insert(
            handle,
            Arc::new(HandleMetadata {
                handle,
                mask,
                subscribed_at,
                live: AtomicBool::new(true),
                dispatches: AtomicU64::new(0),
                callback: Mutex::new(callback),
            }),
        );

        let fd = handle.raw_fd();
        if let Err(e) = registry.register(&mut SourceFd(&fd), token, interest) {
            if let Some(meta) = entries.remove(&handle) {
                meta.live.store(false, Ordering::Release);
            }
            return Err(LoopError::Registration(e));
        }

        debug!(%handle, ?mask, "subscribed");
        Ok(())
    }

    /// Tear down the metadata for `handle` and deregister it.
    ///
    /// The record is removed and marked dead even when the poller refuses to
    /// deregister (for example because the caller already closed the fd).
    pub(crate) fn unsubscribe(&self, registry: &Registry, handle: IoHandle) -> Result<(), LoopError> {
        let mut entries = self.entries.lock();
        let meta = entries
            .remove(&handle)
            .ok_or(LoopError::NotSubscribed(handle))?;
        meta.live.store(false, Ordering::Release);

        let fd = handle.raw_fd();
        let result = registry.deregister(&mut SourceFd(&fd));
        drop(entries);

        debug!(%handle, dispatches = meta.dispatch_count(), "unsubscribed");
        result.map_err(LoopError::Registration)
    }

    /// Deliver one readiness event. Returns false when the event was dropped
    /// because no live record exists for the token.
    pub(crate) fn dispatch(&self, token: Token, readiness: EventMask) -> bool {
        let meta = {
            let entries = self.entries.lock();
            IoHandle::from_token(token)
                .and_then(|handle| entries.get(&handle).cloned())
                .filter(|meta| meta.is_live())
        };

        let Some(meta) = meta else {
            trace!(token = token.0, ?readiness, "dropping event for unsubscribed handle");
            return false;
        };

        meta.dispatches.fetch_add(1, Ordering::Relaxed);
        let event = IoEvent {
            handle: meta.handle,
            readiness,
            metadata: &*meta,
        };
        let mut callback = meta.callback.lock();
        (*callback)(&event);
        true
    }

    /// Tear down every remaining record. Returns how many were reclaimed.
    pub(crate) fn drain(&self, registry: &Registry) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        for (handle, meta) in &drained {
            meta.live.store(false, Ordering::Release);
            let fd = handle.raw_fd();
            if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
                warn!(%handle, error = %e, "deregister failed during teardown");
            }
        }
        drained.len()
    }

    pub(crate) fn contains(&self, handle: IoHandle) -> bool {
        self.entries.lock().contains_key(&handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
