//! Thread-safe replay position tracking
//!
//! The read loop and the consumer run on different tasks. The read loop
//! records how far it has read the WAL and what it has handed out; the
//! consumer records what it has durably accepted. Standby status updates
//! report the acknowledged position back to PostgreSQL, which then may
//! recycle WAL up to it.
//!
//! Every position only moves forward. A stale acknowledgement from a slow
//! consumer never rewinds what was already confirmed.

use crate::types::{format_lsn, CachePadded, XLogRecPtr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Monotonic positions shared between the read loop and the consumer
///
/// # Example
///
/// ```
/// use pg_capture::PositionTracker;
///
/// let positions = PositionTracker::new_shared();
///
/// // Read loop: a batch ending at 0/3E8 was handed to the consumer
/// positions.update_received(1000);
/// positions.update_delivered(1000);
/// assert!(!positions.is_caught_up());
///
/// // Consumer: batch durably accepted
/// assert!(positions.acknowledge(1000));
/// assert!(positions.is_caught_up());
///
/// // A stale acknowledgement does not move the position back
/// assert!(!positions.acknowledge(500));
/// assert_eq!(positions.acknowledged(), 1000);
/// ```
#[derive(Debug)]
pub struct PositionTracker {
    /// End of the last WAL message read from the server
    received: CachePadded<AtomicU64>,
    /// Position of the last batch with records handed to the consumer
    delivered: CachePadded<AtomicU64>,
    /// Position the consumer has durably accepted
    acknowledged: CachePadded<AtomicU64>,
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            received: CachePadded::new(AtomicU64::new(0)),
            delivered: CachePadded::new(AtomicU64::new(0)),
            acknowledged: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Create a tracker wrapped in `Arc` for sharing between tasks
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Create a tracker whose acknowledged position starts at a resume point
    pub fn starting_at(lsn: XLogRecPtr) -> Self {
        let tracker = Self::new();
        advance(&tracker.received, lsn);
        advance(&tracker.acknowledged, lsn);
        tracker
    }

    #[inline]
    pub fn update_received(&self, lsn: XLogRecPtr) -> bool {
        advance(&self.received, lsn)
    }

    #[inline]
    pub fn update_delivered(&self, lsn: XLogRecPtr) -> bool {
        advance(&self.delivered, lsn)
    }

    /// Record a consumer acknowledgement; returns `true` if the position moved
    #[inline]
    pub fn acknowledge(&self, lsn: XLogRecPtr) -> bool {
        let moved = advance(&self.acknowledged, lsn);
        if moved {
            debug!("Acknowledged position advanced to {}", format_lsn(lsn));
        } else {
            debug!(
                "Ignoring acknowledgement of {} (current {})",
                format_lsn(lsn),
                format_lsn(self.acknowledged())
            );
        }
        moved
    }

    #[inline]
    pub fn received(&self) -> XLogRecPtr {
        self.received.load(Ordering::Acquire)
    }

    #[inline]
    pub fn delivered(&self) -> XLogRecPtr {
        self.delivered.load(Ordering::Acquire)
    }

    #[inline]
    pub fn acknowledged(&self) -> XLogRecPtr {
        self.acknowledged.load(Ordering::Acquire)
    }

    /// `true` when everything handed to the consumer has been acknowledged
    ///
    /// Automatic acknowledgement of irrelevant WAL is only safe in this state.
    #[inline]
    pub fn is_caught_up(&self) -> bool {
        self.acknowledged() >= self.delivered()
    }
}

/// Raise `slot` to `lsn` if it is larger; zero is never recorded
#[inline(always)]
fn advance(slot: &AtomicU64, lsn: XLogRecPtr) -> bool {
    if lsn == 0 {
        return false;
    }

    let mut current = slot.load(Ordering::Acquire);
    loop {
        if lsn <= current {
            return false;
        }
        match slot.compare_exchange_weak(current, lsn, Ordering::Release, Ordering::Acquire) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}
