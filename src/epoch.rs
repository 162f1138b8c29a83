//! Epoch arithmetic: RFC-1982-style cyclic comparisons over 64-bit epochs.
//!
//! Epoch 0 is reserved and never produced by [`increment`] or accepted as a
//! valid argument by [`is_after`]/[`is_after_or_equal`] beyond the comparison
//! itself; callers are expected to reject 0 earlier in the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

pub type Epoch = u64;

pub const INVALID_EPOCH: Epoch = 0;

/// In-memory home of DE ≤ SE ≤ NE, shared between the instance, the flusher,
/// and anything blocking on `query_durable_epoch`.
///
/// The control file remains the durable source of truth for DE; this is the
/// fast in-memory mirror the flusher publishes to with a release-store after
/// the CF write has landed, per the flusher-to-CF ordering rule.
pub struct SharedEpochs {
    durable: AtomicU64,
    stable: AtomicU64,
    next: AtomicU64,
}

impl SharedEpochs {
    pub fn new(durable: Epoch, stable: Epoch, next: Epoch) -> Self {
        Self {
            durable: AtomicU64::new(durable),
            stable: AtomicU64::new(stable),
            next: AtomicU64::new(next),
        }
    }

    pub fn durable_epoch(&self) -> Epoch {
        self.durable.load(Ordering::Acquire)
    }

    pub fn stable_epoch(&self) -> Epoch {
        self.stable.load(Ordering::Acquire)
    }

    pub fn next_epoch(&self) -> Epoch {
        self.next.load(Ordering::Acquire)
    }

    pub fn publish_durable_epoch(&self, epoch: Epoch) {
        self.durable.store(epoch, Ordering::Release);
    }

    /// Raw setter; callers are responsible for keeping `SE - DE <= 1`.
    pub fn set_stable_epoch(&self, epoch: Epoch) {
        self.stable.store(epoch, Ordering::Release);
    }

    /// Raw setter; callers are responsible for keeping `NE - SE <= 1`.
    pub fn set_next_epoch(&self, epoch: Epoch) {
        self.next.store(epoch, Ordering::Release);
    }
}

/// `a` is after `b` iff `0 < (a - b) mod 2^64 < 2^63`, the RFC-1982 relation.
pub fn is_after(a: Epoch, b: Epoch) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff < (1u64 << 63)
}

pub fn is_after_or_equal(a: Epoch, b: Epoch) -> bool {
    a == b || is_after(a, b)
}

/// Next epoch after `e`, skipping the reserved value 0.
///
/// Wrap-around of the 64-bit epoch space is out of scope; incrementing past
/// `u64::MAX - 1` fails rather than silently wrapping to 0 or 1.
pub fn increment(e: Epoch) -> Option<Epoch> {
    let next = e.checked_add(1)?;
    if next == INVALID_EPOCH {
        None
    } else {
        Some(next)
    }
}

/// Normalize an epoch for MDS indexing: epochs start at 1, so subtract one
/// to get a zero-based index.
pub fn normalize(e: Epoch) -> u64 {
    debug_assert_ne!(e, INVALID_EPOCH, "normalize called on invalid epoch");
    e - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_relation_basic() {
        assert!(is_after(2, 1));
        assert!(!is_after(1, 2));
        assert!(!is_after(1, 1));
        assert!(is_after_or_equal(1, 1));
    }

    #[test]
    fn after_relation_wraps() {
        // a small value is "after" a huge value once distance < 2^63
        let huge = u64::MAX;
        assert!(is_after(0, huge));
        assert!(!is_after(huge, 0));
    }

    #[test]
    fn increment_skips_zero() {
        assert_eq!(increment(0), Some(1));
        assert_eq!(increment(5), Some(6));
    }

    #[test]
    fn increment_saturates_before_wrap() {
        assert_eq!(increment(u64::MAX - 1), Some(u64::MAX));
        assert_eq!(increment(u64::MAX), None);
    }

    #[test]
    fn normalize_is_zero_based() {
        assert_eq!(normalize(1), 0);
        assert_eq!(normalize(2), 1);
    }
}
