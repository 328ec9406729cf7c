//! The global epoch counter and the per-thread reservation table.
//!
//! # Reservations
//!
//! The table holds one slot per registered thread, sized by the build-time
//! constant `THREADS_MAX`. A slot contains either [`UNRESERVED`] or the
//! epoch its owner is currently reading in. Readers will only observe
//! records committed at or below their reservation, and the reclaimer will
//! not free any record retired at or above the minimum published
//! reservation.
//!
//! # Linearized operations
//!
//! Publishing a reservation and reading the epoch counter cannot happen in
//! one atomic step, so a thread could be suspended between the two and
//! wake up with a reservation that no longer protects anything. Linearized
//! operations therefore re-verify that the counter has not moved after the
//! reservation became visible and republish until it holds still. Basic
//! operations skip the verification; they only guarantee that records
//! alive at or after the published epoch stay allocated, which is all the
//! queue and the write paths of the hash table need.

use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::error;

use crossbeam_utils::CachePadded;

use crate::local;
use crate::THREADS_MAX;
use crate::decide;

/// Slot value of threads that are not currently inside an operation.
pub(crate) const UNRESERVED: u64 = u64::MAX;
/// The first epoch ever handed out; no data is written in epoch 0.
const EPOCH_FIRST: u64 = 1;

/// The global epoch counter.
static EPOCH: CachePadded<AtomicU64> = CachePadded::new(AtomicU64::new(EPOCH_FIRST));

/// The global reservation table.
pub(crate) static RESERVATIONS: Reservations = Reservations::new();

/// Loads the current epoch.
#[inline]
pub(crate) fn current() -> u64 {
    EPOCH.load(Ordering::SeqCst)
}

/// Bumps the epoch counter and returns the newly created epoch.
#[inline]
pub(crate) fn advance() -> u64 {
    EPOCH.fetch_add(1, Ordering::SeqCst) + 1
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Reservations
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The fixed-size table of per-thread epoch reservations.
///
/// Slots are claimed by scanning for an unclaimed entry and installing a
/// claim with a CAS; a claimed slot is owned exclusively by one thread
/// until it is released, after which it can be reused by any later
/// registration. The table itself is static and never reallocated, so no
/// reclamation scheme is needed for the scheme's own foundation.
pub(crate) struct Reservations {
    slots: [AtomicU64; THREADS_MAX],
    claims: [AtomicBool; THREADS_MAX],
}

/********** impl inherent *************************************************************************/

impl Reservations {
    const fn new() -> Self {
        Self {
            slots: [const { AtomicU64::new(UNRESERVED) }; THREADS_MAX],
            claims: [const { AtomicBool::new(false) }; THREADS_MAX],
        }
    }

    /// Claims a free slot for the calling thread.
    #[cold]
    pub(crate) fn claim(&self) -> Result<usize, SlotError> {
        for (idx, claim) in self.claims.iter().enumerate() {
            if !claim.load(Ordering::Relaxed)
                && claim
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                self.slots[idx].store(UNRESERVED, Ordering::SeqCst);
                return Ok(idx);
            }
        }

        Err(SlotError)
    }

    /// Releases a claimed slot for reuse by other threads.
    pub(crate) fn release(&self, idx: usize) {
        self.slots[idx].store(UNRESERVED, Ordering::SeqCst);
        self.claims[idx].store(false, Ordering::Release);
    }

    /// Publishes `epoch` as the reservation of slot `idx`.
    #[inline]
    pub(crate) fn publish(&self, idx: usize, epoch: u64) {
        self.slots[idx].store(epoch, Ordering::SeqCst);
    }

    /// Returns the minimum epoch reserved by any thread, or [`UNRESERVED`]
    /// if no thread currently holds a reservation.
    pub(crate) fn min_reservation(&self) -> u64 {
        let mut min = UNRESERVED;
        for slot in self.slots.iter() {
            let reservation = slot.load(Ordering::SeqCst);
            if reservation < min {
                min = reservation;
            }
        }

        min
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// OpGuard
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An active operation bracket holding the calling thread's reservation.
///
/// Dropping the guard clears the reservation. Guards are neither `Send`
/// nor `Sync`, since a reservation belongs to the thread that published
/// it.
#[derive(Debug)]
pub struct OpGuard {
    slot: usize,
    _not_send: PhantomData<*mut ()>,
}

/********** impl Drop *****************************************************************************/

impl Drop for OpGuard {
    #[inline]
    fn drop(&mut self) {
        RESERVATIONS.publish(self.slot, UNRESERVED);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// LinearizedOp
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An active operation bracket with a verified read epoch.
///
/// No record committed at or below [`epoch`](LinearizedOp::epoch) and no
/// record retired at or after it is freed while this guard is held.
#[derive(Debug)]
pub struct LinearizedOp {
    guard: OpGuard,
    epoch: u64,
}

/********** impl inherent *************************************************************************/

impl LinearizedOp {
    /// Returns the stable epoch this operation reads in.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Publishes a reservation for the current epoch without verifying it.
///
/// This protects every record alive at the published epoch from
/// reclamation, but gives no linearization point; use
/// [`start_linearized_op`] for reads that must be totally ordered against
/// writes.
///
/// # Panics
///
/// Panics if the thread is not yet registered and all reservation slots
/// are claimed.
#[inline]
pub fn start_basic_op() -> OpGuard {
    let slot = local::slot();
    RESERVATIONS.publish(slot, current());
    OpGuard { slot, _not_send: PhantomData }
}

/// Publishes a reservation and re-verifies it against the epoch counter
/// until it is stable, returning the guard together with the epoch.
///
/// # Panics
///
/// Panics if the thread is not yet registered and all reservation slots
/// are claimed.
#[inline]
pub fn start_linearized_op() -> LinearizedOp {
    let slot = local::slot();
    let mut epoch = current();
    loop {
        RESERVATIONS.publish(slot, epoch);
        let reread = current();
        if !decide!(reread != epoch, LinearizeRetries) {
            break;
        }
        epoch = reread;
    }

    LinearizedOp { guard: OpGuard { slot, _not_send: PhantomData }, epoch }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// SlotError
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Error type returned when all reservation slots are claimed.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct SlotError;

impl fmt::Display for SlotError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "all {} thread reservation slots are claimed", THREADS_MAX)
    }
}

impl error::Error for SlotError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epochs_are_monotonic() {
        let before = current();
        let created = advance();
        assert!(created > before);
        assert!(current() >= created);
    }

    #[test]
    fn basic_op_publishes_and_clears() {
        let guard = start_basic_op();
        let slot = guard.slot;
        assert_ne!(RESERVATIONS.slots[slot].load(Ordering::SeqCst), UNRESERVED);
        drop(guard);
        assert_eq!(RESERVATIONS.slots[slot].load(Ordering::SeqCst), UNRESERVED);
    }

    #[test]
    fn linearized_op_epoch_is_published() {
        let op = start_linearized_op();
        let slot = op.guard.slot;
        assert_eq!(RESERVATIONS.slots[slot].load(Ordering::SeqCst), op.epoch());
        assert!(op.epoch() <= current());
    }

    #[test]
    fn min_reservation_sees_active_guard() {
        let op = start_linearized_op();
        assert!(RESERVATIONS.min_reservation() <= op.epoch());
    }
}
