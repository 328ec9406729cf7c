//! A wait-free unbounded FIFO queue built from linked fixed-size
//! segments.
//!
//! # Cells
//!
//! Enqueuers claim cell indices with fetch-and-add and fill the claimed
//! cell with a single CAS from EMPTY to USED. Dequeuers likewise claim
//! indices with fetch-and-add; a dequeuer that reaches a cell before its
//! enqueuer has filled it does not wait. It poisons the cell (EMPTY to
//! TOOSLOW) and moves on, and the poisoned enqueuer's CAS failure sends it
//! further ahead. Once non-EMPTY a cell never becomes EMPTY again and is
//! consumed by exactly one dequeuer.
//!
//! # Segments and help
//!
//! When a segment runs out of cells, enqueuers link a successor segment
//! and swing the segment pair forward. An enqueuer that keeps losing cells
//! doubles its index step each time, and once the step crosses the help
//! threshold it announces itself via a shared counter; while any such
//! announcement is outstanding, successor segments double in size instead
//! of using the default, so a starving enqueuer is guaranteed to win a
//! cell after logarithmically many segment hops.
//!
//! The `(enqueue segment, dequeue segment)` pair lives in a single 128-bit
//! atomic so both pointers move together. Drained segments are retired
//! through the reclamation layer; a dequeuer that is still inspecting a
//! segment holds a reservation, so the memory stays valid until it is
//! done.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicI64, AtomicU64, Ordering::SeqCst};

use crossbeam_utils::CachePadded;
use portable_atomic::AtomicU128;

use crate::config::Config;
use crate::epoch;
use crate::record::Record;
use crate::decide;

// the segment pair is two pointers packed into one 128-bit word
const _: () = assert!(core::mem::size_of::<usize>() == 8);

const EMPTY: u8 = 0;
const USED: u8 = 1;
const TOOSLOW: u8 = 2;
/// Private to teardown: the item was handed out by a dequeuer.
const TAKEN: u8 = 3;

type SegPtr<T> = *mut Record<Segment<T>>;

#[inline]
fn pack<T>(enqueue: SegPtr<T>, dequeue: SegPtr<T>) -> u128 {
    ((enqueue as usize as u128) << 64) | dequeue as usize as u128
}

#[inline]
fn unpack<T>(word: u128) -> (SegPtr<T>, SegPtr<T>) {
    (((word >> 64) as usize) as SegPtr<T>, (word as u64 as usize) as SegPtr<T>)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Queue
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A wait-free unbounded FIFO queue.
#[derive(Debug)]
pub struct Queue<T> {
    /// Packed `(enqueue segment, dequeue segment)` pointer pair.
    segments: AtomicU128,
    default_segment_size: u64,
    help_threshold: u64,
    help_needed: CachePadded<AtomicU64>,
    len: CachePadded<AtomicI64>,
    _marker: core::marker::PhantomData<T>,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

/********** impl Default **************************************************************************/

impl<T> Default for Queue<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl inherent *************************************************************************/

impl<T> Queue<T> {
    /// Creates an empty queue with the default configuration.
    #[inline]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates an empty queue with the given configuration.
    pub fn with_config(config: Config) -> Self {
        let size = 1u64 << config.segment_size_log();
        let initial = Segment::<T>::new_record(size);

        Self {
            segments: AtomicU128::new(pack(initial.as_ptr(), initial.as_ptr())),
            default_segment_size: size,
            help_threshold: config.help_threshold(),
            help_needed: CachePadded::new(AtomicU64::new(0)),
            len: CachePadded::new(AtomicI64::new(0)),
            _marker: core::marker::PhantomData,
        }
    }

    /// Returns the approximate number of queued elements.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len.load(SeqCst).max(0) as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends an element at the back of the queue.
    ///
    /// This never fails and is wait-free: contention with dequeuers only
    /// ever moves the claimed cell index forward, and the help protocol
    /// bounds the number of segment hops.
    pub fn enqueue(&self, item: T) {
        let _op = epoch::start_basic_op();

        let mut step = 1u64;
        let mut need_help = false;
        let (mut seg_ptr, _) = unpack::<T>(self.segments.load(SeqCst));
        let mut seg = unsafe { &*seg_ptr };
        let mut ix = seg.enqueue_index.fetch_add(step, SeqCst);
        let mut item = Some(item);

        loop {
            while ix < seg.size {
                let cell = &seg.cells[ix as usize];
                // the index claim is exclusive, so the slot write cannot
                // race; a concurrent dequeuer only touches the state
                unsafe { (*cell.item.get()).write(item.take().unwrap()) };
                if cell
                    .state
                    .compare_exchange(EMPTY, USED, SeqCst, SeqCst)
                    .is_ok()
                {
                    if need_help {
                        self.help_needed.fetch_sub(1, SeqCst);
                    }
                    self.len.fetch_add(1, SeqCst);
                    return;
                }

                // poisoned by a dequeuer; take the item back and jump
                // exponentially further ahead
                item = Some(unsafe { (*cell.item.get()).assume_init_read() });
                step = step.saturating_mul(2);
                ix = seg.enqueue_index.fetch_add(step, SeqCst);
            }

            // this segment has no cell left for us
            if step >= self.help_threshold && !need_help {
                need_help = true;
                self.help_needed.fetch_add(1, SeqCst);
            }

            let observed = self.segments.load(SeqCst);
            let (cur_enq, _) = unpack::<T>(observed);
            if !ptr::eq(cur_enq, seg_ptr) {
                // another thread already linked and published a successor
                seg_ptr = cur_enq;
                seg = unsafe { &*seg_ptr };
                ix = seg.enqueue_index.fetch_add(step, SeqCst);
                continue;
            }

            let new_size = if need_help || self.help_needed.load(SeqCst) > 0 {
                seg.size << 1
            } else {
                self.default_segment_size
            };

            // build the successor with our element already in cell 0
            let candidate = Segment::new_record_seeded(new_size, item.take().unwrap());
            let linked = seg
                .next
                .compare_exchange(ptr::null_mut(), candidate.as_ptr(), SeqCst, SeqCst);

            let (new_ptr, installed_ours) = match linked {
                Ok(_) => {
                    let _ = decide!(true, SegmentInstall);
                    (candidate.as_ptr(), true)
                }
                Err(winner) => {
                    let _ = decide!(false, SegmentInstall);
                    // take the element back before discarding the segment
                    // nobody else ever saw
                    let mut lost = unsafe { Record::into_data(candidate) };
                    item = Some(lost.take_seed());
                    (winner, false)
                }
            };

            // swing the enqueue side of the segment pair forward
            let mut expected = observed;
            loop {
                let (_, deq) = unpack::<T>(expected);
                let desired = pack(new_ptr, deq);
                match self.segments.compare_exchange(expected, desired, SeqCst, SeqCst) {
                    Ok(_) => break,
                    Err(actual) => {
                        let (actual_enq, _) = unpack::<T>(actual);
                        if !ptr::eq(actual_enq, seg_ptr) {
                            // somebody advanced the enqueue segment past us
                            break;
                        }
                        expected = actual;
                    }
                }
            }

            if installed_ours {
                if need_help {
                    self.help_needed.fetch_sub(1, SeqCst);
                }
                self.len.fetch_add(1, SeqCst);
                return;
            }

            // our element is still in hand; restart in the adopted segment
            seg_ptr = new_ptr;
            seg = unsafe { &*seg_ptr };
            ix = seg.enqueue_index.fetch_add(step, SeqCst);
        }
    }

    /// Removes the element at the front of the queue, or returns `None`
    /// if the queue is empty at the linearization point.
    pub fn dequeue(&self) -> Option<T> {
        let _op = epoch::start_basic_op();

        let mut segments = self.segments.load(SeqCst);
        let (_, mut seg_ptr) = unpack::<T>(segments);
        let mut seg = unsafe { &*seg_ptr };

        loop {
            loop {
                let cur = seg.dequeue_index.load(SeqCst);
                if cur >= seg.size {
                    break;
                }
                let head = seg.enqueue_index.load(SeqCst);
                if cur >= head {
                    return None;
                }

                let ix = seg.dequeue_index.fetch_add(1, SeqCst);
                if ix >= seg.size {
                    break;
                }

                let cell = &seg.cells[ix as usize];
                if cell
                    .state
                    .compare_exchange(EMPTY, TOOSLOW, SeqCst, SeqCst)
                    .is_ok()
                {
                    // the enqueuer owning this cell was too slow; it will
                    // claim another one further ahead
                    continue;
                }

                // the cell is USED and the index claim was exclusive
                let item = unsafe { (*cell.item.get()).assume_init_read() };
                cell.state.store(TAKEN, SeqCst);
                self.len.fetch_sub(1, SeqCst);
                return Some(item);
            }

            // segment exhausted, move to its successor
            let next = seg.next.load(SeqCst);
            if next.is_null() {
                // no enqueuer has linked a successor, so there is nothing
                // left to take
                return None;
            }

            loop {
                let (enq, deq) = unpack::<T>(segments);
                if !ptr::eq(deq, seg_ptr) {
                    // some other dequeuer advanced past us
                    seg_ptr = deq;
                    seg = unsafe { &*seg_ptr };
                    break;
                }
                let desired = pack(enq, next);
                match self.segments.compare_exchange(segments, desired, SeqCst, SeqCst) {
                    Ok(_) => {
                        // the drained segment may still be inspected by
                        // concurrent dequeuers holding reservations
                        unsafe { Record::retire(NonNull::new_unchecked(seg_ptr)) };
                        segments = desired;
                        seg_ptr = next;
                        seg = unsafe { &*seg_ptr };
                        break;
                    }
                    Err(actual) => segments = actual,
                }
            }
        }
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let (_, mut curr) = unpack::<T>(self.segments.load(SeqCst));
        while let Some(segment) = NonNull::new(curr) {
            curr = unsafe { segment.as_ref() }.next.load(SeqCst);
            unsafe { Record::dealloc(segment) };
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Segment
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One fixed-size link of the queue's segment chain.
#[derive(Debug)]
struct Segment<T> {
    size: u64,
    enqueue_index: CachePadded<AtomicU64>,
    dequeue_index: CachePadded<AtomicU64>,
    next: AtomicPtr<Record<Segment<T>>>,
    cells: Box<[Cell<T>]>,
}

/********** impl inherent *************************************************************************/

impl<T> Segment<T> {
    fn new(size: u64) -> Self {
        let cells: Box<[Cell<T>]> = (0..size).map(|_| Cell::new()).collect();
        Self {
            size,
            enqueue_index: CachePadded::new(AtomicU64::new(0)),
            dequeue_index: CachePadded::new(AtomicU64::new(0)),
            next: AtomicPtr::new(ptr::null_mut()),
            cells,
        }
    }

    fn new_record(size: u64) -> NonNull<Record<Segment<T>>> {
        Record::alloc_committed(Self::new(size))
    }

    /// Allocates a successor segment with `item` pre-installed in cell 0
    /// and the enqueue index already past it.
    fn new_record_seeded(size: u64, item: T) -> NonNull<Record<Segment<T>>> {
        let segment = Self::new(size);
        unsafe { (*segment.cells[0].item.get()).write(item) };
        segment.cells[0].state.store(USED, SeqCst);
        segment.enqueue_index.store(1, SeqCst);

        Record::alloc_committed(segment)
    }

    /// Takes the seeded element back out of cell 0 of an unpublished
    /// segment.
    fn take_seed(&mut self) -> T {
        debug_assert_eq!(*self.cells[0].state.get_mut(), USED);
        *self.cells[0].state.get_mut() = TAKEN;
        unsafe { (*self.cells[0].item.get()).assume_init_read() }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Cell
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Cell<T> {
    state: AtomicU8,
    item: UnsafeCell<MaybeUninit<T>>,
}

/********** impl inherent *************************************************************************/

impl<T> Cell<T> {
    #[inline]
    fn new() -> Self {
        Self { state: AtomicU8::new(EMPTY), item: UnsafeCell::new(MaybeUninit::uninit()) }
    }
}

/********** impl Debug ****************************************************************************/

impl<T> core::fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cell").field("state", &self.state.load(SeqCst)).finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for Cell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == USED {
            // enqueued but never handed out
            unsafe { self.item.get_mut().assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::config::ConfigBuilder;

    use super::Queue;

    #[test]
    fn fifo_roundtrip() {
        let queue = Queue::new();
        assert_eq!(queue.dequeue(), None);

        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn segment_rollover_preserves_order() {
        // 4 cells per segment, so 100 elements cross many segments
        let config = ConfigBuilder::new().segment_size_log(2).build();
        let queue = Queue::with_config(config);

        for value in 0..100u32 {
            queue.enqueue(value);
        }
        for value in 0..100u32 {
            assert_eq!(queue.dequeue(), Some(value));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn exact_fill_and_refill() {
        let config = ConfigBuilder::new().segment_size_log(4).build();
        let queue = Queue::with_config(config);

        // fill one segment exactly
        for value in 0..16u32 {
            queue.enqueue(value);
        }
        assert_eq!(queue.dequeue(), Some(0));

        // refill; this necessarily rolls over into a successor segment
        for value in 16..31u32 {
            queue.enqueue(value);
        }
        for value in 1..31u32 {
            assert_eq!(queue.dequeue(), Some(value));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn interleaved_enqueue_dequeue() {
        let config = ConfigBuilder::new().segment_size_log(2).build();
        let queue = Queue::with_config(config);

        let mut expected = 0u32;
        for round in 0..50u32 {
            queue.enqueue(round * 2);
            queue.enqueue(round * 2 + 1);
            assert_eq!(queue.dequeue(), Some(expected));
            expected += 1;
        }
        while let Some(value) = queue.dequeue() {
            assert_eq!(value, expected);
            expected += 1;
        }
        assert_eq!(expected, 100);
    }

    #[test]
    fn drop_releases_queued_items() {
        struct DropCount(Arc<AtomicUsize>);
        impl Drop for DropCount {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let queue = Queue::new();
        for _ in 0..10 {
            queue.enqueue(DropCount(Arc::clone(&count)));
        }
        // hand two out, drop the rest with the queue
        drop(queue.dequeue());
        drop(queue.dequeue());
        assert_eq!(count.load(Ordering::Relaxed), 2);

        drop(queue);
        assert_eq!(count.load(Ordering::Relaxed), 10);
    }
}
