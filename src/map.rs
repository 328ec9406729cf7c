//! An ordered, linearizable hash table over caller-supplied 128-bit hash
//! values.
//!
//! # Buckets and record history
//!
//! The table is a power-of-two array of buckets, each holding a 128-bit
//! hash value (zero while unclaimed) and the head of a list of records.
//! Writes push a new record carrying the full new state onto the head of
//! the list and never modify or unlink older records; a record becomes
//! garbage only once a newer record supersedes it, at which point it is
//! retired through the reclamation layer. Readers pick the newest record
//! whose commit epoch lies at or below their reservation, so every list
//! doubles as the bucket's recent history.
//!
//! Bucket hash values are immutable once claimed. Deletions are ordinary
//! records without a payload, so a deleted key keeps its bucket until the
//! next migration.
//!
//! # Contended installs
//!
//! A writer whose head CAS loses does not retry. The losing write is
//! treated as committed in the same epoch as the winning one, an instant
//! earlier: no reader can possibly have observed it, so the loser frees
//! its record immediately and reports the state it invisibly replaced.
//! This keeps every write wait-free at the cost of letting two racing
//! writers both report the same previous item.
//!
//! # Migration
//!
//! When claimed buckets reach the configured load threshold the store is
//! migrated. Every thread that notices an in-progress migration helps:
//! buckets are frozen by tagging their head pointers, the newest committed
//! record of each live bucket is relocated (by pointer, so concurrent
//! readers can still walk into the old history), and the successor store
//! is published with a single CAS. Writers that lose against a freeze tag
//! re-run against the successor.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering::SeqCst};

use portable_atomic::AtomicU128;

use crate::config::Config;
use crate::epoch;
use crate::record::Record;
use crate::decide;

/// Freeze tag: the bucket is being migrated and rejects new installs.
const MOVING: usize = 0b01;
/// The bucket's record has been relocated to the successor store.
const MOVED: usize = 0b10;
const FLAGS: usize = MOVING | MOVED;

const DEFAULT_CAPACITY_LOG: u32 = 6;

type RecPtr<T> = *mut Record<Rec<T>>;
type StorePtr<T> = *mut Record<Store<T>>;

#[inline]
fn untag<T>(raw: usize) -> RecPtr<T> {
    (raw & !FLAGS) as RecPtr<T>
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// HashValue
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A caller-supplied 128-bit hash value, treated as full object identity.
///
/// The table never hashes keys itself and compares nothing but these
/// values. Zero is reserved as the empty-bucket sentinel.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct HashValue(u128);

/********** impl inherent *************************************************************************/

impl HashValue {
    /// Creates a hash value.
    ///
    /// # Panics
    ///
    /// Panics if `value` is zero.
    #[inline]
    pub const fn new(value: u128) -> Self {
        assert!(value != 0, "hash value zero is reserved for empty buckets");
        Self(value)
    }

    /// Creates a hash value from two 64-bit halves.
    ///
    /// # Panics
    ///
    /// Panics if both halves are zero.
    #[inline]
    pub const fn from_parts(high: u64, low: u64) -> Self {
        Self::new(((high as u128) << 64) | low as u128)
    }

    /// Returns the raw 128-bit value.
    #[inline]
    pub const fn get(self) -> u128 {
        self.0
    }

    /// The bucket index is derived from the low word by capacity mask.
    #[inline]
    fn index(self) -> u64 {
        self.0 as u64
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ViewEntry
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One entry of an ordered, linearized snapshot of the table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ViewEntry<T> {
    pub hv: HashValue,
    pub item: T,
    /// The epoch at which the key first became visible; entries are
    /// ordered by this, not by their latest update.
    pub sort_epoch: u64,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Dict
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An ordered, linearizable lock-free hash table.
#[derive(Debug)]
pub struct Dict<T> {
    store: AtomicPtr<Record<Store<T>>>,
    config: Config,
}

unsafe impl<T: Send + Sync> Send for Dict<T> {}
unsafe impl<T: Send + Sync> Sync for Dict<T> {}

/********** impl Default **************************************************************************/

impl<T> Default for Dict<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl inherent *************************************************************************/

impl<T> Dict<T> {
    /// Creates an empty table with the default capacity and configuration.
    #[inline]
    pub fn new() -> Self {
        Self::with_store(DEFAULT_CAPACITY_LOG, Config::default())
    }

    /// Creates an empty table with the given configuration.
    #[inline]
    pub fn with_config(config: Config) -> Self {
        Self::with_store(DEFAULT_CAPACITY_LOG, config)
    }

    /// Creates an empty table with `2^capacity_log` buckets.
    ///
    /// # Panics
    ///
    /// Panics if `capacity_log` is outside of `[2, 40]`.
    #[inline]
    pub fn with_capacity_log(capacity_log: u32) -> Self {
        Self::with_store(capacity_log, Config::default())
    }

    fn with_store(capacity_log: u32, config: Config) -> Self {
        assert!(
            (2..=40).contains(&capacity_log),
            "capacity log must be in [2, 40]"
        );
        let store = Store::new_record(1 << capacity_log, &config);
        Self { store: AtomicPtr::new(store.as_ptr()), config }
    }

    /// Returns the approximate number of live entries.
    ///
    /// The counters may lag behind in-flight operations; the count matches
    /// a linearized view only in quiescence.
    #[inline]
    pub fn len(&self) -> u64 {
        let _op = epoch::start_basic_op();
        let store = unsafe { &*self.store.load(SeqCst) };
        let used = store.used_count.load(SeqCst);
        let del = store.del_count.load(SeqCst);
        used.saturating_sub(del)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Dict<T> {
    /// Returns the item stored under `hv` at the operation's linearization
    /// epoch, or `None` if the key is absent.
    pub fn get(&self, hv: HashValue) -> Option<T> {
        let op = epoch::start_linearized_op();
        let store = unsafe { &*self.store.load(SeqCst) };
        store.get(hv, op.epoch())
    }

    /// Inserts or overwrites the item stored under `hv`, returning the
    /// previous item if the key was present.
    ///
    /// With `overwrite_ok` set to `false` an existing entry is left
    /// untouched and its current item is returned instead.
    pub fn put(&self, hv: HashValue, item: T, overwrite_ok: bool) -> Option<T> {
        let _op = epoch::start_basic_op();
        let mut item = item;
        loop {
            let store_ptr = self.store.load(SeqCst);
            let store = unsafe { &*store_ptr };
            match store.put(self, store_ptr, hv, item, overwrite_ok) {
                Ok(prev) => return prev,
                Err(returned) => item = returned,
            }
        }
    }

    /// Removes the entry stored under `hv`, returning its item if the key
    /// was present.
    pub fn remove(&self, hv: HashValue) -> Option<T> {
        let _op = epoch::start_basic_op();
        loop {
            let store_ptr = self.store.load(SeqCst);
            let store = unsafe { &*store_ptr };
            if let Ok(prev) = store.remove(self, store_ptr, hv) {
                return prev;
            }
        }
    }

    /// Returns a linearized snapshot of the table, ordered by the epoch at
    /// which each key was first inserted.
    pub fn view(&self) -> Vec<ViewEntry<T>> {
        let op = epoch::start_linearized_op();
        let store = unsafe { &*self.store.load(SeqCst) };
        let mut entries = Vec::new();
        store.collect_view(op.epoch(), &mut entries);
        drop(op);

        entries.sort_by_key(|entry| entry.sort_epoch);
        entries
    }
}

/********** impl Drop *****************************************************************************/

impl<T> Drop for Dict<T> {
    fn drop(&mut self) {
        let store_ptr = *self.store.get_mut();
        let store = unsafe { &*store_ptr };

        // records below each head were already retired when they were
        // superseded and are freed through their owners' retire lists
        for bucket in store.buckets.iter() {
            if let Some(head) = NonNull::new(untag::<T>(bucket.head.load(SeqCst))) {
                unsafe { Record::dealloc(head) };
            }
        }

        unsafe { Record::dealloc(NonNull::new_unchecked(store_ptr)) };
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Rec
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One write to one bucket. `item` is `None` for deletion records.
#[derive(Debug)]
struct Rec<T> {
    next: RecPtr<T>,
    item: Option<T>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Bucket
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
struct Bucket<T> {
    hv: AtomicU128,
    /// Record pointer with the `MOVING`/`MOVED` tags in the low bits.
    head: AtomicUsize,
    _marker: core::marker::PhantomData<RecPtr<T>>,
}

/********** impl inherent *************************************************************************/

impl<T> Bucket<T> {
    #[inline]
    fn new() -> Self {
        Self {
            hv: AtomicU128::new(0),
            head: AtomicUsize::new(0),
            _marker: core::marker::PhantomData,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Store
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One power-of-two bucket array; the table swaps stores on migration.
#[derive(Debug)]
struct Store<T> {
    last_slot: u64,
    threshold: u64,
    used_count: AtomicU64,
    del_count: AtomicU64,
    next: AtomicPtr<Record<Store<T>>>,
    buckets: Box<[Bucket<T>]>,
}

/********** impl inherent *************************************************************************/

impl<T> Store<T> {
    fn new_record(capacity: u64, config: &Config) -> NonNull<Record<Store<T>>> {
        debug_assert!(capacity.is_power_of_two());
        let buckets: Box<[Bucket<T>]> = (0..capacity).map(|_| Bucket::new()).collect();

        Record::alloc_committed(Store {
            last_slot: capacity - 1,
            threshold: capacity * config.mig_load_pct() / 100,
            used_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            buckets,
        })
    }

    /// Probes for the bucket already claimed by `hv`, without claiming.
    fn find_bucket(&self, hv: HashValue) -> Option<&Bucket<T>> {
        let mask = self.last_slot;
        let mut slot = hv.index() & mask;
        for _ in 0..=mask {
            let bucket = &self.buckets[slot as usize];
            let current = bucket.hv.load(SeqCst);
            if current == 0 {
                return None;
            }
            if current == hv.get() {
                return Some(bucket);
            }
            slot = (slot + 1) & mask;
        }

        None
    }

    /// Probes for the bucket owned by `hv`, claiming an empty one if
    /// necessary. Returns `None` after triggering a migration.
    fn acquire_bucket(
        &self,
        dict: &Dict<T>,
        self_ptr: StorePtr<T>,
        hv: HashValue,
    ) -> Option<&Bucket<T>> {
        let mask = self.last_slot;
        let mut slot = hv.index() & mask;
        for _ in 0..=mask {
            let bucket = &self.buckets[slot as usize];
            let mut current = bucket.hv.load(SeqCst);
            if current == 0 {
                match bucket.hv.compare_exchange(0, hv.get(), SeqCst, SeqCst) {
                    Ok(_) => {
                        let _ = decide!(true, BucketAcquire);
                        let used = self.used_count.fetch_add(1, SeqCst) + 1;
                        if used + self.del_count.load(SeqCst) >= self.threshold {
                            self.migrate(dict, self_ptr);
                            return None;
                        }
                        return Some(bucket);
                    }
                    Err(actual) => {
                        let _ = decide!(false, BucketAcquire);
                        current = actual;
                    }
                }
            }
            if current == hv.get() {
                return Some(bucket);
            }
            slot = (slot + 1) & mask;
        }

        // every bucket is claimed by some other hash value
        self.migrate(dict, self_ptr);
        None
    }

    /// Cooperatively migrates this store into its successor and attempts
    /// to publish it, returning the successor.
    fn migrate(&self, dict: &Dict<T>, self_ptr: StorePtr<T>) -> StorePtr<T> {
        let mut next_ptr = self.next.load(SeqCst);
        if next_ptr.is_null() {
            let capacity = self.last_slot + 1;
            let live = self
                .used_count
                .load(SeqCst)
                .saturating_sub(self.del_count.load(SeqCst));
            let new_capacity = if live <= capacity * dict.config.mig_grow_pct() / 100 {
                capacity
            } else {
                capacity * 2
            };

            let candidate = Store::new_record(new_capacity, &dict.config);
            match self
                .next
                .compare_exchange(ptr::null_mut(), candidate.as_ptr(), SeqCst, SeqCst)
            {
                Ok(_) => {
                    let _ = decide!(true, NewStore);
                    next_ptr = candidate.as_ptr();
                }
                Err(winner) => {
                    let _ = decide!(false, NewStore);
                    unsafe { Record::retire_unused(candidate) };
                    next_ptr = winner;
                }
            }
        }
        let next = unsafe { &*next_ptr };

        for bucket in self.buckets.iter() {
            // freeze first so no new record can be installed underneath
            let head_raw = bucket.head.fetch_or(MOVING, SeqCst);
            if head_raw & MOVED != 0 {
                continue;
            }
            let head = untag::<T>(head_raw);

            if let Some(record) = unsafe { head.as_ref() } {
                record.header().help_commit();
                if record.item.is_some() {
                    // relocate the record itself; its list tail keeps the
                    // old history reachable for readers at older epochs
                    let hv = HashValue(bucket.hv.load(SeqCst));
                    next.install_migrated(hv, head);
                }
            }

            let sealed = bucket.head.fetch_or(MOVED, SeqCst);
            if sealed & MOVED == 0 {
                // the first thread to seal the bucket retires a dead head;
                // live heads stay allocated in the successor store
                if let Some(record) = unsafe { head.as_ref() } {
                    if record.item.is_none() {
                        unsafe { Record::retire(NonNull::new_unchecked(head)) };
                    }
                }
            }
        }

        let published = dict
            .store
            .compare_exchange(self_ptr, next_ptr, SeqCst, SeqCst)
            .is_ok();
        if decide!(published, StoreInstall) {
            unsafe { Record::retire(NonNull::new_unchecked(self_ptr)) };
        }

        next_ptr
    }

    /// Installs a record relocated from the predecessor store.
    fn install_migrated(&self, hv: HashValue, record: RecPtr<T>) {
        let mask = self.last_slot;
        let mut slot = hv.index() & mask;
        for _ in 0..=mask {
            let bucket = &self.buckets[slot as usize];
            let mut current = bucket.hv.load(SeqCst);
            if current == 0 {
                match bucket.hv.compare_exchange(0, hv.get(), SeqCst, SeqCst) {
                    Ok(_) => {
                        let _ = decide!(true, MigrateHash);
                        self.used_count.fetch_add(1, SeqCst);
                        current = hv.get();
                    }
                    Err(actual) => {
                        let _ = decide!(false, MigrateHash);
                        current = actual;
                    }
                }
            }
            if current == hv.get() {
                // competing migrators install the same record, and writers
                // may already have stacked newer records on top; a failed
                // CAS means the bucket is migrated either way
                let _ = decide!(
                    bucket
                        .head
                        .compare_exchange(0, record as usize, SeqCst, SeqCst)
                        .is_ok(),
                    MigrateRecord
                );
                return;
            }
            slot = (slot + 1) & mask;
        }

        unreachable!("successor store cannot run out of buckets during migration");
    }
}

impl<T: Clone> Store<T> {
    fn get(&self, hv: HashValue, epoch: u64) -> Option<T> {
        let bucket = self.find_bucket(hv)?;
        let mut rec = untag::<T>(bucket.head.load(SeqCst));
        while let Some(record) = unsafe { rec.as_ref() } {
            record.header().help_commit();
            if record.header().write_epoch() <= epoch {
                return record.item.clone();
            }
            rec = record.next;
        }

        None
    }

    fn put(
        &self,
        dict: &Dict<T>,
        self_ptr: StorePtr<T>,
        hv: HashValue,
        item: T,
        overwrite_ok: bool,
    ) -> Result<Option<T>, T> {
        let bucket = match self.acquire_bucket(dict, self_ptr, hv) {
            Some(bucket) => bucket,
            None => return Err(item),
        };

        let head_raw = bucket.head.load(SeqCst);
        if head_raw & MOVING != 0 {
            self.migrate(dict, self_ptr);
            return Err(item);
        }

        let head = untag::<T>(head_raw);
        let prev = unsafe { head.as_ref() };
        if let Some(prev) = prev {
            prev.header().help_commit();
        }
        let old_item = prev.and_then(|prev| prev.item.clone());

        if !overwrite_ok && old_item.is_some() {
            return Ok(old_item);
        }

        let record = Record::alloc(Rec { next: head, item: Some(item) });
        if let Some(prev) = prev {
            if prev.item.is_some() {
                // an overwrite keeps sorting at the key's first insertion
                unsafe { record.as_ref() }
                    .header()
                    .set_create_epoch(prev.header().sort_epoch());
            }
        }

        let installed = bucket
            .head
            .compare_exchange(head_raw, record.as_ptr() as usize, SeqCst, SeqCst)
            .is_ok();

        if decide!(installed, RecordInstall) {
            unsafe { record.as_ref() }.header().commit_write();
            if let Some(prev_head) = NonNull::new(head) {
                if prev.map_or(false, |prev| prev.item.is_none()) {
                    // reviving a bucket that held a deletion record
                    self.del_count.fetch_sub(1, SeqCst);
                }
                unsafe { Record::retire(prev_head) };
            }
            Ok(old_item)
        } else {
            let data = unsafe { Record::into_data(record) };
            if bucket.head.load(SeqCst) & MOVING != 0 {
                self.migrate(dict, self_ptr);
                return match data.item {
                    Some(item) => Err(item),
                    None => unreachable!(),
                };
            }
            // lost the install to a concurrent writer: the losing write is
            // sequenced an instant before the winning one in the same
            // epoch and was never observable
            Ok(old_item)
        }
    }

    fn remove(
        &self,
        dict: &Dict<T>,
        self_ptr: StorePtr<T>,
        hv: HashValue,
    ) -> Result<Option<T>, ()> {
        let bucket = match self.find_bucket(hv) {
            Some(bucket) => bucket,
            None => return Ok(None),
        };

        let head_raw = bucket.head.load(SeqCst);
        if head_raw & MOVING != 0 {
            self.migrate(dict, self_ptr);
            return Err(());
        }

        let head = untag::<T>(head_raw);
        let prev = match unsafe { head.as_ref() } {
            Some(prev) => prev,
            None => return Ok(None),
        };
        prev.header().help_commit();

        let old_item = match prev.item.clone() {
            Some(item) => item,
            None => return Ok(None),
        };

        let record = Record::alloc(Rec { next: head, item: None });
        let installed = bucket
            .head
            .compare_exchange(head_raw, record.as_ptr() as usize, SeqCst, SeqCst)
            .is_ok();

        if decide!(installed, Delete) {
            unsafe { record.as_ref() }.header().commit_write();
            self.del_count.fetch_add(1, SeqCst);
            unsafe { Record::retire(NonNull::new_unchecked(head)) };
            Ok(Some(old_item))
        } else {
            let _ = unsafe { Record::into_data(record) };
            if bucket.head.load(SeqCst) & MOVING != 0 {
                self.migrate(dict, self_ptr);
                return Err(());
            }
            // lost to a concurrent writer; the invisible deletion still
            // reports the item it (momentarily) removed
            Ok(Some(old_item))
        }
    }

    fn collect_view(&self, epoch: u64, entries: &mut Vec<ViewEntry<T>>) {
        for bucket in self.buckets.iter() {
            let hv = bucket.hv.load(SeqCst);
            if hv == 0 {
                continue;
            }
            let mut rec = untag::<T>(bucket.head.load(SeqCst));
            while let Some(record) = unsafe { rec.as_ref() } {
                record.header().help_commit();
                if record.header().write_epoch() <= epoch {
                    if let Some(item) = record.item.clone() {
                        entries.push(ViewEntry {
                            hv: HashValue(hv),
                            item,
                            sort_epoch: record.header().sort_epoch(),
                        });
                    }
                    break;
                }
                rec = record.next;
            }
        }
    }
}
