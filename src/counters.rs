//! In-memory counters for performance monitoring, compiled in only with
//! the `counters` feature.
//!
//! Two kinds are kept: plain monotonic event tallies and yes/no pairs that
//! record both outcomes of a decision (e.g. how often a CAS won or lost).
//! The `tally!` and `decide!` macros compile to nothing when the feature
//! is disabled; `decide!` always evaluates to its condition so it can wrap
//! branch conditions in place.

#[cfg(feature = "counters")]
use core::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "counters")]
use std::io;

#[cfg(feature = "counters")]
const EVENT_COUNT: usize = 4;
#[cfg(feature = "counters")]
const DECISION_COUNT: usize = 11;

#[cfg(feature = "counters")]
static EVENT_NAMES: [&str; EVENT_COUNT] =
    ["allocs", "frees", "retire unused", "slot givebacks"];

#[cfg(feature = "counters")]
static DECISION_NAMES: [&str; DECISION_COUNT] = [
    "linearize retries",
    "commits",
    "commit helps",
    "bucket acquires",
    "record installs",
    "deletes",
    "new stores",
    "store installs",
    "migrated hashes",
    "migrated records",
    "segment installs",
];

#[cfg(feature = "counters")]
static EVENTS: [AtomicU64; EVENT_COUNT] =
    [const { AtomicU64::new(0) }; EVENT_COUNT];
#[cfg(feature = "counters")]
static EVENTS_LAST: [AtomicU64; EVENT_COUNT] =
    [const { AtomicU64::new(0) }; EVENT_COUNT];

#[cfg(feature = "counters")]
static DECISIONS_YES: [AtomicU64; DECISION_COUNT] =
    [const { AtomicU64::new(0) }; DECISION_COUNT];
#[cfg(feature = "counters")]
static DECISIONS_NO: [AtomicU64; DECISION_COUNT] =
    [const { AtomicU64::new(0) }; DECISION_COUNT];
#[cfg(feature = "counters")]
static DECISIONS_YES_LAST: [AtomicU64; DECISION_COUNT] =
    [const { AtomicU64::new(0) }; DECISION_COUNT];
#[cfg(feature = "counters")]
static DECISIONS_NO_LAST: [AtomicU64; DECISION_COUNT] =
    [const { AtomicU64::new(0) }; DECISION_COUNT];

/// A plain monotonic event tally.
#[cfg(feature = "counters")]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum Event {
    Allocs = 0,
    Frees = 1,
    RetireUnused = 2,
    SlotGivebacks = 3,
}

/// A named yes/no decision pair.
#[cfg(feature = "counters")]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum Decision {
    LinearizeRetries = 0,
    Commit = 1,
    CommitHelps = 2,
    BucketAcquire = 3,
    RecordInstall = 4,
    Delete = 5,
    NewStore = 6,
    StoreInstall = 7,
    MigrateHash = 8,
    MigrateRecord = 9,
    SegmentInstall = 10,
}

#[cfg(feature = "counters")]
#[doc(hidden)]
#[inline]
pub fn tally_event(event: Event) {
    EVENTS[event as usize].fetch_add(1, Ordering::Relaxed);
}

#[cfg(feature = "counters")]
#[doc(hidden)]
#[inline]
pub fn tally_decision(decision: Decision, outcome: bool) -> bool {
    if outcome {
        DECISIONS_YES[decision as usize].fetch_add(1, Ordering::Relaxed);
    } else {
        DECISIONS_NO[decision as usize].fetch_add(1, Ordering::Relaxed);
    }

    outcome
}

/// Writes all tallies accumulated since the previous call to
/// `report_delta` (or since startup) and resets the snapshot.
#[cfg(feature = "counters")]
pub fn report_delta(out: &mut impl io::Write) -> io::Result<()> {
    writeln!(out, "-- counter deltas --")?;
    for (idx, name) in EVENT_NAMES.iter().enumerate() {
        let cur = EVENTS[idx].load(Ordering::Relaxed);
        let last = EVENTS_LAST[idx].swap(cur, Ordering::Relaxed);
        writeln!(out, "{:<20} {}", name, cur - last)?;
    }
    for (idx, name) in DECISION_NAMES.iter().enumerate() {
        let yes = DECISIONS_YES[idx].load(Ordering::Relaxed);
        let no = DECISIONS_NO[idx].load(Ordering::Relaxed);
        let yes_last = DECISIONS_YES_LAST[idx].swap(yes, Ordering::Relaxed);
        let no_last = DECISIONS_NO_LAST[idx].swap(no, Ordering::Relaxed);
        write_decision(out, name, yes - yes_last, no - no_last)?;
    }

    Ok(())
}

/// Writes all tallies accumulated since startup without touching
/// the delta snapshot.
#[cfg(feature = "counters")]
pub fn report_alltime(out: &mut impl io::Write) -> io::Result<()> {
    writeln!(out, "-- counters (all time) --")?;
    for (idx, name) in EVENT_NAMES.iter().enumerate() {
        writeln!(out, "{:<20} {}", name, EVENTS[idx].load(Ordering::Relaxed))?;
    }
    for (idx, name) in DECISION_NAMES.iter().enumerate() {
        write_decision(
            out,
            name,
            DECISIONS_YES[idx].load(Ordering::Relaxed),
            DECISIONS_NO[idx].load(Ordering::Relaxed),
        )?;
    }

    Ok(())
}

#[cfg(feature = "counters")]
fn write_decision(
    out: &mut impl io::Write,
    name: &str,
    yes: u64,
    no: u64,
) -> io::Result<()> {
    let total = yes + no;
    let pct = if total == 0 { 100.0 } else { 100.0 * yes as f64 / total as f64 };
    writeln!(out, "{:<20} y: {:<10} n: {:<10} ({:.2}%)", name, yes, no, pct)
}

/// Increments a plain event tally.
#[cfg(feature = "counters")]
#[macro_export]
macro_rules! tally {
    ($event:ident) => {
        $crate::counters::tally_event($crate::counters::Event::$event)
    };
}

/// Evaluates `$cond`, records the outcome under the given decision
/// pair and yields the condition value.
#[cfg(feature = "counters")]
#[macro_export]
macro_rules! decide {
    ($cond:expr, $decision:ident) => {
        $crate::counters::tally_decision(
            $crate::counters::Decision::$decision,
            $cond,
        )
    };
}

/// Increments a plain event tally (disabled, compiles to nothing).
#[cfg(not(feature = "counters"))]
#[macro_export]
macro_rules! tally {
    ($event:ident) => {{}};
}

/// Evaluates and yields `$cond` (tallying disabled).
#[cfg(not(feature = "counters"))]
#[macro_export]
macro_rules! decide {
    ($cond:expr, $decision:ident) => {
        $cond
    };
}
