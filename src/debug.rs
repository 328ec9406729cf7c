//! Debugging via a bounded in-memory ring of recent events, compiled in
//! only with the `debug-ring` feature.
//!
//! Writers claim a slot by bumping a global sequence and then fill it in
//! without further synchronization, so two writers that lap the ring can
//! interleave within one slot. The ring is a forensic aid for inspecting
//! recent history from a debugger or after a test failure, not a log.

use core::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::io;
use std::sync::OnceLock;

use crate::local;

const RING_LOG: u64 = 13;
const RING_SLOTS: u64 = 1 << RING_LOG;
const RING_LAST_SLOT: u64 = RING_SLOTS - 1;
const MSG_SIZE: usize = 64;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);
static RING: Ring = Ring::new();
static PROCESS_NAME: OnceLock<String> = OnceLock::new();

/// Sets a human-readable process label shown by [`dump`]. The first call
/// wins; later calls are ignored.
pub fn init(name: &str) {
    let _ = PROCESS_NAME.set(name.to_string());
}

/// Appends a message to the ring, stamped with the writer's reservation
/// slot (or -1 for unregistered threads). Messages are truncated to the
/// fixed record size.
pub fn note(msg: &str) {
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let record = &RING.records[(sequence & RING_LAST_SLOT) as usize];

    record.sequence.store(sequence, Ordering::Relaxed);
    record
        .thread
        .store(local::slot_if_registered().map_or(-1, |slot| slot as i64), Ordering::Relaxed);

    let bytes = msg.as_bytes();
    for (idx, byte) in record.msg.iter().enumerate() {
        byte.store(bytes.get(idx).copied().unwrap_or(0), Ordering::Relaxed);
    }
}

/// Writes the most recent `count` ring records (newest last).
pub fn dump(out: &mut impl io::Write, count: u64) -> io::Result<()> {
    if let Some(name) = PROCESS_NAME.get() {
        writeln!(out, "-- debug ring ({}) --", name)?;
    } else {
        writeln!(out, "-- debug ring --")?;
    }

    let current = SEQUENCE.load(Ordering::Relaxed);
    let window = count.min(RING_SLOTS).min(current);
    for sequence in (current - window)..current {
        let record = &RING.records[(sequence & RING_LAST_SLOT) as usize];
        let mut bytes = [0u8; MSG_SIZE];
        for (idx, byte) in record.msg.iter().enumerate() {
            bytes[idx] = byte.load(Ordering::Relaxed);
        }
        let len = bytes.iter().position(|byte| *byte == 0).unwrap_or(MSG_SIZE);
        writeln!(
            out,
            "{:>12} [{:>5}] {}",
            record.sequence.load(Ordering::Relaxed),
            record.thread.load(Ordering::Relaxed),
            String::from_utf8_lossy(&bytes[..len]),
        )?;
    }

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Ring
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Ring {
    records: [DebugRecord; RING_SLOTS as usize],
}

/********** impl inherent *************************************************************************/

impl Ring {
    const fn new() -> Self {
        Self { records: [const { DebugRecord::new() }; RING_SLOTS as usize] }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// DebugRecord
////////////////////////////////////////////////////////////////////////////////////////////////////

struct DebugRecord {
    sequence: AtomicU64,
    thread: AtomicI64,
    msg: [AtomicU8; MSG_SIZE],
}

/********** impl inherent *************************************************************************/

impl DebugRecord {
    const fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            thread: AtomicI64::new(-1),
            msg: [const { AtomicU8::new(0) }; MSG_SIZE],
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn note_and_dump() {
        super::init("ring test");
        super::note("hello");
        super::note("world");

        let mut buf = Vec::new();
        super::dump(&mut buf, 2).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("ring test"));
        assert!(text.contains("hello") || text.contains("world"));
    }

    #[test]
    fn long_messages_are_truncated() {
        let long = "x".repeat(500);
        super::note(&long);

        let mut buf = Vec::new();
        super::dump(&mut buf, 1).unwrap();
        assert!(buf.len() < 200);
    }
}
