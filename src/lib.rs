//! Epoch-based concurrent memory reclamation and the lock-free containers
//! built on top of it.
//!
//! # Epochs
//!
//! A single process-wide counter hands out *epochs*, 64-bit logical
//! timestamps. Every write operation on a container commits to exactly one
//! epoch, acquired by bumping the counter, and every linearized read
//! operation reserves an epoch and then only observes writes committed at
//! or below it. Reservations are published in a fixed-size table with one
//! slot per registered thread, so deciding whether a retired record can be
//! freed is a single scan over that table.
//!
//! # Records
//!
//! All shared allocations are [`record::Record`]s: the payload is prefixed
//! by a hidden header carrying the creation, commit and retirement epochs.
//! A record with a zero commit epoch has been published but not yet
//! stamped; any reader that encounters one *helps* by performing the stamp
//! itself, which is what keeps reads linearizable even when the writer is
//! stalled mid-commit.
//!
//! # Containers
//!
//! [`Dict`] is an ordered, linearizable hash table keyed by caller-supplied
//! 128-bit hash values. [`Queue`] is a wait-free unbounded FIFO built from
//! linked fixed-size segments. Neither ever blocks: contention is resolved
//! with compare-and-swap, fetch-and-add and the epoch help protocol.
//!
//! # Thread lifecycle
//!
//! Threads register implicitly on their first operation, occupying one
//! reservation slot out of `EON_THREADS_MAX` (a build-time constant,
//! default 8192). The slot is released and the thread's outstanding retire
//! list is flushed when the thread exits, or eagerly via
//! [`clean_up_before_exit`].

include!(concat!(env!("OUT_DIR"), "/build_constants.rs"));

mod config;
mod epoch;
mod local;
mod map;
mod queue;
mod retired;

pub mod counters;
pub mod record;

#[cfg(feature = "debug-ring")]
pub mod debug;

pub use crate::config::{Config, ConfigBuilder};
pub use crate::epoch::{
    start_basic_op, start_linearized_op, LinearizedOp, OpGuard, SlotError,
};
pub use crate::local::{clean_up_before_exit, thread_slot, try_register_thread};
pub use crate::map::{Dict, HashValue, ViewEntry};
pub use crate::queue::Queue;
