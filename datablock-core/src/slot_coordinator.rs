//! The per-slot atomic state machine: one writer, N readers, sequenced
//! entirely through `SlotRWState`'s atomics with explicit acquire/release
//! ordering. This is where the single-writer/multi-reader protocol and the
//! TOCTTOU-safe reader handshake live; the producer/consumer façades are
//! thin wrappers that also own timeouts, checksums, and handle bookkeeping.
//!
//! # State machine
//!
//! ```text
//! Free (writer_pid=0, reader_count=0)
//!   --CAS writer_pid 0->pid-->           Writing (writer_pid != 0)
//!   <--generation++, writer_pid=0 (commit)--
//! Readable (writer_pid=0, reader_count>=0)
//!   --reader_count fetch_add/fetch_sub--> Readable
//!   --CAS writer_pid 0->pid, requires reader_count==0--> Writing
//! any state --dead writer_pid reclaimed by CAS--> Free
//! ```

use std::time::{Duration, Instant};

use shm_primitives::sync::Ordering;

use crate::error::AcquireError;
use crate::segment::Segment;

const SPIN_ITERATIONS_MAX: u32 = 1024;
const SLEEP_CAP: Duration = Duration::from_millis(4);

fn backoff(spins: &mut u32) {
    if *spins < SPIN_ITERATIONS_MAX {
        for _ in 0..*spins {
            core::hint::spin_loop();
        }
        *spins = (*spins * 2).min(SPIN_ITERATIONS_MAX);
    } else {
        std::thread::sleep(SLEEP_CAP);
    }
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// The slot index the next write (or the commit at sequence `seq`) targets.
/// Unified across `Single`/`DoubleBuffer`/`RingBuffer`: `Single` always has
/// `slot_count == 1`, and `DoubleBuffer`'s alternation is exactly
/// `commit_sequence % 2` when `slot_count == 2`, so one formula covers all
/// three policies.
pub fn slot_index_for_sequence(seq: u64, slot_count: u64) -> usize {
    (seq % slot_count) as usize
}

/// The generation a slot must have for it to hold the `seq`-th (0-based)
/// commit, given `slot_index_for_sequence(seq, slot_count)`.
pub fn expected_generation_for_sequence(seq: u64, slot_count: u64) -> u64 {
    seq / slot_count + 1
}

/// Acquire the slot that the next write targets. Spins with exponential
/// backoff, reclaiming a zombie writer in place, until `timeout` elapses.
pub fn acquire_write_slot(segment: &Segment, timeout: Duration) -> Result<usize, AcquireError> {
    let slot_count = segment.layout().slot_count as u64;
    let my_pid = shm_primitives::pid::current_pid() as u64;
    let deadline = Instant::now() + timeout;
    let mut spins: u32 = 1;

    loop {
        let commit_seq = segment.header().commit_sequence.load(Ordering::Acquire);
        let slot_index = slot_index_for_sequence(commit_seq, slot_count);
        let state = segment.slot_state(slot_index);

        let held_pid = state.writer_pid.load(Ordering::Acquire);
        if held_pid != 0 {
            if !shm_primitives::pid::is_alive(held_pid as u32) {
                if state
                    .writer_pid
                    .compare_exchange(held_pid, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::warn!(pid = held_pid, slot = slot_index, "orphan_writer_reclaimed");
                    state.writer_start_ns.store(0, Ordering::Release);
                }
                continue;
            }
            if Instant::now() >= deadline {
                return Err(AcquireError::Timeout);
            }
            backoff(&mut spins);
            continue;
        }

        if state.reader_count.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                return Err(AcquireError::Timeout);
            }
            backoff(&mut spins);
            continue;
        }

        if state
            .writer_pid
            .compare_exchange(0, my_pid, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }

        state.writer_start_ns.store(now_ns(), Ordering::Release);
        return Ok(slot_index);
    }
}

/// Publish a commit: write `payload_length`, bump `generation`, clear
/// `writer_pid`, and advance the segment's `commit_sequence`. The caller
/// has already written the payload bytes (and, if applicable, the
/// checksum) before calling this.
pub fn publish_commit(segment: &Segment, slot_index: usize, used_len: u32) {
    let state = segment.slot_state(slot_index);
    state.payload_length.store(used_len, Ordering::Release);
    state.generation.fetch_add(1, Ordering::Release);
    state.writer_pid.store(0, Ordering::Release);
    segment.header().commit_sequence.fetch_add(1, Ordering::Release);
}

/// Release a slot without publishing: clears `writer_pid` only. The slot
/// remains at its previous generation and `commit_sequence` is untouched.
pub fn discard_write_slot(segment: &Segment, slot_index: usize) {
    let state = segment.slot_state(slot_index);
    state.writer_pid.store(0, Ordering::Release);
}

/// Result of one reader-acquisition attempt at a given target sequence.
pub enum ReadOutcome {
    /// The slot is readable at the expected generation; `reader_count` has
    /// already been incremented on the caller's behalf.
    Ready { slot_index: usize, generation: u64 },
    /// `commit_sequence` hasn't reached this target yet.
    NotYetCommitted,
    /// A writer currently holds the target slot, or the TOCTTOU re-check
    /// after incrementing `reader_count` failed; caller should retry.
    Busy,
    /// More than `slot_count` commits have happened since `next_expected`;
    /// the target slot was overwritten before this reader got to it.
    Wrapped { current_commit_sequence: u64 },
}

/// Attempt to acquire the slot holding the `next_expected`-th (0-based)
/// commit for reading. TOCTTOU-safe: snapshots `(writer_pid, generation)`
/// before incrementing `reader_count`, then re-checks both after.
pub fn try_acquire_read_slot(segment: &Segment, next_expected: u64) -> ReadOutcome {
    let slot_count = segment.layout().slot_count as u64;
    let commit_seq = segment.header().commit_sequence.load(Ordering::Acquire);

    if commit_seq <= next_expected {
        return ReadOutcome::NotYetCommitted;
    }
    if commit_seq - next_expected > slot_count {
        return ReadOutcome::Wrapped {
            current_commit_sequence: commit_seq,
        };
    }

    let slot_index = slot_index_for_sequence(next_expected, slot_count);
    let expected_generation = expected_generation_for_sequence(next_expected, slot_count);
    let state = segment.slot_state(slot_index);

    let writer_pid = state.writer_pid.load(Ordering::Acquire);
    let generation = state.generation.load(Ordering::Acquire);
    if writer_pid != 0 || generation != expected_generation {
        return ReadOutcome::Busy;
    }

    state.reader_count.fetch_add(1, Ordering::AcqRel);

    let writer_pid = state.writer_pid.load(Ordering::Acquire);
    let generation = state.generation.load(Ordering::Acquire);
    if writer_pid != 0 || generation != expected_generation {
        state.reader_count.fetch_sub(1, Ordering::AcqRel);
        return ReadOutcome::Busy;
    }

    ReadOutcome::Ready {
        slot_index,
        generation: expected_generation,
    }
}

/// Release a previously acquired read slot.
pub fn release_read_slot(segment: &Segment, slot_index: usize) {
    segment.slot_state(slot_index).reader_count.fetch_sub(1, Ordering::AcqRel);
}

/// Block (spin + sleep, up to `timeout`) until `try_acquire_read_slot`
/// returns something other than `Busy`/`NotYetCommitted`, or the timeout
/// elapses.
pub fn acquire_read_slot_blocking(
    segment: &Segment,
    next_expected: u64,
    timeout: Duration,
) -> Result<ReadOutcome, ()> {
    let deadline = Instant::now() + timeout;
    let mut spins: u32 = 1;
    loop {
        match try_acquire_read_slot(segment, next_expected) {
            ReadOutcome::NotYetCommitted | ReadOutcome::Busy => {
                if Instant::now() >= deadline {
                    return Err(());
                }
                backoff(&mut spins);
            }
            other => return Ok(other),
        }
    }
}
