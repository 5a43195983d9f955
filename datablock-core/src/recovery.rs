//! Recovery and diagnostics (spec.md §4.8): liveness checks, stale-writer
//! reclamation, orphan heartbeat cleanup, and an administrative force-reset.
//!
//! None of this runs on a background task — the core owns no threads of its
//! own (spec.md §5). Every operation here is something a caller invokes
//! explicitly: a consumer heartbeats on its own schedule, an administrator
//! sweeps orphaned heartbeats periodically, and a stale writer is reclaimed
//! inline by whichever thread next tries to acquire that slot (see
//! [`crate::slot_coordinator::acquire_write_slot`], which duplicates the
//! single-CAS reclaim here rather than calling back into this module, to
//! keep the acquire loop free of an extra indirection).

use std::time::Duration;

use shm_primitives::sync::Ordering;

use crate::error::DataBlockError;
use crate::layout::MAX_CONSUMER_HEARTBEATS;
use crate::segment::Segment;

/// Threshold past which a registered-but-unresponsive heartbeat is
/// considered orphaned, for [`sweep_orphan_heartbeats`]'s default caller.
pub const DEFAULT_ORPHAN_THRESHOLD: Duration = Duration::from_secs(30);

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Best-effort "is this PID still alive" check. A PID of 0 is never alive.
///
/// This only answers the PID-existence half of the spec's liveness check;
/// it does not cross-reference `/proc/<pid>/stat`'s start time against a
/// previously recorded value, because neither `SlotRWState` nor
/// `ConsumerHeartbeat` stores the OS process start time for the PID they
/// track (only `writer_start_ns`/`last_heartbeat_ns`, this crate's own wall
/// clock, not the kernel's). See `DESIGN.md` for why that cross-check was
/// descoped rather than silently dropped.
pub fn is_process_alive(pid: u64) -> bool {
    if pid == 0 {
        return false;
    }
    shm_primitives::pid::is_alive(pid as u32)
}

/// Whether the segment's recorded producer is still alive, cross-checked
/// against the producer PID stored in the header at `create` time. Unlike a
/// per-slot writer, the header's `producer_pid`/`producer_start_ns` are
/// never reused for a different process (they're written once, at
/// creation), so a plain liveness check on `producer_pid` is exactly the
/// cross-check the spec calls for at this granularity.
pub fn producer_is_alive(segment: &Segment) -> bool {
    is_process_alive(segment.header().producer_pid)
}

/// Scan every slot's `SlotRWState` and CAS-reclaim any whose `writer_pid` is
/// dead, logging an `orphan_writer_reclaimed` event per slot reclaimed.
/// Returns the number of slots reclaimed.
///
/// This is the administrative counterpart to the inline reclaim
/// `acquire_write_slot` performs on the single slot it's targeting — useful
/// for a periodic sweep that proactively frees slots nobody is currently
/// trying to acquire, rather than waiting for the next writer to stumble
/// onto them.
pub fn sweep_stale_writers(segment: &Segment) -> usize {
    let mut reclaimed = 0;
    for index in 0..segment.layout().slot_count as usize {
        let state = segment.slot_state(index);
        let held_pid = state.writer_pid.load(Ordering::Acquire);
        if held_pid == 0 || is_process_alive(held_pid) {
            continue;
        }
        if state
            .writer_pid
            .compare_exchange(held_pid, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            state.writer_start_ns.store(0, Ordering::Release);
            tracing::warn!(pid = held_pid, slot = index, "orphan_writer_reclaimed");
            reclaimed += 1;
        }
    }
    reclaimed
}

/// Register the calling process in the segment's fixed consumer heartbeat
/// table, returning the index it was assigned. Returns `None` if every slot
/// in `consumer_heartbeats` is already occupied by a live, registered
/// consumer (capacity is [`MAX_CONSUMER_HEARTBEATS`], a fixed, small table —
/// see spec.md §3 data model).
pub fn register_consumer_heartbeat(segment: &Segment) -> Option<usize> {
    let my_pid = shm_primitives::pid::current_pid() as u64;
    let header = segment.header();

    for (index, slot) in header.consumer_heartbeats.iter().enumerate() {
        if slot.is_registered() {
            continue;
        }
        if slot
            .registered
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            slot.pid.store(my_pid, Ordering::Release);
            slot.last_heartbeat_ns.store(now_ns(), Ordering::Release);
            header.active_consumer_count.fetch_add(1, Ordering::AcqRel);
            tracing::debug!(pid = my_pid, index, "consumer_registered");
            return Some(index);
        }
    }
    None
}

/// Refresh the `last_heartbeat_ns` timestamp for a previously registered
/// consumer slot. A no-op if `index` is out of range or no longer belongs to
/// this process (e.g. it was swept as orphaned).
pub fn refresh_consumer_heartbeat(segment: &Segment, index: usize) {
    let my_pid = shm_primitives::pid::current_pid() as u64;
    if let Some(slot) = segment.header().consumer_heartbeats.get(index) {
        if slot.is_registered() && slot.pid.load(Ordering::Acquire) == my_pid {
            slot.last_heartbeat_ns.store(now_ns(), Ordering::Release);
        }
    }
}

/// Deregister a consumer's heartbeat slot, e.g. as part of a clean detach.
pub fn deregister_consumer_heartbeat(segment: &Segment, index: usize) {
    let header = segment.header();
    if let Some(slot) = header.consumer_heartbeats.get(index) {
        if slot.is_registered() {
            slot.registered.store(0, Ordering::Release);
            slot.pid.store(0, Ordering::Release);
            header.active_consumer_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Scan `consumer_heartbeats` and clear any entry whose PID is dead *and*
/// whose `last_heartbeat_ns` is older than `threshold`. Returns the number
/// of entries cleared. Any participant may call this periodically; there is
/// no core-owned background task to do it automatically (spec.md §5).
pub fn sweep_orphan_heartbeats(segment: &Segment, threshold: Duration) -> usize {
    let header = segment.header();
    let now = now_ns();
    let threshold_ns = threshold.as_nanos() as u64;
    let mut cleared = 0;

    for (index, slot) in header.consumer_heartbeats.iter().enumerate() {
        if !slot.is_registered() {
            continue;
        }
        let pid = slot.pid.load(Ordering::Acquire);
        let last = slot.last_heartbeat_ns.load(Ordering::Acquire);
        let stale = now.saturating_sub(last) > threshold_ns;
        if stale && !is_process_alive(pid) {
            slot.registered.store(0, Ordering::Release);
            slot.pid.store(0, Ordering::Release);
            header.active_consumer_count.fetch_sub(1, Ordering::AcqRel);
            tracing::info!(pid, index, "orphan_heartbeat_cleared");
            cleared += 1;
        }
    }
    cleared
}

/// Administrative operation: reset every slot to `Free` and zero
/// `commit_sequence`, provided no slot currently has a live writer or any
/// readers. Fails with [`DataBlockError::InUse`] if a live participant is
/// found, leaving the segment untouched.
///
/// This does not reset the consumer heartbeat table or `active_consumer_count`
/// — those track *registration*, which a reset of the slot ring doesn't
/// invalidate.
pub fn force_reset(segment: &Segment) -> Result<(), DataBlockError> {
    let slot_count = segment.layout().slot_count as usize;

    for index in 0..slot_count {
        let state = segment.slot_state(index);
        let writer_pid = state.writer_pid.load(Ordering::Acquire);
        if writer_pid != 0 && is_process_alive(writer_pid) {
            return Err(DataBlockError::InUse);
        }
        if state.reader_count.load(Ordering::Acquire) > 0 {
            return Err(DataBlockError::InUse);
        }
    }

    for index in 0..slot_count {
        let state = segment.slot_state(index);
        state.writer_pid.store(0, Ordering::Release);
        state.writer_start_ns.store(0, Ordering::Release);
        state.reader_count.store(0, Ordering::Release);
        state.payload_length.store(0, Ordering::Release);
        // generation is deliberately left untouched: resetting it to 0 would
        // let a consumer's still-in-flight `next_expected_sequence` collide
        // with a freshly-reused slot's old generation and misread stale
        // bytes as a new commit. commit_sequence's reset below is the only
        // counter callers are expected to re-synchronize against.
    }
    segment.header().commit_sequence.store(0, Ordering::Release);
    tracing::warn!(slot_count, "segment_force_reset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BufferPolicy, ChecksumPolicy, Config, ConsumerSyncPolicy, OnChecksumFailPolicy, PhysicalPageSize,
    };

    fn cfg() -> Config {
        Config {
            policy: BufferPolicy::RingBuffer,
            consumer_sync_policy: ConsumerSyncPolicy::LatestOnly,
            physical_page_size: PhysicalPageSize::Small,
            ring_buffer_capacity: 4,
            logical_unit_size: 16,
            flex_zone_size: 0,
            shared_secret: 0x99,
            checksum_policy: ChecksumPolicy::None,
            on_checksum_fail: OnChecksumFailPolicy::Skip,
        }
    }

    #[test]
    fn heartbeat_register_refresh_deregister_roundtrip() {
        let name = format!("test_recovery_hb_{}", std::process::id());
        let config = cfg();
        let segment = Segment::create(&name, &config, [0; 32], [0; 32], [0; 32], 1).unwrap();

        let index = register_consumer_heartbeat(&segment).unwrap();
        assert_eq!(
            segment.header().active_consumer_count.load(Ordering::Acquire),
            1
        );

        let first = segment.header().consumer_heartbeats[index]
            .last_heartbeat_ns
            .load(Ordering::Acquire);
        refresh_consumer_heartbeat(&segment, index);
        let second = segment.header().consumer_heartbeats[index]
            .last_heartbeat_ns
            .load(Ordering::Acquire);
        assert!(second >= first);

        deregister_consumer_heartbeat(&segment, index);
        assert_eq!(
            segment.header().active_consumer_count.load(Ordering::Acquire),
            0
        );
    }

    #[test]
    fn heartbeat_table_is_bounded() {
        let name = format!("test_recovery_hb_bound_{}", std::process::id());
        let config = cfg();
        let segment = Segment::create(&name, &config, [0; 32], [0; 32], [0; 32], 1).unwrap();

        for _ in 0..MAX_CONSUMER_HEARTBEATS {
            assert!(register_consumer_heartbeat(&segment).is_some());
        }
        assert!(register_consumer_heartbeat(&segment).is_none());
    }

    #[test]
    fn force_reset_clears_slots_and_sequence() {
        let name = format!("test_recovery_reset_{}", std::process::id());
        let config = cfg();
        let segment = Segment::create(&name, &config, [0; 32], [0; 32], [0; 32], 1).unwrap();

        segment
            .header()
            .commit_sequence
            .store(7, Ordering::Release);
        force_reset(&segment).unwrap();
        assert_eq!(
            segment.header().commit_sequence.load(Ordering::Acquire),
            0
        );
    }

    #[test]
    fn force_reset_rejects_live_writer() {
        let name = format!("test_recovery_reset_busy_{}", std::process::id());
        let config = cfg();
        let segment = Segment::create(&name, &config, [0; 32], [0; 32], [0; 32], 1).unwrap();

        let state = segment.slot_state(0);
        state
            .writer_pid
            .store(shm_primitives::pid::current_pid() as u64, Ordering::Release);

        assert!(matches!(force_reset(&segment), Err(DataBlockError::InUse)));
    }
}
