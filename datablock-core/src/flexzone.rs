//! Access to the flexible zone: a region outside the slot array that both
//! the producer and consumers can read and write, guarded by
//! `Header::flexzone_spinlock` rather than the slot protocol. Used for
//! auxiliary, out-of-band state that doesn't fit the at-most-one-writer
//! slot model (run-level metadata, a control channel, a small lookup table).

use std::time::Duration;

use crate::layout::Header;
use crate::schema;
use crate::segment::Segment;

/// Default time to wait for the flexible-zone lock before giving up.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Guarded read access to the flexible zone's bytes.
///
/// Returns `None` if the zone is empty (`flex_zone_size == 0`) — there is
/// nothing to lock or read.
pub fn read<R>(segment: &Segment, timeout: Duration, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
    let region = segment.flex_zone();
    if region.is_empty() {
        return None;
    }
    let _guard = segment.header().flexzone_spinlock.lock_pid_tid(timeout).ok()?;
    // SAFETY: the spinlock guard above serializes every flexible-zone
    // accessor, in-process and cross-process, against concurrent writers.
    let bytes = unsafe { core::slice::from_raw_parts(region.as_ptr(), region.len()) };
    Some(f(bytes))
}

/// Guarded write access to the flexible zone's bytes.
///
/// Returns `None` if the zone is empty or the lock could not be acquired
/// within `timeout`.
pub fn write<R>(segment: &Segment, timeout: Duration, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
    let region = segment.flex_zone();
    if region.is_empty() {
        return None;
    }
    let _guard = segment.header().flexzone_spinlock.lock_pid_tid(timeout).ok()?;
    // SAFETY: see `read` above; the guard gives us exclusive access for the
    // duration of the closure.
    let bytes = unsafe { core::slice::from_raw_parts_mut(region.as_mut_ptr(), region.len()) };
    Some(f(bytes))
}

/// Guarded write access using the default lock timeout.
pub fn write_default<R>(segment: &Segment, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
    write(segment, DEFAULT_LOCK_TIMEOUT, f)
}

/// Guarded read access using the default lock timeout.
pub fn read_default<R>(segment: &Segment, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
    read(segment, DEFAULT_LOCK_TIMEOUT, f)
}

/// Hash the flexible zone's current contents with BLAKE2b-256, under the
/// lock, for a caller that wants to detect whether it changed since the
/// last time it looked (e.g. a consumer polling for a refreshed control
/// block). A zero-size zone always hashes to [`schema::empty_hash`].
pub fn current_hash(segment: &Segment, timeout: Duration) -> Option<[u8; 32]> {
    read(segment, timeout, schema::hash_bytes).or_else(|| {
        if segment.flex_zone().is_empty() {
            Some(schema::empty_hash())
        } else {
            None
        }
    })
}

/// Whether the zone is configured as empty. A convenience for callers
/// deciding whether to bother computing a BLDS/hash for it at all.
pub fn is_empty(header: &Header) -> bool {
    header.flex_zone_size == 0
}
