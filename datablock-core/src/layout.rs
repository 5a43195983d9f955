//! Bit-stable segment layout.
//!
//! ```text
//! +-------------------------------------------------------------------+
//! | HEADER (4096 bytes, page 0)                                       |
//! |   magic, version, config/schema hashes, policy enums               |
//! |   flexzone_spinlock, consumer_heartbeats[8], commit_sequence        |
//! +-------------------------------------------------------------------+
//! | FLEXIBLE ZONE (flex_zone_size bytes, may be empty)                 |
//! +-------------------------------------------------------------------+
//! | SLOT STATE ARRAY (slot_count * 64 bytes)                           |
//! |   one SlotRWState per slot: writer_pid, generation, checksum, ...   |
//! +-------------------------------------------------------------------+
//! | SLOT PAYLOAD ARRAY (slot_count * slot_stride bytes)                 |
//! +-------------------------------------------------------------------+
//! ```
//!
//! [`layout_of`] is a pure function of [`Config`]: creator and attacher both
//! derive the same offsets from the same config fields, so a layout
//! mismatch is always a sign of corruption, not of divergent computation.

use shm_primitives::Spinlock;

use crate::config::Config;
use crate::error::LayoutError;

/// Identifies an initialized DataBlock segment. Distinct from the teacher's
/// own magic so the two layouts are never confused if mapped side by side.
pub const MAGIC: u64 = 0x4441_5441_424C_4B31; // "DATABLK1" in ASCII, packed

pub const HEADER_VERSION_MAJOR: u16 = 1;
pub const HEADER_VERSION_MINOR: u16 = 0;

/// Number of fixed consumer heartbeat slots carried in the header.
pub const MAX_CONSUMER_HEARTBEATS: usize = 8;

/// Per-slot coordination records are indexed at this byte stride regardless
/// of `checksum_policy`; see `SlotRWState` for why this implementation fixes
/// the record at a single 64-byte width.
const SLOT_STATE_STRIDE: u64 = 64;

/// Slot payloads are padded up to a multiple of this many bytes.
const SLOT_PAYLOAD_ALIGN: u64 = 64;

const HEADER_SIZE: usize = 4096;

/// One entry in the header's fixed consumer heartbeat table.
#[repr(C, align(8))]
pub struct ConsumerHeartbeat {
    pub pid: shm_primitives::sync::AtomicU64,
    pub last_heartbeat_ns: shm_primitives::sync::AtomicU64,
    pub registered: shm_primitives::sync::AtomicU32,
    _pad: u32,
}

const _: () = assert!(core::mem::size_of::<ConsumerHeartbeat>() == 24);

impl ConsumerHeartbeat {
    pub const fn empty() -> Self {
        Self {
            pid: shm_primitives::sync::AtomicU64::new(0),
            last_heartbeat_ns: shm_primitives::sync::AtomicU64::new(0),
            registered: shm_primitives::sync::AtomicU32::new(0),
            _pad: 0,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(shm_primitives::sync::Ordering::Acquire) != 0
    }
}

/// The fixed 4096-byte segment header, first page of every DataBlock.
#[repr(C, align(64))]
pub struct Header {
    pub magic: u64,
    pub config_hash: [u8; 32],
    pub flexzone_schema_hash: [u8; 32],
    pub datablock_schema_hash: [u8; 32],
    pub shared_secret: u64,
    pub logical_unit_size: u64,
    pub slot_stride: u64,
    pub flex_zone_size: u64,
    pub flex_zone_offset: u64,
    pub slot_array_offset: u64,
    pub slot_state_array_offset: u64,
    pub producer_pid: u64,
    pub producer_start_ns: u64,
    pub commit_sequence: shm_primitives::sync::AtomicU64,
    pub flexzone_spinlock: Spinlock,
    pub schema_version: u32,
    pub slot_count: u32,
    pub active_consumer_count: shm_primitives::sync::AtomicU32,
    pub header_version_major: u16,
    pub header_version_minor: u16,
    pub policy: u8,
    pub consumer_sync_policy: u8,
    pub checksum_policy: u8,
    _pad0: [u8; 5],
    pub consumer_heartbeats: [ConsumerHeartbeat; MAX_CONSUMER_HEARTBEATS],
    _reserved: [u8; HEADER_SIZE - 432],
}

const _: () = assert!(core::mem::size_of::<Header>() == HEADER_SIZE);

impl Header {
    /// Write every header field from a validated config and computed
    /// layout. Does not touch the flexible zone, slot state array, or slot
    /// payloads; callers zero-fill the whole segment before calling this.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &mut self,
        config: &Config,
        layout: &Layout,
        config_hash: [u8; 32],
        flexzone_schema_hash: [u8; 32],
        datablock_schema_hash: [u8; 32],
        schema_version: u32,
        producer_pid: u64,
        producer_start_ns: u64,
    ) {
        use shm_primitives::sync::{AtomicU32, AtomicU64};

        self.config_hash = config_hash;
        self.flexzone_schema_hash = flexzone_schema_hash;
        self.datablock_schema_hash = datablock_schema_hash;
        self.schema_version = schema_version;
        self.shared_secret = config.shared_secret;
        self.policy = config.policy as u8;
        self.consumer_sync_policy = config.consumer_sync_policy as u8;
        self.checksum_policy = config.checksum_policy as u8;
        self.logical_unit_size = config.logical_unit_size;
        self.slot_stride = layout.slot_stride;
        self.slot_count = layout.slot_count;
        self.flex_zone_size = layout.flex_zone_size;
        self.flex_zone_offset = layout.flex_zone_offset;
        self.slot_array_offset = layout.slot_array_offset;
        self.slot_state_array_offset = layout.slot_state_array_offset;
        self.producer_pid = producer_pid;
        self.producer_start_ns = producer_start_ns;
        self.commit_sequence = AtomicU64::new(0);
        self.active_consumer_count = AtomicU32::new(0);
        self.header_version_major = HEADER_VERSION_MAJOR;
        self.header_version_minor = HEADER_VERSION_MINOR;
        for hb in &mut self.consumer_heartbeats {
            *hb = ConsumerHeartbeat::empty();
        }
        // SAFETY: this header was just zero-filled by the caller and no
        // other participant can observe it until `magic` is stored below.
        unsafe { self.flexzone_spinlock.force_reset() };

        // Publish last: any attacher that observes a nonzero magic must see
        // every field above already written. The header lives in freshly
        // mapped, zero-filled memory until this point, so a plain store
        // (rather than `Ordering::Release`) is enough; cross-process
        // visibility is provided by the mmap/page-fault path, not by this
        // store's memory ordering.
        self.magic = MAGIC;
    }

    /// Validate an attached header against the build's expectations and,
    /// when supplied, the caller's expected schema hashes and secret.
    pub fn validate(
        &self,
        shared_secret: u64,
        expected_flexzone_schema_hash: Option<[u8; 32]>,
        expected_datablock_schema_hash: Option<[u8; 32]>,
    ) -> Result<(), LayoutError> {
        if self.magic != MAGIC {
            return Err(LayoutError::BadMagic);
        }
        if self.header_version_major != HEADER_VERSION_MAJOR {
            return Err(LayoutError::VersionMismatch {
                expected: HEADER_VERSION_MAJOR,
                found: self.header_version_major,
            });
        }
        if self.shared_secret != shared_secret {
            return Err(LayoutError::SecretMismatch);
        }
        if let Some(expected) = expected_flexzone_schema_hash {
            if expected != self.flexzone_schema_hash {
                return Err(LayoutError::SchemaMismatch(crate::error::SchemaKind::FlexZone));
            }
        }
        if let Some(expected) = expected_datablock_schema_hash {
            if expected != self.datablock_schema_hash {
                return Err(LayoutError::SchemaMismatch(crate::error::SchemaKind::DataBlock));
            }
        }
        Ok(())
    }
}

/// Per-slot coordination record. Fixed at 64 bytes (not the 48 the spec's
/// data model names) so that every `checksum_policy` shares one record
/// width and `slot_state_array` can be indexed by a single constant stride
/// instead of a config-dependent one; see `DESIGN.md`.
#[repr(C, align(64))]
pub struct SlotRWState {
    pub writer_pid: shm_primitives::sync::AtomicU64,
    pub writer_start_ns: shm_primitives::sync::AtomicU64,
    pub generation: shm_primitives::sync::AtomicU64,
    pub reader_count: shm_primitives::sync::AtomicU32,
    pub payload_length: shm_primitives::sync::AtomicU32,
    /// Not atomic: only the writer holding the slot ever writes it, and
    /// readers only read it after confirming (via `generation`) that the
    /// write already published. `SlotRWState` isn't `Sync` by default
    /// because of this cell; see the `unsafe impl Sync` below.
    checksum: core::cell::UnsafeCell<[u8; 32]>,
}

const _: () = assert!(core::mem::size_of::<SlotRWState>() == 64);

// SAFETY: `checksum` is only ever mutated by the single writer currently
// holding the slot (writer_pid != 0) and only ever read by a reader that has
// already observed the matching, post-commit `generation` — the same
// protocol that makes the non-atomic payload bytes safe to share.
unsafe impl Sync for SlotRWState {}

impl SlotRWState {
    pub const fn free() -> Self {
        Self {
            writer_pid: shm_primitives::sync::AtomicU64::new(0),
            writer_start_ns: shm_primitives::sync::AtomicU64::new(0),
            generation: shm_primitives::sync::AtomicU64::new(0),
            reader_count: shm_primitives::sync::AtomicU32::new(0),
            payload_length: shm_primitives::sync::AtomicU32::new(0),
            checksum: core::cell::UnsafeCell::new([0; 32]),
        }
    }

    /// # Safety
    ///
    /// The caller must currently hold this slot as its writer (`writer_pid`
    /// set to the caller's PID) and must not call this concurrently with
    /// another write to the same slot.
    pub unsafe fn write_checksum(&self, bytes: [u8; 32]) {
        // SAFETY: forwarded to the caller.
        unsafe { *self.checksum.get() = bytes };
    }

    /// # Safety
    ///
    /// The caller must have confirmed (via `generation`) that the slot's
    /// current write has already been published, so no writer is
    /// concurrently mutating the checksum.
    pub unsafe fn read_checksum(&self) -> [u8; 32] {
        // SAFETY: forwarded to the caller.
        unsafe { *self.checksum.get() }
    }
}

/// Computed byte offsets and strides for one DataBlock segment.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub total_size: u64,
    pub flex_zone_offset: u64,
    pub flex_zone_size: u64,
    pub slot_state_array_offset: u64,
    pub slot_array_offset: u64,
    pub slot_stride: u64,
    pub slot_count: u32,
}

fn round_up(value: u64, align: u64) -> Option<u64> {
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Compute a segment's layout from its config. Pure: calling this twice with
/// the same config always returns the same offsets.
pub fn layout_of(config: &Config) -> Result<Layout, LayoutError> {
    config.validate()?;

    let header_size = core::mem::size_of::<Header>() as u64;
    let flex_zone_offset = header_size;
    let flex_zone_size = config.flex_zone_size;

    let slot_state_array_offset = flex_zone_offset
        .checked_add(flex_zone_size)
        .ok_or(LayoutError::SizeInconsistent("flex zone offset overflow"))?;

    let slot_count = config.ring_buffer_capacity;
    let slot_state_array_size = SLOT_STATE_STRIDE
        .checked_mul(slot_count as u64)
        .ok_or(LayoutError::SizeInconsistent("slot state array size overflow"))?;

    let slot_array_offset = slot_state_array_offset
        .checked_add(slot_state_array_size)
        .ok_or(LayoutError::SizeInconsistent("slot array offset overflow"))?;

    let slot_stride = round_up(config.logical_unit_size.max(1), SLOT_PAYLOAD_ALIGN)
        .ok_or(LayoutError::SizeInconsistent("slot stride overflow"))?;
    let slot_stride = if config.logical_unit_size == 0 { 0 } else { slot_stride };

    let slot_array_size = slot_stride
        .checked_mul(slot_count as u64)
        .ok_or(LayoutError::SizeInconsistent("slot array size overflow"))?;

    let raw_total = slot_array_offset
        .checked_add(slot_array_size)
        .ok_or(LayoutError::SizeInconsistent("total size overflow"))?;

    let page = config.physical_page_size.bytes();
    let total_size =
        round_up(raw_total, page).ok_or(LayoutError::SizeInconsistent("page rounding overflow"))?;

    Ok(Layout {
        total_size,
        flex_zone_offset,
        flex_zone_size,
        slot_state_array_offset,
        slot_array_offset,
        slot_stride,
        slot_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferPolicy, ChecksumPolicy, ConsumerSyncPolicy, OnChecksumFailPolicy, PhysicalPageSize};

    fn cfg(slot_count: u32, unit: u64, flex: u64) -> Config {
        Config {
            policy: BufferPolicy::RingBuffer,
            consumer_sync_policy: ConsumerSyncPolicy::LatestOnly,
            physical_page_size: PhysicalPageSize::Small,
            ring_buffer_capacity: slot_count,
            logical_unit_size: unit,
            flex_zone_size: flex,
            shared_secret: 1,
            checksum_policy: ChecksumPolicy::Enforced,
            on_checksum_fail: OnChecksumFailPolicy::Skip,
        }
    }

    #[test]
    fn header_is_exactly_one_page() {
        assert_eq!(core::mem::size_of::<Header>(), 4096);
    }

    #[test]
    fn slot_state_is_one_cache_line_multiple() {
        assert_eq!(core::mem::size_of::<SlotRWState>() % 64, 0);
    }

    #[test]
    fn layout_offsets_are_monotonic_and_nonoverlapping() {
        let layout = layout_of(&cfg(4, 16, 128)).unwrap();
        assert_eq!(layout.flex_zone_offset, 4096);
        assert_eq!(layout.slot_state_array_offset, 4096 + 128);
        assert!(layout.slot_array_offset >= layout.slot_state_array_offset + 4 * 64);
        assert!(layout.total_size >= layout.slot_array_offset + 4 * layout.slot_stride);
    }

    #[test]
    fn empty_flex_zone_contributes_no_offset_gap() {
        let layout = layout_of(&cfg(2, 16, 0)).unwrap();
        assert_eq!(layout.slot_state_array_offset, layout.flex_zone_offset);
    }

    #[test]
    fn zero_logical_unit_size_yields_zero_stride() {
        let layout = layout_of(&cfg(1, 0, 0)).unwrap();
        assert_eq!(layout.slot_stride, 0);
    }

    #[test]
    fn total_size_is_page_aligned() {
        let layout = layout_of(&cfg(4, 16, 128)).unwrap();
        assert_eq!(layout.total_size % 4096, 0);
    }
}
