//! Frozen, validated configuration for a DataBlock segment.
//!
//! A [`Config`] is consumed once by [`crate::layout::layout_of`] to derive a
//! [`crate::layout::Layout`]; both the creator and every attacher recompute
//! the same layout from the same fields, so a corrupted header is detectable
//! rather than silently misread.

use crate::error::InvalidConfig;

/// Slot-selection policy: how the writer picks the next slot to acquire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPolicy {
    /// A single slot, always index 0. Every commit overwrites the same slot.
    Single = 0,
    /// Two slots, alternating: `next = (last_written + 1) % 2`.
    DoubleBuffer = 1,
    /// `slot_count` slots addressed by `commit_sequence mod slot_count`.
    RingBuffer = 2,
}

/// How consumers track their position in the slot stream.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerSyncPolicy {
    /// Each read targets `commit_sequence - 1`; wrap-around is normal.
    LatestOnly = 0,
    /// Each slot is meant to be seen by exactly one reader in the group.
    SingleReader = 1,
    /// A slot is only yielded once every registered reader has reached it.
    SyncReader = 2,
}

/// Integrity-checking policy applied at commit and release.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// No checksum is ever computed or stored.
    None = 0,
    /// The producer opts in per-slot; the consumer verifies if present.
    Manual = 1,
    /// Every commit computes a checksum; every release verifies it.
    Enforced = 2,
}

/// Consumer-side behavior when a checksum verification fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnChecksumFailPolicy {
    /// Drop the slot silently; the iterator moves on to the next one.
    Skip,
    /// Surface the slot to the caller anyway, alongside the failure.
    Pass,
}

/// Physical page size the segment is rounded up to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalPageSize {
    /// 4 KiB pages.
    Small,
    /// 4 MiB huge pages.
    Huge,
}

impl PhysicalPageSize {
    /// The page size in bytes.
    pub const fn bytes(self) -> u64 {
        match self {
            PhysicalPageSize::Small => 4 * 1024,
            PhysicalPageSize::Huge => 4 * 1024 * 1024,
        }
    }
}

/// The frozen configuration a DataBlock segment is created with.
///
/// `Config::validate` is the single source of truth for which combinations
/// are accepted; [`crate::layout::layout_of`] assumes a validated config and
/// does not re-check these invariants.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub policy: BufferPolicy,
    pub consumer_sync_policy: ConsumerSyncPolicy,
    pub physical_page_size: PhysicalPageSize,
    pub ring_buffer_capacity: u32,
    pub logical_unit_size: u64,
    pub flex_zone_size: u64,
    pub shared_secret: u64,
    pub checksum_policy: ChecksumPolicy,
    pub on_checksum_fail: OnChecksumFailPolicy,
}

impl Config {
    /// Validate this configuration, returning the first violated invariant.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        match self.policy {
            BufferPolicy::Single if self.ring_buffer_capacity != 1 => {
                return Err(InvalidConfig("Single policy requires ring_buffer_capacity == 1"));
            }
            BufferPolicy::DoubleBuffer if self.ring_buffer_capacity != 2 => {
                return Err(InvalidConfig(
                    "DoubleBuffer policy requires ring_buffer_capacity == 2",
                ));
            }
            BufferPolicy::RingBuffer if self.ring_buffer_capacity < 1 => {
                return Err(InvalidConfig("RingBuffer policy requires ring_buffer_capacity >= 1"));
            }
            _ => {}
        }

        if matches!(
            self.consumer_sync_policy,
            ConsumerSyncPolicy::SingleReader | ConsumerSyncPolicy::SyncReader
        ) && self.ring_buffer_capacity < 1
        {
            return Err(InvalidConfig("SingleReader/SyncReader require at least one slot"));
        }

        if self.logical_unit_size == 0 && self.ring_buffer_capacity == 0 {
            return Err(InvalidConfig("zero-payload channels still require at least one slot"));
        }

        Ok(())
    }

    /// Whether `ring_buffer_capacity == 1`, which the spec treats as
    /// equivalent to `Single` regardless of the declared policy.
    pub fn is_single_slot(&self) -> bool {
        self.ring_buffer_capacity == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            policy: BufferPolicy::RingBuffer,
            consumer_sync_policy: ConsumerSyncPolicy::LatestOnly,
            physical_page_size: PhysicalPageSize::Small,
            ring_buffer_capacity: 4,
            logical_unit_size: 16,
            flex_zone_size: 0,
            shared_secret: 0xdead_beef,
            checksum_policy: ChecksumPolicy::Enforced,
            on_checksum_fail: OnChecksumFailPolicy::Skip,
        }
    }

    #[test]
    fn valid_ring_buffer_passes() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn single_requires_capacity_one() {
        let cfg = Config {
            policy: BufferPolicy::Single,
            ring_buffer_capacity: 3,
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn double_buffer_requires_capacity_two() {
        let cfg = Config {
            policy: BufferPolicy::DoubleBuffer,
            ring_buffer_capacity: 1,
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ring_capacity_one_is_single_slot() {
        let cfg = Config {
            ring_buffer_capacity: 1,
            ..base()
        };
        assert!(cfg.is_single_slot());
    }
}
