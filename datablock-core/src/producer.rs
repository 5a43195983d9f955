//! The producer-side façade: exactly one live `Producer` per segment name is
//! expected (the spec enforces this socially, via the broker, not by a lock
//! the core itself holds), responsible for acquiring write slots, filling
//! the payload, and publishing commits.

use std::time::Duration;

use crate::config::{ChecksumPolicy, Config};
use crate::error::{AcquireError, CommitError, LayoutError};
use crate::schema;
use crate::segment::Segment;
use crate::slot_coordinator;

/// Default time a writer will wait for a slot to free up before giving up.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

/// Owns a segment this process created and is the sole writer for.
pub struct Producer {
    segment: Segment,
    config: Config,
}

impl Producer {
    /// Create a brand-new segment and become its producer.
    pub fn create(
        name: &str,
        config: Config,
        flexzone_schema_hash: [u8; 32],
        datablock_schema_hash: [u8; 32],
        schema_version: u32,
    ) -> Result<Self, LayoutError> {
        config.validate()?;
        let config_hash = schema::hash_config(&config);
        let segment = Segment::create(
            name,
            &config,
            config_hash,
            flexzone_schema_hash,
            datablock_schema_hash,
            schema_version,
        )?;
        Ok(Self { segment, config })
    }

    /// The underlying segment, for access to the flexible zone or
    /// administrative operations.
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn shared_secret(&self) -> u64 {
        self.config.shared_secret
    }

    /// Acquire the next write slot, blocking (with spin+sleep backoff) up to
    /// `timeout` for it to become free. Reclaims a zombie writer in place if
    /// one is found holding the target slot.
    pub fn acquire_write_slot(&self, timeout: Duration) -> Result<WriteSlotHandle<'_>, AcquireError> {
        let slot_index = slot_coordinator::acquire_write_slot(&self.segment, timeout)?;
        Ok(WriteSlotHandle {
            producer: self,
            slot_index,
            done: false,
        })
    }

    /// Acquire using the default timeout.
    pub fn acquire_write_slot_default(&self) -> Result<WriteSlotHandle<'_>, AcquireError> {
        self.acquire_write_slot(DEFAULT_ACQUIRE_TIMEOUT)
    }
}

/// An acquired, not-yet-committed write slot. Dropping without calling
/// [`WriteSlotHandle::commit`] discards it (the slot reverts to its previous
/// generation, unpublished).
pub struct WriteSlotHandle<'p> {
    producer: &'p Producer,
    slot_index: usize,
    done: bool,
}

impl<'p> WriteSlotHandle<'p> {
    /// Mutable access to this slot's payload bytes. Exactly
    /// `logical_unit_size` bytes long (the slot's padded stride may be
    /// larger; callers should only ever touch the logical prefix).
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let region = self.producer.segment.slot_payload(self.slot_index);
        let len = self.producer.config.logical_unit_size as usize;
        // SAFETY: this handle is the only writer currently holding the
        // slot (enforced by `writer_pid` in `acquire_write_slot`), and the
        // logical length never exceeds the slot's physical stride.
        unsafe { core::slice::from_raw_parts_mut(region.as_mut_ptr(), len) }
    }

    /// Publish `used_len` bytes of the payload as this slot's commit. Bumps
    /// the slot's generation and the segment's `commit_sequence`, making the
    /// data visible to consumers.
    pub fn commit(mut self, used_len: u32) -> Result<(), CommitError> {
        if self.done {
            return Err(CommitError::AlreadyCommitted);
        }
        let max = self.producer.config.logical_unit_size;
        if used_len as u64 > max {
            return Err(CommitError::PayloadTooLarge {
                used: used_len as u64,
                max,
            });
        }

        if self.producer.config.checksum_policy != ChecksumPolicy::None {
            let region = self.producer.segment.slot_payload(self.slot_index);
            // SAFETY: still the sole writer of this slot; no commit has
            // happened yet so no reader can observe these bytes.
            let bytes = unsafe { core::slice::from_raw_parts(region.as_ptr(), used_len as usize) };
            let checksum = schema::hash_bytes(bytes);
            let state = self.producer.segment.slot_state(self.slot_index);
            // SAFETY: this handle currently holds the slot as its writer.
            unsafe { state.write_checksum(checksum) };
        }

        slot_coordinator::publish_commit(&self.producer.segment, self.slot_index, used_len);
        self.done = true;
        Ok(())
    }

    /// Release the slot without publishing anything.
    pub fn discard(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.done {
            slot_coordinator::discard_write_slot(&self.producer.segment, self.slot_index);
            self.done = true;
        }
    }
}

impl Drop for WriteSlotHandle<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferPolicy, ConsumerSyncPolicy, OnChecksumFailPolicy, PhysicalPageSize};

    fn cfg() -> Config {
        Config {
            policy: BufferPolicy::RingBuffer,
            consumer_sync_policy: ConsumerSyncPolicy::SyncReader,
            physical_page_size: PhysicalPageSize::Small,
            ring_buffer_capacity: 4,
            logical_unit_size: 16,
            flex_zone_size: 0,
            shared_secret: 0xabc,
            checksum_policy: ChecksumPolicy::Enforced,
            on_checksum_fail: OnChecksumFailPolicy::Skip,
        }
    }

    #[test]
    fn acquire_write_commit_advances_sequence() {
        let name = format!("test_producer_{}", std::process::id());
        let producer = Producer::create(&name, cfg(), [0; 32], [0; 32], 1).unwrap();

        let mut handle = producer.acquire_write_slot_default().unwrap();
        handle.payload_mut()[..4].copy_from_slice(&[9, 9, 9, 9]);
        handle.commit(4).unwrap();

        assert_eq!(
            producer
                .segment()
                .header()
                .commit_sequence
                .load(shm_primitives::sync::Ordering::Acquire),
            1
        );
    }

    #[test]
    fn discarded_slot_does_not_advance_sequence() {
        let name = format!("test_producer_discard_{}", std::process::id());
        let producer = Producer::create(&name, cfg(), [0; 32], [0; 32], 1).unwrap();

        let handle = producer.acquire_write_slot_default().unwrap();
        handle.discard();

        assert_eq!(
            producer
                .segment()
                .header()
                .commit_sequence
                .load(shm_primitives::sync::Ordering::Acquire),
            0
        );
    }

    #[test]
    fn oversized_payload_rejected() {
        let name = format!("test_producer_oversize_{}", std::process::id());
        let producer = Producer::create(&name, cfg(), [0; 32], [0; 32], 1).unwrap();

        let handle = producer.acquire_write_slot_default().unwrap();
        let result = handle.commit(1024);
        assert!(matches!(result, Err(CommitError::PayloadTooLarge { .. })));
    }
}
