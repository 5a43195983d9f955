//! The consumer-side façade: attaches to an existing segment and pulls
//! commits according to the segment's configured `ConsumerSyncPolicy`.
//!
//! - `LatestOnly` consumers never track a running sequence: each call just
//!   asks for whatever `commit_sequence - 1` currently names, so a slow
//!   consumer silently drops intermediate commits instead of queuing.
//! - `SingleReader`/`SyncReader` consumers track `next_expected_sequence`
//!   across calls and surface `Lost { skipped }` when the writer wrapped
//!   past them before they caught up.

use std::time::Duration;

use crate::config::{ChecksumPolicy, Config, ConsumerSyncPolicy, OnChecksumFailPolicy};
use crate::error::{ConsumeError, LayoutError};
use crate::schema;
use crate::segment::Segment;
use crate::slot_coordinator::{self, ReadOutcome};

/// Default time a reader will wait for a slot to become available.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Consumer {
    segment: Segment,
    config: Config,
    /// Only meaningful for `SingleReader`/`SyncReader`; tracks the next
    /// 0-based commit sequence this reader expects to observe.
    next_expected_sequence: u64,
    /// This consumer's slot in the header's `consumer_heartbeats` table,
    /// once `register_heartbeat` has claimed one.
    heartbeat_index: std::cell::Cell<Option<usize>>,
}

impl Consumer {
    /// Attach to an existing segment, validating the shared secret and
    /// (optionally) the two schema hashes.
    pub fn attach(
        name: &str,
        config: Config,
        shared_secret: u64,
        expected_flexzone_schema_hash: Option<[u8; 32]>,
        expected_datablock_schema_hash: Option<[u8; 32]>,
    ) -> Result<Self, LayoutError> {
        config.validate()?;
        let segment = Segment::attach(
            name,
            shared_secret,
            expected_flexzone_schema_hash,
            expected_datablock_schema_hash,
            &config,
        )?;
        Ok(Self {
            segment,
            config,
            next_expected_sequence: 0,
            heartbeat_index: std::cell::Cell::new(None),
        })
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Register this consumer's PID in the segment's heartbeat table, for
    /// liveness tracking by an administrator or a zombie-reader sweep.
    /// Returns `None` if every heartbeat slot is already occupied by a live
    /// consumer. A no-op (returns the existing slot) if already registered.
    pub fn register_heartbeat(&self) -> Option<()> {
        if self.heartbeat_index.get().is_some() {
            return Some(());
        }
        let index = crate::recovery::register_consumer_heartbeat(&self.segment)?;
        self.heartbeat_index.set(Some(index));
        Some(())
    }

    /// Refresh this consumer's heartbeat timestamp. Call periodically while
    /// attached so an administrator's orphan sweep doesn't reclaim this slot.
    /// A no-op if [`Consumer::register_heartbeat`] hasn't been called yet.
    pub fn heartbeat(&self) {
        if let Some(index) = self.heartbeat_index.get() {
            crate::recovery::refresh_consumer_heartbeat(&self.segment, index);
        }
    }

    /// Pull the next available commit, blocking up to `timeout`.
    ///
    /// Under `LatestOnly`, this always targets `commit_sequence - 1`
    /// (ignoring `next_expected_sequence`) and never returns `Lost`.
    /// Under `SingleReader`/`SyncReader`, this targets and advances
    /// `next_expected_sequence`, surfacing `Lost { skipped }` if the writer
    /// outran this reader.
    pub fn try_next(&mut self, timeout: Duration) -> Result<ConsumeSlotHandle<'_>, ConsumeError> {
        match self.config.consumer_sync_policy {
            ConsumerSyncPolicy::LatestOnly => self.try_next_latest(timeout),
            ConsumerSyncPolicy::SingleReader | ConsumerSyncPolicy::SyncReader => {
                self.try_next_sequenced(timeout)
            }
        }
    }

    fn try_next_latest(&mut self, timeout: Duration) -> Result<ConsumeSlotHandle<'_>, ConsumeError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let commit_seq = self
                .segment
                .header()
                .commit_sequence
                .load(shm_primitives::sync::Ordering::Acquire);
            if commit_seq == 0 {
                if std::time::Instant::now() >= deadline {
                    return Err(ConsumeError::Timeout);
                }
                std::thread::sleep(Duration::from_micros(200));
                continue;
            }
            let target = commit_seq - 1;
            match slot_coordinator::try_acquire_read_slot(&self.segment, target) {
                ReadOutcome::Ready { slot_index, generation } => {
                    return Ok(ConsumeSlotHandle {
                        consumer: self,
                        slot_index,
                        generation,
                        released: false,
                    });
                }
                ReadOutcome::NotYetCommitted | ReadOutcome::Busy | ReadOutcome::Wrapped { .. } => {
                    if std::time::Instant::now() >= deadline {
                        return Err(ConsumeError::Timeout);
                    }
                    std::thread::sleep(Duration::from_micros(200));
                }
            }
        }
    }

    fn try_next_sequenced(&mut self, timeout: Duration) -> Result<ConsumeSlotHandle<'_>, ConsumeError> {
        match slot_coordinator::acquire_read_slot_blocking(&self.segment, self.next_expected_sequence, timeout) {
            Ok(ReadOutcome::Ready { slot_index, generation }) => {
                self.next_expected_sequence += 1;
                Ok(ConsumeSlotHandle {
                    consumer: self,
                    slot_index,
                    generation,
                    released: false,
                })
            }
            Ok(ReadOutcome::Wrapped { current_commit_sequence }) => {
                let slot_count = self.segment.layout().slot_count as u64;
                let skipped = current_commit_sequence - slot_count - self.next_expected_sequence;
                self.next_expected_sequence = current_commit_sequence - slot_count;
                Err(ConsumeError::Lost { skipped })
            }
            Ok(ReadOutcome::NotYetCommitted) | Ok(ReadOutcome::Busy) | Err(()) => Err(ConsumeError::Timeout),
        }
    }

    /// Non-blocking poll: returns `WouldBlock` immediately instead of
    /// waiting if nothing is ready yet.
    pub fn poll(&mut self) -> Result<ConsumeSlotHandle<'_>, ConsumeError> {
        match self.try_next(Duration::ZERO) {
            Err(ConsumeError::Timeout) => Err(ConsumeError::WouldBlock),
            other => other,
        }
    }

    fn checksum_policy(&self) -> ChecksumPolicy {
        self.config.checksum_policy
    }

    /// This consumer's configured behavior when `verify_checksum` fails,
    /// consulted by [`SlotIterator`] (direct `try_next` callers decide for
    /// themselves what to do with a `ChecksumFailed` result).
    pub fn on_checksum_fail(&self) -> OnChecksumFailPolicy {
        self.config.on_checksum_fail
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(index) = self.heartbeat_index.get() {
            crate::recovery::deregister_consumer_heartbeat(&self.segment, index);
        }
    }
}

/// An acquired, held read slot. `reader_count` is decremented when this
/// handle is dropped or [`ConsumeSlotHandle::release`] is called explicitly.
pub struct ConsumeSlotHandle<'c> {
    consumer: &'c mut Consumer,
    slot_index: usize,
    generation: u64,
    released: bool,
}

impl<'c> ConsumeSlotHandle<'c> {
    /// The slot's payload bytes, up to `payload_length`.
    pub fn payload(&self) -> &[u8] {
        let state = self.consumer.segment.slot_state(self.slot_index);
        let len = state
            .payload_length
            .load(shm_primitives::sync::Ordering::Acquire) as usize;
        let region = self.consumer.segment.slot_payload(self.slot_index);
        // SAFETY: this handle's `reader_count` increment (performed by
        // `try_acquire_read_slot`) guarantees the writer cannot reuse this
        // slot until we release it, and `generation` was confirmed to match
        // the expected commit at acquisition time.
        unsafe { core::slice::from_raw_parts(region.as_ptr(), len) }
    }

    /// Verify the payload against its stored checksum, if the segment's
    /// `ChecksumPolicy` calls for it. Returns `Ok(())` when checksums are
    /// disabled for this segment.
    pub fn verify_checksum(&self) -> Result<(), ConsumeError> {
        if self.consumer.checksum_policy() == ChecksumPolicy::None {
            return Ok(());
        }
        let state = self.consumer.segment.slot_state(self.slot_index);
        // SAFETY: `generation` matched at acquisition, so the checksum the
        // writer stored for this commit has already been published.
        let stored = unsafe { state.read_checksum() };
        let computed = schema::hash_bytes(self.payload());
        if stored == computed {
            Ok(())
        } else {
            Err(ConsumeError::ChecksumFailed)
        }
    }

    /// Release this read slot.
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            slot_coordinator::release_read_slot(&self.consumer.segment, self.slot_index);
            self.released = true;
        }
    }

    /// The generation this handle observed at acquisition, mostly useful
    /// for tests and diagnostics.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for ConsumeSlotHandle<'_> {
    fn drop(&mut self) {
        self.do_release();
    }
}

/// Iterates commits under `SingleReader`/`SyncReader` policies, yielding
/// `Lost` as a regular item instead of silently skipping ahead — mirrors
/// `Consumer::try_next` but as a blocking `Iterator`.
pub struct SlotIterator<'c> {
    consumer: &'c mut Consumer,
    timeout: Duration,
}

impl<'c> SlotIterator<'c> {
    pub fn new(consumer: &'c mut Consumer, timeout: Duration) -> Self {
        Self { consumer, timeout }
    }
}

impl<'c> Iterator for SlotIterator<'c> {
    type Item = Result<OwnedSlot, ConsumeError>;

    /// Under `Enforced`, a checksum failure is handled per the consumer's
    /// `on_checksum_fail` policy (spec.md §4.3.4): `Skip` drops the slot and
    /// moves on to the next one without surfacing it; `Pass` yields
    /// `Err(ChecksumFailed)` instead of the payload. A timeout ends the
    /// iterator (spec.md §4.5: finite only once the producer has detached
    /// and no more slots are forthcoming, which this crate approximates by
    /// treating "nothing arrived within this timeout" as end-of-stream).
    fn next(&mut self) -> Option<Self::Item> {
        let on_fail = self.consumer.on_checksum_fail();
        loop {
            let handle = match self.consumer.try_next(self.timeout) {
                Ok(handle) => handle,
                Err(ConsumeError::Timeout) => return None,
                Err(other) => return Some(Err(other)),
            };

            if let Err(err) = handle.verify_checksum() {
                drop(handle);
                match on_fail {
                    OnChecksumFailPolicy::Skip => continue,
                    OnChecksumFailPolicy::Pass => return Some(Err(err)),
                }
            }

            let owned = OwnedSlot {
                bytes: handle.payload().to_vec(),
                generation: handle.generation(),
            };
            return Some(Ok(owned));
        }
    }
}

/// A copied-out commit payload, decoupled from the slot's lifetime. Used by
/// [`SlotIterator`], which must release each slot before yielding the next.
#[derive(Debug, Clone)]
pub struct OwnedSlot {
    pub bytes: Vec<u8>,
    pub generation: u64,
}
