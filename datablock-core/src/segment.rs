//! POSIX-backed segment creation and attach: `shm_open` + `ftruncate` +
//! `mmap`, mirroring the mmap/munmap ownership pattern the hub transport
//! uses for its file-backed mapping, but backed by a named shared-memory
//! object instead of a plain temp file so producer and consumers can find
//! it by name alone.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use shm_primitives::Region;

use crate::config::Config;
use crate::error::LayoutError;
use crate::layout::{self, Header, Layout, SlotRWState};

/// Segment names are prefixed to land in a private namespace under
/// `/dev/shm` and avoid colliding with unrelated shared-memory users.
const NAME_PREFIX: &str = "dxh_";

fn shm_path(name: &str) -> Result<CString, LayoutError> {
    CString::new(format!("/{NAME_PREFIX}{name}"))
        .map_err(|_| LayoutError::SizeInconsistent("segment name contains a NUL byte"))
}

struct Mapping {
    base: *mut u8,
    size: usize,
}

// SAFETY: all shared mutable state inside the mapping is synchronized via
// the atomics in `Header`/`SlotRWState` and the flexzone spinlock.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `base`/`size` came from a successful `mmap` of this size.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

fn mmap_shared(fd: RawFd, size: usize) -> io::Result<*mut u8> {
    // SAFETY: fd is a valid, open file descriptor sized to at least `size`.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

/// A mapped DataBlock segment. Shared (via `Arc`) between the `Producer`,
/// any number of `Consumer`s, and their slot handles within this process.
pub struct Segment {
    mapping: Arc<Mapping>,
    layout: Layout,
    name: String,
    /// Whether this handle created the segment and should `shm_unlink` it
    /// on drop once it detaches (the creator owns the segment's lifetime in
    /// the `shm_open` namespace; consumers never unlink).
    owns_name: bool,
}

impl Segment {
    /// Create a brand-new named segment, zero-fill it, and write an
    /// initialized header. Fails with `NameConflict` if the name is already
    /// in use.
    pub fn create(
        name: &str,
        config: &Config,
        config_hash: [u8; 32],
        flexzone_schema_hash: [u8; 32],
        datablock_schema_hash: [u8; 32],
        schema_version: u32,
    ) -> Result<Self, LayoutError> {
        let layout = layout::layout_of(config)?;
        let path = shm_path(name)?;

        // SAFETY: path is a valid NUL-terminated C string.
        let fd = unsafe {
            libc::shm_open(
                path.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Err(LayoutError::NameConflict);
            }
            return Err(LayoutError::MapFailed(err));
        }

        // SAFETY: fd is freshly opened and owned by this call.
        let rc = unsafe { libc::ftruncate(fd, layout.total_size as libc::off_t) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(path.as_ptr());
            }
            return Err(LayoutError::MapFailed(err));
        }

        let base = match mmap_shared(fd, layout.total_size as usize) {
            Ok(base) => base,
            Err(err) => {
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(path.as_ptr());
                }
                return Err(LayoutError::MapFailed(err));
            }
        };
        // SAFETY: fd is no longer needed once mapped; the mapping keeps the
        // pages alive independent of the descriptor.
        unsafe { libc::close(fd) };

        // SAFETY: base/size describe the mapping just created above.
        unsafe { std::ptr::write_bytes(base, 0, layout.total_size as usize) };

        let segment = Self {
            mapping: Arc::new(Mapping {
                base,
                size: layout.total_size as usize,
            }),
            layout,
            name: name.to_string(),
            owns_name: true,
        };

        let producer_pid = shm_primitives::pid::current_pid() as u64;
        let producer_start_ns = now_ns();

        // SAFETY: exclusive access, nothing else has attached to this
        // freshly created, still-zero-filled segment.
        let header = unsafe { segment.header_mut() };
        header.init(
            config,
            &segment.layout,
            config_hash,
            flexzone_schema_hash,
            datablock_schema_hash,
            schema_version,
            producer_pid,
            producer_start_ns,
        );
        for slot in 0..segment.layout.slot_count as usize {
            // SAFETY: index is within `slot_count`, memory was zero-filled
            // above (which is already a valid `SlotRWState::free()` bit
            // pattern), so this is only an explicit, readable restatement.
            unsafe { segment.slot_state_ptr(slot).write(SlotRWState::free()) };
        }

        tracing::info!(name, total_size = segment.layout.total_size, "segment_created");
        Ok(segment)
    }

    /// Attach to an existing named segment read-write, validating the
    /// header against the caller's secret and (optionally) expected schema
    /// hashes.
    pub fn attach(
        name: &str,
        shared_secret: u64,
        expected_flexzone_schema_hash: Option<[u8; 32]>,
        expected_datablock_schema_hash: Option<[u8; 32]>,
        config: &Config,
    ) -> Result<Self, LayoutError> {
        let layout = layout::layout_of(config)?;
        let path = shm_path(name)?;

        // SAFETY: path is a valid NUL-terminated C string.
        let fd = unsafe { libc::shm_open(path.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(LayoutError::MapFailed(io::Error::last_os_error()));
        }

        let base = match mmap_shared(fd, layout.total_size as usize) {
            Ok(base) => base,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(LayoutError::MapFailed(err));
            }
        };
        unsafe { libc::close(fd) };

        let segment = Self {
            mapping: Arc::new(Mapping {
                base,
                size: layout.total_size as usize,
            }),
            layout,
            name: name.to_string(),
            owns_name: false,
        };

        segment.header().validate(
            shared_secret,
            expected_flexzone_schema_hash,
            expected_datablock_schema_hash,
        )?;

        tracing::debug!(name, "segment_attached");
        Ok(segment)
    }

    /// The segment's name (without the internal namespace prefix).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The layout this segment was mapped with.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn header(&self) -> &Header {
        // SAFETY: the header always occupies the first `HEADER_SIZE` bytes
        // of a successfully mapped segment.
        unsafe { &*(self.mapping.base as *const Header) }
    }

    /// # Safety
    ///
    /// Callers must not create overlapping mutable header accesses, and
    /// must only mutate fields the producer owns (see `Header::init` and
    /// the slot coordinator, which mutate through atomics instead).
    pub unsafe fn header_mut(&self) -> &mut Header {
        // SAFETY: forwarded to the caller.
        unsafe { &mut *(self.mapping.base as *mut Header) }
    }

    pub fn slot_state(&self, index: usize) -> &SlotRWState {
        debug_assert!(index < self.layout.slot_count as usize);
        // SAFETY: index bound-checked above; the slot state array was
        // initialized by `create` and is a fixed, ABI-stable layout.
        unsafe { &*self.slot_state_ptr(index) }
    }

    fn slot_state_ptr(&self, index: usize) -> *mut SlotRWState {
        let offset = self.layout.slot_state_array_offset as usize
            + index * core::mem::size_of::<SlotRWState>();
        // SAFETY: offset is within the mapping for `index < slot_count`.
        unsafe { self.mapping.base.add(offset) as *mut SlotRWState }
    }

    /// A non-owning view over one slot's payload bytes.
    pub fn slot_payload(&self, index: usize) -> Region {
        debug_assert!(index < self.layout.slot_count as usize);
        let offset = self.layout.slot_array_offset as usize
            + index * self.layout.slot_stride as usize;
        // SAFETY: offset + slot_stride is within the mapping for a valid
        // index; the region's lifetime is tied to this `Segment`'s caller.
        unsafe { Region::from_raw_parts(self.mapping.base.add(offset), self.layout.slot_stride as usize) }
    }

    /// A non-owning view over the flexible zone.
    pub fn flex_zone(&self) -> Region {
        // SAFETY: offset + flex_zone_size is within the mapping by
        // construction of `layout_of`.
        unsafe {
            Region::from_raw_parts(
                self.mapping.base.add(self.layout.flex_zone_offset as usize),
                self.layout.flex_zone_size as usize,
            )
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.owns_name && Arc::strong_count(&self.mapping) == 1 {
            if let Ok(path) = shm_path(&self.name) {
                // SAFETY: path is a valid NUL-terminated C string; unlinking
                // a name nobody else still has mapped is always sound, and
                // processes that already mapped it keep their mapping alive
                // independent of the name.
                unsafe {
                    libc::shm_unlink(path.as_ptr());
                }
            }
        }
    }
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferPolicy, ChecksumPolicy, ConsumerSyncPolicy, OnChecksumFailPolicy, PhysicalPageSize};

    fn cfg() -> Config {
        Config {
            policy: BufferPolicy::RingBuffer,
            consumer_sync_policy: ConsumerSyncPolicy::LatestOnly,
            physical_page_size: PhysicalPageSize::Small,
            ring_buffer_capacity: 4,
            logical_unit_size: 16,
            flex_zone_size: 0,
            shared_secret: 0x1234,
            checksum_policy: ChecksumPolicy::Enforced,
            on_checksum_fail: OnChecksumFailPolicy::Skip,
        }
    }

    #[test]
    fn create_then_attach_roundtrip() {
        let name = format!("test_segment_{}", std::process::id());
        let config = cfg();
        let segment = Segment::create(&name, &config, [0; 32], [0; 32], [0; 32], 1).unwrap();
        assert_eq!(segment.header().magic, layout::MAGIC);

        let attached = Segment::attach(&name, config.shared_secret, None, None, &config).unwrap();
        assert_eq!(attached.header().slot_count, 4);
    }

    #[test]
    fn create_twice_conflicts() {
        let name = format!("test_segment_conflict_{}", std::process::id());
        let config = cfg();
        let _first = Segment::create(&name, &config, [0; 32], [0; 32], [0; 32], 1).unwrap();
        let second = Segment::create(&name, &config, [0; 32], [0; 32], [0; 32], 1);
        assert!(matches!(second, Err(LayoutError::NameConflict)));
    }

    #[test]
    fn attach_rejects_wrong_secret() {
        let name = format!("test_segment_secret_{}", std::process::id());
        let config = cfg();
        let _segment = Segment::create(&name, &config, [0; 32], [0; 32], [0; 32], 1).unwrap();
        let result = Segment::attach(&name, 0xbad, None, None, &config);
        assert!(matches!(result, Err(LayoutError::SecretMismatch)));
    }
}
