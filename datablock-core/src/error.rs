//! Error types surfaced across segment creation, attach, and the
//! producer/consumer façades. Every fallible API returns one of these; none
//! of them panic or unwind across an API boundary.

use std::fmt;

/// Which half of the dual-schema check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    FlexZone,
    DataBlock,
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaKind::FlexZone => write!(f, "flex zone"),
            SchemaKind::DataBlock => write!(f, "data block"),
        }
    }
}

/// A configuration violated one of [`crate::config::Config::validate`]'s
/// invariants. Carries the specific reason so callers don't have to guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidConfig(pub &'static str);

impl fmt::Display for InvalidConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid config: {}", self.0)
    }
}

impl std::error::Error for InvalidConfig {}

/// Errors from layout computation, segment creation, and attach.
#[derive(Debug)]
pub enum LayoutError {
    /// `header.magic` did not match the build-time constant.
    BadMagic,
    /// `header_version_major` is incompatible with this build.
    VersionMismatch { expected: u16, found: u16 },
    /// `shared_secret` presented by the attacher didn't match the header.
    SecretMismatch,
    /// A supplied expected schema hash didn't match the stored one.
    SchemaMismatch(SchemaKind),
    /// The config failed [`crate::config::Config::validate`].
    InvalidConfig(InvalidConfig),
    /// Computed offsets don't fit the requested total size, or overflowed.
    SizeInconsistent(&'static str),
    /// A named segment with this name already exists.
    NameConflict,
    /// The underlying `shm_open`/`mmap` (or platform equivalent) call failed.
    MapFailed(std::io::Error),
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "bad magic: not an initialized DataBlock segment"),
            Self::VersionMismatch { expected, found } => {
                write!(f, "header version mismatch: expected {expected}, found {found}")
            }
            Self::SecretMismatch => write!(f, "shared secret mismatch"),
            Self::SchemaMismatch(which) => write!(f, "schema mismatch: {which}"),
            Self::InvalidConfig(e) => write!(f, "{e}"),
            Self::SizeInconsistent(msg) => write!(f, "size inconsistent: {msg}"),
            Self::NameConflict => write!(f, "segment name already in use"),
            Self::MapFailed(e) => write!(f, "failed to map segment: {e}"),
        }
    }
}

impl std::error::Error for LayoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MapFailed(e) => Some(e),
            Self::InvalidConfig(e) => Some(e),
            _ => None,
        }
    }
}

impl From<InvalidConfig> for LayoutError {
    fn from(e: InvalidConfig) -> Self {
        Self::InvalidConfig(e)
    }
}

/// Errors from acquiring or releasing a write slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The slot could not be acquired within the caller's timeout.
    Timeout,
    /// An unrecoverable condition; the caller should detach.
    Fatal,
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out acquiring write slot"),
            Self::Fatal => write!(f, "fatal error acquiring write slot"),
        }
    }
}

impl std::error::Error for AcquireError {}

/// Errors from committing a write slot handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitError {
    /// `used_len` exceeded `logical_unit_size`.
    PayloadTooLarge { used: u64, max: u64 },
    /// The handle was already committed or discarded.
    AlreadyCommitted,
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { used, max } => {
                write!(f, "payload too large: {used} bytes, max {max}")
            }
            Self::AlreadyCommitted => write!(f, "handle was already committed or discarded"),
        }
    }
}

impl std::error::Error for CommitError {}

/// Errors surfaced by the consumer's slot iterator and `try_next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeError {
    /// No slot became available within the caller's timeout.
    Timeout,
    /// A non-blocking call found nothing ready right now.
    WouldBlock,
    /// One or more commits were skipped before this reader caught up.
    Lost { skipped: u64 },
    /// The stored checksum did not match the payload on release.
    ChecksumFailed,
}

impl fmt::Display for ConsumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for a slot"),
            Self::WouldBlock => write!(f, "no slot ready"),
            Self::Lost { skipped } => write!(f, "lost {skipped} commit(s) before catching up"),
            Self::ChecksumFailed => write!(f, "checksum verification failed"),
        }
    }
}

impl std::error::Error for ConsumeError {}

/// Top-level error type for operations that don't fit the more specific
/// enums above (administrative operations, broker plumbing).
#[derive(Debug)]
pub enum DataBlockError {
    Layout(LayoutError),
    Acquire(AcquireError),
    Commit(CommitError),
    Consume(ConsumeError),
    /// An administrative force-reset found live participants.
    InUse,
    /// A heartbeat or deregister referenced a consumer slot that was never
    /// registered.
    NotRegistered,
    /// Unrecoverable; the caller should detach and not retry.
    Fatal(String),
}

impl fmt::Display for DataBlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Layout(e) => write!(f, "{e}"),
            Self::Acquire(e) => write!(f, "{e}"),
            Self::Commit(e) => write!(f, "{e}"),
            Self::Consume(e) => write!(f, "{e}"),
            Self::InUse => write!(f, "operation requires no live participants"),
            Self::NotRegistered => write!(f, "consumer is not registered"),
            Self::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

impl std::error::Error for DataBlockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Layout(e) => Some(e),
            Self::Acquire(e) => Some(e),
            Self::Commit(e) => Some(e),
            Self::Consume(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LayoutError> for DataBlockError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<AcquireError> for DataBlockError {
    fn from(e: AcquireError) -> Self {
        Self::Acquire(e)
    }
}

impl From<CommitError> for DataBlockError {
    fn from(e: CommitError) -> Self {
        Self::Commit(e)
    }
}

impl From<ConsumeError> for DataBlockError {
    fn from(e: ConsumeError) -> Self {
        Self::Consume(e)
    }
}
