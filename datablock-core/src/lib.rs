#![forbid(unsafe_op_in_unsafe_fn)]

//! DataBlock: a shared-memory streaming core for at-most-one-writer,
//! many-reader record exchange between cooperating processes on a single
//! host.
//!
//! A [`producer::Producer`] creates a named segment and publishes
//! fixed-size records ("slots") into it; any number of [`consumer::Consumer`]s
//! attach to the same segment and read those slots with zero-copy access.
//! Bulk data never crosses a socket: discovery (finding the segment's name)
//! is the only part of the system that isn't shared memory, and this crate
//! doesn't implement it — see [`broker`].
//!
//! The workspace splits this into two crates the way the source project
//! splits its IPC layer: [`shm_primitives`] carries the generic, mostly
//! `no_std` building blocks (a raw mapped-memory [`shm_primitives::Region`]
//! view and the PID/TID + token [`shm_primitives::Spinlock`]), and this
//! crate layers the DataBlock-specific header, slot coordinator, and
//! producer/consumer façades on top.

pub mod config;
pub mod consumer;
pub mod error;
pub mod flexzone;
pub mod layout;
pub mod producer;
pub mod recovery;
pub mod schema;
pub mod segment;
pub mod slot_coordinator;

mod broker;

pub use broker::{Messenger, NullMessenger, ProducerAnnouncement};
pub use config::{
    BufferPolicy, ChecksumPolicy, Config, ConsumerSyncPolicy, OnChecksumFailPolicy, PhysicalPageSize,
};
pub use consumer::{Consumer, ConsumeSlotHandle, OwnedSlot, SlotIterator};
pub use error::{AcquireError, CommitError, ConsumeError, DataBlockError, LayoutError, SchemaKind};
pub use producer::{Producer, WriteSlotHandle};
pub use schema::{BldsBuilder, Field, FieldKind};
