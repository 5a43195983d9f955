#![no_std]
#![forbid(unsafe_op_in_unsafe_fn)]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub mod region;
#[cfg(any(feature = "std", feature = "loom"))]
pub mod pid;
#[cfg(any(feature = "std", feature = "loom"))]
pub mod spinlock;
pub mod sync;

#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
#[cfg(any(feature = "std", feature = "loom"))]
pub use spinlock::{LockTimeout, Spinlock, SpinlockGuard};
