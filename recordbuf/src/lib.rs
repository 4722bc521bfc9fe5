//! A lock-free store of keyed, fixed-size records in shared memory.
//!
//! Writers [`claim`](RecordBuffer::claim) a key, write its payload in place
//! and [`commit`](RecordBuffer::commit) it; readers walk every committed
//! record with [`for_each`](RecordBuffer::for_each). The only coordination is
//! a compare-and-swap on each slot's status word and a fetch-and-add on the
//! position field, so the buffer works the same between threads over a
//! [`HeapRegion`] and between processes over a shared memory segment.
//!
//! # Loom Testing
//!
//! ```text
//! cargo test -p recordbuf --features loom --release loom_tests
//! ```

mod sync;
mod errors;
pub mod region;
pub mod buffer;
#[cfg(not(feature = "loom"))]
pub mod core;
#[cfg(not(feature = "loom"))]
pub mod reader;
#[cfg(not(feature = "loom"))]
pub mod writer;

#[cfg(all(test, not(feature = "loom")))]
mod tests;
#[cfg(all(test, feature = "loom"))]
mod loom_tests;

pub use buffer::{Layout, RecordBuffer, RecordGuard, RetryConfig, RetryPolicy, SlotStatus};
pub use errors::{NoSlotClaimed, RecordBufError};
pub use region::{AtomicRegion, HeapRegion};

#[cfg(not(feature = "loom"))]
pub use region::RawRegion;
#[cfg(not(feature = "loom"))]
pub use self::core::{ShmemConfig, ShmemRegion, ShmemService};
