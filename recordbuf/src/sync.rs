#[cfg(not(feature = "loom"))]
pub use std::hint::spin_loop;
#[cfg(feature = "loom")]
pub use loom::hint::spin_loop;

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicU32, Ordering};
#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU32, Ordering};

#[cfg(not(feature = "loom"))]
pub use std::thread;
#[cfg(feature = "loom")]
pub use loom::thread;
