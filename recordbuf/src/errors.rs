use std::{fmt, io};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoSlotClaimed {
    /// Another writer currently holds the claim on this key.
    KeyPending,
    /// One more slot would not fit in the region.
    BufferFull,
    /// The Position Field has not been initialised yet.
    Uninitialised,
    /// The retry budget ran out while waiting on a status transition.
    Stalled,
}

impl fmt::Display for NoSlotClaimed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoSlotClaimed::KeyPending => write!(f, "key is claimed by another writer"),
            NoSlotClaimed::BufferFull => write!(f, "record buffer is full"),
            NoSlotClaimed::Uninitialised => write!(f, "record buffer is not initialised"),
            NoSlotClaimed::Stalled => write!(f, "gave up waiting for a slot transition"),
        }
    }
}

impl std::error::Error for NoSlotClaimed {}

#[derive(Debug)]
pub enum RecordBufError {
    SharedMemory(shared_memory::ShmemError),
    Io(io::Error),
    SignalHook(io::Error),
    Layout(String),
    Config(String),
    PayloadTooLarge { len: usize, record_size: usize },
    Claim(NoSlotClaimed),
    Stalled { offset: usize },
    Closing,
}

impl fmt::Display for RecordBufError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordBufError::SharedMemory(e) => write!(f, "Shared memory error: {}", e),
            RecordBufError::Io(e) => write!(f, "IO error: {}", e),
            RecordBufError::SignalHook(e) => write!(f, "Signal handling error: {}", e),
            RecordBufError::Layout(s) => write!(f, "Layout error: {}", s),
            RecordBufError::Config(s) => write!(f, "Config error: {}", s),
            RecordBufError::PayloadTooLarge { len, record_size } => write!(
                f,
                "Payload of {} bytes does not fit a {} byte record",
                len, record_size
            ),
            RecordBufError::Claim(e) => write!(f, "No slot claimed: {}", e),
            RecordBufError::Stalled { offset } => {
                write!(f, "Status transition stalled at offset {}", offset)
            }
            RecordBufError::Closing => write!(f, "The process is shutting down"),
        }
    }
}

impl std::error::Error for RecordBufError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordBufError::SharedMemory(e) => Some(e),
            RecordBufError::Io(e) => Some(e),
            RecordBufError::SignalHook(e) => Some(e),
            RecordBufError::Claim(e) => Some(e),
            RecordBufError::Layout(_)
            | RecordBufError::Config(_)
            | RecordBufError::PayloadTooLarge { .. }
            | RecordBufError::Stalled { .. }
            | RecordBufError::Closing => None,
        }
    }
}

impl From<shared_memory::ShmemError> for RecordBufError {
    fn from(err: shared_memory::ShmemError) -> Self {
        RecordBufError::SharedMemory(err)
    }
}

impl From<io::Error> for RecordBufError {
    fn from(err: io::Error) -> Self {
        RecordBufError::Io(err)
    }
}

impl From<NoSlotClaimed> for RecordBufError {
    fn from(err: NoSlotClaimed) -> Self {
        RecordBufError::Claim(err)
    }
}
