use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use signal_hook::iterator::Signals;
use tracing::{debug, info, warn};

use crate::buffer::{Layout, RecordBuffer, RetryConfig, RetryPolicy};
use crate::errors::RecordBufError;
use crate::region::{AtomicRegion, RawRegion};
use crate::sync::AtomicU32;

pub static SHMEM_FILE_NAME: &str = "recordbuf";

pub const DEFAULT_HEADER_SIZE: usize = 8;
pub const DEFAULT_RECORD_SIZE: usize = 64;
pub const DEFAULT_CAPACITY: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    pub data_dir: String,
    pub shmem_file_name: String,
    pub header_size: usize,
    pub record_size: usize,
    pub capacity: usize,
    /// Stop on SIGHUP/SIGINT/SIGQUIT/SIGTERM. Turn off when embedded in a
    /// host that owns its signals.
    pub handle_signals: bool,
    pub retry: RetryConfig,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            data_dir: ".".to_string(),
            shmem_file_name: SHMEM_FILE_NAME.to_string(),
            header_size: DEFAULT_HEADER_SIZE,
            record_size: DEFAULT_RECORD_SIZE,
            capacity: DEFAULT_CAPACITY,
            handle_signals: true,
            retry: RetryConfig::default(),
        }
    }
}

impl ShmemConfig {
    pub fn builder() -> ShmemConfigBuilder {
        ShmemConfigBuilder::default()
    }

    pub fn link_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.shmem_file_name)
    }

    pub fn validate(&self) -> Result<(), RecordBufError> {
        if self.shmem_file_name.is_empty() {
            return Err(RecordBufError::Config("shmem_file_name is empty".to_string()));
        }
        Layout::new(self.capacity, self.header_size, self.record_size)
            .map_err(|e| RecordBufError::Config(e.to_string()))?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }
}

#[derive(Default)]
pub struct ShmemConfigBuilder {
    cfg: ShmemConfig,
    slots: Option<usize>,
}

impl ShmemConfigBuilder {
    pub fn data_dir(mut self, data_dir: String) -> Self {
        self.cfg.data_dir = data_dir;
        self
    }

    pub fn shmem_file_name(mut self, shmem_file_name: String) -> Self {
        self.cfg.shmem_file_name = shmem_file_name;
        self
    }

    pub fn header_size(mut self, header_size: usize) -> Self {
        self.cfg.header_size = header_size;
        self
    }

    pub fn record_size(mut self, record_size: usize) -> Self {
        self.cfg.record_size = record_size;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.cfg.capacity = capacity;
        self.slots = None;
        self
    }

    /// Size the segment for exactly `slots` records. Overrides `capacity`.
    pub fn slots(mut self, slots: usize) -> Self {
        self.slots = Some(slots);
        self
    }

    pub fn handle_signals(mut self, handle_signals: bool) -> Self {
        self.cfg.handle_signals = handle_signals;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.cfg.retry = retry;
        self
    }

    pub fn build(self) -> Result<ShmemConfig, RecordBufError> {
        let mut cfg = self.cfg;
        if let Some(slots) = self.slots {
            cfg.capacity = Layout::required_capacity(cfg.header_size, cfg.record_size, slots);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// A mapped shared memory segment viewed as an [`AtomicRegion`].
pub struct ShmemRegion {
    // Keeps the mapping alive for `raw`.
    shmem: Shmem,
    raw: RawRegion,
}

// SAFETY: the mapping is only touched through `raw`, whose accesses are all
// atomic, and lives until the region is dropped.
unsafe impl Send for ShmemRegion {}
unsafe impl Sync for ShmemRegion {}

impl ShmemRegion {
    fn new(shmem: Shmem) -> ShmemRegion {
        // SAFETY: the mapping is page aligned, `len` bytes long and owned by
        // the returned value.
        let raw = unsafe { RawRegion::from_raw(shmem.as_ptr(), shmem.len()) };
        ShmemRegion { shmem, raw }
    }

    /// Whether this mapping created the segment.
    pub fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }

    pub fn os_id(&self) -> &str {
        self.shmem.get_os_id()
    }
}

impl AtomicRegion for ShmemRegion {
    #[inline]
    fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    #[inline]
    fn word(&self, offset: usize) -> &AtomicU32 {
        self.raw.word(offset)
    }
}

fn open_linked(cfg: &ShmemConfig) -> Result<ShmemRegion, RecordBufError> {
    let shmem = ShmemConf::new().flink(cfg.link_path()).open()?;
    Ok(ShmemRegion::new(shmem))
}

/// Create the segment, or attach to it if another writer got there first.
pub fn writer_context(cfg: &ShmemConfig) -> Result<ShmemRegion, RecordBufError> {
    cfg.validate()?;
    match ShmemConf::new()
        .size(cfg.capacity)
        .flink(cfg.link_path())
        .create()
    {
        Ok(shmem) => {
            debug!(link = %cfg.link_path().display(), size = cfg.capacity, "created segment");
            Ok(ShmemRegion::new(shmem))
        }
        Err(ShmemError::LinkExists) => open_linked(cfg),
        Err(e) => Err(e.into()),
    }
}

pub fn reader_context(cfg: &ShmemConfig) -> Result<ShmemRegion, RecordBufError> {
    let region = open_linked(cfg)?;
    debug!(link = %cfg.link_path().display(), size = region.capacity(), "opened segment");
    Ok(region)
}

static SIGNALLED: Lazy<Arc<AtomicBool>> = Lazy::new(|| {
    let signalled = Arc::new(AtomicBool::new(false));
    if let Err(e) = watch_signals(signalled.clone()) {
        warn!("termination signals will not be observed: {}", e);
    }
    signalled
});

fn watch_signals(signalled: Arc<AtomicBool>) -> Result<(), RecordBufError> {
    let mut signals = Signals::new([libc::SIGHUP, libc::SIGINT, libc::SIGQUIT, libc::SIGTERM])
        .map_err(RecordBufError::SignalHook)?;
    thread::Builder::new()
        .name("recordbuf-signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                info!(signal, "termination signal received, closing");
                signalled.store(true, Ordering::SeqCst);
            }
        })?;
    Ok(())
}

/// A record buffer living in a shared memory segment.
pub struct ShmemService {
    buffer: RecordBuffer<ShmemRegion>,
    link_path: PathBuf,
    closed: AtomicBool,
    signalled: Option<Arc<AtomicBool>>,
}

impl ShmemService {
    /// The creator of the segment initialises it.
    pub fn new(region: ShmemRegion, cfg: &ShmemConfig) -> Result<ShmemService, RecordBufError> {
        if region.capacity() != cfg.capacity {
            debug!(
                configured = cfg.capacity,
                mapped = region.capacity(),
                "segment size differs from configuration, using the mapped size"
            );
        }
        let owner = region.is_owner();
        let buffer = RecordBuffer::new(region, cfg.header_size, cfg.record_size)?
            .with_retry_policy(cfg.retry_policy());
        if owner {
            buffer.initialise();
        }
        let signalled = if cfg.handle_signals {
            Some(SIGNALLED.clone())
        } else {
            None
        };
        Ok(ShmemService {
            buffer,
            link_path: cfg.link_path(),
            closed: AtomicBool::new(false),
            signalled,
        })
    }

    #[inline]
    pub fn buffer(&self) -> &RecordBuffer<ShmemRegion> {
        &self.buffer
    }

    pub fn link_path(&self) -> &Path {
        &self.link_path
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || self
                .signalled
                .as_ref()
                .map_or(false, |s| s.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn ensure_not_closing(&self) -> Result<(), RecordBufError> {
        if self.is_closing() {
            Err(RecordBufError::Closing)
        } else {
            Ok(())
        }
    }
}
