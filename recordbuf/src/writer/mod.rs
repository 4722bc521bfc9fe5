use serde_derive::{Deserialize, Serialize};

use super::buffer::RecordBuffer;
use super::core::*;
use super::errors::RecordBufError;
use super::region::AtomicRegion;

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    pub shmem: ShmemConfig,
}

pub struct RecordWriter {
    shmem_service: ShmemService,
}

impl RecordWriter {
    pub fn new(cfg: &WriterConfig) -> Result<RecordWriter, RecordBufError> {
        let ctx = writer_context(&cfg.shmem)?;
        let shmem_service = ShmemService::new(ctx, &cfg.shmem)?;
        Ok(RecordWriter { shmem_service })
    }

    pub fn close(&self) {
        self.shmem_service.close()
    }

    pub fn is_closing(&self) -> bool {
        self.shmem_service.is_closing()
    }

    #[inline]
    pub fn buffer(&self) -> &RecordBuffer<ShmemRegion> {
        self.shmem_service.buffer()
    }

    /// Replace the record for `key` with `message`, zero padded.
    ///
    /// `Ok(false)` means the key is being written by someone else or the
    /// buffer is full.
    pub fn put(&self, key: i32, message: &[u8]) -> Result<bool, RecordBufError> {
        self.shmem_service.ensure_not_closing()?;
        let buffer = self.buffer();
        let record_size = buffer.record_size();
        if message.len() > record_size {
            return Err(RecordBufError::PayloadTooLarge {
                len: message.len(),
                record_size,
            });
        }

        let padded;
        let payload = if message.len() == record_size {
            message
        } else {
            let mut bytes = vec![0u8; record_size];
            bytes[..message.len()].copy_from_slice(message);
            padded = bytes;
            &padded[..]
        };
        Ok(buffer.with_record(key, |offset| buffer.region().write_bytes(offset, payload)))
    }

    /// Read the current payload of `key` (zeroes for a new key), let `f`
    /// change it, and write it back under the same claim.
    pub fn update<F>(&self, key: i32, f: F) -> Result<bool, RecordBufError>
    where
        F: FnOnce(&mut [u8]),
    {
        self.shmem_service.ensure_not_closing()?;
        let buffer = self.buffer();
        let mut payload = vec![0u8; buffer.record_size()];
        Ok(buffer.with_record(key, |offset| {
            buffer.read_payload(offset, &mut payload);
            f(&mut payload);
            buffer.region().write_bytes(offset, &payload);
        }))
    }

    /// Claim `key` for a zero-copy write. Pair with [`commit`](Self::commit).
    pub fn claim(&self, key: i32) -> Result<usize, RecordBufError> {
        self.shmem_service.ensure_not_closing()?;
        Ok(self.buffer().claim(key)?)
    }

    pub fn write_payload(&self, offset: usize, src: &[u8]) -> Result<(), RecordBufError> {
        self.buffer().write_payload(offset, src)
    }

    pub fn commit(&self, offset: usize) -> Result<(), RecordBufError> {
        self.buffer().commit(offset)
    }
}
