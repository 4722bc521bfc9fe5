use serde_derive::{Deserialize, Serialize};

use super::buffer::RecordBuffer;
use super::core::*;
use super::errors::RecordBufError;

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub shmem: ShmemConfig,
}

/// An owned copy of one committed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: i32,
    pub payload: Vec<u8>,
}

pub struct RecordReader {
    shmem_service: ShmemService,
}

impl RecordReader {
    pub fn new(cfg: &ReaderConfig) -> Result<RecordReader, RecordBufError> {
        let ctx = reader_context(&cfg.shmem)?;
        let shmem_service = ShmemService::new(ctx, &cfg.shmem)?;
        Ok(RecordReader { shmem_service })
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

    /// Slots allocated so far, committed or not.
    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    /// Call `f(key, payload)` for every committed record.
    ///
    /// The payload is copied out of the segment first, but a concurrent
    /// update can still tear it.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), RecordBufError>
    where
        F: FnMut(i32, &[u8]),
    {
        self.shmem_service.ensure_not_closing()?;
        let buffer = self.buffer();
        let mut scratch = vec![0u8; buffer.record_size()];
        buffer.for_each(|key, offset| {
            buffer.read_payload(offset, &mut scratch);
            f(key, &scratch);
        });
        Ok(())
    }

    pub fn get(&self, key: i32) -> Result<Option<Vec<u8>>, RecordBufError> {
        self.shmem_service.ensure_not_closing()?;
        let buffer = self.buffer();
        Ok(buffer.records().find(|(k, _)| *k == key).map(|(_, offset)| {
            let mut payload = vec![0u8; buffer.record_size()];
            buffer.read_payload(offset, &mut payload);
            payload
        }))
    }

    pub fn snapshot(&self) -> Result<Vec<Record>, RecordBufError> {
        let mut records = Vec::with_capacity(self.len());
        self.for_each(|key, payload| {
            records.push(Record {
                key,
                payload: payload.to_vec(),
            })
        })?;
        Ok(records)
    }
}
