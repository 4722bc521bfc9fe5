use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::buffer::{Layout, RecordBuffer};
use crate::region::HeapRegion;

const RECORD_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq)]
struct TornReadTestMessage {
    seq: u32,
    words: Vec<u32>,
}

impl TornReadTestMessage {
    fn new(seq: u32) -> Self {
        TornReadTestMessage {
            seq,
            words: vec![seq; RECORD_SIZE / 4 - 1],
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(RECORD_SIZE);
        bytes.extend_from_slice(&self.seq.to_ne_bytes());
        for word in &self.words {
            bytes.extend_from_slice(&word.to_ne_bytes());
        }
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut words = bytes
            .chunks(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]));
        let seq = words.next().unwrap_or(0);
        TornReadTestMessage {
            seq,
            words: words.collect(),
        }
    }

    fn is_consistent(&self) -> bool {
        self.words.iter().all(|&w| w == self.seq)
    }
}

#[test]
fn test_torn_read_test_message_serialization() {
    let original = TornReadTestMessage::new(12345);
    let bytes = original.to_bytes();
    assert_eq!(bytes.len(), RECORD_SIZE);
    let decoded = TornReadTestMessage::from_bytes(&bytes);
    assert_eq!(decoded, original);
    assert!(decoded.is_consistent());

    let mut torn = bytes.clone();
    torn[RECORD_SIZE - 1] ^= 0xff;
    assert!(!TornReadTestMessage::from_bytes(&torn).is_consistent());
}

// Readers get no snapshot isolation across payload bytes, so a record
// updated in place while it is copied out can come back mixed. This only
// demonstrates the race; how often it shows up depends on timing.
#[test]
fn test_demonstrate_reader_torn_reads() {
    let capacity = Layout::required_capacity(8, RECORD_SIZE, 1);
    let buffer = RecordBuffer::new(HeapRegion::new_zeroed(capacity), 8, RECORD_SIZE).unwrap();
    buffer.initialise();
    let buffer = Arc::new(buffer);
    let stop_flag = Arc::new(AtomicBool::new(false));

    let writer_thread = thread::spawn({
        let buffer = buffer.clone();
        let stop_flag = stop_flag.clone();
        move || {
            let mut seq = 0u32;
            while !stop_flag.load(Ordering::Relaxed) {
                seq += 1;
                let bytes = TornReadTestMessage::new(seq).to_bytes();
                assert!(buffer.with_record(1, |offset| {
                    buffer.write_payload(offset, &bytes).unwrap();
                }));
                thread::sleep(Duration::from_micros(20));
            }
            seq
        }
    });

    let reader_thread = thread::spawn({
        let buffer = buffer.clone();
        let stop_flag = stop_flag.clone();
        move || {
            let mut consistent_reads = 0usize;
            let mut torn_reads_detected = 0usize;
            let mut bytes = vec![0u8; RECORD_SIZE];
            while !stop_flag.load(Ordering::Relaxed) {
                buffer.for_each(|key, offset| {
                    assert_eq!(key, 1);
                    buffer.read_payload(offset, &mut bytes);
                    if TornReadTestMessage::from_bytes(&bytes).is_consistent() {
                        consistent_reads += 1;
                    } else {
                        torn_reads_detected += 1;
                    }
                });
            }
            (consistent_reads, torn_reads_detected)
        }
    });

    thread::sleep(Duration::from_millis(500));
    stop_flag.store(true, Ordering::Relaxed);

    let written = writer_thread.join().expect("writer thread panicked");
    let (consistent_reads, torn_reads_detected) = reader_thread.join().expect("reader thread panicked");

    println!(
        "written: {}, consistent reads: {}, torn reads: {}",
        written, consistent_reads, torn_reads_detected
    );
    assert!(written > 0);
    assert!(consistent_reads + torn_reads_detected > 0);

    // Once the writer is quiet every read is whole again.
    let mut bytes = vec![0u8; RECORD_SIZE];
    let (_, offset) = buffer.records().next().unwrap();
    buffer.read_payload(offset, &mut bytes);
    let last = TornReadTestMessage::from_bytes(&bytes);
    assert!(last.is_consistent());
    assert_eq!(last.seq, written);
}
