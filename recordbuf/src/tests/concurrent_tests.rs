use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use crate::buffer::{Layout, RecordBuffer, SIZE_OF_RECORD_FRAME};
use crate::region::HeapRegion;
use crate::NoSlotClaimed;

const HEADER_SIZE: usize = 8;
const RECORD_SIZE: usize = 16;

fn shared_buffer(slots: usize) -> Arc<RecordBuffer<HeapRegion>> {
    let capacity = Layout::required_capacity(HEADER_SIZE, RECORD_SIZE, slots);
    let buffer = RecordBuffer::new(HeapRegion::new_zeroed(capacity), HEADER_SIZE, RECORD_SIZE).unwrap();
    buffer.initialise();
    Arc::new(buffer)
}

fn pattern(seq: u32) -> [u8; RECORD_SIZE] {
    let mut bytes = [0u8; RECORD_SIZE];
    for chunk in bytes.chunks_mut(4) {
        chunk.copy_from_slice(&seq.to_ne_bytes());
    }
    bytes
}

#[test]
fn writers_and_readers_race_without_going_out_of_bounds() {
    const WRITERS: i32 = 4;
    const KEYS_PER_WRITER: i32 = 8;
    const READERS: usize = 3;
    const ROUNDS: u32 = 500;

    let buffer = shared_buffer((WRITERS * KEYS_PER_WRITER) as usize);
    let done = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(WRITERS as usize + READERS));

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let buffer = buffer.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                let mut written = 0usize;
                for seq in 1..=ROUNDS {
                    for k in 0..KEYS_PER_WRITER {
                        let key = (w + 1) * 100 + k;
                        let wrote = buffer.with_record(key, |offset| {
                            buffer.write_payload(offset, &pattern(seq)).unwrap();
                        });
                        assert!(wrote, "writer {} owns key {} exclusively", w, key);
                        written += 1;
                    }
                }
                written
            })
        })
        .collect();

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let buffer = buffer.clone();
            let done = done.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                let layout = *buffer.layout();
                let limit = layout.slots_end;
                let mut visited = 0usize;
                while !done.load(Ordering::Relaxed) {
                    buffer.for_each(|key, offset| {
                        assert!(layout.is_payload_offset(offset));
                        assert!(offset - SIZE_OF_RECORD_FRAME < limit);
                        assert!((1..=WRITERS).any(|w| (w * 100..w * 100 + KEYS_PER_WRITER).contains(&key)));
                        let mut payload = [0u8; RECORD_SIZE];
                        buffer.read_payload(offset, &mut payload);
                        visited += 1;
                    });
                }
                visited
            })
        })
        .collect();

    let written: usize = writers.into_iter().map(|t| t.join().unwrap()).sum();
    done.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(written, (WRITERS * KEYS_PER_WRITER) as usize * ROUNDS as usize);
    assert_eq!(buffer.len(), (WRITERS * KEYS_PER_WRITER) as usize);

    let mut keys = HashSet::new();
    buffer.for_each(|key, offset| {
        let mut payload = [0u8; RECORD_SIZE];
        buffer.read_payload(offset, &mut payload);
        assert_eq!(payload, pattern(ROUNDS));
        assert!(keys.insert(key));
    });
    assert_eq!(keys.len(), (WRITERS * KEYS_PER_WRITER) as usize);
}

#[test]
fn racing_first_claims_allocate_one_slot_per_winner() {
    const THREADS: usize = 4;

    for round in 0..50 {
        let buffer = shared_buffer(THREADS);
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let buffer = buffer.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let claimed = buffer.claim(7);
                    if let Ok(offset) = claimed {
                        buffer.commit(offset).unwrap();
                    }
                    claimed
                })
            })
            .collect();

        let mut offsets = HashSet::new();
        for handle in handles {
            match handle.join().unwrap() {
                Ok(offset) => {
                    offsets.insert(offset);
                }
                Err(e) => assert_eq!(e, NoSlotClaimed::KeyPending, "round {}", round),
            }
        }

        // Duplicate slots for one key are possible; every slot was handed out.
        assert!(!offsets.is_empty());
        assert_eq!(buffer.len(), offsets.len(), "round {}", round);
        assert_eq!(buffer.records().filter(|(k, _)| *k == 7).count(), offsets.len());
    }
}

#[test]
fn capacity_race_hands_out_exactly_the_slots_that_fit() {
    const THREADS: i32 = 16;
    const SLOTS: usize = 8;

    for _ in 0..20 {
        let buffer = shared_buffer(SLOTS);
        let barrier = Arc::new(Barrier::new(THREADS as usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let buffer = buffer.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    buffer.with_record(i + 1, |_| {})
                })
            })
            .collect();

        let claimed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(claimed, SLOTS);
        assert_eq!(buffer.len(), SLOTS);
        assert_eq!(buffer.records().count(), SLOTS);
    }
}

#[test]
fn one_writer_per_key_at_a_time() {
    const THREADS: usize = 6;
    const ATTEMPTS: usize = 2_000;

    let buffer = shared_buffer(1);
    assert!(buffer.with_record(1, |_| {}));

    let inside = Arc::new(AtomicBool::new(false));
    let wins = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let buffer = buffer.clone();
            let inside = inside.clone();
            let wins = wins.clone();
            thread::spawn(move || {
                for _ in 0..ATTEMPTS {
                    buffer.with_record(1, |offset| {
                        assert!(!inside.swap(true, Ordering::SeqCst), "two writers hold key 1");
                        let mut count = [0u8; RECORD_SIZE];
                        buffer.read_payload(offset, &mut count);
                        let next = u32::from_ne_bytes([count[0], count[1], count[2], count[3]]) + 1;
                        buffer.write_payload(offset, &next.to_ne_bytes()).unwrap();
                        inside.store(false, Ordering::SeqCst);
                        wins.fetch_add(1, Ordering::Relaxed);
                    });
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Every successful claim was an exclusive read-modify-write.
    let (_, offset) = buffer.records().next().unwrap();
    let mut count = [0u8; 4];
    buffer.read_payload(offset, &mut count);
    assert_eq!(u32::from_ne_bytes(count) as usize, wins.load(Ordering::Relaxed));
    assert_eq!(buffer.len(), 1);
}
