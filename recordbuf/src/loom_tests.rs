#![cfg(all(test, feature = "loom"))]

use loom::sync::Arc;

use crate::buffer::{Layout, RecordBuffer, SlotStatus};
use crate::region::HeapRegion;
use crate::sync::thread;
use crate::NoSlotClaimed;

fn shared_buffer(slots: usize) -> Arc<RecordBuffer<HeapRegion>> {
    let region = HeapRegion::new_zeroed(Layout::required_capacity(8, 4, slots));
    let buffer = RecordBuffer::new(region, 8, 4).unwrap();
    buffer.initialise();
    Arc::new(buffer)
}

#[test]
fn distinct_keys_get_distinct_slots() {
    loom::model(|| {
        let buffer = shared_buffer(2);

        let handles: Vec<_> = [1, 2]
            .iter()
            .map(|&key| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    let offset = buffer.claim(key).unwrap();
                    buffer.commit(offset).unwrap();
                    offset
                })
            })
            .collect();
        let offsets: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_ne!(offsets[0], offsets[1]);
        let mut keys: Vec<i32> = buffer.records().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec![1, 2]);
    });
}

#[test]
fn committed_payload_is_visible_to_reader() {
    loom::model(|| {
        let buffer = shared_buffer(1);

        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                assert!(buffer.with_record(5, |offset| {
                    buffer.write_payload(offset, &42u32.to_ne_bytes()).unwrap();
                }));
            })
        };

        let mut seen = Vec::new();
        buffer.for_each(|key, offset| {
            let mut bytes = [0u8; 4];
            buffer.read_payload(offset, &mut bytes);
            seen.push((key, u32::from_ne_bytes(bytes)));
        });
        // Either nothing yet, or the whole record.
        assert!(seen.is_empty() || seen == vec![(5, 42)]);

        writer.join().unwrap();
    });
}

#[test]
fn updates_to_one_key_are_exclusive() {
    loom::model(|| {
        let buffer = shared_buffer(1);
        let offset = buffer.claim(9).unwrap();
        buffer.commit(offset).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let buffer = buffer.clone();
                thread::spawn(move || match buffer.claim(9) {
                    Ok(claimed) => {
                        assert_eq!(buffer.status(claimed), Some(SlotStatus::Pending));
                        let mut bytes = [0u8; 4];
                        buffer.read_payload(claimed, &mut bytes);
                        let next = u32::from_ne_bytes(bytes) + 1;
                        buffer.write_payload(claimed, &next.to_ne_bytes()).unwrap();
                        buffer.commit(claimed).unwrap();
                        1
                    }
                    Err(e) => {
                        assert_eq!(e, NoSlotClaimed::KeyPending);
                        0
                    }
                })
            })
            .collect();
        let wins: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let mut bytes = [0u8; 4];
        buffer.read_payload(offset, &mut bytes);
        assert_eq!(u32::from_ne_bytes(bytes), wins);
        assert_eq!(buffer.status(offset), Some(SlotStatus::Committed));
    });
}
