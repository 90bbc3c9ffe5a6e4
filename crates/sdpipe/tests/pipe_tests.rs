//! Cross-thread integration tests for the sensor-data pipe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sdpipe::{PipeError, SensorPipe, Timeout};

/// Fills packets with a recognizable pattern derived from a sequence number.
fn packet(seq: u64, size: usize) -> Vec<u8> {
    let mut p = vec![0u8; size];
    p[..8].copy_from_slice(&seq.to_le_bytes());
    for (i, b) in p.iter_mut().enumerate().skip(8) {
        *b = (seq as u8).wrapping_add(i as u8);
    }
    p
}

#[test]
fn buffer_boundary_rotation() {
    // 256-byte buffers with 48-byte packets: 5 packets fit (240 bytes),
    // the 6th lands in the next buffer after a rotation.
    let pipe = SensorPipe::new(4, 256).unwrap();
    pipe.bind_schema(48).unwrap();
    assert_eq!(pipe.items_per_buffer(), 5);
    assert_eq!(pipe.buffer_max_fill(), 240);

    let (mut w, mut r) = pipe.split().unwrap();
    for seq in 0..6 {
        w.push_packet(&packet(seq, 48), Timeout::ms(100)).unwrap();
    }
    w.flush(Timeout::ms(100)).unwrap();

    let first = r.acquire(Timeout::ms(100)).unwrap();
    assert_eq!(first.packet_count(), 5);
    assert_eq!(first.len(), 240);
    drop(first);

    let second = r.acquire(Timeout::ms(100)).unwrap();
    assert_eq!(second.packet_count(), 1);
    assert_eq!(second.len(), 48);
}

#[test]
fn backpressure_blocks_writer_until_reader_releases() {
    // With two buffers the writer owns one outright and can rotate once on
    // the seeded token; the next rotation must block until the reader has
    // released a buffer.
    let pipe = Arc::new(SensorPipe::new(2, 64).unwrap());
    pipe.bind_schema(8).unwrap();
    let (mut w, mut r) = pipe.split().unwrap();

    w.append(&packet(0, 8)).unwrap();
    w.rotate(Timeout::NoWait).unwrap();
    w.append(&packet(1, 8)).unwrap();

    let blocked = Arc::new(AtomicBool::new(true));
    let writer_thread = {
        let blocked = blocked.clone();
        thread::spawn(move || {
            let start = Instant::now();
            w.rotate(Timeout::After(Duration::from_secs(2))).unwrap();
            blocked.store(false, Ordering::SeqCst);
            start.elapsed()
        })
    };

    // Give the writer time to reach the blocking acquire.
    thread::sleep(Duration::from_millis(50));
    assert!(blocked.load(Ordering::SeqCst), "writer rotated without a free buffer");

    let release = Instant::now();
    drop(r.acquire(Timeout::ms(100)).unwrap());

    writer_thread.join().unwrap();
    assert!(
        release.elapsed() < Duration::from_millis(100),
        "writer not released within 100ms of the reader freeing a buffer"
    );
}

#[test]
fn fifo_order_and_alignment_under_load() {
    const PACKET: usize = 16;
    const TOTAL: u64 = 10_000;

    let pipe = Arc::new(SensorPipe::new(4, 1024).unwrap());
    pipe.bind_schema(PACKET).unwrap();
    let (mut w, mut r) = pipe.split().unwrap();

    let producer = thread::spawn(move || {
        for seq in 0..TOTAL {
            w.push_packet(&packet(seq, PACKET), Timeout::After(Duration::from_secs(5)))
                .unwrap();
        }
        w.flush(Timeout::After(Duration::from_secs(5))).unwrap();
    });

    let checker = {
        let pipe = pipe.clone();
        thread::spawn(move || {
            let mut expected = 0u64;
            while expected < TOTAL {
                let buf = match r.acquire(Timeout::ms(500)) {
                    Ok(buf) => buf,
                    Err(PipeError::TimedOut) => continue,
                    Err(e) => panic!("pipe failed: {e}"),
                };
                assert_eq!(buf.len() % PACKET, 0, "partial packet handed to reader");
                assert!(buf.len() <= pipe.buffer_max_fill());
                for chunk in buf.chunks_exact(PACKET) {
                    let seq = u64::from_le_bytes(chunk[..8].try_into().unwrap());
                    assert_eq!(seq, expected, "packets reordered");
                    assert_eq!(chunk, packet(seq, PACKET).as_slice());
                    expected += 1;
                }
            }
            expected
        })
    };

    producer.join().unwrap();
    assert_eq!(checker.join().unwrap(), TOTAL);

    // At rest the token sum must return to N - 1 and no buffer may be full.
    assert_eq!(pipe.write_tokens() + pipe.read_tokens(), 3);
    assert_eq!(pipe.full_count(), 0);
}

#[test]
fn snapshot_layout_round_trips() {
    let pipe = SensorPipe::new(2, 64).unwrap();
    pipe.bind_schema(16).unwrap();
    let (mut w, _r) = pipe.split().unwrap();
    w.append(&packet(42, 16)).unwrap();

    let mut out = Vec::new();
    // SAFETY: no other thread touches the pipe in this test.
    unsafe { pipe.snapshot_into(&mut out).unwrap() };

    let word = |i: usize| u64::from_le_bytes(out[i * 8..(i + 1) * 8].try_into().unwrap());
    assert_eq!(word(0), 2); // buf_count
    assert_eq!(word(1), 64); // buffer_max_fill
    assert_eq!(word(2), 16); // packet_size
    assert_eq!(word(3), 4); // items_per_buffer

    // First buffer: used = 16 followed by the packet bytes.
    assert_eq!(word(4), 16);
    assert_eq!(&out[40..56], packet(42, 16).as_slice());
    // Second buffer: empty.
    let tail = u64::from_le_bytes(out[56..64].try_into().unwrap());
    assert_eq!(tail, 0);
    assert_eq!(out.len(), 64);
}
