//! Reader-loop integration tests against scripted local servers.

use std::collections::HashMap;
use std::io::Write;
use std::net::TcpListener;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use sdpipe::{PipeError, PipeReader, SensorPipe, ShutdownFlag, Timeout};
use sensor_collector::proto::build_frame;
use sensor_collector::reader::Reader;
use sensor_collector::testsrv::{GeneratedSensor, TestServer};

const PACKET: usize = 16;

fn leaked_flag() -> &'static ShutdownFlag {
    Box::leak(Box::new(ShutdownFlag::new()))
}

struct Rig {
    shutdown: &'static ShutdownFlag,
    barrier: Arc<Barrier>,
    pipes: Vec<(u16, Arc<SensorPipe>, PipeReader)>,
    reader: Option<Reader>,
}

/// Builds a reader with one pipe per unit id, schema already bound.
fn rig(addr: String, unit_ids: &[u16], packet: usize) -> Rig {
    let shutdown = leaked_flag();
    let barrier = Arc::new(Barrier::new(2));

    let mut writers = HashMap::new();
    let mut pipes = Vec::new();
    for &unit in unit_ids {
        let pipe = Arc::new(SensorPipe::new(4, 256).unwrap());
        pipe.bind_schema(packet).unwrap();
        let (writer, reader) = pipe.split().unwrap();
        writers.insert(unit, writer);
        pipes.push((unit, pipe, reader));
    }

    let reader = Reader::new(addr, 4096, 1024, writers, shutdown, barrier.clone());
    Rig {
        shutdown,
        barrier,
        pipes,
        reader: Some(reader),
    }
}

fn drain(reader: &mut PipeReader, packet: usize) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    while let Ok(buf) = reader.acquire(Timeout::ms(200)) {
        assert_eq!(buf.len() % packet, 0, "partial packet handed to reader");
        for chunk in buf.chunks_exact(packet) {
            packets.push(chunk.to_vec());
        }
    }
    packets
}

#[test]
fn frames_route_by_unit_id() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let mut rig = rig(addr, &[1, 2], PACKET);

    let reader = rig.reader.take().unwrap();
    let handle = thread::spawn(move || reader.run());
    rig.barrier.wait();

    let (mut conn, _) = listener.accept().unwrap();
    for i in 0..10u8 {
        let unit = 1 + (i % 2);
        let payload = vec![i; PACKET];
        conn.write_all(&build_frame(i.into(), unit, &payload)).unwrap();
    }
    conn.flush().unwrap();
    thread::sleep(Duration::from_millis(200));

    rig.shutdown.request();
    handle.join().unwrap();

    let unit1 = drain(&mut rig.pipes[0].2, PACKET);
    let unit2 = drain(&mut rig.pipes[1].2, PACKET);
    assert_eq!(unit1.len(), 5);
    assert_eq!(unit2.len(), 5);
    assert!(unit1.iter().all(|p| p[0] % 2 == 0));
    assert!(unit2.iter().all(|p| p[0] % 2 == 1));
}

#[test]
fn wrong_size_payload_resets_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let mut rig = rig(addr, &[1], PACKET);

    let reader = rig.reader.take().unwrap();
    let handle = thread::spawn(move || reader.run());
    rig.barrier.wait();

    {
        let (mut conn, _) = listener.accept().unwrap();
        // One good frame, then a mis-sized one.
        conn.write_all(&build_frame(1, 1, &[0xAA; PACKET])).unwrap();
        conn.write_all(&build_frame(2, 1, &[0xBB; PACKET - 4])).unwrap();
        // The reader drops the connection; wait for the reset to land.
        thread::sleep(Duration::from_millis(300));
    }

    // The reader reconnects after its 1s backoff and keeps going.
    let (mut conn, _) = listener.accept().unwrap();
    conn.write_all(&build_frame(3, 1, &[0xCC; PACKET])).unwrap();
    thread::sleep(Duration::from_millis(200));

    rig.shutdown.request();
    handle.join().unwrap();

    let packets = drain(&mut rig.pipes[0].2, PACKET);
    assert_eq!(packets.len(), 2, "good frames on both sides of the reset");
    assert_eq!(packets[0], vec![0xAA; PACKET]);
    assert_eq!(packets[1], vec![0xCC; PACKET]);
}

#[test]
fn close_mid_frame_flushes_whole_packets_only() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let mut rig = rig(addr, &[1], PACKET);

    let reader = rig.reader.take().unwrap();
    let handle = thread::spawn(move || reader.run());
    rig.barrier.wait();

    {
        let (mut conn, _) = listener.accept().unwrap();
        conn.write_all(&build_frame(1, 1, &[0x11; PACKET])).unwrap();
        // Half a frame, then the server dies.
        let torn = build_frame(2, 1, &[0x22; PACKET]);
        conn.write_all(&torn[..9]).unwrap();
        conn.flush().unwrap();
        thread::sleep(Duration::from_millis(100));
    }

    // The flush on reset hands over the single whole packet.
    let packets = drain(&mut rig.pipes[0].2, PACKET);
    assert_eq!(packets, vec![vec![0x11; PACKET]]);

    rig.shutdown.request();
    handle.join().unwrap();
}

#[test]
fn unknown_unit_ids_are_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let mut rig = rig(addr, &[1], PACKET);

    let reader = rig.reader.take().unwrap();
    let handle = thread::spawn(move || reader.run());
    rig.barrier.wait();

    let (mut conn, _) = listener.accept().unwrap();
    conn.write_all(&build_frame(1, 9, &[0xEE; PACKET])).unwrap();
    conn.write_all(&build_frame(2, 1, &[0xDD; PACKET])).unwrap();
    thread::sleep(Duration::from_millis(200));

    rig.shutdown.request();
    handle.join().unwrap();

    let packets = drain(&mut rig.pipes[0].2, PACKET);
    assert_eq!(packets, vec![vec![0xDD; PACKET]]);
}

#[test]
fn generator_to_reader_end_to_end() {
    const GEN_PACKET: usize = 48;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener); // free the port for the test server

    let shutdown = leaked_flag();
    let barrier = Arc::new(Barrier::new(3));

    let pipe = Arc::new(SensorPipe::new(4, 4096).unwrap());
    pipe.bind_schema(GEN_PACKET).unwrap();
    let (writer, mut pipe_reader) = pipe.split().unwrap();

    let server = TestServer::new(
        addr.clone(),
        vec![GeneratedSensor {
            unit_id: 1,
            packet_size: GEN_PACKET,
        }],
        Duration::from_micros(200),
        shutdown,
        barrier.clone(),
    );
    let server_handle = thread::spawn(move || server.run());

    let mut writers = HashMap::new();
    writers.insert(1u16, writer);
    let reader = Reader::new(addr, 4096, 1024, writers, shutdown, barrier.clone());
    let reader_handle = thread::spawn(move || reader.run());

    barrier.wait();

    // Collect a few buffers of generated traffic.
    let mut packets = Vec::new();
    let mut waits = 0;
    while packets.len() < 64 && waits < 50 {
        match pipe_reader.acquire(Timeout::ms(200)) {
            Ok(buf) => {
                assert_eq!(buf.len() % GEN_PACKET, 0);
                for chunk in buf.chunks_exact(GEN_PACKET) {
                    packets.push(chunk.to_vec());
                }
            }
            Err(PipeError::TimedOut) => waits += 1,
            Err(e) => panic!("pipe failed: {e}"),
        }
    }
    shutdown.request();
    reader_handle.join().unwrap();
    server_handle.join().unwrap();

    assert!(packets.len() >= 64, "generator produced too little traffic");
    // Packet counters are strictly increasing in arrival order.
    let counters: Vec<i64> = packets
        .iter()
        .map(|p| i64::from_ne_bytes(p[..8].try_into().unwrap()))
        .collect();
    assert!(counters.windows(2).all(|w| w[1] > w[0]), "counters reordered");
}
