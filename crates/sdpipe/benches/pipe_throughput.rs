//! Pipe throughput: packets pushed through a writer/reader pair.

use std::thread;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use sdpipe::{SensorPipe, Timeout};

const PACKET_SIZE: usize = 48;
const PACKETS: u64 = 100_000;

fn pipe_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipe");
    group.throughput(Throughput::Elements(PACKETS));

    group.bench_function("push_drain_100k", |b| {
        b.iter(|| {
            let pipe = SensorPipe::new(4, 64 * 1024).unwrap();
            pipe.bind_schema(PACKET_SIZE).unwrap();
            let (mut w, mut r) = pipe.split().unwrap();

            let producer = thread::spawn(move || {
                let packet = [0xA5u8; PACKET_SIZE];
                for _ in 0..PACKETS {
                    w.push_packet(&packet, Timeout::After(Duration::from_secs(10)))
                        .unwrap();
                }
                w.flush(Timeout::After(Duration::from_secs(10))).unwrap();
            });

            let mut packets = 0u64;
            while packets < PACKETS {
                if let Ok(buf) = r.acquire(Timeout::ms(500)) {
                    packets += buf.packet_count() as u64;
                }
            }
            producer.join().unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, pipe_throughput);
criterion_main!(benches);
