//! In-process frame generator.
//!
//! When `testing.enabled` is set the data handler runs this worker next to
//! the reader: it listens on the gateway address, accepts one connection at
//! a time, and streams generated sensor frames round-robin over the
//! configured sensors. Payloads carry a packet counter, a current
//! timestamp, and random measurement values, so the full
//! receive/pipe/encode/load path is exercised end to end.

use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use sdpipe::ShutdownFlag;
use tracing::{debug, info, warn};

use crate::proto;

/// Maps a schema SQL type to its packed wire width.
pub fn sql_type_wire_len(sql_type: &str) -> Option<usize> {
    match sql_type.trim().to_ascii_uppercase().as_str() {
        "BOOLEAN" | "BOOL" => Some(1),
        "SMALLINT" | "INT2" => Some(2),
        "INT" | "INTEGER" | "INT4" | "REAL" | "FLOAT4" => Some(4),
        "BIGINT" | "INT8" | "DOUBLE PRECISION" | "FLOAT8" => Some(8),
        t if t.starts_with("TIMESTAMP") => Some(8),
        _ => None,
    }
}

/// Packed row size for a sensor's schema columns.
pub fn packet_size_for(columns: &[(String, String)]) -> usize {
    columns
        .iter()
        .filter_map(|(_, sql_type)| sql_type_wire_len(sql_type))
        .sum()
}

/// One generated feed.
#[derive(Debug, Clone)]
pub struct GeneratedSensor {
    pub unit_id: u8,
    pub packet_size: usize,
}

pub struct TestServer {
    listen: String,
    sensors: Vec<GeneratedSensor>,
    /// Pause between frames; zero floods the reader.
    frame_interval: Duration,
    shutdown: &'static ShutdownFlag,
    barrier: Arc<Barrier>,
}

impl TestServer {
    pub fn new(
        listen: String,
        sensors: Vec<GeneratedSensor>,
        frame_interval: Duration,
        shutdown: &'static ShutdownFlag,
        barrier: Arc<Barrier>,
    ) -> Self {
        Self {
            listen,
            sensors,
            frame_interval,
            shutdown,
            barrier,
        }
    }

    /// Thread entry point.
    pub fn run(self) {
        let listener = match TcpListener::bind(&self.listen) {
            Ok(listener) => listener,
            Err(e) => {
                warn!(addr = %self.listen, error = %e, "test server cannot bind");
                self.barrier.wait();
                return;
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            warn!(error = %e, "test server cannot use nonblocking accept");
            self.barrier.wait();
            return;
        }

        info!(addr = %self.listen, "test server listening, waiting at barrier");
        self.barrier.wait();

        let mut txid: u16 = 0;
        let mut counter: u64 = 0;
        while !self.shutdown.requested() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "test server accepted reader connection");
                    self.serve(stream, &mut txid, &mut counter);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    warn!(error = %e, "test server accept failed");
                    thread::sleep(Duration::from_millis(200));
                }
            }
        }
        info!(frames = counter, "test server stopped");
    }

    fn serve(&self, mut stream: TcpStream, txid: &mut u16, counter: &mut u64) {
        // The listener is nonblocking; the accepted stream must not be.
        let _ = stream.set_nonblocking(false);
        let mut rng = rand::thread_rng();
        while !self.shutdown.requested() {
            for sensor in &self.sensors {
                let payload = generate_packet(sensor.packet_size, *counter, &mut rng);
                *txid = txid.wrapping_add(1);
                if let Err(e) = proto::send_frame(&mut stream, *txid, sensor.unit_id, &payload) {
                    debug!(error = %e, "reader went away, back to accept");
                    return;
                }
                *counter += 1;
            }
            if !self.frame_interval.is_zero() {
                thread::sleep(self.frame_interval);
            }
        }
    }
}

/// Builds one packed row: a counter, a Unix-seconds timestamp, then random
/// measurement doubles. Falls back to patterned bytes for odd layouts.
fn generate_packet(size: usize, counter: u64, rng: &mut impl Rng) -> Vec<u8> {
    let mut payload = vec![0u8; size];
    if size >= 16 && size % 8 == 0 {
        payload[..8].copy_from_slice(&(counter as i64).to_ne_bytes());
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        payload[8..16].copy_from_slice(&now.to_ne_bytes());
        for chunk in payload[16..].chunks_exact_mut(8) {
            chunk.copy_from_slice(&rng.gen_range(0.0..10_000.0f64).to_ne_bytes());
        }
    } else {
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (counter as u8).wrapping_add(i as u8);
        }
    }
    payload
}
