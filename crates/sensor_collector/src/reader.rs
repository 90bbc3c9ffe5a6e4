//! Producer loop: socket in, pipes out.
//!
//! One reader thread serves one data handler. It connects to the sensor
//! gateway, receives framed packets, and routes each payload by unit id
//! into that sensor's pipe. Connection failures back off one second and
//! reconnect; partial buffers are flushed to the consumer before every
//! reconnect and on shutdown, so the reader never strands whole packets.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use sdpipe::{scratch, Arena, PipeWriter, ShutdownFlag, Timeout};
use tracing::{debug, error, info, warn};

use crate::proto::{self, FrameError, MAX_FRAME_SIZE};

/// Scratch arenas registered per worker thread.
pub(crate) const SCRATCH_COUNT: usize = 2;

const RECV_TIMEOUT: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const PIPE_WAIT: Timeout = Timeout::After(Duration::from_millis(500));

/// Why the inner receive loop ended.
enum PumpExit {
    Shutdown,
    Reconnect,
}

pub struct Reader {
    addr: String,
    mem: usize,
    scratch_size: usize,
    writers: HashMap<u16, PipeWriter>,
    shutdown: &'static ShutdownFlag,
    barrier: Arc<Barrier>,
}

impl Reader {
    pub fn new(
        addr: String,
        mem: usize,
        scratch_size: usize,
        writers: HashMap<u16, PipeWriter>,
        shutdown: &'static ShutdownFlag,
        barrier: Arc<Barrier>,
    ) -> Self {
        Self {
            addr,
            mem,
            scratch_size,
            writers,
            shutdown,
            barrier,
        }
    }

    /// Thread entry point.
    pub fn run(mut self) {
        let mut arena = Arena::new(self.mem + SCRATCH_COUNT * self.scratch_size);
        for _ in 0..SCRATCH_COUNT {
            match arena.bootstrap(self.scratch_size) {
                Some(s) => scratch::register(s),
                None => {
                    error!("reader arena too small for scratch carve-out");
                    break;
                }
            }
        }

        info!(addr = %self.addr, "reader initialized, waiting at barrier");
        self.barrier.wait();
        info!("reader entering main loop");

        let mut packets: u64 = 0;
        while !self.shutdown.requested() {
            let mut stream = match TcpStream::connect(&self.addr) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "connect failed");
                    self.backoff();
                    continue;
                }
            };
            info!(addr = %self.addr, "connected to sensor gateway");

            let exit = self.pump(&mut stream, &mut packets);
            self.flush_all();
            drop(stream);

            if matches!(exit, PumpExit::Reconnect) && !self.shutdown.requested() {
                info!("reconnecting in 1s");
                self.backoff();
            }
        }

        info!(packets, "reader stopped");
    }

    /// Receives frames until the connection must be reset or shutdown is
    /// requested.
    fn pump(&mut self, stream: &mut TcpStream, packets: &mut u64) -> PumpExit {
        let mut buf = [0u8; MAX_FRAME_SIZE];

        while !self.shutdown.requested() {
            let n = match proto::recv_frame(stream, &mut buf, RECV_TIMEOUT) {
                Ok(n) => n,
                Err(e) if e.is_transient() => continue,
                Err(e) => {
                    warn!(error = %e, "receive failed, resetting connection");
                    return PumpExit::Reconnect;
                }
            };

            let frame = match proto::parse_frame(&buf[..n]) {
                Ok(frame) => frame,
                // Already logged by the parser; the stream is still framed
                // correctly, so keep the connection.
                Err(FrameError::UnsupportedFunction(_)) => continue,
                Err(e) => {
                    warn!(error = %e, "invalid frame, resetting connection");
                    return PumpExit::Reconnect;
                }
            };

            let Some(writer) = self.writers.get_mut(&frame.unit_id) else {
                warn!(unit_id = frame.unit_id, "frame for unknown unit id dropped");
                continue;
            };
            if frame.payload.len() != writer.packet_size() {
                error!(
                    unit_id = frame.unit_id,
                    got = frame.payload.len(),
                    expected = writer.packet_size(),
                    "packet size mismatch, resetting connection"
                );
                return PumpExit::Reconnect;
            }

            // Bounded retries: the pipe is the only admission control, so
            // block here until the consumer frees a buffer or we shut down.
            loop {
                match writer.push_packet(frame.payload, PIPE_WAIT) {
                    Ok(()) => break,
                    Err(e) if e.is_recoverable() => {
                        if self.shutdown.requested() {
                            return PumpExit::Shutdown;
                        }
                        debug!(unit_id = frame.unit_id, "pipe full, waiting for a buffer");
                    }
                    Err(e) => {
                        error!(error = %e, "pipe failed, stopping reader");
                        return PumpExit::Shutdown;
                    }
                }
            }

            *packets += 1;
            if *packets % 10_000 == 0 {
                info!(packets = *packets, "packets received");
            }
        }
        PumpExit::Shutdown
    }

    /// Hands partial buffers to the consumer. A timed-out flush loses the
    /// partial buffer; that is reported and accepted.
    fn flush_all(&mut self) {
        for (&unit_id, writer) in &mut self.writers {
            match writer.flush(PIPE_WAIT) {
                Ok(true) => debug!(unit_id, "flushed partial buffer"),
                Ok(false) => {}
                Err(e) => warn!(unit_id, error = %e, "flush lost a partial buffer"),
            }
        }
    }

    /// One-second backoff in shutdown-responsive slices.
    fn backoff(&self) {
        let mut waited = Duration::ZERO;
        while waited < RECONNECT_BACKOFF && !self.shutdown.requested() {
            thread::sleep(Duration::from_millis(100));
            waited += Duration::from_millis(100);
        }
    }
}
