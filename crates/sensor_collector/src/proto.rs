//! Wire-protocol frame codec.
//!
//! Frames carry one packed sensor row behind a fixed header:
//!
//! ```text
//! | txid(2) | protocol_id(2) | length(2) | unit_id(1) |  <- 7-byte header
//! | function_code(1) | data_length(1) | data(data_length) |
//! ```
//!
//! Multi-byte integers are big-endian. The `length` field counts the bytes
//! after the header and must equal `data_length + 3`. Only function code
//! 0x03 carries sensor data; anything else is dropped with a warning.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

/// Fixed header: transaction id, protocol id, length, unit id.
pub const HEADER_LEN: usize = 7;
/// Bytes of the length field not counted by `data_length`.
pub const HEADER_OVERHEAD: u16 = 3;
/// Largest legal frame.
pub const MAX_FRAME_SIZE: usize = 260;
/// Read-holding-registers response, the only supported function code.
pub const FUNCTION_READ_HOLDING: u8 = 0x03;

/// Reception failures, split by how the reader loop must react.
#[derive(Debug, Error)]
pub enum RecvError {
    /// Nothing arrived within the timeout; the connection is still good.
    #[error("receive timed out")]
    TimedOut,

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// A read stopped partway through a frame.
    #[error("short read: got {got} of {want} bytes")]
    Incomplete { got: usize, want: usize },

    /// The header declares a frame larger than the protocol allows.
    #[error("declared frame length {0} exceeds maximum")]
    TooLarge(usize),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecvError {
    /// `true` when the reader may keep the connection and poll again.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Frame-validation failures.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Header length field disagrees with the data length byte. The frame
    /// boundary is unreliable, so the connection must be reset.
    #[error("inconsistent frame lengths: length={length}, data_length={data_length}")]
    LengthMismatch { length: u16, data_length: u8 },

    /// Frame shorter than the fixed header plus function/length bytes.
    #[error("truncated frame: {0} bytes")]
    Truncated(usize),

    /// Parseable frame with a function code we do not handle; dropped.
    #[error("unsupported function code {0:#04x}")]
    UnsupportedFunction(u8),
}

/// A parsed frame borrowing the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub transaction_id: u16,
    pub unit_id: u16,
    pub payload: &'a [u8],
}

/// Reads exactly `want` bytes into `buf[at..]`, within `deadline`.
fn recv_exact(
    stream: &mut TcpStream,
    buf: &mut [u8],
    want: usize,
    deadline: Instant,
) -> Result<(), RecvError> {
    let mut got = 0usize;
    while got < want {
        let now = Instant::now();
        if now >= deadline {
            return if got == 0 {
                Err(RecvError::TimedOut)
            } else {
                Err(RecvError::Incomplete { got, want })
            };
        }
        stream.set_read_timeout(Some(deadline - now))?;
        match stream.read(&mut buf[got..want]) {
            Ok(0) => return Err(RecvError::Closed),
            Ok(n) => got += n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return if got == 0 {
                    Err(RecvError::TimedOut)
                } else {
                    Err(RecvError::Incomplete { got, want })
                };
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(RecvError::Io(e)),
        }
    }
    Ok(())
}

/// Receives one complete frame into `buf`, returning its total size.
///
/// Two phases: the fixed header first, then the `length` field's worth of
/// data. A timeout with zero bytes read is transient; any short read is a
/// protocol error and the caller must reconnect.
pub fn recv_frame(
    stream: &mut TcpStream,
    buf: &mut [u8; MAX_FRAME_SIZE],
    timeout: Duration,
) -> Result<usize, RecvError> {
    let deadline = Instant::now() + timeout;

    recv_exact(stream, buf, HEADER_LEN, deadline)?;

    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let total = HEADER_LEN + length;
    if total > MAX_FRAME_SIZE {
        return Err(RecvError::TooLarge(total));
    }

    // Phase two gets its own full timeout, as phase one may have consumed
    // most of the deadline waiting for traffic to start.
    let body_deadline = Instant::now() + timeout;
    recv_exact(stream, &mut buf[HEADER_LEN..total], length, body_deadline).map_err(|e| match e {
        // Partial frames after a complete header are never transient.
        RecvError::TimedOut => RecvError::Incomplete { got: 0, want: length },
        other => other,
    })?;
    Ok(total)
}

/// Parses and validates a received frame.
pub fn parse_frame(frame: &[u8]) -> Result<Frame<'_>, FrameError> {
    if frame.len() < HEADER_LEN + 2 {
        return Err(FrameError::Truncated(frame.len()));
    }

    let length = u16::from_be_bytes([frame[4], frame[5]]);
    let unit_id = u16::from(frame[6]);
    let function_code = frame[7];
    let data_length = frame[8];

    if length != u16::from(data_length) + HEADER_OVERHEAD {
        return Err(FrameError::LengthMismatch {
            length,
            data_length,
        });
    }
    if frame.len() < HEADER_LEN + 2 + data_length as usize {
        return Err(FrameError::Truncated(frame.len()));
    }
    if function_code != FUNCTION_READ_HOLDING {
        warn!(function_code, unit_id, "dropping frame with unsupported function code");
        return Err(FrameError::UnsupportedFunction(function_code));
    }

    Ok(Frame {
        transaction_id: u16::from_be_bytes([frame[0], frame[1]]),
        unit_id,
        payload: &frame[HEADER_LEN + 2..HEADER_LEN + 2 + data_length as usize],
    })
}

/// Builds a complete frame around `payload`. Used by the in-process test
/// server and the codec tests.
pub fn build_frame(transaction_id: u16, unit_id: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= MAX_FRAME_SIZE - HEADER_LEN - 2);
    let length = payload.len() as u16 + HEADER_OVERHEAD;
    let mut frame = Vec::with_capacity(HEADER_LEN + 2 + payload.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // protocol id
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.push(FUNCTION_READ_HOLDING);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    frame
}

/// Writes one frame to a stream. Test-server helper.
pub fn send_frame(
    stream: &mut TcpStream,
    transaction_id: u16,
    unit_id: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    stream.write_all(&build_frame(transaction_id, unit_id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse_round_trip() {
        let payload = [0x11u8, 0x22, 0x33, 0x44];
        let frame = build_frame(7, 2, &payload);
        assert_eq!(frame.len(), HEADER_LEN + 2 + 4);
        assert_eq!(frame[4..6], (4u16 + 3).to_be_bytes());

        let parsed = parse_frame(&frame).unwrap();
        assert_eq!(parsed.transaction_id, 7);
        assert_eq!(parsed.unit_id, 2);
        assert_eq!(parsed.payload, &payload);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut frame = build_frame(1, 1, &[0u8; 8]);
        frame[5] = frame[5].wrapping_add(1);
        assert!(matches!(
            parse_frame(&frame),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn unsupported_function_code_is_dropped() {
        let mut frame = build_frame(1, 1, &[0u8; 8]);
        frame[7] = 0x06;
        assert_eq!(
            parse_frame(&frame),
            Err(FrameError::UnsupportedFunction(0x06))
        );
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = build_frame(1, 1, &[0u8; 8]);
        assert!(matches!(
            parse_frame(&frame[..6]),
            Err(FrameError::Truncated(6))
        ));
    }

    mod socket {
        use super::super::*;
        use std::net::TcpListener;
        use std::thread;

        fn pair() -> (TcpStream, TcpStream) {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
            let (server, _) = listener.accept().unwrap();
            (client.join().unwrap(), server)
        }

        #[test]
        fn recv_frame_reassembles_split_writes() {
            let (mut rx, mut tx) = pair();
            let frame = build_frame(3, 1, &[9u8; 16]);
            let (a, b) = frame.split_at(5);
            let a = a.to_vec();
            let b = b.to_vec();

            let sender = thread::spawn(move || {
                tx.write_all(&a).unwrap();
                thread::sleep(Duration::from_millis(20));
                tx.write_all(&b).unwrap();
            });

            let mut buf = [0u8; MAX_FRAME_SIZE];
            let n = recv_frame(&mut rx, &mut buf, Duration::from_millis(500)).unwrap();
            assert_eq!(&buf[..n], frame.as_slice());
            sender.join().unwrap();
        }

        #[test]
        fn idle_socket_times_out_cleanly() {
            let (mut rx, _tx) = pair();
            let mut buf = [0u8; MAX_FRAME_SIZE];
            let err = recv_frame(&mut rx, &mut buf, Duration::from_millis(50)).unwrap_err();
            assert!(err.is_transient(), "expected timeout, got {err:?}");
        }

        #[test]
        fn closed_mid_frame_is_fatal() {
            let (mut rx, mut tx) = pair();
            let frame = build_frame(4, 1, &[7u8; 32]);
            tx.write_all(&frame[..10]).unwrap();
            drop(tx);

            let mut buf = [0u8; MAX_FRAME_SIZE];
            let err = recv_frame(&mut rx, &mut buf, Duration::from_millis(200)).unwrap_err();
            assert!(
                matches!(err, RecvError::Closed | RecvError::Incomplete { .. }),
                "expected fatal error, got {err:?}"
            );
        }
    }
}
