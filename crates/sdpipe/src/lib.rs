//! Runtime foundation for the sensor-data ingestion service.
//!
//! The crate provides the pieces every data handler is built from:
//!
//! - [`Arena`] / [`scratch`]: bump allocation with stack-like reset, plus
//!   per-thread scratch arenas for nested temporary allocations.
//! - [`sync`]: timeout-aware blocking primitives ([`Timeout`], [`Semaphore`],
//!   [`ThreadControl`]) and the cooperative [`ShutdownFlag`].
//! - [`SensorPipe`]: the bounded multi-buffer pipe that decouples a
//!   protocol-parsing writer from a database-loading reader. One writer, one
//!   reader, buffer-granular handoff, event-driven blocking on both sides.
//! - [`group`]: thread groups with a joining monitor and a manager that
//!   coordinates startup and shutdown across groups.
//!
//! # Example
//!
//! ```ignore
//! use sdpipe::{SensorPipe, Timeout};
//!
//! let pipe = SensorPipe::new(4, 64 * 1024)?;
//! pipe.bind_schema(48)?;
//! let (mut writer, mut reader) = pipe.split()?;
//!
//! // producer thread
//! writer.push_packet(&packet, Timeout::ms(100))?;
//!
//! // consumer thread
//! if let Ok(buf) = reader.acquire(Timeout::ms(100)) {
//!     assert_eq!(buf.len() % pipe.packet_size(), 0);
//!     // ... bulk-load buf ...
//! } // write token returns to the producer here
//! ```

mod arena;
mod error;
mod invariants;
mod pipe;

pub mod group;
pub mod scratch;
pub mod sync;

pub use arena::Arena;
pub use error::PipeError;
pub use pipe::{PipeReader, PipeWriter, ReadGuard, ReadyEvent, SensorPipe};
pub use scratch::Scratch;
pub use sync::{Semaphore, ShutdownFlag, ThreadControl, Timeout};
