//! Sensor-data ingestion service.
//!
//! One data handler pairs a wire-protocol reader with a database bulk
//! loader: the reader thread receives framed sensor packets from a socket
//! and routes them by unit id into per-sensor [`sdpipe::SensorPipe`]s; the
//! consumer thread drains completed buffers and streams them into the
//! column store with `pgcopy`. Handlers are described in a JSON document
//! and run as [`sdpipe::group`] thread groups under a single manager;
//! SIGINT/SIGTERM request a cooperative shutdown, fatal signals snapshot
//! process memory and pipe contents to `dumps/` before re-raising.

pub mod config;
pub mod consumer;
pub mod dump;
pub mod error;
pub mod handler;
pub mod proto;
pub mod reader;
pub mod signals;
pub mod testsrv;

pub use config::{load_config, load_schema, ByteSize, HandlerConfig, TopConfig};
pub use error::{CollectorError, ErrorKind};
