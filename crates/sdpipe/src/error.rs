//! Error types for pipe operations.

use thiserror::Error;

/// Errors that can occur on the sensor-data pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipeError {
    /// No buffer became available within the caller's timeout.
    #[error("timed out waiting for a pipe buffer")]
    TimedOut,

    /// Fewer than two buffers were requested at creation.
    #[error("pipe needs at least two buffers, got {0}")]
    TooFewBuffers(usize),

    /// The pipe was asked for a second writer/reader pair.
    #[error("pipe endpoints already taken")]
    AlreadySplit,

    /// An append would overrun the buffer's usable region.
    #[error("append of {need} bytes exceeds buffer fill limit ({free} free)")]
    BufferOverrun { need: usize, free: usize },

    /// A packet size that does not divide into the buffer capacity, or zero.
    #[error("packet size {packet} cannot be bound to buffers of {capacity} bytes")]
    BadPacketSize { packet: usize, capacity: usize },

    /// An operation that requires a bound schema ran before `bind_schema`.
    #[error("pipe schema not bound")]
    SchemaNotBound,
}

impl PipeError {
    /// Returns `true` if the caller may simply retry (e.g. after checking
    /// the shutdown flag).
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    /// Returns `true` if this error indicates a setup bug rather than a
    /// runtime condition.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !self.is_recoverable()
    }
}
