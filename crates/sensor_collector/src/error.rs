//! Service error taxonomy.
//!
//! Every failure maps to one of a small set of categories with a stable
//! small-integer code and short string, so log lines and exit paths stay
//! greppable across versions.

use thiserror::Error;

/// Stable error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    ConfigInvalid = 1,
    IoTransient = 2,
    IoFatal = 3,
    ProtocolInvalid = 4,
    EncodingError = 5,
    DbCommandFailed = 6,
    DbCopyFailed = 7,
    ResourceExhausted = 8,
}

impl ErrorKind {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "config_invalid",
            Self::IoTransient => "io_transient",
            Self::IoFatal => "io_fatal",
            Self::ProtocolInvalid => "protocol_invalid",
            Self::EncodingError => "encoding_error",
            Self::DbCommandFailed => "db_command_failed",
            Self::DbCopyFailed => "db_copy_failed",
            Self::ResourceExhausted => "resource_exhausted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the service layer.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("configuration invalid: {0}")]
    Config(String),

    #[error("transient i/o: {0}")]
    IoTransient(#[source] std::io::Error),

    #[error("fatal i/o: {0}")]
    IoFatal(#[source] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error(transparent)]
    Copy(#[from] pgcopy::CopyError),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The consumer saw no readable buffer for too many consecutive waits.
    #[error("consumer starved: {0} consecutive wait timeouts")]
    ConsumerStarved(u32),
}

impl CollectorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::ConfigInvalid,
            Self::IoTransient(_) => ErrorKind::IoTransient,
            Self::IoFatal(_) | Self::ConsumerStarved(_) => ErrorKind::IoFatal,
            Self::Protocol(_) => ErrorKind::ProtocolInvalid,
            Self::Encoding(_) => ErrorKind::EncodingError,
            Self::Copy(pgcopy::CopyError::ScratchTooSmall { .. }) => ErrorKind::ResourceExhausted,
            Self::Copy(e) if e.is_copy_failure() => ErrorKind::DbCopyFailed,
            Self::Copy(_) => ErrorKind::DbCommandFailed,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
        }
    }
}
