//! Error types for schema discovery and bulk loading.

use thiserror::Error;

/// Errors from the COPY path.
#[derive(Debug, Error)]
pub enum CopyError {
    /// A plain command (BEGIN, COMMIT, metadata query, CREATE TABLE) failed.
    #[error("database command failed: {0}")]
    Command(#[from] postgres::Error),

    /// Writing the COPY payload failed mid-stream.
    #[error("COPY stream failed for table {table}: {source}")]
    CopyStream {
        table: String,
        source: std::io::Error,
    },

    /// The server rejected the COPY batch at end-of-copy.
    #[error("COPY batch rejected for table {table}: {source}")]
    CopyRejected {
        table: String,
        source: postgres::Error,
    },

    /// Discovery found no column the binary encoder can load.
    #[error("no loadable columns in table {0}")]
    EmptySchema(String),

    /// The caller's scratch buffer cannot hold the encoded batch.
    #[error("encode scratch too small: need {need} bytes, have {have}")]
    ScratchTooSmall { need: usize, have: usize },

    /// The batch byte count does not match the schema's row size.
    #[error("batch of {bytes} bytes is not {items} rows of {row_size} bytes")]
    BadBatch {
        bytes: usize,
        items: usize,
        row_size: usize,
    },
}

impl CopyError {
    /// `true` for failures of the COPY stream itself, as opposed to plain
    /// command failures. The two are counted the same by callers but logged
    /// differently.
    pub fn is_copy_failure(&self) -> bool {
        matches!(self, Self::CopyStream { .. } | Self::CopyRejected { .. })
    }
}
