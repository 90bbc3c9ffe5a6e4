//! Schema-driven binary COPY encoding and bulk loading.
//!
//! The crate turns packed sensor rows into PostgreSQL's native binary COPY
//! wire format and streams them inside a transaction envelope:
//!
//! 1. [`schema::discover`] introspects the target table through the
//!    `pg_catalog` and computes each column's offset inside the incoming
//!    packed row.
//! 2. [`CopyEncoder`] writes the 19-byte COPY header and the per-row
//!    big-endian fields into a caller-supplied scratch buffer.
//! 3. [`insert_batch`] wraps one encoded buffer in
//!    `BEGIN` / `COPY ... FROM STDIN (FORMAT binary)` / `COMMIT`, rolling
//!    back on any failure.
//!
//! All multi-byte integers on the wire are big-endian; timestamps are
//! converted from the configured [`TimestampUnit`] to microseconds since
//! the PostgreSQL epoch (2000-01-01).

mod encode;
mod error;
mod loader;
pub mod schema;
pub mod types;

pub use encode::{CopyEncoder, COPY_HEADER_LEN, COPY_SIGNATURE, COPY_TRAILER};
pub use error::CopyError;
pub use loader::insert_batch;
pub use schema::{ColumnMeta, TableInfo};
pub use types::{PgType, TimestampUnit};
