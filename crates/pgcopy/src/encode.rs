//! Binary COPY stream framing.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! header:  "PGCOPY\n\xff\r\n\0"  flags:i32 = 0  extension_len:i32 = 0
//! row:     field_count:i16  then per emitted column { len:i32, value }
//! trailer: 0xFFFF
//! ```
//!
//! Values are read from the packed incoming row at each column's offset in
//! host byte order and written big-endian; timestamps are additionally
//! shifted from the Unix epoch to the PostgreSQL epoch.

use crate::schema::TableInfo;
use crate::types::{PgType, TimestampUnit};
use crate::CopyError;

/// Signature opening every binary COPY stream.
pub const COPY_SIGNATURE: [u8; 11] = *b"PGCOPY\n\xff\r\n\0";
/// Signature + zero flags + zero header-extension length.
pub const COPY_HEADER_LEN: usize = 19;
/// End-of-data marker (field count -1).
pub const COPY_TRAILER: [u8; 2] = [0xFF, 0xFF];

/// Encodes packed rows for one table into COPY payload bytes.
pub struct CopyEncoder<'a> {
    table: &'a TableInfo,
    unit: TimestampUnit,
}

impl<'a> CopyEncoder<'a> {
    pub fn new(table: &'a TableInfo, unit: TimestampUnit) -> Self {
        Self { table, unit }
    }

    /// Bytes one encoded row occupies: field count plus per-column length
    /// word and value.
    pub fn encoded_row_size(&self) -> usize {
        let fields: usize = self
            .table
            .columns
            .iter()
            .filter(|c| c.is_emitted())
            .map(|c| 4 + c.wire_len)
            .sum();
        2 + fields
    }

    /// Upper bound for a batch of `items` rows, header and trailer included.
    pub fn max_encoded_size(&self, items: usize) -> usize {
        COPY_HEADER_LEN + items * self.encoded_row_size() + COPY_TRAILER.len()
    }

    /// Encodes `items` packed rows from `data` into `out`, returning the
    /// number of bytes written (header + rows; the trailer is appended by
    /// the loader at end-of-copy).
    pub fn encode_batch(
        &self,
        data: &[u8],
        items: usize,
        out: &mut [u8],
    ) -> Result<usize, CopyError> {
        let row_size = self.table.row_size;
        if data.len() != items * row_size {
            return Err(CopyError::BadBatch {
                bytes: data.len(),
                items,
                row_size,
            });
        }
        let need = COPY_HEADER_LEN + items * self.encoded_row_size();
        if out.len() < need {
            return Err(CopyError::ScratchTooSmall {
                need,
                have: out.len(),
            });
        }

        let mut at = 0usize;
        at += put(out, at, &COPY_SIGNATURE);
        at += put(out, at, &0i32.to_be_bytes()); // flags
        at += put(out, at, &0i32.to_be_bytes()); // header extension length

        let field_count = (self.table.column_count_effective as i16).to_be_bytes();
        for row in data.chunks_exact(row_size) {
            at += put(out, at, &field_count);
            for col in self.table.columns.iter().filter(|c| c.is_emitted()) {
                let offset = col.offset.expect("emitted column has an offset");
                let src = &row[offset..offset + col.wire_len];
                at += put(out, at, &(col.wire_len as i32).to_be_bytes());
                at += match col.pg_type {
                    PgType::Bool => put(out, at, src),
                    PgType::Int2 => {
                        let v = i16::from_ne_bytes(src.try_into().expect("2-byte column"));
                        put(out, at, &v.to_be_bytes())
                    }
                    PgType::Int4 | PgType::Float4 => {
                        let v = u32::from_ne_bytes(src.try_into().expect("4-byte column"));
                        put(out, at, &v.to_be_bytes())
                    }
                    PgType::Int8 | PgType::Float8 => {
                        let v = u64::from_ne_bytes(src.try_into().expect("8-byte column"));
                        put(out, at, &v.to_be_bytes())
                    }
                    PgType::Timestamp | PgType::Timestamptz => {
                        let raw = i64::from_ne_bytes(src.try_into().expect("8-byte column"));
                        put(out, at, &self.unit.to_pg_usecs(raw).to_be_bytes())
                    }
                    // Never emitted: filtered out during schema assembly.
                    PgType::Text | PgType::Varchar | PgType::Other(_) => {
                        unreachable!("non-loadable column marked as emitted")
                    }
                };
            }
        }

        debug_assert_eq!(at, need);
        Ok(at)
    }
}

#[inline]
fn put(out: &mut [u8], at: usize, bytes: &[u8]) -> usize {
    out[at..at + bytes.len()].copy_from_slice(bytes);
    bytes.len()
}
