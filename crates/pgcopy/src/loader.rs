//! Transaction envelope around one encoded COPY batch.

use std::io::Write;

use postgres::Client;
use tracing::{debug, warn};

use crate::encode::{CopyEncoder, COPY_TRAILER};
use crate::schema::TableInfo;
use crate::types::TimestampUnit;
use crate::CopyError;

/// Bulk-loads `items` packed rows into `table` inside one transaction.
///
/// The batch is encoded into `scratch` (sized via
/// [`CopyEncoder::max_encoded_size`]) and streamed as
/// `BEGIN` → `COPY ... FROM STDIN (FORMAT binary)` → `COMMIT`. Any failure
/// rolls the transaction back and drops the batch; the caller keeps the
/// consecutive-failure count.
pub fn insert_batch(
    client: &mut Client,
    table: &TableInfo,
    unit: TimestampUnit,
    data: &[u8],
    items: usize,
    scratch: &mut [u8],
) -> Result<(), CopyError> {
    let encoder = CopyEncoder::new(table, unit);
    let encoded = encoder.encode_batch(data, items, scratch)?;

    let mut tx = client.transaction()?;
    {
        let mut writer = tx.copy_in(&table.copy_command).map_err(|source| {
            warn!(table = %table.table, error = %source, "failed to start COPY");
            CopyError::CopyRejected {
                table: table.table.clone(),
                source,
            }
        })?;
        writer
            .write_all(&scratch[..encoded])
            .and_then(|()| writer.write_all(&COPY_TRAILER))
            .map_err(|source| CopyError::CopyStream {
                table: table.table.clone(),
                source,
            })?;
        writer.finish().map_err(|source| CopyError::CopyRejected {
            table: table.table.clone(),
            source,
        })?;
        // Dropping `tx` without commit rolls the transaction back, so every
        // early return above leaves the table untouched.
    }
    tx.commit()?;

    debug!(table = %table.table, items, bytes = encoded, "committed copy transaction");
    Ok(())
}
