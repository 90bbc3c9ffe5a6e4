//! Table introspection and packed-row layout.
//!
//! For every sensor table the loader needs to know, per column: the wire
//! type, its length, and where the value sits inside the raw packed row the
//! wire protocol delivers. Offsets follow declaration order over the
//! non-auto-increment columns; auto-increment columns (SERIAL primary keys)
//! are absent from the incoming data and from the COPY column list.

use postgres::Client;
use tracing::{debug, info, warn};

use crate::types::PgType;
use crate::CopyError;

/// Catalog query yielding one row per column of the target table, in
/// declaration order: name, type oid, wire length, type modifier,
/// primary-key flag, auto-increment flag (a `nextval(...)` default).
const TABLE_METADATA_QUERY: &str = "SELECT \
     a.attname::text AS column_name, \
     t.oid AS type_oid, \
     t.typlen::int4 AS type_length, \
     a.atttypmod AS type_modifier, \
     EXISTS ( \
       SELECT 1 FROM pg_constraint pc \
       WHERE pc.conrelid = c.oid AND pc.contype = 'p' AND a.attnum = ANY(pc.conkey) \
     ) AS is_primary_key, \
     EXISTS ( \
       SELECT 1 FROM pg_attrdef ad \
       WHERE ad.adrelid = c.oid AND ad.adnum = a.attnum \
         AND pg_get_expr(ad.adbin, ad.adrelid) LIKE 'nextval%' \
     ) AS is_auto_increment \
     FROM pg_catalog.pg_class c \
     JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid \
     JOIN pg_catalog.pg_type t ON a.atttypid = t.oid \
     WHERE c.relname = $1 AND a.attnum > 0 AND NOT a.attisdropped \
     ORDER BY a.attnum";

/// One column of a sensor table.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub pg_type: PgType,
    /// Wire length in bytes; 0 for columns the encoder does not emit.
    pub wire_len: usize,
    pub type_modifier: i32,
    pub is_primary_key: bool,
    pub is_auto_increment: bool,
    /// Offset inside the packed incoming row; `None` for columns absent
    /// from the incoming data (auto-increment or unsupported).
    pub offset: Option<usize>,
}

impl ColumnMeta {
    /// `true` when the column carries a value in the packed row and in the
    /// COPY stream.
    #[inline]
    pub fn is_emitted(&self) -> bool {
        self.offset.is_some()
    }
}

/// A sensor table's schema plus the prebuilt COPY command.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub table: String,
    pub columns: Vec<ColumnMeta>,
    /// Bytes of one packed incoming row.
    pub row_size: usize,
    pub column_count: usize,
    /// Columns actually emitted into the COPY stream.
    pub column_count_effective: usize,
    pub copy_command: String,
}

/// Raw catalog row, kept separate so layout computation is testable without
/// a live database.
#[derive(Debug, Clone)]
pub struct RawColumn {
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
    pub is_primary_key: bool,
    pub is_auto_increment: bool,
}

impl TableInfo {
    /// Computes offsets, row size and the COPY command from catalog rows.
    pub fn assemble(table: impl Into<String>, raw: Vec<RawColumn>) -> Result<Self, CopyError> {
        let table = table.into();
        let column_count = raw.len();
        let mut columns = Vec::with_capacity(column_count);
        let mut offset = 0usize;
        let mut effective = 0usize;

        for rc in raw {
            let pg_type = PgType::from_oid(rc.type_oid);
            if rc.is_auto_increment {
                // Generated by the server, never present in the packed row.
                columns.push(ColumnMeta {
                    name: rc.name,
                    pg_type,
                    wire_len: 0,
                    type_modifier: rc.type_modifier,
                    is_primary_key: rc.is_primary_key,
                    is_auto_increment: true,
                    offset: None,
                });
                continue;
            }
            match pg_type.wire_len() {
                Some(len) => {
                    columns.push(ColumnMeta {
                        name: rc.name,
                        pg_type,
                        wire_len: len,
                        type_modifier: rc.type_modifier,
                        is_primary_key: rc.is_primary_key,
                        is_auto_increment: false,
                        offset: Some(offset),
                    });
                    offset += len;
                    effective += 1;
                }
                None => {
                    // Variable-length and unknown types have no binary
                    // encoding here; excluding them from the COPY column
                    // list keeps the stream well-formed.
                    warn!(
                        table = %table,
                        column = %rc.name,
                        oid = rc.type_oid,
                        "column type not loadable, excluded from bulk load"
                    );
                    columns.push(ColumnMeta {
                        name: rc.name,
                        pg_type,
                        wire_len: 0,
                        type_modifier: rc.type_modifier,
                        is_primary_key: rc.is_primary_key,
                        is_auto_increment: false,
                        offset: None,
                    });
                }
            }
        }

        if effective == 0 {
            return Err(CopyError::EmptySchema(table));
        }

        let col_list = columns
            .iter()
            .filter(|c| c.is_emitted())
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let copy_command = format!("COPY {table}({col_list}) FROM STDIN WITH (FORMAT binary)");

        Ok(Self {
            table,
            columns,
            row_size: offset,
            column_count,
            column_count_effective: effective,
            copy_command,
        })
    }
}

/// Introspects `table` and computes its packed-row layout.
pub fn discover(client: &mut Client, table: &str) -> Result<TableInfo, CopyError> {
    let rows = client.query(TABLE_METADATA_QUERY, &[&table])?;
    let raw = rows
        .iter()
        .map(|row| {
            let rc = RawColumn {
                name: row.get::<_, String>(0),
                type_oid: row.get::<_, postgres::types::Oid>(1),
                type_modifier: row.get::<_, i32>(3),
                is_primary_key: row.get::<_, bool>(4),
                is_auto_increment: row.get::<_, bool>(5),
            };
            let catalog_len = row.get::<_, i32>(2);
            if let Some(expected) = PgType::from_oid(rc.type_oid).wire_len() {
                if catalog_len > 0 && catalog_len as usize != expected {
                    warn!(
                        table = %table,
                        column = %rc.name,
                        catalog_len,
                        expected,
                        "catalog wire length disagrees with encoder"
                    );
                }
            }
            rc
        })
        .collect::<Vec<_>>();

    if raw.is_empty() {
        return Err(CopyError::EmptySchema(table.to_owned()));
    }

    let info = TableInfo::assemble(table, raw)?;
    info!(
        table = %info.table,
        columns = info.column_count,
        effective = info.column_count_effective,
        row_size = info.row_size,
        "discovered table schema"
    );
    debug!(copy_command = %info.copy_command);
    Ok(info)
}

/// Creates a sensor table from the schema document:
/// `id SERIAL PRIMARY KEY` plus the declared columns, in declaration order.
/// Idempotent (`IF NOT EXISTS`).
pub fn create_sensor_table(
    client: &mut Client,
    table: &str,
    columns: &[(String, String)],
) -> Result<(), CopyError> {
    let mut ddl = format!("CREATE TABLE IF NOT EXISTS {table} (id SERIAL PRIMARY KEY");
    for (name, sql_type) in columns {
        ddl.push_str(", ");
        ddl.push_str(name);
        ddl.push(' ');
        ddl.push_str(sql_type);
    }
    ddl.push(')');

    debug!(table = %table, ddl = %ddl, "creating sensor table");
    client.batch_execute(&ddl)?;
    info!(table = %table, "sensor table created or already present");
    Ok(())
}
