//! Wire-format tests for the binary COPY encoder: golden bytes for the
//! shaft-power row, byte-order properties, timestamp epoch shifting.

use pgcopy::schema::RawColumn;
use pgcopy::{CopyEncoder, TableInfo, TimestampUnit, COPY_HEADER_LEN};

const OID_INT4: u32 = 23;
const OID_INT8: u32 = 20;
const OID_FLOAT8: u32 = 701;
const OID_TIMESTAMP: u32 = 1114;

fn col(name: &str, oid: u32) -> RawColumn {
    RawColumn {
        name: name.to_owned(),
        type_oid: oid,
        type_modifier: -1,
        is_primary_key: false,
        is_auto_increment: false,
    }
}

fn serial(name: &str) -> RawColumn {
    RawColumn {
        name: name.to_owned(),
        type_oid: OID_INT4,
        type_modifier: -1,
        is_primary_key: true,
        is_auto_increment: true,
    }
}

/// The shaft-power table: SERIAL id plus six 8-byte measurement columns.
fn shaft_power() -> TableInfo {
    TableInfo::assemble(
        "shaft_power",
        vec![
            serial("id"),
            col("packet_id", OID_INT8),
            col("time", OID_TIMESTAMP),
            col("rpm", OID_FLOAT8),
            col("torque", OID_FLOAT8),
            col("power", OID_FLOAT8),
            col("peak_peak_pfs", OID_FLOAT8),
        ],
    )
    .unwrap()
}

/// Packs one shaft-power row the way the wire protocol delivers it.
fn pack_row(packet_id: i64, time: i64, values: [f64; 4]) -> Vec<u8> {
    let mut row = Vec::with_capacity(48);
    row.extend_from_slice(&packet_id.to_ne_bytes());
    row.extend_from_slice(&time.to_ne_bytes());
    for v in values {
        row.extend_from_slice(&v.to_ne_bytes());
    }
    row
}

#[test]
fn shaft_power_row_golden_encoding() {
    let info = shaft_power();
    assert_eq!(info.row_size, 48);
    assert_eq!(info.column_count_effective, 6);

    let enc = CopyEncoder::new(&info, TimestampUnit::Seconds);
    let row = pack_row(1, 1_700_000_000, [1500.0, 200.0, 314.0, 0.5]);

    let mut out = vec![0u8; enc.max_encoded_size(1)];
    let n = enc.encode_batch(&row, 1, &mut out).unwrap();
    let body = &out[COPY_HEADER_LEN..n];

    // Field count, then per field a 4-byte length of 8 and the value.
    assert_eq!(&body[..2], &[0x00, 0x06]);

    let field = |i: usize| -> (&[u8], &[u8]) {
        let start = 2 + i * 12;
        (&body[start..start + 4], &body[start + 4..start + 12])
    };

    let (len0, packet_id) = field(0);
    assert_eq!(len0, &[0, 0, 0, 8]);
    assert_eq!(packet_id, &1i64.to_be_bytes());

    // Unix seconds shifted to microseconds since 2000-01-01.
    let expected_usecs =
        1_700_000_000i64 * 1_000_000 + (2_440_588 - 2_451_545) * 86_400_000_000;
    let (len1, time) = field(1);
    assert_eq!(len1, &[0, 0, 0, 8]);
    assert_eq!(time, &expected_usecs.to_be_bytes());

    for (i, expected) in [1500.0f64, 200.0, 314.0, 0.5].iter().enumerate() {
        let (len, value) = field(2 + i);
        assert_eq!(len, &[0, 0, 0, 8]);
        assert_eq!(value, &expected.to_be_bytes());
    }

    assert_eq!(body.len(), 2 + 6 * 12);
}

#[test]
fn every_field_decodes_back_to_host_value() {
    let info = shaft_power();
    let enc = CopyEncoder::new(&info, TimestampUnit::Seconds);

    let rows: Vec<(i64, i64, [f64; 4])> = vec![
        (i64::MIN, 0, [f64::MIN, -0.0, f64::MAX, 1.0e-300]),
        (42, 946_684_800, [0.0, 1.0, -1.0, 3.141_592_653_589_793]),
    ];

    let mut data = Vec::new();
    for (pid, t, vals) in &rows {
        data.extend_from_slice(&pack_row(*pid, *t, *vals));
    }

    let mut out = vec![0u8; enc.max_encoded_size(rows.len())];
    let n = enc.encode_batch(&data, rows.len(), &mut out).unwrap();

    let mut at = COPY_HEADER_LEN;
    for (pid, t, vals) in &rows {
        assert_eq!(i16::from_be_bytes(out[at..at + 2].try_into().unwrap()), 6);
        at += 2;

        let mut next = |expected_len: usize| -> [u8; 8] {
            let len = i32::from_be_bytes(out[at..at + 4].try_into().unwrap());
            assert_eq!(len as usize, expected_len);
            at += 4;
            let v = out[at..at + 8].try_into().unwrap();
            at += 8;
            v
        };

        assert_eq!(i64::from_be_bytes(next(8)), *pid);
        assert_eq!(
            i64::from_be_bytes(next(8)),
            TimestampUnit::Seconds.to_pg_usecs(*t)
        );
        for v in vals {
            assert_eq!(f64::from_be_bytes(next(8)).to_bits(), v.to_bits());
        }
    }
    assert_eq!(at, n);
}

#[test]
fn timestamp_round_trips_through_pg_epoch() {
    for unit in [
        TimestampUnit::Seconds,
        TimestampUnit::Micros,
        TimestampUnit::Nanos,
    ] {
        for t in [0i64, 1, 1_000_000, 1_700_000_000] {
            let pg = unit.to_pg_usecs(t);
            assert_eq!(unit.from_pg_usecs(pg), t, "unit {unit:?} value {t}");
        }
    }
}

#[test]
fn multi_row_batches_are_contiguous() {
    let info = shaft_power();
    let enc = CopyEncoder::new(&info, TimestampUnit::Seconds);

    let mut data = Vec::new();
    for i in 0..5i64 {
        data.extend_from_slice(&pack_row(i, 1_700_000_000 + i, [i as f64; 4]));
    }

    let mut out = vec![0u8; enc.max_encoded_size(5)];
    let n = enc.encode_batch(&data, 5, &mut out).unwrap();
    assert_eq!(n, COPY_HEADER_LEN + 5 * enc.encoded_row_size());

    // Each row starts with the field count; spot-check row starts.
    for i in 0..5 {
        let at = COPY_HEADER_LEN + i * enc.encoded_row_size();
        assert_eq!(&out[at..at + 2], &[0x00, 0x06]);
    }
}

#[test]
fn mixed_width_columns_use_declared_lengths() {
    let info = TableInfo::assemble(
        "mixed",
        vec![
            col("flag", 16),
            col("small", 21),
            col("medium", 23),
            col("wide", OID_INT8),
        ],
    )
    .unwrap();
    assert_eq!(info.row_size, 1 + 2 + 4 + 8);

    let enc = CopyEncoder::new(&info, TimestampUnit::Seconds);
    let mut row = Vec::new();
    row.push(1u8);
    row.extend_from_slice(&(-2i16).to_ne_bytes());
    row.extend_from_slice(&3i32.to_ne_bytes());
    row.extend_from_slice(&(-4i64).to_ne_bytes());

    let mut out = vec![0u8; enc.max_encoded_size(1)];
    let n = enc.encode_batch(&row, 1, &mut out).unwrap();

    let body = &out[COPY_HEADER_LEN..n];
    assert_eq!(&body[..2], &[0x00, 0x04]);
    let mut at = 2;
    for (expected_len, expected_bytes) in [
        (1usize, vec![1u8]),
        (2, (-2i16).to_be_bytes().to_vec()),
        (4, 3i32.to_be_bytes().to_vec()),
        (8, (-4i64).to_be_bytes().to_vec()),
    ] {
        let len = i32::from_be_bytes(body[at..at + 4].try_into().unwrap());
        assert_eq!(len as usize, expected_len);
        at += 4;
        assert_eq!(&body[at..at + expected_len], expected_bytes.as_slice());
        at += expected_len;
    }
    assert_eq!(at, body.len());
}
