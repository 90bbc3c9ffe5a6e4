//! PostgreSQL type tags, wire lengths and epoch arithmetic.

use serde::Deserialize;

/// Julian date of 2000-01-01, the PostgreSQL timestamp epoch.
pub const POSTGRES_EPOCH_JDATE: i64 = 2_451_545;
/// Julian date of 1970-01-01, the Unix epoch.
pub const UNIX_EPOCH_JDATE: i64 = 2_440_588;
pub const USECS_PER_DAY: i64 = 86_400_000_000;
pub const USECS_PER_SECOND: i64 = 1_000_000;
pub const NSECS_PER_USEC: i64 = 1_000;

/// Microseconds added to a Unix-epoch value to shift it onto the
/// PostgreSQL epoch (negative: the PostgreSQL epoch is later).
pub const EPOCH_SHIFT_USECS: i64 = (UNIX_EPOCH_JDATE - POSTGRES_EPOCH_JDATE) * USECS_PER_DAY;

/// Column types the encoder understands, keyed by catalog OID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Timestamp,
    Timestamptz,
    Text,
    Varchar,
    Other(u32),
}

impl PgType {
    pub fn from_oid(oid: u32) -> Self {
        match oid {
            16 => Self::Bool,
            21 => Self::Int2,
            23 => Self::Int4,
            20 => Self::Int8,
            700 => Self::Float4,
            701 => Self::Float8,
            1114 => Self::Timestamp,
            1184 => Self::Timestamptz,
            25 => Self::Text,
            1043 => Self::Varchar,
            other => Self::Other(other),
        }
    }

    /// Wire length in bytes for types the encoder emits, `None` otherwise
    /// (variable-length and unknown types are not loadable).
    pub fn wire_len(self) -> Option<usize> {
        match self {
            Self::Bool => Some(1),
            Self::Int2 => Some(2),
            Self::Int4 | Self::Float4 => Some(4),
            Self::Int8 | Self::Float8 | Self::Timestamp | Self::Timestamptz => Some(8),
            Self::Text | Self::Varchar | Self::Other(_) => None,
        }
    }

    #[inline]
    pub fn is_timestamp(self) -> bool {
        matches!(self, Self::Timestamp | Self::Timestamptz)
    }
}

/// Unit of the timestamps arriving in packed rows.
///
/// One variant is chosen per deployment and declared in the configuration;
/// the packed field is always a 64-bit count since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampUnit {
    #[default]
    Seconds,
    Micros,
    Nanos,
}

impl TimestampUnit {
    /// Converts a raw incoming timestamp to microseconds since the
    /// PostgreSQL epoch.
    #[inline]
    pub fn to_pg_usecs(self, raw: i64) -> i64 {
        let usecs = match self {
            Self::Seconds => raw * USECS_PER_SECOND,
            Self::Micros => raw,
            Self::Nanos => raw / NSECS_PER_USEC,
        };
        usecs + EPOCH_SHIFT_USECS
    }

    /// Inverse of [`to_pg_usecs`](Self::to_pg_usecs), for diagnostics and
    /// tests.
    #[inline]
    pub fn from_pg_usecs(self, pg: i64) -> i64 {
        let usecs = pg - EPOCH_SHIFT_USECS;
        match self {
            Self::Seconds => usecs / USECS_PER_SECOND,
            Self::Micros => usecs,
            Self::Nanos => usecs * NSECS_PER_USEC,
        }
    }
}
