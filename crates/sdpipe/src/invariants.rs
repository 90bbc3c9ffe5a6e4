//! Debug assertion macros for pipe invariants.
//!
//! Active only in debug builds, zero overhead in release. Each macro states
//! one protocol invariant of the multi-buffer pipe.

/// A buffer's fill level never exceeds the schema-derived fill limit.
macro_rules! debug_assert_fill_bounded {
    ($used:expr, $max_fill:expr) => {
        debug_assert!(
            $max_fill == 0 || $used <= $max_fill,
            "buffer fill {} exceeds limit {}",
            $used,
            $max_fill
        )
    };
}

/// A buffer handed to the reader holds a whole number of packets.
macro_rules! debug_assert_packet_aligned {
    ($used:expr, $packet_size:expr) => {
        debug_assert!(
            $packet_size == 0 || $used % $packet_size == 0,
            "buffer fill {} is not a multiple of packet size {}",
            $used,
            $packet_size
        )
    };
}

/// Buffer indices stay within the ring.
macro_rules! debug_assert_index_in_ring {
    ($idx:expr, $buf_count:expr) => {
        debug_assert!(
            $idx < $buf_count,
            "buffer index {} outside ring of {} buffers",
            $idx,
            $buf_count
        )
    };
}

/// The reader never holds more full buffers than exist.
macro_rules! debug_assert_full_count_bounded {
    ($full:expr, $buf_count:expr) => {
        debug_assert!(
            $full < $buf_count,
            "full count {} not below buffer count {}",
            $full,
            $buf_count
        )
    };
}

pub(crate) use debug_assert_fill_bounded;
pub(crate) use debug_assert_full_count_bounded;
pub(crate) use debug_assert_index_in_ring;
pub(crate) use debug_assert_packet_aligned;
