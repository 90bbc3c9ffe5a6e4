//! The sensor-data pipe: a bounded ring of fixed-capacity arena buffers
//! connecting one protocol-parsing writer to one database-loading reader.
//!
//! # Handoff protocol
//!
//! The pipe owns `N >= 2` buffers. The writer always owns
//! `buffers[write_index]` and appends packets to it; when the buffer reaches
//! its fill limit the writer *rotates*: it takes a write token, advances
//! `write_index`, and posts a read token. The reader takes a read token,
//! claims `buffers[read_index]`, and advances `read_index`. Tokens live in a
//! pair of counting semaphores:
//!
//! - `write_sem` starts at `N - 1`: the writer can run up to `N - 1`
//!   rotations ahead before blocking. Bounded capacity is the only
//!   admission control.
//! - `read_sem` starts at 0 and counts completed buffers.
//! - At rest (no read guard live) `write_sem + read_sem == N - 1`.
//!
//! The write token for a consumed buffer is posted when the [`ReadGuard`]
//! drops, which is the point where the reader has actually released the
//! memory. Posting any earlier would let a writer that performs `N - 1`
//! rotations while the reader is mid-buffer reclaim the buffer under it.
//!
//! # Memory ordering
//!
//! Buffer bytes are written between token operations, so the semaphores'
//! lock edges already order them; `write_index`/`read_index` additionally
//! use Release stores and Acquire loads so a published index is never
//! observed ahead of the buffer contents it refers to. Each index has
//! exactly one writing thread. The per-buffer arenas are reached through
//! `UnsafeCell`; exclusive access is guaranteed by token ownership, not by
//! the type system, and every access site records which token justifies it.

use std::cell::UnsafeCell;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::invariants::{
    debug_assert_fill_bounded, debug_assert_full_count_bounded, debug_assert_index_in_ring,
    debug_assert_packet_aligned,
};
use crate::sync::{Semaphore, Timeout};
use crate::{Arena, PipeError};

/// Condvar-backed readiness pulse shared by all pipes of one data handler.
///
/// The consumer blocks on a single `ReadyEvent` instead of one wait per
/// pipe; every buffer rotation on any attached pipe bumps the generation
/// counter and wakes it. The portable replacement for waiting on a set of
/// event file descriptors.
pub struct ReadyEvent {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Default for ReadyEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyEvent {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Signals that a buffer became readable somewhere.
    pub fn pulse(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.cond.notify_all();
    }

    /// Waits until the generation advances past `*seen` or `timeout`
    /// elapses. Updates `*seen` and returns `true` on advancement.
    pub fn wait(&self, seen: &mut u64, timeout: Timeout) -> bool {
        let mut generation = self.generation.lock();
        if *generation != *seen {
            *seen = *generation;
            return true;
        }
        let deadline = match timeout {
            Timeout::NoWait => return false,
            Timeout::Never => None,
            Timeout::After(d) => Some(Instant::now() + d),
        };
        while *generation == *seen {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut generation, deadline).timed_out()
                        && *generation == *seen
                    {
                        return false;
                    }
                }
                None => self.cond.wait(&mut generation),
            }
        }
        *seen = *generation;
        true
    }
}

struct PipeShared {
    /// Per-buffer bump arenas. Exclusive access is governed by the token
    /// protocol documented at module level.
    bufs: Box<[UnsafeCell<Arena>]>,
    write_idx: CachePadded<AtomicUsize>,
    read_idx: CachePadded<AtomicUsize>,
    /// Buffers currently completed and not yet claimed by the reader.
    full_count: CachePadded<AtomicUsize>,
    write_sem: Semaphore,
    read_sem: Semaphore,
    ready: Option<Arc<ReadyEvent>>,
    split: AtomicBool,

    buf_count: usize,
    buf_size: usize,
    // Derived per-sensor fields, set once by bind_schema.
    packet_size: AtomicUsize,
    items_per_buffer: AtomicUsize,
    buffer_max_fill: AtomicUsize,
}

// SAFETY: the UnsafeCell<Arena> slots are only ever accessed by the single
// thread that holds the corresponding token (writer: current write buffer;
// reader: buffer claimed by a live ReadGuard; crash dumps: documented
// unsynchronized access). All other fields are atomics or internally
// synchronized.
unsafe impl Sync for PipeShared {}

impl PipeShared {
    fn advance_write(&self) {
        let cur = self.write_idx.load(Ordering::Relaxed);
        let next = (cur + 1) % self.buf_count;
        debug_assert_index_in_ring!(next, self.buf_count);

        // SAFETY: the caller consumed a write token, so the reader has
        // released `next` (its token is only posted on guard drop) and it is
        // not in the full queue. This thread is the only writer.
        let buf = unsafe { &mut *self.bufs[next].get() };
        buf.clear();

        let full = self.full_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert_full_count_bounded!(full, self.buf_count);

        self.write_idx.store(next, Ordering::Release);
        self.read_sem.post();
        if let Some(ready) = &self.ready {
            ready.pulse();
        }
    }

    #[inline]
    fn fill_limit(&self) -> usize {
        let max_fill = self.buffer_max_fill.load(Ordering::Acquire);
        if max_fill == 0 {
            self.buf_size
        } else {
            max_fill
        }
    }
}

/// Bounded multi-buffer pipe between one writer and one reader.
pub struct SensorPipe {
    shared: Arc<PipeShared>,
}

impl std::fmt::Debug for SensorPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorPipe").finish_non_exhaustive()
    }
}

impl SensorPipe {
    /// Creates a pipe with `buf_count` buffers of `buf_size` bytes each.
    pub fn new(buf_count: usize, buf_size: usize) -> Result<Self, PipeError> {
        Self::build(buf_count, buf_size, None)
    }

    /// Like [`new`](Self::new), additionally pulsing `ready` on every
    /// rotation so one consumer can multiplex several pipes.
    pub fn with_ready(
        buf_count: usize,
        buf_size: usize,
        ready: Arc<ReadyEvent>,
    ) -> Result<Self, PipeError> {
        Self::build(buf_count, buf_size, Some(ready))
    }

    fn build(
        buf_count: usize,
        buf_size: usize,
        ready: Option<Arc<ReadyEvent>>,
    ) -> Result<Self, PipeError> {
        if buf_count < 2 {
            return Err(PipeError::TooFewBuffers(buf_count));
        }
        let bufs = (0..buf_count)
            .map(|_| UnsafeCell::new(Arena::new(buf_size)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            shared: Arc::new(PipeShared {
                bufs,
                write_idx: CachePadded::new(AtomicUsize::new(0)),
                read_idx: CachePadded::new(AtomicUsize::new(0)),
                full_count: CachePadded::new(AtomicUsize::new(0)),
                write_sem: Semaphore::new(buf_count - 1),
                read_sem: Semaphore::new(0),
                ready,
                split: AtomicBool::new(false),
                buf_count,
                buf_size,
                packet_size: AtomicUsize::new(0),
                items_per_buffer: AtomicUsize::new(0),
                buffer_max_fill: AtomicUsize::new(0),
            }),
        })
    }

    /// Binds the encoded row size once schema discovery has run, deriving
    /// `items_per_buffer` and the buffer fill limit.
    pub fn bind_schema(&self, packet_size: usize) -> Result<(), PipeError> {
        let items = if packet_size == 0 {
            0
        } else {
            self.shared.buf_size / packet_size
        };
        if items == 0 {
            return Err(PipeError::BadPacketSize {
                packet: packet_size,
                capacity: self.shared.buf_size,
            });
        }
        self.shared.packet_size.store(packet_size, Ordering::Release);
        self.shared.items_per_buffer.store(items, Ordering::Release);
        self.shared
            .buffer_max_fill
            .store(items * packet_size, Ordering::Release);
        Ok(())
    }

    /// Takes the unique writer/reader pair. Fails on the second call.
    pub fn split(&self) -> Result<(PipeWriter, PipeReader), PipeError> {
        if self.shared.split.swap(true, Ordering::AcqRel) {
            return Err(PipeError::AlreadySplit);
        }
        Ok((
            PipeWriter {
                shared: self.shared.clone(),
            },
            PipeReader {
                shared: self.shared.clone(),
            },
        ))
    }

    #[inline]
    pub fn buf_count(&self) -> usize {
        self.shared.buf_count
    }

    #[inline]
    pub fn buf_size(&self) -> usize {
        self.shared.buf_size
    }

    #[inline]
    pub fn packet_size(&self) -> usize {
        self.shared.packet_size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn items_per_buffer(&self) -> usize {
        self.shared.items_per_buffer.load(Ordering::Acquire)
    }

    #[inline]
    pub fn buffer_max_fill(&self) -> usize {
        self.shared.buffer_max_fill.load(Ordering::Acquire)
    }

    /// Buffers completed by the writer and not yet claimed by the reader.
    #[inline]
    pub fn full_count(&self) -> usize {
        self.shared.full_count.load(Ordering::Acquire)
    }

    /// Advisory token counts, exposed for invariant checks in tests.
    pub fn write_tokens(&self) -> usize {
        self.shared.write_sem.available()
    }

    pub fn read_tokens(&self) -> usize {
        self.shared.read_sem.available()
    }

    /// Writes the pipe's state in the on-disk snapshot layout: a header of
    /// four little-endian `u64`s (`buf_count`, `buffer_max_fill`,
    /// `packet_size`, `items_per_buffer`), then per buffer `used: u64`
    /// followed by `used` raw bytes.
    ///
    /// # Safety
    ///
    /// Reads every buffer without taking tokens. Only sound when no other
    /// thread is running (crash-time best effort from a fatal-signal
    /// handler); bytes from the writer's current buffer may be torn.
    pub unsafe fn snapshot_into(&self, w: &mut dyn Write) -> io::Result<()> {
        let s = &self.shared;
        for word in [
            s.buf_count as u64,
            s.buffer_max_fill.load(Ordering::Acquire) as u64,
            s.packet_size.load(Ordering::Acquire) as u64,
            s.items_per_buffer.load(Ordering::Acquire) as u64,
        ] {
            w.write_all(&word.to_le_bytes())?;
        }
        for cell in &s.bufs {
            // SAFETY: per the function contract, no other thread is mutating
            // the buffers while we read them.
            let arena = unsafe { &*cell.get() };
            w.write_all(&(arena.pos() as u64).to_le_bytes())?;
            w.write_all(arena.used_bytes())?;
        }
        Ok(())
    }
}

/// Writer endpoint. Owns `buffers[write_index]` between rotations.
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl PipeWriter {
    #[inline]
    fn cur(&self) -> &Arena {
        let idx = self.shared.write_idx.load(Ordering::Relaxed);
        // SAFETY: the writer owns buffers[write_idx] by protocol; only this
        // thread advances write_idx.
        unsafe { &*self.shared.bufs[idx].get() }
    }

    #[inline]
    fn cur_mut(&mut self) -> &mut Arena {
        let idx = self.shared.write_idx.load(Ordering::Relaxed);
        // SAFETY: as in `cur`, plus &mut self excludes aliased writer access.
        unsafe { &mut *self.shared.bufs[idx].get() }
    }

    /// Bytes already written to the current buffer.
    #[inline]
    pub fn used(&self) -> usize {
        self.cur().pos()
    }

    /// Bound packet size, 0 before `bind_schema`.
    #[inline]
    pub fn packet_size(&self) -> usize {
        self.shared.packet_size.load(Ordering::Acquire)
    }

    /// Returns `true` when the current buffer has reached its fill limit.
    #[inline]
    pub fn at_fill_limit(&self) -> bool {
        self.used() >= self.shared.fill_limit()
    }

    /// Appends raw bytes to the current buffer without rotating.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), PipeError> {
        let limit = self.shared.fill_limit();
        let used = self.used();
        if used + bytes.len() > limit {
            return Err(PipeError::BufferOverrun {
                need: bytes.len(),
                free: limit - used,
            });
        }
        let dst = self
            .cur_mut()
            .push(bytes.len())
            .ok_or(PipeError::BufferOverrun {
                need: bytes.len(),
                free: limit - used,
            })?;
        dst.copy_from_slice(bytes);
        debug_assert_fill_bounded!(self.used(), self.shared.fill_limit());
        Ok(())
    }

    /// Hands the current buffer to the reader and claims the next one.
    ///
    /// Blocks up to `timeout` for a write token; a timeout leaves all state
    /// untouched.
    pub fn rotate(&mut self, timeout: Timeout) -> Result<(), PipeError> {
        if !self.shared.write_sem.acquire(timeout) {
            return Err(PipeError::TimedOut);
        }
        self.shared.advance_write();
        Ok(())
    }

    /// Appends one packet, rotating first when the current buffer is at its
    /// fill limit. The schema must be bound so packets and fill limit
    /// agree.
    pub fn push_packet(&mut self, packet: &[u8], timeout: Timeout) -> Result<(), PipeError> {
        if self.packet_size() == 0 {
            return Err(PipeError::SchemaNotBound);
        }
        if self.at_fill_limit() {
            self.rotate(timeout)?;
        }
        self.append(packet)
    }

    /// Hands off a partially filled buffer (shutdown or end-of-stream).
    ///
    /// Returns `Ok(false)` when the buffer was empty. On `TimedOut` the
    /// partial buffer stays with the writer; the caller decides whether
    /// losing it is acceptable.
    pub fn flush(&mut self, timeout: Timeout) -> Result<bool, PipeError> {
        if self.used() == 0 {
            return Ok(false);
        }
        debug_assert_packet_aligned!(self.used(), self.shared.packet_size.load(Ordering::Acquire));
        if !self.shared.write_sem.acquire(timeout) {
            return Err(PipeError::TimedOut);
        }
        self.shared.advance_write();
        Ok(true)
    }
}

/// Reader endpoint.
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl PipeReader {
    /// Claims the oldest completed buffer.
    ///
    /// The returned guard exposes the buffer's bytes; dropping it returns
    /// the buffer to the writer's free pool. Buffers arrive in rotation
    /// order.
    pub fn acquire(&mut self, timeout: Timeout) -> Result<ReadGuard<'_>, PipeError> {
        if !self.shared.read_sem.acquire(timeout) {
            return Err(PipeError::TimedOut);
        }
        let idx = self.shared.read_idx.load(Ordering::Acquire);
        debug_assert_index_in_ring!(idx, self.shared.buf_count);
        self.shared
            .read_idx
            .store((idx + 1) % self.shared.buf_count, Ordering::Release);
        self.shared.full_count.fetch_sub(1, Ordering::AcqRel);

        let guard = ReadGuard {
            shared: &self.shared,
            idx,
        };
        debug_assert_packet_aligned!(
            guard.len(),
            self.shared.packet_size.load(Ordering::Acquire)
        );
        debug_assert_fill_bounded!(guard.len(), self.shared.fill_limit());
        Ok(guard)
    }
}

/// Exclusive view of one completed buffer.
///
/// Dropping the guard posts the write token, i.e. releases the buffer back
/// to the writer.
pub struct ReadGuard<'a> {
    shared: &'a PipeShared,
    idx: usize,
}

impl ReadGuard<'_> {
    #[inline]
    fn arena(&self) -> &Arena {
        // SAFETY: this guard holds the read token for buffers[idx]; the
        // writer cannot claim it until the token is posted in Drop.
        unsafe { &*self.shared.bufs[self.idx].get() }
    }

    /// Number of payload bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.arena().pos()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whole packets in the buffer. Requires a bound schema.
    pub fn packet_count(&self) -> usize {
        let packet_size = self.shared.packet_size.load(Ordering::Acquire);
        if packet_size == 0 {
            0
        } else {
            self.len() / packet_size
        }
    }
}

impl std::ops::Deref for ReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.arena().used_bytes()
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.shared.write_sem.post();
    }
}
