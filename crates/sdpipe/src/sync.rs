//! Timeout-aware blocking primitives.
//!
//! Every blocking operation in the service takes a [`Timeout`] so progress
//! toward termination is always bounded: `NoWait` is try-only, `Never`
//! disables the bound, `After` is a relative deadline. The primitives are
//! built on `parking_lot` mutexes and condvars.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Bound for a blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Try once, never block.
    NoWait,
    /// Block until the operation completes.
    Never,
    /// Block for at most this long.
    After(Duration),
}

impl Timeout {
    /// Convenience constructor for millisecond timeouts.
    #[inline]
    pub const fn ms(millis: u64) -> Self {
        Self::After(Duration::from_millis(millis))
    }

    /// Deadline for this timeout measured from now, `None` for `Never`.
    fn deadline(self) -> Option<Instant> {
        match self {
            Self::NoWait => Some(Instant::now()),
            Self::Never => None,
            Self::After(d) => Some(Instant::now() + d),
        }
    }
}

/// Counting semaphore with timed acquisition.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` tokens.
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Takes one token. Returns `false` if none became available in time.
    pub fn acquire(&self, timeout: Timeout) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            return true;
        }
        let deadline = match timeout {
            Timeout::NoWait => return false,
            other => other.deadline(),
        };
        loop {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut count, deadline).timed_out() && *count == 0 {
                        return false;
                    }
                }
                None => self.cond.wait(&mut count),
            }
            if *count > 0 {
                *count -= 1;
                return true;
            }
        }
    }

    /// Returns one token.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Returns `n` tokens at once.
    pub fn post_n(&self, n: usize) {
        let mut count = self.count.lock();
        *count += n;
        for _ in 0..n {
            self.cond.notify_one();
        }
    }

    /// Tokens currently available. Advisory: another thread may take them
    /// before the caller acts on the value.
    pub fn available(&self) -> usize {
        *self.count.lock()
    }
}

/// Process-wide cooperative cancellation flag.
///
/// Set once (typically by the signal handler), read from every worker loop.
/// SeqCst on both sides: the flag is the one cross-thread fact a signal
/// handler is allowed to publish.
#[derive(Debug, Default)]
pub struct ShutdownFlag(AtomicBool);

impl ShutdownFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Requests shutdown. Idempotent.
    #[inline]
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once shutdown has been requested.
    #[inline]
    pub fn requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Start/stop handshake state for a single auxiliary thread.
struct ControlState {
    should_stop: bool,
    has_stopped: bool,
}

/// Mutex+condvar pair coordinating one worker with its controller.
///
/// The controller calls [`signal_stop`](Self::signal_stop) and then
/// [`wait_for_stop`](Self::wait_for_stop); the worker polls
/// [`should_stop`](Self::should_stop) and calls
/// [`mark_stopped`](Self::mark_stopped) on its way out.
pub struct ThreadControl {
    state: Mutex<ControlState>,
    cond: Condvar,
}

impl Default for ThreadControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                should_stop: false,
                has_stopped: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Tells the worker to stop and wakes any waiter.
    pub fn signal_stop(&self) {
        let mut state = self.state.lock();
        state.should_stop = true;
        self.cond.notify_all();
    }

    /// Worker-side poll.
    pub fn should_stop(&self) -> bool {
        self.state.lock().should_stop
    }

    /// Worker-side: blocks until a stop is signalled or `timeout` elapses.
    /// Returns `true` when the stop was observed.
    pub fn wait_for_signal(&self, timeout: Timeout) -> bool {
        let deadline = timeout.deadline();
        let mut state = self.state.lock();
        while !state.should_stop {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return state.should_stop;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        true
    }

    /// Worker-side: records that the worker has exited.
    pub fn mark_stopped(&self) {
        let mut state = self.state.lock();
        state.has_stopped = true;
        self.cond.notify_all();
    }

    /// Controller-side: blocks until the worker has exited or `timeout`
    /// elapses. Returns `true` when the worker has stopped.
    pub fn wait_for_stop(&self, timeout: Timeout) -> bool {
        let deadline = timeout.deadline();
        let mut state = self.state.lock();
        while !state.has_stopped {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return state.has_stopped;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        true
    }
}
