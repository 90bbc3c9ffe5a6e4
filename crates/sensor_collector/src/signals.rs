//! Process-wide signal handling.
//!
//! SIGINT and SIGTERM raise the cooperative shutdown flag and nothing
//! else. Fatal signals (SIGSEGV, SIGABRT, SIGFPE, SIGILL) write a memory
//! dump, snapshot the registered pipes where data could otherwise be lost,
//! restore the default disposition and re-raise, so the process still dies
//! with the original signal. The handler itself performs only atomic
//! stores, file writes, and the re-raise.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use sdpipe::{SensorPipe, ShutdownFlag};
use tracing::warn;

use crate::dump;
use crate::CollectorError;

static SHUTDOWN: ShutdownFlag = ShutdownFlag::new();

/// Pipes whose contents are preserved on a fatal signal. Set once during
/// startup, read only by the signal handler.
static PIPES: OnceLock<Vec<(u16, Arc<SensorPipe>)>> = OnceLock::new();

/// The process-wide shutdown flag.
pub fn shutdown_flag() -> &'static ShutdownFlag {
    &SHUTDOWN
}

/// Registers the pipes to snapshot on a fatal signal. Later calls are
/// ignored.
pub fn register_pipes(pipes: Vec<(u16, Arc<SensorPipe>)>) {
    if PIPES.set(pipes).is_err() {
        warn!("pipe dump registry already set, keeping the first registration");
    }
}

const HANDLED: [Signal; 6] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGSEGV,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGILL,
];

/// Installs the signal handlers.
pub fn install() -> Result<(), CollectorError> {
    let action = SigAction::new(
        SigHandler::SigAction(handle_signal),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in HANDLED {
        // SAFETY: the handler only touches atomics, files, and re-raise.
        unsafe { signal::sigaction(sig, &action) }.map_err(|errno| {
            CollectorError::IoFatal(std::io::Error::from_raw_os_error(errno as i32))
        })?;
    }
    Ok(())
}

extern "C" fn handle_signal(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let Ok(sig) = Signal::try_from(signum) else {
        return;
    };
    match sig {
        Signal::SIGINT | Signal::SIGTERM => SHUTDOWN.request(),
        Signal::SIGSEGV | Signal::SIGABRT | Signal::SIGFPE | Signal::SIGILL => {
            let fault_addr = if info.is_null() {
                0
            } else {
                // SAFETY: the kernel passes a valid siginfo under SA_SIGINFO.
                unsafe { (*info).si_addr() as usize }
            };
            let _ = dump::write_crash_dump(Path::new(dump::DUMP_DIR), signum, fault_addr);

            // Pipe contents only matter for faults that can strand buffered
            // data mid-flight; aborts already ran their own reporting.
            if matches!(sig, Signal::SIGSEGV | Signal::SIGFPE) {
                if let Some(pipes) = PIPES.get() {
                    // SAFETY: the process is crashing; no thread will make
                    // further progress once we re-raise below.
                    let _ = unsafe { dump::write_pipe_dumps(Path::new(dump::DUMP_DIR), pipes) };
                }
            }

            // Re-raise with the default disposition so the exit status
            // reflects the original signal.
            let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
            // SAFETY: restoring the default handler has no preconditions.
            let _ = unsafe { signal::sigaction(sig, &default) };
            let _ = signal::raise(sig);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigint_requests_shutdown() {
        install().unwrap();
        assert!(!shutdown_flag().requested());
        signal::raise(Signal::SIGINT).unwrap();
        assert!(shutdown_flag().requested());
    }
}
