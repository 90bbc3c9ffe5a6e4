//! Crash-time artifacts: process memory dumps and pipe snapshots.
//!
//! These writers run inside the fatal-signal handler, so they stick to
//! plain file writes and return errors instead of logging. Files land in
//! `dumps/`:
//!
//! - `sdb_dump_<YYYYMMDD_HHMMSS>_sig<N>_thread<TID>.dump`: text header,
//!   stack trace, then every readable memory region (raw bytes for regions
//!   under 1 MiB).
//! - `pipe_dump_<YYYYMMDD_HHMMSS>_u<unit>.bin`: one binary snapshot per
//!   registered pipe in the layout produced by
//!   [`SensorPipe::snapshot_into`].

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use sdpipe::SensorPipe;

/// Default dump directory, relative to the working directory.
pub const DUMP_DIR: &str = "dumps";

/// Regions at or above this size are listed but not dumped.
const REGION_DUMP_LIMIT: u64 = 1024 * 1024;

fn thread_id() -> i64 {
    // gettid has no portable libc wrapper on older glibc; the syscall is
    // always present on Linux.
    unsafe { libc::syscall(libc::SYS_gettid) }
}

/// Writes a process memory dump and returns its path.
pub fn write_crash_dump(dir: &Path, signum: i32, fault_addr: usize) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let now = Local::now();
    let tid = thread_id();
    let path = dir.join(format!(
        "sdb_dump_{}_sig{}_thread{}.dump",
        now.format("%Y%m%d_%H%M%S"),
        signum,
        tid
    ));
    let mut f = File::create(&path)?;

    let thread = std::thread::current();
    writeln!(f, "Memory Dump Information:")?;
    writeln!(f, "Timestamp: {}", now.format("%a %b %e %H:%M:%S %Y"))?;
    writeln!(f, "Signal: {signum}")?;
    writeln!(f, "Thread ID: {tid}")?;
    writeln!(f, "Thread Name: {}", thread.name().unwrap_or("unknown"))?;
    writeln!(f, "Fault Address: {fault_addr:#x}")?;
    writeln!(f, "Process ID: {}", std::process::id())?;
    writeln!(f)?;

    writeln!(f, "Stack Trace:")?;
    writeln!(f, "{:?}", backtrace::Backtrace::new())?;

    writeln!(f, "\nMemory Regions:")?;
    write_memory_regions(&mut f)?;

    f.sync_all()?;
    Ok(path)
}

/// Walks `/proc/self/maps` and appends every readable region; regions
/// under the size limit are followed by their raw bytes.
fn write_memory_regions(f: &mut File) -> io::Result<()> {
    let maps = match File::open("/proc/self/maps") {
        Ok(maps) => maps,
        // No maps, no region section; the header and trace still stand.
        Err(_) => return Ok(()),
    };

    for line in BufReader::new(maps).lines() {
        let line = line?;
        let Some((start, end, perms)) = parse_maps_line(&line) else {
            continue;
        };
        if !perms.contains('r') {
            continue;
        }

        write!(f, "\n--- Region: {line}\n")?;
        let len = end - start;
        if len < REGION_DUMP_LIMIT {
            // SAFETY: the region was just listed as mapped and readable.
            // A racing unmap can still fault; at crash time that only
            // truncates the dump.
            let bytes = unsafe { std::slice::from_raw_parts(start as *const u8, len as usize) };
            if f.write_all(bytes).is_err() {
                writeln!(f, "Failed to dump region")?;
            }
        } else {
            writeln!(f, "Region too large to dump")?;
        }
    }
    Ok(())
}

/// Parses `start-end perms ...` from one maps line.
fn parse_maps_line(line: &str) -> Option<(u64, u64, &str)> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;
    let (start, end) = range.split_once('-')?;
    Some((
        u64::from_str_radix(start, 16).ok()?,
        u64::from_str_radix(end, 16).ok()?,
        perms,
    ))
}

/// Snapshots every registered pipe to disk, one file per pipe.
///
/// # Safety
///
/// Reads pipe buffers without synchronization; only sound at crash time or
/// when all pipe users are quiescent (see [`SensorPipe::snapshot_into`]).
pub unsafe fn write_pipe_dumps(dir: &Path, pipes: &[(u16, Arc<SensorPipe>)]) -> Vec<PathBuf> {
    let mut written = Vec::new();
    if fs::create_dir_all(dir).is_err() {
        return written;
    }
    let ts = Local::now().format("%Y%m%d_%H%M%S").to_string();
    for (unit_id, pipe) in pipes {
        let path = dir.join(format!("pipe_dump_{ts}_u{unit_id}.bin"));
        let Ok(mut f) = File::create(&path) else {
            continue;
        };
        // SAFETY: forwarded from this function's contract.
        if unsafe { pipe.snapshot_into(&mut f) }.is_ok() && f.sync_all().is_ok() {
            written.push(path);
        }
    }
    written
}

/// A parsed pipe snapshot.
#[derive(Debug)]
pub struct PipeDump {
    pub buf_count: u64,
    pub buffer_max_fill: u64,
    pub packet_size: u64,
    pub items_per_buffer: u64,
    /// Used bytes of each buffer, in ring order.
    pub buffers: Vec<Vec<u8>>,
}

impl PipeDump {
    /// Iterates over whole packets across all buffers.
    pub fn packets(&self) -> impl Iterator<Item = &[u8]> {
        let size = self.packet_size as usize;
        self.buffers
            .iter()
            .flat_map(move |b| b.chunks_exact(size.max(1)))
    }
}

/// Reads a pipe snapshot back from disk.
pub fn read_pipe_dump(path: &Path) -> io::Result<PipeDump> {
    let mut r = BufReader::new(File::open(path)?);

    fn word(r: &mut impl Read) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    let buf_count = word(&mut r)?;
    let buffer_max_fill = word(&mut r)?;
    let packet_size = word(&mut r)?;
    let items_per_buffer = word(&mut r)?;

    let mut buffers = Vec::with_capacity(buf_count as usize);
    for _ in 0..buf_count {
        let used = word(&mut r)?;
        // Guard the allocation below against corrupt headers.
        if used > (1 << 32) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("implausible buffer fill {used}"),
            ));
        }
        let mut bytes = vec![0u8; used as usize];
        r.read_exact(&mut bytes)?;
        buffers.push(bytes);
    }

    Ok(PipeDump {
        buf_count,
        buffer_max_fill,
        packet_size,
        items_per_buffer,
        buffers,
    })
}
