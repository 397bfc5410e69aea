//! Process memory-map enumeration.
//!
//! The reader is a pure function: every call re-reads the OS-exposed table
//! and returns a fresh `Vec<MemoryMap>`. Nothing is cached process-wide.
//!
//! On `/proc`-style systems one line is parsed per region:
//!
//! ```text
//! 00400000-0063c000 r-xp 00000000 fe:01 675628    /usr/bin/vim
//! ```
//!
//! Failures (missing `/proc`, permission denied, unsupported platform) are
//! reported as an empty list and logged at debug level; enumeration never
//! panics and never returns an error to the caller.

use remora_types::{MemoryMap, Permission, Range, Word};
use tracing::debug;

/// Enumerate the mapped regions of the current process.
pub fn current_process_maps(full_path: bool) -> Vec<MemoryMap> {
    // SAFETY: getpid has no preconditions.
    let pid = unsafe { libc::getpid() } as u32;
    process_maps(pid, full_path)
}

/// Enumerate the mapped regions of an arbitrary process.
///
/// With `full_path` the backing file is reported as its complete path,
/// otherwise as its basename.
pub fn process_maps(pid: u32, full_path: bool) -> Vec<MemoryMap> {
    #[cfg(target_os = "linux")]
    {
        let path = format!("/proc/{pid}/maps");
        debug!(path = %path, "querying memory maps");
        match std::fs::read_to_string(&path) {
            Ok(contents) => parse_maps(&contents, full_path),
            Err(err) => {
                debug!(path = %path, %err, "cannot read maps file");
                Vec::new()
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (pid, full_path);
        debug!("memory-map enumeration is not supported on this platform");
        Vec::new()
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_maps(contents: &str, full_path: bool) -> Vec<MemoryMap> {
    contents
        .lines()
        .filter_map(|line| parse_line(line, full_path))
        .collect()
}

/// Parse one maps line. Returns `None` for malformed lines, which are
/// skipped rather than aborting the whole enumeration.
fn parse_line(line: &str, full_path: bool) -> Option<MemoryMap> {
    let mut fields = line.splitn(6, char::is_whitespace);

    let range_field = fields.next()?;
    let (start, end) = range_field.split_once('-')?;
    let start = Word::from_str_radix(start, 16).ok()?;
    let end = Word::from_str_radix(end, 16).ok()?;
    if start >= end {
        return None;
    }

    let perms = fields.next()?.as_bytes();
    if perms.len() < 4 {
        return None;
    }
    let mut permission = Permission::empty();
    if perms[0] == b'r' {
        permission |= Permission::READ;
    }
    if perms[1] == b'w' {
        permission |= Permission::WRITE;
    }
    if perms[2] == b'x' {
        permission |= Permission::EXEC;
    }

    // Offset, device and inode are not part of the MemoryMap model.
    let _offset = fields.next()?;
    let _device = fields.next()?;
    let _inode = fields.next()?;

    let path = fields.next().map(str::trim).unwrap_or("");
    let name = if full_path {
        path.to_owned()
    } else {
        path.rsplit('/').next().unwrap_or("").to_owned()
    };

    Some(MemoryMap::new(Range::new(start, end), permission, name))
}
