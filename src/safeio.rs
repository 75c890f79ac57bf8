//! Restartable I/O over file descriptors.
//!
//! These helpers transparently restart after `EINTR`, and are meant for
//! blocking descriptors (plain files and pipes). Non-blocking descriptors
//! returning `EAGAIN` should use bare `read(2)`/`write(2)` instead.

use super::errors;
use errno;
use libc;
use memmap2;
use std::convert::TryFrom;
use std::fs;
use std::io::{Seek, SeekFrom};
use std::os::unix::io::AsRawFd;

/// Size of the scratch buffer used by chunked zero-filling.
pub const ZERO_CHUNK: usize = 1024 * 1024;

/// Mechanism used by `zero_fill` to allocate a zeroed range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZeroStrategy {
    /// `fallocate(2)` with `FALLOC_FL_ZERO_RANGE` (Linux only).
    Fallocate,
    /// Extend the file, then zero a shared memory mapping of the range.
    Mmap,
    /// Seek and write zeroed chunks of `ZERO_CHUNK` bytes.
    Write,
}

#[cfg(feature = "zero-write")]
const BUILD_STRATEGY: ZeroStrategy = ZeroStrategy::Write;
#[cfg(all(
    not(feature = "zero-write"),
    any(feature = "zero-mmap", not(target_os = "linux"))
))]
const BUILD_STRATEGY: ZeroStrategy = ZeroStrategy::Mmap;
#[cfg(all(
    not(feature = "zero-write"),
    not(feature = "zero-mmap"),
    target_os = "linux"
))]
const BUILD_STRATEGY: ZeroStrategy = ZeroStrategy::Fallocate;

impl ZeroStrategy {
    /// Strategy selected at build time.
    pub fn build_default() -> Self {
        BUILD_STRATEGY
    }
}

/// Like `read(2)`, but restarts after `EINTR` and keeps reading
/// until `buf` is full.
///
/// A count shorter than `buf.len()` means end-of-input was reached.
pub fn read_all<F: AsRawFd>(fd: &F, buf: &mut [u8]) -> errors::Result<usize> {
    let mut nread = 0;
    while nread < buf.len() {
        let rest = &mut buf[nread..];
        // UNSAFE(lucab): `rest` is a valid writable buffer of `rest.len()` bytes.
        let r = unsafe {
            libc::read(
                fd.as_raw_fd(),
                rest.as_mut_ptr() as *mut libc::c_void,
                rest.len(),
            )
        };
        if r < 0 {
            let eno = errno::errno();
            if eno.0 == libc::EINTR {
                continue;
            }
            return Err(errors::ErrorKind::Sys(eno).into());
        }
        if r == 0 {
            break;
        }
        nread += r as usize;
    }
    Ok(nread)
}

/// Like `write(2)`, but restarts after `EINTR` and keeps writing
/// until the whole of `buf` has been consumed.
pub fn write_all<F: AsRawFd>(fd: &F, buf: &[u8]) -> errors::Result<usize> {
    let mut nwritten = 0;
    while nwritten < buf.len() {
        let rest = &buf[nwritten..];
        // UNSAFE(lucab): `rest` is a valid readable buffer of `rest.len()` bytes.
        let r = unsafe {
            libc::write(
                fd.as_raw_fd(),
                rest.as_ptr() as *const libc::c_void,
                rest.len(),
            )
        };
        if r < 0 {
            let eno = errno::errno();
            if eno.0 == libc::EINTR {
                continue;
            }
            return Err(errors::ErrorKind::Sys(eno).into());
        }
        if r == 0 {
            break;
        }
        nwritten += r as usize;
    }
    Ok(nwritten)
}

/// Ensure that bytes in `[offset, offset+len)` read back as zero,
/// using the strategy selected at build time.
///
/// The file may grow to cover the range, and its offset is not
/// preserved.
pub fn zero_fill(fp: &fs::File, offset: u64, len: u64) -> errors::Result<()> {
    zero_fill_with(ZeroStrategy::build_default(), fp, offset, len)
}

/// Like `zero_fill`, with an explicit strategy.
pub fn zero_fill_with(
    strategy: ZeroStrategy,
    fp: &fs::File,
    offset: u64,
    len: u64,
) -> errors::Result<()> {
    if len == 0 {
        return Ok(());
    }
    if offset.checked_add(len).is_none() {
        return Err(errors::ErrorKind::Sys(errno::Errno(libc::EOVERFLOW)).into());
    }
    match strategy {
        ZeroStrategy::Fallocate => zero_fallocate(fp, offset, len),
        ZeroStrategy::Mmap => zero_mmap(fp, offset, len),
        ZeroStrategy::Write => zero_write(fp, offset, len),
    }
}

#[cfg(target_os = "linux")]
fn zero_fallocate(fp: &fs::File, offset: u64, len: u64) -> errors::Result<()> {
    let overflow = || errors::Error::from_kind(errors::ErrorKind::Sys(errno::Errno(libc::EOVERFLOW)));
    let off = libc::off_t::try_from(offset).map_err(|_| overflow())?;
    let size = libc::off_t::try_from(len).map_err(|_| overflow())?;

    // UNSAFE(lucab): plain syscall on a descriptor owned by `fp`.
    let r = unsafe { libc::fallocate(fp.as_raw_fd(), libc::FALLOC_FL_ZERO_RANGE, off, size) };
    if r == 0 {
        return Ok(());
    }

    let eno = errno::errno();
    match eno.0 {
        // Filesystem (e.g. tmpfs) does not know about zero-range.
        libc::EOPNOTSUPP | libc::ENOSYS => {
            debug!("zero-range fallocate unsupported ({}), writing zeroes", eno);
            zero_write(fp, offset, len)
        }
        _ => Err(errors::ErrorKind::Sys(eno).into()),
    }
}

#[cfg(not(target_os = "linux"))]
fn zero_fallocate(_fp: &fs::File, _offset: u64, _len: u64) -> errors::Result<()> {
    Err(errors::ErrorKind::Unsupported("fallocate zero-range".to_string()).into())
}

fn zero_mmap(fp: &fs::File, offset: u64, len: u64) -> errors::Result<()> {
    let maplen = usize::try_from(len)
        .map_err(|_| errors::Error::from_kind(errors::ErrorKind::Sys(errno::Errno(libc::EOVERFLOW))))?;

    // The mapped range must be backed by the file, grow it if needed.
    let end = offset + len;
    if fp.metadata()?.len() < end {
        fp.set_len(end)?;
    }

    // UNSAFE(lucab): mapping does not outlive this call; concurrent
    // truncation of the file is not supported.
    let mut map = unsafe {
        memmap2::MmapOptions::new()
            .offset(offset)
            .len(maplen)
            .map_mut(fp)?
    };
    for b in map.iter_mut() {
        *b = 0;
    }
    map.flush()?;
    Ok(())
}

fn zero_write(mut fp: &fs::File, offset: u64, len: u64) -> errors::Result<()> {
    fp.seek(SeekFrom::Start(offset))?;

    // Split up the write in small chunks, so as not to allocate lots of RAM.
    let chunk = vec![0u8; ZERO_CHUNK];
    let mut remain = len;
    while remain > 0 {
        let n = if remain < ZERO_CHUNK as u64 {
            remain as usize
        } else {
            ZERO_CHUNK
        };
        let written = write_all(fp, &chunk[..n])?;
        if written != n {
            return Err(errors::ErrorKind::Sys(errno::Errno(libc::EIO)).into());
        }
        remain -= n as u64;
    }
    Ok(())
}
