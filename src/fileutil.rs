//! Whole-file read/write helpers and path utilities.

use super::errors::{self, context, io_errno, os_error};
use super::safeio;
use errno;
use libc;
use nix::unistd::{access, AccessFlags};
use std::{env, fs, io, path};

use std::io::BufRead;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::IntoRawFd;

/// Read the whole content of `path`, which must not exceed `max_len` bytes.
///
/// Longer files fail with `EOVERFLOW`; a zero `max_len` fails with `EINVAL`.
pub fn read_file_limited<P: AsRef<path::Path>>(path: P, max_len: usize) -> errors::Result<Vec<u8>> {
    let path = path.as_ref();
    let fp = fs::File::open(path)
        .map_err(|e| os_error(io_errno(&e), format!("failed to open file '{}'", path.display())))?;
    read_limited(&fp, max_len).map_err(|e| context(e, format!("failed to read file '{}'", path.display())))
}

/// Read everything left in `fp`, which must not exceed `max_len` bytes.
///
/// Longer content fails with `EOVERFLOW`; a zero `max_len` fails with `EINVAL`.
pub fn read_limited(fp: &fs::File, max_len: usize) -> errors::Result<Vec<u8>> {
    if max_len == 0 {
        return Err(errors::ErrorKind::Sys(errno::Errno(libc::EINVAL)).into());
    }

    // Read one byte past the limit, to detect oversized content.
    let limit = max_len.saturating_add(1);
    let mut content = Vec::with_capacity(max_len.min(4096));
    let mut chunk = [0u8; 4096];
    while content.len() < limit {
        let want = chunk.len().min(limit - content.len());
        let n = safeio::read_all(fp, &mut chunk[..want])?;
        content.extend_from_slice(&chunk[..n]);
        if n < want {
            break;
        }
    }

    if content.len() > max_len {
        return Err(errors::ErrorKind::Sys(errno::Errno(libc::EOVERFLOW)).into());
    }
    Ok(content)
}

/// Truncate `path` and write `data` to it.
///
/// With `mode` set to `None` the file must already exist (e.g. sysfs
/// control files), otherwise it is created with the given permissions.
pub fn write_str<P: AsRef<path::Path>>(path: P, data: &str, mode: Option<u32>) -> errors::Result<()> {
    let path = path.as_ref();
    let mut opts = fs::OpenOptions::new();
    opts.write(true).truncate(true);
    if let Some(m) = mode {
        opts.create(true).mode(m);
    }
    let fp = opts
        .open(path)
        .map_err(|e| os_error(io_errno(&e), format!("failed to open '{}' for writing", path.display())))?;

    if let Err(e) = safeio::write_all(&fp, data.as_bytes()) {
        return Err(context(e, format!("failed to write '{}'", path.display())));
    }

    // Errors from close are reported only if the write went fine.
    let fd = fp.into_raw_fd();
    // UNSAFE(lucab): ownership of `fd` was released above.
    if unsafe { libc::close(fd) } != 0 {
        return Err(errors::last_os_error(format!("failed to close '{}'", path.display())));
    }
    Ok(())
}

/// Whether `path` exists, as `access(F_OK)`.
pub fn file_exists<P: AsRef<path::Path>>(path: P) -> bool {
    access(path.as_ref(), AccessFlags::F_OK).is_ok()
}

/// Whether `path` exists and is a directory.
pub fn is_dir<P: AsRef<path::Path>>(path: P) -> bool {
    fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

/// Check that `path` is a regular file with at least one executable bit.
///
/// Fails with `EISDIR` for directories and `EACCES` for anything else.
/// ACLs are not taken into account.
pub fn ensure_executable<P: AsRef<path::Path>>(path: P) -> errors::Result<()> {
    let path = path.as_ref();
    let meta = fs::metadata(path)
        .map_err(|e| os_error(io_errno(&e), format!("cannot stat '{}'", path.display())))?;
    if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
        return Ok(());
    }
    let eno = if meta.is_dir() { libc::EISDIR } else { libc::EACCES };
    Err(os_error(
        errno::Errno(eno),
        format!("'{}' is not executable", path.display()),
    ))
}

/// Create `path` and all its missing parents, with mode 0777.
pub fn make_path<P: AsRef<path::Path>>(path: P) -> errors::Result<()> {
    make_path_with_mode(path, 0o777)
}

/// Create `path` and all its missing parents, with the given mode.
///
/// An existing non-directory component fails with `ENOTDIR`.
pub fn make_path_with_mode<P: AsRef<path::Path>>(path: P, mode: u32) -> errors::Result<()> {
    let path = path.as_ref();
    debug!("path={} mode=0{:o}", path.display(), mode);
    make_path_helper(path, mode)
        .map_err(|eno| os_error(eno, format!("cannot create directory '{}'", path.display())))
}

fn make_path_helper(path: &path::Path, mode: u32) -> Result<(), errno::Errno> {
    match fs::metadata(path) {
        Ok(ref m) if m.is_dir() => return Ok(()),
        Ok(_) => return Err(errno::Errno(libc::ENOTDIR)),
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(ref e) => return Err(io_errno(e)),
    }

    match path.parent() {
        // A bare relative name, with no directory part.
        Some(p) if p.as_os_str().is_empty() => return Err(errno::Errno(libc::EINVAL)),
        Some(p) => make_path_helper(p, mode)?,
        None => {}
    }

    match fs::DirBuilder::new().mode(mode).create(path) {
        Ok(()) => Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(ref e) => Err(io_errno(e)),
    }
}

/// Whether `path` is a symbolic link.
pub fn is_link<P: AsRef<path::Path>>(path: P) -> errors::Result<bool> {
    let path = path.as_ref();
    let meta = fs::symlink_metadata(path)
        .map_err(|e| os_error(io_errno(&e), format!("cannot stat '{}'", path.display())))?;
    Ok(meta.file_type().is_symlink())
}

/// Whether `link` and `dest` refer to the same file.
pub fn link_points_to<P: AsRef<path::Path>, Q: AsRef<path::Path>>(link: P, dest: Q) -> bool {
    match (fs::metadata(link), fs::metadata(dest)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

/// Resolve `path` to an absolute path whose last component is not a link.
///
/// Absolute paths which are not links themselves are returned unchanged,
/// intermediate components are not canonicalized.
pub fn resolve_link<P: AsRef<path::Path>>(path: P) -> errors::Result<path::PathBuf> {
    let path = path.as_ref();
    if path.is_absolute() && !is_link(path)? {
        return Ok(path.to_path_buf());
    }
    resolve_all_links(path)
}

/// Resolve `path` to an absolute path without any link component.
pub fn resolve_all_links<P: AsRef<path::Path>>(path: P) -> errors::Result<path::PathBuf> {
    let path = path.as_ref();
    fs::canonicalize(path)
        .map_err(|e| os_error(io_errno(&e), format!("cannot resolve '{}'", path.display())))
}

/// Path of `name` (plus an optional extension suffix) inside `dir`.
pub fn build_path<P: AsRef<path::Path>>(dir: P, name: &str, ext: Option<&str>) -> path::PathBuf {
    let mut file = name.to_string();
    if let Some(ext) = ext {
        file.push_str(ext);
    }
    dir.as_ref().join(file)
}

/// Absolute version of `path`, relative to the current directory.
pub fn abs_path<P: AsRef<path::Path>>(path: P) -> errors::Result<path::PathBuf> {
    let path = path.as_ref();
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir()
        .map_err(|e| os_error(io_errno(&e), "cannot get current directory"))?;
    Ok(cwd.join(path))
}

/// Remove redundant slashes from `path`.
///
/// A leading `//` is kept, as POSIX allows it to be special, but three or
/// more leading slashes collapse to one. Trailing slashes are dropped.
pub fn sanitize_path(path: &str) -> String {
    let mut clean = String::with_capacity(path.len());
    let mut rest = path;
    if path.starts_with("//") && !path.starts_with("///") {
        clean.push_str("//");
        rest = &path[2..];
    }

    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '/' {
            clean.push(c);
            continue;
        }
        while chars.peek() == Some(&'/') {
            chars.next();
        }
        if !clean.is_empty() && chars.peek().is_none() {
            break;
        }
        clean.push('/');
    }
    clean
}

/// Default location of the mount table.
pub const DEFAULT_MOUNTS_PATH: &str = "/proc/mounts";

/// Mount point of the first filesystem of type `fs_type`.
///
/// Fails with `ENOENT` if there is none.
#[cfg(target_os = "linux")]
pub fn find_mount_point(fs_type: &str) -> errors::Result<path::PathBuf> {
    let fp = fs::File::open(DEFAULT_MOUNTS_PATH).map_err(|e| {
        os_error(io_errno(&e), format!("failed to open '{}'", DEFAULT_MOUNTS_PATH))
    })?;
    find_mount_point_in(fp, fs_type)
}

/// Mount point of the first filesystem of type `fs_type`.
#[cfg(not(target_os = "linux"))]
pub fn find_mount_point(_fs_type: &str) -> errors::Result<path::PathBuf> {
    Err(errors::ErrorKind::Unsupported("mount table lookup".to_string()).into())
}

/// Like `find_mount_point`, reading the mount table from `mounts`.
pub fn find_mount_point_in(mounts: fs::File, fs_type: &str) -> errors::Result<path::PathBuf> {
    let bufrd = io::BufReader::new(mounts);
    for line in bufrd.lines() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let (dir, kind) = match (fields.nth(1), fields.next()) {
            (Some(d), Some(k)) => (d, k),
            _ => continue,
        };
        if kind == fs_type {
            return Ok(path::PathBuf::from(unescape_mount_field(dir)));
        }
    }
    Err(os_error(
        errno::Errno(libc::ENOENT),
        format!("no mount point for filesystem type '{}'", fs_type),
    ))
}

/// Decode the octal escapes (e.g. `\040` for space) of a mount table field.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes
            .get(i + 1..i + 4)
            .map_or(false, |d| d.iter().all(|b| (b'0'..=b'7').contains(b)));
        if bytes[i] == b'\\' && octal {
            let code = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(code as u8);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
