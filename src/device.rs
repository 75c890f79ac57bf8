//! Block device introspection, via sysfs.

use super::errors::{self, io_errno, os_error};
use super::fileutil;
use errno;
use libc;
use std::{fs, io, path};

use std::os::unix::fs::{FileTypeExt, MetadataExt};

/// Default directory of block devices, indexed by `major:minor`.
pub const DEFAULT_DEV_BLOCK_PATH: &str = "/sys/dev/block";

/// Major and minor numbers of the block device node at `path`.
///
/// Fails with `EINVAL` if `path` is not a block device.
pub fn device_id<P: AsRef<path::Path>>(path: P) -> errors::Result<(u64, u64)> {
    let path = path.as_ref();
    let meta = fs::metadata(path)
        .map_err(|e| os_error(io_errno(&e), format!("cannot stat '{}'", path.display())))?;
    if !meta.file_type().is_block_device() {
        bail!(errors::ErrorKind::Os(
            errno::Errno(libc::EINVAL),
            format!("'{}' is not a block device", path.display())
        ));
    }
    let rdev = meta.rdev();
    Ok((major(rdev), minor(rdev)))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn major(dev: u64) -> u64 {
    ::nix::sys::stat::major(dev as libc::dev_t) as u64
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn minor(dev: u64) -> u64 {
    ::nix::sys::stat::minor(dev as libc::dev_t) as u64
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn major(dev: u64) -> u64 {
    // UNSAFE(lucab): pure arithmetic on the device number.
    unsafe { libc::major(dev as libc::dev_t) as u64 }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn minor(dev: u64) -> u64 {
    // UNSAFE(lucab): pure arithmetic on the device number.
    unsafe { libc::minor(dev as libc::dev_t) as u64 }
}

/// Path of the `unpriv_sgio` attribute for the block device at `path`.
///
/// `sysfs_dir` defaults to `DEFAULT_DEV_BLOCK_PATH`.
pub fn unpriv_sgio_path<P: AsRef<path::Path>>(
    path: P,
    sysfs_dir: Option<&path::Path>,
) -> errors::Result<path::PathBuf> {
    let (maj, min) = device_id(path)?;
    let base = sysfs_dir.unwrap_or_else(|| path::Path::new(DEFAULT_DEV_BLOCK_PATH));
    Ok(base.join(format!("{}:{}", maj, min)).join("queue").join("unpriv_sgio"))
}

/// Allow (or forbid) unprivileged SG_IO on the block device at `path`.
pub fn set_unpriv_sgio<P: AsRef<path::Path>>(
    path: P,
    sysfs_dir: Option<&path::Path>,
    enable: bool,
) -> errors::Result<()> {
    let attr = unpriv_sgio_path(path, sysfs_dir)?;
    ensure_supported(&attr)?;
    let value = if enable { "1" } else { "0" };
    fileutil::write_str(&attr, value, None)
}

/// Whether unprivileged SG_IO is allowed on the block device at `path`.
pub fn get_unpriv_sgio<P: AsRef<path::Path>>(
    path: P,
    sysfs_dir: Option<&path::Path>,
) -> errors::Result<bool> {
    let attr = unpriv_sgio_path(path, sysfs_dir)?;
    ensure_supported(&attr)?;
    let buf = fileutil::read_file_limited(&attr, 1024)?;
    let text = String::from_utf8_lossy(&buf);
    match text.trim_end_matches('\n').parse::<i32>() {
        Ok(v) => Ok(v == 1),
        Err(_) => bail!(errors::ErrorKind::Os(
            errno::Errno(libc::EINVAL),
            format!("failed to parse value of '{}'", attr.display())
        )),
    }
}

/// Older kernels do not have the attribute at all.
fn ensure_supported(attr: &path::Path) -> errors::Result<()> {
    match fs::metadata(attr) {
        Ok(_) => Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
            Err(errors::ErrorKind::Unsupported("unpriv_sgio".to_string()).into())
        }
        Err(e) => Err(os_error(io_errno(&e), format!("cannot stat '{}'", attr.display()))),
    }
}
