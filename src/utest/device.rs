use super::super::device;
use libc;
use std::{fs, path};
use tempfile;

use std::io::Write;
use std::os::unix::fs::FileTypeExt;

/// First block device node found under `/dev`, if any.
fn some_block_device() -> Option<path::PathBuf> {
    let found = fs::read_dir("/dev").ok()?.filter_map(|e| e.ok()).find(|e| {
        e.file_type().map(|t| t.is_block_device()).unwrap_or(false)
    });
    if found.is_none() {
        let out = ::std::io::stdout();
        writeln!(out.lock(), "No block device, skipping.").ok();
    }
    found.map(|e| e.path())
}

#[test]
fn test_device_id_not_block() {
    let fp = tempfile::NamedTempFile::new().unwrap();
    let e = device::device_id(fp.path()).unwrap_err();
    assert_eq!(e.errno(), Some(libc::EINVAL));
    let e = device::device_id("/nonexistent/device").unwrap_err();
    assert_eq!(e.errno(), Some(libc::ENOENT));
}

#[test]
fn test_unpriv_sgio_fake_sysfs() {
    let dev = match some_block_device() {
        Some(d) => d,
        None => return,
    };

    let (maj, min) = device::device_id(&dev).unwrap();
    let sysfs = tempfile::tempdir().unwrap();
    let attr = device::unpriv_sgio_path(&dev, Some(sysfs.path())).unwrap();
    assert_eq!(
        attr,
        sysfs
            .path()
            .join(format!("{}:{}", maj, min))
            .join("queue/unpriv_sgio")
    );

    // Kernels without the attribute.
    let e = device::get_unpriv_sgio(&dev, Some(sysfs.path())).unwrap_err();
    assert_eq!(e.errno(), Some(libc::ENOSYS));

    fs::create_dir_all(attr.parent().unwrap()).unwrap();
    fs::write(&attr, "0\n").unwrap();
    assert!(!device::get_unpriv_sgio(&dev, Some(sysfs.path())).unwrap());
    device::set_unpriv_sgio(&dev, Some(sysfs.path()), true).unwrap();
    assert!(device::get_unpriv_sgio(&dev, Some(sysfs.path())).unwrap());
}
