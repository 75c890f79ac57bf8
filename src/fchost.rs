//! Fibre-Channel host adapters and NPIV virtual ports, via sysfs.
//!
//! Each FC host adapter shows up as a `hostN` directory under the
//! `fc_host` class, with single-line attribute files. Adapters which
//! support NPIV expose `vport_create` and `vport_delete` control files,
//! either in the `fc_host` or in the `scsi_host` class directory.

use super::errors::{self, io_errno, os_error};
use super::safeio;
use errno;
use libc;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use openat;
use std::{fs, io, path};

use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

/// Default mountpoint of the `fc_host` sysfs class.
pub const DEFAULT_FC_HOST_PATH: &str = "/sys/class/fc_host/";

/// Default mountpoint of the `scsi_host` sysfs class.
pub const DEFAULT_SCSI_HOST_PATH: &str = "/sys/class/scsi_host/";

/// Value of `port_state` for a link which is up.
pub const PORT_STATE_ONLINE: &str = "Online";

/// Maximum size of a sysfs attribute value.
const ATTR_MAX_LEN: usize = 1024;

/// Virtual port operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VportOp {
    /// Create a virtual port.
    Create,
    /// Delete a virtual port.
    Delete,
}

impl VportOp {
    /// Name of the sysfs control file for this operation.
    pub fn control_file(&self) -> &'static str {
        match *self {
            VportOp::Create => "vport_create",
            VportOp::Delete => "vport_delete",
        }
    }
}

/// Snapshot of the attributes of one FC host adapter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FcHostRecord {
    /// Host number, as in `hostN`.
    pub host: u32,
    /// World-wide node name.
    pub wwnn: String,
    /// World-wide port name.
    pub wwpn: String,
    /// World-wide name of the fabric, if attached to one.
    pub fabric_wwn: Option<String>,
    /// Link state (e.g. "Online", "Linkdown").
    pub port_state: Option<String>,
    /// Maximum number of virtual ports, as reported by the kernel.
    pub max_vports: Option<String>,
    /// Number of virtual ports in use, as reported by the kernel.
    pub vports_inuse: Option<String>,
    /// Whether the adapter exposes NPIV control files.
    pub vport_capable: bool,
}

impl FcHostRecord {
    /// Whether the link is up.
    pub fn is_online(&self) -> bool {
        self.port_state.as_ref().map_or(false, |s| s == PORT_STATE_ONLINE)
    }

    /// Whether another virtual port can be created on this adapter.
    ///
    /// See `vport_capacity_remains` for how the counts are compared.
    pub fn has_vport_capacity(&self) -> bool {
        match (&self.max_vports, &self.vports_inuse) {
            (&Some(ref max), &Some(ref inuse)) => vport_capacity_remains(max, inuse),
            _ => false,
        }
    }
}

/// Whether `max_vports` leaves room above `vports_inuse`.
///
/// Counts are compared as text: by length first, then lexicographically.
/// This only matches the numeric order for integers without leading
/// zeros, and it reports capacity for equal-length values (e.g. "5" in use
/// out of "5"). It is kept as-is for compatibility with existing host
/// selection; see `vport_capacity_remains_numeric` for the plain integer
/// comparison.
pub fn vport_capacity_remains(max_vports: &str, vports_inuse: &str) -> bool {
    max_vports.len() >= vports_inuse.len()
        || (max_vports.len() == vports_inuse.len() && max_vports > vports_inuse)
}

/// Whether `max_vports` is strictly above `vports_inuse`, as integers.
///
/// Returns `None` if any of the values is not a valid count.
pub fn vport_capacity_remains_numeric(max_vports: &str, vports_inuse: &str) -> Option<bool> {
    let max = max_vports.trim().parse::<u64>().ok()?;
    let inuse = vports_inuse.trim().parse::<u64>().ok()?;
    Some(max > inuse)
}

/// Check that `wwn` is a world-wide name: 16 hex digits, optionally
/// prefixed by "0x".
pub fn validate_wwn(wwn: &str) -> errors::Result<()> {
    let digits = strip_hex_prefix(wwn);
    if digits.len() != 16 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!(errors::ErrorKind::Os(
            errno::Errno(libc::EINVAL),
            format!("malformed wwn: {}", wwn)
        ));
    }
    Ok(())
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

/// Normalize a raw attribute value: keep the first line and drop any "0x".
fn normalize_attr(raw: &str) -> &str {
    let line = raw.split('\n').next().unwrap_or("");
    strip_hex_prefix(line)
}

fn host_name(host: u32) -> String {
    format!("host{}", host)
}

/// Source of FC host information.
///
/// Platforms without sysfs use `Unsupported`, which fails every query.
pub trait FcHostSource {
    /// Numbers of all FC hosts, in ascending order.
    fn host_numbers(&self) -> errors::Result<Vec<u32>>;

    /// Normalized value of attribute `entry` of `host`.
    ///
    /// `Ok(None)` means the attribute is not present.
    fn read_attr(&self, host: u32, entry: &str) -> errors::Result<Option<String>>;

    /// Whether `host` is a FC host.
    fn is_capable_fc_host(&self, host: u32) -> errors::Result<bool>;

    /// Whether `host` supports NPIV virtual ports.
    fn is_capable_vport(&self, host: u32) -> errors::Result<bool>;

    /// Create or delete the virtual port `wwnn:wwpn` on `parent_host`.
    fn manage_vport(&self, parent_host: u32, wwnn: &str, wwpn: &str, op: VportOp) -> errors::Result<()>;

    /// Snapshot of the attributes of `host`.
    fn host(&self, host: u32) -> errors::Result<FcHostRecord> {
        let required = |entry: &str| -> errors::Result<String> {
            self.read_attr(host, entry)?.ok_or_else(|| {
                os_error(
                    errno::Errno(libc::ENOENT),
                    format!("missing attribute '{}' for {}", entry, host_name(host)),
                )
            })
        };
        Ok(FcHostRecord {
            host,
            wwnn: required("node_name")?,
            wwpn: required("port_name")?,
            fabric_wwn: self.read_attr(host, "fabric_name")?,
            port_state: self.read_attr(host, "port_state")?,
            max_vports: self.read_attr(host, "max_npiv_vports")?,
            vports_inuse: self.read_attr(host, "npiv_vports_inuse")?,
            vport_capable: self.is_capable_vport(host)?,
        })
    }

    /// Snapshots of all FC hosts.
    fn list_hosts(&self) -> errors::Result<Vec<FcHostRecord>> {
        let mut hosts = vec![];
        for n in self.host_numbers()? {
            hosts.push(self.host(n)?);
        }
        Ok(hosts)
    }

    /// Name (`hostN`) of the FC host with node name `wwnn` and port name `wwpn`.
    fn host_by_wwn(&self, wwnn: &str, wwpn: &str) -> errors::Result<Option<String>> {
        let (wwnn, wwpn) = (normalize_attr(wwnn), normalize_attr(wwpn));
        for n in self.host_numbers()? {
            if self.read_attr(n, "node_name")?.as_ref().map(|s| s.as_str()) != Some(wwnn) {
                continue;
            }
            if self.read_attr(n, "port_name")?.as_ref().map(|s| s.as_str()) != Some(wwpn) {
                continue;
            }
            return Ok(Some(host_name(n)));
        }
        Ok(None)
    }

    /// Name (`hostN`) of the first online NPIV host which can take one
    /// more virtual port.
    fn find_capable_vport(&self) -> errors::Result<Option<String>> {
        for n in self.host_numbers()? {
            match vport_room(self, n) {
                Ok(true) => return Ok(Some(host_name(n))),
                Ok(false) => {}
                Err(e) => debug!("skipping {}: {}", host_name(n), e),
            }
        }
        Ok(None)
    }
}

/// Whether `host` is an online NPIV host which can take one more vport.
fn vport_room<S: FcHostSource + ?Sized>(source: &S, host: u32) -> errors::Result<bool> {
    if !source.is_capable_vport(host)? {
        debug!("skipping {}: no NPIV support", host_name(host));
        return Ok(false);
    }
    let state = source.read_attr(host, "port_state")?;
    if state.as_ref().map(|s| s.as_str()) != Some(PORT_STATE_ONLINE) {
        debug!("skipping {}: port state {:?}", host_name(host), state);
        return Ok(false);
    }
    let max = source.read_attr(host, "max_npiv_vports")?;
    let inuse = source.read_attr(host, "npiv_vports_inuse")?;
    match (max, inuse) {
        (Some(max), Some(inuse)) => {
            if vport_capacity_remains(&max, &inuse) {
                return Ok(true);
            }
            debug!("skipping {}: {} of {} vports in use", host_name(host), inuse, max);
            Ok(false)
        }
        _ => Ok(false),
    }
}

/// FC host information from sysfs.
pub struct FcSysfs {
    fc_dir: openat::Dir,
    scsi_dir: Option<openat::Dir>,
}

impl FcSysfs {
    /// Open the default sysfs class directories.
    ///
    /// A missing `scsi_host` class is tolerated.
    pub fn open_default() -> errors::Result<Self> {
        let scsi = path::Path::new(DEFAULT_SCSI_HOST_PATH);
        Self::open_paths(DEFAULT_FC_HOST_PATH, Some(scsi))
    }

    /// Open an `FcSysfs` instance at custom class directories.
    ///
    /// A missing `scsi_host` directory is tolerated.
    pub fn open_paths<P: AsRef<path::Path>>(
        fc_path: P,
        scsi_path: Option<&path::Path>,
    ) -> errors::Result<Self> {
        let fc_dir = open_dir(fc_path.as_ref())?;
        let scsi_dir = match scsi_path {
            None => None,
            Some(p) => match fs::File::open(p) {
                Ok(fp) => Some(Self::dir_from_file(fp, p)?),
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(os_error(io_errno(&e), format!("cannot open '{}'", p.display()))),
            },
        };
        Ok(Self { fc_dir, scsi_dir })
    }

    fn dir_from_file(fp: fs::File, p: &path::Path) -> errors::Result<openat::Dir> {
        if !fp.metadata()?.is_dir() {
            bail!(errors::ErrorKind::Os(
                errno::Errno(libc::ENOTDIR),
                format!("'{}' is not a directory", p.display())
            ));
        }
        // UNSAFE(lucab): checked above that this is a dirfd, ownership transferred here.
        Ok(unsafe { openat::Dir::from_raw_fd(fp.into_raw_fd()) })
    }

    /// Whether `dir` has a `hostN/<entry>` file.
    fn has_entry(dir: &openat::Dir, host: u32, entry: &str) -> errors::Result<bool> {
        let rel = format!("{}/{}", host_name(host), entry);
        match dir.metadata(rel.as_str()) {
            Ok(_) => Ok(true),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(os_error(io_errno(&e), format!("cannot stat '{}'", rel))),
        }
    }

    /// Directory holding the `op` control file for `host`, FC class first.
    fn control_dir(&self, host: u32, op: VportOp) -> errors::Result<Option<&openat::Dir>> {
        if Self::has_entry(&self.fc_dir, host, op.control_file())? {
            return Ok(Some(&self.fc_dir));
        }
        if let Some(ref scsi) = self.scsi_dir {
            if Self::has_entry(scsi, host, op.control_file())? {
                return Ok(Some(scsi));
            }
        }
        Ok(None)
    }
}

impl FcHostSource for FcSysfs {
    fn host_numbers(&self) -> errors::Result<Vec<u32>> {
        let entries = self
            .fc_dir
            .list_dir(".")
            .map_err(|e| os_error(io_errno(&e), "failed to list FC hosts"))?;
        let mut hosts = vec![];
        for entry in entries {
            let entry = entry.map_err(|e| os_error(io_errno(&e), "failed to list FC hosts"))?;
            let name = entry.file_name().to_string_lossy();
            match name.strip_prefix("host").and_then(|n| n.parse::<u32>().ok()) {
                Some(n) => hosts.push(n),
                None => debug!("ignoring fc_host entry '{}'", name),
            }
        }
        hosts.sort_unstable();
        Ok(hosts)
    }

    fn read_attr(&self, host: u32, entry: &str) -> errors::Result<Option<String>> {
        let rel = format!("{}/{}", host_name(host), entry);
        let fp = match self.fc_dir.open_file(rel.as_str()) {
            Ok(fp) => fp,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(os_error(io_errno(&e), format!("failed to open '{}'", rel))),
        };
        let mut buf = String::new();
        fp.take(ATTR_MAX_LEN as u64)
            .read_to_string(&mut buf)
            .map_err(|e| os_error(io_errno(&e), format!("failed to read '{}'", rel)))?;
        Ok(Some(normalize_attr(&buf).to_string()))
    }

    fn is_capable_fc_host(&self, host: u32) -> errors::Result<bool> {
        match self.fc_dir.metadata(host_name(host).as_str()) {
            Ok(_) => Ok(true),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(os_error(io_errno(&e), format!("cannot stat '{}'", host_name(host)))),
        }
    }

    fn is_capable_vport(&self, host: u32) -> errors::Result<bool> {
        Ok(self.control_dir(host, VportOp::Create)?.is_some())
    }

    fn manage_vport(&self, parent_host: u32, wwnn: &str, wwpn: &str, op: VportOp) -> errors::Result<()> {
        let rel = format!("{}/{}", host_name(parent_host), op.control_file());
        let dir = self.control_dir(parent_host, op)?.ok_or_else(|| {
            os_error(
                errno::Errno(libc::EINVAL),
                format!("no {} control file for {}", op.control_file(), host_name(parent_host)),
            )
        })?;
        debug!("writing '{}:{}' to {}", wwnn, wwpn, rel);

        let fp = open_write_at(dir, &rel)?;
        let payload = format!("{}:{}", wwnn, wwpn);
        safeio::write_all(&fp, payload.as_bytes()).map_err(|e| {
            errors::context(
                e,
                format!("write of '{}' to '{}' during vport operation failed", payload, rel),
            )
        })?;
        Ok(())
    }
}

fn open_dir(p: &path::Path) -> errors::Result<openat::Dir> {
    let fp = fs::File::open(p).map_err(|e| os_error(io_errno(&e), format!("cannot open '{}'", p.display())))?;
    FcSysfs::dir_from_file(fp, p)
}

/// Open an existing `rel` under `dir` for writing only.
///
/// Sysfs control files are write-only, so they cannot go through
/// `openat::Dir::update_file`.
fn open_write_at(dir: &openat::Dir, rel: &str) -> errors::Result<fs::File> {
    let flags = OFlag::O_WRONLY | OFlag::O_TRUNC | OFlag::O_CLOEXEC;
    let fd = fcntl::openat(Some(dir.as_raw_fd()), rel, flags, Mode::empty()).map_err(|e| {
        os_error(
            errno::Errno(e as i32),
            format!("failed to open '{}' for writing", rel),
        )
    })?;
    // UNSAFE(lucab): `fd` was just opened and is owned by nobody else.
    Ok(unsafe { fs::File::from_raw_fd(fd) })
}

/// FC host source for platforms without sysfs.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unsupported;

impl Unsupported {
    fn fail<T>(&self, op: &str) -> errors::Result<T> {
        Err(errors::ErrorKind::Unsupported(op.to_string()).into())
    }
}

impl FcHostSource for Unsupported {
    fn host_numbers(&self) -> errors::Result<Vec<u32>> {
        self.fail("FC host enumeration")
    }

    fn read_attr(&self, _host: u32, _entry: &str) -> errors::Result<Option<String>> {
        self.fail("reading FC host attributes")
    }

    fn is_capable_fc_host(&self, _host: u32) -> errors::Result<bool> {
        self.fail("FC host detection")
    }

    fn is_capable_vport(&self, _host: u32) -> errors::Result<bool> {
        self.fail("NPIV detection")
    }

    fn manage_vport(&self, _parent_host: u32, _wwnn: &str, _wwpn: &str, _op: VportOp) -> errors::Result<()> {
        self.fail("vport management")
    }
}

/// Default FC host source for this platform.
#[cfg(target_os = "linux")]
pub fn default_source() -> errors::Result<Box<dyn FcHostSource>> {
    Ok(Box::new(FcSysfs::open_default()?))
}

/// Default FC host source for this platform.
#[cfg(not(target_os = "linux"))]
pub fn default_source() -> errors::Result<Box<dyn FcHostSource>> {
    Ok(Box::new(Unsupported))
}
