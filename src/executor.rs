//! Filesystem operations performed as a given user and group.
//!
//! Each operation is first tried in-process, with the caller's own
//! credentials. When that is denied on a shared filesystem, it is retried
//! in a worker running as the target identity; this is what makes files
//! on root-squashing NFS exports reachable from a root process.

use super::errors::{self, context, io_errno, os_error};
use super::identity::Identity;
use super::sharedfs::{SharedFsClassifier, StatfsClassifier};
use super::worker::{ChildExit, ForkWorker, Handoff, Worker};
use errno;
use libc;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{access, getuid, AccessFlags, Gid, Uid};
use std::{fs, io, path};

use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::os::unix::io::FromRawFd;

const PERMS_MASK: u32 = 0o777;

/// Strategies and post-open fixups for `Executor::open_as`.
///
/// Without any of `no_fork` and `fork`, both are assumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenPolicy {
    /// Try opening with the caller's credentials, in-process.
    pub no_fork: bool,
    /// Try opening in a worker running as the target identity.
    pub fork: bool,
    /// Make sure the file is owned by the target identity.
    pub force_owner: bool,
    /// Make sure the file has the requested permission bits.
    pub force_mode: bool,
}

impl OpenPolicy {
    /// Policy with both strategies explicitly enabled.
    pub fn normalized(self) -> Self {
        if self.no_fork || self.fork {
            return self;
        }
        Self {
            no_fork: true,
            fork: true,
            ..self
        }
    }
}

/// Options for `Executor::create_dir_as`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirPolicy {
    /// Create the directory while running as the target identity.
    pub as_uid: bool,
    /// Make sure the directory has the requested permission bits.
    pub force_perms: bool,
    /// Do not fail if the directory already exists.
    pub allow_exist: bool,
}

/// Performs filesystem operations on behalf of other identities.
///
/// Workers and shared-filesystem detection are pluggable; by default
/// operations are retried in forked children, for paths on filesystems
/// detected via `statfs(2)`.
#[derive(Clone, Debug, Default)]
pub struct Executor<W = ForkWorker, C = StatfsClassifier> {
    worker: W,
    classifier: C,
}

impl Executor {
    /// Executor with the forking worker and the `statfs(2)` classifier.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<W, C> Executor<W, C> {
    /// Replace the worker used for operations as another identity.
    pub fn with_worker<W2: Worker>(self, worker: W2) -> Executor<W2, C> {
        Executor {
            worker,
            classifier: self.classifier,
        }
    }

    /// Replace the shared-filesystem classifier.
    pub fn with_classifier<C2: SharedFsClassifier>(self, classifier: C2) -> Executor<W, C2> {
        Executor {
            worker: self.worker,
            classifier,
        }
    }

    /// Worker in use.
    pub fn worker(&self) -> &W {
        &self.worker
    }
}

impl<W: Worker, C: SharedFsClassifier> Executor<W, C> {
    /// Open (or create) `path` with `flags` and `mode`, as `uid`/`gid`.
    ///
    /// `None` ids stand for the caller's real ones. The open is tried
    /// in-process first (unless running as root with only `policy.fork`).
    /// On `EACCES`/`EPERM` over a shared filesystem, it is retried in a
    /// worker running as the target identity, which hands back the file.
    /// If the target identity is the caller's own, no worker is ever used.
    pub fn open_as<P: AsRef<path::Path>>(
        &self,
        path: P,
        flags: OFlag,
        mode: u32,
        uid: Option<Uid>,
        gid: Option<Gid>,
        policy: OpenPolicy,
    ) -> errors::Result<fs::File> {
        let path = path.as_ref();
        let policy = policy.normalized();
        let ident = Identity { uid, gid };
        let (uid, gid) = ident.resolve();
        let same_identity = ident.is_current();

        let mut direct_err = None;
        if policy.no_fork || same_identity || !getuid().is_root() || (uid.is_root() && gid.as_raw() == 0) {
            debug!("opening '{}' in-process", path.display());
            match open_direct(path, flags, mode) {
                Ok(file) => {
                    force_owner_mode(path, &file, mode, uid, gid, policy)?;
                    return Ok(file);
                }
                Err(eno) => direct_err = Some(eno),
            }
        }

        if let Some(eno) = direct_err {
            if !policy.fork || same_identity {
                return Err(open_failure(path, flags, eno));
            }
            // Only a denied access can be fixed by switching identity.
            if eno.0 != libc::EACCES && eno.0 != libc::EPERM {
                return Err(open_failure(path, flags, eno));
            }
            let shared = self.classifier.is_shared_fs(path).map_err(|e| {
                context(
                    e,
                    format!("couldn't determine fs type of mount containing '{}'", path.display()),
                )
            })?;
            if !shared {
                return Err(open_failure(path, flags, eno));
            }
        }

        debug!("opening '{}' as {}:{} in a worker", path.display(), uid, gid);
        self.open_in_worker(path, flags, mode, uid, gid, policy, direct_err.is_some())
    }

    fn open_in_worker(
        &self,
        path: &path::Path,
        flags: OFlag,
        mode: u32,
        uid: Uid,
        gid: Gid,
        policy: OpenPolicy,
        tried_direct: bool,
    ) -> errors::Result<fs::File> {
        let Handoff { file, exit } = {
            let mut op = || -> errors::Result<fs::File> {
                let file = open_direct(path, flags, mode).map_err(|eno| {
                    os_error(eno, format!("child process failed to create file '{}'", path.display()))
                })?;
                force_owner_mode(path, &file, mode, uid, gid, policy)?;
                Ok(file)
            };
            self.worker.open_file(Some(uid), Some(gid), &mut op)?
        };

        match (file, exit) {
            (Some(file), ChildExit::Success) => return Ok(file),
            // Any other descriptor gets closed here.
            (_, ChildExit::Failed(e)) if e == libc::EACCES && tried_direct => {
                // The in-process attempt was already denied, no point in retrying.
                return Err(open_failure(path, flags, errno::Errno(libc::EACCES)));
            }
            (_, exit) => debug!("worker failed ({:?}), falling back to in-process open", exit),
        }

        let file = open_direct(path, flags, mode).map_err(|eno| open_failure(path, flags, eno))?;
        force_owner_mode(path, &file, mode, uid, gid, policy)?;
        Ok(file)
    }

    /// Check whether `path` is accessible with `mode` by `uid`/`gid`.
    ///
    /// For the caller's own identity this is a plain `access(2)`, otherwise
    /// the check runs in a worker as the target identity.
    pub fn access_as<P: AsRef<path::Path>>(
        &self,
        path: P,
        mode: AccessFlags,
        uid: Option<Uid>,
        gid: Option<Gid>,
    ) -> errors::Result<()> {
        let path = path.as_ref();
        let ident = Identity { uid, gid };
        let not_accessible = |eno: errno::Errno| {
            os_error(
                eno,
                format!("'{}' is not accessible as {}", path.display(), ident),
            )
        };

        if ident.is_current() {
            return access(path, mode).map_err(|e| not_accessible(errno::Errno(e as i32)));
        }

        let (uid, gid) = ident.resolve();
        let exit = {
            let mut op = || access(path, mode).map_err(|e| not_accessible(errno::Errno(e as i32)));
            self.worker.run(Some(uid), Some(gid), &mut op)?
        };
        match exit {
            ChildExit::Success => Ok(()),
            ChildExit::Failed(e) => Err(not_accessible(errno::Errno(e))),
            ChildExit::Abnormal => Err(not_accessible(errno::Errno(libc::EINTR))),
        }
    }

    /// Create directory `path` with `mode`, owned by `uid`/`gid`.
    ///
    /// With `policy.as_uid`, and when running as root on behalf of another
    /// identity, the directory is created in a worker running as the target
    /// identity. If that is denied, creation falls back to the caller's
    /// credentials followed by a `chown(2)`.
    pub fn create_dir_as<P: AsRef<path::Path>>(
        &self,
        path: P,
        mode: u32,
        uid: Option<Uid>,
        gid: Option<Gid>,
        policy: DirPolicy,
    ) -> errors::Result<()> {
        let path = path.as_ref();
        let ident = Identity { uid, gid };
        let (uid, gid) = ident.resolve();

        if !policy.as_uid
            || ident.is_current()
            || !getuid().is_root()
            || (uid.is_root() && gid.as_raw() == 0)
            || (policy.allow_exist && fs::metadata(path).is_ok())
        {
            return create_dir_direct(path, mode, uid, gid, policy);
        }

        let exit = {
            let mut op = || create_dir_child(path, mode, gid, policy);
            self.worker.run(Some(uid), Some(gid), &mut op)?
        };
        match exit {
            ChildExit::Success => Ok(()),
            ChildExit::Failed(e) if e != libc::EACCES => Err(os_error(
                errno::Errno(e),
                format!("child failed to create directory '{}'", path.display()),
            )),
            _ => {
                debug!("worker could not create '{}', falling back", path.display());
                create_dir_direct(path, mode, uid, gid, policy)
            }
        }
    }
}

/// Open `path` as `uid`/`gid` with the default executor.
///
/// See `Executor::open_as`.
pub fn open_as<P: AsRef<path::Path>>(
    path: P,
    flags: OFlag,
    mode: u32,
    uid: Option<Uid>,
    gid: Option<Gid>,
    policy: OpenPolicy,
) -> errors::Result<fs::File> {
    Executor::new().open_as(path, flags, mode, uid, gid, policy)
}

/// Check accessibility of `path` as `uid`/`gid` with the default executor.
///
/// See `Executor::access_as`.
pub fn access_as<P: AsRef<path::Path>>(
    path: P,
    mode: AccessFlags,
    uid: Option<Uid>,
    gid: Option<Gid>,
) -> errors::Result<()> {
    Executor::new().access_as(path, mode, uid, gid)
}

/// Create directory `path` as `uid`/`gid` with the default executor.
///
/// See `Executor::create_dir_as`.
pub fn create_dir_as<P: AsRef<path::Path>>(
    path: P,
    mode: u32,
    uid: Option<Uid>,
    gid: Option<Gid>,
    policy: DirPolicy,
) -> errors::Result<()> {
    Executor::new().create_dir_as(path, mode, uid, gid, policy)
}

/// Fix owner and permission bits of an open file, as requested by `policy`.
///
/// Ids are never "unchanged" here, they have been resolved by the caller.
pub fn force_owner_mode(
    path: &path::Path,
    file: &fs::File,
    mode: u32,
    uid: Uid,
    gid: Gid,
    policy: OpenPolicy,
) -> errors::Result<()> {
    if !(policy.force_owner || policy.force_mode) {
        return Ok(());
    }

    let meta = file
        .metadata()
        .map_err(|e| os_error(io_errno(&e), format!("stat of '{}' failed", path.display())))?;

    if policy.force_owner && (meta.uid() != uid.as_raw() || meta.gid() != gid.as_raw()) {
        std::os::unix::fs::fchown(file, Some(uid.as_raw()), Some(gid.as_raw())).map_err(|e| {
            os_error(
                io_errno(&e),
                format!("cannot chown '{}' to ({}, {})", path.display(), uid, gid),
            )
        })?;
    }

    if policy.force_mode && (mode & PERMS_MASK) != (meta.mode() & PERMS_MASK) {
        file.set_permissions(fs::Permissions::from_mode(mode)).map_err(|e| {
            os_error(
                io_errno(&e),
                format!("cannot set mode of '{}' to {:04o}", path.display(), mode),
            )
        })?;
    }

    Ok(())
}

fn open_failure(path: &path::Path, flags: OFlag, eno: errno::Errno) -> errors::Error {
    let what = if flags.contains(OFlag::O_CREAT) {
        "failed to create file"
    } else {
        "failed to open file"
    };
    os_error(eno, format!("{} '{}'", what, path.display()))
}

/// `open(2)` with the current credentials.
fn open_direct(path: &path::Path, flags: OFlag, mode: u32) -> Result<fs::File, errno::Errno> {
    let mode = Mode::from_bits_truncate(mode as libc::mode_t);
    let fd = open(path, flags | OFlag::O_CLOEXEC, mode).map_err(|e| errno::Errno(e as i32))?;
    // UNSAFE(lucab): `fd` was just opened and is owned by nobody else.
    Ok(unsafe { fs::File::from_raw_fd(fd) })
}

fn mkdir(path: &path::Path, mode: u32) -> io::Result<()> {
    fs::DirBuilder::new().mode(mode).create(path)
}

/// Create a directory with the current credentials, then fix ownership.
fn create_dir_direct(
    path: &path::Path,
    mode: u32,
    uid: Uid,
    gid: Gid,
    policy: DirPolicy,
) -> errors::Result<()> {
    if let Err(e) = mkdir(path, mode) {
        if !(e.kind() == io::ErrorKind::AlreadyExists && policy.allow_exist) {
            return Err(os_error(
                io_errno(&e),
                format!("failed to create directory '{}'", path.display()),
            ));
        }
    }

    let meta = fs::metadata(path)
        .map_err(|e| os_error(io_errno(&e), format!("stat of '{}' failed", path.display())))?;
    if meta.uid() != uid.as_raw() || meta.gid() != gid.as_raw() {
        std::os::unix::fs::chown(path, Some(uid.as_raw()), Some(gid.as_raw())).map_err(|e| {
            os_error(
                io_errno(&e),
                format!("cannot chown '{}' to ({}, {})", path.display(), uid, gid),
            )
        })?;
    }

    if policy.force_perms {
        set_mode(path, mode)?;
    }
    Ok(())
}

/// Create a directory while already running as the target identity.
fn create_dir_child(path: &path::Path, mode: u32, gid: Gid, policy: DirPolicy) -> errors::Result<()> {
    mkdir(path, mode).map_err(|e| {
        os_error(
            io_errno(&e),
            format!("child failed to create directory '{}'", path.display()),
        )
    })?;

    // Group may not be inherited from the creator (e.g. setgid parents).
    let meta = fs::metadata(path)
        .map_err(|e| os_error(io_errno(&e), format!("stat of '{}' failed", path.display())))?;
    if meta.gid() != gid.as_raw() {
        std::os::unix::fs::chown(path, None, Some(gid.as_raw())).map_err(|e| {
            os_error(
                io_errno(&e),
                format!("cannot chown '{}' to group {}", path.display(), gid),
            )
        })?;
    }

    if policy.force_perms {
        set_mode(path, mode)?;
    }
    Ok(())
}

fn set_mode(path: &path::Path, mode: u32) -> errors::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
        os_error(
            io_errno(&e),
            format!("cannot set mode of '{}' to {:04o}", path.display(), mode),
        )
    })
}
