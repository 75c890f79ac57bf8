use super::super::errors::{self, ErrorKind};
use super::super::executor::{DirPolicy, Executor, OpenPolicy};
use super::super::sharedfs::{NeverShared, SharedFsClassifier};
use super::super::worker::{ChildExit, Handoff, Worker};
use super::{is_root, unprivileged};
use errno::Errno;
use libc;
use nix::fcntl::OFlag;
use nix::unistd::{getgid, getuid, AccessFlags, Gid, Uid};
use std::cell::Cell;
use std::{fs, path};
use tempfile;

use std::io::Read;
use std::os::unix::fs::{MetadataExt, PermissionsExt};

/// Worker running operations in-process, without switching identity.
///
/// With `fail` set, operations are not run and report that errno instead.
#[derive(Default)]
struct CountingWorker {
    calls: Cell<usize>,
    fail: Option<i32>,
}

impl CountingWorker {
    fn failing(errno: i32) -> Self {
        Self {
            calls: Cell::new(0),
            fail: Some(errno),
        }
    }

    fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Worker for CountingWorker {
    fn open_file(
        &self,
        _uid: Option<Uid>,
        _gid: Option<Gid>,
        op: &mut dyn FnMut() -> errors::Result<fs::File>,
    ) -> errors::Result<Handoff> {
        self.calls.set(self.calls.get() + 1);
        if let Some(e) = self.fail {
            return Ok(Handoff {
                file: None,
                exit: ChildExit::Failed(e),
            });
        }
        let h = match op() {
            Ok(f) => Handoff {
                file: Some(f),
                exit: ChildExit::Success,
            },
            Err(e) => Handoff {
                file: None,
                exit: ChildExit::Failed(e.errno().unwrap_or(libc::EIO)),
            },
        };
        Ok(h)
    }

    fn run(
        &self,
        _uid: Option<Uid>,
        _gid: Option<Gid>,
        op: &mut dyn FnMut() -> errors::Result<()>,
    ) -> errors::Result<ChildExit> {
        self.calls.set(self.calls.get() + 1);
        if let Some(e) = self.fail {
            return Ok(ChildExit::Failed(e));
        }
        match op() {
            Ok(()) => Ok(ChildExit::Success),
            Err(e) => Ok(ChildExit::Failed(e.errno().unwrap_or(libc::EIO))),
        }
    }
}

/// Worker acting as an identity which may read `path`.
///
/// The file is made readable before running the operation in-process.
struct GrantingWorker {
    path: path::PathBuf,
    calls: Cell<usize>,
}

impl GrantingWorker {
    fn new(path: &path::Path) -> Self {
        Self {
            path: path.to_path_buf(),
            calls: Cell::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Worker for GrantingWorker {
    fn open_file(
        &self,
        _uid: Option<Uid>,
        _gid: Option<Gid>,
        op: &mut dyn FnMut() -> errors::Result<fs::File>,
    ) -> errors::Result<Handoff> {
        self.calls.set(self.calls.get() + 1);
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o400))?;
        let file = op()?;
        Ok(Handoff {
            file: Some(file),
            exit: ChildExit::Success,
        })
    }

    fn run(
        &self,
        _uid: Option<Uid>,
        _gid: Option<Gid>,
        _op: &mut dyn FnMut() -> errors::Result<()>,
    ) -> errors::Result<ChildExit> {
        self.calls.set(self.calls.get() + 1);
        Ok(ChildExit::Failed(libc::ENOSYS))
    }
}

struct AlwaysShared;

impl SharedFsClassifier for AlwaysShared {
    fn is_shared_fs(&self, _path: &path::Path) -> errors::Result<bool> {
        Ok(true)
    }
}

struct Indeterminate;

impl SharedFsClassifier for Indeterminate {
    fn is_shared_fs(&self, _path: &path::Path) -> errors::Result<bool> {
        Err(ErrorKind::Sys(Errno(libc::EIO)).into())
    }
}

/// A file which the caller cannot open, unless privileged.
fn unreadable(dir: &tempfile::TempDir) -> path::PathBuf {
    let p = dir.path().join("locked");
    fs::write(&p, b"locked").unwrap();
    fs::set_permissions(&p, fs::Permissions::from_mode(0o000)).unwrap();
    p
}

fn other_uid() -> Option<Uid> {
    Some(Uid::from_raw(getuid().as_raw().wrapping_add(1)))
}

#[test]
fn test_policy_normalization() {
    let none = OpenPolicy::default().normalized();
    assert!(none.no_fork && none.fork);
    assert_eq!(none.normalized(), none);

    let only_fork = OpenPolicy {
        fork: true,
        force_mode: true,
        ..OpenPolicy::default()
    };
    assert_eq!(only_fork.normalized(), only_fork);

    let forced = OpenPolicy {
        force_owner: true,
        ..OpenPolicy::default()
    }
    .normalized();
    assert!(forced.no_fork && forced.fork && forced.force_owner);
}

#[test]
fn test_same_identity_never_forks() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("file");
    let exec = Executor::new().with_worker(CountingWorker::default());

    let identities = [
        (None, None),
        (Some(getuid()), None),
        (None, Some(getgid())),
        (Some(getuid()), Some(getgid())),
    ];
    let policies = [
        OpenPolicy::default(),
        OpenPolicy {
            fork: true,
            ..OpenPolicy::default()
        },
        OpenPolicy {
            no_fork: true,
            force_owner: true,
            force_mode: true,
            ..OpenPolicy::default()
        },
    ];
    for &(uid, gid) in identities.iter() {
        for policy in policies.iter() {
            exec.open_as(&target, OFlag::O_CREAT | OFlag::O_RDWR, 0o600, uid, gid, *policy)
                .unwrap();
            // Failures are reported directly as well.
            let missing = dir.path().join("missing");
            let e = exec
                .open_as(&missing, OFlag::O_RDONLY, 0, uid, gid, *policy)
                .unwrap_err();
            assert_eq!(e.errno(), Some(libc::ENOENT));
        }
        exec.access_as(&target, AccessFlags::R_OK, uid, gid).unwrap();
    }
    assert_eq!(exec.worker().calls(), 0);
}

#[test]
fn test_open_failure_message() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nodir").join("file");
    let exec = Executor::new().with_worker(CountingWorker::default());

    let e = exec
        .open_as(&missing, OFlag::O_CREAT | OFlag::O_WRONLY, 0o600, None, None, OpenPolicy::default())
        .unwrap_err();
    assert!(e.to_string().starts_with("failed to create file"));
    let e = exec
        .open_as(&missing, OFlag::O_RDONLY, 0, None, None, OpenPolicy::default())
        .unwrap_err();
    assert!(e.to_string().starts_with("failed to open file"));
}

#[test]
fn test_not_shared_does_not_fork() {
    unprivileged(|| {
        let dir = tempfile::tempdir().unwrap();
        let locked = unreadable(&dir);
        let exec = Executor::new()
            .with_worker(CountingWorker::default())
            .with_classifier(NeverShared);

        let e = exec
            .open_as(&locked, OFlag::O_RDONLY, 0, other_uid(), None, OpenPolicy::default())
            .unwrap_err();
        assert_eq!(e.errno(), Some(libc::EACCES));
        assert_eq!(exec.worker().calls(), 0);
    });
}

#[test]
fn test_indeterminate_fs_aborts() {
    unprivileged(|| {
        let dir = tempfile::tempdir().unwrap();
        let locked = unreadable(&dir);
        let exec = Executor::new()
            .with_worker(CountingWorker::default())
            .with_classifier(Indeterminate);

        let e = exec
            .open_as(&locked, OFlag::O_RDONLY, 0, other_uid(), None, OpenPolicy::default())
            .unwrap_err();
        assert_eq!(e.errno(), Some(libc::EIO));
        assert!(e.to_string().starts_with("couldn't determine fs type"));
        assert_eq!(exec.worker().calls(), 0);
    });
}

#[test]
fn test_denied_twice_is_final() {
    unprivileged(|| {
        let dir = tempfile::tempdir().unwrap();
        let locked = unreadable(&dir);
        let exec = Executor::new()
            .with_worker(CountingWorker::failing(libc::EACCES))
            .with_classifier(AlwaysShared);

        let e = exec
            .open_as(&locked, OFlag::O_RDONLY, 0, other_uid(), None, OpenPolicy::default())
            .unwrap_err();
        assert_eq!(e.errno(), Some(libc::EACCES));
        assert_eq!(exec.worker().calls(), 1);
    });
}

#[test]
fn test_no_fork_policy_skips_worker() {
    unprivileged(|| {
        let dir = tempfile::tempdir().unwrap();
        let locked = unreadable(&dir);
        let exec = Executor::new()
            .with_worker(CountingWorker::default())
            .with_classifier(AlwaysShared);
        let policy = OpenPolicy {
            no_fork: true,
            ..OpenPolicy::default()
        };

        let e = exec
            .open_as(&locked, OFlag::O_RDONLY, 0, other_uid(), None, policy)
            .unwrap_err();
        assert_eq!(e.errno(), Some(libc::EACCES));
        assert_eq!(exec.worker().calls(), 0);
    });
}

#[test]
fn test_shared_fs_worker_opens() {
    unprivileged(|| {
        let dir = tempfile::tempdir().unwrap();
        let locked = unreadable(&dir);
        let exec = Executor::new()
            .with_worker(GrantingWorker::new(&locked))
            .with_classifier(AlwaysShared);
        let policy = OpenPolicy {
            force_mode: true,
            ..OpenPolicy::default()
        };

        let mut fp = exec
            .open_as(&locked, OFlag::O_RDONLY, 0o640, other_uid(), None, policy)
            .unwrap();
        assert_eq!(exec.worker().calls(), 1);

        let mut content = String::new();
        fp.read_to_string(&mut content).unwrap();
        assert_eq!(content, "locked");
        assert_eq!(fp.metadata().unwrap().mode() & 0o777, 0o640);
    });
}

#[test]
fn test_root_fork_only_uses_worker() {
    if !is_root() {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("created");
    let exec = Executor::new().with_worker(CountingWorker::default());
    let policy = OpenPolicy {
        fork: true,
        force_owner: true,
        force_mode: true,
        ..OpenPolicy::default()
    };

    let fp = exec
        .open_as(
            &target,
            OFlag::O_CREAT | OFlag::O_RDWR,
            0o640,
            Some(Uid::from_raw(65534)),
            Some(Gid::from_raw(65534)),
            policy,
        )
        .unwrap();
    assert_eq!(exec.worker().calls(), 1);

    let meta = fp.metadata().unwrap();
    assert_eq!(meta.uid(), 65534);
    assert_eq!(meta.gid(), 65534);
    assert_eq!(meta.mode() & 0o777, 0o640);
}

#[test]
fn test_root_worker_failure_falls_back() {
    if !is_root() {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("fallback");
    let exec = Executor::new().with_worker(CountingWorker::failing(libc::EIO));
    let policy = OpenPolicy {
        fork: true,
        force_owner: true,
        ..OpenPolicy::default()
    };

    let fp = exec
        .open_as(
            &target,
            OFlag::O_CREAT | OFlag::O_RDWR,
            0o600,
            Some(Uid::from_raw(65534)),
            Some(Gid::from_raw(65534)),
            policy,
        )
        .unwrap();
    assert_eq!(exec.worker().calls(), 1);
    assert_eq!(fp.metadata().unwrap().uid(), 65534);
}

#[test]
fn test_create_dir_direct() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("sub");
    let exec = Executor::new().with_worker(CountingWorker::default());
    let policy = DirPolicy {
        as_uid: true,
        force_perms: true,
        allow_exist: false,
    };

    exec.create_dir_as(&target, 0o750, None, None, policy).unwrap();
    let meta = fs::metadata(&target).unwrap();
    assert!(meta.is_dir());
    assert_eq!(meta.mode() & 0o777, 0o750);

    let e = exec.create_dir_as(&target, 0o750, None, None, policy).unwrap_err();
    assert_eq!(e.errno(), Some(libc::EEXIST));

    let again = DirPolicy {
        allow_exist: true,
        ..policy
    };
    exec.create_dir_as(&target, 0o700, None, None, again).unwrap();
    assert_eq!(fs::metadata(&target).unwrap().mode() & 0o777, 0o700);
    assert_eq!(exec.worker().calls(), 0);
}

#[test]
fn test_create_dir_worker_denied_falls_back() {
    if !is_root() {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("sub");
    let exec = Executor::new().with_worker(CountingWorker::failing(libc::EACCES));
    let policy = DirPolicy {
        as_uid: true,
        ..DirPolicy::default()
    };

    exec.create_dir_as(
        &target,
        0o755,
        Some(Uid::from_raw(65534)),
        Some(Gid::from_raw(65534)),
        policy,
    )
    .unwrap();
    let meta = fs::metadata(&target).unwrap();
    assert_eq!(meta.uid(), 65534);
    assert_eq!(meta.gid(), 65534);
    assert_eq!(exec.worker().calls(), 1);
}

#[test]
fn test_access_worker_status() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("file");
    fs::write(&target, b"").unwrap();

    let exec = Executor::new().with_worker(CountingWorker::failing(libc::EACCES));
    let e = exec
        .access_as(&target, AccessFlags::R_OK, other_uid(), None)
        .unwrap_err();
    assert_eq!(e.errno(), Some(libc::EACCES));
    assert_eq!(exec.worker().calls(), 1);

    let exec = Executor::new().with_worker(CountingWorker::default());
    exec.access_as(&target, AccessFlags::F_OK, other_uid(), None)
        .unwrap();
    assert_eq!(exec.worker().calls(), 1);
}
