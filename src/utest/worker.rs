use super::super::errors::{self, ErrorKind};
use super::super::worker::{self, ChildExit, ForkWorker, Worker, EXIT_ERRNO_OVERFLOW};
use errno::Errno;
use libc;
use std::fs;
use std::io::{Read, Write};
use tempfile;

#[test]
fn test_exit_status_clamp() {
    assert_eq!(worker::exit_status_for(0), 0);
    assert_eq!(worker::exit_status_for(libc::EACCES), 13);
    assert_eq!(worker::exit_status_for(255), 255);
    assert_eq!(worker::exit_status_for(300), EXIT_ERRNO_OVERFLOW);
    assert_eq!(worker::exit_status_for(-1), EXIT_ERRNO_OVERFLOW);
}

#[test]
fn test_fork_run_status() {
    let w = ForkWorker;

    let r = w.run(None, None, &mut || -> errors::Result<()> { Ok(()) }).unwrap();
    assert_eq!(r, ChildExit::Success);

    let r = w
        .run(None, None, &mut || -> errors::Result<()> {
            Err(ErrorKind::Sys(Errno(libc::EACCES)).into())
        })
        .unwrap();
    assert_eq!(r, ChildExit::Failed(13));

    let r = w
        .run(None, None, &mut || -> errors::Result<()> {
            Err(ErrorKind::Sys(Errno(300)).into())
        })
        .unwrap();
    assert_eq!(r, ChildExit::Failed(EXIT_ERRNO_OVERFLOW));
}

#[test]
fn test_fork_open_handoff() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"handoff").unwrap();
    let path = tmp.path().to_path_buf();

    let mut op = || -> errors::Result<fs::File> { Ok(fs::File::open(&path)?) };
    let h = ForkWorker.open_file(None, None, &mut op).unwrap();
    assert_eq!(h.exit, ChildExit::Success);

    let mut content = String::new();
    h.file.unwrap().read_to_string(&mut content).unwrap();
    assert_eq!(content, "handoff");
}

#[test]
fn test_fork_open_failure() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");

    let mut op = || -> errors::Result<fs::File> { Ok(fs::File::open(&missing)?) };
    let h = ForkWorker.open_file(None, None, &mut op).unwrap();
    assert!(h.file.is_none());
    assert_eq!(h.exit, ChildExit::Failed(libc::ENOENT));
}
