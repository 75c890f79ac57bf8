//! Running a single operation as another identity, in a child process.
//!
//! A `Worker` runs one operation per request, after switching to the
//! target identity in an isolated context. `ForkWorker` does so in a
//! forked child; an opened file can be handed back to the caller over a
//! private local socket pair, as `SCM_RIGHTS` ancillary data.
//!
//! Children report failures through their exit status: 0 for success,
//! otherwise the errno of the failure. Values which do not fit in one
//! byte are replaced by `EXIT_ERRNO_OVERFLOW`.

use super::errors::{self, io_errno, os_error};
use super::identity;
use errno;
use libc;
use nix::errno::Errno as NixErrno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Gid, Pid, Uid};
use std::{fs, io, panic};

use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Exit status used by children whose errno does not fit in one byte.
pub const EXIT_ERRNO_OVERFLOW: i32 = 0xff;

/// How a worker's operation terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildExit {
    /// Operation succeeded.
    Success,
    /// Operation failed, with this (possibly clamped) errno.
    Failed(i32),
    /// Child did not exit normally (e.g. killed by a signal).
    Abnormal,
}

/// Result of a worker operation producing a file.
#[derive(Debug)]
pub struct Handoff {
    /// File received from the operation, if any.
    pub file: Option<fs::File>,
    /// How the operation terminated.
    pub exit: ChildExit,
}

/// Runs operations as another identity, one operation per request.
pub trait Worker {
    /// Switch to `uid`/`gid`, run `op` and hand back the file it opened.
    fn open_file(
        &self,
        uid: Option<Uid>,
        gid: Option<Gid>,
        op: &mut dyn FnMut() -> errors::Result<fs::File>,
    ) -> errors::Result<Handoff>;

    /// Switch to `uid`/`gid`, run `op` and report how it terminated.
    fn run(
        &self,
        uid: Option<Uid>,
        gid: Option<Gid>,
        op: &mut dyn FnMut() -> errors::Result<()>,
    ) -> errors::Result<ChildExit>;
}

/// Worker running each operation in a forked child process.
///
/// The parent blocks until the child has exited; there is no timeout.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForkWorker;

impl Worker for ForkWorker {
    fn open_file(
        &self,
        uid: Option<Uid>,
        gid: Option<Gid>,
        op: &mut dyn FnMut() -> errors::Result<fs::File>,
    ) -> errors::Result<Handoff> {
        let (parent_sock, child_sock) = UnixStream::pair()
            .map_err(|e| os_error(io_errno(&e), "failed to create socket pair for child process"))?;

        // UNSAFE(lucab): the child only runs `op` and then `_exit`s.
        match unsafe { fork() } {
            Err(e) => Err(os_error(errno::Errno(e as i32), "cannot fork child process")),
            Ok(ForkResult::Child) => {
                drop(parent_sock);
                let code = child_status(|| {
                    identity::switch_identity(uid, gid)?;
                    let file = op()?;
                    send_fd(&child_sock, &file)
                });
                drop(child_sock);
                // UNSAFE(lucab): terminate the child without running any
                // of the parent's cleanup.
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(child_sock);
                let received = recv_fd(&parent_sock);
                drop(parent_sock);
                let file = match received {
                    Ok(f) => f,
                    Err(e) => {
                        let _ = wait_child(child);
                        return Err(e);
                    }
                };
                let exit = wait_child(child)?;
                debug!("child {} exited ({:?}), file received: {}", child, exit, file.is_some());
                Ok(Handoff { file, exit })
            }
        }
    }

    fn run(
        &self,
        uid: Option<Uid>,
        gid: Option<Gid>,
        op: &mut dyn FnMut() -> errors::Result<()>,
    ) -> errors::Result<ChildExit> {
        // UNSAFE(lucab): the child only runs `op` and then `_exit`s.
        match unsafe { fork() } {
            Err(e) => Err(os_error(errno::Errno(e as i32), "cannot fork child process")),
            Ok(ForkResult::Child) => {
                let code = child_status(|| {
                    identity::switch_identity(uid, gid)?;
                    op()
                });
                // UNSAFE(lucab): terminate the child without running any
                // of the parent's cleanup.
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                let exit = wait_child(child)?;
                debug!("child {} exited ({:?})", child, exit);
                Ok(exit)
            }
        }
    }
}

/// Exit status encoding `errno` for a child process.
///
/// Values which do not fit in one byte become `EXIT_ERRNO_OVERFLOW`.
pub fn exit_status_for(errno: i32) -> i32 {
    if errno & 0xff != errno {
        warn!("unable to pass desired return value {}", errno);
        return EXIT_ERRNO_OVERFLOW;
    }
    errno
}

/// Run the child side of an operation, turning its outcome into an exit status.
fn child_status<F>(body: F) -> i32
where
    F: FnOnce() -> errors::Result<()>,
{
    match panic::catch_unwind(panic::AssertUnwindSafe(body)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => exit_status_for(e.errno().unwrap_or(libc::EIO)),
        Err(_) => EXIT_ERRNO_OVERFLOW,
    }
}

/// Wait for `child` to terminate, restarting after `EINTR`.
fn wait_child(child: Pid) -> errors::Result<ChildExit> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, 0)) => return Ok(ChildExit::Success),
            Ok(WaitStatus::Exited(_, code)) => return Ok(ChildExit::Failed(code)),
            Ok(_) => return Ok(ChildExit::Abnormal),
            Err(NixErrno::EINTR) => continue,
            Err(e) => {
                return Err(os_error(
                    errno::Errno(e as i32),
                    format!("failed to wait for child process {}", child),
                ))
            }
        }
    }
}

/// Send the descriptor of `file` over `sock`.
fn send_fd(sock: &UnixStream, file: &fs::File) -> errors::Result<()> {
    // At least one byte of real data has to go along with the descriptor.
    let data = [0u8; 1];
    let iov = [io::IoSlice::new(&data)];
    let fds = [file.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];

    loop {
        match sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None) {
            Ok(_) => return Ok(()),
            Err(NixErrno::EINTR) => continue,
            Err(e) => {
                return Err(os_error(
                    errno::Errno(e as i32),
                    "child process failed to send fd to parent",
                ))
            }
        }
    }
}

/// Receive a descriptor from `sock`.
///
/// `None` means the peer went away without sending one.
fn recv_fd(sock: &UnixStream) -> errors::Result<Option<fs::File>> {
    let mut data = [0u8; 1];
    loop {
        let mut iov = [io::IoSliceMut::new(&mut data)];
        let mut cmsg_buffer = cmsg_space!([RawFd; 1]);
        let msg = match recvmsg::<()>(sock.as_raw_fd(), &mut iov, Some(&mut cmsg_buffer), recv_flags()) {
            Ok(m) => m,
            Err(NixErrno::EINTR) => continue,
            Err(e) => {
                return Err(os_error(
                    errno::Errno(e as i32),
                    "failed to receive fd from child process",
                ))
            }
        };

        let mut received = None;
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                for fd in fds {
                    // UNSAFE(lucab): descriptors were just installed by the
                    // kernel and are owned by nobody else.
                    let file = unsafe { fs::File::from_raw_fd(fd) };
                    if received.is_none() {
                        received = Some(file);
                    }
                }
            }
        }
        return Ok(received);
    }
}

#[cfg(target_os = "linux")]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(target_os = "linux"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}
