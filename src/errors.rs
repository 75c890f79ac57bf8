//! Error handling.

#[cfg(target_os = "linux")]
use caps;
use errno;
use libc;
use nix;
use std::{ffi, io};

error_chain!{
    errors {
        /// Syscall error, as `errno(3)`.
        Sys(errno: errno::Errno) {
            description("syscall failed")
            display("{}", errno)
        }

        /// System operation failed on a named object, as `errno(3)`
        /// plus a human-readable context.
        Os(errno: errno::Errno, msg: String) {
            description("system operation failed")
            display("{}: {}", msg, errno)
        }

        /// Operation is not implemented on this platform.
        Unsupported(op: String) {
            description("operation not supported on this platform")
            display("{} is not supported on this platform", op)
        }
    }

    // doc attributes are required to workaround
    // https://github.com/rust-lang-nursery/error-chain/issues/63
    foreign_links {
        Io(io::Error) #[doc = "I/O error."];
        Linux(nix::Error) #[doc = "Linux syscall error."];
        NulChar(ffi::NulError) #[doc = "NULL byte in conversion to C string."];
        Caps(caps::errors::CapsError) #[doc = "Capabilities error."] #[cfg(target_os = "linux")];
    }
}

impl Error {
    /// OS error number carried by this error, if any.
    ///
    /// Platform-unsupported operations report `ENOSYS`.
    pub fn errno(&self) -> Option<i32> {
        match *self.kind() {
            ErrorKind::Sys(eno) | ErrorKind::Os(eno, _) => Some(eno.0),
            ErrorKind::Unsupported(_) => Some(libc::ENOSYS),
            ErrorKind::Io(ref e) => e.raw_os_error(),
            ErrorKind::Linux(e) => Some(e as i32),
            _ => None,
        }
    }
}

/// Build a structured OS error for `eno`, with context.
pub(crate) fn os_error<S: Into<String>>(eno: errno::Errno, msg: S) -> Error {
    ErrorKind::Os(eno, msg.into()).into()
}

/// Build a structured OS error from the current `errno`, with context.
pub(crate) fn last_os_error<S: Into<String>>(msg: S) -> Error {
    os_error(errno::errno(), msg)
}

/// Errno behind an `io::Error`, `EIO` if it did not come from the OS.
pub(crate) fn io_errno(err: &io::Error) -> errno::Errno {
    errno::Errno(err.raw_os_error().unwrap_or(libc::EIO))
}

/// Attach context to `err`, keeping its OS error number if it has one.
pub(crate) fn context<S: Into<String>>(err: Error, msg: S) -> Error {
    match err.errno() {
        Some(eno) => os_error(errno::Errno(eno), msg),
        None => {
            let msg = msg.into();
            err.chain_err(|| msg)
        }
    }
}
