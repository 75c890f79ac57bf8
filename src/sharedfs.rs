//! Detection of shared filesystems.
//!
//! On shared (network or cluster) filesystems the identity used to access
//! a file can be remapped or restricted by the remote side, independently
//! of the local process credentials (e.g. root-squashing NFS servers).

use super::errors;
use std::path;

/// Classifies paths by the kind of filesystem they live on.
pub trait SharedFsClassifier {
    /// Whether `path` lives on a shared filesystem.
    ///
    /// An error means the answer could not be determined.
    fn is_shared_fs(&self, path: &path::Path) -> errors::Result<bool>;
}

/// Classifier based on the filesystem magic reported by `statfs(2)`.
///
/// Not-yet-existing paths are classified by their closest existing
/// ancestor. On platforms other than Linux nothing is considered shared.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatfsClassifier;

/// Classifier which never reports a shared filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverShared;

impl SharedFsClassifier for NeverShared {
    fn is_shared_fs(&self, _path: &path::Path) -> errors::Result<bool> {
        Ok(false)
    }
}

#[cfg(target_os = "linux")]
mod magic {
    pub const NFS_SUPER_MAGIC: i64 = 0x6969;
    pub const GFS2_MAGIC: i64 = 0x0116_1970;
    pub const OCFS2_SUPER_MAGIC: i64 = 0x7461_636f;
    pub const AFS_FS_MAGIC: i64 = 0x6B41_4653;

    pub const SHARED: [i64; 4] = [NFS_SUPER_MAGIC, GFS2_MAGIC, OCFS2_SUPER_MAGIC, AFS_FS_MAGIC];
}

/// Whether a `statfs(2)` filesystem magic denotes a shared filesystem.
#[cfg(target_os = "linux")]
pub fn is_shared_magic(fs_type: i64) -> bool {
    magic::SHARED.contains(&fs_type)
}

#[cfg(target_os = "linux")]
impl SharedFsClassifier for StatfsClassifier {
    fn is_shared_fs(&self, path: &path::Path) -> errors::Result<bool> {
        use super::errors::os_error;
        use errno;
        use libc;
        use nix::errno::Errno as NixErrno;
        use nix::sys::statfs::statfs;

        let mut dir = path.to_path_buf();
        loop {
            match statfs(dir.as_path()) {
                Ok(st) => {
                    let fs_type = st.filesystem_type().0 as i64;
                    debug!("'{}' is on filesystem 0x{:x}", dir.display(), fs_type);
                    return Ok(is_shared_magic(fs_type));
                }
                Err(NixErrno::ENOENT) => {
                    if !dir.pop() {
                        return Err(os_error(
                            errno::Errno(libc::ENOENT),
                            format!("cannot find an existing parent of '{}'", path.display()),
                        ));
                    }
                    if dir.as_os_str().is_empty() {
                        dir.push(".");
                    }
                }
                Err(e) => {
                    return Err(os_error(
                        errno::Errno(e as i32),
                        format!("cannot determine filesystem type of '{}'", dir.display()),
                    ))
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl SharedFsClassifier for StatfsClassifier {
    fn is_shared_fs(&self, _path: &path::Path) -> errors::Result<bool> {
        Ok(false)
    }
}
