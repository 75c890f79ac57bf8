//! User and group identities, and switching the process to them.

use super::errors::{self, os_error};
use errno;
use libc;
use nix::unistd::{getgid, getuid, Gid, Group, Uid, User};
use std::fmt;

/// A target user/group pair.
///
/// A `None` component stands for "unchanged": when resolved, it is
/// replaced by the real id of the calling process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    /// Target user id.
    pub uid: Option<Uid>,
    /// Target group id.
    pub gid: Option<Gid>,
}

impl Identity {
    /// Identity with both ids set.
    pub fn new(uid: Uid, gid: Gid) -> Self {
        Self {
            uid: Some(uid),
            gid: Some(gid),
        }
    }

    /// Identity leaving both ids unchanged.
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Real ids of the calling process.
    pub fn current() -> Self {
        Self::new(getuid(), getgid())
    }

    /// Concrete ids, with unset components taken from the calling process.
    pub fn resolve(&self) -> (Uid, Gid) {
        (self.uid.unwrap_or_else(getuid), self.gid.unwrap_or_else(getgid))
    }

    /// Whether this resolves to the real ids of the calling process.
    pub fn is_current(&self) -> bool {
        self.resolve() == (getuid(), getgid())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (uid, gid) = self.resolve();
        write!(f, "{}:{}", uid, gid)
    }
}

/// Set the real and effective group and user ids of the process.
///
/// When switching user, supplementary groups are initialized from the
/// account database entry for `uid`. The group is always changed first,
/// as the privilege to do so is usually lost with the user switch.
/// A `None` id is left unchanged.
pub fn switch_identity(uid: Option<Uid>, gid: Option<Gid>) -> errors::Result<()> {
    if let Some(gid) = gid {
        // UNSAFE(lucab): plain syscall, no memory involved.
        if unsafe { libc::setregid(gid.as_raw(), gid.as_raw()) } < 0 {
            return Err(errors::last_os_error(format!("cannot change to '{}' group", gid)));
        }
    }

    if let Some(uid) = uid {
        init_groups(uid)?;
        // UNSAFE(lucab): plain syscall, no memory involved.
        if unsafe { libc::setreuid(uid.as_raw(), uid.as_raw()) } < 0 {
            return Err(errors::last_os_error(format!("cannot change uid to '{}'", uid)));
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn init_groups(uid: Uid) -> errors::Result<()> {
    use nix::unistd::initgroups;
    use std::ffi::CString;

    let user = User::from_uid(uid)
        .map_err(|e| os_error(errno::Errno(e as i32), format!("cannot getpwuid_r({})", uid)))?
        .ok_or_else(|| {
            os_error(
                errno::Errno(libc::EINVAL),
                format!("getpwuid_r failed to retrieve data for uid '{}'", uid),
            )
        })?;
    let name = CString::new(user.name.as_str()).map_err(|_| {
        os_error(
            errno::Errno(libc::EINVAL),
            format!("invalid user name for uid '{}'", uid),
        )
    })?;

    initgroups(&name, user.gid).map_err(|e| {
        os_error(
            errno::Errno(e as i32),
            format!("cannot initgroups(\"{}\", {})", user.name, user.gid),
        )
    })
}

#[cfg(not(target_os = "linux"))]
fn init_groups(uid: Uid) -> errors::Result<()> {
    debug!("supplementary groups not initialized for uid {}", uid);
    Ok(())
}

/// Resolve a user name to its id.
///
/// Names which are not known are accepted if they are numeric, and a
/// leading `+` forces the numeric interpretation.
pub fn user_id(user: &str) -> errors::Result<Uid> {
    if !user.starts_with('+') {
        let found = User::from_name(user).map_err(|e| {
            os_error(
                errno::Errno(e as i32),
                format!("cannot getpwnam_r(\"{}\")", user),
            )
        })?;
        if let Some(u) = found {
            return Ok(u.uid);
        }
    }

    let digits = user.strip_prefix('+').unwrap_or(user);
    digits
        .parse::<libc::uid_t>()
        .map(Uid::from_raw)
        .map_err(|_| os_error(errno::Errno(libc::EINVAL), format!("failed to parse user '{}'", user)))
}

/// Resolve a group name to its id.
///
/// Names which are not known are accepted if they are numeric, and a
/// leading `+` forces the numeric interpretation.
pub fn group_id(group: &str) -> errors::Result<Gid> {
    if !group.starts_with('+') {
        let found = Group::from_name(group).map_err(|e| {
            os_error(
                errno::Errno(e as i32),
                format!("cannot getgrnam_r(\"{}\")", group),
            )
        })?;
        if let Some(g) = found {
            return Ok(g.gid);
        }
    }

    let digits = group.strip_prefix('+').unwrap_or(group);
    digits
        .parse::<libc::gid_t>()
        .map(Gid::from_raw)
        .map_err(|_| os_error(errno::Errno(libc::EINVAL), format!("failed to parse group '{}'", group)))
}

/// Account name for `uid`.
pub fn user_name(uid: Uid) -> errors::Result<String> {
    User::from_uid(uid)
        .map_err(|e| os_error(errno::Errno(e as i32), format!("cannot getpwuid_r({})", uid)))?
        .map(|u| u.name)
        .ok_or_else(|| {
            os_error(
                errno::Errno(libc::ENOENT),
                format!("failed to find user record for uid '{}'", uid),
            )
        })
}

/// Group name for `gid`.
pub fn group_name(gid: Gid) -> errors::Result<String> {
    Group::from_gid(gid)
        .map_err(|e| os_error(errno::Errno(e as i32), format!("cannot getgrgid_r({})", gid)))?
        .map(|g| g.name)
        .ok_or_else(|| {
            os_error(
                errno::Errno(libc::ENOENT),
                format!("failed to find group record for gid '{}'", gid),
            )
        })
}
