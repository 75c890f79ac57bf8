//! Filesystem operations on behalf of other users, and FC/NPIV discovery.
//!
//! This library performs file opens, access checks and directory creation
//! as a given user and group, forking a child which switches identity
//! when the calling process' own credentials are not honored (e.g. by a
//! root-squashing NFS server). It also offers the process identity and
//! capability switching primitives behind that, and discovery of
//! Fibre-Channel host adapters and their NPIV virtual ports via sysfs.

#![deny(missing_docs)]

#[cfg(target_os = "linux")]
extern crate caps;
extern crate errno;
#[macro_use]
extern crate error_chain;
extern crate libc;
#[macro_use]
extern crate log;
extern crate memmap2;
#[macro_use]
extern crate nix;
extern crate openat;
#[cfg(test)]
extern crate tempfile;

pub mod capabilities;
pub mod device;
pub mod errors;
pub mod executor;
pub mod fchost;
pub mod fileutil;
pub mod identity;
pub mod safeio;
pub mod sharedfs;
pub mod worker;

pub use self::capabilities::switch_identity_with_caps;
pub use self::executor::{access_as, create_dir_as, open_as, DirPolicy, Executor, OpenPolicy};
pub use self::identity::{switch_identity, Identity};

#[cfg(test)]
mod utest;
