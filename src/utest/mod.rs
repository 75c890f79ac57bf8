mod device;
mod executor;
mod identity;
mod worker;

use super::executor::Executor;
use super::identity::user_name;
use super::worker::{ChildExit, ForkWorker, Worker};
use nix::unistd::{getuid, AccessFlags, Gid, Uid};
use std::{env, io};

use std::io::Write;

fn skipping(reason: &str) {
    let out = io::stdout();
    writeln!(out.lock(), "{}, skipping.", reason).ok();
}

/// Whether tests run as root, as needed to switch identity.
fn is_root() -> bool {
    if !getuid().is_root() {
        skipping("Not running as root");
        false
    } else {
        true
    }
}

const NOBODY: u32 = 65534;

/// Run `body` without privileges: in-process when not root, otherwise in
/// a child running as `nobody`.
fn unprivileged<F: FnOnce()>(body: F) {
    if !getuid().is_root() {
        return body();
    }

    let uid = Some(Uid::from_raw(NOBODY));
    let gid = Some(Gid::from_raw(NOBODY));
    if user_name(Uid::from_raw(NOBODY)).is_err() {
        return skipping("No account for uid 65534");
    }
    let scratch = AccessFlags::W_OK | AccessFlags::X_OK;
    if Executor::new().access_as(env::temp_dir(), scratch, uid, gid).is_err() {
        return skipping("Temporary directory not writable by uid 65534");
    }

    let mut body = Some(body);
    let mut op = || -> super::errors::Result<()> {
        if let Some(f) = body.take() {
            f();
        }
        Ok(())
    };
    let exit = ForkWorker.run(uid, gid, &mut op).unwrap();
    assert_eq!(exit, ChildExit::Success);
}
