use super::super::identity::{self, Identity};
use super::is_root;
use libc;
use nix::unistd::{getgid, getuid, Gid, Uid};

#[test]
fn test_identity_resolve() {
    let unchanged = Identity::unchanged();
    assert_eq!(unchanged.resolve(), (getuid(), getgid()));
    assert!(unchanged.is_current());
    assert_eq!(Identity::current(), Identity::new(getuid(), getgid()));

    let other = Identity {
        uid: Some(Uid::from_raw(getuid().as_raw().wrapping_add(1))),
        gid: None,
    };
    assert!(!other.is_current());
    assert_eq!(other.resolve().1, getgid());
    assert_eq!(
        Identity::new(Uid::from_raw(107), Gid::from_raw(108)).to_string(),
        "107:108"
    );
}

#[test]
fn test_user_lookup() {
    assert_eq!(identity::user_id("root").unwrap(), Uid::from_raw(0));
    assert_eq!(identity::user_id("+0").unwrap(), Uid::from_raw(0));
    assert_eq!(identity::user_id("+4000000").unwrap(), Uid::from_raw(4_000_000));
    assert_eq!(identity::user_name(Uid::from_raw(0)).unwrap(), "root");

    let e = identity::user_id("no such user").unwrap_err();
    assert_eq!(e.errno(), Some(libc::EINVAL));
    let e = identity::user_id("+root").unwrap_err();
    assert_eq!(e.errno(), Some(libc::EINVAL));
}

#[test]
fn test_group_lookup() {
    assert_eq!(identity::group_id("+0").unwrap(), Gid::from_raw(0));
    assert_eq!(identity::group_id("4000000").unwrap(), Gid::from_raw(4_000_000));
    let root_group = identity::group_name(Gid::from_raw(0)).unwrap();
    assert_eq!(identity::group_id(&root_group).unwrap(), Gid::from_raw(0));

    let e = identity::group_id("no such group").unwrap_err();
    assert_eq!(e.errno(), Some(libc::EINVAL));
}

#[test]
fn test_switch_unchanged() {
    identity::switch_identity(None, None).unwrap();
    assert_eq!((getuid(), getgid()), Identity::current().resolve());
}

#[test]
fn test_switch_same_ids() {
    if !is_root() {
        return;
    }

    // Root to root keeps every privilege.
    identity::switch_identity(Some(Uid::from_raw(0)), Some(Gid::from_raw(0))).unwrap();
    assert!(getuid().is_root());
}
