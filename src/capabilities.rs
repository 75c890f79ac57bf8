//! Identity switching while retaining a set of POSIX capabilities.
//!
//! Capabilities are expressed as a bitmask, where bit `N` stands for the
//! capability with index `N` (e.g. bit 12 for `CAP_NET_ADMIN`).

use super::errors;
#[cfg(not(target_os = "linux"))]
use super::identity;
use nix::unistd::{Gid, Uid};

#[cfg(target_os = "linux")]
pub use self::linux::{caps_from_bits, supported_caps};

/// Set real and effective ids, while keeping the capabilities in `cap_bits`.
///
/// Held capabilities are cleared first if `clear_existing` is set, or if
/// switching to a non-root user. The capabilities needed to perform the
/// switch itself (`CAP_SETUID`, `CAP_SETGID`, `CAP_SETPCAP`) are added
/// temporarily when missing, and dropped again once done. When clearing,
/// the bounding set is restricted to `cap_bits` on a best-effort basis.
///
/// On platforms without capabilities support, this is a plain
/// `switch_identity` and both `cap_bits` and `clear_existing` are ignored.
#[cfg(target_os = "linux")]
pub fn switch_identity_with_caps(
    uid: Option<Uid>,
    gid: Option<Gid>,
    cap_bits: u64,
    clear_existing: bool,
) -> errors::Result<()> {
    linux::switch_with_caps(uid, gid, cap_bits, clear_existing)
}

/// Set real and effective ids, while keeping the capabilities in `cap_bits`.
///
/// On platforms without capabilities support, this is a plain
/// `switch_identity` and both `cap_bits` and `clear_existing` are ignored.
#[cfg(not(target_os = "linux"))]
pub fn switch_identity_with_caps(
    uid: Option<Uid>,
    gid: Option<Gid>,
    _cap_bits: u64,
    _clear_existing: bool,
) -> errors::Result<()> {
    identity::switch_identity(uid, gid)
}

#[cfg(target_os = "linux")]
mod linux {
    use super::super::errors::{self, context};
    use super::super::identity;
    use caps::{self, CapSet, Capability, CapsHashSet};
    use libc;
    use nix::unistd::{getuid, Gid, Uid};
    use std::sync::OnceLock;

    static SUPPORTED: OnceLock<CapsHashSet> = OnceLock::new();

    /// Capabilities known to the running kernel, detected once per process.
    pub fn supported_caps() -> &'static CapsHashSet {
        SUPPORTED.get_or_init(caps::runtime::thread_all_supported)
    }

    /// Supported capabilities whose bit is set in `bits`.
    pub fn caps_from_bits(bits: u64) -> CapsHashSet {
        supported_caps()
            .iter()
            .filter(|c| c.index() < 64 && bits & (1u64 << c.index()) != 0)
            .cloned()
            .collect()
    }

    /// In-memory capability state, applied to the thread on demand.
    struct CapState {
        effective: CapsHashSet,
        permitted: CapsHashSet,
        inheritable: CapsHashSet,
    }

    impl CapState {
        fn empty() -> Self {
            Self {
                effective: CapsHashSet::new(),
                permitted: CapsHashSet::new(),
                inheritable: CapsHashSet::new(),
            }
        }

        fn current() -> errors::Result<Self> {
            Ok(Self {
                effective: caps::read(None, CapSet::Effective)?,
                permitted: caps::read(None, CapSet::Permitted)?,
                inheritable: caps::read(None, CapSet::Inheritable)?,
            })
        }

        fn add_all(&mut self, wanted: &CapsHashSet) {
            for cap in wanted {
                self.effective.insert(*cap);
                self.permitted.insert(*cap);
                self.inheritable.insert(*cap);
            }
        }

        /// Add `cap` to effective and permitted sets, if not already effective.
        fn add_transient(&mut self, cap: Capability) -> bool {
            if self.effective.contains(&cap) {
                return false;
            }
            self.effective.insert(cap);
            self.permitted.insert(cap);
            true
        }

        fn drop_transient(&mut self, cap: Capability) {
            self.effective.remove(&cap);
            self.permitted.remove(&cap);
        }

        fn clear(&mut self) {
            self.effective.clear();
            self.permitted.clear();
            self.inheritable.clear();
        }

        fn apply(&self) -> errors::Result<()> {
            // Effective must stay a subset of permitted at each step.
            caps::set(None, CapSet::Effective, &self.effective)?;
            caps::set(None, CapSet::Permitted, &self.permitted)?;
            caps::set(None, CapSet::Inheritable, &self.inheritable)?;
            Ok(())
        }
    }

    fn set_keepcaps(keep: bool) -> errors::Result<()> {
        // UNSAFE(lucab): plain prctl, no memory involved.
        let r = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, keep as libc::c_ulong, 0, 0, 0) };
        if r != 0 {
            let op = if keep { "set" } else { "reset" };
            return Err(errors::last_os_error(format!("prctl failed to {} KEEPCAPS", op)));
        }
        Ok(())
    }

    /// Restrict the bounding set to `keep`.
    fn apply_bounding(keep: &CapsHashSet) -> errors::Result<()> {
        // A uid change clears the effective set, even with KEEPCAPS.
        caps::raise(None, CapSet::Effective, Capability::CAP_SETPCAP)?;
        for cap in supported_caps() {
            if keep.contains(cap) {
                continue;
            }
            caps::drop(None, CapSet::Bounding, *cap)?;
        }
        Ok(())
    }

    /// Apply `state`, then switch identity, with KEEPCAPS already set.
    fn apply_and_switch(
        state: &mut CapState,
        uid: Option<Uid>,
        gid: Option<Gid>,
        clear_existing: bool,
        need_ids: bool,
    ) -> errors::Result<()> {
        if let Err(e) = state.apply() {
            // Unprivileged callers may be starting some setuid helper: let it
            // acquire its capabilities on its own.
            if !getuid().is_root() && clear_existing && !need_ids {
                debug!("cannot apply capabilities ({}), continuing without", e);
                state.clear();
            } else {
                return Err(context(e, "cannot apply process capabilities"));
            }
        }
        identity::switch_identity(uid, gid)
    }

    pub(super) fn switch_with_caps(
        uid: Option<Uid>,
        gid: Option<Gid>,
        cap_bits: u64,
        clear_existing: bool,
    ) -> errors::Result<()> {
        let wanted = caps_from_bits(cap_bits);
        let clear = clear_existing || uid.map_or(false, |u| !u.is_root());

        let mut state = if clear {
            CapState::empty()
        } else {
            CapState::current()?
        };
        state.add_all(&wanted);

        let need_setgid = gid.is_some() && state.add_transient(Capability::CAP_SETGID);
        let need_setuid = uid.is_some() && state.add_transient(Capability::CAP_SETUID);
        // Changing the bounding set needs CAP_SETPCAP as well.
        let need_setpcap =
            (cap_bits != 0 || need_setgid || need_setuid) && state.add_transient(Capability::CAP_SETPCAP);

        set_keepcaps(true)?;
        let switched = apply_and_switch(&mut state, uid, gid, clear_existing, need_setuid || need_setgid);
        // Reverted on failures too.
        let reset = set_keepcaps(false);
        switched?;
        reset?;

        // Bounding set can only be changed while CAP_SETPCAP is still held.
        if clear {
            if let Err(e) = apply_bounding(&wanted) {
                warn!("cannot restrict capabilities bounding set: {}", e);
            }
        }

        if need_setgid {
            state.drop_transient(Capability::CAP_SETGID);
        }
        if need_setuid {
            state.drop_transient(Capability::CAP_SETUID);
        }
        if need_setpcap {
            state.drop_transient(Capability::CAP_SETPCAP);
        }
        state
            .apply()
            .map_err(|e| context(e, "cannot apply process capabilities"))
    }
}
