//! Effective credentials alignment with the target.
//!
//! A listener only accepts peers running with its own effective uid and gid. A root caller
//! temporarily takes the identity of the target's owner.

use nix::unistd::{getegid, geteuid, setegid, seteuid, Gid, Uid};
use tracing::{debug, warn};

use crate::{attach::locator::TargetProcess, error::AttachError};

/// Identity borrowed from the target's owner, given back on drop.
///
/// Effective ids are process-wide: other threads run with the target's identity while this
/// guard lives.
#[derive(Debug)]
pub(crate) struct Impersonation {
    euid: Uid,
    egid: Gid,
}

impl Impersonation {
    /// Takes the identity of the target's owner if needed, returning `None` when the caller
    /// already is in a position to talk to the target.
    pub(crate) fn assume(target: &TargetProcess) -> Result<Option<Self>, AttachError> {
        let Some((uid, gid)) = target.owner() else {
            return Ok(None);
        };
        let euid = geteuid();
        let egid = getegid();
        if !euid.is_root() || euid.as_raw() == uid {
            return Ok(None);
        }

        let denied = |errno: nix::Error| AttachError::PermissionDenied {
            pid: target.pid(),
            path: target.socket_path(),
            source: errno.into(),
        };
        setegid(Gid::from_raw(gid)).map_err(denied)?;
        if let Err(errno) = seteuid(Uid::from_raw(uid)) {
            if let Err(err) = setegid(egid) {
                warn!("unable to restore effective gid {egid}: {err}");
            }
            return Err(denied(errno));
        }
        debug!(uid, gid, "switched to the target's effective identity");
        Ok(Some(Self { euid, egid }))
    }
}

impl Drop for Impersonation {
    fn drop(&mut self) {
        // Back to root first, changing the gid requires it
        if let Err(err) = seteuid(self.euid) {
            warn!("unable to restore effective uid {}: {err}", self.euid);
        }
        if let Err(err) = setegid(self.egid) {
            warn!("unable to restore effective gid {}: {err}", self.egid);
        }
    }
}
