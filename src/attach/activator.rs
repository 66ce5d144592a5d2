//! Makes sure the target runs its attach listener.
//!
//! The target opens its listener lazily: it has to find a trigger file and be notified. The
//! activator creates the trigger file, notifies the target once, waits a bounded time for the
//! listener socket to accept connections and removes the trigger file whatever the outcome.

use std::{io::ErrorKind, os::unix::fs::FileTypeExt, path::Path};

use async_io::Timer;
use nix::unistd::geteuid;
use tracing::{debug, info, warn};

use crate::{
    attach::{attacher::Attacher, channel::AttachChannel, locator::TargetProcess},
    config::AttachConfig,
    error::AttachError,
    internal::{TriggerClaim, TriggerFile},
};

pub struct Activator<'a, A> {
    attacher: &'a A,
    config: &'a AttachConfig,
}

impl<'a, A> Activator<'a, A>
where
    A: Attacher,
{
    pub fn new(attacher: &'a A, config: &'a AttachConfig) -> Self {
        Self { attacher, config }
    }

    /// Returns a channel to the listener of `target`, triggering the listener if necessary.
    pub async fn activate(&self, target: &TargetProcess) -> Result<AttachChannel, AttachError> {
        let socket = target.socket_path();

        if is_socket(&socket) {
            match AttachChannel::connect(&socket, self.config.connect_timeout()).await {
                Ok(channel) => {
                    debug!(pid = target.pid(), "attach listener already running");
                    return Ok(channel);
                }
                Err(err) => debug!(pid = target.pid(), "existing listener socket is dead: {err}"),
            }
        }

        let claim = self.claim_trigger(target)?;
        match &claim {
            TriggerClaim::Created(file) => {
                debug!(path = %file.path().display(), "trigger file created");
                self.align_owner(file, target);
                self.attacher.notify(target).await?;
            }
            TriggerClaim::Busy(path) => {
                info!(
                    pid = target.pid(),
                    path = %path.display(),
                    "another attach is triggering the target, waiting for it"
                );
            }
        }

        let res = self.wait_for_listener(target, &socket).await;
        drop(claim);
        res
    }

    fn claim_trigger(&self, target: &TargetProcess) -> Result<TriggerClaim, AttachError> {
        let stale_after = self
            .config
            .poll_ceiling()
            .saturating_add(self.config.connect_timeout());
        let mut last_err = None;
        for path in target.trigger_paths() {
            match TriggerFile::claim(path.clone(), stale_after) {
                Ok(claim) => return Ok(claim),
                Err(err) => {
                    debug!(path = %path.display(), "unable to create trigger file: {err}");
                    last_err = Some((path, err));
                }
            }
        }
        Err(match last_err {
            Some((path, err)) if err.kind() == ErrorKind::PermissionDenied => {
                AttachError::PermissionDenied {
                    pid: target.pid(),
                    path,
                    source: err,
                }
            }
            Some((_, err)) => AttachError::io("creating the trigger file")(err),
            None => AttachError::InvalidArgument("no trigger file location".to_owned()),
        })
    }

    /// Hands the trigger file over to the target's owner, which only trusts its own files.
    fn align_owner(&self, file: &TriggerFile, target: &TargetProcess) {
        let Some((uid, gid)) = target.owner() else {
            return;
        };
        if !geteuid().is_root() || geteuid().as_raw() == uid {
            return;
        }
        if let Err(err) = file.chown(uid, gid) {
            warn!(path = %file.path().display(), "unable to chown trigger file: {err}");
        }
    }

    async fn wait_for_listener(
        &self,
        target: &TargetProcess,
        socket: &Path,
    ) -> Result<AttachChannel, AttachError> {
        let mut last_err = None;
        for attempt in 1..=self.config.poll_attempts {
            Timer::after(self.config.poll_interval()).await;
            if !is_socket(socket) {
                continue;
            }
            match AttachChannel::connect(socket, self.config.connect_timeout()).await {
                Ok(channel) => {
                    debug!(pid = target.pid(), attempt, "attach listener is up");
                    return Ok(channel);
                }
                Err(err) => last_err = Some(err),
            }
        }
        // A socket which is there but never accepted tells more than a timeout
        Err(last_err.unwrap_or_else(|| AttachError::ListenerTimeout {
            pid: target.pid(),
            socket: socket.to_owned(),
            waited: self.config.poll_ceiling(),
        }))
    }
}

fn is_socket(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|metadata| metadata.file_type().is_socket())
}
