//! Unix attacher which sends a `QUIT` signal to the target.
//!
//! On receiving `QUIT`, the target looks for its trigger file and, when present, opens its
//! attach listener. Without the trigger file, the signal just prints a thread dump.

use nix::{
    sys::signal::{kill, Signal::SIGQUIT},
    unistd::Pid,
};
use tracing::debug;

use crate::{
    attach::{attacher::Attacher, locator::TargetProcess},
    error::AttachError,
};

/// UNIX attacher.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixAttacher;

impl Attacher for UnixAttacher {
    async fn notify(&self, target: &TargetProcess) -> Result<(), AttachError> {
        let pid = target.pid();
        let raw = i32::try_from(pid).map_err(|_| {
            AttachError::InvalidArgument(format!("process id {pid} is out of range"))
        })?;
        kill(Pid::from_raw(raw), SIGQUIT)
            .map_err(|source| AttachError::SignalDeliveryFailed { pid, source })?;
        debug!(pid, "QUIT signal sent");
        Ok(())
    }
}
