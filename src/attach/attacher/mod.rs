//! Wake-up notification of a target process.
//!
//! Once the trigger file exists, the target has to be told to look at it. The default attacher
//! depends on the platform.

pub mod dummy;
#[cfg(unix)]
pub mod unix;

use std::future::Future;

use crate::{attach::locator::TargetProcess, error::AttachError};

#[cfg(unix)]
pub use unix::UnixAttacher as DefaultAttacher;

/// Attacher abstraction.
pub trait Attacher {
    /// Notifies the target once that a trigger file is waiting for it.
    ///
    /// Failing to deliver the notification means the target cannot be attached to, typically
    /// because it has exited.
    fn notify(&self, target: &TargetProcess) -> impl Future<Output = Result<(), AttachError>>;
}
