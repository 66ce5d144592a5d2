//! Dummy attacher which notifies nobody.

use crate::{
    attach::{attacher::Attacher, locator::TargetProcess},
    error::AttachError,
};

/// Dummy attacher.
///
/// It does nothing, which is enough when the listener of the target is known to be running
/// already, or when something else takes care of waking the target up.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyAttacher;

impl Attacher for DummyAttacher {
    async fn notify(&self, _target: &TargetProcess) -> Result<(), AttachError> {
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::DummyAttacher;
    use crate::{
        attach::{attacher::Attacher, locator::TargetProcess},
        testing::run_with_timeout,
    };

    #[test]
    fn test_dummy_attacher() {
        run_with_timeout(async {
            // Nobody has this pid, yet notifying succeeds
            DummyAttacher
                .notify(&TargetProcess::new(0x7fff_fff0, "/tmp"))
                .await?;
            Ok::<_, Box<dyn std::error::Error>>(())
        })
        .unwrap();
    }
}
