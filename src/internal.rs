use std::{
    fs::OpenOptions,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, warn};

/// Outcome of an attempt to create a trigger file.
#[derive(Debug)]
pub enum TriggerClaim {
    /// This invocation created the file and must signal the target.
    Created(TriggerFile),
    /// Another invocation is already triggering the target.
    Busy(PathBuf),
}

/// Trigger file created by this invocation, removed on drop.
#[derive(Debug)]
pub struct TriggerFile(PathBuf);

impl TriggerFile {
    /// Creates `path` exclusively.
    ///
    /// An existing file older than `stale_after` is left over by an invocation which did not
    /// clean up and is replaced.
    pub fn claim(path: PathBuf, stale_after: Duration) -> std::io::Result<TriggerClaim> {
        match create_new(&path) {
            Ok(()) => Ok(TriggerClaim::Created(Self(path))),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if !is_stale(&path, stale_after)? {
                    return Ok(TriggerClaim::Busy(path));
                }
                debug!(path = %path.display(), "replacing stale trigger file");
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                }
                match create_new(&path) {
                    Ok(()) => Ok(TriggerClaim::Created(Self(path))),
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                        Ok(TriggerClaim::Busy(path))
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    #[cfg(unix)]
    pub fn chown(&self, uid: u32, gid: u32) -> Result<(), nix::Error> {
        nix::unistd::chown(
            &self.0,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
    }
}

impl Drop for TriggerFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => debug!(path = %self.0.display(), "trigger file removed"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.0.display(), "unable to remove trigger file: {err}"),
        }
    }
}

fn create_new(path: &Path) -> std::io::Result<()> {
    OpenOptions::new().write(true).create_new(true).open(path)?;
    Ok(())
}

fn is_stale(path: &Path, stale_after: Duration) -> std::io::Result<bool> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        // Removed in the meantime, the owner is done with it
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(err),
    };
    Ok(metadata
        .modified()?
        .elapsed()
        .is_ok_and(|age| age > stale_after))
}
