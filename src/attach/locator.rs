//! Resolution of the paths through which a target process can be reached.
//!
//! The caller and the target do not necessarily share a filesystem view: the target may run in
//! another container. [`ProcfsLocator`] detects this and returns paths already prefixed with the
//! target's namespace root, so that nothing downstream has to care.

#[cfg(target_os = "linux")]
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

use crate::error::AttachError;

const DEFAULT_TMP_DIR: &str = "/tmp";
#[cfg(target_os = "linux")]
const PROCFS_ROOT: &str = "/proc";

/// A target process and the paths through which its attach listener is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProcess {
    pid: u32,
    ns_pid: u32,
    root: PathBuf,
    tmp_dir: PathBuf,
    cwd_dir: Option<PathBuf>,
    owner: Option<(u32, u32)>,
}

impl TargetProcess {
    /// A target sharing the caller's namespaces, with its temporary directory at `tmp_dir`.
    pub fn new(pid: u32, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            pid,
            ns_pid: pid,
            root: PathBuf::from("/"),
            tmp_dir: tmp_dir.into(),
            cwd_dir: None,
            owner: None,
        }
    }

    /// Sets the pid of the target as seen from its own pid namespace.
    pub fn with_ns_pid(mut self, ns_pid: u32) -> Self {
        self.ns_pid = ns_pid;
        self
    }

    /// Sets the namespace root of the target as seen by the caller.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Sets the working directory of the target, as seen by the caller.
    pub fn with_cwd_dir(mut self, cwd_dir: impl Into<PathBuf>) -> Self {
        self.cwd_dir = Some(cwd_dir.into());
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = Some((uid, gid));
        self
    }

    /// Pid of the target as seen by the caller, used for signalling.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Pid of the target in its own namespace, used in file names.
    pub fn ns_pid(&self) -> u32 {
        self.ns_pid
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Effective uid and gid of the target, when known.
    pub fn owner(&self) -> Option<(u32, u32)> {
        self.owner
    }

    /// Path of the listener socket.
    pub fn socket_path(&self) -> PathBuf {
        self.tmp_dir.join(format!(".java_pid{}", self.ns_pid))
    }

    /// Candidate trigger file paths, in order of preference.
    pub fn trigger_paths(&self) -> Vec<PathBuf> {
        let file_name = format!(".attach_pid{}", self.ns_pid);
        self.cwd_dir
            .iter()
            .chain(std::iter::once(&self.tmp_dir))
            .map(|dir| dir.join(&file_name))
            .collect()
    }
}

/// Resolves a process id into a [`TargetProcess`].
pub trait Locator {
    fn locate(&self, pid: u32) -> Result<TargetProcess, AttachError>;
}

impl<L: Locator + ?Sized> Locator for &L {
    fn locate(&self, pid: u32) -> Result<TargetProcess, AttachError> {
        (**self).locate(pid)
    }
}

/// Locator probing the operating system.
///
/// On Linux the process is inspected through `/proc`, and `/proc/<pid>/root` is used as path
/// prefix whenever the target lives in another mount namespace. Elsewhere the target is
/// assumed to share the caller's filesystem view.
#[derive(Debug, Clone)]
pub struct ProcfsLocator {
    tmp_override: Option<PathBuf>,
    #[cfg(target_os = "linux")]
    proc_root: PathBuf,
}

impl Default for ProcfsLocator {
    fn default() -> Self {
        Self {
            tmp_override: None,
            #[cfg(target_os = "linux")]
            proc_root: PathBuf::from(PROCFS_ROOT),
        }
    }
}

impl ProcfsLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `tmp_dir` verbatim as temporary directory of every target.
    pub fn with_tmp_dir(tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmp_override: Some(tmp_dir.into()),
            ..Self::default()
        }
    }

    /// Reads process information below `proc_root` instead of `/proc`.
    #[cfg(target_os = "linux")]
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }
}

impl Locator for ProcfsLocator {
    #[cfg(target_os = "linux")]
    fn locate(&self, pid: u32) -> Result<TargetProcess, AttachError> {
        let proc_dir = self.proc_root.join(pid.to_string());

        let status_path = proc_dir.join("status");
        let status = std::fs::read_to_string(&status_path)
            .map_err(|err| access_error(pid, status_path, err))?;
        let status = ProcStatus::parse(&status);

        let root = if same_namespace(&self.proc_root, pid, "mnt")? {
            PathBuf::from("/")
        } else {
            let root = proc_dir.join("root");
            std::fs::metadata(&root).map_err(|err| AttachError::NamespaceResolutionFailed {
                pid,
                reason: format!("{} is not accessible: {err}", root.display()),
            })?;
            root
        };
        if !same_namespace(&self.proc_root, pid, "pid")? {
            debug!(pid, ns_pid = ?status.ns_pid, "target runs in another pid namespace");
        }

        let tmp_dir = self.tmp_dir(pid, &root);
        let mut target = TargetProcess::new(pid, tmp_dir)
            .with_root(root)
            .with_ns_pid(status.ns_pid.unwrap_or(pid))
            .with_cwd_dir(proc_dir.join("cwd"));
        if let (Some(uid), Some(gid)) = (status.uid, status.gid) {
            target = target.with_owner(uid, gid);
        }
        debug!(?target, "target located");
        Ok(target)
    }

    #[cfg(not(target_os = "linux"))]
    fn locate(&self, pid: u32) -> Result<TargetProcess, AttachError> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            ProcessRefreshKind::nothing()
                .with_user(UpdateKind::Always)
                .with_cwd(UpdateKind::Always),
        );
        let process = system
            .process(Pid::from_u32(pid))
            .ok_or(AttachError::ProcessNotFound { pid })?;
        let root = PathBuf::from("/");
        let mut target = TargetProcess::new(pid, self.tmp_dir(pid, &root));
        if let Some(cwd) = process.cwd() {
            target = target.with_cwd_dir(cwd);
        }
        if let (Some(uid), Some(gid)) = (process.effective_user_id(), process.effective_group_id())
        {
            target = target.with_owner(**uid, *gid);
        }
        debug!(?target, "target located");
        Ok(target)
    }
}

impl ProcfsLocator {
    fn tmp_dir(&self, pid: u32, root: &Path) -> PathBuf {
        if let Some(tmp_dir) = &self.tmp_override {
            return tmp_dir.clone();
        }
        let reported = target_tmpdir_env(pid)
            .filter(|dir| dir.is_absolute())
            .map(|dir| reroot(root, &dir))
            .filter(|dir| dir.is_dir());
        reported.unwrap_or_else(|| reroot(root, Path::new(DEFAULT_TMP_DIR)))
    }
}

/// Value of `TMPDIR` in the environment of the target, if readable.
fn target_tmpdir_env(pid: u32) -> Option<PathBuf> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
        true,
        ProcessRefreshKind::nothing().with_environ(UpdateKind::Always),
    );
    let process = system.process(Pid::from_u32(pid))?;
    process.environ().iter().find_map(|var| {
        let var = var.to_str()?;
        let value = var.strip_prefix("TMPDIR=")?;
        (!value.is_empty()).then(|| PathBuf::from(value))
    })
}

/// `path` as seen from below `root`.
fn reroot(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(path),
    }
}

#[cfg(target_os = "linux")]
fn access_error(pid: u32, path: PathBuf, err: std::io::Error) -> AttachError {
    match err.kind() {
        ErrorKind::NotFound => AttachError::ProcessNotFound { pid },
        ErrorKind::PermissionDenied => AttachError::PermissionDenied {
            pid,
            path,
            source: err,
        },
        _ => AttachError::NamespaceResolutionFailed {
            pid,
            reason: format!("unable to read {}: {err}", path.display()),
        },
    }
}

/// Compares the caller's and the target's namespace of the given kind.
#[cfg(target_os = "linux")]
fn same_namespace(proc_root: &Path, pid: u32, kind: &str) -> Result<bool, AttachError> {
    let own = match std::fs::read_link(proc_root.join("self/ns").join(kind)) {
        Ok(own) => own,
        // Kernel without namespace support
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
        Err(err) => {
            return Err(AttachError::NamespaceResolutionFailed {
                pid,
                reason: format!("unable to read own {kind} namespace: {err}"),
            })
        }
    };
    let path = proc_root.join(format!("{pid}/ns/{kind}"));
    let theirs = std::fs::read_link(&path).map_err(|err| access_error(pid, path, err))?;
    Ok(own == theirs)
}

/// Fields of `/proc/<pid>/status` relevant to attaching.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, PartialEq, Eq)]
struct ProcStatus {
    uid: Option<u32>,
    gid: Option<u32>,
    ns_pid: Option<u32>,
}

#[cfg(target_os = "linux")]
impl ProcStatus {
    fn parse(status: &str) -> Self {
        let mut parsed = Self::default();
        for line in status.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let mut values = value.split_whitespace();
            match key {
                // Real, effective, saved and filesystem ids
                "Uid" => parsed.uid = values.nth(1).and_then(|v| v.parse().ok()),
                "Gid" => parsed.gid = values.nth(1).and_then(|v| v.parse().ok()),
                // Outermost to innermost namespace
                "NSpid" => parsed.ns_pid = values.last().and_then(|v| v.parse().ok()),
                _ => {}
            }
        }
        parsed
    }
}
