//! Vmattach sends diagnostic commands to a running virtual machine process knowing its ID, using
//! the dynamic attach mechanism of HotSpot-style VMs.
//!
//! ## Attach sequence
//!
//! The VM does not listen for diagnostic commands until asked to:
//!
//! * the client creates a trigger file named after the process at a known location
//! * it sends the `QUIT` signal to the process
//! * the VM notices the trigger file and opens a UNIX socket at a known location
//! * the client connects to the socket, writes a request made of NUL-terminated fields, and reads
//!   the textual response terminated by a result code line
//!
//! The target may live in another container: paths are resolved from the caller's point of view
//! through `/proc/<pid>/root` whenever the mount namespaces differ.
//!
//! ## Example
//!
//! ```no_run
//! let output = vmattach::attach_captured(4242, "jcmd", ["VM.version"])?;
//! println!("{}", output.output_lossy());
//! std::process::exit(output.code);
//! # Ok::<(), vmattach::AttachError>(())
//! ```

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

#[cfg(unix)]
pub mod attach;
pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;

#[cfg(unix)]
mod internal;
#[cfg(all(test, unix))]
mod testing;

#[cfg(unix)]
pub use attach::{attach, attach_captured, AttachOutput, Client};
pub use config::{AttachConfig, ProtocolSelection};
pub use error::AttachError;
pub use protocol::{AttachRequest, Command, ProtocolVariant};
