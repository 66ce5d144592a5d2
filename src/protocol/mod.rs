//! Request side of the attach wire protocol.
//!
//! A request is a sequence of NUL-terminated fields: the protocol version token, the command
//! name, then the arguments. Two framings exist, see [`ProtocolVariant`]; the one in use is
//! chosen once per connection and never mixed with the command semantics.

use std::{convert::Infallible, fmt, str::FromStr};

mod codec;

pub use codec::AttachRequest;
#[cfg(test)]
pub(crate) use codec::{decode_request, DecodedRequest};

/// Command understood by the attach listener.
///
/// The listener alone interprets the arguments; the client only checks that they fit in the
/// frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Loads a native or Java agent.
    Load,
    /// Prints all thread stack traces.
    ThreadDump,
    /// Dumps the heap to a file.
    DumpHeap,
    /// Prints a heap histogram.
    InspectHeap,
    /// Prints a heap and thread summary.
    DataDump,
    Properties,
    AgentProperties,
    /// Sets a manageable VM flag.
    SetFlag,
    PrintFlag,
    /// Runs an arbitrary diagnostic command line.
    Jcmd,
    /// Any other command name, forwarded verbatim.
    Custom(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::Load => "load",
            Command::ThreadDump => "threaddump",
            Command::DumpHeap => "dumpheap",
            Command::InspectHeap => "inspectheap",
            Command::DataDump => "datadump",
            Command::Properties => "properties",
            Command::AgentProperties => "agentProperties",
            Command::SetFlag => "setflag",
            Command::PrintFlag => "printflag",
            Command::Jcmd => "jcmd",
            Command::Custom(name) => name,
        }
    }
}

impl From<&str> for Command {
    fn from(name: &str) -> Self {
        match name {
            "load" => Command::Load,
            "threaddump" => Command::ThreadDump,
            "dumpheap" => Command::DumpHeap,
            "inspectheap" => Command::InspectHeap,
            "datadump" => Command::DataDump,
            "properties" => Command::Properties,
            "agentProperties" => Command::AgentProperties,
            "setflag" => Command::SetFlag,
            "printflag" => Command::PrintFlag,
            "jcmd" => Command::Jcmd,
            other => Command::Custom(other.to_owned()),
        }
    }
}

impl From<String> for Command {
    fn from(name: String) -> Self {
        match Command::from(name.as_str()) {
            Command::Custom(_) => Command::Custom(name),
            known => known,
        }
    }
}

impl FromStr for Command {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.into())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire framing spoken by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    /// Version `1`: a fixed number of argument slots, padded with empty fields.
    Legacy,
    /// Version `2`: a length-prefixed body carrying a variable number of arguments.
    Extended,
}

impl ProtocolVariant {
    pub const LEGACY_MAX_ARGS: usize = 3;
    pub const LEGACY_MAX_NAME_LEN: usize = 16;
    pub const LEGACY_MAX_ARG_LEN: usize = 1024;
    pub const EXTENDED_MAX_ARGS: usize = 16;
    pub const EXTENDED_MAX_BODY_LEN: usize = 256 * 1024;

    pub fn version_token(self) -> &'static str {
        match self {
            ProtocolVariant::Legacy => "1",
            ProtocolVariant::Extended => "2",
        }
    }

    pub fn max_args(self) -> usize {
        match self {
            ProtocolVariant::Legacy => Self::LEGACY_MAX_ARGS,
            ProtocolVariant::Extended => Self::EXTENDED_MAX_ARGS,
        }
    }

    pub(crate) fn from_version(version: u32) -> Option<Self> {
        match version {
            1 => Some(ProtocolVariant::Legacy),
            v if v >= 2 => Some(ProtocolVariant::Extended),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVariant::Legacy => f.write_str("legacy"),
            ProtocolVariant::Extended => f.write_str("extended"),
        }
    }
}
