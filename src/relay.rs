//! Response side of the attach protocol.
//!
//! The listener streams its textual output and terminates it with a line holding the decimal
//! result code, then closes the connection. [`relay`] forwards the output to a sink as it
//! arrives, holding back only the current last line, which may turn out to be the result line.

use std::io::{ErrorKind, Write};

use futures::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::{AttachError, MalformedReason};

const CHUNK_SIZE: usize = 8192;
const MAX_REPORTED_LINE_LEN: usize = 80;

/// Splits a byte stream into the payload and its terminal line.
#[derive(Debug, Default)]
pub(crate) struct TerminalLineSplitter {
    pending: Vec<u8>,
    received: usize,
}

impl TerminalLineSplitter {
    /// Appends `chunk` and returns the bytes which can no longer be part of the terminal line.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        // Between two pushes, only the last pending byte may be a newline
        let previous_len = self.pending.len();
        self.received += chunk.len();
        self.pending.extend_from_slice(chunk);
        let Some(last) = self.pending.len().checked_sub(1) else {
            return Vec::new();
        };
        let split = self.pending[previous_len.min(last)..last]
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|pos| previous_len.min(last) + pos)
            .or_else(|| {
                let pos = previous_len.checked_sub(1)?;
                (pos < last && self.pending[pos] == b'\n').then_some(pos)
            });
        match split {
            Some(pos) => self.pending.drain(..=pos).collect(),
            None => Vec::new(),
        }
    }

    /// Parses the terminal line once the stream is over.
    ///
    /// On failure, the held-back bytes are returned along with the reason as they belong to the
    /// payload.
    pub(crate) fn finish(self) -> Result<i32, (Vec<u8>, MalformedReason)> {
        if self.received == 0 {
            return Err((Vec::new(), MalformedReason::Empty));
        }
        let line = self.pending.strip_suffix(b"\n").unwrap_or(&self.pending);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let parsed = std::str::from_utf8(line)
            .ok()
            .and_then(|line| line.trim_ascii().parse::<i32>().ok());
        match parsed {
            Some(code) => Ok(code),
            None => {
                let mut reported = String::from_utf8_lossy(line).into_owned();
                if reported.len() > MAX_REPORTED_LINE_LEN {
                    let mut end = MAX_REPORTED_LINE_LEN;
                    while !reported.is_char_boundary(end) {
                        end -= 1;
                    }
                    reported.truncate(end);
                    reported.push_str("...");
                }
                Err((self.pending, MalformedReason::InvalidResultLine(reported)))
            }
        }
    }
}

/// Streams the response from `reader` into `sink` and returns the result code.
///
/// Output written to the sink is never retracted: when the response turns out to be malformed,
/// the error is returned after all the received output was forwarded.
pub async fn relay<R, W>(mut reader: R, sink: &mut W) -> Result<i32, AttachError>
where
    R: AsyncRead + Unpin,
    W: Write + ?Sized,
{
    let mut splitter = TerminalLineSplitter::default();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let read = match reader.read(&mut buf).await {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
                ) =>
            {
                debug!("listener reset the connection: {err}");
                forward(sink, &splitter.pending)?;
                return Err(AttachError::malformed(MalformedReason::ConnectionReset));
            }
            Err(err) => return Err(AttachError::io("reading the response")(err)),
        };
        if read == 0 {
            break;
        }
        let ready = splitter.push(&buf[..read]);
        if !ready.is_empty() {
            forward(sink, &ready)?;
        }
    }

    match splitter.finish() {
        Ok(code) => Ok(code),
        Err((held_back, reason)) => {
            forward(sink, &held_back)?;
            Err(AttachError::malformed(reason))
        }
    }
}

fn forward<W: Write + ?Sized>(sink: &mut W, bytes: &[u8]) -> Result<(), AttachError> {
    if bytes.is_empty() {
        return Ok(());
    }
    sink.write_all(bytes)
        .and_then(|()| sink.flush())
        .map_err(AttachError::io("writing the response output"))
}
