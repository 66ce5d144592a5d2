//! Connection to an attach listener.

use std::{
    io::{ErrorKind, Write},
    net::Shutdown,
    path::{Path, PathBuf},
    pin::pin,
    time::Duration,
};

use async_io::Timer;
use async_net::unix::UnixStream;
use futures::{select, AsyncWriteExt, FutureExt};

use crate::{
    error::{AttachError, ConnectFailure, MalformedReason},
    relay::relay,
};

/// An open connection to a listener, owned by a single request.
///
/// Both directions are shut down when the channel is dropped.
#[derive(Debug)]
pub struct AttachChannel {
    stream: UnixStream,
    path: PathBuf,
}

impl AttachChannel {
    /// Connects to the listener socket at `path`, giving up after `timeout`.
    ///
    /// A missing socket and a socket which does not accept the connection are reported as
    /// different [`ConnectFailure`]s.
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self, AttachError> {
        let failed = |reason| AttachError::ConnectFailed {
            path: path.to_owned(),
            reason,
        };

        match std::fs::symlink_metadata(path) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(failed(ConnectFailure::Missing))
            }
            Err(err) => return Err(failed(ConnectFailure::Io(err))),
        }

        let mut connect = pin!(UnixStream::connect(path).fuse());
        let mut timer = Timer::after(timeout).fuse();
        let stream = select! {
            res = connect => match res {
                Ok(stream) => stream,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(failed(ConnectFailure::Missing))
                }
                Err(err) => return Err(failed(ConnectFailure::Io(err))),
            },
            _ = timer => return Err(failed(ConnectFailure::TimedOut(timeout))),
        };

        Ok(Self {
            stream,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a whole request frame.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), AttachError> {
        let res = async {
            self.stream.write_all(frame).await?;
            self.stream.flush().await
        }
        .await;
        res.map_err(|err| match err.kind() {
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                AttachError::malformed(MalformedReason::ConnectionReset)
            }
            _ => AttachError::io("sending the request")(err),
        })
    }

    /// Relays the whole response into `sink` and returns the result code.
    pub async fn receive<W>(mut self, sink: &mut W) -> Result<i32, AttachError>
    where
        W: Write + ?Sized,
    {
        relay(&mut self.stream, sink).await
    }
}

impl Drop for AttachChannel {
    fn drop(&mut self) {
        // The peer may have closed already
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
