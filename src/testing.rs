//! Test doubles of a target process and its attach listener.

use std::{
    future::Future,
    io,
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use async_io::{Async, Timer};
use async_signal::{Signal, Signals};
use futures::{select, AsyncReadExt, AsyncWriteExt, FutureExt, StreamExt};

use crate::{
    attach::{
        attacher::Attacher,
        locator::{Locator, TargetProcess},
    },
    error::AttachError,
    protocol::{decode_request, DecodedRequest},
};

pub(crate) fn run_with_timeout<T, F>(job: F) -> Result<T, Box<dyn std::error::Error>>
where
    F: Future<Output = Result<T, Box<dyn std::error::Error>>>,
{
    let mut exec = futures::executor::LocalPool::new();

    let res = exec.run_until(async {
        let timeout = FutureExt::then(Timer::after(Duration::from_secs(10)), async |_| {
            Err("Test timeout".into())
        });

        select! {
            a = job.fuse() => a,
            b = timeout.fuse() => b,
        }
    });

    exec.run();

    res
}

/// What the mock listener does once it has read a request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Bytes(Vec<u8>),
    /// Closes the connection without writing anything.
    Close,
}

impl Reply {
    pub(crate) fn bytes(bytes: impl AsRef<[u8]>) -> Self {
        Reply::Bytes(bytes.as_ref().to_vec())
    }
}

/// Attach listener serving one connection per scripted reply, in a background thread.
pub(crate) struct MockListener {
    handle: JoinHandle<io::Result<Vec<DecodedRequest>>>,
}

impl MockListener {
    /// Binds `path` immediately.
    pub(crate) fn bind(path: &Path, replies: Vec<Reply>) -> io::Result<Self> {
        let listener = Async::<UnixListener>::bind(path)?;
        let handle = std::thread::spawn(move || async_io::block_on(serve(listener, replies)));
        Ok(Self { handle })
    }

    /// Waits for all the replies to be served and returns the requests received.
    pub(crate) fn join(self) -> Vec<DecodedRequest> {
        self.handle
            .join()
            .expect("mock listener panicked")
            .expect("mock listener failed")
    }
}

async fn serve(
    listener: Async<UnixListener>,
    replies: Vec<Reply>,
) -> io::Result<Vec<DecodedRequest>> {
    let mut requests = Vec::new();
    for reply in replies {
        let (mut stream, _) = listener.accept().await?;
        requests.push(read_request(&mut stream).await?);
        if let Reply::Bytes(bytes) = reply {
            stream.write_all(&bytes).await?;
        }
    }
    Ok(requests)
}

async fn read_request(stream: &mut Async<UnixStream>) -> io::Result<DecodedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(request) = decode_request(&buf).map_err(io::Error::other)? {
            return Ok(request);
        }
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}

/// Attacher opening a [`MockListener`] on the target's socket when notified.
pub(crate) struct ListeningAttacher {
    replies: Vec<Reply>,
    listener: Mutex<Option<MockListener>>,
    notifications: AtomicUsize,
}

impl ListeningAttacher {
    pub(crate) fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies,
            listener: Mutex::new(None),
            notifications: AtomicUsize::new(0),
        }
    }

    pub(crate) fn notifications(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }

    pub(crate) fn join(self) -> Vec<DecodedRequest> {
        self.listener
            .into_inner()
            .expect("poisoned listener")
            .map(MockListener::join)
            .unwrap_or_default()
    }
}

impl Attacher for ListeningAttacher {
    async fn notify(&self, target: &TargetProcess) -> Result<(), AttachError> {
        assert!(
            target.trigger_paths().iter().any(|path| path.exists()),
            "notified without a trigger file"
        );
        self.notifications.fetch_add(1, Ordering::SeqCst);
        let listener = MockListener::bind(&target.socket_path(), self.replies.clone())
            .map_err(AttachError::io("binding the mock listener"))?;
        *self.listener.lock().expect("poisoned listener") = Some(listener);
        Ok(())
    }
}

/// Simulated virtual machine running in the test process.
///
/// Like a real one, it opens its listener when it receives `QUIT` while its trigger file
/// exists.
pub(crate) struct FakeVm {
    handle: JoinHandle<io::Result<Vec<DecodedRequest>>>,
}

impl FakeVm {
    pub(crate) fn start(target: &TargetProcess, replies: Vec<Reply>) -> io::Result<Self> {
        // Registered before returning so that no QUIT reaches the default disposition
        let signals = Signals::new([Signal::Quit])?;
        let trigger_paths = target.trigger_paths();
        let socket_path = target.socket_path();
        let handle = std::thread::spawn(move || {
            async_io::block_on(async move {
                wait_for_trigger(signals, &trigger_paths).await?;
                let listener = Async::<UnixListener>::bind(&socket_path)?;
                serve(listener, replies).await
            })
        });
        Ok(Self { handle })
    }

    pub(crate) fn join(self) -> Vec<DecodedRequest> {
        self.handle
            .join()
            .expect("fake vm panicked")
            .expect("fake vm failed")
    }
}

async fn wait_for_trigger(mut signals: Signals, trigger_paths: &[PathBuf]) -> io::Result<()> {
    let mut timeout = FutureExt::fuse(Timer::after(Duration::from_secs(5)));
    loop {
        select! {
            signal = signals.next().fuse() => {
                if let Some(Ok(Signal::Quit)) = signal {
                    if trigger_paths.iter().any(|path| path.exists()) {
                        return Ok(());
                    }
                }
            }
            _ = timeout => {
                return Err(io::ErrorKind::TimedOut.into());
            }
        }
    }
}

/// Locator returning a fixed target.
pub(crate) struct StaticLocator(pub(crate) TargetProcess);

impl Locator for StaticLocator {
    fn locate(&self, pid: u32) -> Result<TargetProcess, AttachError> {
        assert_eq!(pid, self.0.pid());
        Ok(self.0.clone())
    }
}

/// Fails the test if anything is located.
pub(crate) struct PanickingLocator;

impl Locator for PanickingLocator {
    fn locate(&self, pid: u32) -> Result<TargetProcess, AttachError> {
        panic!("process {pid} should not be located");
    }
}
