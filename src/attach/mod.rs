//! Sub-module where all attaching APIs are located.
//!
//! A [`Client`] runs one attach exchange per call: it [locates](locator) the target, makes
//! sure its listener runs ([`activator`]), opens a [channel](channel) to it, sends the
//! request framed with the right [`ProtocolVariant`] and relays the response.

pub mod activator;
pub mod attacher;
pub mod channel;
mod credentials;
pub mod locator;

use std::{borrow::Cow, io::Write};

use tracing::{debug, info};

use crate::{
    attach::{
        activator::Activator,
        attacher::{Attacher, DefaultAttacher},
        credentials::Impersonation,
        locator::{Locator, ProcfsLocator, TargetProcess},
    },
    config::AttachConfig,
    error::AttachError,
    protocol::{AttachRequest, Command, ProtocolVariant},
};

/// Command answering the highest frame version the listener understands.
const VERSION_PROBE: &str = "getversion";

/// Outcome of a captured attach exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOutput {
    /// Result code reported by the target, `0` meaning success.
    pub code: i32,
    /// Everything the target wrote before its result line.
    pub output: Vec<u8>,
}

impl AttachOutput {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    pub fn output_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }
}

/// Attach client.
///
/// The locator and the attacher are pluggable, the defaults being the ones suitable for the
/// current platform.
#[derive(Debug, Clone)]
pub struct Client<L = ProcfsLocator, A = DefaultAttacher> {
    locator: L,
    attacher: A,
    config: AttachConfig,
}

impl Client {
    pub fn new(config: AttachConfig) -> Self {
        let locator = match &config.tmp_dir {
            Some(tmp_dir) => ProcfsLocator::with_tmp_dir(tmp_dir),
            None => ProcfsLocator::new(),
        };
        Self::with_parts(locator, DefaultAttacher::default(), config)
    }

    /// Client configured from the `VMATTACH_*` environment variables.
    pub fn from_env() -> Result<Self, AttachError> {
        Ok(Self::new(AttachConfig::from_env()?))
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(AttachConfig::default())
    }
}

impl<L, A> Client<L, A>
where
    L: Locator,
    A: Attacher,
{
    pub fn with_parts(locator: L, attacher: A, config: AttachConfig) -> Self {
        Self {
            locator,
            attacher,
            config,
        }
    }

    pub fn config(&self) -> &AttachConfig {
        &self.config
    }

    /// Sends `request` to process `pid` and relays the output into `sink`.
    ///
    /// Returns the result code reported by the target, whatever its value. An error means
    /// that no result code could be obtained.
    pub async fn execute<W>(
        &self,
        pid: i32,
        request: &AttachRequest,
        sink: &mut W,
    ) -> Result<i32, AttachError>
    where
        W: Write + ?Sized,
    {
        let pid = u32::try_from(pid)
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| AttachError::InvalidArgument(format!("invalid process id {pid}")))?;
        let forced = self.config.protocol.forced();
        if let Some(variant) = forced {
            request.check(variant)?;
        }

        let target = self.locator.locate(pid)?;
        let _impersonation = if self.config.impersonate_target {
            Impersonation::assume(&target)?
        } else {
            None
        };

        let activator = Activator::new(&self.attacher, &self.config);
        let mut channel = activator.activate(&target).await?;

        let variant = match forced {
            Some(variant) => variant,
            None if request.fits(ProtocolVariant::Legacy) => ProtocolVariant::Legacy,
            None => {
                let variant = self.probe_variant(channel).await?;
                if variant == ProtocolVariant::Legacy {
                    // Too large for this listener, nothing left to do with a channel
                    request.check(variant)?;
                }
                channel = activator.activate(&target).await?;
                variant
            }
        };
        debug!(pid, %variant, command = %request.command(), "sending request");

        channel.send(&request.encode(variant)?).await?;
        let code = channel.receive(sink).await?;
        info!(pid, command = %request.command(), code, "attach request completed");
        Ok(code)
    }

    /// Asks the listener which frame variants it understands.
    async fn probe_variant(
        &self,
        mut channel: channel::AttachChannel,
    ) -> Result<ProtocolVariant, AttachError> {
        let probe = AttachRequest::new(VERSION_PROBE, Vec::<String>::new())?;
        channel.send(&probe.encode(ProtocolVariant::Legacy)?).await?;
        let mut output = Vec::new();
        let code = channel.receive(&mut output).await?;

        let version = (code == 0)
            .then(|| {
                String::from_utf8_lossy(&output)
                    .lines()
                    .next()
                    .and_then(|line| line.trim().parse::<u32>().ok())
            })
            .flatten();
        let variant = version
            .and_then(ProtocolVariant::from_version)
            .unwrap_or(ProtocolVariant::Legacy);
        debug!(code, ?version, %variant, "listener version probed");
        Ok(variant)
    }

    /// Blocking attach relaying the target's output to the standard output.
    pub fn attach<C, I, S>(&self, pid: i32, command: C, args: I) -> Result<i32, AttachError>
    where
        C: Into<Command>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = AttachRequest::new(command, args)?;
        async_io::block_on(self.execute(pid, &request, &mut std::io::stdout()))
    }

    /// Blocking attach capturing the target's output.
    pub fn attach_captured<C, I, S>(
        &self,
        pid: i32,
        command: C,
        args: I,
    ) -> Result<AttachOutput, AttachError>
    where
        C: Into<Command>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = AttachRequest::new(command, args)?;
        let mut output = Vec::new();
        let code = async_io::block_on(self.execute(pid, &request, &mut output))?;
        Ok(AttachOutput { code, output })
    }

    /// Resolves `pid` without attaching to it.
    pub fn locate(&self, pid: u32) -> Result<TargetProcess, AttachError> {
        self.locator.locate(pid)
    }
}

/// Sends `command` to process `pid` and relays its output to the standard output.
///
/// The client is configured from the environment, see [`AttachConfig::from_env`].
pub fn attach<C, I, S>(pid: i32, command: C, args: I) -> Result<i32, AttachError>
where
    C: Into<Command>,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Client::from_env()?.attach(pid, command, args)
}

/// Sends `command` to process `pid` and returns its output along with the result code.
pub fn attach_captured<C, I, S>(pid: i32, command: C, args: I) -> Result<AttachOutput, AttachError>
where
    C: Into<Command>,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Client::from_env()?.attach_captured(pid, command, args)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::path::Path;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        attach::attacher::{
            dummy::DummyAttacher,
            tests::{CountingAttacher, PanickingAttacher},
            unix::UnixAttacher,
        },
        config::ProtocolSelection,
        error::MalformedReason,
        testing::{
            run_with_timeout, FakeVm, ListeningAttacher, MockListener, PanickingLocator, Reply,
            StaticLocator,
        },
    };

    fn fast_config() -> AttachConfig {
        AttachConfig {
            poll_attempts: 50,
            poll_interval_ms: 10,
            connect_timeout_ms: 500,
            ..AttachConfig::default()
        }
    }

    fn own_target(dir: &Path) -> TargetProcess {
        TargetProcess::new(std::process::id(), dir)
    }

    fn own_pid() -> i32 {
        std::process::id() as i32
    }

    #[test]
    fn test_captured_payload_and_code() {
        let dir = tempfile::tempdir().unwrap();
        let target = own_target(dir.path());
        let listener = MockListener::bind(
            &target.socket_path(),
            vec![Reply::bytes("hello\n0\n")],
        )
        .unwrap();
        let client = Client::with_parts(StaticLocator(target), PanickingAttacher, fast_config());

        let output = client
            .attach_captured(own_pid(), "properties", Vec::<String>::new())
            .unwrap();
        assert_eq!(
            output,
            AttachOutput {
                code: 0,
                output: b"hello\n".to_vec()
            }
        );
        assert!(output.is_success());
        assert_eq!(output.output_lossy(), "hello\n");

        let requests = listener.join();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].variant, ProtocolVariant::Legacy);
        assert_eq!(requests[0].command, Command::Properties);
    }

    #[test]
    fn test_target_failure_is_returned_as_data() {
        let dir = tempfile::tempdir().unwrap();
        let target = own_target(dir.path());
        let listener = MockListener::bind(
            &target.socket_path(),
            vec![Reply::bytes("Operation foo not recognized!\n-1\n")],
        )
        .unwrap();
        let client = Client::with_parts(StaticLocator(target), PanickingAttacher, fast_config());

        let output = client.attach_captured(own_pid(), "foo", ["bar"]).unwrap();
        assert_eq!(output.code, -1);
        assert!(!output.is_success());
        assert_eq!(output.output_lossy(), "Operation foo not recognized!\n");

        let requests = listener.join();
        assert_eq!(requests[0].command, Command::Custom("foo".to_owned()));
        assert_eq!(requests[0].args, ["bar"]);
    }

    #[test]
    fn test_closed_without_response() {
        let dir = tempfile::tempdir().unwrap();
        let target = own_target(dir.path());
        let listener = MockListener::bind(&target.socket_path(), vec![Reply::Close]).unwrap();
        let client = Client::with_parts(StaticLocator(target), PanickingAttacher, fast_config());

        let res = client.attach_captured(own_pid(), "threaddump", Vec::<String>::new());
        assert_matches!(
            res,
            Err(AttachError::MalformedResponse {
                reason: MalformedReason::Empty
            })
        );
        listener.join();
    }

    #[test]
    fn test_listener_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let target = own_target(dir.path());
        let trigger = dir.path().join(format!(".attach_pid{}", std::process::id()));
        let client = Client::with_parts(
            StaticLocator(target),
            DummyAttacher,
            AttachConfig {
                poll_attempts: 10,
                ..fast_config()
            },
        );

        let res = client.attach_captured(own_pid(), "properties", Vec::<String>::new());
        assert_matches!(res, Err(AttachError::ListenerTimeout { .. }));
        assert!(!trigger.exists());
    }

    #[test]
    fn test_invalid_pid_touches_nothing() {
        let client = Client::with_parts(PanickingLocator, PanickingAttacher, fast_config());
        for pid in [0, -1, i32::MIN] {
            assert_matches!(
                client.attach_captured(pid, "properties", Vec::<String>::new()),
                Err(AttachError::InvalidArgument(_))
            );
        }
    }

    #[test]
    fn test_forced_legacy_rejects_before_io() {
        let client = Client::with_parts(
            PanickingLocator,
            PanickingAttacher,
            AttachConfig {
                protocol: ProtocolSelection::Legacy,
                ..fast_config()
            },
        );
        assert_matches!(
            client.attach_captured(own_pid(), "load", ["a", "b", "c", "d"]),
            Err(AttachError::InvalidArgument(_))
        );
    }

    #[test]
    fn test_forced_extended() {
        let dir = tempfile::tempdir().unwrap();
        let target = own_target(dir.path());
        let listener =
            MockListener::bind(&target.socket_path(), vec![Reply::bytes("0\n")]).unwrap();
        let client = Client::with_parts(
            StaticLocator(target),
            PanickingAttacher,
            AttachConfig {
                protocol: ProtocolSelection::Extended,
                ..fast_config()
            },
        );

        let output = client.attach_captured(own_pid(), "properties", Vec::<String>::new());
        assert_matches!(output, Ok(AttachOutput { code: 0, .. }));
        assert_eq!(listener.join()[0].variant, ProtocolVariant::Extended);
    }

    #[test]
    fn test_probe_selects_extended() {
        let dir = tempfile::tempdir().unwrap();
        let target = own_target(dir.path());
        let listener = MockListener::bind(
            &target.socket_path(),
            vec![Reply::bytes("2\n0\n"), Reply::bytes("loaded\n0\n")],
        )
        .unwrap();
        let client = Client::with_parts(StaticLocator(target), PanickingAttacher, fast_config());

        let output = client
            .attach_captured(own_pid(), "load", ["agent", "false", "opts", "extra"])
            .unwrap();
        assert_eq!(output.code, 0);
        assert_eq!(output.output_lossy(), "loaded\n");

        let requests = listener.join();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].variant, ProtocolVariant::Legacy);
        assert_eq!(requests[0].command, Command::from(VERSION_PROBE));
        assert_eq!(requests[1].variant, ProtocolVariant::Extended);
        assert_eq!(requests[1].args, ["agent", "false", "opts", "extra"]);
    }

    #[test]
    fn test_probe_of_legacy_listener() {
        let dir = tempfile::tempdir().unwrap();
        let target = own_target(dir.path());
        let listener = MockListener::bind(
            &target.socket_path(),
            vec![Reply::bytes("Operation getversion not recognized!\n1\n")],
        )
        .unwrap();
        let client = Client::with_parts(StaticLocator(target), PanickingAttacher, fast_config());

        assert_matches!(
            client.attach_captured(own_pid(), "load", ["agent", "false", "opts", "extra"]),
            Err(AttachError::InvalidArgument(_))
        );
        // Only the probe reached the listener
        assert_eq!(listener.join().len(), 1);
    }

    #[test]
    fn test_triggered_listener() {
        let dir = tempfile::tempdir().unwrap();
        let target = own_target(dir.path());
        let attacher = ListeningAttacher::new(vec![Reply::bytes("a\nb\n0\n")]);
        let client = Client::with_parts(StaticLocator(target), attacher, fast_config());

        let output = client
            .attach_captured(own_pid(), "jcmd", ["VM.version", "-all"])
            .unwrap();
        assert_eq!(output.output, b"a\nb\n");

        let Client { attacher, .. } = client;
        assert_eq!(attacher.notifications(), 1);
        let requests = attacher.join();
        assert_eq!(requests[0].command, Command::Jcmd);
        assert_eq!(requests[0].args, ["VM.version -all"]);
    }

    #[test]
    fn test_execute_into_writer() {
        let dir = tempfile::tempdir().unwrap();
        let target = own_target(dir.path());
        let listener =
            MockListener::bind(&target.socket_path(), vec![Reply::bytes("x = 1\n0\n")]).unwrap();
        let attacher = CountingAttacher::default();
        let client = Client::with_parts(StaticLocator(target), attacher.clone(), fast_config());

        let mut sink = Vec::new();
        let code = run_with_timeout(async {
            let request = AttachRequest::new(Command::Properties, Vec::<String>::new())?;
            Ok::<_, Box<dyn std::error::Error>>(
                client.execute(own_pid(), &request, &mut sink).await?,
            )
        })
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(sink, b"x = 1\n");
        assert_eq!(attacher.count(), 0);
        listener.join();
    }

    #[test]
    fn test_attach_own_process() {
        let _guard = crate::tests::ATTACH_PROCESS_TEST_MUTEX
            .lock()
            .unwrap_or_else(|err| err.into_inner());

        let dir = tempfile::tempdir().unwrap();
        let target = own_target(dir.path());
        let vm = FakeVm::start(&target, vec![Reply::bytes("VM ready\n0\n")]).unwrap();
        let client = Client::with_parts(StaticLocator(target.clone()), UnixAttacher, fast_config());

        let output = client
            .attach_captured(own_pid(), "properties", Vec::<String>::new())
            .unwrap();
        assert_eq!(output.code, 0);
        assert_eq!(output.output_lossy(), "VM ready\n");
        assert_eq!(vm.join().len(), 1);
        assert!(!target.trigger_paths().iter().any(|path| path.exists()));
    }
}
