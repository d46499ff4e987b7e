//! One scenario, end to end.
//!
//! A run serves a fresh export from the binary under test, points its
//! mirror at a fault endpoint, and then checks what the binary did:
//!
//! ```text
//! serve ──► control socket up ──► bind endpoint ──► `mirror ip port`
//!                                                        │
//!                                     `break` or SIGTERM after the hello
//!                                                        │
//!        verdict ◄── terminal state ◄── diagnostics ◄── endpoint self-check
//! ```
//!
//! Harness plumbing failures come back as [`ScenarioError::Harness`] and
//! abort the run; everything else is a verdict on the binary.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
    time::Duration,
};

use mirrorfault_core::{
    Acceptor, ControlClient, ControlFraming, ControlReply, EndpointConfig, Expectation, Fault,
    FaultEndpoint, FaultError, FaultScenario, Milestones, ReplyCheck, ScriptReport, TcpTransport,
    TerminalState, deadline_after, run_bounded, run_fault,
};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};

use crate::{
    command::ServerCommand,
    error::{Result, ScenarioError},
    process::{Exit, ProcessHandle, SIGTERM},
};

/// Environment variable carrying the per-request time limit, in seconds.
pub const REQUEST_LIMIT_ENV: &str = "FLEXNBD_MS_REQUEST_LIMIT_SECS";

/// Bytes written and read back by the local service check.
pub const SERVICE_PATTERN: &[u8; 8] = b"12345678";

const SOCKET_POLL: Duration = Duration::from_millis(100);

/// Settings for one scenario run. Built per scenario, never global.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Server binary under test.
    pub binary: PathBuf,
    /// Address everything binds to.
    pub ip: IpAddr,
    /// Request time limit handed to the server through its environment.
    pub request_limit: Duration,
    /// Size of the served export.
    pub export_size: u64,
    /// Fault endpoint limits.
    pub endpoint: EndpointConfig,
    /// How long the control socket may take to appear.
    pub startup_timeout: Duration,
    /// How long the server may take to exit when it is expected to.
    pub exit_timeout: Duration,
    /// How long to wait for an expected diagnostic.
    pub diagnostic_timeout: Duration,
    /// How long one control command may take.
    pub control_timeout: Duration,
    /// How far past its request limit the server may abandon a request.
    pub abort_slack: Duration,
    /// Layout of control commands on the socket.
    pub control_framing: ControlFraming,
    /// Seed for the export contents.
    pub seed: u64,
}

impl ScenarioConfig {
    /// Defaults for `binary` with a 4 second request limit.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        let request_limit = Duration::from_secs(4);
        Self {
            binary: binary.into(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            request_limit,
            export_size: 4096,
            endpoint: EndpointConfig::outlasting(request_limit),
            startup_timeout: Duration::from_secs(5),
            exit_timeout: Duration::from_secs(10),
            diagnostic_timeout: Duration::from_secs(5),
            control_timeout: request_limit + Duration::from_secs(5),
            abort_slack: Duration::from_secs(2),
            control_framing: ControlFraming::default(),
            seed: 0x6d69_7272_6f72,
        }
    }

    /// Same settings with a different request limit.
    ///
    /// Endpoint stalls and the control timeout are stretched to outlast it.
    pub fn with_request_limit(self, request_limit: Duration) -> Self {
        Self {
            request_limit,
            endpoint: EndpointConfig::outlasting(request_limit),
            control_timeout: request_limit + Duration::from_secs(5),
            ..self
        }
    }

    /// Same settings with a different control framing.
    pub fn with_control_framing(self, control_framing: ControlFraming) -> Self {
        Self { control_framing, ..self }
    }

    /// Longest a server may hold on to a withheld reply.
    pub fn abort_allowance(&self) -> Duration {
        self.request_limit + self.abort_slack
    }

    /// Value of [`REQUEST_LIMIT_ENV`] for the child.
    pub fn request_limit_value(&self) -> String {
        format!("{:.1}", self.request_limit.as_secs_f64())
    }

    fn script_budget(&self) -> Duration {
        let e = &self.endpoint;
        e.accept_timeout * 2 + e.stall_limit + e.request_timeout + e.close_timeout * 2
    }
}

/// A running server with its export and control socket.
pub struct ServedExport {
    /// The server process.
    pub process: ProcessHandle,
    /// Port it serves on.
    pub port: u16,
    /// Client for its control socket.
    pub control: ControlClient,
    /// Export contents as written before the server started.
    pub contents: Vec<u8>,
    dir: TempDir,
}

impl ServedExport {
    /// Backing file of the export.
    pub fn file_path(&self) -> PathBuf {
        self.dir.path().join("export")
    }

    /// Control socket path.
    pub fn socket_path(&self) -> &Path {
        self.control.path()
    }
}

/// What a passing scenario observed.
#[derive(Debug)]
pub struct ScenarioOutcome {
    /// Scenario name.
    pub scenario: &'static str,
    /// Reply to the `mirror` command.
    pub reply: ControlReply,
    /// Destination-side report.
    pub report: ScriptReport,
    /// Per-exchange self-check.
    pub checks: Vec<ReplyCheck>,
    /// How the server ended.
    pub exit: Exit,
}

struct Destination {
    port: u16,
    task: Option<JoinHandle<mirrorfault_core::Result<ScriptReport>>>,
    handshake: oneshot::Receiver<()>,
}

impl Drop for Destination {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            tracing::debug!(port = self.port, "abandoning fault endpoint");
            task.abort();
        }
    }
}

/// Runs catalogued scenarios against one server binary.
pub struct ScenarioRunner {
    config: ScenarioConfig,
    command: ServerCommand,
}

impl ScenarioRunner {
    /// Runner for `config.binary`, detecting its verbosity flag.
    pub async fn new(config: ScenarioConfig) -> Result<Self> {
        let command = ServerCommand::detect(&config.binary, config.startup_timeout).await?;
        Ok(Self { config, command })
    }

    /// Runner with an already built command.
    pub fn with_command(config: ScenarioConfig, command: ServerCommand) -> Self {
        Self { config, command }
    }

    /// Settings in use.
    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// Command builder in use.
    pub fn command(&self) -> &ServerCommand {
        &self.command
    }

    /// Serve a fresh export; the process must end in `expected`.
    pub async fn serve(&self, expected: TerminalState) -> Result<ServedExport> {
        let dir = tempfile::tempdir()
            .map_err(|e| ScenarioError::harness("creating scratch directory", e))?;
        let file = dir.path().join("export");
        let sock = dir.path().join("ctrl");

        let contents = export_contents(self.config.seed, self.config.export_size)?;
        tokio::fs::write(&file, &contents)
            .await
            .map_err(|e| ScenarioError::harness("writing backing file", e))?;

        let port = free_port(self.config.ip).await?;
        let mut command = self.command.serve(self.config.ip, port, &file, &sock, &[]);
        command.env(REQUEST_LIMIT_ENV, self.config.request_limit_value());

        let mut process = ProcessHandle::spawn(command, expected)?;
        wait_for_socket(&mut process, &sock, self.config.startup_timeout).await?;
        tracing::info!(port, sock = %sock.display(), "export served");

        let control = ControlClient::new(sock, self.config.control_timeout)
            .with_framing(self.config.control_framing);
        Ok(ServedExport { process, port, control, contents, dir })
    }

    /// Run one scenario to its verdict.
    pub async fn run(&self, scenario: &FaultScenario) -> Result<ScenarioOutcome> {
        let expected = scenario.expect.terminal;
        tracing::info!(scenario = scenario.name, %expected, "scenario starting");
        let mut served = self.serve(expected).await?;
        let mut destination = self.start_destination(scenario.fault).await?;

        let reply = served
            .control
            .mirror(&self.config.ip.to_string(), destination.port)
            .await
            .map_err(|e| ScenarioError::harness("triggering mirror", e))?;
        tracing::info!(code = %reply.code, message = %reply.message, "mirror triggered");

        match scenario.fault {
            Fault::CancelAfterHandshake => {
                self.await_handshake(&mut destination).await?;
                let reply = served
                    .control
                    .cancel()
                    .await
                    .map_err(|e| ScenarioError::harness("cancelling mirror", e))?;
                accepted("break", reply)?;
                tracing::info!("mirror cancelled");
            },
            Fault::TerminateAfterHandshake => {
                self.await_handshake(&mut destination).await?;
                served.process.signal(SIGTERM).await?;
            },
            _ => {},
        }

        let report = self.join_destination(destination.task.take()).await?;
        let checks = self_check(scenario, &report)?;
        check_abort_time(scenario, &report, self.config.abort_allowance())?;
        self.check_diagnostics(&scenario.expect, &reply, &mut served.process).await?;

        if expected == TerminalState::Aborted {
            self.verify_local_service(&served).await?;
        }
        let exit = served.process.finish(self.config.exit_timeout).await?;

        tracing::info!(scenario = scenario.name, %exit, "scenario passed");
        Ok(ScenarioOutcome { scenario: scenario.name, reply, report, checks, exit })
    }

    /// Run every catalogued scenario.
    ///
    /// A verdict failure is recorded and the next scenario runs; a harness
    /// failure stops the whole run.
    pub async fn run_catalogue(&self) -> Result<Vec<(&'static str, Result<ScenarioOutcome>)>> {
        let mut results = Vec::new();
        for scenario in FaultScenario::all() {
            match self.run(scenario).await {
                Err(e) if e.is_harness() => {
                    tracing::error!(scenario = scenario.name, error = %e, "harness failure");
                    return Err(e);
                },
                Err(e) => {
                    tracing::warn!(scenario = scenario.name, error = %e, "scenario failed");
                    results.push((scenario.name, Err(e)));
                },
                Ok(outcome) => results.push((scenario.name, Ok(outcome))),
            }
        }
        Ok(results)
    }

    /// Replace the access list of `served`; the server must accept it.
    pub async fn configure_acl(
        &self,
        served: &ServedExport,
        entries: &[&str],
    ) -> Result<ControlReply> {
        let reply = served
            .control
            .acl(entries)
            .await
            .map_err(|e| ScenarioError::harness("updating access list", e))?;
        let reply = accepted("acl", reply)?;
        tracing::info!(?entries, message = %reply.message, "access list updated");
        Ok(reply)
    }

    /// Check that `served` still answers locally with its original data and
    /// takes a write.
    pub async fn verify_local_service(&self, served: &ServedExport) -> Result<()> {
        let addr = SocketAddr::new(self.config.ip, served.port).to_string();
        let mut source = FaultEndpoint::connect(&TcpTransport, &addr, self.config.endpoint)
            .await
            .map_err(unavailable)?;

        let hello = source
            .read_hello(deadline_after(self.config.endpoint.hello_timeout))
            .await
            .map_err(unavailable)?;
        if !hello.is_accepting() || hello.export_size != served.contents.len() as u64 {
            return Err(ScenarioError::ServiceUnavailable {
                reason: format!(
                    "handshake magic {:02x?} size {}, expected size {}",
                    hello.magic,
                    hello.export_size,
                    served.contents.len()
                ),
            });
        }

        let len = served.contents.len().min(SERVICE_PATTERN.len());
        let before = source.read_at(0, len as u32).await.map_err(unavailable)?;
        if before[..] != served.contents[..len] {
            return Err(ScenarioError::ServiceUnavailable {
                reason: "export contents changed".to_string(),
            });
        }

        source.write_at(0, &SERVICE_PATTERN[..len]).await.map_err(unavailable)?;
        let after = source.read_at(0, len as u32).await.map_err(unavailable)?;
        if after[..] != SERVICE_PATTERN[..len] {
            return Err(ScenarioError::ServiceUnavailable {
                reason: "write did not read back".to_string(),
            });
        }

        source.disconnect().await.map_err(unavailable)?;
        tracing::info!("local service intact");
        Ok(())
    }

    async fn start_destination(&self, fault: Fault) -> Result<Destination> {
        let (milestones, handshake) = Milestones::with_handshake();

        if fault == Fault::RefuseConnection {
            let port = free_port(self.config.ip).await?;
            tracing::info!(port, "destination refuses connections");
            return Ok(Destination { port, task: None, handshake });
        }

        let addr = SocketAddr::new(self.config.ip, 0).to_string();
        let mut acceptor = Acceptor::bind(TcpTransport, &addr, self.config.endpoint)
            .await
            .map_err(|e| ScenarioError::harness("binding fault endpoint", e))?;
        let port = acceptor
            .local_addr()
            .map_err(|e| ScenarioError::harness("binding fault endpoint", e))?
            .port();

        let export_size = self.config.export_size;
        let task = tokio::spawn(async move {
            run_fault(&mut acceptor, fault, export_size, milestones).await
        });
        tracing::info!(port, ?fault, "destination listening");
        Ok(Destination { port, task: Some(task), handshake })
    }

    async fn await_handshake(&self, destination: &mut Destination) -> Result<()> {
        let handshake = &mut destination.handshake;
        let limit = self.config.endpoint.accept_timeout;
        run_bounded(deadline_after(limit), "handshake milestone", async move {
            handshake.await.map_err(|_| FaultError::NotConnected)
        })
        .await?;
        Ok(())
    }

    async fn join_destination(
        &self,
        task: Option<JoinHandle<mirrorfault_core::Result<ScriptReport>>>,
    ) -> Result<ScriptReport> {
        let Some(mut task) = task else {
            return Ok(ScriptReport::default());
        };

        match tokio::time::timeout(self.config.script_budget(), &mut task).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(e)) => Err(ScenarioError::harness("joining fault endpoint", e)),
            Err(_) => {
                task.abort();
                Err(ScenarioError::harness("waiting for fault endpoint", "script overran"))
            },
        }
    }

    async fn check_diagnostics(
        &self,
        expect: &Expectation,
        reply: &ControlReply,
        process: &mut ProcessHandle,
    ) -> Result<()> {
        let reply_text = format!("{}: {}", reply.code, reply.message);

        if let Some(needle) = expect.diagnostic {
            let deadline = deadline_after(self.config.diagnostic_timeout);
            let found = reply.message.contains(needle)
                || process.wait_for_stderr(needle, deadline).await;
            if !found {
                return Err(ScenarioError::Diagnostic { expected: needle, reply: reply_text });
            }
        }

        if let Some(needle) = expect.reply
            && !reply.message.to_lowercase().contains(&needle.to_lowercase())
        {
            return Err(ScenarioError::Diagnostic { expected: needle, reply: reply_text });
        }
        Ok(())
    }
}

/// Classify every exchange and reject a script that did not do its job.
///
/// A corrupted reply the endpoint was told to send is `Injected`. A reply
/// that fails correlation without a configured corruption is the endpoint
/// misbehaving, never a verdict on the process under test.
pub fn self_check(scenario: &FaultScenario, report: &ScriptReport) -> Result<Vec<ReplyCheck>> {
    if let Some(exchange) = report.misbehaved() {
        return Err(ScenarioError::EndpointMisbehaved {
            detail: format!(
                "{:?} request {:?} answered with {:?} under {:?}",
                exchange.request.kind, exchange.request.handle, exchange.reply, exchange.outcome
            ),
        });
    }

    let must_inject = !matches!(scenario.fault, Fault::None | Fault::RefuseConnection);
    if must_inject && !report.injected {
        return Err(ScenarioError::NotInjected { scenario: scenario.name });
    }
    if let Some(expected) = scenario.expect.reconnect
        && report.reconnected != expected
    {
        return Err(ScenarioError::RetryMismatch { scenario: scenario.name, expected });
    }
    Ok(report.exchanges.iter().map(|e| e.check()).collect())
}

/// Reject a run in which the process held on to a withheld reply or
/// handshake for longer than `allowed`.
pub fn check_abort_time(
    scenario: &FaultScenario,
    report: &ScriptReport,
    allowed: Duration,
) -> Result<()> {
    match report.longest_wait() {
        Some(waited) if waited > allowed => {
            Err(ScenarioError::SlowAbort { scenario: scenario.name, waited, allowed })
        },
        _ => Ok(()),
    }
}

fn accepted(command: &'static str, reply: ControlReply) -> Result<ControlReply> {
    if reply.is_success() {
        Ok(reply)
    } else {
        let reply = format!("{}: {}", reply.code, reply.message);
        Err(ScenarioError::ControlRejected { command, reply })
    }
}

/// Deterministic export contents for `seed`.
pub fn export_contents(seed: u64, size: u64) -> Result<Vec<u8>> {
    let size = usize::try_from(size)
        .map_err(|e| ScenarioError::harness("sizing backing file", e))?;
    let mut contents = vec![0u8; size];
    ChaCha8Rng::seed_from_u64(seed).fill_bytes(&mut contents);
    Ok(contents)
}

/// A port on `ip` that nothing listens on right now.
pub async fn free_port(ip: IpAddr) -> Result<u16> {
    let listener = tokio::net::TcpListener::bind(SocketAddr::new(ip, 0))
        .await
        .map_err(|e| ScenarioError::harness("finding a free port", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| ScenarioError::harness("finding a free port", e))?
        .port();
    Ok(port)
}

async fn wait_for_socket(
    process: &mut ProcessHandle,
    sock: &Path,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(meta) = tokio::fs::metadata(sock).await
            && meta.file_type().is_socket()
        {
            return Ok(());
        }
        if let Some(exit) = process.try_exit()? {
            return Err(ScenarioError::ServiceUnavailable {
                reason: format!("server quit during startup with {exit}"),
            });
        }
        if Instant::now() >= deadline {
            return Err(ScenarioError::harness(
                "waiting for control socket",
                format!("{} did not appear within {timeout:?}", sock.display()),
            ));
        }
        tokio::time::sleep(SOCKET_POLL).await;
    }
}

fn unavailable(err: FaultError) -> ScenarioError {
    ScenarioError::ServiceUnavailable { reason: err.to_string() }
}

#[cfg(test)]
mod tests {
    use mirrorfault_core::{DEFAULT_HANDLE, Exchange, ResponseOutcome};
    use mirrorfault_proto::{RequestFrame, RequestType, ResponseFrame};
    use tokio::process::Command;

    use super::*;

    fn write_exchange(outcome: ResponseOutcome, corrupt: bool) -> Exchange {
        let request = RequestFrame::new(RequestType::Write, DEFAULT_HANDLE, 0, 8);
        let mut reply = ResponseFrame::reply_to(&request, 0);
        if corrupt {
            reply.handle = reply.handle.corrupted();
        }
        Exchange { request, outcome, reply: Some(reply), waited: None }
    }

    fn withheld_write(waited: Duration) -> Exchange {
        let request = RequestFrame::new(RequestType::Write, DEFAULT_HANDLE, 0, 8);
        Exchange { request, outcome: ResponseOutcome::Hang, reply: None, waited: Some(waited) }
    }

    #[test]
    fn injected_corruption_passes_self_check() {
        let scenario = FaultScenario::by_name("write_wrong_handle").unwrap();
        let report = ScriptReport {
            exchanges: vec![write_exchange(ResponseOutcome::WrongHandle, true)],
            injected: true,
            ..ScriptReport::default()
        };
        assert_eq!(self_check(scenario, &report).unwrap(), [ReplyCheck::Injected]);
    }

    #[test]
    fn unconfigured_corruption_is_endpoint_misbehaviour() {
        let scenario = FaultScenario::by_name("accept_mirror").unwrap();
        let report = ScriptReport {
            exchanges: vec![write_exchange(ResponseOutcome::Correct, true)],
            ..ScriptReport::default()
        };
        assert!(matches!(
            self_check(scenario, &report),
            Err(ScenarioError::EndpointMisbehaved { .. })
        ));
    }

    #[test]
    fn missing_injection_is_reported() {
        let scenario = FaultScenario::by_name("hang_after_write").unwrap();
        let report = ScriptReport {
            exchanges: vec![write_exchange(ResponseOutcome::Correct, false)],
            writes: 1,
            ..ScriptReport::default()
        };
        assert!(matches!(
            self_check(scenario, &report),
            Err(ScenarioError::NotInjected { scenario: "hang_after_write" })
        ));
    }

    #[test]
    fn missing_retry_after_close_is_a_verdict() {
        let scenario = FaultScenario::by_name("close_after_hello").unwrap();
        let report = ScriptReport {
            injected: true,
            closed_cleanly: true,
            reconnected: false,
            ..ScriptReport::default()
        };
        assert!(matches!(
            self_check(scenario, &report),
            Err(ScenarioError::RetryMismatch { scenario: "close_after_hello", expected: true })
        ));

        let report = ScriptReport { reconnected: true, ..report };
        assert!(self_check(scenario, &report).unwrap().is_empty());
    }

    #[test]
    fn overrunning_the_request_limit_is_a_verdict() {
        let scenario = FaultScenario::by_name("hang_after_write").unwrap();
        let config = ScenarioConfig::new("/bin/flexnbd");
        let report = ScriptReport {
            exchanges: vec![withheld_write(Duration::from_secs(9))],
            injected: true,
            ..ScriptReport::default()
        };
        assert!(matches!(
            check_abort_time(scenario, &report, config.abort_allowance()),
            Err(ScenarioError::SlowAbort { waited, .. }) if waited == Duration::from_secs(9)
        ));

        let report =
            ScriptReport { exchanges: vec![withheld_write(Duration::from_secs(4))], ..report };
        check_abort_time(scenario, &report, config.abort_allowance()).unwrap();
    }

    #[test]
    fn refused_control_command_is_a_verdict() {
        let reply = ControlReply::parse("1: bad spec: nonsense").unwrap();
        assert!(matches!(
            accepted("acl", reply),
            Err(ScenarioError::ControlRejected { command: "acl", ref reply })
                if reply == "1: bad spec: nonsense"
        ));
        assert!(accepted("acl", ControlReply::parse("0: updated").unwrap()).is_ok());
    }

    #[tokio::test]
    async fn dropped_destination_stops_its_script() {
        let (running, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _running = running;
            std::future::pending::<mirrorfault_core::Result<ScriptReport>>().await
        });
        let (_tx, handshake) = oneshot::channel();
        drop(Destination { port: 0, task: Some(task), handshake });
        assert!(stopped.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_that_never_arrives_times_out() {
        let command = ServerCommand::new("/bin/flexnbd", false);
        let runner = ScenarioRunner::with_command(ScenarioConfig::new("/bin/flexnbd"), command);
        let (_tx, handshake) = oneshot::channel();
        let mut destination = Destination { port: 0, task: None, handshake };

        let err = runner.await_handshake(&mut destination).await.unwrap_err();
        assert!(matches!(
            err,
            ScenarioError::Fault(FaultError::Timeout { operation: "handshake milestone", .. })
        ));

        let (tx, handshake) = oneshot::channel::<()>();
        drop(tx);
        let mut destination = Destination { port: 0, task: None, handshake };
        let err = runner.await_handshake(&mut destination).await.unwrap_err();
        assert!(matches!(err, ScenarioError::Fault(FaultError::NotConnected)));
    }

    #[test]
    fn refusal_needs_no_injection() {
        let scenario = FaultScenario::by_name("refuse_connect").unwrap();
        assert!(self_check(scenario, &ScriptReport::default()).unwrap().is_empty());
    }

    #[test]
    fn export_contents_are_seeded() {
        let a = export_contents(7, 64).unwrap();
        assert_eq!(a, export_contents(7, 64).unwrap());
        assert_ne!(a, export_contents(8, 64).unwrap());
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn request_limit_is_scoped_to_config() {
        let config = ScenarioConfig::new("/bin/flexnbd");
        assert_eq!(config.request_limit_value(), "4.0");

        let config = config.with_request_limit(Duration::from_millis(1500));
        assert_eq!(config.request_limit_value(), "1.5");
        assert!(config.endpoint.stall_limit > config.request_limit);
        assert!(config.control_timeout > config.request_limit);
    }

    #[tokio::test]
    async fn startup_failure_is_not_a_harness_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut command = Command::new("sh");
        command.arg("-c").arg("exit 3");
        let mut process = ProcessHandle::spawn(command, TerminalState::Aborted).unwrap();

        let result =
            wait_for_socket(&mut process, &dir.path().join("ctrl"), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ScenarioError::ServiceUnavailable { .. })));
    }

    #[tokio::test]
    async fn free_port_is_bindable() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let port = free_port(ip).await.unwrap();
        tokio::net::TcpListener::bind(SocketAddr::new(ip, port)).await.unwrap();
    }
}
