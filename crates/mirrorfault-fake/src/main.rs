//! Fault-injecting mirror destination.
//!
//! # Usage
//!
//! ```bash
//! # List catalogued scenarios
//! mirrorfault-fake --list
//!
//! # Stand in for a mirror destination that hangs on the first write
//! mirrorfault-fake hang_after_write --addr 127.0.0.1 --port 4001
//!
//! # Cancel the mirror through the source's control socket after the hello
//! mirrorfault-fake break_after_hello --port 4001 --sock /tmp/ctrl
//!
//! # Send SIGTERM to the source process after the hello
//! mirrorfault-fake sigterm_after_hello --port 4001 --pid 4242
//! ```
//!
//! The bound port is written to stdout once listening. Exits 0 if the
//! scenario played out as catalogued, 1 otherwise.

use std::{
    io::Write,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};

use clap::Parser;
use mirrorfault_core::{
    Acceptor, ControlClient, EndpointConfig, Fault, FaultScenario, Milestones, TcpTransport,
    run_fault,
};
use mirrorfault_harness::{SIGTERM, check_abort_time, self_check, send_signal};
use tokio::sync::oneshot;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// How far past its request limit the source may hold a withheld reply.
const ABORT_SLACK: Duration = Duration::from_secs(2);

/// Fault-injecting mirror destination
#[derive(Parser, Debug)]
#[command(name = "mirrorfault-fake")]
#[command(about = "Plays one catalogued fault as the destination of a mirror")]
#[command(version)]
struct Args {
    /// Scenario to play (see --list)
    #[arg(required_unless_present = "list")]
    scenario: Option<String>,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    addr: IpAddr,

    /// Port to listen on (0 picks a free one)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Export size announced in the handshake
    #[arg(long, default_value_t = 4096)]
    size: u64,

    /// Control socket of the source, for scenarios that cancel the mirror
    #[arg(long)]
    sock: Option<PathBuf>,

    /// Source process, for scenarios that signal it
    #[arg(long)]
    pid: Option<u32>,

    /// Request time limit of the source, in seconds
    #[arg(long, env = "FLEXNBD_MS_REQUEST_LIMIT_SECS", default_value_t = 4.0)]
    request_limit: f64,

    /// List scenarios and exit
    #[arg(long)]
    list: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if args.list {
        let mut out = std::io::stdout().lock();
        for scenario in FaultScenario::all() {
            writeln!(out, "{scenario}\t{}", scenario.expect.terminal)?;
        }
        return Ok(ExitCode::SUCCESS);
    }

    let name = args.scenario.as_deref().unwrap_or_default();
    let Some(scenario) = FaultScenario::by_name(name) else {
        tracing::error!(name, "unknown scenario, see --list");
        return Ok(ExitCode::FAILURE);
    };

    let request_limit = Duration::try_from_secs_f64(args.request_limit)?;
    let config = EndpointConfig::outlasting(request_limit);

    if scenario.fault == Fault::RefuseConnection {
        tracing::info!(%scenario, "not listening, connections are refused");
        return Ok(ExitCode::SUCCESS);
    }

    let addr = SocketAddr::new(args.addr, args.port).to_string();
    let mut acceptor = Acceptor::bind(TcpTransport, &addr, config).await?;
    let local = acceptor.local_addr()?;
    tracing::info!(%scenario, %local, "waiting for source");
    writeln!(std::io::stdout(), "{}", local.port())?;

    let (milestones, handshake) = Milestones::with_handshake();
    let intervention = match (scenario.fault, args.sock) {
        (Fault::CancelAfterHandshake, Some(sock)) => {
            let control = ControlClient::new(sock, request_limit + Duration::from_secs(5));
            Some(tokio::spawn(cancel_after(handshake, control)))
        },
        (Fault::CancelAfterHandshake, None) => {
            tracing::warn!("no --sock given, the mirror must be cancelled elsewhere");
            None
        },
        (Fault::TerminateAfterHandshake, _) => match args.pid {
            Some(pid) => Some(tokio::spawn(terminate_after(handshake, pid))),
            None => {
                tracing::warn!("no --pid given, the source must be signalled elsewhere");
                None
            },
        },
        _ => None,
    };

    let report = run_fault(&mut acceptor, scenario.fault, args.size, milestones).await?;
    if let Some(task) = intervention {
        task.await?;
    }

    let allowed = request_limit + ABORT_SLACK;
    let verdict = self_check(scenario, &report)
        .and_then(|checks| check_abort_time(scenario, &report, allowed).map(|()| checks));
    match verdict {
        Ok(checks) => {
            tracing::info!(
                ?checks,
                injected = report.injected,
                closed_cleanly = report.closed_cleanly,
                "scenario played"
            );
            Ok(ExitCode::SUCCESS)
        },
        Err(e) => {
            tracing::error!(error = %e, "scenario failed");
            Ok(ExitCode::FAILURE)
        },
    }
}

async fn cancel_after(handshake: oneshot::Receiver<()>, control: ControlClient) {
    if handshake.await.is_err() {
        return;
    }
    match control.cancel().await {
        Ok(reply) => {
            tracing::info!(code = %reply.code, message = %reply.message, "mirror cancelled");
        },
        Err(e) => tracing::error!(error = %e, "cancelling mirror failed"),
    }
}

async fn terminate_after(handshake: oneshot::Receiver<()>, pid: u32) {
    if handshake.await.is_err() {
        return;
    }
    if let Err(e) = send_signal(pid, SIGTERM).await {
        tracing::error!(error = %e, pid, "terminating source failed");
    }
}
