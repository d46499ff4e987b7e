//! Stand-in mirroring server.
//!
//! Serves a file over the block protocol, takes commands on a control
//! socket and migrates the file to a destination on `mirror`. It exists so
//! the scenario runner can be driven end to end without an external server
//! binary.
//!
//! # Usage
//!
//! ```bash
//! mirrorfault-standin serve --addr 127.0.0.1 --port 4000 --file disk.img --sock /tmp/ctrl
//! mirrorfault-standin mirror --addr 127.0.0.1 --port 4001 --sock /tmp/ctrl
//! mirrorfault-standin read --addr 127.0.0.1 --port 4000 --from 0 --size 8
//! ```
//!
//! Exit status of `serve`: 0 after SIGINT or a completed handoff, 1 after
//! SIGTERM. A handoff that fails after ENTRUST was sent ends in SIGKILL.

mod control;
mod export;
mod mirror;

use std::{
    io::Write,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use mirrorfault_core::{
    ControlClient, EndpointConfig, FaultEndpoint, FaultError, TcpTransport, deadline_after,
};
use mirrorfault_harness::{SIGKILL, send_signal};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UnixListener},
    signal::unix::{SignalKind, signal},
    sync::{Mutex, RwLock, mpsc},
    task::JoinHandle,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::export::Export;

/// Stand-in mirroring server
#[derive(Parser, Debug)]
#[command(name = "mirrorfault-standin")]
#[command(about = "Serves a file and mirrors it on request")]
#[command(version)]
struct Args {
    /// Log at debug level
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    verb: Verb,
}

#[derive(Subcommand, Debug)]
enum Verb {
    /// Serve a file until told to stop
    Serve {
        /// Address to serve on
        #[arg(long)]
        addr: IpAddr,

        /// Port to serve on
        #[arg(long)]
        port: u16,

        /// File to serve
        #[arg(long)]
        file: PathBuf,

        /// Control socket path
        #[arg(long)]
        sock: PathBuf,

        /// Per-request time limit of a migration, in seconds
        #[arg(long, env = "FLEXNBD_MS_REQUEST_LIMIT_SECS", default_value_t = 10.0)]
        request_limit: f64,

        /// Addresses allowed to connect (all when empty)
        acl: Vec<IpAddr>,
    },
    /// Read bytes from a server to stdout
    Read {
        #[command(flatten)]
        remote: Remote,

        #[command(flatten)]
        range: Range,
    },
    /// Write bytes from stdin to a server
    Write {
        #[command(flatten)]
        remote: Remote,

        #[command(flatten)]
        range: Range,
    },
    /// Ask a serving process to mirror to a destination
    Mirror {
        #[command(flatten)]
        remote: Remote,

        /// Control socket of the serving process
        #[arg(long)]
        sock: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct Remote {
    /// Server address
    #[arg(long)]
    addr: IpAddr,

    /// Server port
    #[arg(long)]
    port: u16,
}

#[derive(clap::Args, Debug)]
struct Range {
    /// First byte
    #[arg(long, default_value_t = 0)]
    from: u64,

    /// Number of bytes
    #[arg(long)]
    size: u32,
}

/// How a migration asked the server to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// The destination took over; exit 0.
    Entrusted,
    /// The handoff is undecided; die by SIGKILL.
    Kill,
}

/// State shared by the local service, the control socket and a migration.
pub struct Server {
    pub export: Export,
    pub acl: RwLock<Vec<IpAddr>>,
    pub mirror: Mutex<Option<JoinHandle<()>>>,
    pub request_limit: Duration,
    pub finish: mpsc::Sender<Finish>,
}

impl Server {
    /// Whether `ip` may use the local service.
    pub async fn allows(&self, ip: IpAddr) -> bool {
        let acl = self.acl.read().await;
        acl.is_empty() || acl.contains(&ip)
    }
}

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .with(filter)
        .init();

    match args.verb {
        Verb::Serve { addr, port, file, sock, request_limit, acl } => {
            let request_limit = Duration::try_from_secs_f64(request_limit)?;
            serve(SocketAddr::new(addr, port), &file, &sock, request_limit, acl).await
        },
        Verb::Read { remote, range } => read(&remote, &range).await,
        Verb::Write { remote, range } => write(&remote, &range).await,
        Verb::Mirror { remote, sock } => {
            let control = ControlClient::new(sock, CLIENT_TIMEOUT);
            let reply = control.mirror(&remote.addr.to_string(), remote.port).await?;
            writeln!(std::io::stdout(), "{}: {}", reply.code, reply.message)?;
            Ok(if reply.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        },
    }
}

async fn serve(
    addr: SocketAddr,
    file: &Path,
    sock: &Path,
    request_limit: Duration,
    acl: Vec<IpAddr>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let export = Export::open(file).await?;
    let local = TcpListener::bind(addr).await?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    // A socket left by an earlier run would make the bind fail.
    if tokio::fs::try_exists(sock).await? {
        tokio::fs::remove_file(sock).await?;
    }
    let control = UnixListener::bind(sock)?;

    let (finish, mut finished) = mpsc::channel(1);
    let server = Arc::new(Server {
        export,
        acl: RwLock::new(acl),
        mirror: Mutex::new(None),
        request_limit,
        finish,
    });
    tracing::info!(%addr, sock = %sock.display(), size = server.export.size(), "serving");

    let local_task = tokio::spawn(export::serve(local, Arc::clone(&server)));
    let control_task = tokio::spawn(control::serve(control, Arc::clone(&server)));

    let code = tokio::select! {
        _ = interrupt.recv() => {
            tracing::info!("interrupted, shutting down");
            ExitCode::SUCCESS
        },
        _ = terminate.recv() => {
            tracing::warn!("terminated, quitting");
            ExitCode::FAILURE
        },
        how = finished.recv() => match how {
            Some(Finish::Entrusted) | None => {
                tracing::info!("handoff complete, exiting");
                ExitCode::SUCCESS
            },
            Some(Finish::Kill) => {
                tracing::error!("handoff undecided, killing self");
                send_signal(std::process::id(), SIGKILL).await?;
                ExitCode::FAILURE
            },
        },
    };

    local_task.abort();
    control_task.abort();
    if let Err(e) = tokio::fs::remove_file(sock).await {
        tracing::debug!(error = %e, "removing control socket");
    }
    Ok(code)
}

async fn connect(remote: &Remote) -> mirrorfault_core::Result<FaultEndpoint<TcpStream>> {
    let addr = SocketAddr::new(remote.addr, remote.port).to_string();
    let config = EndpointConfig::default();
    let mut endpoint = FaultEndpoint::connect(&TcpTransport, &addr, config).await?;
    let hello = endpoint.read_hello(deadline_after(config.hello_timeout)).await?;
    if !hello.is_accepting() {
        return Err(FaultError::Rejected {
            reason: format!("hello magic {:02x?}", hello.magic),
        });
    }
    Ok(endpoint)
}

async fn read(remote: &Remote, range: &Range) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut endpoint = connect(remote).await?;
    let data = endpoint.read_at(i64::try_from(range.from)?, range.size).await?;
    endpoint.disconnect().await?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&data).await?;
    stdout.flush().await?;
    Ok(ExitCode::SUCCESS)
}

async fn write(remote: &Remote, range: &Range) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut data = vec![0u8; range.size as usize];
    tokio::io::stdin().read_exact(&mut data).await?;

    let mut endpoint = connect(remote).await?;
    endpoint.write_at(i64::try_from(range.from)?, &data).await?;
    endpoint.disconnect().await?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn serve_help_mentions_verbose() {
        let mut cmd = Args::command();
        cmd.build();
        let help = cmd
            .find_subcommand_mut("serve")
            .unwrap()
            .render_long_help()
            .to_string();
        assert!(help.contains("--verbose"));
    }

    #[test]
    fn serve_takes_a_trailing_access_list() {
        let args = Args::try_parse_from([
            "mirrorfault-standin",
            "serve",
            "--verbose",
            "--addr",
            "127.0.0.1",
            "--port",
            "4000",
            "--file",
            "disk",
            "--sock",
            "ctrl",
            "127.0.0.1",
            "::1",
        ])
        .unwrap();
        assert!(args.verbose);
        let Verb::Serve { acl, port, .. } = args.verb else {
            panic!("expected serve");
        };
        assert_eq!(port, 4000);
        assert_eq!(acl.len(), 2);
    }

    #[tokio::test]
    async fn access_list_admits_everyone_until_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export");
        tokio::fs::write(&path, [0u8; 16]).await.unwrap();
        let (finish, _finished) = mpsc::channel(1);
        let server = Server {
            export: Export::open(&path).await.unwrap(),
            acl: RwLock::new(Vec::new()),
            mirror: Mutex::new(None),
            request_limit: Duration::from_secs(1),
            finish,
        };

        let localhost: IpAddr = "127.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(server.allows(other).await);

        *server.acl.write().await = vec![localhost];
        assert!(server.allows(localhost).await);
        assert!(!server.allows(other).await);
    }
}
