//! Outbound migration of the export to a destination server.
//!
//! ```text
//! open: connect ──► hello (bounded) ──► size check
//! migrate: WRITE chunks ──► ENTRUST ──► DISCONNECT ──► exit 0
//! ```
//!
//! A failed write drops the connection and the migration is retried once
//! on a fresh one. A failed ENTRUST leaves the handoff undecided and the
//! process kills itself.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use mirrorfault_core::{
    EndpointConfig, FaultEndpoint, FaultError, RetryPolicy, TcpTransport, deadline_after,
    run_bounded,
};
use thiserror::Error;
use tokio::net::TcpStream;

use crate::{Finish, Server};

/// Bytes per WRITE.
const CHUNK: usize = 4096;

/// Transfers tried before the migration is abandoned.
const ATTEMPTS: u32 = 2;

const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Why a migration stopped.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: SocketAddr, source: FaultError },

    #[error("Remote server failed to respond")]
    NoHello,

    #[error("Mirror was rejected: {reason}")]
    Rejected { reason: String },

    #[error("Remote size does not match local size ({remote} != {local})")]
    SizeMismatch { remote: u64, local: u64 },

    #[error("Mirror write failed at offset {offset}: {source}")]
    Write { offset: u64, source: FaultError },

    #[error("Mirror entrust failed: {0}")]
    Entrust(FaultError),

    #[error("reading export: {0}")]
    Export(#[from] std::io::Error),
}

/// A connected destination that has sent an acceptable hello.
pub struct Destination {
    addr: SocketAddr,
    endpoint: FaultEndpoint<TcpStream>,
}

fn config(request_limit: Duration) -> EndpointConfig {
    EndpointConfig {
        hello_timeout: request_limit,
        request_timeout: request_limit,
        close_timeout: request_limit,
        connect: RetryPolicy { max_total: Duration::from_secs(1), backoff: RETRY_DELAY },
        ..EndpointConfig::default()
    }
}

/// Connect to `ip:port` and check its hello against the local export.
pub async fn open(ip: IpAddr, port: u16, server: &Server) -> Result<Destination, MirrorError> {
    let addr = SocketAddr::new(ip, port);
    let limit = server.request_limit;
    let mut endpoint = FaultEndpoint::connect(&TcpTransport, &addr.to_string(), config(limit))
        .await
        .map_err(|source| MirrorError::Connect { addr, source })?;

    // Inner deadline is longer so a silent peer surfaces as a timeout.
    let hello = run_bounded(
        deadline_after(limit),
        "remote hello",
        endpoint.read_hello(deadline_after(limit * 2)),
    )
    .await
    .map_err(|e| {
        if e.is_timeout() {
            MirrorError::NoHello
        } else {
            MirrorError::Rejected { reason: e.to_string() }
        }
    })?;

    if !hello.is_accepting() {
        return Err(MirrorError::Rejected { reason: format!("hello magic {:02x?}", hello.magic) });
    }
    let local = server.export.size();
    if hello.export_size != local {
        return Err(MirrorError::SizeMismatch { remote: hello.export_size, local });
    }
    tracing::info!(%addr, size = local, "destination accepted mirror");
    Ok(Destination { addr, endpoint })
}

/// Run the migration to its end and tell the server how it ended.
pub async fn migrate(mut destination: Destination, server: Arc<Server>) {
    for attempt in 1..=ATTEMPTS {
        match transfer(&mut destination, &server).await {
            Ok(()) => {
                tracing::info!(addr = %destination.addr, "migration entrusted");
                finish(&server, Finish::Entrusted).await;
                return;
            },
            Err(e @ MirrorError::Entrust(_)) => {
                tracing::error!("{e}");
                finish(&server, Finish::Kill).await;
                return;
            },
            Err(e) => {
                tracing::error!(attempt, "{e}");
                destination.endpoint.close();
            },
        }
        if attempt == ATTEMPTS {
            break;
        }

        tokio::time::sleep(RETRY_DELAY).await;
        let addr = destination.addr;
        match open(addr.ip(), addr.port(), &server).await {
            Ok(reopened) => destination = reopened,
            Err(e) => {
                tracing::error!("{e}");
                break;
            },
        }
    }
    tracing::warn!("mirror abandoned, serving locally");
}

async fn transfer(destination: &mut Destination, server: &Server) -> Result<(), MirrorError> {
    let endpoint = &mut destination.endpoint;
    let size = server.export.size();

    let mut offset = 0;
    while offset < size {
        let len = usize::try_from(size - offset).map_or(CHUNK, |rest| rest.min(CHUNK));
        let data = server.export.read(offset, len).await?;
        let at = i64::try_from(offset).map_err(|_| MirrorError::Write {
            offset,
            source: FaultError::ProtocolMismatch { reason: "offset out of range".into() },
        })?;
        endpoint
            .write_at(at, &data)
            .await
            .map_err(|source| MirrorError::Write { offset, source })?;
        tracing::debug!(offset, len, "chunk mirrored");
        offset += len as u64;
    }

    endpoint.entrust().await.map_err(MirrorError::Entrust)?;
    if let Err(e) = endpoint.disconnect().await {
        tracing::debug!(error = %e, "disconnect after entrust failed");
    }
    Ok(())
}

async fn finish(server: &Server, how: Finish) {
    if server.finish.send(how).await.is_err() {
        tracing::debug!(?how, "server already stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_name_the_failure() {
        let write = MirrorError::Write { offset: 4096, source: FaultError::NotConnected };
        assert!(write.to_string().starts_with(mirrorfault_core::WRITE_FAILED));
        assert_eq!(MirrorError::NoHello.to_string(), "Remote server failed to respond");

        let size = MirrorError::SizeMismatch { remote: 4097, local: 4096 };
        assert!(size.to_string().starts_with("Remote size does not match local size"));
    }

    #[test]
    fn every_wait_is_the_request_limit() {
        let config = config(Duration::from_secs(3));
        assert_eq!(config.hello_timeout, Duration::from_secs(3));
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert!(config.connect.max_total < config.accept_timeout);
    }
}
