//! Destination-side scripts.
//!
//! [`run_fault`] plays the destination for one catalogued fault from
//! accept to teardown: behave correctly up to the injection point, inject
//! exactly once, then watch the source hang up.

use std::time::Duration;

use mirrorfault_proto::RequestType;
use tokio::sync::oneshot;

use crate::{
    endpoint::{Acceptor, Exchange, FaultEndpoint, ReplyCheck},
    error::Result,
    fault::{Fault, HandshakeOutcome, ResponseOutcome},
    guard::deadline_after,
    transport::Transport,
};

/// Points in the script the runner can wait on.
#[derive(Debug, Default)]
pub struct Milestones {
    /// Fired once a correct handshake has been sent.
    pub handshake_done: Option<oneshot::Sender<()>>,
}

impl Milestones {
    /// Milestones with a handshake notification.
    pub fn with_handshake() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { handshake_done: Some(tx) }, rx)
    }

    fn handshake_done(&mut self) {
        if let Some(tx) = self.handshake_done.take() {
            // Nobody listening is fine.
            let _ = tx.send(());
        }
    }
}

/// What happened on the destination side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptReport {
    /// Every answered (or deliberately unanswered) request, in order.
    pub exchanges: Vec<Exchange>,
    /// WRITEs answered correctly.
    pub writes: usize,
    /// Whether an ENTRUST was answered correctly.
    pub entrusted: bool,
    /// Whether the fault was injected.
    pub injected: bool,
    /// Whether the connection ended without a stall or error.
    pub closed_cleanly: bool,
    /// Whether the source came back after the endpoint closed on it.
    pub reconnected: bool,
    /// How long the source waited on a withheld handshake.
    pub handshake_waited: Option<Duration>,
}

impl ScriptReport {
    /// First exchange whose reply disagrees with the configured outcome.
    pub fn misbehaved(&self) -> Option<&Exchange> {
        self.exchanges.iter().find(|e| e.check() == ReplyCheck::Misbehaved)
    }

    /// Longest time the source held on to anything the endpoint withheld.
    pub fn longest_wait(&self) -> Option<Duration> {
        self.exchanges.iter().filter_map(|e| e.waited).chain(self.handshake_waited).max()
    }
}

/// Play the destination for `fault` on the next connection to `acceptor`.
///
/// `RefuseConnection` never accepts; the caller does not bind for it and
/// gets an empty report.
pub async fn run_fault<T: Transport>(
    acceptor: &mut Acceptor<T>,
    fault: Fault,
    export_size: u64,
    mut milestones: Milestones,
) -> Result<ScriptReport> {
    let mut report = ScriptReport::default();
    let Some(hello) = fault.handshake_outcome() else {
        tracing::debug!("refusing: nothing to accept");
        return Ok(report);
    };

    let config = *acceptor.config();
    let mut endpoint = acceptor.accept(deadline_after(config.accept_timeout)).await?;
    report.handshake_waited = endpoint.perform_handshake(hello, export_size).await?;

    if hello != HandshakeOutcome::Correct {
        report.injected = true;
        report.closed_cleanly =
            endpoint.expect_orderly_close(deadline_after(config.close_timeout)).await;
        return Ok(report);
    }
    milestones.handshake_done();

    match fault {
        Fault::CloseAfterHandshake => {
            tracing::warn!("closing after handshake");
            endpoint.close();
            report.injected = true;
            report.closed_cleanly = true;
            report.reconnected = await_reconnect(acceptor, export_size).await;
        },
        Fault::CancelAfterHandshake | Fault::TerminateAfterHandshake => {
            report.injected = true;
            report.closed_cleanly =
                endpoint.expect_orderly_close(deadline_after(config.stall_limit)).await;
        },
        Fault::None | Fault::FirstWrite(_) | Fault::Entrust(_) => {
            serve_requests(&mut endpoint, fault, &mut report).await?;
        },
        Fault::RefuseConnection | Fault::Handshake(_) => {},
    }

    tracing::info!(
        injected = report.injected,
        writes = report.writes,
        entrusted = report.entrusted,
        closed_cleanly = report.closed_cleanly,
        "destination script finished"
    );
    Ok(report)
}

async fn serve_requests<S>(
    endpoint: &mut FaultEndpoint<S>,
    fault: Fault,
    report: &mut ScriptReport,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let close_timeout = endpoint.config().close_timeout;

    loop {
        let Some(request) = endpoint.receive_request().await? else {
            report.closed_cleanly = true;
            return Ok(());
        };

        let outcome = match request.kind {
            RequestType::Write => fault.reply_for_write(report.writes),
            RequestType::Entrust => fault.reply_for_entrust(),
            RequestType::Read => ResponseOutcome::Correct,
            RequestType::Disconnect => {
                report.closed_cleanly =
                    endpoint.expect_orderly_close(deadline_after(close_timeout)).await;
                return Ok(());
            },
        };

        report.exchanges.push(endpoint.respond(request, outcome).await?);

        if outcome != ResponseOutcome::Correct {
            report.injected = true;
            report.closed_cleanly =
                endpoint.expect_orderly_close(deadline_after(close_timeout)).await;
            return Ok(());
        }

        match request.kind {
            RequestType::Write => report.writes += 1,
            RequestType::Entrust => report.entrusted = true,
            RequestType::Read | RequestType::Disconnect => {},
        }
    }
}

/// Accept the source's retry after an injected close and greet it.
async fn await_reconnect<T: Transport>(acceptor: &mut Acceptor<T>, export_size: u64) -> bool {
    let config = *acceptor.config();
    match acceptor.accept(deadline_after(config.accept_timeout)).await {
        Ok(mut again) => {
            tracing::info!("source reconnected after close");
            if let Err(e) = again.perform_handshake(HandshakeOutcome::Correct, export_size).await {
                tracing::debug!(error = %e, "handshake on reconnect failed");
            }
            true
        },
        Err(e) => {
            tracing::info!(error = %e, "source did not reconnect");
            false
        },
    }
}
