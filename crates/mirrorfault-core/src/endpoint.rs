//! The emulated peer.
//!
//! A [`FaultEndpoint`] owns one connection and plays either side of it:
//!
//! - Destination role: send a handshake, receive requests, answer them.
//!   Each step takes an outcome that says whether to behave or how to
//!   diverge.
//! - Source role: read a handshake, send requests and payloads, read
//!   replies. Used to check that the process under test still serves.
//!
//! Every wait is bounded by a deadline from [`EndpointConfig`] or the
//! caller. An error that leaves the stream in an unknown state (timeout,
//! short frame, socket error) drops the connection; later calls fail with
//! [`FaultError::NotConnected`].

use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use mirrorfault_proto::{
    FrameKind, Handle, HandshakeFrame, REPLY_MAGIC, REQUEST_MAGIC, RequestFrame, RequestType,
    ResponseFrame, encode_handshake, encode_request,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time::Instant,
};

use crate::{
    config::EndpointConfig,
    error::{FaultError, Result},
    fault::{HandshakeOutcome, ResponseOutcome},
    framed::{self, FillEnd},
    guard::{Deadline, RetryPolicy, deadline_after, run_bounded},
    transport::Transport,
};

/// Magic sent by a handshake the source must refuse.
pub const WRONG_HELLO_MAGIC: [u8; 8] = *b"NOTMAGIC";

/// Handle used by source-role convenience calls.
pub const DEFAULT_HANDLE: Handle = Handle::new(*b"myhandle");

/// Passive side: a bound listener waiting for the source.
pub struct Acceptor<T: Transport> {
    transport: T,
    listener: T::Listener,
    config: EndpointConfig,
}

impl<T: Transport> Acceptor<T> {
    /// Bind `addr` (`host:port`).
    pub async fn bind(transport: T, addr: &str, config: EndpointConfig) -> Result<Self> {
        let listener = transport.bind(addr).await?;
        tracing::debug!(addr, "fault endpoint listening");
        Ok(Self { transport, listener, config })
    }

    /// Time limits handed to accepted connections.
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Address actually bound; resolves port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.local_addr(&self.listener)?)
    }

    /// Wait for the source to connect.
    pub async fn accept(&mut self, deadline: Deadline) -> Result<FaultEndpoint<T::Stream>> {
        let (stream, peer) =
            run_bounded(deadline, "inbound connection", self.transport.accept(&mut self.listener))
                .await?;
        tracing::info!(%peer, "source connected");
        Ok(FaultEndpoint::new(stream, self.config))
    }
}

/// Bind `addr` and accept one connection before `deadline`.
pub async fn listen_and_accept<T: Transport>(
    transport: T,
    addr: &str,
    config: EndpointConfig,
    deadline: Deadline,
) -> Result<FaultEndpoint<T::Stream>> {
    let mut acceptor = Acceptor::bind(transport, addr, config).await?;
    acceptor.accept(deadline).await
}

/// Connect to `addr`, retrying refused attempts until `policy` runs out.
///
/// A refusal waits `backoff` and tries again. `ConnectTimeout` is returned
/// only once the whole budget has elapsed; any other connect error is
/// returned at once.
pub async fn connect_with_retry<T: Transport>(
    transport: &T,
    addr: &str,
    policy: RetryPolicy,
) -> Result<T::Stream> {
    let deadline = deadline_after(policy.max_total);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match tokio::time::timeout_at(deadline, transport.connect(addr)).await {
            Ok(Ok(stream)) => {
                tracing::debug!(addr, attempts, "connected");
                return Ok(stream);
            },
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tracing::debug!(addr, attempts, "connection refused, retrying");
            },
            Ok(Err(e)) => return Err(FaultError::Io(e)),
            Err(_) => {},
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep_until((now + policy.backoff).min(deadline)).await;
    }

    Err(FaultError::ConnectTimeout { address: addr.to_string(), limit: policy.max_total, attempts })
}

/// How a reply relates to the request it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCheck {
    /// Correlated reply, as configured.
    Correlated,
    /// Uncorrelated reply, produced on purpose.
    Injected,
    /// No reply was written, as configured.
    Withheld,
    /// The reply does not match what the endpoint was configured to send.
    Misbehaved,
}

/// One request received by the destination and what was done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    /// Request as received.
    pub request: RequestFrame,
    /// Outcome the endpoint applied.
    pub outcome: ResponseOutcome,
    /// Reply actually written, if any.
    pub reply: Option<ResponseFrame>,
    /// How long the peer waited on a withheld reply before hanging up.
    pub waited: Option<Duration>,
}

impl Exchange {
    /// Classify the reply against the configured outcome.
    ///
    /// A corrupted reply only counts as [`ReplyCheck::Injected`] when the
    /// outcome asked for corruption. Anything else that fails correlation
    /// is the endpoint's own fault.
    pub fn check(&self) -> ReplyCheck {
        match (self.reply, self.outcome.sends_reply()) {
            (None, false) => ReplyCheck::Withheld,
            (None, true) | (Some(_), false) => ReplyCheck::Misbehaved,
            (Some(reply), true) => {
                match (reply.answers(&self.request), self.outcome.corrupts_reply()) {
                    (true, false) => ReplyCheck::Correlated,
                    (false, true) => ReplyCheck::Injected,
                    _ => ReplyCheck::Misbehaved,
                }
            },
        }
    }
}

/// One connection to the process under test.
pub struct FaultEndpoint<S> {
    stream: Option<S>,
    config: EndpointConfig,
}

impl<S> FaultEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established stream.
    pub fn new(stream: S, config: EndpointConfig) -> Self {
        Self { stream: Some(stream), config }
    }

    /// Time limits in use.
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Whether the connection is still open on this side.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Drop the connection.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("connection closed by endpoint");
        }
    }

    fn stream_mut(&mut self) -> Result<&mut S> {
        self.stream.as_mut().ok_or(FaultError::NotConnected)
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.poisons_connection()
        {
            tracing::debug!(error = %e, "dropping connection");
            self.stream = None;
        }
        result
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let deadline = deadline_after(self.config.request_timeout);
        let stream = self.stream_mut()?;
        let result =
            run_bounded(deadline, "write to peer", framed::write_flush(stream, bytes)).await;
        self.settle(result)
    }

    async fn send_zeroes(&mut self, len: u64) -> Result<()> {
        let deadline = deadline_after(self.config.request_timeout);
        let stream = self.stream_mut()?;
        let result =
            run_bounded(deadline, "read reply data", framed::write_zeroes(stream, len)).await;
        self.settle(result)
    }

    async fn wait_for_close(&mut self, deadline: Deadline) -> Result<bool> {
        let stream = self.stream_mut()?;
        let result = framed::drain_until_close(stream, deadline).await;
        self.settle(result)
    }

    /// Withhold everything until the peer gives up.
    ///
    /// Returns how long the peer held on before closing; fails with
    /// `Timeout` if it is still connected when the stall limit passes. The
    /// connection is dropped either way.
    pub async fn stall(&mut self, operation: &'static str) -> Result<Duration> {
        let limit = self.config.stall_limit;
        let started = Instant::now();
        tracing::warn!(operation, ?limit, "stalling");
        let closed = self.wait_for_close(deadline_after(limit)).await?;
        self.close();
        if closed {
            let waited = started.elapsed();
            tracing::info!(operation, ?waited, "peer gave up");
            Ok(waited)
        } else {
            Err(FaultError::Timeout { operation, limit })
        }
    }

    /// Whether the peer closes its side before `deadline`.
    ///
    /// A connection already closed by this side counts as closed. The
    /// connection is dropped afterwards.
    pub async fn expect_orderly_close(&mut self, deadline: Deadline) -> bool {
        if !self.is_connected() {
            return true;
        }
        let closed = match self.wait_for_close(deadline).await {
            Ok(closed) => closed,
            Err(e) => {
                tracing::warn!(error = %e, "error while waiting for peer to close");
                false
            },
        };
        self.close();
        closed
    }

    // Destination role

    /// Send the handshake chosen by `outcome`.
    ///
    /// For [`HandshakeOutcome::Hang`] returns how long the peer waited for
    /// the handshake before hanging up.
    pub async fn perform_handshake(
        &mut self,
        outcome: HandshakeOutcome,
        export_size: u64,
    ) -> Result<Option<Duration>> {
        let sent = match outcome {
            HandshakeOutcome::Correct => {
                tracing::debug!(export_size, "sending handshake");
                self.send(&HandshakeFrame::accepting(export_size).encode()).await
            },
            HandshakeOutcome::WrongMagic => {
                tracing::warn!("sending handshake with wrong magic");
                self.send(&encode_handshake(WRONG_HELLO_MAGIC, export_size)).await
            },
            HandshakeOutcome::WrongSize => {
                let wrong = export_size.wrapping_add(1);
                tracing::warn!(export_size, wrong, "sending handshake with wrong size");
                self.send(&HandshakeFrame::accepting(wrong).encode()).await
            },
            HandshakeOutcome::Hang => {
                let waited = self.stall("source to give up on the handshake").await?;
                return Ok(Some(waited));
            },
            HandshakeOutcome::CloseImmediately => {
                tracing::warn!("closing before handshake");
                self.close();
                Ok(())
            },
        };
        sent.map(|()| None)
    }

    /// Receive one request, draining a WRITE's payload.
    ///
    /// Returns `None` if the peer closed cleanly between requests.
    pub async fn receive_request(&mut self) -> Result<Option<RequestFrame>> {
        let deadline = deadline_after(self.config.request_timeout);
        let stream = self.stream_mut()?;
        let result = read_request(stream, deadline).await;
        self.settle(result)
    }

    /// Answer `request` according to `outcome`.
    ///
    /// A successful READ reply is followed by `length` zero bytes. Every
    /// write is bounded by the request timeout.
    pub async fn respond(
        &mut self,
        request: RequestFrame,
        outcome: ResponseOutcome,
    ) -> Result<Exchange> {
        let unanswered = Exchange { request, outcome, reply: None, waited: None };
        let request = &request;
        let reply = match outcome {
            ResponseOutcome::Correct => ResponseFrame::reply_to(request, 0),
            ResponseOutcome::Error(code) => {
                tracing::warn!(code, kind = ?request.kind, "replying with error");
                ResponseFrame::reply_to(request, code)
            },
            ResponseOutcome::WrongMagic => {
                tracing::warn!(kind = ?request.kind, "replying with garbled magic");
                let honest = ResponseFrame::reply_to(request, 0);
                ResponseFrame { magic: garbled(REPLY_MAGIC), ..honest }
            },
            ResponseOutcome::WrongHandle => {
                tracing::warn!(kind = ?request.kind, "replying with corrupted handle");
                let honest = ResponseFrame::reply_to(request, 0);
                ResponseFrame { handle: honest.handle.corrupted(), ..honest }
            },
            ResponseOutcome::Hang => {
                let waited = self.stall("source to abandon the request").await?;
                return Ok(Exchange { waited: Some(waited), ..unanswered });
            },
            ResponseOutcome::CloseBeforeReply => {
                tracing::warn!(kind = ?request.kind, "closing before reply");
                self.close();
                return Ok(unanswered);
            },
        };

        self.send(&reply.encode()).await?;
        if request.kind == RequestType::Read && reply.error == 0 {
            self.send_zeroes(u64::from(request.length)).await?;
        }
        Ok(Exchange { reply: Some(reply), ..unanswered })
    }

    /// Receive one request and answer it according to `outcome`.
    pub async fn exchange_one_request(&mut self, outcome: ResponseOutcome) -> Result<Exchange> {
        let request = self.receive_request().await?.ok_or(FaultError::FrameIncomplete {
            frame: FrameKind::Request,
            expected: RequestFrame::SIZE,
            received: 0,
        })?;
        self.respond(request, outcome).await
    }

    // Source role

    /// Read the destination's handshake.
    pub async fn read_hello(&mut self, deadline: Deadline) -> Result<HandshakeFrame> {
        let stream = self.stream_mut()?;
        let result = framed::decode_handshake(stream, deadline).await;
        self.settle(result)
    }

    /// Send a request with the standard magic.
    pub async fn send_request(
        &mut self,
        kind: RequestType,
        handle: &[u8],
        offset: i64,
        length: u32,
    ) -> Result<()> {
        let bytes = encode_request(kind, handle, offset, length, REQUEST_MAGIC)?;
        self.send(&bytes).await
    }

    /// Send raw payload bytes.
    pub async fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.send(data).await
    }

    /// Read one reply.
    pub async fn read_response(&mut self, deadline: Deadline) -> Result<ResponseFrame> {
        let stream = self.stream_mut()?;
        let result = framed::decode_response(stream, deadline).await;
        self.settle(result)
    }

    /// Read `len` bytes of READ reply data.
    pub async fn read_payload(&mut self, len: usize, deadline: Deadline) -> Result<Bytes> {
        let stream = self.stream_mut()?;
        let result = framed::read_payload(stream, len, deadline).await;
        self.settle(result)
    }

    async fn checked_response(
        &mut self,
        kind: RequestType,
        handle: Handle,
    ) -> Result<ResponseFrame> {
        let deadline = deadline_after(self.config.request_timeout);
        let reply = self.read_response(deadline).await?;
        if !reply.has_valid_magic() {
            return Err(FaultError::mismatch(format!("reply magic {:02x?}", reply.magic)));
        }
        if reply.handle != handle {
            return Err(FaultError::mismatch(format!(
                "reply handle {:?} does not answer {:?}",
                reply.handle, handle
            )));
        }
        if reply.error != 0 {
            return Err(FaultError::Rejected {
                reason: format!("{kind:?} failed with error {}", reply.error),
            });
        }
        Ok(reply)
    }

    /// Write `data` at `offset` and wait for a successful reply.
    pub async fn write_at(&mut self, offset: i64, data: &[u8]) -> Result<ResponseFrame> {
        let length = u32::try_from(data.len())
            .map_err(|_| FaultError::mismatch(format!("write of {} bytes", data.len())))?;
        self.send_request(RequestType::Write, &DEFAULT_HANDLE.to_bytes(), offset, length).await?;
        self.write_data(data).await?;
        self.checked_response(RequestType::Write, DEFAULT_HANDLE).await
    }

    /// Read `len` bytes at `offset`.
    pub async fn read_at(&mut self, offset: i64, len: u32) -> Result<Bytes> {
        self.send_request(RequestType::Read, &DEFAULT_HANDLE.to_bytes(), offset, len).await?;
        self.checked_response(RequestType::Read, DEFAULT_HANDLE).await?;
        let deadline = deadline_after(self.config.request_timeout);
        self.read_payload(len as usize, deadline).await
    }

    /// Ask for the handoff and wait for its reply.
    pub async fn entrust(&mut self) -> Result<ResponseFrame> {
        self.send_request(RequestType::Entrust, &DEFAULT_HANDLE.to_bytes(), 0, 0).await?;
        self.checked_response(RequestType::Entrust, DEFAULT_HANDLE).await
    }

    /// End the session with DISCONNECT and close.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.send_request(RequestType::Disconnect, &DEFAULT_HANDLE.to_bytes(), 0, 0).await?;
        let deadline = deadline_after(self.config.close_timeout);
        if let Some(mut stream) = self.stream.take() {
            // Peer may already be gone.
            let _ = run_bounded(deadline, "shutdown", stream.shutdown()).await;
        }
        Ok(())
    }
}

impl<S> FaultEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Connect to `addr` with the configured retry policy.
    pub async fn connect<T>(transport: &T, addr: &str, config: EndpointConfig) -> Result<Self>
    where
        T: Transport<Stream = S>,
    {
        let stream = connect_with_retry(transport, addr, config.connect).await?;
        Ok(Self::new(stream, config))
    }
}

async fn read_request<S>(stream: &mut S, deadline: Deadline) -> Result<Option<RequestFrame>>
where
    S: AsyncRead + Unpin,
{
    let (bytes, end) = framed::fill_within(stream, RequestFrame::SIZE, deadline).await?;
    match end {
        FillEnd::Complete => {},
        FillEnd::Closed if bytes.is_empty() => return Ok(None),
        FillEnd::Closed | FillEnd::Elapsed => {
            return Err(FaultError::FrameIncomplete {
                frame: FrameKind::Request,
                expected: RequestFrame::SIZE,
                received: bytes.len(),
            });
        },
    }

    let request = RequestFrame::decode(&bytes)?;
    if !request.has_valid_magic() {
        return Err(FaultError::mismatch(format!(
            "request magic {:02x?}, expected {:02x?}",
            request.magic, REQUEST_MAGIC
        )));
    }
    tracing::debug!(
        kind = ?request.kind,
        handle = ?request.handle,
        offset = request.offset,
        length = request.length,
        "request received"
    );

    if request.kind == RequestType::Write {
        framed::discard_payload(stream, u64::from(request.length), deadline).await?;
    }
    Ok(Some(request))
}

fn garbled(magic: [u8; 4]) -> [u8; 4] {
    magic.map(|b| !b)
}
