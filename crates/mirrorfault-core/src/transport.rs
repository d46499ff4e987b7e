//! Network abstraction for deterministic testing.
//!
//! The `Transport` trait decouples the fault endpoint from the socket
//! implementation. Production uses tokio TCP; simulations plug in turmoil's
//! virtual network so that every stall and retry runs on a virtual clock.
//!
//! # Invariants
//!
//! - Streams are plain byte pipes: no framing, no buffering between calls.
//! - A refused connection surfaces as `io::ErrorKind::ConnectionRefused`, so
//!   that connect retry can tell refusal from other failures.

use std::{future::Future, io, net::SocketAddr};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};

/// Socket factory used by the fault endpoint.
pub trait Transport: Clone + Send + Sync + 'static {
    /// Connected byte stream.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Bound listening socket.
    type Listener: Send + 'static;

    /// Bind a listener on `addr` (`host:port`).
    fn bind(&self, addr: &str) -> impl Future<Output = io::Result<Self::Listener>> + Send;

    /// Wait for one inbound connection.
    fn accept(
        &self,
        listener: &mut Self::Listener,
    ) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    /// Open a connection to `addr` (`host:port`).
    fn connect(&self, addr: &str) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Address a listener is bound to.
    fn local_addr(&self, listener: &Self::Listener) -> io::Result<SocketAddr>;
}

/// Real TCP through tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    type Listener = TcpListener;
    type Stream = TcpStream;

    async fn bind(&self, addr: &str) -> io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    async fn accept(&self, listener: &mut TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }

    async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn local_addr(&self, listener: &TcpListener) -> io::Result<SocketAddr> {
        listener.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn tcp_round_trip_on_loopback() {
        let transport = TcpTransport;
        let mut listener = transport.bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr(&listener).unwrap().to_string();

        let client = tokio::spawn(async move {
            let mut stream = TcpTransport.connect(&addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let (mut stream, _) = transport.accept(&mut listener).await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connect_is_reported_as_refusal() {
        let transport = TcpTransport;
        let listener = transport.bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr(&listener).unwrap().to_string();
        drop(listener);

        let err = transport.connect(&addr).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
