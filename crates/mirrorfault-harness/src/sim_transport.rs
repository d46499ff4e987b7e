//! Turmoil implementation of [`Transport`].
//!
//! Streams run over turmoil's simulated network, so stalls, refusals and
//! retry backoff all play out on the virtual clock.

use std::{io, net::SocketAddr};

use mirrorfault_core::Transport;
use turmoil::net::{TcpListener, TcpStream};

/// Simulated TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimTransport;

impl Transport for SimTransport {
    type Listener = TcpListener;
    type Stream = TcpStream;

    async fn bind(&self, addr: &str) -> io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    async fn accept(&self, listener: &mut TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
        listener.accept().await
    }

    async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }

    fn local_addr(&self, listener: &TcpListener) -> io::Result<SocketAddr> {
        listener.local_addr()
    }
}
