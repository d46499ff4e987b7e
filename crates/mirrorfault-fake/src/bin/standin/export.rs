//! The served file and the local block service over it.

use std::{io, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use mirrorfault_core::{FaultError, deadline_after, framed, run_bounded};
use mirrorfault_proto::{HandshakeFrame, NBD_EINVAL, NBD_EIO, RequestType, ResponseFrame};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Mutex,
};

use crate::Server;

/// How long a local client may sit idle between requests.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long one reply may take to write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed-size file read and written at offsets.
pub struct Export {
    file: Mutex<File>,
    size: u64,
}

impl Export {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self { file: Mutex::new(file), size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut file = self.file.lock().await;
        file.seek(io::SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; len];
        file.read_exact(&mut data).await?;
        Ok(data)
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.check_range(offset, data.len())?;
        let mut file = self.file.lock().await;
        file.seek(io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await
    }

    fn check_range(&self, offset: u64, len: usize) -> io::Result<()> {
        let end = offset.checked_add(len as u64);
        if end.is_some_and(|end| end <= self.size) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{len} bytes at {offset} outside export of {}", self.size),
            ))
        }
    }
}

/// Accept local clients until the listener fails.
pub async fn serve(listener: TcpListener, server: Arc<Server>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "accepting local clients failed");
                return;
            },
        };
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            match client(stream, peer, &server).await {
                Ok(()) => tracing::debug!(%peer, "client done"),
                Err(e) => tracing::warn!(%peer, error = %e, "client dropped"),
            }
        });
    }
}

async fn client(
    mut stream: TcpStream,
    peer: SocketAddr,
    server: &Server,
) -> Result<(), FaultError> {
    if !server.allows(peer.ip()).await {
        tracing::info!(%peer, "refused by access list");
        return Ok(());
    }
    let export = &server.export;
    send(&mut stream, &HandshakeFrame::accepting(export.size()).encode()).await?;

    loop {
        let deadline = deadline_after(IDLE_TIMEOUT);
        let request = match framed::decode_request(&mut stream, deadline).await {
            Ok(request) => request,
            Err(FaultError::FrameIncomplete { received: 0, .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !request.has_valid_magic() {
            return Err(FaultError::ProtocolMismatch {
                reason: format!("request magic {:02x?}", request.magic),
            });
        }

        let offset = u64::try_from(request.offset).ok();
        let len = request.length as usize;
        match (request.kind, offset) {
            (RequestType::Disconnect, _) => return Ok(()),
            (RequestType::Write, offset) => {
                let data = framed::read_payload(&mut stream, len, deadline).await?;
                let error = match offset {
                    Some(offset) => outcome(export.write(offset, &data).await),
                    None => NBD_EINVAL,
                };
                send(&mut stream, &ResponseFrame::reply_to(&request, error).encode()).await?;
            },
            (RequestType::Read, Some(offset)) => match export.read(offset, len).await {
                Ok(data) => {
                    send(&mut stream, &ResponseFrame::reply_to(&request, 0).encode()).await?;
                    send(&mut stream, &data).await?;
                },
                Err(e) => {
                    tracing::warn!(offset, len, error = %e, "read failed");
                    send(&mut stream, &ResponseFrame::reply_to(&request, NBD_EIO).encode())
                        .await?;
                },
            },
            (RequestType::Read, None) | (RequestType::Entrust, _) => {
                let reply = ResponseFrame::reply_to(&request, NBD_EINVAL);
                send(&mut stream, &reply.encode()).await?;
            },
        }
    }
}

fn outcome(result: io::Result<()>) -> u32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(error = %e, "write failed");
            NBD_EIO
        },
    }
}

async fn send<W>(writer: &mut W, bytes: &[u8]) -> Result<(), FaultError>
where
    W: AsyncWrite + Unpin,
{
    let deadline = deadline_after(WRITE_TIMEOUT);
    run_bounded(deadline, "reply to client", framed::write_flush(writer, bytes)).await
}
