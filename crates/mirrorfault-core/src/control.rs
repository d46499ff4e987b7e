//! Control-channel client.
//!
//! The process under test listens on a Unix socket for one command per
//! connection and answers with one `<code>: <message>` line. Code `0` is
//! success.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
};

use crate::{
    error::{FaultError, Result},
    guard::{deadline_after, run_bounded},
};

/// How a command's tokens are laid out on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlFraming {
    /// Tokens joined by spaces on one newline-terminated line.
    #[default]
    Line,
    /// One token per line, ended by a blank line.
    LinesUntilBlank,
}

impl ControlFraming {
    fn encode(self, tokens: &[&str]) -> String {
        match self {
            Self::Line => format!("{}\n", tokens.join(" ")),
            Self::LinesUntilBlank => {
                let mut out = tokens.join("\n");
                out.push_str("\n\n");
                out
            },
        }
    }
}

/// Parsed reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    /// Status token before the colon.
    pub code: String,
    /// Text after `": "`.
    pub message: String,
}

impl ControlReply {
    /// Parse `<code>: <message>`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (code, message) = line
            .split_once(':')
            .ok_or_else(|| FaultError::mismatch(format!("malformed control reply {line:?}")))?;
        Ok(Self { code: code.trim().to_string(), message: message.trim_start().to_string() })
    }

    /// Whether the command succeeded.
    pub fn is_success(&self) -> bool {
        self.code == "0"
    }

    /// The reply, or `Rejected` if the code is not `0`.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FaultError::Rejected { reason: format!("{}: {}", self.code, self.message) })
        }
    }
}

/// Client for the control socket of one process.
#[derive(Debug, Clone)]
pub struct ControlClient {
    path: PathBuf,
    timeout: Duration,
    framing: ControlFraming,
}

impl ControlClient {
    /// Client for the socket at `path`; each command is bounded by `timeout`.
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self { path: path.into(), timeout, framing: ControlFraming::default() }
    }

    /// Use a different command framing.
    pub fn with_framing(self, framing: ControlFraming) -> Self {
        Self { framing, ..self }
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send one command and read its reply.
    ///
    /// The reply is returned whatever its code; see
    /// [`ControlReply::into_result`].
    pub async fn command(&self, tokens: &[&str]) -> Result<ControlReply> {
        let request = self.framing.encode(tokens);
        tracing::debug!(path = %self.path.display(), ?tokens, "control command");

        let line = run_bounded(deadline_after(self.timeout), "control reply", async {
            let mut stream = UnixStream::connect(&self.path).await?;
            stream.write_all(request.as_bytes()).await?;
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            Ok::<_, std::io::Error>(line)
        })
        .await?;

        if line.is_empty() {
            return Err(FaultError::mismatch("control socket closed without a reply"));
        }
        let reply = ControlReply::parse(&line)?;
        tracing::debug!(code = %reply.code, message = %reply.message, "control reply");
        Ok(reply)
    }

    /// Start mirroring to `ip:port`.
    pub async fn mirror(&self, ip: &str, port: u16) -> Result<ControlReply> {
        let port = port.to_string();
        self.command(&["mirror", ip, &port]).await
    }

    /// Replace the access list.
    pub async fn acl(&self, entries: &[&str]) -> Result<ControlReply> {
        let mut tokens = vec!["acl"];
        tokens.extend_from_slice(entries);
        self.command(&tokens).await
    }

    /// Ask for status.
    pub async fn status(&self) -> Result<ControlReply> {
        self.command(&["status"]).await
    }

    /// Cancel a running migration.
    pub async fn cancel(&self) -> Result<ControlReply> {
        self.command(&["break"]).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::{io::AsyncReadExt, net::UnixListener};

    use super::*;

    #[test]
    fn parse_reply() {
        let reply = ControlReply::parse("0: mirror started\n").unwrap();
        assert_eq!(reply.code, "0");
        assert_eq!(reply.message, "mirror started");
        assert!(reply.is_success());

        let reply = ControlReply::parse("10: unknown command\n").unwrap();
        assert!(matches!(
            reply.into_result(),
            Err(FaultError::Rejected { reason }) if reason == "10: unknown command"
        ));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            ControlReply::parse("no colon here"),
            Err(FaultError::ProtocolMismatch { .. })
        ));
    }

    #[test]
    fn framings() {
        let tokens = ["mirror", "127.0.0.1", "4000"];
        assert_eq!(ControlFraming::Line.encode(&tokens), "mirror 127.0.0.1 4000\n");
        assert_eq!(
            ControlFraming::LinesUntilBlank.encode(&tokens),
            "mirror\n127.0.0.1\n4000\n\n"
        );
    }

    #[tokio::test]
    async fn command_round_trip_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctrl");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"0: mirror started\n").await.unwrap();
            String::from_utf8(buf[..n].to_vec()).unwrap()
        });

        let client = ControlClient::new(&path, Duration::from_secs(1));
        let reply = client.mirror("127.0.0.1", 4000).await.unwrap();
        assert!(reply.is_success());
        assert_eq!(server.await.unwrap(), "mirror 127.0.0.1 4000\n");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_socket_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctrl");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
            drop(stream);
        });

        let client = ControlClient::new(&path, Duration::from_secs(2));
        let result = client.status().await;
        assert!(matches!(result, Err(FaultError::Timeout { operation: "control reply", .. })));
    }
}
