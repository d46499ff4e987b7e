//! Command lines for the server binary.
//!
//! The binary exposes four verbs: `serve`, `read`, `write` and `mirror`.
//! Its `--verbose` flag is optional, so its presence is detected once from
//! `serve --help` and then added to every invocation.

use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::{io::AsyncWriteExt, process::Command};

use crate::error::{Result, ScenarioError};

/// Builder for invocations of one server binary.
#[derive(Debug, Clone)]
pub struct ServerCommand {
    binary: PathBuf,
    verbose: bool,
}

impl ServerCommand {
    /// Use `binary`, with verbosity as given.
    pub fn new(binary: impl Into<PathBuf>, verbose: bool) -> Self {
        Self { binary: binary.into(), verbose }
    }

    /// Use `binary`, adding `--verbose` if its `serve --help` mentions it.
    pub async fn detect(binary: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let binary = binary.into();
        let mut help = Command::new(&binary);
        help.args(["serve", "--help"]).stdin(Stdio::null()).kill_on_drop(true);
        let output = tokio::time::timeout(timeout, help.output())
            .await
            .map_err(|_| ScenarioError::harness("reading server help", "timed out"))?
            .map_err(|e| ScenarioError::harness("reading server help", e))?;

        let verbose = mentions_verbose(&output.stdout, &output.stderr);
        tracing::debug!(binary = %binary.display(), verbose, "server binary detected");
        Ok(Self { binary, verbose })
    }

    /// Path of the binary.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Whether `--verbose` is passed.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    fn verb(&self, verb: &str) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg(verb);
        if self.verbose {
            command.arg("--verbose");
        }
        command
    }

    /// Serve `file` on `addr:port` with control socket `sock`.
    pub fn serve(
        &self,
        addr: IpAddr,
        port: u16,
        file: &Path,
        sock: &Path,
        acl: &[String],
    ) -> Command {
        let mut command = self.verb("serve");
        command
            .arg("--addr")
            .arg(addr.to_string())
            .arg("--port")
            .arg(port.to_string())
            .arg("--file")
            .arg(file)
            .arg("--sock")
            .arg(sock)
            .args(acl);
        command
    }

    /// Read `size` bytes at `from` from a server; data goes to stdout.
    pub fn read(&self, addr: IpAddr, port: u16, from: u64, size: u64) -> Command {
        let mut command = self.verb("read");
        command.args(endpoint_args(addr, port)).args(range_args(from, size));
        command
    }

    /// Write `size` bytes at `from` to a server; data comes from stdin.
    pub fn write(&self, addr: IpAddr, port: u16, from: u64, size: u64) -> Command {
        let mut command = self.verb("write");
        command.args(endpoint_args(addr, port)).args(range_args(from, size));
        command
    }

    /// Ask the server behind `sock` to mirror to `addr:port`.
    pub fn mirror(&self, addr: IpAddr, port: u16, sock: &Path) -> Command {
        let mut command = self.verb("mirror");
        command.args(endpoint_args(addr, port)).arg("--sock").arg(sock);
        command
    }

    /// Read through the `read` verb.
    pub async fn cli_read(
        &self,
        addr: IpAddr,
        port: u16,
        from: u64,
        size: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let mut command = self.read(addr, port, from, size);
        command.stdin(Stdio::null()).kill_on_drop(true);
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| ScenarioError::ServiceUnavailable { reason: "read timed out".into() })?
            .map_err(|e| ScenarioError::harness("running read", e))?;

        if !output.status.success() {
            return Err(ScenarioError::ServiceUnavailable {
                reason: format!(
                    "read failed with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output.stdout)
    }

    /// Write `data` through the `write` verb.
    pub async fn cli_write(
        &self,
        addr: IpAddr,
        port: u16,
        from: u64,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let mut command = self.write(addr, port, from, data.len() as u64);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|e| ScenarioError::harness("running write", e))?;

        let run = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(data).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };
        let output = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| ScenarioError::ServiceUnavailable { reason: "write timed out".into() })?
            .map_err(|e| ScenarioError::harness("running write", e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ScenarioError::ServiceUnavailable {
                reason: format!(
                    "write failed with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

fn mentions_verbose(stdout: &[u8], stderr: &[u8]) -> bool {
    [stdout, stderr].iter().any(|text| String::from_utf8_lossy(text).contains("--verbose"))
}

fn endpoint_args(addr: IpAddr, port: u16) -> [String; 4] {
    ["--addr".into(), addr.to_string(), "--port".into(), port.to_string()]
}

fn range_args(from: u64, size: u64) -> [String; 4] {
    ["--from".into(), from.to_string(), "--size".into(), size.to_string()]
}
