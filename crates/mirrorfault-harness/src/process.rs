//! The process under test.
//!
//! A [`ProcessHandle`] fixes the expected terminal state when the child is
//! spawned and checks it exactly once, in [`ProcessHandle::finish`]. There
//! is no shared flag for a waiter to race against: the handle owns both the
//! child and the expectation.
//!
//! Signals are delivered by running `kill(1)`.

use std::{
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use mirrorfault_core::{Deadline, TerminalState};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
};

use crate::error::{Result, ScenarioError};

/// Asks a server to stop; it must exit with status 0.
pub const SIGINT: i32 = 2;

/// Signal that ends a server during an in-flight handoff.
pub const SIGKILL: i32 = 9;

/// Interrupts a migration; the server must quit with status 1.
pub const SIGTERM: i32 = 15;

const SIGNAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Exited with a status code.
    Code(i32),
    /// Killed by a signal.
    Signal(i32),
}

impl Exit {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Code(code),
            (None, Some(signal)) => Self::Signal(signal),
            (None, None) => Self::Code(-1),
        }
    }

    /// Whether this exit is the one `terminal` allows.
    ///
    /// An aborted server is stopped with SIGINT by the harness and must
    /// then exit with status 0.
    pub fn satisfies(self, terminal: TerminalState) -> bool {
        match terminal {
            TerminalState::Entrusted | TerminalState::Aborted => self == Self::Code(0),
            TerminalState::Killed => self == Self::Signal(SIGKILL),
            TerminalState::Terminated => self == Self::Code(1),
        }
    }
}

impl std::fmt::Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit status {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// A spawned server and the state it must end in.
pub struct ProcessHandle {
    child: Child,
    expected: TerminalState,
    stderr: mpsc::UnboundedReceiver<String>,
    seen: Vec<String>,
}

impl ProcessHandle {
    /// Spawn `command`, which must end in `expected`.
    ///
    /// Stderr is collected line by line; stdout is discarded. The child is
    /// killed if the handle is dropped without [`finish`](Self::finish).
    pub fn spawn(mut command: Command, expected: TerminalState) -> Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child =
            command.spawn().map_err(|e| ScenarioError::harness("spawning server", e))?;
        tracing::info!(pid = child.id(), %expected, "server spawned");

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "server", "{line}");
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }

        Ok(Self { child, expected, stderr: rx, seen: Vec::new() })
    }

    /// Terminal state fixed at spawn.
    pub fn expected(&self) -> TerminalState {
        self.expected
    }

    /// OS process id while running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// How the process ended, or `None` while it runs.
    pub fn try_exit(&mut self) -> Result<Option<Exit>> {
        let status =
            self.child.try_wait().map_err(|e| ScenarioError::harness("polling server", e))?;
        Ok(status.map(Exit::from_status))
    }

    /// Stderr lines received so far.
    pub fn stderr_lines(&mut self) -> &[String] {
        while let Ok(line) = self.stderr.try_recv() {
            self.seen.push(line);
        }
        &self.seen
    }

    /// Wait until a stderr line contains `needle`.
    ///
    /// Returns false if `deadline` passes or stderr closes first.
    pub async fn wait_for_stderr(&mut self, needle: &str, deadline: Deadline) -> bool {
        if self.stderr_lines().iter().any(|l| l.contains(needle)) {
            return true;
        }
        loop {
            match tokio::time::timeout_at(deadline, self.stderr.recv()).await {
                Ok(Some(line)) => {
                    let found = line.contains(needle);
                    self.seen.push(line);
                    if found {
                        return true;
                    }
                },
                Ok(None) | Err(_) => return false,
            }
        }
    }

    /// Send `signal` to the process.
    pub async fn signal(&self, signal: i32) -> Result<()> {
        let pid = self
            .child
            .id()
            .ok_or_else(|| ScenarioError::harness("signalling server", "already reaped"))?;
        send_signal(pid, signal).await
    }

    /// Check the expected terminal state, then make sure the process is gone.
    ///
    /// - `Aborted`: the process must still be running. It is sent SIGINT
    ///   and must then exit with status 0.
    /// - `Entrusted`, `Killed`, `Terminated`: the process must exit on its
    ///   own within `exit_timeout`, with status 0, by SIGKILL, or with
    ///   status 1.
    pub async fn finish(mut self, exit_timeout: Duration) -> Result<Exit> {
        let expected = self.expected;

        if expected == TerminalState::Aborted {
            if let Some(exit) = self.try_exit()? {
                return Err(ScenarioError::UnexpectedExit {
                    expected,
                    observed: format!("{exit} before teardown"),
                });
            }
            self.signal(SIGINT).await?;
        }

        let status = match tokio::time::timeout(exit_timeout, self.child.wait()).await {
            Ok(status) => status.map_err(|e| ScenarioError::harness("waiting for server", e))?,
            Err(_) => {
                // Still running: reap it, then report.
                let _ = self.child.start_kill();
                let _ = self.wait(exit_timeout).await;
                return Err(ScenarioError::UnexpectedExit {
                    expected,
                    observed: format!("still running after {exit_timeout:?}"),
                });
            },
        };

        let exit = Exit::from_status(status);
        tracing::info!(%exit, %expected, "server exited");
        if exit.satisfies(expected) {
            Ok(exit)
        } else {
            Err(ScenarioError::UnexpectedExit { expected, observed: exit.to_string() })
        }
    }

    async fn wait(&mut self, limit: Duration) -> Result<ExitStatus> {
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(status) => status.map_err(|e| ScenarioError::harness("waiting for server", e)),
            Err(_) => Err(ScenarioError::harness("waiting for server", "kill did not take effect")),
        }
    }
}

/// Send `signal` to process `pid` through `kill(1)`.
pub async fn send_signal(pid: u32, signal: i32) -> Result<()> {
    let mut kill = Command::new("kill");
    kill.arg(format!("-{signal}"))
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let status = tokio::time::timeout(SIGNAL_TIMEOUT, kill.status())
        .await
        .map_err(|_| ScenarioError::harness("signalling server", "kill timed out"))?
        .map_err(|e| ScenarioError::harness("signalling server", e))?;
    if !status.success() {
        return Err(ScenarioError::harness(
            "signalling server",
            format!("kill -{signal} {pid} failed with {status}"),
        ));
    }
    tracing::info!(pid, signal, "signal sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[tokio::test]
    async fn clean_exit_satisfies_entrusted() {
        let process = ProcessHandle::spawn(sh("exit 0"), TerminalState::Entrusted).unwrap();
        assert_eq!(process.finish(Duration::from_secs(5)).await.unwrap(), Exit::Code(0));
    }

    #[tokio::test]
    async fn sigkill_satisfies_killed() {
        let process = ProcessHandle::spawn(sh("kill -9 $$"), TerminalState::Killed).unwrap();
        assert_eq!(process.finish(Duration::from_secs(5)).await.unwrap(), Exit::Signal(SIGKILL));
    }

    #[tokio::test]
    async fn other_status_is_unexpected() {
        let process = ProcessHandle::spawn(sh("exit 1"), TerminalState::Killed).unwrap();
        let err = process.finish(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            err,
            ScenarioError::UnexpectedExit { expected: TerminalState::Killed, ref observed }
                if observed == "exit status 1"
        ));
    }

    // Exits with `code` once interrupted by `signal`, after saying "ready".
    async fn trapping(signal: &str, code: i32, expected: TerminalState) -> ProcessHandle {
        let script =
            format!("trap 'kill $!; exit {code}' {signal}; echo ready >&2; sleep 30 & wait");
        let mut process = ProcessHandle::spawn(sh(&script), expected).unwrap();
        let deadline = mirrorfault_core::deadline_after(Duration::from_secs(5));
        assert!(process.wait_for_stderr("ready", deadline).await);
        process
    }

    #[tokio::test]
    async fn aborted_requires_running_process() {
        let process = trapping("INT", 0, TerminalState::Aborted).await;
        assert_eq!(process.finish(Duration::from_secs(5)).await.unwrap(), Exit::Code(0));

        let mut process = ProcessHandle::spawn(sh("exit 0"), TerminalState::Aborted).unwrap();
        while process.try_exit().unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            process.finish(Duration::from_secs(5)).await,
            Err(ScenarioError::UnexpectedExit { .. })
        ));
    }

    #[tokio::test]
    async fn unclean_stop_after_interrupt_is_unexpected() {
        let process = trapping("INT", 3, TerminalState::Aborted).await;
        let err = process.finish(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            err,
            ScenarioError::UnexpectedExit { expected: TerminalState::Aborted, ref observed }
                if observed == "exit status 3"
        ));

        let process = ProcessHandle::spawn(sh("sleep 30"), TerminalState::Aborted).unwrap();
        let err = process.finish(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            err,
            ScenarioError::UnexpectedExit { ref observed, .. } if observed == "signal 2"
        ));
    }

    #[tokio::test]
    async fn sigterm_mid_migration_quits_with_status_one() {
        let process = trapping("TERM", 1, TerminalState::Terminated).await;
        process.signal(SIGTERM).await.unwrap();
        assert_eq!(process.finish(Duration::from_secs(5)).await.unwrap(), Exit::Code(1));
    }

    #[tokio::test]
    async fn stderr_lines_are_searchable() {
        let mut process = ProcessHandle::spawn(
            sh("trap 'exit 0' INT; echo 'Remote server failed to respond' >&2; sleep 30 & wait"),
            TerminalState::Aborted,
        )
        .unwrap();
        let deadline = mirrorfault_core::deadline_after(Duration::from_secs(5));
        assert!(process.wait_for_stderr("failed to respond", deadline).await);
        process.finish(Duration::from_secs(5)).await.unwrap();
    }

    #[test]
    fn exit_contract() {
        assert!(Exit::Code(0).satisfies(TerminalState::Entrusted));
        assert!(!Exit::Signal(15).satisfies(TerminalState::Killed));
        assert!(Exit::Code(0).satisfies(TerminalState::Aborted));
        assert!(!Exit::Signal(SIGKILL).satisfies(TerminalState::Aborted));
        assert!(Exit::Code(1).satisfies(TerminalState::Terminated));
        assert!(!Exit::Code(0).satisfies(TerminalState::Terminated));
    }
}
