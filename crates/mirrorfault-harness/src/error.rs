//! Scenario error types.

use std::time::Duration;

use mirrorfault_core::{FaultError, TerminalState};
use thiserror::Error;

/// Why a scenario failed.
///
/// [`ScenarioError::Harness`] is the harness's own plumbing failing and
/// says nothing about the process under test. Every other variant is a
/// verdict.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// Harness-side setup or teardown failed.
    #[error("harness failure while {context}: {source}")]
    Harness {
        /// What the harness was doing.
        context: &'static str,
        /// Underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The fault endpoint could not complete its script.
    #[error("fault endpoint failed: {0}")]
    Fault(#[from] FaultError),

    /// The endpoint ran but never reached its injection point.
    #[error("scenario {scenario} never injected its fault")]
    NotInjected {
        /// Scenario name.
        scenario: &'static str,
    },

    /// The process under test ended in the wrong state.
    #[error("expected {expected}, observed {observed}")]
    UnexpectedExit {
        /// Terminal state fixed at spawn.
        expected: TerminalState,
        /// What actually happened.
        observed: String,
    },

    /// An expected diagnostic substring never appeared.
    #[error("diagnostic {expected:?} not found (reply: {reply:?})")]
    Diagnostic {
        /// Substring looked for.
        expected: &'static str,
        /// Control reply at the time.
        reply: String,
    },

    /// The process stopped serving local reads and writes.
    #[error("local service unavailable: {reason}")]
    ServiceUnavailable {
        /// What failed.
        reason: String,
    },

    /// The process held on to a withheld reply past its request limit.
    #[error("scenario {scenario} waited {waited:?} before aborting, allowed {allowed:?}")]
    SlowAbort {
        /// Scenario name.
        scenario: &'static str,
        /// How long the process waited.
        waited: Duration,
        /// Request limit plus slack.
        allowed: Duration,
    },

    /// The process retried when it should have given up, or the reverse.
    #[error("scenario {scenario} expected reconnect={expected}, observed the opposite")]
    RetryMismatch {
        /// Scenario name.
        scenario: &'static str,
        /// Whether a reconnect was required.
        expected: bool,
    },

    /// A control command was refused.
    #[error("control command {command} refused: {reply}")]
    ControlRejected {
        /// Command verb.
        command: &'static str,
        /// Reply line.
        reply: String,
    },

    /// The endpoint sent a reply it was not configured to send.
    #[error("fault endpoint misbehaved: {detail}")]
    EndpointMisbehaved {
        /// Offending exchange.
        detail: String,
    },
}

impl ScenarioError {
    pub(crate) fn harness(
        context: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Harness { context, source: source.into() }
    }

    /// Whether this is the harness failing rather than a verdict.
    pub fn is_harness(&self) -> bool {
        matches!(self, Self::Harness { .. })
    }
}

/// Result alias for scenario operations.
pub type Result<T> = std::result::Result<T, ScenarioError>;
