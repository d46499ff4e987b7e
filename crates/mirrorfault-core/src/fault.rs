//! Fault catalogue.
//!
//! A [`FaultScenario`] names one divergence from correct destination
//! behavior and the reaction the source must show for it. The catalogue
//! is fixed; scenarios are looked up by name.

use std::fmt;

use mirrorfault_proto::NBD_EIO;

use self::{
    Expectation as E, HandshakeOutcome as H, ResponseOutcome as R,
    TerminalState::{Aborted, Entrusted, Killed, Terminated},
};

/// How the endpoint answers (or fails to answer) the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Accepting magic and the agreed export size.
    Correct,
    /// Handshake with a magic the source must refuse.
    WrongMagic,
    /// Handshake whose export size differs from the source's.
    WrongSize,
    /// Send nothing until the stall limit passes.
    Hang,
    /// Close before sending any byte.
    CloseImmediately,
}

/// How the endpoint answers one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Correlated reply with error 0.
    Correct,
    /// Withhold the reply until the stall limit passes.
    Hang,
    /// Close without replying.
    CloseBeforeReply,
    /// Reply with a garbled magic.
    WrongMagic,
    /// Reply echoing a corrupted handle.
    WrongHandle,
    /// Correlated reply carrying a non-zero error code.
    Error(u32),
}

impl ResponseOutcome {
    /// Whether a reply sent under this outcome is meant to fail correlation.
    pub const fn corrupts_reply(self) -> bool {
        matches!(self, Self::WrongMagic | Self::WrongHandle)
    }

    /// Whether any reply frame is written under this outcome.
    pub const fn sends_reply(self) -> bool {
        matches!(self, Self::Correct | Self::WrongMagic | Self::WrongHandle | Self::Error(_))
    }
}

/// Protocol point and kind of one injected divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Behave correctly through the handoff.
    None,
    /// Never listen; the source's connect is refused.
    RefuseConnection,
    /// Diverge at the handshake.
    Handshake(HandshakeOutcome),
    /// Correct handshake, then close before any request.
    CloseAfterHandshake,
    /// Correct handshake, then the operator cancels the migration.
    CancelAfterHandshake,
    /// Correct handshake, then the source process gets SIGTERM.
    TerminateAfterHandshake,
    /// Correct handshake, diverge on the first WRITE reply.
    FirstWrite(ResponseOutcome),
    /// Answer every WRITE, diverge on the ENTRUST reply.
    Entrust(ResponseOutcome),
}

impl Fault {
    /// Handshake the endpoint sends under this fault, if it accepts at all.
    pub const fn handshake_outcome(self) -> Option<HandshakeOutcome> {
        match self {
            Self::RefuseConnection => None,
            Self::Handshake(outcome) => Some(outcome),
            Self::None
            | Self::CloseAfterHandshake
            | Self::CancelAfterHandshake
            | Self::TerminateAfterHandshake
            | Self::FirstWrite(_)
            | Self::Entrust(_) => Some(HandshakeOutcome::Correct),
        }
    }

    /// Whether the divergence lands strictly before the irrevocable handoff.
    pub const fn before_handoff(self) -> bool {
        !matches!(self, Self::None | Self::Entrust(_))
    }

    /// Reply outcome for a WRITE after `writes_answered` earlier WRITEs.
    pub const fn reply_for_write(self, writes_answered: usize) -> ResponseOutcome {
        match self {
            Self::FirstWrite(outcome) if writes_answered == 0 => outcome,
            _ => ResponseOutcome::Correct,
        }
    }

    /// Reply outcome applied to ENTRUST.
    pub const fn reply_for_entrust(self) -> ResponseOutcome {
        match self {
            Self::Entrust(outcome) => outcome,
            _ => ResponseOutcome::Correct,
        }
    }
}

/// Terminal state of the source process once a scenario has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalState {
    /// Handoff completed; the source exits with status 0.
    Entrusted,
    /// Mirroring abandoned; the source keeps serving locally.
    Aborted,
    /// The source died by SIGKILL during the in-flight handoff.
    Killed,
    /// The source was sent SIGTERM mid-migration and quit with status 1.
    Terminated,
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entrusted => write!(f, "entrusted"),
            Self::Aborted => write!(f, "aborted"),
            Self::Killed => write!(f, "killed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// What the source must visibly do for a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    /// Terminal state.
    pub terminal: TerminalState,
    /// Substring expected on the diagnostic stream or in the control reply.
    pub diagnostic: Option<&'static str>,
    /// Substring expected in the `mirror` control reply, case-insensitive.
    pub reply: Option<&'static str>,
    /// Whether the source must reconnect after the endpoint hangs up on it.
    pub reconnect: Option<bool>,
}

impl Expectation {
    const fn terminal(terminal: TerminalState) -> Self {
        Self { terminal, diagnostic: None, reply: None, reconnect: None }
    }

    const fn with_diagnostic(self, diagnostic: &'static str) -> Self {
        Self { diagnostic: Some(diagnostic), ..self }
    }

    const fn with_reply(self, reply: &'static str) -> Self {
        Self { reply: Some(reply), ..self }
    }

    const fn with_reconnect(self, reconnect: bool) -> Self {
        Self { reconnect: Some(reconnect), ..self }
    }

    /// A write fault: abandon the migration, say so, keep serving.
    const fn write_abort() -> Self {
        Self::terminal(Aborted).with_diagnostic(WRITE_FAILED)
    }
}

/// Diagnostic a source emits when a mirror write fails.
pub const WRITE_FAILED: &str = "Mirror write failed";

/// One catalogued fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultScenario {
    /// Stable name.
    pub name: &'static str,
    /// Injected divergence.
    pub fault: Fault,
    /// Required reaction of the source.
    pub expect: Expectation,
}

impl FaultScenario {
    /// Look up a catalogued scenario.
    pub fn by_name(name: &str) -> Option<&'static Self> {
        CATALOGUE.iter().find(|s| s.name == name)
    }

    /// All catalogued scenarios.
    pub fn all() -> &'static [Self] {
        CATALOGUE
    }
}

impl fmt::Display for FaultScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

const fn scenario(name: &'static str, fault: Fault, expect: Expectation) -> FaultScenario {
    FaultScenario { name, fault, expect }
}

static CATALOGUE: &[FaultScenario] = &[
    scenario("accept_mirror", Fault::None, E::terminal(Entrusted)),
    scenario(
        "refuse_connect",
        Fault::RefuseConnection,
        E::terminal(Aborted).with_diagnostic("failed to connect"),
    ),
    scenario(
        "hang_after_connect",
        Fault::Handshake(H::Hang),
        E::terminal(Aborted).with_diagnostic("Remote server failed to respond"),
    ),
    scenario(
        "reject_acl",
        Fault::Handshake(H::CloseImmediately),
        E::terminal(Aborted).with_diagnostic("Mirror was rejected"),
    ),
    scenario(
        "hello_wrong_magic",
        Fault::Handshake(H::WrongMagic),
        E::terminal(Aborted).with_diagnostic("Mirror was rejected"),
    ),
    scenario(
        "hello_wrong_size",
        Fault::Handshake(H::WrongSize),
        E::terminal(Aborted).with_diagnostic("Remote size does not match local size"),
    ),
    scenario(
        "close_after_hello",
        Fault::CloseAfterHandshake,
        E::terminal(Aborted).with_reply("mirror started").with_reconnect(true),
    ),
    scenario("break_after_hello", Fault::CancelAfterHandshake, E::terminal(Aborted)),
    scenario("sigterm_after_hello", Fault::TerminateAfterHandshake, E::terminal(Terminated)),
    scenario("hang_after_write", Fault::FirstWrite(R::Hang), E::write_abort()),
    scenario("error_on_write", Fault::FirstWrite(R::Error(NBD_EIO)), E::write_abort()),
    scenario("close_after_write", Fault::FirstWrite(R::CloseBeforeReply), E::write_abort()),
    scenario("write_wrong_magic", Fault::FirstWrite(R::WrongMagic), E::write_abort()),
    scenario("write_wrong_handle", Fault::FirstWrite(R::WrongHandle), E::write_abort()),
    scenario("close_after_writes", Fault::Entrust(R::CloseBeforeReply), E::terminal(Killed)),
    scenario("entrust_wrong_magic", Fault::Entrust(R::WrongMagic), E::terminal(Killed)),
];

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn names_are_unique() {
        let names: HashSet<_> = FaultScenario::all().iter().map(|s| s.name).collect();
        assert_eq!(names.len(), FaultScenario::all().len());
    }

    #[test]
    fn terminal_state_follows_handoff_point() {
        for scenario in FaultScenario::all() {
            let expected = match scenario.fault {
                Fault::None => Entrusted,
                Fault::Entrust(_) => Killed,
                Fault::TerminateAfterHandshake => Terminated,
                _ => Aborted,
            };
            assert_eq!(scenario.expect.terminal, expected, "{scenario}");
            assert_eq!(
                scenario.fault.before_handoff(),
                matches!(expected, Aborted | Terminated),
                "{scenario}: handoff ordering"
            );
        }
    }

    #[test]
    fn lookup_by_name() {
        let scenario = FaultScenario::by_name("hello_wrong_size").unwrap();
        assert_eq!(scenario.fault, Fault::Handshake(HandshakeOutcome::WrongSize));
        assert_eq!(scenario.expect.diagnostic, Some("Remote size does not match local size"));
        assert!(FaultScenario::by_name("no_such_fault").is_none());
    }

    #[test]
    fn write_faults_must_be_reported() {
        for scenario in FaultScenario::all() {
            if let Fault::FirstWrite(_) = scenario.fault {
                assert_eq!(scenario.expect.diagnostic, Some(WRITE_FAILED), "{scenario}");
            }
        }
    }

    #[test]
    fn only_close_after_hello_expects_a_retry() {
        let retrying: Vec<_> = FaultScenario::all()
            .iter()
            .filter(|s| s.expect.reconnect == Some(true))
            .map(|s| s.name)
            .collect();
        assert_eq!(retrying, ["close_after_hello"]);
    }

    #[test]
    fn only_first_write_diverges() {
        let fault = Fault::FirstWrite(ResponseOutcome::Hang);
        assert_eq!(fault.reply_for_write(0), ResponseOutcome::Hang);
        assert_eq!(fault.reply_for_write(1), ResponseOutcome::Correct);
        assert_eq!(fault.reply_for_entrust(), ResponseOutcome::Correct);
    }

    #[test]
    fn refusal_sends_no_handshake() {
        assert_eq!(Fault::RefuseConnection.handshake_outcome(), None);
        assert_eq!(
            Fault::Entrust(ResponseOutcome::WrongMagic).handshake_outcome(),
            Some(HandshakeOutcome::Correct)
        );
    }

    #[test]
    fn corrupting_outcomes() {
        assert!(ResponseOutcome::WrongHandle.corrupts_reply());
        assert!(ResponseOutcome::WrongMagic.corrupts_reply());
        assert!(!ResponseOutcome::Error(NBD_EIO).corrupts_reply());
        assert!(!ResponseOutcome::Hang.sends_reply());
    }
}
