//! Fault-injecting peer for the block-device mirroring protocol.
//!
//! The endpoint stands in for the remote side of a migration and produces
//! exactly one scripted divergence per run, so that each failure path of
//! the process under test can be exercised alone.
//!
//! # Architecture
//!
//! ```text
//! script::run_fault ── FaultScenario catalogue (fault)
//!        │
//!        ▼
//! endpoint::FaultEndpoint ── framed (deadline-bounded reads)
//!        │                        │
//!        ▼                        ▼
//! transport::Transport      guard::run_bounded
//!  (tokio TCP / turmoil)
//! ```
//!
//! # Invariants
//!
//! - No await on a socket is unbounded. Every read, write, accept and
//!   connect has a deadline, and an expired deadline is an error, never a
//!   success.
//! - The endpoint never retries on behalf of an injected fault.
//! - Payload bytes are drained, never inspected or stored.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod fault;
pub mod framed;
pub mod guard;
pub mod script;
pub mod transport;

pub use config::EndpointConfig;
pub use control::{ControlClient, ControlFraming, ControlReply};
pub use endpoint::{
    Acceptor, DEFAULT_HANDLE, Exchange, FaultEndpoint, ReplyCheck, connect_with_retry,
    listen_and_accept,
};
pub use error::{FaultError, Result};
pub use fault::{
    Expectation, Fault, FaultScenario, HandshakeOutcome, ResponseOutcome, TerminalState,
    WRITE_FAILED,
};
pub use guard::{Deadline, RetryPolicy, TimeoutGuard, deadline_after, run_bounded};
pub use script::{Milestones, ScriptReport, run_fault};
pub use transport::{TcpTransport, Transport};
