//! Scenario harness for a mirroring block-device server.
//!
//! Drives the binary under test through each catalogued fault: serve an
//! export, trigger a mirror at the fault endpoint, then judge how the
//! binary ended.
//!
//! # Components
//!
//! - [`ScenarioRunner`]: one scenario end to end, or the whole catalogue
//! - [`ProcessHandle`]: the child process and its expected terminal state
//! - [`ServerCommand`]: command lines for the binary's verbs
//! - [`SimTransport`]: turmoil network for deterministic endpoint tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod error;
pub mod process;
pub mod runner;
pub mod sim_transport;

pub use command::ServerCommand;
pub use error::{Result, ScenarioError};
pub use process::{Exit, ProcessHandle, SIGINT, SIGKILL, SIGTERM, send_signal};
pub use runner::{
    REQUEST_LIMIT_ENV, SERVICE_PATTERN, ScenarioConfig, ScenarioOutcome, ScenarioRunner,
    ServedExport, check_abort_time, export_contents, free_port, self_check,
};
pub use sim_transport::SimTransport;
