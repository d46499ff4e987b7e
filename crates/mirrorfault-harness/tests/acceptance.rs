//! Scenarios against a real server binary.
//!
//! Set `MIRRORFAULT_SERVER_BIN` to the binary under test; without it every
//! test here is skipped.

#![allow(clippy::print_stderr)]

use std::{path::PathBuf, time::Duration};

use mirrorfault_core::{FaultScenario, TerminalState};
use mirrorfault_harness::{SERVICE_PATTERN, ScenarioConfig, ScenarioRunner};

const SERVER_BIN: &str = "MIRRORFAULT_SERVER_BIN";

fn server_binary() -> Option<PathBuf> {
    let binary = std::env::var_os(SERVER_BIN).map(PathBuf::from);
    if binary.is_none() {
        eprintln!("SKIP: environment variable {SERVER_BIN} not set");
    }
    binary
}

async fn runner() -> Option<ScenarioRunner> {
    let binary = server_binary()?;
    Some(ScenarioRunner::new(ScenarioConfig::new(binary)).await.unwrap())
}

async fn run_scenario(name: &str) {
    let Some(runner) = runner().await else { return };
    let scenario = FaultScenario::by_name(name).unwrap();
    let outcome = runner.run(scenario).await.unwrap_or_else(|e| panic!("{name}: {e}"));
    assert_eq!(outcome.scenario, name);
    if scenario.expect.terminal == TerminalState::Entrusted {
        assert!(outcome.report.entrusted);
    }
}

#[tokio::test]
async fn served_export_round_trips_through_cli() {
    let Some(runner) = runner().await else { return };
    let config = runner.config();
    let served = runner.serve(TerminalState::Aborted).await.unwrap();

    let timeout = Duration::from_secs(10);
    let command = runner.command();
    command.cli_write(config.ip, served.port, 0, SERVICE_PATTERN, timeout).await.unwrap();
    let data = command.cli_read(config.ip, served.port, 0, 8, timeout).await.unwrap();
    assert_eq!(data, SERVICE_PATTERN);

    served.process.finish(config.exit_timeout).await.unwrap();
}

#[tokio::test]
async fn access_list_update_is_accepted() {
    let Some(runner) = runner().await else { return };
    let mut served = runner.serve(TerminalState::Aborted).await.unwrap();

    let reply = runner.configure_acl(&served, &["127.0.0.1"]).await.unwrap();
    assert!(reply.is_success());
    runner.verify_local_service(&served).await.unwrap();

    let stderr = served.process.stderr_lines().to_vec();
    assert!(!stderr.iter().any(|l| l.starts_with("F:") || l.starts_with("E:")), "{stderr:?}");
    served.process.finish(runner.config().exit_timeout).await.unwrap();
}

#[tokio::test]
async fn accepted_mirror_is_entrusted() {
    run_scenario("accept_mirror").await;
}

#[tokio::test]
async fn hang_after_write_aborts_migration() {
    run_scenario("hang_after_write").await;
}

#[tokio::test]
async fn wrong_hello_magic_is_rejected() {
    run_scenario("hello_wrong_magic").await;
}

#[tokio::test]
async fn close_during_entrust_kills_source() {
    run_scenario("close_after_writes").await;
}

#[tokio::test]
async fn sigterm_after_hello_quits_with_status_one() {
    run_scenario("sigterm_after_hello").await;
}

#[tokio::test]
async fn whole_catalogue() {
    let Some(runner) = runner().await else { return };
    let results = runner.run_catalogue().await.unwrap();
    let failed: Vec<_> = results
        .iter()
        .filter_map(|(name, result)| result.as_ref().err().map(|e| format!("{name}: {e}")))
        .collect();
    assert!(failed.is_empty(), "failed scenarios:\n{}", failed.join("\n"));
}
