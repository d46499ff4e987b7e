//! Scenarios end to end against the stand-in server.
//!
//! Every scenario spawns `mirrorfault-standin` with a one second request
//! limit and plays the catalogued fault against it.

use std::time::Duration;

use mirrorfault_core::{ControlFraming, FaultScenario, TerminalState};
use mirrorfault_harness::{
    Exit, SERVICE_PATTERN, ScenarioConfig, ScenarioError, ScenarioOutcome, ScenarioRunner,
};

fn config() -> ScenarioConfig {
    ScenarioConfig::new(env!("CARGO_BIN_EXE_mirrorfault-standin"))
        .with_request_limit(Duration::from_secs(1))
}

async fn runner_with(config: ScenarioConfig) -> ScenarioRunner {
    ScenarioRunner::new(config).await.unwrap()
}

async fn run(name: &str) -> ScenarioOutcome {
    let runner = runner_with(config()).await;
    let scenario = FaultScenario::by_name(name).unwrap();
    runner.run(scenario).await.unwrap_or_else(|e| panic!("{name}: {e}"))
}

#[tokio::test]
async fn verbosity_is_detected_from_help() {
    let runner = runner_with(config()).await;
    assert!(runner.command().verbose());
}

#[tokio::test]
async fn served_export_round_trips_through_cli() {
    let runner = runner_with(config()).await;
    let config = runner.config();
    let served = runner.serve(TerminalState::Aborted).await.unwrap();

    let timeout = Duration::from_secs(10);
    let command = runner.command();
    command.cli_write(config.ip, served.port, 0, SERVICE_PATTERN, timeout).await.unwrap();
    let data = command.cli_read(config.ip, served.port, 0, 8, timeout).await.unwrap();
    assert_eq!(data, SERVICE_PATTERN);

    let exit = served.process.finish(config.exit_timeout).await.unwrap();
    assert_eq!(exit, Exit::Code(0));
}

#[tokio::test]
async fn accepted_mirror_is_entrusted() {
    let outcome = run("accept_mirror").await;
    assert!(outcome.report.entrusted);
    assert_eq!(outcome.report.writes, 1);
    assert_eq!(outcome.exit, Exit::Code(0));
}

#[tokio::test]
async fn hung_write_is_abandoned_within_the_limit() {
    let outcome = run("hang_after_write").await;
    let waited = outcome.report.longest_wait().unwrap();
    assert!(waited <= config().abort_allowance(), "waited {waited:?}");
    assert_eq!(outcome.exit, Exit::Code(0));
}

#[tokio::test]
async fn wrong_hello_magic_is_rejected() {
    let outcome = run("hello_wrong_magic").await;
    assert!(!outcome.reply.is_success());
    assert!(outcome.reply.message.contains("Mirror was rejected"));
}

#[tokio::test]
async fn close_after_hello_is_retried() {
    let outcome = run("close_after_hello").await;
    assert!(outcome.reply.is_success());
    assert!(outcome.report.reconnected);
}

#[tokio::test]
async fn break_after_hello_keeps_serving() {
    let outcome = run("break_after_hello").await;
    assert!(!outcome.report.entrusted);
    assert_eq!(outcome.exit, Exit::Code(0));
}

#[tokio::test]
async fn sigterm_after_hello_quits_with_status_one() {
    let outcome = run("sigterm_after_hello").await;
    assert_eq!(outcome.exit, Exit::Code(1));
}

#[tokio::test]
async fn failed_entrust_kills_source() {
    let outcome = run("close_after_writes").await;
    assert_eq!(outcome.exit, Exit::Signal(9));
}

#[tokio::test]
async fn access_list_is_accepted_in_both_framings() {
    for framing in [ControlFraming::Line, ControlFraming::LinesUntilBlank] {
        let runner = runner_with(config().with_control_framing(framing)).await;
        let served = runner.serve(TerminalState::Aborted).await.unwrap();

        let reply = runner.configure_acl(&served, &["127.0.0.1"]).await.unwrap();
        assert_eq!(reply.message, "updated", "{framing:?}");
        runner.verify_local_service(&served).await.unwrap();

        served.process.finish(runner.config().exit_timeout).await.unwrap();
    }
}

#[tokio::test]
async fn malformed_access_list_is_refused() {
    let runner = runner_with(config()).await;
    let served = runner.serve(TerminalState::Aborted).await.unwrap();

    let err = runner.configure_acl(&served, &["127.0.0.1", "nonsense"]).await.unwrap_err();
    let ScenarioError::ControlRejected { command, reply } = &err else {
        panic!("expected a refusal, got {err}");
    };
    assert_eq!(*command, "acl");
    assert!(reply.starts_with("1: bad spec: nonsense"), "{reply}");

    served.process.finish(runner.config().exit_timeout).await.unwrap();
}

#[tokio::test]
async fn access_list_shuts_out_other_addresses() {
    let runner = runner_with(config()).await;
    let served = runner.serve(TerminalState::Aborted).await.unwrap();

    runner.configure_acl(&served, &["10.0.0.1"]).await.unwrap();
    let err = runner.verify_local_service(&served).await.unwrap_err();
    assert!(matches!(err, ScenarioError::ServiceUnavailable { .. }), "{err}");

    served.process.finish(runner.config().exit_timeout).await.unwrap();
}

#[tokio::test]
async fn whole_catalogue() {
    let runner = runner_with(config()).await;
    let results = runner.run_catalogue().await.unwrap();
    assert_eq!(results.len(), FaultScenario::all().len());

    let failed: Vec<_> = results
        .iter()
        .filter_map(|(name, result)| result.as_ref().err().map(|e| format!("{name}: {e}")))
        .collect();
    assert!(failed.is_empty(), "failed scenarios:\n{}", failed.join("\n"));
}
