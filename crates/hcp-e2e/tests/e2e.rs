//! Scenario tests against a real management cluster
//!
//! Each test provisions (and tears down) a real hosted cluster, so these
//! only build with the `cluster-e2e` feature and read their configuration
//! from `HCP_E2E_*` variables (see `hcp_e2e::config`).
//!
//! ```bash
//! HCP_E2E_PLATFORM=aws HCP_E2E_AWS_REGION=us-east-1 ... \
//!   cargo test -p hcp-e2e --features cluster-e2e --test e2e -- --nocapture
//! ```

#![cfg(feature = "cluster-e2e")]

use std::future::Future;
use std::time::Duration;

use tracing::info;

use hcp_e2e::scenarios::{self, run_with_deadline, ScenarioEnv};
use hcp_e2e::ScenarioRun;
use hcp_e2e_common::telemetry::init_test_logging;

/// Time after which a scenario is cancelled; teardown runs past it
const SCENARIO_TIMEOUT: Duration = Duration::from_secs(3600);

async fn run_scenario<F, Fut>(name: &str, scenario: F)
where
    F: FnOnce(ScenarioEnv) -> Fut,
    Fut: Future<Output = ScenarioRun>,
{
    init_test_logging();
    let env = match ScenarioEnv::from_env().await {
        Ok(env) => env,
        Err(e) => panic!("{name}: cannot set up scenario environment: {e}"),
    };

    info!(scenario = name, "Starting scenario");
    let run = run_with_deadline(&env, SCENARIO_TIMEOUT, scenario).await;

    if let ScenarioRun::Skipped { reason, .. } = &run {
        info!(scenario = name, reason = %reason, "SKIPPED");
        return;
    }
    match run.into_result() {
        Ok(()) => info!(scenario = name, "TEST PASSED"),
        Err(msg) => panic!("{msg}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn create_cluster() {
    run_scenario("create-cluster", |env| async move {
        scenarios::create_cluster(&env).await
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn create_cluster_request_serving_isolation() {
    run_scenario("create-cluster-request-serving-isolation", |env| async move {
        scenarios::create_cluster_request_serving_isolation(&env).await
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn create_cluster_custom_config() {
    run_scenario("create-cluster-custom-config", |env| async move {
        scenarios::create_cluster_custom_config(&env).await
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn none_create_cluster() {
    run_scenario("none-create-cluster", |env| async move {
        scenarios::none_create_cluster(&env).await
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn create_cluster_proxy() {
    run_scenario("create-cluster-proxy", |env| async move {
        scenarios::create_cluster_proxy(&env).await
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn create_cluster_private() {
    run_scenario("create-cluster-private", |env| async move {
        scenarios::create_cluster_private(&env).await
    })
    .await;
}
