//! End-to-end controller tests against a mock artifact server.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use semsync_core::model::ModelData;
use semsync_core::{SyncConfig, SyncControllerBuilder, SyncError, SyncHandle, SyncPhase};

const LONG_POLL: Duration = Duration::from_secs(600);
const WAIT: Duration = Duration::from_secs(5);

fn test_config(server: &MockServer) -> SyncConfig {
    SyncConfig::from_toml_str(&format!(
        "results_root = \"{}/results/\"\nlegacy_data_root = \"{}/data/\"\n",
        server.uri(),
        server.uri()
    ))
    .expect("test config parses")
}

fn model_results_body() -> serde_json::Value {
    json!({
        "mainModel": {
            "structuralPaths": [
                { "id": "a1", "estimate": -0.12, "se": 0.03, "pvalue": 0.001 },
                { "id": "c", "estimate": 0.10, "se": 0.02, "pvalue": 0.01 }
            ],
            "fitMeasures": { "cfi": 0.97 }
        }
    })
}

fn dose_effects_body() -> serde_json::Value {
    json!({
        "coefficients": {
            "distress": { "main": -0.12, "moderation": 0.02, "se": 0.03 },
            "engagement": { "main": 0.20, "moderation": -0.01, "se": 0.04 },
            "adjustment": { "main": 0.10, "moderation": 0.005, "se": 0.02 }
        },
        "effects": [],
        "creditDoseRange": { "min": 0, "max": 80, "threshold": 12, "units": "credits" }
    })
}

/// Serves a complete artifact set for `run_id`, with `n` as the sample
/// size so tests can tell runs apart, delaying the model results by
/// `delay`.
async fn mount_run(server: &MockServer, run_id: &str, n: u64, delay: Duration) {
    Mock::given(method("GET"))
        .and(path(format!("/results/{run_id}/modelResults.json")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(model_results_body())
                .set_delay(delay),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/results/{run_id}/doseEffects.json")))
        .respond_with(ResponseTemplate::new(200).set_body_json(dose_effects_body()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/results/{run_id}/sampleDescriptives.json")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "n": n,
            "demographics": { "fast": { "yes": { "n": n / 2, "pct": 50.0 } } }
        })))
        .mount(server)
        .await;
}

async fn mount_index(server: &MockServer, entries: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/results/runs_index.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(entries))
        .mount(server)
        .await;
}

fn two_run_index() -> serde_json::Value {
    // Deliberately oldest-first; auto-selection must still pick r2.
    json!([
        { "run_id": "r1", "timestamp": "2024-01-01T00:00:00Z", "label": "main - r1" },
        { "run_id": "r2", "timestamp": "2024-02-01T00:00:00Z", "label": "main - r2" }
    ])
}

async fn wait_for_phase(rx: &mut watch::Receiver<SyncPhase>, wanted: SyncPhase) {
    tokio::time::timeout(WAIT, async {
        loop {
            if *rx.borrow_and_update() == wanted {
                return;
            }
            rx.changed().await.expect("controller alive");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
}

async fn requests_for(server: &MockServer, suffix: &str) -> usize {
    server
        .received_requests()
        .await
        .expect("request recording enabled")
        .iter()
        .filter(|request| request.url.path().ends_with(suffix))
        .count()
}

fn spawn(config: SyncConfig) -> SyncHandle {
    SyncControllerBuilder::new(config)
        .with_poll_interval(LONG_POLL)
        .spawn()
        .expect("controller spawns")
}

#[tokio::test]
async fn auto_selects_the_most_recent_run() {
    let server = MockServer::start().await;
    mount_index(&server, two_run_index()).await;
    mount_run(&server, "r2", 2222, Duration::ZERO).await;

    let handle = spawn(test_config(&server));
    let mut phase = handle.subscribe_phase();
    wait_for_phase(&mut phase, SyncPhase::Idle).await;

    assert_eq!(handle.current_run().as_deref(), Some("r2"));
    assert_eq!(handle.data().sample_size, 2222);
    assert_eq!(handle.available_runs()[0].run_id, "r2");
}

#[tokio::test]
async fn empty_catalog_parks_in_no_runs_available() {
    let server = MockServer::start().await;
    mount_index(&server, json!([])).await;

    let handle = spawn(test_config(&server));
    let mut phase = handle.subscribe_phase();
    wait_for_phase(&mut phase, SyncPhase::NoRunsAvailable).await;

    assert_eq!(handle.current_run(), None);
    // Still the placeholder.
    assert!(!handle.data().validation.is_valid);
    assert_eq!(handle.data().sample_size, 0);
}

#[tokio::test]
async fn injected_initial_data_is_published_until_first_fetch() {
    let server = MockServer::start().await;
    mount_index(&server, json!([])).await;

    let mut seeded = ModelData::placeholder();
    seeded.sample_size = 7;
    let handle = SyncControllerBuilder::new(test_config(&server))
        .with_poll_interval(LONG_POLL)
        .with_initial_data(Arc::new(seeded))
        .spawn()
        .expect("controller spawns");

    let mut phase = handle.subscribe_phase();
    wait_for_phase(&mut phase, SyncPhase::NoRunsAvailable).await;
    assert_eq!(handle.data().sample_size, 7);
}

#[tokio::test]
async fn rapid_run_switch_publishes_only_the_latest_selection() {
    let server = MockServer::start().await;
    mount_index(&server, two_run_index()).await;
    // r1 is slow, r2 is fast.
    mount_run(&server, "r1", 1111, Duration::from_millis(600)).await;
    mount_run(&server, "r2", 2222, Duration::ZERO).await;

    let handle = spawn(test_config(&server));
    let mut phase = handle.subscribe_phase();
    wait_for_phase(&mut phase, SyncPhase::Idle).await;
    assert_eq!(handle.data().sample_size, 2222);

    // Select r1 (slow), then r2 (fast) before r1's fetch resolves.
    let mut data = handle.subscribe_data();
    data.borrow_and_update();
    handle.set_current_run("r1").await.expect("handle alive");
    handle.set_current_run("r2").await.expect("handle alive");

    // Watch every publish until well past r1's delayed response: r1's
    // values must never appear.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(900);
    let mut observed = Vec::new();
    loop {
        let timeout = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(timeout, data.changed()).await {
            Ok(changed) => {
                changed.expect("controller alive");
                observed.push(data.borrow_and_update().sample_size);
            }
            Err(_) => break,
        }
    }

    assert!(
        !observed.contains(&1111),
        "stale run data was published: {observed:?}"
    );
    assert!(observed.contains(&2222), "no publish for the selected run");
    assert_eq!(handle.data().sample_size, 2222);
    assert_eq!(handle.current_run().as_deref(), Some("r2"));
}

#[tokio::test]
async fn refresh_is_single_flight() {
    let server = MockServer::start().await;
    mount_index(
        &server,
        json!([{ "run_id": "r2", "timestamp": "2024-02-01T00:00:00Z", "label": "main - r2" }]),
    )
    .await;
    mount_run(&server, "r2", 2222, Duration::from_millis(200)).await;

    let handle = spawn(test_config(&server));
    let mut phase = handle.subscribe_phase();
    wait_for_phase(&mut phase, SyncPhase::Idle).await;
    let initial = requests_for(&server, "modelResults.json").await;
    assert_eq!(initial, 1);

    let mut refreshing = handle.subscribe_refreshing();
    handle.refresh().await.expect("handle alive");
    handle.refresh().await.expect("handle alive");

    // Both callers observe the same in-flight cycle...
    tokio::time::timeout(WAIT, async {
        loop {
            if *refreshing.borrow_and_update() {
                return;
            }
            refreshing.changed().await.expect("controller alive");
        }
    })
    .await
    .expect("refreshing never became true");
    assert!(handle.is_refreshing());

    // ...and it resets once the cycle lands.
    tokio::time::timeout(WAIT, async {
        loop {
            if !*refreshing.borrow_and_update() {
                return;
            }
            refreshing.changed().await.expect("controller alive");
        }
    })
    .await
    .expect("refreshing never reset");

    // Exactly one extra network cycle for the two refresh calls.
    assert_eq!(requests_for(&server, "modelResults.json").await, 2);
}

#[tokio::test]
async fn refresh_signal_takes_the_same_path() {
    let server = MockServer::start().await;
    mount_index(
        &server,
        json!([{ "run_id": "r2", "timestamp": "2024-02-01T00:00:00Z", "label": "main - r2" }]),
    )
    .await;
    mount_run(&server, "r2", 2222, Duration::ZERO).await;

    let (signal_tx, signal_rx) = broadcast::channel(4);
    let handle = SyncControllerBuilder::new(test_config(&server))
        .with_poll_interval(LONG_POLL)
        .with_refresh_signal(signal_rx)
        .spawn()
        .expect("controller spawns");

    let mut phase = handle.subscribe_phase();
    wait_for_phase(&mut phase, SyncPhase::Idle).await;
    assert_eq!(requests_for(&server, "modelResults.json").await, 1);

    signal_tx.send(()).expect("controller is subscribed");

    tokio::time::timeout(WAIT, async {
        while requests_for(&server, "modelResults.json").await < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("signal never triggered a cycle");
}

#[tokio::test]
async fn failed_required_artifact_retains_previous_data() {
    let server = MockServer::start().await;
    mount_index(
        &server,
        json!([{ "run_id": "r2", "timestamp": "2024-02-01T00:00:00Z", "label": "main - r2" }]),
    )
    .await;
    // First cycle succeeds, later ones hit a 500.
    Mock::given(method("GET"))
        .and(path("/results/r2/modelResults.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(model_results_body()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/results/r2/modelResults.json"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/results/r2/sampleDescriptives.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "n": 2222 })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/results/r2/doseEffects.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(dose_effects_body()))
        .mount(&server)
        .await;

    let handle = spawn(test_config(&server));
    let mut phase = handle.subscribe_phase();
    wait_for_phase(&mut phase, SyncPhase::Idle).await;
    let before = handle.data();
    assert_eq!(before.sample_size, 2222);

    handle.refresh().await.expect("handle alive");
    wait_for_phase(&mut phase, SyncPhase::Error).await;

    // Previous data survives the failed cycle, and the flight flag reset.
    assert_eq!(handle.data(), before);
    assert!(!handle.is_refreshing());
}

#[tokio::test]
async fn missing_optional_artifacts_degrade_with_errors() {
    let server = MockServer::start().await;
    mount_index(
        &server,
        json!([{ "run_id": "r2", "timestamp": "2024-02-01T00:00:00Z", "label": "main - r2" }]),
    )
    .await;
    // Only the required artifact exists; the optional ones 404.
    Mock::given(method("GET"))
        .and(path("/results/r2/modelResults.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(model_results_body()))
        .mount(&server)
        .await;

    let handle = spawn(test_config(&server));
    let mut phase = handle.subscribe_phase();
    wait_for_phase(&mut phase, SyncPhase::Idle).await;

    let data = handle.data();
    assert!(!data.validation.is_valid);
    assert!(
        data.validation
            .errors
            .iter()
            .any(|e| e.contains("doseEffects.json"))
    );
    assert!(
        data.validation
            .errors
            .iter()
            .any(|e| e.contains("sampleDescriptives.json"))
    );
    // The structural paths still came through, and numerics are defaulted.
    assert_eq!(data.path("a1").map(|p| p.estimate), Some(-0.12));
    assert_eq!(data.sample_size, 0);
    assert_eq!(data.effect_at_dose(42.0).distress, 0.0);
}

#[tokio::test]
async fn polling_reissues_cycles_on_the_interval() {
    let server = MockServer::start().await;
    mount_index(
        &server,
        json!([{ "run_id": "r2", "timestamp": "2024-02-01T00:00:00Z", "label": "main - r2" }]),
    )
    .await;
    mount_run(&server, "r2", 2222, Duration::ZERO).await;

    let handle = SyncControllerBuilder::new(test_config(&server))
        .with_poll_interval(Duration::from_millis(100))
        .spawn()
        .expect("controller spawns");

    let mut phase = handle.subscribe_phase();
    wait_for_phase(&mut phase, SyncPhase::Idle).await;

    tokio::time::timeout(WAIT, async {
        while requests_for(&server, "modelResults.json").await < 3 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("polling never re-fetched");
}

#[tokio::test]
async fn handle_is_dead_after_shutdown() {
    let server = MockServer::start().await;
    mount_index(&server, json!([])).await;

    let handle = spawn(test_config(&server));
    let mut phase = handle.subscribe_phase();
    wait_for_phase(&mut phase, SyncPhase::NoRunsAvailable).await;

    handle.shutdown();
    let err = handle
        .set_current_run("r1")
        .await
        .expect_err("dead handle rejects commands");
    assert!(matches!(err, SyncError::ControllerGone));

    let err = handle.refresh().await.expect_err("dead handle rejects commands");
    assert!(matches!(err, SyncError::ControllerGone));
}
