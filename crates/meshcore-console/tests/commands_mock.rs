use std::time::Duration;

use meshcore_console::{build_pipeline, commands, Config, ConsoleError};
use meshcore_observe::EventPayload;
use meshcore_radio::{AdapterKind, ROSTER};
use meshcore_types::DeliveryStatus;
use serde_json::Value;

const TICK: Duration = Duration::from_millis(20);

fn mock_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.radio.mode = AdapterKind::Mock;
    config.radio.node_name = "Base".into();
    config.mock.interval_ms = 600_000;
    config.mock.ack_delay_ms = 30;
    config.pipeline.pump_budget_ms = 5_000;
    config.database.path = dir.path().join("console.db").to_string_lossy().into_owned();
    config
}

fn lines(out: &[u8]) -> Vec<Value> {
    String::from_utf8(out.to_vec())
        .expect("output is utf-8")
        .lines()
        .map(|l| serde_json::from_str(l).expect("each line is json"))
        .collect()
}

fn kinds(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|e| e["kind"].as_str().expect("event has a kind").to_string())
        .collect()
}

#[tokio::test]
async fn listen_prints_status_then_events_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = build_pipeline(&mock_config(&dir)).expect("pipeline");
    let mut out = Vec::new();

    let printed = commands::listen(
        &mut pipeline,
        TICK,
        Some(Duration::from_millis(300)),
        &mut out,
        std::future::pending(),
    )
    .await
    .expect("listen");

    let lines = lines(&out);
    let status = &lines[0];
    assert_eq!(status["adapter"], "mock");
    assert_eq!(status["node_name"], "Base");

    let events = &lines[1..];
    assert_eq!(events.len(), printed);
    let kinds = kinds(events);
    assert_eq!(kinds.first().map(String::as_str), Some("connected"));
    assert_eq!(kinds.last().map(String::as_str), Some("disconnected"));
    assert_eq!(
        kinds.iter().filter(|k| *k == "advert").count(),
        ROSTER.len(),
        "the initial burst advertises every roster entry: {kinds:?}"
    );

    let ids: Vec<u64> = events
        .iter()
        .map(|e| e["id"].as_u64().expect("numeric id"))
        .collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids increase: {ids:?}");
}

#[tokio::test]
async fn listen_stops_on_shutdown_and_drains() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = build_pipeline(&mock_config(&dir)).expect("pipeline");
    let mut out = Vec::new();

    commands::listen(&mut pipeline, TICK, None, &mut out, async {})
        .await
        .expect("listen");

    let kinds = kinds(&lines(&out)[1..]);
    assert!(kinds.contains(&"connected".to_string()), "{kinds:?}");
    assert_eq!(kinds.last().map(String::as_str), Some("disconnected"));
    assert!(!pipeline.service().status().connected);
}

#[tokio::test]
async fn channel_send_waits_for_the_repeater_echo() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = build_pipeline(&mock_config(&dir)).expect("pipeline");

    let message = commands::send(&mut pipeline, "#public", "hello mesh", Duration::from_secs(5), TICK)
        .await
        .expect("send");

    assert_eq!(message.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(message.body, "hello mesh");
}

#[tokio::test]
async fn direct_send_to_a_keyed_peer_is_acked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = build_pipeline(&mock_config(&dir)).expect("pipeline");
    let entry = ROSTER
        .iter()
        .find(|e| e.advertises_key)
        .expect("roster has a keyed peer");

    let message = commands::send(
        &mut pipeline,
        &entry.key().to_hex(),
        "ping",
        Duration::from_secs(5),
        TICK,
    )
    .await
    .expect("send");

    assert_eq!(message.delivery_status, DeliveryStatus::Delivered);
    assert!(message.ack_code.is_some());
}

#[tokio::test]
async fn short_wait_leaves_the_message_pending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = mock_config(&dir);
    config.mock.ack_delay_ms = 60_000;
    let mut pipeline = build_pipeline(&config).expect("pipeline");

    let message = commands::send(&mut pipeline, "#public", "anyone?", Duration::from_millis(100), TICK)
        .await
        .expect("send");

    assert_eq!(message.delivery_status, DeliveryStatus::Pending);
}

#[tokio::test]
async fn empty_target_is_rejected_before_connecting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = build_pipeline(&mock_config(&dir)).expect("pipeline");

    let err = commands::send(&mut pipeline, "  ", "hi", Duration::from_secs(1), TICK)
        .await
        .expect_err("empty target");

    assert!(matches!(err, ConsoleError::InvalidTarget(_)));
    assert!(!pipeline.service().status().connected);
}

#[tokio::test]
async fn failed_send_still_disconnects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = build_pipeline(&mock_config(&dir)).expect("pipeline");

    let err = commands::send(&mut pipeline, "@Nobody", "hello?", Duration::from_secs(1), TICK)
        .await
        .expect_err("unknown peer");

    assert!(matches!(
        err,
        ConsoleError::Service(meshcore_radio::ServiceError::UnknownDestination(_))
    ));
    let status = pipeline.service().status();
    assert!(!status.connected);
    assert!(!status.reconnecting);
}

#[tokio::test]
async fn imported_channel_can_be_sent_to() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = mock_config(&dir);

    let store = meshcore_console::open_store(&config).expect("store");
    let channel = commands::import_channel(&store, "ops", "00112233445566778899aabbccddeeff")
        .expect("import");
    assert_eq!(channel.name, "ops");
    assert!(channel.joined);
    drop(store);

    let mut pipeline = build_pipeline(&config).expect("pipeline");
    let message = commands::send(&mut pipeline, "#ops", "status?", Duration::from_secs(5), TICK)
        .await
        .expect("send");
    assert_eq!(message.delivery_status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn telemetry_waits_for_the_answer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = build_pipeline(&mock_config(&dir)).expect("pipeline");
    let alice = ROSTER.iter().find(|e| e.name == "Alice").expect("alice");

    let event = commands::telemetry(&mut pipeline, &alice.key().to_hex(), Duration::from_secs(5), TICK)
        .await
        .expect("telemetry")
        .expect("answered in time");

    let EventPayload::Telemetry { readings, error, .. } = &event.payload else {
        panic!("expected telemetry, got {event:?}");
    };
    assert!(!readings.is_empty());
    assert!(error.is_none());
    assert!(!pipeline.service().status().connected);
}

#[tokio::test]
async fn telemetry_from_a_channel_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = build_pipeline(&mock_config(&dir)).expect("pipeline");

    let err = commands::telemetry(&mut pipeline, "#public", Duration::from_secs(1), TICK)
        .await
        .expect_err("channel");
    assert!(matches!(
        err,
        ConsoleError::Service(meshcore_radio::ServiceError::Unroutable(_))
    ));
    assert!(!pipeline.service().status().connected);
}

#[tokio::test]
async fn favorite_accepts_a_display_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = mock_config(&dir);
    let alice = ROSTER.iter().find(|e| e.name == "Alice").expect("alice");
    let mut pipeline = build_pipeline(&config).expect("pipeline");
    commands::send(&mut pipeline, &alice.key().to_hex(), "hi", Duration::from_millis(100), TICK)
        .await
        .expect("send");
    drop(pipeline);

    let store = meshcore_console::open_store(&config).expect("store");
    let pinned = commands::favorite(&store, &alice.key().to_hex(), true).expect("pin by id");
    assert!(pinned.is_favorite);
    let unpinned = commands::favorite(&store, &format!("@{}", pinned.display_name), false)
        .expect("unpin by name");
    assert_eq!(unpinned.stable_id, pinned.stable_id);
    assert!(!unpinned.is_favorite);
    assert!(matches!(
        commands::favorite(&store, "Nobody", true),
        Err(ConsoleError::Store(meshcore_store::StoreError::NotFound(_)))
    ));
}

#[test]
fn remove_channel_by_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = meshcore_console::open_store(&mock_config(&dir)).expect("store");
    commands::import_channel(&store, "ops", "00112233445566778899aabbccddeeff").expect("import");

    assert_eq!(commands::remove_channel(&store, "#ops").expect("remove"), 0);
    assert!(matches!(
        commands::remove_channel(&store, "ops"),
        Err(ConsoleError::Store(meshcore_store::StoreError::NotFound(_)))
    ));
    assert!(matches!(
        commands::remove_channel(&store, "public"),
        Err(ConsoleError::Store(meshcore_store::StoreError::InvalidInput(_)))
    ));
}

#[test]
fn bad_secret_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = meshcore_console::open_store(&mock_config(&dir)).expect("store");
    assert!(commands::import_channel(&store, "ops", "not-hex").is_err());
}

#[test]
fn advert_connects_transmits_and_disconnects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline = build_pipeline(&mock_config(&dir)).expect("pipeline");
    commands::advert(&mut pipeline).expect("advert");
    assert!(!pipeline.service().status().connected);
}
