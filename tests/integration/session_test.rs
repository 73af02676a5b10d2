//! Integration tests for the session coordinator against an embedded broker.

mod common;

use std::time::Duration;

use common::{broker_config, start_broker, wait_until, PeerClient};
use mqtt_dashboard::error::DashboardError;
use mqtt_dashboard::message_log::LogConfig;
use mqtt_dashboard::schedule::default_schedule;
use mqtt_dashboard::session::{ScheduleStatus, SessionCoordinator, SessionState, SubscriptionStatus};
use rumqttc::QoS;
use serde_json::json;

const WAIT: Duration = Duration::from_secs(3);

/// Connect a coordinator and wait until `topic` is granted.
async fn connected_session(port: u16, id: &str, topic: &str, qos: QoS) -> SessionCoordinator {
    let session = SessionCoordinator::default();
    session
        .connect(broker_config(port, id))
        .await
        .expect("connect failed");
    assert_eq!(session.state(), SessionState::Connected);

    session.subscribe(topic, qos).expect("subscribe failed");
    let granted = wait_until(WAIT, || {
        session
            .subscriptions()
            .iter()
            .any(|s| s.topic == topic && matches!(s.status, SubscriptionStatus::Granted(_)))
    })
    .await;
    assert!(granted, "subscription to {} was not acknowledged", topic);
    session
}

#[tokio::test]
async fn test_messages_are_logged_and_parsed() {
    start_broker(18870);
    let session = connected_session(18870, "dash-log", "sensors/#", QoS::AtLeastOnce).await;
    let peer = PeerClient::connect(18870, "peer-log").await;

    peer.publish(
        "sensors/room1",
        r#"{"temperature": 25.5, "sensor": {"id": "temp01"}}"#,
    )
    .await;
    peer.publish("sensors/room1", "plain text").await;
    peer.publish("sensors/room2", r#"{"readings": [1, 2]}"#).await;

    let log = session.log();
    assert!(wait_until(WAIT, || log.raw_len() == 3).await);

    let snapshot = session.snapshot();
    let seqs: Vec<u64> = snapshot.raw.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(snapshot.raw[1].payload, "plain text");

    assert_eq!(snapshot.parsed.len(), 2);
    let first = &snapshot.parsed[0];
    assert_eq!(first.seq, 1);
    assert_eq!(first.topic, "sensors/room1");
    assert_eq!(first.flattened["temperature"], json!(25.5));
    assert_eq!(first.flattened["sensor_id"], json!("temp01"));
    assert_eq!(snapshot.parsed[1].seq, 2);
    assert_eq!(snapshot.parsed[1].flattened["readings_1"], json!(2));
    assert_eq!(snapshot.numeric_columns(), vec!["temperature", "readings_0", "readings_1"]);

    session.disconnect();
}

#[tokio::test]
async fn test_subscription_granted_qos_is_recorded() {
    start_broker(18871);
    let session = connected_session(18871, "dash-qos", "alerts/+", QoS::AtLeastOnce).await;

    let subscriptions = session.subscriptions();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].qos, QoS::AtLeastOnce);
    assert_eq!(
        subscriptions[0].status,
        SubscriptionStatus::Granted(QoS::AtLeastOnce)
    );

    session.disconnect();
}

#[tokio::test]
async fn test_non_utf8_payload_is_flagged() {
    start_broker(18872);
    let session = connected_session(18872, "dash-bin", "bin/#", QoS::AtMostOnce).await;
    let peer = PeerClient::connect(18872, "peer-bin").await;

    peer.publish("bin/data", vec![0xff, 0xfe, 0x01]).await;

    let log = session.log();
    assert!(wait_until(WAIT, || log.raw_len() == 1).await);
    let snapshot = session.snapshot();
    assert!(snapshot.raw[0].decode_failed);
    assert_eq!(snapshot.raw[0].payload, "Non-UTF-8 payload (b64://4B)");
    assert!(snapshot.parsed.is_empty());

    session.disconnect();
}

#[tokio::test]
async fn test_publish_loops_back_through_broker() {
    start_broker(18873);
    let session = connected_session(18873, "dash-loop", "echo/#", QoS::AtMostOnce).await;

    session
        .publish("echo/1", br#"{"n": 1}"#, QoS::AtLeastOnce, false)
        .unwrap();

    let log = session.log();
    assert!(wait_until(WAIT, || log.parsed_len() == 1).await);
    assert_eq!(session.snapshot().parsed[0].json, json!({"n": 1}));

    session.disconnect();
}

#[tokio::test]
async fn test_disconnect_clears_state_and_rejects_commands() {
    start_broker(18874);
    let session = connected_session(18874, "dash-clear", "t/#", QoS::AtMostOnce).await;
    let peer = PeerClient::connect(18874, "peer-clear").await;

    peer.publish("t/a", "1").await;
    let log = session.log();
    assert!(wait_until(WAIT, || log.raw_len() == 1).await);

    session.disconnect();

    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(log.raw_len(), 0);
    assert_eq!(log.parsed_len(), 0);
    assert!(session.subscriptions().is_empty());
    assert!(matches!(
        session.publish("t/a", b"x", QoS::AtMostOnce, false),
        Err(DashboardError::NotConnected(_))
    ));
    assert!(matches!(
        session.subscribe("t/#", QoS::AtMostOnce),
        Err(DashboardError::NotConnected(_))
    ));

    // Messages published after disconnect never reach the log.
    peer.publish("t/a", "2").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(log.raw_len(), 0);
}

#[tokio::test]
async fn test_reconnect_restarts_numbering() {
    start_broker(18875);
    let session = connected_session(18875, "dash-re", "r/#", QoS::AtMostOnce).await;
    let peer = PeerClient::connect(18875, "peer-re").await;

    peer.publish("r/1", "a").await;
    peer.publish("r/1", "b").await;
    let log = session.log();
    assert!(wait_until(WAIT, || log.raw_len() == 2).await);

    // A second connect replaces the session.
    session.connect(broker_config(18875, "dash-re-2")).await.unwrap();
    assert!(session.subscriptions().is_empty());
    assert_eq!(log.raw_len(), 0);

    session.subscribe("r/#", QoS::AtMostOnce).unwrap();
    assert!(
        wait_until(WAIT, || {
            session
                .subscriptions()
                .iter()
                .all(|s| s.status != SubscriptionStatus::Pending)
        })
        .await
    );
    peer.publish("r/1", "c").await;
    assert!(wait_until(WAIT, || log.raw_len() == 1).await);
    let snapshot = session.snapshot();
    assert_eq!(snapshot.raw[0].seq, 1);
    assert_eq!(snapshot.raw[0].payload, "c");

    session.disconnect();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    start_broker(18876);
    let session = connected_session(18876, "dash-unsub", "u/#", QoS::AtMostOnce).await;
    let peer = PeerClient::connect(18876, "peer-unsub").await;

    session.unsubscribe("u/#").unwrap();
    assert!(session.subscriptions().is_empty());
    tokio::time::sleep(Duration::from_millis(300)).await;

    peer.publish("u/1", "ignored").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(session.log().raw_len(), 0);

    session.disconnect();
}

#[tokio::test]
async fn test_connect_failure_leaves_session_disconnected() {
    // Nothing listens on this port.
    let session = SessionCoordinator::default();
    let result = session
        .connect(broker_config(18877, "dash-fail").with_connect_timeout(Duration::from_secs(1)))
        .await;

    let err = result.unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.last_error().is_some());
}

#[tokio::test]
async fn test_retention_limit_keeps_newest_messages() {
    start_broker(18878);
    let session = SessionCoordinator::new(LogConfig::default().with_max_entries(2));
    session.connect(broker_config(18878, "dash-cap")).await.unwrap();
    session.subscribe("cap/#", QoS::AtMostOnce).unwrap();
    assert!(
        wait_until(WAIT, || {
            session
                .subscriptions()
                .iter()
                .all(|s| s.status != SubscriptionStatus::Pending)
        })
        .await
    );
    let peer = PeerClient::connect(18878, "peer-cap").await;

    for i in 1..=4 {
        peer.publish("cap/x", format!("{{\"i\": {}}}", i)).await;
    }
    let log = session.log();
    assert!(wait_until(WAIT, || log.last_seqs() == (4, 4)).await);

    let snapshot = session.snapshot();
    let seqs: Vec<u64> = snapshot.raw.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![3, 4]);
    assert_eq!(snapshot.parsed.len(), 2);

    session.disconnect();
}

#[tokio::test]
async fn test_broker_drop_tears_down_session() {
    start_broker(18879);
    let session = connected_session(18879, "dash-drop", "d/#", QoS::AtLeastOnce).await;
    let peer = PeerClient::connect(18879, "peer-drop").await;

    peer.publish("d/1", r#"{"level": 3}"#).await;
    let log = session.log();
    assert!(wait_until(WAIT, || log.raw_len() == 1).await);
    session
        .start_schedule(default_schedule(), Duration::from_millis(100))
        .unwrap();

    // A second client with the same id takes the session over.
    let _intruder = PeerClient::connect(18879, "dash-drop").await;

    assert!(wait_until(WAIT, || session.state() == SessionState::Disconnected).await);
    assert!(session.last_error().is_some());
    assert!(session.subscriptions().is_empty());
    assert!(wait_until(WAIT, || session.schedule_status() == ScheduleStatus::Idle).await);
    assert_eq!(log.raw_len(), 0);
    assert!(matches!(
        session.publish("d/1", b"x", QoS::AtMostOnce, false),
        Err(DashboardError::NotConnected(_))
    ));

    let closed = session.closed_session().expect("records of the dropped session");
    assert_eq!(closed.raw.len(), 1);
    assert_eq!(closed.parsed[0].json, json!({"level": 3}));
}

#[tokio::test]
async fn test_clear_log_during_live_session_keeps_logging() {
    start_broker(18868);
    let session = connected_session(18868, "dash-wipe", "w/#", QoS::AtMostOnce).await;
    let peer = PeerClient::connect(18868, "peer-wipe").await;

    peer.publish("w/1", "before").await;
    let log = session.log();
    assert!(wait_until(WAIT, || log.raw_len() == 1).await);

    session.clear_log();
    assert_eq!(log.raw_len(), 0);

    peer.publish("w/1", r#"{"after": true}"#).await;
    assert!(wait_until(WAIT, || log.raw_len() == 1).await);
    let snapshot = session.snapshot();
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(snapshot.raw[0].seq, 1);
    assert_eq!(snapshot.parsed[0].seq, 1);

    session.disconnect();
}
