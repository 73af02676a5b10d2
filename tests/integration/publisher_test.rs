//! Integration tests for periodic publishing through the session coordinator.

mod common;

use std::time::Duration;

use common::{broker_config, start_broker, wait_until, PeerClient};
use mqtt_dashboard::error::DashboardError;
use mqtt_dashboard::schedule::{default_schedule, load_schedule_file, ScheduledEntry};
use mqtt_dashboard::session::{ScheduleStatus, SessionCoordinator};
use rumqttc::QoS;

const WAIT: Duration = Duration::from_secs(3);
const FAST: Duration = Duration::from_millis(100);

async fn connect(port: u16, id: &str) -> SessionCoordinator {
    let session = SessionCoordinator::default();
    session
        .connect(broker_config(port, id))
        .await
        .expect("connect failed");
    session
}

fn payloads(messages: &[(String, Vec<u8>)]) -> Vec<String> {
    messages
        .iter()
        .map(|(_, p)| String::from_utf8_lossy(p).into_owned())
        .collect()
}

#[tokio::test]
async fn test_default_schedule_cycles_in_order() {
    start_broker(18880);
    let mut peer = PeerClient::connect(18880, "peer-cycle").await;
    peer.subscribe("test/message").await;
    let session = connect(18880, "dash-cycle").await;

    session.start_schedule(default_schedule(), FAST).unwrap();
    assert_eq!(session.schedule_status(), ScheduleStatus::Running);

    let received = peer.drain(Duration::from_millis(650)).await;
    session.stop_schedule();

    let received = payloads(&received);
    assert!(received.len() >= 4, "expected several cycles, got {:?}", received);
    for (i, payload) in received.iter().enumerate() {
        let expected = if i % 2 == 0 { "Message 1" } else { "Message 2" };
        assert_eq!(payload, expected);
    }

    session.disconnect();
}

#[tokio::test]
async fn test_second_start_is_rejected_while_running() {
    start_broker(18881);
    let session = connect(18881, "dash-twice").await;

    session.start_schedule(default_schedule(), FAST).unwrap();
    let second = session.start_schedule(default_schedule(), FAST);
    assert!(matches!(second, Err(DashboardError::ConcurrentSchedule(_))));

    session.disconnect();
}

#[tokio::test]
async fn test_restart_waits_for_previous_publisher_to_exit() {
    start_broker(18882);
    let session = connect(18882, "dash-restart").await;
    session
        .start_schedule(default_schedule(), Duration::from_secs(60))
        .unwrap();

    // No await between stop and start: the old task cannot have exited yet.
    assert!(session.stop_schedule());
    let immediate = session.start_schedule(default_schedule(), FAST);
    assert!(matches!(immediate, Err(DashboardError::ConcurrentSchedule(_))));
    assert_eq!(session.schedule_status(), ScheduleStatus::Stopping);

    assert!(wait_until(WAIT, || session.schedule_status() == ScheduleStatus::Idle).await);
    session.start_schedule(default_schedule(), FAST).unwrap();
    assert_eq!(session.schedule_status(), ScheduleStatus::Running);

    session.disconnect();
}

#[tokio::test]
async fn test_stop_schedule_halts_publishing() {
    start_broker(18883);
    let mut peer = PeerClient::connect(18883, "peer-stop").await;
    peer.subscribe("halt/#").await;
    let session = connect(18883, "dash-stop").await;

    let entries = vec![ScheduledEntry::new("halt/x", "tick")];
    session.start_schedule(entries, Duration::from_millis(50)).unwrap();
    let before = peer.drain(Duration::from_millis(300)).await;
    assert!(!before.is_empty());

    session.stop_schedule();
    assert!(wait_until(WAIT, || session.schedule_status() == ScheduleStatus::Idle).await);
    // Anything already in flight arrives within this window.
    peer.drain(Duration::from_millis(200)).await;

    let after = peer.drain(Duration::from_millis(300)).await;
    assert!(after.is_empty(), "published after stop: {:?}", payloads(&after));

    session.disconnect();
}

#[tokio::test]
async fn test_disconnect_stops_publisher() {
    start_broker(18884);
    let session = connect(18884, "dash-disc").await;
    session.start_schedule(default_schedule(), FAST).unwrap();

    session.disconnect();

    assert!(wait_until(WAIT, || session.schedule_status() == ScheduleStatus::Idle).await);
    assert!(matches!(
        session.start_schedule(default_schedule(), FAST),
        Err(DashboardError::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_schedule_loaded_from_csv() {
    start_broker(18885);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schedule.csv");
    std::fs::write(
        &path,
        "Topic,Payload,QoS,Retain\n\
         plant/line1,\"{\"\"rpm\"\": 1200}\",1,false\n\
         plant/line2,stopped,9,false\n",
    )
    .unwrap();

    let load = load_schedule_file(&path).unwrap();
    assert_eq!(load.coerced_qos_rows, vec![2]);
    assert_eq!(load.entries[0].qos, QoS::AtLeastOnce);

    let mut peer = PeerClient::connect(18885, "peer-csv").await;
    peer.subscribe("plant/#").await;
    let session = connect(18885, "dash-csv").await;
    session.start_schedule(load.entries, FAST).unwrap();

    let received = peer.drain(Duration::from_millis(350)).await;
    session.disconnect();

    let topics: Vec<&str> = received.iter().map(|(t, _)| t.as_str()).collect();
    assert!(topics.len() >= 2);
    assert_eq!(&topics[..2], &["plant/line1", "plant/line2"]);
    assert_eq!(payloads(&received)[0], r#"{"rpm": 1200}"#);
}

#[tokio::test]
async fn test_invalid_schedule_rejected() {
    start_broker(18886);
    let session = connect(18886, "dash-invalid").await;

    assert!(matches!(
        session.start_schedule(Vec::new(), FAST),
        Err(DashboardError::ScheduleConfig(_))
    ));
    assert!(matches!(
        session.start_schedule(default_schedule(), Duration::ZERO),
        Err(DashboardError::ScheduleConfig(_))
    ));
    assert_eq!(session.schedule_status(), ScheduleStatus::Idle);

    session.disconnect();
}
