//! Raw publish/subscribe on arbitrary topics

mod test_helpers;

use std::time::Duration;

use coaty_agent::testing::MockBus;
use test_helpers::*;

#[tokio::test]
async fn test_raw_round_trip_in_order() {
    let bus = MockBus::new();
    let agent = quiet_agent_on(&bus, "raw-agent");
    start_online(&agent).await;

    let mut raw = agent.observe_raw("/test/42/").await.unwrap();

    // Raw events are never echo-suppressed: the publisher sees its own.
    for payload in ["1", "2", "3"] {
        agent
            .publish_raw("/test/42/", payload.as_bytes().to_vec())
            .await
            .unwrap();
    }

    for expected in ["1", "2", "3"] {
        let (topic, payload) = tokio::time::timeout(Duration::from_secs(2), raw.next())
            .await
            .expect("timed out waiting for raw message")
            .expect("raw stream ended");
        assert_eq!(topic, "/test/42/");
        assert_eq!(payload, expected.as_bytes());
    }
}

#[tokio::test]
async fn test_raw_wildcard_subscription() {
    let bus = MockBus::new();
    let publisher = quiet_agent_on(&bus, "publisher");
    let listener = quiet_agent_on(&bus, "listener");
    start_online(&publisher).await;
    start_online(&listener).await;

    let mut raw = listener.observe_raw("sensors/+/temperature").await.unwrap();

    publisher
        .publish_raw("sensors/kitchen/temperature", b"21.5".to_vec())
        .await
        .unwrap();
    publisher
        .publish_raw("sensors/kitchen/humidity", b"55".to_vec())
        .await
        .unwrap();

    let (topic, payload) = tokio::time::timeout(Duration::from_secs(2), raw.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic, "sensors/kitchen/temperature");
    assert_eq!(payload, b"21.5");

    // The humidity topic does not match the filter.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), raw.next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_raw_validation() {
    let bus = MockBus::new();
    let agent = quiet_agent_on(&bus, "validator");
    start_online(&agent).await;

    // Publishing with wildcards or NUL is rejected.
    assert!(agent.publish_raw("a/+/b", b"x".to_vec()).await.is_err());
    assert!(agent.publish_raw("a/#", b"x".to_vec()).await.is_err());
    assert!(agent.publish_raw("", b"x".to_vec()).await.is_err());
    assert!(agent.publish_raw("a\u{0}b", b"x".to_vec()).await.is_err());

    // Subscribing admits wildcards but not NUL or empty filters.
    assert!(agent.observe_raw("a/+/b").await.is_ok());
    assert!(agent.observe_raw("").await.is_err());
    assert!(agent.observe_raw("a\u{0}b").await.is_err());
}

#[tokio::test]
async fn test_raw_observer_sees_structured_traffic_verbatim() {
    let bus = MockBus::new();
    let speaker = quiet_agent_on(&bus, "speaker");
    let sniffer = quiet_agent_on(&bus, "sniffer");
    start_online(&speaker).await;
    start_online(&sniffer).await;

    let mut raw = sniffer.observe_raw("coaty/#").await.unwrap();

    let object = coaty_agent::model::CoatyObject::new(
        coaty_agent::model::CoreType::Object,
        "coaty.test.MockObject",
        "probe",
    );
    speaker.publish_advertise(object).await.unwrap();

    let (topic, payload) = tokio::time::timeout(Duration::from_secs(2), raw.next())
        .await
        .unwrap()
        .unwrap();
    assert!(topic.starts_with("coaty/1/Advertise:coaty.test.MockObject/"));
    let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(value["object"]["name"], "probe");
}
