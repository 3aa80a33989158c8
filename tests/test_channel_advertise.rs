//! Advertise, Deadvertise, and Channel broadcasts across agents

mod test_helpers;

use coaty_agent::model::{CoatyObject, CoreType};
use coaty_agent::protocol::{
    AssociateEventData, ChannelEventData, DeadvertiseEventData, EventData, EventKind,
};
use coaty_agent::testing::MockBus;
use test_helpers::*;
use uuid::Uuid;

const MOCK_OBJECT_TYPE: &str = "coaty.test.MockObject";

fn mock_object(name: &str) -> CoatyObject {
    CoatyObject::new(CoreType::Object, MOCK_OBJECT_TYPE, name)
}

#[tokio::test]
async fn test_advertise_filtered_by_object_type() {
    let bus = MockBus::new();
    let watcher = quiet_agent_on(&bus, "watcher");
    let speaker = quiet_agent_on(&bus, "speaker");
    start_online(&watcher).await;
    start_online(&speaker).await;

    let mut advertises = watcher.observe_advertise(MOCK_OBJECT_TYPE).await.unwrap();

    speaker
        .publish_advertise(CoatyObject::new(
            CoreType::Object,
            "coaty.test.OtherType",
            "other",
        ))
        .await
        .unwrap();
    speaker.publish_advertise(mock_object("wanted")).await.unwrap();

    // Only the matching object type comes through.
    let event = next_event(&mut advertises).await;
    assert_eq!(event.kind, EventKind::Advertise);
    assert_eq!(event.advertise_data().unwrap().object.name, "wanted");
    assert_eq!(event.source_id, speaker.identity().object_id);
    expect_no_event(&mut advertises).await;
}

#[tokio::test]
async fn test_own_advertise_is_echo_suppressed() {
    let bus = MockBus::new();
    let agent = quiet_agent_on(&bus, "loner");
    start_online(&agent).await;

    let mut advertises = agent.observe_advertise(MOCK_OBJECT_TYPE).await.unwrap();
    agent.publish_advertise(mock_object("self")).await.unwrap();

    expect_no_event(&mut advertises).await;
}

#[tokio::test]
async fn test_deadvertise_carries_object_ids() {
    let bus = MockBus::new();
    let watcher = quiet_agent_on(&bus, "watcher");
    let speaker = quiet_agent_on(&bus, "speaker");
    start_online(&watcher).await;
    start_online(&speaker).await;

    let mut deadvertises = watcher.observe_deadvertise().await.unwrap();

    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    speaker
        .publish_deadvertise(DeadvertiseEventData::new(vec![first, second]).unwrap())
        .await
        .unwrap();

    let event = next_event(&mut deadvertises).await;
    match &event.data {
        EventData::Deadvertise(data) => assert_eq!(data.object_ids, vec![first, second]),
        other => panic!("expected Deadvertise data, got {other:?}"),
    }
}

#[tokio::test]
async fn test_channel_broadcast() {
    let bus = MockBus::new();
    let listener = quiet_agent_on(&bus, "listener");
    let broadcaster = quiet_agent_on(&bus, "broadcaster");
    start_online(&listener).await;
    start_online(&broadcaster).await;

    let mut channel = listener.observe_channel("ch42").await.unwrap();

    broadcaster
        .publish_channel(
            "ch42",
            ChannelEventData::new(vec![mock_object("a"), mock_object("b")]).unwrap(),
        )
        .await
        .unwrap();
    broadcaster
        .publish_channel(
            "other",
            ChannelEventData::new(vec![mock_object("c")]).unwrap(),
        )
        .await
        .unwrap();

    let event = next_event(&mut channel).await;
    assert_eq!(event.channel_id(), Some("ch42"));
    match &event.data {
        EventData::Channel(data) => {
            let names: Vec<&str> = data.objects.iter().map(|o| o.name.as_str()).collect();
            assert_eq!(names, vec!["a", "b"]);
        }
        other => panic!("expected Channel data, got {other:?}"),
    }
    expect_no_event(&mut channel).await;
}

#[tokio::test]
async fn test_channel_identifier_validation() {
    let bus = MockBus::new();
    let agent = quiet_agent_on(&bus, "validator");
    start_online(&agent).await;

    for bad in ["", "ch/1", "ch+1", "ch#1", "ch\u{0}1"] {
        assert!(agent
            .publish_channel(bad, ChannelEventData::new(vec![mock_object("x")]).unwrap())
            .await
            .is_err());
        assert!(agent.observe_channel(bad).await.is_err());
    }
}

#[tokio::test]
async fn test_associate_and_io_value_round_trip() {
    let bus = MockBus::new();
    let listener = quiet_agent_on(&bus, "listener");
    let speaker = quiet_agent_on(&bus, "speaker");
    start_online(&listener).await;
    start_online(&speaker).await;

    let mut associates = listener.observe_associate().await.unwrap();
    let mut io_values = listener.observe_io_value().await.unwrap();

    let source = CoatyObject::new(CoreType::Object, "coaty.test.IoSource", "thermometer");
    let actor = CoatyObject::new(CoreType::Object, "coaty.test.IoActor", "display");
    speaker
        .publish_associate(AssociateEventData {
            io_source: source.clone(),
            io_actor: actor.clone(),
            associating_route: Some("sensors/kitchen".to_string()),
        })
        .await
        .unwrap();
    speaker
        .publish_io_value(serde_json::json!(21.5))
        .await
        .unwrap();

    let associate = next_event(&mut associates).await;
    match &associate.data {
        EventData::Associate(data) => {
            assert_eq!(data.io_source.object_id, source.object_id);
            assert_eq!(data.io_actor.object_id, actor.object_id);
            assert_eq!(data.associating_route.as_deref(), Some("sensors/kitchen"));
        }
        other => panic!("expected Associate data, got {other:?}"),
    }

    let io_value = next_event(&mut io_values).await;
    match &io_value.data {
        EventData::IoValue(data) => assert_eq!(data.value, serde_json::json!(21.5)),
        other => panic!("expected IoValue data, got {other:?}"),
    }
}

#[tokio::test]
async fn test_shared_filter_fans_out_to_both_observers() {
    let bus = MockBus::new();
    let watcher = quiet_agent_on(&bus, "watcher");
    let speaker = quiet_agent_on(&bus, "speaker");
    start_online(&watcher).await;
    start_online(&speaker).await;

    let mut first = watcher.observe_advertise(MOCK_OBJECT_TYPE).await.unwrap();
    let mut second = watcher.observe_advertise(MOCK_OBJECT_TYPE).await.unwrap();

    speaker.publish_advertise(mock_object("shared")).await.unwrap();

    assert_eq!(next_event(&mut first).await.advertise_data().unwrap().object.name, "shared");
    assert_eq!(next_event(&mut second).await.advertise_data().unwrap().object.name, "shared");

    // Detaching one observer keeps the other delivering.
    first.detach().await;
    speaker.publish_advertise(mock_object("again")).await.unwrap();
    assert_eq!(next_event(&mut second).await.advertise_data().unwrap().object.name, "again");
}
