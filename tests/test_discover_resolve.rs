//! Discover/Resolve correlation across multiple agents

mod test_helpers;

use coaty_agent::model::{CoatyObject, CoreType};
use coaty_agent::protocol::{DiscoverEventData, EventKind, ResolveEventData};
use coaty_agent::testing::MockBus;
use test_helpers::*;

const MOCK_OBJECT_TYPE: &str = "coaty.test.MockObject";

fn mock_object(name: &str) -> CoatyObject {
    CoatyObject::new(CoreType::Object, MOCK_OBJECT_TYPE, name)
}

#[tokio::test]
async fn test_discover_resolved_by_two_agents() {
    let bus = MockBus::new();
    let agent_a = quiet_agent_on(&bus, "A");
    let agent_b = quiet_agent_on(&bus, "B");
    let agent_c = quiet_agent_on(&bus, "C");
    start_online(&agent_a).await;
    start_online(&agent_b).await;
    start_online(&agent_c).await;

    let mut discovers_b = agent_b.observe_discover().await.unwrap();
    let mut discovers_c = agent_c.observe_discover().await.unwrap();

    let request = agent_a
        .publish_discover(DiscoverEventData::with_object_types(vec![
            MOCK_OBJECT_TYPE.to_string(),
        ]))
        .await
        .unwrap();
    let mut responses = request.subscribe().await.unwrap();

    // B and C each see the Discover and resolve it.
    let discover_b = next_event(&mut discovers_b).await;
    assert_eq!(discover_b.kind, EventKind::Discover);
    assert_eq!(
        discover_b.discover_data().unwrap().object_types,
        Some(vec![MOCK_OBJECT_TYPE.to_string()])
    );
    agent_b
        .publish_resolve(
            &discover_b,
            ResolveEventData::with_object(mock_object("from-b")),
        )
        .await
        .unwrap();

    let discover_c = next_event(&mut discovers_c).await;
    agent_c
        .publish_resolve(
            &discover_c,
            ResolveEventData::with_object(mock_object("from-c")),
        )
        .await
        .unwrap();

    // A receives exactly two Resolve events, cross-linked to its request.
    let first = next_event(&mut responses).await;
    let second = next_event(&mut responses).await;
    expect_no_event(&mut responses).await;

    let own_id = agent_a.identity().object_id;
    let mut resolver_ids = Vec::new();
    for resolve in [&first, &second] {
        assert_eq!(resolve.kind, EventKind::Resolve);
        assert_eq!(resolve.message_token, request.token());
        assert_ne!(resolve.source_id, own_id);
        resolver_ids.push(resolve.source_id);

        let linked = resolve.event_request.as_ref().expect("request not linked");
        assert_eq!(linked.kind, EventKind::Discover);
        assert_eq!(linked.message_token, request.token());
    }
    resolver_ids.sort();
    let mut expected = vec![
        agent_b.identity().object_id,
        agent_c.identity().object_id,
    ];
    expected.sort();
    assert_eq!(resolver_ids, expected);

    let names: Vec<String> = [&first, &second]
        .iter()
        .map(|r| r.resolve_data().unwrap().object.as_ref().unwrap().name.clone())
        .collect();
    assert!(names.contains(&"from-b".to_string()));
    assert!(names.contains(&"from-c".to_string()));
}

#[tokio::test]
async fn test_discover_by_external_id() {
    let bus = MockBus::new();
    let seeker = quiet_agent_on(&bus, "seeker");
    let holder = quiet_agent_on(&bus, "holder");
    start_online(&seeker).await;
    start_online(&holder).await;

    let mut discovers = holder.observe_discover().await.unwrap();

    let request = seeker
        .publish_discover(DiscoverEventData::with_external_id("plc-4711"))
        .await
        .unwrap();
    let mut responses = request.subscribe().await.unwrap();

    let discover = next_event(&mut discovers).await;
    assert_eq!(
        discover.discover_data().unwrap().external_id.as_deref(),
        Some("plc-4711")
    );
    let found = mock_object("found").with_external_id("plc-4711");
    holder
        .publish_resolve(&discover, ResolveEventData::with_object(found))
        .await
        .unwrap();

    let resolve = next_event(&mut responses).await;
    let object = resolve.resolve_data().unwrap().object.as_ref().unwrap().clone();
    assert_eq!(object.external_id.as_deref(), Some("plc-4711"));
}

#[tokio::test]
async fn test_responses_stop_after_detach() {
    let bus = MockBus::new();
    let seeker = quiet_agent_on(&bus, "seeker");
    let holder = quiet_agent_on(&bus, "holder");
    start_online(&seeker).await;
    start_online(&holder).await;

    let mut discovers = holder.observe_discover().await.unwrap();

    let request = seeker
        .publish_discover(DiscoverEventData::with_object_types(vec![
            MOCK_OBJECT_TYPE.to_string(),
        ]))
        .await
        .unwrap();
    let responses = request.subscribe().await.unwrap();
    let discover = next_event(&mut discovers).await;

    // Detach before any response is published.
    responses.detach().await;

    holder
        .publish_resolve(&discover, ResolveEventData::with_object(mock_object("late")))
        .await
        .unwrap();

    // The terminated sequence cannot be observed again.
    assert!(matches!(
        request.subscribe().await,
        Err(coaty_agent::CommunicationError::ResubscribeForbidden)
    ));
}
