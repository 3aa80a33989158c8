//! Test helpers and utilities for integration tests

use std::time::Duration;

use coaty_agent::comm::{CommunicationManager, EventStream, OperatingState};
use coaty_agent::config::CommunicationConfig;
use coaty_agent::protocol::CommunicationEvent;
use coaty_agent::testing::MockBus;

/// Create a named agent attached to the shared mock bus
#[allow(dead_code)]
pub fn agent_on(bus: &MockBus, name: &str) -> CommunicationManager {
    let mut config = CommunicationConfig::new("mqtt://mock-bus");
    config.identity_name = name.to_string();
    CommunicationManager::new(config, Box::new(bus.client()))
}

/// Create an agent that keeps quiet on the wire (no identity advertisement)
#[allow(dead_code)]
pub fn quiet_agent_on(bus: &MockBus, name: &str) -> CommunicationManager {
    let mut config = CommunicationConfig::new("mqtt://mock-bus");
    config.identity_name = name.to_string();
    config.should_advertise_identity = false;
    CommunicationManager::new(config, Box::new(bus.client()))
}

/// Wait until the manager reaches the given operating state
#[allow(dead_code)]
pub async fn wait_for_state(manager: &CommunicationManager, state: OperatingState) {
    let mut rx = manager.observe_operating_state();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for state {state}"))
        .expect("state channel closed");
}

/// Start an agent and wait until it is Online
#[allow(dead_code)]
pub async fn start_online(manager: &CommunicationManager) {
    manager.start().await.expect("start failed");
    wait_for_state(manager, OperatingState::Online).await;
}

/// Next event within a generous timeout
#[allow(dead_code)]
pub async fn next_event(stream: &mut EventStream) -> CommunicationEvent {
    tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

/// Assert that no further event arrives within a short window
#[allow(dead_code)]
pub async fn expect_no_event(stream: &mut EventStream) {
    let outcome = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
    assert!(outcome.is_err(), "expected no event, got {outcome:?}");
}
