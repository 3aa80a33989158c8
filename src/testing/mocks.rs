//! In-process broker for testing without external dependencies
//!
//! A `MockBus` plays the role of an MQTT broker shared by any number of
//! `MockBroker` clients, matching topic filters with the real MQTT rules and
//! delivering messages in publish order. The bus can be taken offline and
//! back online to exercise reconnection behavior, and a client can be killed
//! without a clean disconnect to trigger its last will.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::comm::registry::filter_matches_topic;
use crate::error::{CommunicationError, CommunicationResult};
use crate::transport::{BrokerClient, LastWill, TransportEvent};

#[derive(Debug, Default)]
struct ClientSlot {
    subscriptions: HashSet<String>,
    sender: Option<mpsc::UnboundedSender<TransportEvent>>,
    connected: bool,
    wants_connect: bool,
    last_will: Option<LastWill>,
}

#[derive(Debug, Default)]
struct BusState {
    online: bool,
    next_client_id: u64,
    clients: HashMap<u64, ClientSlot>,
}

impl BusState {
    /// Route a published message to every connected client with a matching
    /// subscription, the publisher included
    fn route(&self, topic: &str, payload: &[u8]) {
        for slot in self.clients.values() {
            if !slot.connected {
                continue;
            }
            if slot
                .subscriptions
                .iter()
                .any(|filter| filter_matches_topic(filter, topic))
            {
                if let Some(sender) = &slot.sender {
                    let _ = sender.send(TransportEvent::Message {
                        topic: topic.to_string(),
                        payload: payload.to_vec(),
                    });
                }
            }
        }
    }
}

/// Shared in-process broker
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    /// A reachable bus
    pub fn new() -> Self {
        let bus = Self::default();
        bus.state.lock().unwrap().online = true;
        bus
    }

    /// An initially unreachable bus; bring it up with `set_online(true)`
    pub fn unreachable() -> Self {
        Self::default()
    }

    /// Create a client attached to this bus
    pub fn client(&self) -> MockBroker {
        self.client_with_will(None)
    }

    /// Create a client with a last will
    pub fn client_with_will(&self, last_will: Option<LastWill>) -> MockBroker {
        let mut state = self.state.lock().unwrap();
        let id = state.next_client_id;
        state.next_client_id += 1;
        state.clients.insert(
            id,
            ClientSlot {
                last_will,
                ..Default::default()
            },
        );
        MockBroker {
            id,
            state: Arc::clone(&self.state),
        }
    }

    /// Change reachability; pending connects succeed when coming up,
    /// connected clients observe a disconnect when going down
    pub fn set_online(&self, online: bool) {
        let mut state = self.state.lock().unwrap();
        state.online = online;
        if online {
            for slot in state.clients.values_mut() {
                if slot.wants_connect && !slot.connected {
                    slot.connected = true;
                    slot.wants_connect = false;
                    if let Some(sender) = &slot.sender {
                        let _ = sender.send(TransportEvent::Connected);
                    }
                }
            }
        } else {
            for slot in state.clients.values_mut() {
                if slot.connected {
                    slot.connected = false;
                    slot.wants_connect = true;
                    if let Some(sender) = &slot.sender {
                        let _ = sender.send(TransportEvent::Disconnected(
                            "broker unreachable".to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Kill a client without a clean disconnect, publishing its last will
    pub fn kill_client(&self, client: &MockBroker) {
        let mut state = self.state.lock().unwrap();
        let will = match state.clients.get_mut(&client.id) {
            Some(slot) => {
                slot.connected = false;
                slot.wants_connect = false;
                slot.last_will.clone()
            }
            None => None,
        };
        if let Some(will) = will {
            state.route(&will.topic, &will.payload);
        }
    }
}

/// Client endpoint of a `MockBus`
pub struct MockBroker {
    id: u64,
    state: Arc<Mutex<BusState>>,
}

impl MockBroker {
    fn with_slot<R>(&self, f: impl FnOnce(&mut ClientSlot) -> R) -> CommunicationResult<R> {
        let mut state = self.state.lock().unwrap();
        state
            .clients
            .get_mut(&self.id)
            .map(f)
            .ok_or_else(|| CommunicationError::broker_msg("client removed from bus"))
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    fn set_event_sender(&mut self, sender: mpsc::UnboundedSender<TransportEvent>) {
        let _ = self.with_slot(|slot| slot.sender = Some(sender));
    }

    async fn connect(&mut self) -> CommunicationResult<()> {
        let mut state = self.state.lock().unwrap();
        let online = state.online;
        let slot = state
            .clients
            .get_mut(&self.id)
            .ok_or_else(|| CommunicationError::broker_msg("client removed from bus"))?;
        if online {
            slot.connected = true;
            slot.wants_connect = false;
            if let Some(sender) = &slot.sender {
                let _ = sender.send(TransportEvent::Connected);
            }
        } else {
            // Supervision keeps retrying; the connect attempt itself succeeds.
            slot.wants_connect = true;
            if let Some(sender) = &slot.sender {
                let _ = sender.send(TransportEvent::Disconnected(
                    "broker unreachable".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> CommunicationResult<()> {
        self.with_slot(|slot| {
            slot.connected = false;
            slot.wants_connect = false;
        })
    }

    async fn subscribe(&self, filter: &str) -> CommunicationResult<()> {
        self.with_slot(|slot| {
            slot.subscriptions.insert(filter.to_string());
        })
    }

    async fn unsubscribe(&self, filter: &str) -> CommunicationResult<()> {
        self.with_slot(|slot| {
            slot.subscriptions.remove(filter);
        })
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _retain: bool,
    ) -> CommunicationResult<()> {
        let state = self.state.lock().unwrap();
        let connected = state
            .clients
            .get(&self.id)
            .map(|slot| slot.connected)
            .unwrap_or(false);
        if !connected {
            return Err(CommunicationError::broker_msg("not connected"));
        }
        state.route(topic, &payload);
        Ok(())
    }
}
