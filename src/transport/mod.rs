//! Transport layer: the broker client contract and its MQTT implementation
//!
//! The communication manager owns exactly one broker client and drives it
//! through this trait, which keeps the core testable against an in-process
//! broker.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CommunicationResult;

pub mod mqtt;

/// Event emitted by a broker client toward the communication manager
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection acknowledged; subscriptions must be restored now
    Connected,
    /// Connection lost, with a reason
    Disconnected(String),
    /// Message received on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
}

/// Last-will message registered with the broker at connect time
///
/// Published by the broker itself when the client vanishes without a clean
/// disconnect, so peers still observe a Deadvertise for this agent.
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Thin contract over a publish/subscribe broker client
///
/// Implementations must deliver `TransportEvent`s in broker arrival order and
/// must not reorder messages of a single topic from a single sender.
/// `subscribe`/`unsubscribe` are safe to call before `connect`; pending
/// operations are flushed once the connection is up.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Route transport events to the given channel; set before `connect`
    fn set_event_sender(&mut self, sender: mpsc::UnboundedSender<TransportEvent>);

    /// Open the broker connection; idempotent
    ///
    /// Returns once connection supervision is running. The `Connected`
    /// transport event signals the acknowledged connection; an unreachable
    /// broker surfaces as `Disconnected` events while supervision retries.
    async fn connect(&mut self) -> CommunicationResult<()>;

    /// Close the connection and stop supervision
    async fn disconnect(&mut self) -> CommunicationResult<()>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, filter: &str) -> CommunicationResult<()>;

    /// Unsubscribe from a topic filter
    async fn unsubscribe(&self, filter: &str) -> CommunicationResult<()>;

    /// Publish a payload, handing it to the transport
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
        -> CommunicationResult<()>;
}
