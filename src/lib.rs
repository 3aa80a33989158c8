//! Communication core for collaborative IoT agents over MQTT
//!
//! A distributed event bus layered over a publish/subscribe broker.
//! Independent agents exchange structured, typed events - object
//! advertisements, discovery requests with correlated responses, channel
//! broadcasts, updates with acknowledgements, and remote operation calls -
//! using a single canonical topic grammar and a single payload envelope.
//!
//! # Overview
//!
//! - [`protocol::topic`] - bijective codec between event descriptors and
//!   broker topic strings, with a reversible readable mode
//! - [`protocol::events`] - the closed set of event kinds with validated
//!   payloads and JSON round-trip
//! - [`comm::CommunicationManager`] - operating-state machine, deferred
//!   publish queue, identity advertisement, and the observe/publish API
//! - [`model::filter`] - context filters gating remote operation calls
//!
//! # Quick start
//!
//! ```no_run
//! use coaty_agent::comm::CommunicationManager;
//! use coaty_agent::config::CommunicationConfig;
//! use coaty_agent::model::CoatyObject;
//! use coaty_agent::protocol::DiscoverEventData;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CommunicationConfig::new("mqtt://localhost:1883");
//!     let manager = CommunicationManager::with_mqtt_broker(config)?;
//!     manager.start().await?;
//!
//!     // Advertise an object to peers.
//!     let lamp = CoatyObject::new(
//!         coaty_agent::model::CoreType::Object,
//!         "com.example.Lamp",
//!         "Desk lamp",
//!     );
//!     manager.publish_advertise(lamp).await?;
//!
//!     // Discover peers' objects; responses arrive as Resolve events.
//!     let request = manager
//!         .publish_discover(DiscoverEventData::with_object_types(vec![
//!             "com.example.Lamp".to_string(),
//!         ]))
//!         .await?;
//!     let mut responses = request.subscribe().await?;
//!     if let Some(resolve) = responses.next().await {
//!         println!("resolved by {}", resolve.source_id);
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod comm;
pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use comm::{CommunicationManager, EventStream, OperatingState, RawStream, ResponseObservable};
pub use config::{CommunicationConfig, Configuration};
pub use controller::Controller;
pub use error::{CommunicationError, CommunicationResult};
pub use model::{CoatyObject, ContextFilter, CoreType};
pub use protocol::{CommunicationEvent, EventData, EventKind, Topic};
