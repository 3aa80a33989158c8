//! Communication core: subscription registry, correlation engine, manager
//!
//! The communication manager exclusively owns the broker client, the
//! subscription registry, and the correlation engine; controllers reach the
//! wire only through the manager's observe/publish API.

pub mod correlation;
pub mod manager;
pub mod registry;

pub use correlation::ResponseObservable;
pub use manager::{CommunicationManager, EventStream, OperatingState, RawStream};
