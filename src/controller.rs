//! Controller boundary: lifecycle callbacks from the container
//!
//! Controllers are created and lifecycle-managed by an IoC container outside
//! this crate; they reach the wire only through the communication manager's
//! publish/observe API and receive these callbacks in life-order:
//! `on_init`, `on_container_resolved`, `on_communication_manager_starting`,
//! `on_communication_manager_stopping`, `on_dispose`.

use async_trait::async_trait;

use crate::model::object::CoatyObject;

/// Application component publishing and observing events
#[async_trait]
pub trait Controller: Send + Sync {
    /// Identity Component describing this controller on the wire
    fn component(&self) -> &CoatyObject;

    /// Whether the manager advertises this controller's Component on Online
    fn should_advertise_identity(&self) -> bool {
        true
    }

    /// Called once after construction
    async fn on_init(&self) {}

    /// Called once all container components are resolved
    async fn on_container_resolved(&self) {}

    /// Called on every transition into Starting; re-register observers here
    async fn on_communication_manager_starting(&self) {}

    /// Called on every transition into Stopping; clean up here
    async fn on_communication_manager_stopping(&self) {}

    /// Called before the container disposes the controller
    async fn on_dispose(&self) {}
}
