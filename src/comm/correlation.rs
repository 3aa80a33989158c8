//! Correlation engine: message tokens and pending two-way requests
//!
//! Every two-way request (Discover, Query, Update, Call) consumes one
//! process-locally unique message token and owns one pending-request record
//! for its lifetime. Responses carry the token on the topic; the dispatcher
//! looks the record up to cross-link the response to its cached request.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{CommunicationError, CommunicationResult};
use crate::protocol::events::{CommunicationEvent, EventKind};
use crate::protocol::topic::format_message_token;

/// Lifecycle of a pending request's response sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingState {
    /// Request created, nobody subscribed yet, nothing published
    Created,
    /// Response filter attached and request published
    Subscribed,
    /// Observer detached; the sequence can never be re-observed
    Terminated,
}

/// Record of one outstanding two-way request
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub response_kind: EventKind,
    pub response_filter: String,
    pub request: Arc<CommunicationEvent>,
    pub request_topic: String,
    pub request_payload: Vec<u8>,
    pub state: PendingState,
    pub observer_id: Option<u64>,
}

/// Token allocator plus the pending-request arena
#[derive(Debug)]
pub(crate) struct CorrelationEngine {
    source_id: Uuid,
    counter: u64,
    pending: HashMap<String, PendingRequest>,
}

impl CorrelationEngine {
    /// A fresh sender starts at 0 with an associated user, else at 1
    pub fn new(source_id: Uuid, has_associated_user: bool) -> Self {
        Self {
            source_id,
            counter: if has_associated_user { 0 } else { 1 },
            pending: HashMap::new(),
        }
    }

    /// Allocate the next message token
    pub fn next_token(&mut self) -> String {
        let token = format_message_token(self.source_id, self.counter);
        self.counter += 1;
        token
    }

    /// Register a pending request under its token
    ///
    /// Tokens are allocated monotonically, so a token can never be registered
    /// twice; a collision is a bug and is rejected.
    pub fn register(&mut self, token: String, request: PendingRequest) -> CommunicationResult<()> {
        if self.pending.contains_key(&token) {
            return Err(CommunicationError::invalid_state(format!(
                "pending request for token '{token}' already exists"
            )));
        }
        self.pending.insert(token, request);
        Ok(())
    }

    pub fn get(&self, token: &str) -> Option<&PendingRequest> {
        self.pending.get(token)
    }

    pub fn get_mut(&mut self, token: &str) -> Option<&mut PendingRequest> {
        self.pending.get_mut(token)
    }

    /// Cached request event for cross-linking an inbound response
    ///
    /// Only live sequences resolve; a terminated request no longer accepts
    /// responses.
    pub fn request_for_response(
        &self,
        response_kind: EventKind,
        token: &str,
    ) -> Option<Arc<CommunicationEvent>> {
        self.pending.get(token).and_then(|pending| {
            if pending.state == PendingState::Subscribed && pending.response_kind == response_kind {
                Some(Arc::clone(&pending.request))
            } else {
                None
            }
        })
    }

    /// Mark every live sequence terminated. Used on shutdown.
    pub fn terminate_all(&mut self) {
        for pending in self.pending.values_mut() {
            pending.state = PendingState::Terminated;
            pending.observer_id = None;
        }
    }
}

/// Handle to the lazily published response sequence of one request
///
/// Created by the manager's two-way publish operations. The request is
/// published on the first (and only) `subscribe` call, after the response
/// filter is attached, so no response can race ahead of the subscription.
/// Once the returned stream is detached, the sequence is terminated for
/// good; a second subscribe fails with ResubscribeForbidden.
pub struct ResponseObservable {
    pub(crate) manager: crate::comm::manager::ManagerHandle,
    pub(crate) token: String,
}

impl ResponseObservable {
    /// Message token correlating this request with its responses
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Attach the single observer and publish the request
    pub async fn subscribe(&self) -> CommunicationResult<crate::comm::manager::EventStream> {
        crate::comm::manager::Inner::subscribe_responses(&self.manager, &self.token).await
    }
}
