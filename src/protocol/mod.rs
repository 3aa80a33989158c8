//! Wire protocol: topic grammar and event envelopes
//!
//! The topic codec is a bijective mapping between semantic event descriptors
//! and broker topic strings; the event module defines the closed set of event
//! kinds and their validated payloads.

pub mod events;
pub mod topic;

pub use events::{
    AdvertiseEventData, AssociateEventData, CallEventData, CallParameters, ChannelEventData,
    CommunicationEvent, CompleteEventData, DeadvertiseEventData, DiscoverEventData, EventData,
    EventKind, IoValueEventData, QueryEventData, RemoteCallError, ResolveEventData,
    RetrieveEventData, ReturnEventData, UpdateEventData, ERROR_CODE_INVALID_PARAMETERS,
};
pub use topic::{
    format_message_token, Topic, PROTOCOL_NAME, PROTOCOL_VERSION,
};
