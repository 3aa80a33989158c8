//! Event envelopes: the closed set of event kinds and their payloads
//!
//! Each event kind carries a payload whose structure is validated at
//! construction and again on decode; violations fail with InvalidPayload.
//! Payloads serialize to camelCase JSON and obey the round-trip law
//! `EventData::from_json(kind, e.to_json_object()) == e` for every kind
//! except Raw, which bypasses JSON entirely.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CommunicationError, CommunicationResult};
use crate::model::filter::{matches_filter, ContextFilter};
use crate::model::object::{CoatyObject, CoreType};

/// JSON-RPC style error code for a parameter-shape mismatch on a Call
pub const ERROR_CODE_INVALID_PARAMETERS: i64 = -32602;

/// Closed set of event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Advertise,
    Deadvertise,
    Channel,
    Discover,
    Resolve,
    Query,
    Retrieve,
    Update,
    Complete,
    Call,
    Return,
    Associate,
    IoValue,
    Raw,
}

impl EventKind {
    /// Wire name used on the event type topic level
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Advertise => "Advertise",
            EventKind::Deadvertise => "Deadvertise",
            EventKind::Channel => "Channel",
            EventKind::Discover => "Discover",
            EventKind::Resolve => "Resolve",
            EventKind::Query => "Query",
            EventKind::Retrieve => "Retrieve",
            EventKind::Update => "Update",
            EventKind::Complete => "Complete",
            EventKind::Call => "Call",
            EventKind::Return => "Return",
            EventKind::Associate => "Associate",
            EventKind::IoValue => "IoValue",
            EventKind::Raw => "Raw",
        }
    }

    /// Parse a wire name; Raw never appears on the structured topic grammar
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "Advertise" => Some(EventKind::Advertise),
            "Deadvertise" => Some(EventKind::Deadvertise),
            "Channel" => Some(EventKind::Channel),
            "Discover" => Some(EventKind::Discover),
            "Resolve" => Some(EventKind::Resolve),
            "Query" => Some(EventKind::Query),
            "Retrieve" => Some(EventKind::Retrieve),
            "Update" => Some(EventKind::Update),
            "Complete" => Some(EventKind::Complete),
            "Call" => Some(EventKind::Call),
            "Return" => Some(EventKind::Return),
            "Associate" => Some(EventKind::Associate),
            "IoValue" => Some(EventKind::IoValue),
            _ => None,
        }
    }

    /// Whether the event type level admits a `:<filter>` suffix
    pub fn admits_filter_suffix(&self) -> bool {
        matches!(
            self,
            EventKind::Advertise
                | EventKind::Channel
                | EventKind::Update
                | EventKind::Complete
                | EventKind::Associate
                | EventKind::Call
                | EventKind::Return
        )
    }

    /// Response kind of a two-way request kind
    pub fn response_kind(&self) -> Option<EventKind> {
        match self {
            EventKind::Discover => Some(EventKind::Resolve),
            EventKind::Query => Some(EventKind::Retrieve),
            EventKind::Update => Some(EventKind::Complete),
            EventKind::Call => Some(EventKind::Return),
            _ => None,
        }
    }

    /// Whether this kind answers a correlated request
    pub fn is_response_kind(&self) -> bool {
        matches!(
            self,
            EventKind::Resolve | EventKind::Retrieve | EventKind::Complete | EventKind::Return
        )
    }
}

/// Advertise: make an object known to peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertiseEventData {
    pub object: CoatyObject,
}

impl AdvertiseEventData {
    pub fn new(object: CoatyObject) -> Self {
        Self { object }
    }
}

/// Deadvertise: withdraw previously advertised objects by identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadvertiseEventData {
    pub object_ids: Vec<Uuid>,
}

impl DeadvertiseEventData {
    pub fn new(object_ids: Vec<Uuid>) -> CommunicationResult<Self> {
        let data = Self { object_ids };
        data.validate()?;
        Ok(data)
    }

    fn validate(&self) -> CommunicationResult<()> {
        if self.object_ids.is_empty() {
            return Err(CommunicationError::invalid_payload(
                "Deadvertise requires at least one object id",
            ));
        }
        Ok(())
    }
}

/// Channel: broadcast objects on a named channel
///
/// The channel identifier travels as the event filter suffix on the topic,
/// not in the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEventData {
    pub objects: Vec<CoatyObject>,
}

impl ChannelEventData {
    pub fn new(objects: Vec<CoatyObject>) -> CommunicationResult<Self> {
        let data = Self { objects };
        data.validate()?;
        Ok(data)
    }

    fn validate(&self) -> CommunicationResult<()> {
        if self.objects.is_empty() {
            return Err(CommunicationError::invalid_payload(
                "Channel requires at least one object",
            ));
        }
        Ok(())
    }
}

/// Discover: look up objects by id, external id, object types, or core types
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverEventData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_types: Option<Vec<CoreType>>,
}

impl DiscoverEventData {
    pub fn with_object_id(object_id: Uuid) -> Self {
        Self {
            object_id: Some(object_id),
            ..Default::default()
        }
    }

    pub fn with_external_id<S: Into<String>>(external_id: S) -> Self {
        Self {
            external_id: Some(external_id.into()),
            ..Default::default()
        }
    }

    pub fn with_object_types(object_types: Vec<String>) -> Self {
        Self {
            object_types: Some(object_types),
            ..Default::default()
        }
    }

    pub fn with_core_types(core_types: Vec<CoreType>) -> Self {
        Self {
            core_types: Some(core_types),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> CommunicationResult<()> {
        if self.object_id.is_none()
            && self.external_id.is_none()
            && self.object_types.is_none()
            && self.core_types.is_none()
        {
            return Err(CommunicationError::invalid_payload(
                "Discover requires at least one selector",
            ));
        }
        if self.object_types.is_some() && self.core_types.is_some() {
            return Err(CommunicationError::invalid_payload(
                "Discover may not combine objectTypes with coreTypes",
            ));
        }
        Ok(())
    }
}

/// Resolve: answer to a Discover
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveEventData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<CoatyObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_objects: Option<Vec<CoatyObject>>,
}

impl ResolveEventData {
    pub fn with_object(object: CoatyObject) -> Self {
        Self {
            object: Some(object),
            related_objects: None,
        }
    }

    pub fn with_related_objects(related_objects: Vec<CoatyObject>) -> Self {
        Self {
            object: None,
            related_objects: Some(related_objects),
        }
    }

    pub fn validate(&self) -> CommunicationResult<()> {
        match (&self.object, &self.related_objects) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(CommunicationError::invalid_payload(
                "Resolve requires exactly one of object or relatedObjects",
            )),
        }
    }
}

/// Query: retrieve objects by schema descriptor with an optional filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEventData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_types: Option<Vec<CoreType>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_filter: Option<ContextFilter>,
}

impl QueryEventData {
    pub fn with_object_types(
        object_types: Vec<String>,
        object_filter: Option<ContextFilter>,
    ) -> Self {
        Self {
            object_types: Some(object_types),
            core_types: None,
            object_filter,
        }
    }

    pub fn with_core_types(
        core_types: Vec<CoreType>,
        object_filter: Option<ContextFilter>,
    ) -> Self {
        Self {
            object_types: None,
            core_types: Some(core_types),
            object_filter,
        }
    }

    pub fn validate(&self) -> CommunicationResult<()> {
        match (&self.object_types, &self.core_types) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(CommunicationError::invalid_payload(
                "Query requires exactly one of objectTypes or coreTypes",
            )),
        }
    }
}

/// Retrieve: answer to a Query with an ordered object list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveEventData {
    pub objects: Vec<CoatyObject>,
}

impl RetrieveEventData {
    pub fn new(objects: Vec<CoatyObject>) -> Self {
        Self { objects }
    }
}

/// Update: request a full or partial object update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEventData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<CoatyObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub changed_values: Map<String, Value>,
}

impl UpdateEventData {
    /// Full update carrying the complete object
    pub fn full(object: CoatyObject) -> Self {
        Self {
            object: Some(object),
            object_id: None,
            changed_values: Map::new(),
        }
    }

    /// Partial update: the target object id plus the changed properties
    pub fn partial(object_id: Uuid, changed_values: Map<String, Value>) -> Self {
        Self {
            object: None,
            object_id: Some(object_id),
            changed_values,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.object.is_none()
    }

    pub fn validate(&self) -> CommunicationResult<()> {
        match (&self.object, &self.object_id) {
            (Some(_), None) if self.changed_values.is_empty() => Ok(()),
            (None, Some(_)) => Ok(()),
            (Some(_), _) => Err(CommunicationError::invalid_payload(
                "full Update may not carry objectId or changedValues",
            )),
            (None, None) => Err(CommunicationError::invalid_payload(
                "partial Update requires objectId",
            )),
        }
    }
}

/// Complete: acknowledged post-update state, answer to an Update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteEventData {
    pub object: CoatyObject,
}

impl CompleteEventData {
    pub fn new(object: CoatyObject) -> Self {
        Self { object }
    }
}

/// Positional or named parameters of a remote operation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallParameters {
    ByPosition(Vec<Value>),
    ByName(Map<String, Value>),
}

/// Call: invoke a remote operation
///
/// The operation name travels as the event filter suffix on the topic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEventData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<CallParameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<ContextFilter>,
}

impl CallEventData {
    pub fn new(parameters: Option<CallParameters>, filter: Option<ContextFilter>) -> Self {
        Self { parameters, filter }
    }

    /// Whether a receiver's context object passes this call's filter
    ///
    /// A call without a filter applies everywhere.
    pub fn matches_context(&self, context: &CoatyObject) -> bool {
        match &self.filter {
            Some(filter) => matches_filter(filter, context),
            None => true,
        }
    }

    /// Positional parameters, if given in that shape
    pub fn positional_parameters(&self) -> Option<&[Value]> {
        match &self.parameters {
            Some(CallParameters::ByPosition(values)) => Some(values),
            _ => None,
        }
    }

    /// Named parameters, if given in that shape
    pub fn named_parameters(&self) -> Option<&Map<String, Value>> {
        match &self.parameters {
            Some(CallParameters::ByName(map)) => Some(map),
            _ => None,
        }
    }
}

/// Error carried in a Return envelope
///
/// Codes −32768..−32000 are reserved by the JSON-RPC convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCallError {
    pub code: i64,
    pub message: String,
}

impl RemoteCallError {
    pub fn new<S: Into<String>>(code: i64, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The reserved error for a parameter-shape mismatch
    pub fn invalid_parameters() -> Self {
        Self::new(ERROR_CODE_INVALID_PARAMETERS, "Invalid params")
    }
}

/// Return: result of a remote operation, answer to a Call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnEventData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteCallError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_info: Option<Value>,
}

impl ReturnEventData {
    pub fn with_result(result: Value, execution_info: Option<Value>) -> Self {
        Self {
            result: Some(result),
            error: None,
            execution_info,
        }
    }

    pub fn with_error(error: RemoteCallError, execution_info: Option<Value>) -> Self {
        Self {
            result: None,
            error: Some(error),
            execution_info,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn validate(&self) -> CommunicationResult<()> {
        match (&self.result, &self.error) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(CommunicationError::invalid_payload(
                "Return requires exactly one of result or error",
            )),
        }
    }
}

/// Associate: bind an IO source to an IO actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociateEventData {
    pub io_source: CoatyObject,
    pub io_actor: CoatyObject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub associating_route: Option<String>,
}

/// IoValue: a value emitted by an IO source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IoValueEventData {
    pub value: Value,
}

/// Tagged payload of an event
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Advertise(AdvertiseEventData),
    Deadvertise(DeadvertiseEventData),
    Channel(ChannelEventData),
    Discover(DiscoverEventData),
    Resolve(ResolveEventData),
    Query(QueryEventData),
    Retrieve(RetrieveEventData),
    Update(UpdateEventData),
    Complete(CompleteEventData),
    Call(CallEventData),
    Return(ReturnEventData),
    Associate(AssociateEventData),
    IoValue(IoValueEventData),
    /// Opaque bytes, bypassing JSON
    Raw(Vec<u8>),
}

impl EventData {
    /// Event kind this payload belongs to
    pub fn kind(&self) -> EventKind {
        match self {
            EventData::Advertise(_) => EventKind::Advertise,
            EventData::Deadvertise(_) => EventKind::Deadvertise,
            EventData::Channel(_) => EventKind::Channel,
            EventData::Discover(_) => EventKind::Discover,
            EventData::Resolve(_) => EventKind::Resolve,
            EventData::Query(_) => EventKind::Query,
            EventData::Retrieve(_) => EventKind::Retrieve,
            EventData::Update(_) => EventKind::Update,
            EventData::Complete(_) => EventKind::Complete,
            EventData::Call(_) => EventKind::Call,
            EventData::Return(_) => EventKind::Return,
            EventData::Associate(_) => EventKind::Associate,
            EventData::IoValue(_) => EventKind::IoValue,
            EventData::Raw(_) => EventKind::Raw,
        }
    }

    /// JSON object form of the payload; None for Raw
    pub fn to_json_object(&self) -> CommunicationResult<Option<Value>> {
        let value = match self {
            EventData::Advertise(data) => serde_json::to_value(data)?,
            EventData::Deadvertise(data) => serde_json::to_value(data)?,
            EventData::Channel(data) => serde_json::to_value(data)?,
            EventData::Discover(data) => serde_json::to_value(data)?,
            EventData::Resolve(data) => serde_json::to_value(data)?,
            EventData::Query(data) => serde_json::to_value(data)?,
            EventData::Retrieve(data) => serde_json::to_value(data)?,
            EventData::Update(data) => serde_json::to_value(data)?,
            EventData::Complete(data) => serde_json::to_value(data)?,
            EventData::Call(data) => serde_json::to_value(data)?,
            EventData::Return(data) => serde_json::to_value(data)?,
            EventData::Associate(data) => serde_json::to_value(data)?,
            EventData::IoValue(data) => serde_json::to_value(data)?,
            EventData::Raw(_) => return Ok(None),
        };
        Ok(Some(value))
    }

    /// Wire payload bytes: UTF-8 JSON, or the raw bytes themselves
    pub fn to_payload(&self) -> CommunicationResult<Vec<u8>> {
        match self {
            EventData::Raw(bytes) => Ok(bytes.clone()),
            other => {
                let value = other
                    .to_json_object()?
                    .ok_or_else(|| CommunicationError::invalid_payload("missing payload"))?;
                Ok(serde_json::to_vec(&value)?)
            }
        }
    }

    /// Decode and validate a payload for the given kind
    pub fn from_json(kind: EventKind, value: Value) -> CommunicationResult<Self> {
        fn parse<T: serde::de::DeserializeOwned>(value: Value) -> CommunicationResult<T> {
            serde_json::from_value(value).map_err(|e| {
                CommunicationError::invalid_payload(format!("malformed event data: {e}"))
            })
        }

        let data = match kind {
            EventKind::Advertise => EventData::Advertise(parse(value)?),
            EventKind::Deadvertise => {
                let data: DeadvertiseEventData = parse(value)?;
                data.validate()?;
                EventData::Deadvertise(data)
            }
            EventKind::Channel => {
                let data: ChannelEventData = parse(value)?;
                data.validate()?;
                EventData::Channel(data)
            }
            EventKind::Discover => {
                let data: DiscoverEventData = parse(value)?;
                data.validate()?;
                EventData::Discover(data)
            }
            EventKind::Resolve => {
                let data: ResolveEventData = parse(value)?;
                data.validate()?;
                EventData::Resolve(data)
            }
            EventKind::Query => {
                let data: QueryEventData = parse(value)?;
                data.validate()?;
                EventData::Query(data)
            }
            EventKind::Retrieve => EventData::Retrieve(parse(value)?),
            EventKind::Update => {
                let data: UpdateEventData = parse(value)?;
                data.validate()?;
                EventData::Update(data)
            }
            EventKind::Complete => EventData::Complete(parse(value)?),
            EventKind::Call => EventData::Call(parse(value)?),
            EventKind::Return => {
                let data: ReturnEventData = parse(value)?;
                data.validate()?;
                EventData::Return(data)
            }
            EventKind::Associate => EventData::Associate(parse(value)?),
            EventKind::IoValue => EventData::IoValue(parse(value)?),
            EventKind::Raw => {
                return Err(CommunicationError::invalid_payload(
                    "Raw events carry no JSON payload",
                ))
            }
        };
        Ok(data)
    }

    /// Decode a wire payload for the given kind
    pub fn from_payload(kind: EventKind, payload: &[u8]) -> CommunicationResult<Self> {
        if kind == EventKind::Raw {
            return Ok(EventData::Raw(payload.to_vec()));
        }
        let value: Value = serde_json::from_slice(payload).map_err(|e| {
            CommunicationError::invalid_payload(format!("payload is not valid JSON: {e}"))
        })?;
        Self::from_json(kind, value)
    }
}

/// Inbound or cached outgoing event envelope
///
/// Source and user identity come from the topic; `event_request` is filled
/// in by the correlation engine on response events for the duration of a
/// dispatch.
#[derive(Debug, Clone)]
pub struct CommunicationEvent {
    pub kind: EventKind,
    /// Topic filter suffix (object type, channel id, or operation name)
    pub event_filter: Option<String>,
    pub data: EventData,
    pub source_id: Uuid,
    pub user_id: Option<Uuid>,
    pub message_token: String,
    /// Back-reference to the request this event answers
    pub event_request: Option<Arc<CommunicationEvent>>,
}

impl CommunicationEvent {
    /// Channel identifier of a Channel event
    pub fn channel_id(&self) -> Option<&str> {
        match self.kind {
            EventKind::Channel => self.event_filter.as_deref(),
            _ => None,
        }
    }

    /// Operation name of a Call event
    pub fn operation(&self) -> Option<&str> {
        match self.kind {
            EventKind::Call => self.event_filter.as_deref(),
            _ => None,
        }
    }

    pub fn advertise_data(&self) -> Option<&AdvertiseEventData> {
        match &self.data {
            EventData::Advertise(data) => Some(data),
            _ => None,
        }
    }

    pub fn discover_data(&self) -> Option<&DiscoverEventData> {
        match &self.data {
            EventData::Discover(data) => Some(data),
            _ => None,
        }
    }

    pub fn resolve_data(&self) -> Option<&ResolveEventData> {
        match &self.data {
            EventData::Resolve(data) => Some(data),
            _ => None,
        }
    }

    pub fn update_data(&self) -> Option<&UpdateEventData> {
        match &self.data {
            EventData::Update(data) => Some(data),
            _ => None,
        }
    }

    pub fn complete_data(&self) -> Option<&CompleteEventData> {
        match &self.data {
            EventData::Complete(data) => Some(data),
            _ => None,
        }
    }

    pub fn call_data(&self) -> Option<&CallEventData> {
        match &self.data {
            EventData::Call(data) => Some(data),
            _ => None,
        }
    }

    pub fn return_data(&self) -> Option<&ReturnEventData> {
        match &self.data {
            EventData::Return(data) => Some(data),
            _ => None,
        }
    }

    pub fn retrieve_data(&self) -> Option<&RetrieveEventData> {
        match &self.data {
            EventData::Retrieve(data) => Some(data),
            _ => None,
        }
    }

    pub fn raw_data(&self) -> Option<&[u8]> {
        match &self.data {
            EventData::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::filter::{FilterCondition, FilterOperator};
    use serde_json::json;

    fn mock_object() -> CoatyObject {
        CoatyObject::new(CoreType::Object, "coaty.test.MockObject", "mock")
    }

    #[test]
    fn test_round_trip_law_per_kind() {
        let object = mock_object();
        let cases: Vec<EventData> = vec![
            EventData::Advertise(AdvertiseEventData::new(object.clone())),
            EventData::Deadvertise(DeadvertiseEventData::new(vec![object.object_id]).unwrap()),
            EventData::Channel(ChannelEventData::new(vec![object.clone()]).unwrap()),
            EventData::Discover(DiscoverEventData::with_object_types(vec![
                "coaty.test.MockObject".to_string(),
            ])),
            EventData::Resolve(ResolveEventData::with_object(object.clone())),
            EventData::Query(QueryEventData::with_core_types(
                vec![CoreType::Task],
                Some(ContextFilter::condition(FilterCondition::new(
                    "floor",
                    FilterOperator::Between,
                    vec![json!(6), json!(8)],
                ))),
            )),
            EventData::Retrieve(RetrieveEventData::new(vec![object.clone()])),
            EventData::Update(UpdateEventData::full(object.clone())),
            EventData::Complete(CompleteEventData::new(object.clone())),
            EventData::Call(CallEventData::new(
                Some(CallParameters::ByName(
                    json!({"state": "on"}).as_object().unwrap().clone(),
                )),
                None,
            )),
            EventData::Return(ReturnEventData::with_result(
                json!(85),
                Some(json!({"duration": 4711})),
            )),
            EventData::Associate(AssociateEventData {
                io_source: object.clone(),
                io_actor: mock_object(),
                associating_route: Some("route-1".to_string()),
            }),
            EventData::IoValue(IoValueEventData { value: json!(21.5) }),
        ];

        for data in cases {
            let kind = data.kind();
            let json_object = data.to_json_object().unwrap().unwrap();
            let decoded = EventData::from_json(kind, json_object.clone()).unwrap();
            assert_eq!(decoded, data, "round trip failed for {kind:?}");
            // and the JSON form itself is stable
            assert_eq!(decoded.to_json_object().unwrap().unwrap(), json_object);
        }
    }

    #[test]
    fn test_payload_bytes_are_utf8_json() {
        let data = EventData::Advertise(AdvertiseEventData::new(mock_object()));
        let payload = data.to_payload().unwrap();
        let text = std::str::from_utf8(&payload).unwrap();
        let value: Value = serde_json::from_str(text).unwrap();
        assert_eq!(
            EventData::from_json(EventKind::Advertise, value).unwrap(),
            data
        );
    }

    #[test]
    fn test_raw_bypasses_json() {
        let data = EventData::Raw(vec![0x01, 0xff, 0x00]);
        assert_eq!(data.to_json_object().unwrap(), None);
        assert_eq!(data.to_payload().unwrap(), vec![0x01, 0xff, 0x00]);
        let decoded = EventData::from_payload(EventKind::Raw, &[0x01, 0xff, 0x00]).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_discover_validation() {
        assert!(DiscoverEventData::default().validate().is_err());
        let mut both = DiscoverEventData::with_object_types(vec!["t".to_string()]);
        both.core_types = Some(vec![CoreType::Task]);
        assert!(both.validate().is_err());
        assert!(DiscoverEventData::with_external_id("ext-1").validate().is_ok());
    }

    #[test]
    fn test_resolve_exactly_one_of() {
        let neither = ResolveEventData {
            object: None,
            related_objects: None,
        };
        assert!(neither.validate().is_err());
        let both = ResolveEventData {
            object: Some(mock_object()),
            related_objects: Some(vec![]),
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_update_forms() {
        assert!(UpdateEventData::full(mock_object()).validate().is_ok());

        let mut changed = Map::new();
        changed.insert("state".to_string(), json!("on"));
        let partial = UpdateEventData::partial(Uuid::new_v4(), changed);
        assert!(partial.validate().is_ok());
        assert!(partial.is_partial());

        let missing_id = UpdateEventData {
            object: None,
            object_id: None,
            changed_values: Map::new(),
        };
        assert!(missing_id.validate().is_err());
    }

    #[test]
    fn test_return_exactly_one_of() {
        let neither = ReturnEventData {
            result: None,
            error: None,
            execution_info: None,
        };
        assert!(neither.validate().is_err());

        let both = ReturnEventData {
            result: Some(json!(1)),
            error: Some(RemoteCallError::invalid_parameters()),
            execution_info: None,
        };
        assert!(both.validate().is_err());

        let error = ReturnEventData::with_error(RemoteCallError::invalid_parameters(), None);
        assert!(error.validate().is_ok());
        assert_eq!(error.error.as_ref().unwrap().code, -32602);
        assert_eq!(error.error.as_ref().unwrap().message, "Invalid params");
    }

    #[test]
    fn test_deadvertise_and_channel_require_content() {
        assert!(DeadvertiseEventData::new(vec![]).is_err());
        assert!(ChannelEventData::new(vec![]).is_err());
    }

    #[test]
    fn test_malformed_payload_is_invalid_payload() {
        let err = EventData::from_payload(EventKind::Advertise, b"not json").unwrap_err();
        assert!(matches!(err, CommunicationError::InvalidPayload { .. }));

        let err = EventData::from_json(EventKind::Return, json!({"result": 1, "error": {"code": -1, "message": "x"}}))
            .unwrap_err();
        assert!(matches!(err, CommunicationError::InvalidPayload { .. }));
    }

    #[test]
    fn test_call_parameter_shapes() {
        let positional = CallEventData::new(
            Some(CallParameters::ByPosition(vec![json!(42), json!(43)])),
            None,
        );
        assert_eq!(positional.positional_parameters().unwrap().len(), 2);
        assert!(positional.named_parameters().is_none());

        let named = CallEventData::new(
            Some(CallParameters::ByName(
                json!({"state": "on", "color": "green"}).as_object().unwrap().clone(),
            )),
            None,
        );
        assert!(named.named_parameters().is_some());
    }

    #[test]
    fn test_call_context_filter_gate() {
        let filter = ContextFilter::condition(FilterCondition::new(
            "floor",
            FilterOperator::Between,
            vec![json!(6), json!(8)],
        ));
        let call = CallEventData::new(None, Some(filter));

        let mut on_seven = mock_object();
        on_seven.extra.insert("floor".to_string(), json!(7));
        let mut on_ten = mock_object();
        on_ten.extra.insert("floor".to_string(), json!(10));

        assert!(call.matches_context(&on_seven));
        assert!(!call.matches_context(&on_ten));
        assert!(CallEventData::default().matches_context(&on_ten));
    }
}
