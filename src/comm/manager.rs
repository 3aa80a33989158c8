//! Communication manager: operating-state machine and observe/publish API
//!
//! One manager owns one broker connection, one subscription registry, and
//! one correlation engine. All inbound dispatch runs on a single task in
//! broker arrival order; core data structures are only touched under the
//! manager's state lock, taken before the broker lock everywhere.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::comm::correlation::{
    CorrelationEngine, PendingRequest, PendingState, ResponseObservable,
};
use crate::comm::registry::{Dispatched, ObserverKind, SubscriptionRegistry};
use crate::config::CommunicationConfig;
use crate::controller::Controller;
use crate::error::{CommunicationError, CommunicationResult};
use crate::model::object::CoatyObject;
use crate::protocol::events::{
    AdvertiseEventData, AssociateEventData, CallEventData, ChannelEventData, CommunicationEvent,
    CompleteEventData, DeadvertiseEventData, DiscoverEventData, EventData, EventKind,
    IoValueEventData, QueryEventData, ResolveEventData, RetrieveEventData, ReturnEventData,
    UpdateEventData,
};
use crate::protocol::topic::{
    format_message_token, validate_identifier, validate_raw_publish_topic,
    validate_raw_subscription_filter, Topic, PROTOCOL_VERSION,
};
use crate::transport::{BrokerClient, LastWill, TransportEvent};

/// Queued entries past which an unbounded deferred queue starts warning
const DEFERRED_SOFT_LIMIT: usize = 1000;

/// Lifecycle state of a communication manager
///
/// Transitions form a cycle; observers receive a strictly monotone
/// subsequence of `Initial, Starting, Online, (Stopping, Offline,
/// Starting, Online)*, Stopping, Offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingState {
    Initial,
    Starting,
    Online,
    Stopping,
    Offline,
}

impl std::fmt::Display for OperatingState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            OperatingState::Initial => "Initial",
            OperatingState::Starting => "Starting",
            OperatingState::Online => "Online",
            OperatingState::Stopping => "Stopping",
            OperatingState::Offline => "Offline",
        };
        f.write_str(name)
    }
}

/// Publish held back until the broker connection is up
#[derive(Debug)]
struct DeferredPublish {
    topic: String,
    payload: Vec<u8>,
    retain: bool,
}

/// State guarded by the manager's single lock
struct CoreState {
    operating: OperatingState,
    shut_down: bool,
    correlation: CorrelationEngine,
    registry: SubscriptionRegistry,
    deferred: VecDeque<DeferredPublish>,
    deferred_warned: bool,
    dispatch_handle: Option<JoinHandle<()>>,
}

impl CoreState {
    /// Append to the deferred queue, honoring the configured bound
    fn defer(&mut self, bound: Option<usize>, publish: DeferredPublish) {
        match bound {
            Some(max) if self.deferred.len() >= max => {
                warn!(
                    "deferred publish queue full ({max} entries), dropping oldest entry"
                );
                self.deferred.pop_front();
                self.deferred.push_back(publish);
            }
            _ => {
                self.deferred.push_back(publish);
                if bound.is_none()
                    && !self.deferred_warned
                    && self.deferred.len() > DEFERRED_SOFT_LIMIT
                {
                    self.deferred_warned = true;
                    warn!(
                        "deferred publish queue exceeds {DEFERRED_SOFT_LIMIT} entries while offline"
                    );
                }
            }
        }
    }
}

pub(crate) type ManagerHandle = Arc<Inner>;

pub(crate) struct Inner {
    config: CommunicationConfig,
    identity: CoatyObject,
    state_tx: watch::Sender<OperatingState>,
    broker: Mutex<Box<dyn BrokerClient>>,
    core: Mutex<CoreState>,
    controllers: Mutex<Vec<Arc<dyn Controller>>>,
}

/// Distributed event bus endpoint of one agent
///
/// Exclusively owns its broker client, subscription registry, and
/// correlation engine. Multiple managers in one process are fully isolated.
pub struct CommunicationManager {
    inner: ManagerHandle,
}

impl CommunicationManager {
    /// Create a manager over the given broker client
    pub fn new(config: CommunicationConfig, broker: Box<dyn BrokerClient>) -> Self {
        let identity = CoatyObject::component(config.identity_name.clone());
        Self::build(config, identity, broker)
    }

    /// Create a manager with an MQTT broker client built from the config
    ///
    /// The last will registered with the broker is a Deadvertise of the
    /// manager's identity, sharing the token value of the first event.
    pub fn with_mqtt_broker(config: CommunicationConfig) -> CommunicationResult<Self> {
        let identity = CoatyObject::component(config.identity_name.clone());
        let will = Self::last_will_for(&config, &identity)?;
        let client_id = format!("coaty-{}", identity.object_id.simple());
        let broker = crate::transport::mqtt::MqttBroker::new(&config, &client_id, will)?;
        Ok(Self::build(config, identity, Box::new(broker)))
    }

    fn build(
        config: CommunicationConfig,
        identity: CoatyObject,
        broker: Box<dyn BrokerClient>,
    ) -> Self {
        let has_user = config.associated_user.is_some();
        let (state_tx, _) = watch::channel(OperatingState::Initial);
        let inner = Arc::new(Inner {
            state_tx,
            broker: Mutex::new(broker),
            core: Mutex::new(CoreState {
                operating: OperatingState::Initial,
                shut_down: false,
                correlation: CorrelationEngine::new(identity.object_id, has_user),
                registry: SubscriptionRegistry::new(),
                deferred: VecDeque::new(),
                deferred_warned: false,
                dispatch_handle: None,
            }),
            controllers: Mutex::new(Vec::new()),
            identity,
            config,
        });
        Self { inner }
    }

    fn last_will_for(
        config: &CommunicationConfig,
        identity: &CoatyObject,
    ) -> CommunicationResult<LastWill> {
        let counter_start = if config.associated_user.is_some() { 0 } else { 1 };
        let token = format_message_token(identity.object_id, counter_start);
        let topic = Topic::new(
            EventKind::Deadvertise,
            None,
            config.associated_user.as_ref().map(|u| u.object_id),
            identity.object_id,
            &token,
        )?;
        let encoded = if config.use_readable_topics {
            topic.encode_readable(
                &identity.name,
                config.associated_user.as_ref().map(|u| u.name.as_str()),
            )
        } else {
            topic.encode()
        };
        let payload = EventData::Deadvertise(DeadvertiseEventData::new(vec![
            identity.object_id,
        ])?)
        .to_payload()?;
        Ok(LastWill {
            topic: encoded,
            payload,
        })
    }

    /// The manager's own identity Component, used as sender on the wire
    pub fn identity(&self) -> &CoatyObject {
        &self.inner.identity
    }

    /// Watch the operating-state machine
    pub fn observe_operating_state(&self) -> watch::Receiver<OperatingState> {
        self.inner.state_tx.subscribe()
    }

    /// Register a controller for lifecycle notifications and advertisement
    pub async fn register_controller(&self, controller: Arc<dyn Controller>) {
        self.inner.controllers.lock().await.push(controller);
    }

    /// Start the manager: open the broker connection and go Online once the
    /// connection is acknowledged
    pub async fn start(&self) -> CommunicationResult<()> {
        let inner = &self.inner;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        {
            let mut core = inner.core.lock().await;
            if core.shut_down {
                return Err(CommunicationError::ShutDown);
            }
            match core.operating {
                OperatingState::Initial | OperatingState::Offline => {}
                state => {
                    return Err(CommunicationError::invalid_state(format!(
                        "cannot start in state {state}"
                    )))
                }
            }
            Inner::set_operating(inner, &mut core, OperatingState::Starting);
            let handle = tokio::spawn(Inner::dispatch_loop(Arc::clone(inner), event_rx));
            // A previous dispatch task ends once its event sender is replaced.
            core.dispatch_handle = Some(handle);
        }

        Inner::notify_starting(inner).await;

        let mut broker = inner.broker.lock().await;
        broker.set_event_sender(event_tx);
        if let Err(e) = broker.connect().await {
            drop(broker);
            let mut core = inner.core.lock().await;
            Inner::set_operating(inner, &mut core, OperatingState::Offline);
            return Err(e);
        }
        Ok(())
    }

    /// Stop the manager: Deadvertise, drain, unsubscribe, close
    pub async fn stop(&self) -> CommunicationResult<()> {
        Inner::stop(&self.inner).await
    }

    /// Stop and make the manager permanently unusable
    ///
    /// Outstanding observers are cancelled; further publish and observe
    /// calls fail with ShutDown.
    pub async fn shutdown(&self) -> CommunicationResult<()> {
        let inner = &self.inner;
        let running = {
            let core = inner.core.lock().await;
            matches!(
                core.operating,
                OperatingState::Starting | OperatingState::Online
            )
        };
        if running {
            let _ = Inner::stop(inner).await;
        }
        let mut core = inner.core.lock().await;
        core.shut_down = true;
        core.correlation.terminate_all();
        core.registry.clear();
        if let Some(handle) = core.dispatch_handle.take() {
            handle.abort();
        }
        Ok(())
    }

    // ---- one-way publish operations ----

    /// Advertise an object; the topic carries the object's type as filter
    pub async fn publish_advertise(&self, object: CoatyObject) -> CommunicationResult<()> {
        validate_identifier(&object.object_type)?;
        let object_type = object.object_type.clone();
        let data = EventData::Advertise(AdvertiseEventData::new(object));
        Inner::publish_event(&self.inner, EventKind::Advertise, Some(&object_type), &data)
            .await
    }

    /// Withdraw objects by identifier
    pub async fn publish_deadvertise(
        &self,
        data: DeadvertiseEventData,
    ) -> CommunicationResult<()> {
        Inner::publish_event(
            &self.inner,
            EventKind::Deadvertise,
            None,
            &EventData::Deadvertise(data),
        )
        .await
    }

    /// Broadcast objects on a named channel
    pub async fn publish_channel(
        &self,
        channel_id: &str,
        data: ChannelEventData,
    ) -> CommunicationResult<()> {
        validate_identifier(channel_id)?;
        Inner::publish_event(
            &self.inner,
            EventKind::Channel,
            Some(channel_id),
            &EventData::Channel(data),
        )
        .await
    }

    /// Associate an IO source with an IO actor
    pub async fn publish_associate(&self, data: AssociateEventData) -> CommunicationResult<()> {
        Inner::publish_event(
            &self.inner,
            EventKind::Associate,
            None,
            &EventData::Associate(data),
        )
        .await
    }

    /// Emit an IO value
    pub async fn publish_io_value(&self, value: Value) -> CommunicationResult<()> {
        Inner::publish_event(
            &self.inner,
            EventKind::IoValue,
            None,
            &EventData::IoValue(IoValueEventData { value }),
        )
        .await
    }

    /// Publish opaque bytes on an arbitrary topic, bypassing JSON
    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> CommunicationResult<()> {
        validate_raw_publish_topic(topic)?;
        let inner = &self.inner;
        let core = inner.core.lock().await;
        if core.shut_down {
            return Err(CommunicationError::ShutDown);
        }
        Inner::publish_with_core(inner, core, topic.to_string(), payload, false).await
    }

    // ---- two-way publish operations ----

    /// Discover objects; responses arrive as Resolve events
    pub async fn publish_discover(
        &self,
        data: DiscoverEventData,
    ) -> CommunicationResult<ResponseObservable> {
        data.validate()?;
        Inner::publish_request(&self.inner, EventKind::Discover, None, EventData::Discover(data))
            .await
    }

    /// Query objects; responses arrive as Retrieve events
    pub async fn publish_query(
        &self,
        data: QueryEventData,
    ) -> CommunicationResult<ResponseObservable> {
        data.validate()?;
        Inner::publish_request(&self.inner, EventKind::Query, None, EventData::Query(data)).await
    }

    /// Request an object update; acknowledgements arrive as Complete events
    pub async fn publish_update(
        &self,
        data: UpdateEventData,
    ) -> CommunicationResult<ResponseObservable> {
        data.validate()?;
        let object_type = data.object.as_ref().map(|o| o.object_type.clone());
        if let Some(object_type) = &object_type {
            validate_identifier(object_type)?;
        }
        Inner::publish_request(
            &self.inner,
            EventKind::Update,
            object_type.as_deref(),
            EventData::Update(data),
        )
        .await
    }

    /// Invoke a remote operation; results arrive as Return events
    pub async fn publish_call(
        &self,
        operation: &str,
        data: CallEventData,
    ) -> CommunicationResult<ResponseObservable> {
        validate_identifier(operation)?;
        Inner::publish_request(
            &self.inner,
            EventKind::Call,
            Some(operation),
            EventData::Call(data),
        )
        .await
    }

    // ---- correlated response operations ----

    /// Answer a Discover event
    pub async fn publish_resolve(
        &self,
        request: &CommunicationEvent,
        data: ResolveEventData,
    ) -> CommunicationResult<()> {
        data.validate()?;
        Inner::publish_response(
            &self.inner,
            request,
            EventKind::Discover,
            EventData::Resolve(data),
        )
        .await
    }

    /// Answer a Query event
    pub async fn publish_retrieve(
        &self,
        request: &CommunicationEvent,
        data: RetrieveEventData,
    ) -> CommunicationResult<()> {
        Inner::publish_response(
            &self.inner,
            request,
            EventKind::Query,
            EventData::Retrieve(data),
        )
        .await
    }

    /// Acknowledge an Update event with the authoritative post-state
    pub async fn publish_complete(
        &self,
        request: &CommunicationEvent,
        data: CompleteEventData,
    ) -> CommunicationResult<()> {
        Inner::publish_response(
            &self.inner,
            request,
            EventKind::Update,
            EventData::Complete(data),
        )
        .await
    }

    /// Answer a Call event with a result or an error
    pub async fn publish_return(
        &self,
        request: &CommunicationEvent,
        data: ReturnEventData,
    ) -> CommunicationResult<()> {
        data.validate()?;
        Inner::publish_response(&self.inner, request, EventKind::Call, EventData::Return(data))
            .await
    }

    // ---- observe operations ----

    /// Observe Advertise events for an object type
    pub async fn observe_advertise(&self, object_type: &str) -> CommunicationResult<EventStream> {
        let filter = Topic::subscription_filter(EventKind::Advertise, Some(object_type))?;
        Inner::observe(&self.inner, filter, ObserverKind::Event, None).await
    }

    /// Observe Deadvertise events
    pub async fn observe_deadvertise(&self) -> CommunicationResult<EventStream> {
        let filter = Topic::subscription_filter(EventKind::Deadvertise, None)?;
        Inner::observe(&self.inner, filter, ObserverKind::Event, None).await
    }

    /// Observe Channel events for a channel identifier
    pub async fn observe_channel(&self, channel_id: &str) -> CommunicationResult<EventStream> {
        let filter = Topic::subscription_filter(EventKind::Channel, Some(channel_id))?;
        Inner::observe(&self.inner, filter, ObserverKind::Event, None).await
    }

    /// Observe Discover events; answer with `publish_resolve`
    pub async fn observe_discover(&self) -> CommunicationResult<EventStream> {
        let filter = Topic::subscription_filter(EventKind::Discover, None)?;
        Inner::observe(&self.inner, filter, ObserverKind::Event, None).await
    }

    /// Observe Query events; answer with `publish_retrieve`
    pub async fn observe_query(&self) -> CommunicationResult<EventStream> {
        let filter = Topic::subscription_filter(EventKind::Query, None)?;
        Inner::observe(&self.inner, filter, ObserverKind::Event, None).await
    }

    /// Observe full Update events for an object type; answer with
    /// `publish_complete`
    pub async fn observe_update_with_object_type(
        &self,
        object_type: &str,
    ) -> CommunicationResult<EventStream> {
        let filter = Topic::subscription_filter(EventKind::Update, Some(object_type))?;
        Inner::observe(&self.inner, filter, ObserverKind::Event, None).await
    }

    /// Observe partial Update events; answer with `publish_complete`
    pub async fn observe_update(&self) -> CommunicationResult<EventStream> {
        let filter = Topic::subscription_filter(EventKind::Update, None)?;
        Inner::observe(&self.inner, filter, ObserverKind::Event, None).await
    }

    /// Observe Call events for an operation; answer with `publish_return`
    ///
    /// When a context object is given, calls whose context filter does not
    /// match it are silently dropped and no Return is sent.
    pub async fn observe_call(
        &self,
        operation: &str,
        context: Option<CoatyObject>,
    ) -> CommunicationResult<EventStream> {
        let filter = Topic::subscription_filter(EventKind::Call, Some(operation))?;
        Inner::observe(&self.inner, filter, ObserverKind::Event, context).await
    }

    /// Observe Associate events
    pub async fn observe_associate(&self) -> CommunicationResult<EventStream> {
        let filter = Topic::subscription_filter(EventKind::Associate, None)?;
        Inner::observe(&self.inner, filter, ObserverKind::Event, None).await
    }

    /// Observe IoValue events
    pub async fn observe_io_value(&self) -> CommunicationResult<EventStream> {
        let filter = Topic::subscription_filter(EventKind::IoValue, None)?;
        Inner::observe(&self.inner, filter, ObserverKind::Event, None).await
    }

    /// Observe raw payloads on an arbitrary topic filter (wildcards allowed)
    pub async fn observe_raw(&self, filter: &str) -> CommunicationResult<RawStream> {
        validate_raw_subscription_filter(filter)?;
        let stream =
            Inner::observe(&self.inner, filter.to_string(), ObserverKind::Raw, None).await?;
        Ok(RawStream { stream })
    }
}

impl Inner {
    fn set_operating(inner: &Inner, core: &mut CoreState, state: OperatingState) {
        debug!("operating state: {} -> {}", core.operating, state);
        core.operating = state;
        let _ = inner.state_tx.send(state);
    }

    async fn notify_starting(inner: &Arc<Inner>) {
        let controllers = inner.controllers.lock().await.clone();
        for controller in controllers {
            controller.on_communication_manager_starting().await;
        }
    }

    async fn notify_stopping(inner: &Arc<Inner>) {
        let controllers = inner.controllers.lock().await.clone();
        for controller in controllers {
            controller.on_communication_manager_stopping().await;
        }
    }

    fn encode_topic(inner: &Inner, topic: &Topic) -> String {
        if inner.config.use_readable_topics {
            topic.encode_readable(
                &inner.identity.name,
                inner
                    .config
                    .associated_user
                    .as_ref()
                    .map(|u| u.name.as_str()),
            )
        } else {
            topic.encode()
        }
    }

    fn associated_user_id(inner: &Inner) -> Option<Uuid> {
        inner.config.associated_user.as_ref().map(|u| u.object_id)
    }

    /// Build the wire topic for an outgoing event with a fresh token
    fn outgoing_topic(
        inner: &Inner,
        core: &mut CoreState,
        kind: EventKind,
        event_filter: Option<&str>,
    ) -> CommunicationResult<(String, String)> {
        let token = core.correlation.next_token();
        let topic = Topic::new(
            kind,
            event_filter,
            Self::associated_user_id(inner),
            inner.identity.object_id,
            &token,
        )?;
        Ok((Self::encode_topic(inner, &topic), token))
    }

    /// Publish now when Online, defer otherwise; consumes the core guard
    async fn publish_with_core(
        inner: &Inner,
        mut core: MutexGuard<'_, CoreState>,
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    ) -> CommunicationResult<()> {
        if core.operating == OperatingState::Online {
            let broker = inner.broker.lock().await;
            drop(core);
            broker.publish(&topic, payload, retain).await
        } else {
            core.defer(
                inner.config.max_deferred_publishes,
                DeferredPublish {
                    topic,
                    payload,
                    retain,
                },
            );
            Ok(())
        }
    }

    /// One-way event publish
    async fn publish_event(
        inner: &Arc<Inner>,
        kind: EventKind,
        event_filter: Option<&str>,
        data: &EventData,
    ) -> CommunicationResult<()> {
        let payload = data.to_payload()?;
        let mut core = inner.core.lock().await;
        if core.shut_down {
            return Err(CommunicationError::ShutDown);
        }
        let (topic, _token) = Self::outgoing_topic(inner, &mut core, kind, event_filter)?;
        Self::publish_with_core(inner, core, topic, payload, false).await
    }

    /// Two-way request: allocate token, cache the request, return the
    /// lazily-subscribed response observable
    async fn publish_request(
        inner: &Arc<Inner>,
        kind: EventKind,
        event_filter: Option<&str>,
        data: EventData,
    ) -> CommunicationResult<ResponseObservable> {
        let response_kind = kind.response_kind().ok_or_else(|| {
            CommunicationError::invalid_operation(format!(
                "{} events have no response kind",
                kind.as_str()
            ))
        })?;
        let payload = data.to_payload()?;

        let mut core = inner.core.lock().await;
        if core.shut_down {
            return Err(CommunicationError::ShutDown);
        }
        let (topic, token) = Self::outgoing_topic(inner, &mut core, kind, event_filter)?;
        let response_filter = Topic::response_filter(response_kind, &token);
        let request_event = Arc::new(CommunicationEvent {
            kind,
            event_filter: event_filter.map(str::to_owned),
            data,
            source_id: inner.identity.object_id,
            user_id: Self::associated_user_id(inner),
            message_token: token.clone(),
            event_request: None,
        });
        core.correlation.register(
            token.clone(),
            PendingRequest {
                response_kind,
                response_filter,
                request: request_event,
                request_topic: topic,
                request_payload: payload,
                state: PendingState::Created,
                observer_id: None,
            },
        )?;
        Ok(ResponseObservable {
            manager: Arc::clone(inner),
            token,
        })
    }

    /// First observer attach on a pending request: subscribe, then publish
    pub(crate) async fn subscribe_responses(
        inner: &Arc<Inner>,
        token: &str,
    ) -> CommunicationResult<EventStream> {
        let mut core = inner.core.lock().await;
        if core.shut_down {
            return Err(CommunicationError::ShutDown);
        }
        let (response_filter, request_topic, request_payload) = match core.correlation.get(token)
        {
            Some(pending) if pending.state == PendingState::Created => (
                pending.response_filter.clone(),
                pending.request_topic.clone(),
                pending.request_payload.clone(),
            ),
            _ => return Err(CommunicationError::ResubscribeForbidden),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (observer_id, needs_subscribe) =
            core.registry
                .attach(&response_filter, ObserverKind::Event, tx);
        if let Some(pending) = core.correlation.get_mut(token) {
            pending.state = PendingState::Subscribed;
            pending.observer_id = Some(observer_id);
        }

        if core.operating == OperatingState::Online {
            let broker = inner.broker.lock().await;
            drop(core);
            let wired = async {
                if needs_subscribe {
                    broker.subscribe(&response_filter).await?;
                }
                broker.publish(&request_topic, request_payload, false).await
            }
            .await;
            if let Err(e) = wired {
                drop(broker);
                let mut core = inner.core.lock().await;
                core.registry.detach(&response_filter, observer_id);
                if let Some(pending) = core.correlation.get_mut(token) {
                    pending.state = PendingState::Terminated;
                    pending.observer_id = None;
                }
                return Err(e);
            }
        } else {
            // The response filter is restored from the registry on connect,
            // before the deferred queue drains this request.
            core.defer(
                inner.config.max_deferred_publishes,
                DeferredPublish {
                    topic: request_topic,
                    payload: request_payload,
                    retain: false,
                },
            );
        }

        Ok(EventStream {
            rx,
            guard: Some(DetachGuard {
                inner: Some(Arc::clone(inner)),
                filter: response_filter,
                observer_id,
                token: Some(token.to_string()),
            }),
            call_context: None,
        })
    }

    /// Correlated response publish: pins the request's token on the topic
    async fn publish_response(
        inner: &Arc<Inner>,
        request: &CommunicationEvent,
        expected_request_kind: EventKind,
        data: EventData,
    ) -> CommunicationResult<()> {
        if request.kind != expected_request_kind {
            return Err(CommunicationError::invalid_operation(format!(
                "{} cannot answer a {} event",
                data.kind().as_str(),
                request.kind.as_str()
            )));
        }
        let payload = data.to_payload()?;
        let topic = Topic::new(
            data.kind(),
            None,
            Self::associated_user_id(inner),
            inner.identity.object_id,
            &request.message_token,
        )?;
        let core = inner.core.lock().await;
        if core.shut_down {
            return Err(CommunicationError::ShutDown);
        }
        let encoded = Self::encode_topic(inner, &topic);
        Self::publish_with_core(inner, core, encoded, payload, false).await
    }

    /// Attach an observer to a topic filter
    async fn observe(
        inner: &Arc<Inner>,
        filter: String,
        kind: ObserverKind,
        call_context: Option<CoatyObject>,
    ) -> CommunicationResult<EventStream> {
        let mut core = inner.core.lock().await;
        if core.shut_down {
            return Err(CommunicationError::ShutDown);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let (observer_id, needs_subscribe) = core.registry.attach(&filter, kind, tx);

        if needs_subscribe && core.operating == OperatingState::Online {
            let broker = inner.broker.lock().await;
            drop(core);
            if let Err(e) = broker.subscribe(&filter).await {
                drop(broker);
                let mut core = inner.core.lock().await;
                core.registry.detach(&filter, observer_id);
                return Err(e);
            }
        }
        // While not Online, the filter is restored on connect.

        Ok(EventStream {
            rx,
            guard: Some(DetachGuard {
                inner: Some(Arc::clone(inner)),
                filter,
                observer_id,
                token: None,
            }),
            call_context,
        })
    }

    /// Observer detach: the cancellation primitive
    async fn run_detach(
        inner: Arc<Inner>,
        filter: String,
        observer_id: u64,
        token: Option<String>,
    ) {
        let mut core = inner.core.lock().await;
        if let Some(token) = &token {
            if let Some(pending) = core.correlation.get_mut(token) {
                if pending.observer_id == Some(observer_id) {
                    pending.state = PendingState::Terminated;
                    pending.observer_id = None;
                }
            }
        }
        let needs_unsubscribe = core.registry.detach(&filter, observer_id);
        if needs_unsubscribe && core.operating == OperatingState::Online && !core.shut_down {
            let broker = inner.broker.lock().await;
            drop(core);
            let _ = broker.unsubscribe(&filter).await;
        }
    }

    async fn stop(inner: &Arc<Inner>) -> CommunicationResult<()> {
        {
            let mut core = inner.core.lock().await;
            if core.shut_down {
                return Err(CommunicationError::ShutDown);
            }
            match core.operating {
                OperatingState::Starting | OperatingState::Online => {}
                state => {
                    return Err(CommunicationError::invalid_state(format!(
                        "cannot stop in state {state}"
                    )))
                }
            }
            Self::set_operating(inner, &mut core, OperatingState::Stopping);
        }

        Self::notify_stopping(inner).await;
        let advertised = Self::advertised_component_ids(inner).await;

        let mut core = inner.core.lock().await;
        let (deadvertise_topic, payload) = {
            let data = EventData::Deadvertise(DeadvertiseEventData::new(advertised)?);
            let (topic, _token) =
                Self::outgoing_topic(inner, &mut core, EventKind::Deadvertise, None)?;
            (topic, data.to_payload()?)
        };
        let queued: Vec<DeferredPublish> = core.deferred.drain(..).collect();
        let filters = core.registry.active_filters();
        let mut broker = inner.broker.lock().await;
        drop(core);

        // Best effort: the broker may already be unreachable.
        let _ = broker.publish(&deadvertise_topic, payload, false).await;
        for publish in queued {
            let _ = broker
                .publish(&publish.topic, publish.payload, publish.retain)
                .await;
        }
        for filter in &filters {
            let _ = broker.unsubscribe(filter).await;
        }
        let _ = broker.disconnect().await;
        drop(broker);

        let mut core = inner.core.lock().await;
        Self::set_operating(inner, &mut core, OperatingState::Offline);
        Ok(())
    }

    /// Component ids advertised on Online, deadvertised on Stopping
    async fn advertised_component_ids(inner: &Arc<Inner>) -> Vec<Uuid> {
        let mut ids = vec![inner.identity.object_id];
        if inner.config.should_advertise_device {
            if let Some(device) = &inner.config.associated_device {
                ids.push(device.object_id);
            }
        }
        let controllers = inner.controllers.lock().await.clone();
        for controller in controllers {
            if controller.should_advertise_identity() {
                ids.push(controller.component().object_id);
            }
        }
        ids
    }

    async fn dispatch_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Connected => Self::handle_connected(&inner).await,
                TransportEvent::Disconnected(reason) => {
                    Self::handle_disconnected(&inner, &reason).await
                }
                TransportEvent::Message { topic, payload } => {
                    Self::handle_message(&inner, &topic, &payload).await
                }
            }
        }
        debug!("dispatch loop ended");
    }

    async fn handle_connected(inner: &Arc<Inner>) {
        // Reconnect path: Offline moves back through Starting, with the
        // controller notification that entails.
        {
            let mut core = inner.core.lock().await;
            match core.operating {
                _ if core.shut_down => return,
                OperatingState::Offline => {
                    Self::set_operating(inner, &mut core, OperatingState::Starting);
                    drop(core);
                    Self::notify_starting(inner).await;
                }
                OperatingState::Starting => {}
                _ => return,
            }
        }

        let controllers = inner.controllers.lock().await.clone();
        let mut core = inner.core.lock().await;
        if core.shut_down || core.operating != OperatingState::Starting {
            return;
        }

        // Prepare advertisements up front; they consume tokens.
        let mut advertisements: Vec<(String, Vec<u8>)> = Vec::new();
        let advertise = |core: &mut CoreState,
                         object: &CoatyObject|
         -> CommunicationResult<(String, Vec<u8>)> {
            let data = EventData::Advertise(AdvertiseEventData::new(object.clone()));
            let (topic, _token) = Self::outgoing_topic(
                inner,
                core,
                EventKind::Advertise,
                Some(&object.object_type),
            )?;
            Ok((topic, data.to_payload()?))
        };
        if inner.config.should_advertise_identity {
            if let Ok(entry) = advertise(&mut core, &inner.identity) {
                advertisements.push(entry);
            }
        }
        if inner.config.should_advertise_device {
            if let Some(device) = &inner.config.associated_device {
                if let Ok(entry) = advertise(&mut core, device) {
                    advertisements.push(entry);
                }
            }
        }
        for controller in &controllers {
            if controller.should_advertise_identity() {
                if let Ok(entry) = advertise(&mut core, controller.component()) {
                    advertisements.push(entry);
                }
            }
        }

        let filters = core.registry.active_filters();
        let queued: Vec<DeferredPublish> = core.deferred.drain(..).collect();
        let broker = inner.broker.lock().await;
        Self::set_operating(inner, &mut core, OperatingState::Online);
        drop(core);

        // Restore subscriptions before flushing any queued publishes.
        for filter in &filters {
            let _ = broker.subscribe(filter).await;
        }
        for publish in queued {
            let _ = broker
                .publish(&publish.topic, publish.payload, publish.retain)
                .await;
        }
        for (topic, payload) in advertisements {
            let _ = broker.publish(&topic, payload, false).await;
        }
    }

    async fn handle_disconnected(inner: &Arc<Inner>, reason: &str) {
        let mut core = inner.core.lock().await;
        if core.shut_down {
            return;
        }
        match core.operating {
            OperatingState::Online | OperatingState::Starting => {
                warn!("broker connection lost: {reason}");
                Self::set_operating(inner, &mut core, OperatingState::Offline);
            }
            _ => {}
        }
    }

    async fn handle_message(inner: &Arc<Inner>, topic: &str, payload: &[u8]) {
        let core = inner.core.lock().await;
        if core.shut_down {
            return;
        }
        let observers = core.registry.matching_observers(topic);
        if observers.is_empty() {
            return;
        }

        let event = Self::parse_inbound(inner, &core, topic, payload);
        for (kind, sender) in observers {
            match kind {
                ObserverKind::Raw => {
                    let _ = sender.send(Dispatched::Raw {
                        topic: topic.to_string(),
                        payload: payload.to_vec(),
                    });
                }
                ObserverKind::Event => {
                    if let Some(event) = &event {
                        let _ = sender.send(Dispatched::Event(event.clone()));
                    }
                }
            }
        }
    }

    /// Decode an inbound structured event; None drops it for event observers
    ///
    /// Raw observers are served regardless, so a malformed peer can never
    /// crash the agent and raw traffic is never echo-suppressed.
    fn parse_inbound(
        inner: &Inner,
        core: &CoreState,
        topic: &str,
        payload: &[u8],
    ) -> Option<CommunicationEvent> {
        let decoded = match Topic::decode(topic) {
            Ok(decoded) => decoded,
            Err(_) => return None,
        };
        if decoded.version != PROTOCOL_VERSION {
            debug!(
                "dropping topic with foreign protocol version {}",
                decoded.version
            );
            return None;
        }
        // Echo suppression for structured events.
        if decoded.source_id == inner.identity.object_id {
            return None;
        }
        let data = match EventData::from_payload(decoded.kind, payload) {
            Ok(data) => data,
            Err(e) => {
                warn!("dropping malformed inbound event on '{topic}': {e}");
                return None;
            }
        };
        let event_request = if decoded.kind.is_response_kind() {
            core.correlation
                .request_for_response(decoded.kind, &decoded.message_token)
        } else {
            None
        };
        Some(CommunicationEvent {
            kind: decoded.kind,
            event_filter: decoded.event_filter,
            data,
            source_id: decoded.source_id,
            user_id: decoded.associated_user_id,
            message_token: decoded.message_token,
            event_request,
        })
    }
}

/// Guard that detaches the observer when the stream goes away
struct DetachGuard {
    inner: Option<ManagerHandle>,
    filter: String,
    observer_id: u64,
    token: Option<String>,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let filter = std::mem::take(&mut self.filter);
            let observer_id = self.observer_id;
            let token = self.token.take();
            tokio::spawn(async move {
                Inner::run_detach(inner, filter, observer_id, token).await;
            });
        }
    }
}

/// Lazy, unbounded sequence of inbound events for one observer
///
/// Dropping the stream detaches the observer; `detach` does the same but
/// completes before returning.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Dispatched>,
    guard: Option<DetachGuard>,
    call_context: Option<CoatyObject>,
}

impl EventStream {
    /// Next event, in broker arrival order; None once detached or shut down
    pub async fn next(&mut self) -> Option<CommunicationEvent> {
        while let Some(item) = self.rx.recv().await {
            if let Dispatched::Event(event) = item {
                if let (Some(context), EventData::Call(call)) = (&self.call_context, &event.data)
                {
                    // Context mismatch: the invocation is silently dropped.
                    if !call.matches_context(context) {
                        continue;
                    }
                }
                return Some(event);
            }
        }
        None
    }

    /// Detach this observer and wait for the detachment to take effect
    pub async fn detach(mut self) {
        if let Some(mut guard) = self.guard.take() {
            if let Some(inner) = guard.inner.take() {
                let filter = std::mem::take(&mut guard.filter);
                let token = guard.token.take();
                Inner::run_detach(inner, filter, guard.observer_id, token).await;
            }
        }
    }
}

/// Lazy sequence of raw topic/payload pairs for one observer
pub struct RawStream {
    stream: EventStream,
}

impl RawStream {
    /// Next raw message, in broker arrival order
    pub async fn next(&mut self) -> Option<(String, Vec<u8>)> {
        while let Some(item) = self.stream.rx.recv().await {
            if let Dispatched::Raw { topic, payload } = item {
                return Some((topic, payload));
            }
        }
        None
    }

    /// Detach this observer and wait for the detachment to take effect
    pub async fn detach(self) {
        self.stream.detach().await;
    }
}
