//! MQTT broker client built on rumqttc
//!
//! Owns the rumqttc event loop on a supervisor task, forwards inbound
//! packets as `TransportEvent`s, and keeps retrying a lost connection with a
//! short backoff pattern. The last will registered at connect time is the
//! manager's own Deadvertise, so an unclean disappearance is still visible
//! to peers.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{LastWill as MqttLastWill, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CommunicationConfig;
use crate::error::{CommunicationError, CommunicationResult};
use crate::transport::{BrokerClient, LastWill, TransportEvent};

/// Delay pattern between reconnection attempts, sustained at the last entry
const RECONNECT_BACKOFF_MS: [u64; 4] = [250, 500, 1000, 2500];

/// MQTT implementation of the broker client contract
pub struct MqttBroker {
    config: CommunicationConfig,
    client_id: String,
    last_will: LastWill,
    client: AsyncClient,
    event_loop: StdMutex<Option<EventLoop>>,
    event_sender: Option<mpsc::UnboundedSender<TransportEvent>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    loop_handle: Option<JoinHandle<()>>,
}

impl MqttBroker {
    /// Create a client for the configured broker with the given last will
    pub fn new(
        config: &CommunicationConfig,
        client_id: &str,
        last_will: LastWill,
    ) -> CommunicationResult<Self> {
        let options = configure_options(config, client_id, last_will.clone())?;
        let (client, event_loop) = AsyncClient::new(options, 10);
        Ok(Self {
            config: config.clone(),
            client_id: client_id.to_string(),
            last_will,
            client,
            event_loop: StdMutex::new(Some(event_loop)),
            event_sender: None,
            shutdown_tx: None,
            loop_handle: None,
        })
    }
}

/// Build rumqttc options from the communication configuration
fn configure_options(
    config: &CommunicationConfig,
    client_id: &str,
    last_will: LastWill,
) -> CommunicationResult<MqttOptions> {
    let url = Url::parse(&config.broker_url).map_err(|_| {
        CommunicationError::broker_msg(format!("invalid broker URL '{}'", config.broker_url))
    })?;
    let host = url.host_str().ok_or_else(|| {
        CommunicationError::broker_msg(format!("broker URL '{}' has no host", config.broker_url))
    })?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    let mut options = MqttOptions::new(client_id, host, port);
    if url.scheme() == "mqtts" {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }
    if let Some(username) = config.broker_username() {
        options.set_credentials(username, config.broker_password().unwrap_or_default());
    }
    options.set_keep_alive(Duration::from_secs(60));
    options.set_last_will(MqttLastWill::new(
        last_will.topic,
        last_will.payload,
        QoS::AtLeastOnce,
        false,
        None,
    ));
    Ok(options)
}

/// Sleep that aborts early on the shutdown signal; false means shut down
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

fn backoff_delay(attempt: u32) -> u64 {
    let index = (attempt.saturating_sub(1)) as usize;
    RECONNECT_BACKOFF_MS[index.min(RECONNECT_BACKOFF_MS.len() - 1)]
}

#[async_trait]
impl BrokerClient for MqttBroker {
    fn set_event_sender(&mut self, sender: mpsc::UnboundedSender<TransportEvent>) {
        self.event_sender = Some(sender);
    }

    async fn connect(&mut self) -> CommunicationResult<()> {
        if self.loop_handle.is_some() {
            return Ok(());
        }
        // A restart after disconnect() needs a fresh client and event loop.
        if self.event_loop.lock().unwrap().is_none() {
            let options =
                configure_options(&self.config, &self.client_id, self.last_will.clone())?;
            let (client, event_loop) = AsyncClient::new(options, 10);
            self.client = client;
            *self.event_loop.lock().unwrap() = Some(event_loop);
        }
        let mut event_loop = self
            .event_loop
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| CommunicationError::broker_msg("event loop already consumed"))?;
        let sender = self
            .event_sender
            .clone()
            .ok_or_else(|| CommunicationError::broker_msg("no event sender configured"))?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let handle = tokio::spawn(async move {
            let mut reconnect_attempts = 0u32;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("shutdown signal received, stopping broker event loop");
                            break;
                        }
                    }
                    polled = event_loop.poll() => match polled {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("broker connection acknowledged");
                            reconnect_attempts = 0;
                            let _ = sender.send(TransportEvent::Connected);
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                            let _ = sender.send(TransportEvent::Message {
                                topic,
                                payload: publish.payload.to_vec(),
                            });
                        }
                        Ok(Event::Incoming(Packet::Disconnect(_))) => {
                            warn!("disconnected by broker");
                            let _ = sender.send(TransportEvent::Disconnected(
                                "disconnected by broker".to_string(),
                            ));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            reconnect_attempts += 1;
                            let delay = backoff_delay(reconnect_attempts);
                            warn!(
                                "broker connection error (attempt {}): {}; retrying in {}ms",
                                reconnect_attempts, e, delay
                            );
                            let _ = sender.send(TransportEvent::Disconnected(e.to_string()));
                            if !interruptible_sleep(&mut shutdown_rx, delay).await {
                                break;
                            }
                        }
                    }
                }
            }
            debug!("broker event loop stopped");
        });
        self.loop_handle = Some(handle);
        Ok(())
    }

    async fn disconnect(&mut self) -> CommunicationResult<()> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        // Best effort; the broker may already be gone.
        let _ = self.client.disconnect().await;

        if let Some(handle) = self.loop_handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("broker event loop shut down cleanly"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("broker event loop ended with: {e}"),
                Err(_) => warn!("broker event loop did not stop in time"),
                _ => {}
            }
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> CommunicationResult<()> {
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(CommunicationError::broker)
    }

    async fn unsubscribe(&self, filter: &str) -> CommunicationResult<()> {
        self.client
            .unsubscribe(filter)
            .await
            .map_err(CommunicationError::broker)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> CommunicationResult<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(CommunicationError::broker)
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.loop_handle.take() {
            handle.abort();
        }
    }
}
