//! Impure I/O operations for the MQTT session
//!
//! This module handles network communication, async coordination with the
//! rumqttc event loop, and the reconnection supervisor.

use super::acks::{AckTracker, PublishOutcome};
use super::connection::{
    configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig, TopicBuilder,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::config::MqttSection;
use crate::error::{redact_secrets, BridgeError};
use crate::identity::DeviceIdentity;
use crate::observability::metrics;
use crate::protocol::QualityLevel;
use crate::transport::{BrokerSession, InboundMessage};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, ConnectionError, Event, EventLoop};
use rumqttc::Outgoing;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the request channel between client handles and event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Upper bound on the graceful MQTT disconnect handshake
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// MQTT broker session of the bridge
pub struct MqttClient {
    identity: DeviceIdentity,
    config: MqttSection,
    reconnect_config: ReconnectConfig,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: StdMutex<Option<EventLoop>>,
    event_loop_handle: StdMutex<Option<JoinHandle<()>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: StdMutex<Option<watch::Sender<bool>>>,
    message_forwarder: Arc<StdMutex<MessageForwarder>>,
    acks: Arc<AckTracker>,
}

impl MqttClient {
    pub fn new(identity: DeviceIdentity, config: MqttSection) -> Result<Self, MqttError> {
        let reconnect_config = ReconnectConfig::from_section(&config);
        let (client, event_loop) = Self::create_connection(&identity, &config)?;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        Ok(MqttClient {
            identity,
            config,
            reconnect_config,
            client: Arc::new(Mutex::new(client)),
            event_loop: StdMutex::new(Some(event_loop)),
            event_loop_handle: StdMutex::new(None),
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx: StdMutex::new(None),
            message_forwarder: Arc::new(StdMutex::new(MessageForwarder::new())),
            acks: Arc::new(AckTracker::new()),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Helper method to create new MQTT connection and event loop
    /// Used for initial connection and reconnection attempts
    fn create_connection(
        identity: &DeviceIdentity,
        config: &MqttSection,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(identity, config)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    /// Wait until the session reports `Connected`
    pub async fn wait_for_connected(&self, timeout: Duration) -> Result<(), MqttError> {
        let mut state_rx = self.state_rx.clone();
        let waited = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| matches!(state, ConnectionState::Connected)),
        )
        .await;

        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(MqttError::ConnectionFailedStr(
                "State channel closed".to_string(),
            )),
            Err(_) => Err(MqttError::ConnectionFailedStr(format!(
                "ConnAck timeout - still {:?} after {:?}",
                self.connection_state(),
                timeout
            ))),
        }
    }

    /// Start the reconnection supervisor
    ///
    /// Returns as soon as the supervisor runs. An unreachable broker is not
    /// an error here; it shows up as `ConnectionLost`/`Reconnecting` states.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let running = lock_std(&self.event_loop_handle)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if running {
            return Err(MqttError::ConnectionFailedStr(
                "Session already started".to_string(),
            ));
        }

        // A previous stop consumed the event loop; start from a fresh one
        let stored = lock_std(&self.event_loop).take();
        let event_loop = match stored {
            Some(event_loop) => event_loop,
            None => {
                let (client, event_loop) = Self::create_connection(&self.identity, &self.config)?;
                *self.client.lock().await = client;
                event_loop
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *lock_std(&self.shutdown_tx) = Some(shutdown_tx);

        let supervisor = Supervisor {
            identity: self.identity.clone(),
            config: self.config.clone(),
            reconnect_config: self.reconnect_config.clone(),
            client: self.client.clone(),
            state_tx: self.state_tx.clone(),
            forwarder: self.message_forwarder.clone(),
            acks: self.acks.clone(),
            downlink_filter: TopicBuilder::build_downlink_filter(&self.identity),
            downlink_prefix: format!("{}/cmd/", self.identity),
            shutdown_rx,
            reconnect_attempts: 0,
        };

        supervisor.transition(ConnectionEvent::ConnectStarted);
        let span = crate::mqtt_span!(client_id = %self.identity);
        let handle = tokio::spawn(supervisor.run(event_loop).instrument(span));
        *lock_std(&self.event_loop_handle) = Some(handle);

        info!(
            client_id = %self.identity,
            broker = %redact_secrets(&self.config.broker_url),
            "MQTT session started"
        );
        Ok(())
    }

    /// Stop the supervisor and close the broker connection
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let shutdown_tx = lock_std(&self.shutdown_tx).take();
        let handle = lock_std(&self.event_loop_handle).take();

        let Some(shutdown_tx) = shutdown_tx else {
            debug!("Disconnect requested on a session that was never started");
            return Ok(());
        };

        let _ = shutdown_tx.send(true);
        info!("Sent shutdown signal to reconnection supervisor");

        if let Some(handle) = handle {
            // The supervisor performs the MQTT disconnect handshake itself
            match tokio::time::timeout(DISCONNECT_TIMEOUT * 2, handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("Event loop task ended with error: {}", e);
                }
                Err(_) => warn!("Event loop task didn't shut down in time, abandoning it"),
                _ => {}
            }
        }

        self.acks.fail_all("session stopped");
        let previous = self.state_tx.send_replace(ConnectionState::Disconnected);
        HealthMonitor::log_state_transition(&previous, &ConnectionState::Disconnected);
        metrics().mqtt_connection_lost();

        info!("MQTT client disconnected");
        Ok(())
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let current_state = self.connection_state();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    /// Publish and wait for the broker outcome
    ///
    /// QoS 0 completes once the packet is written; QoS 1 completes on PubAck.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        quality: QualityLevel,
    ) -> Result<(), MqttError> {
        self.check_connection_state()?;

        let qos = MessageHandler::determine_qos_level(quality);
        let outcome = {
            let client = self.client.lock().await;
            let outcome = self.acks.register(qos);
            if let Err(e) = client.try_publish(topic, qos, false, payload) {
                self.acks.cancel_last();
                return Err(MqttError::PublishFailed(Box::new(e)));
            }
            outcome
        };

        debug!(topic = %topic, qos = ?qos, "Publish submitted");

        match outcome.await {
            Ok(PublishOutcome::Delivered) => Ok(()),
            Ok(PublishOutcome::Rejected(reason)) => Err(MqttError::PublishRejected(reason)),
            Ok(PublishOutcome::Abandoned(reason)) => Err(MqttError::PublishAbandoned(reason)),
            Err(_) => Err(MqttError::PublishAbandoned(
                "acknowledgment tracker dropped".to_string(),
            )),
        }
    }

    /// Set the sender that receives downlink messages
    pub fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        lock_std(&self.message_forwarder).set_inbound_sender(sender);
    }
}

/// Implementation of BrokerSession trait for MqttClient
#[async_trait]
impl BrokerSession for MqttClient {
    type Error = MqttError;

    async fn connect(&self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        quality: QualityLevel,
    ) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, payload, quality).await
    }

    fn connection_state(&self) -> ConnectionState {
        MqttClient::connection_state(self)
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        MqttClient::set_inbound_sender(self, sender)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // Signal shutdown to background tasks if they're still running
        if let Some(shutdown_tx) = lock_std(&self.shutdown_tx).take() {
            let _ = shutdown_tx.send(true);
        }

        // We can't do async operations in Drop; callers should disconnect()
        if let Some(handle) = lock_std(&self.event_loop_handle).take() {
            handle.abort();
        }
    }
}

fn lock_std<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What woke the supervisor loop
enum LoopStep {
    Shutdown,
    Polled(Result<Event, ConnectionError>),
}

/// Background task owning the rumqttc event loop
struct Supervisor {
    identity: DeviceIdentity,
    config: MqttSection,
    reconnect_config: ReconnectConfig,
    client: Arc<Mutex<AsyncClient>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    forwarder: Arc<StdMutex<MessageForwarder>>,
    acks: Arc<AckTracker>,
    downlink_filter: String,
    downlink_prefix: String,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_attempts: u32,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        info!(
            "Starting MQTT event loop with reconnection supervisor for {}",
            self.identity
        );

        loop {
            let step = tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        LoopStep::Shutdown
                    } else {
                        continue;
                    }
                }

                polled = event_loop.poll() => LoopStep::Polled(polled),
            };

            match step {
                LoopStep::Shutdown => {
                    info!("Shutdown signal received, stopping reconnection supervisor");
                    self.close(&mut event_loop).await;
                    break;
                }
                LoopStep::Polled(Ok(event)) => {
                    if let Some(lost) = self.process_event(event).await {
                        if !self.handle_connection_lost(lost, &mut event_loop).await {
                            break;
                        }
                    }
                }
                LoopStep::Polled(Err(e)) => {
                    error!("MQTT event loop error for {}: {}", self.identity, e);
                    let lost = ConnectionEvent::NetworkError(redact_secrets(&e.to_string()));
                    if !self.handle_connection_lost(lost, &mut event_loop).await {
                        break;
                    }
                }
            }
        }

        info!("MQTT event loop stopped for {}", self.identity);
    }

    /// Publish a state transition to watchers
    fn transition(&self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }
    }

    /// Process one event loop event; returns the loss event when the broker
    /// dropped the connection
    async fn process_event(&mut self, event: Event) -> Option<ConnectionEvent> {
        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::ConnectionAcknowledged => {
                self.reconnect_attempts = 0;
                self.transition(ConnectionEvent::ConnAckReceived);
                metrics().mqtt_connection_established();
                self.subscribe_downlink().await;
                None
            }
            EventRoute::MessageReceived { topic, payload, .. } => {
                self.handle_message_received(topic, payload);
                None
            }
            EventRoute::PublishSent { packet_id } => {
                self.acks.on_publish_sent(packet_id);
                None
            }
            EventRoute::PublishAcknowledged {
                packet_id,
                accepted,
                reason,
            } => {
                self.acks.on_publish_acked(packet_id, accepted, &reason);
                None
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                match MessageHandler::validate_subscription_success(&return_codes) {
                    Ok(()) => info!(
                        filter = %self.downlink_filter,
                        packet_id = packet_id,
                        "Downlink subscription confirmed"
                    ),
                    Err(reason) => {
                        let fault = BridgeError::subscription_fault(reason);
                        error!(
                            filter = %self.downlink_filter,
                            error = %fault,
                            "Downlink subscription refused"
                        );
                        metrics().subscription_fault();
                    }
                }
                None
            }
            EventRoute::Disconnected => Some(ConnectionEvent::DisconnectedByBroker),
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                None
            }
            EventRoute::OutgoingEvent => None,
        }
    }

    /// Issue the downlink subscription; failures are logged, not retried
    async fn subscribe_downlink(&self) {
        let client = self.client.lock().await;
        match client.try_subscribe(self.downlink_filter.as_str(), QoS::AtLeastOnce) {
            Ok(()) => info!(filter = %self.downlink_filter, "Subscribing to downlink commands"),
            Err(e) => {
                let fault = BridgeError::subscription_fault(e.to_string());
                error!(
                    filter = %self.downlink_filter,
                    error = %fault,
                    "Failed to subscribe to downlink commands"
                );
                metrics().subscription_fault();
            }
        }
    }

    fn handle_message_received(&self, topic: String, payload: Vec<u8>) {
        debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", topic);

        if !MessageHandler::should_process_message(&topic, &self.downlink_prefix) {
            return;
        }

        if let Err(e) = lock_std(&self.forwarder).forward(InboundMessage { topic, payload }) {
            error!("Failed to forward downlink message: {}", e);
        }
    }

    /// Record the loss and run the reconnection policy
    /// Returns true to keep looping, false when shutdown interrupted it
    async fn handle_connection_lost(
        &mut self,
        lost: ConnectionEvent,
        event_loop: &mut EventLoop,
    ) -> bool {
        self.transition(lost);
        metrics().mqtt_connection_lost();
        self.acks.fail_all("connection lost");
        self.reconnect(event_loop).await
    }

    async fn reconnect(&mut self, event_loop: &mut EventLoop) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));
                metrics().mqtt_reconnect_attempt();
                info!(
                    attempt = attempt,
                    delay_ms = delay_ms,
                    "Attempting reconnection after delay"
                );

                if !interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    return false;
                }

                self.apply_new_connection(event_loop).await;
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
        }
    }

    /// Swap in a fresh client and event loop for the next attempt
    async fn apply_new_connection(&self, event_loop: &mut EventLoop) {
        match MqttClient::create_connection(&self.identity, &self.config) {
            Ok((new_client, new_event_loop)) => {
                *event_loop = new_event_loop;
                *self.client.lock().await = new_client;
                // Requests left in the old channel will never be written
                self.acks.fail_all("session replaced");
                debug!("Created new connection for reconnection attempt");
            }
            Err(e) => {
                // The old event loop errors again and the next attempt retries
                error!("Failed to create new connection: {}", e);
            }
        }
    }

    /// MQTT disconnect handshake, bounded by [`DISCONNECT_TIMEOUT`]
    async fn close(&self, event_loop: &mut EventLoop) {
        if !HealthMonitor::can_publish(&self.state_tx.borrow()) {
            return;
        }

        let handshake = async {
            self.client
                .lock()
                .await
                .disconnect()
                .await
                .map_err(|e| e.to_string())?;
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(e.to_string()),
                }
            }
        };

        match tokio::time::timeout(DISCONNECT_TIMEOUT, handshake).await {
            Ok(Ok(())) => debug!("Sent MQTT disconnect"),
            Ok(Err(e)) => warn!("MQTT disconnect failed: {}", e),
            Err(_) => warn!("MQTT disconnect timed out"),
        }
    }
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}
