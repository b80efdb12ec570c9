//! Bridge controller: the ingress/egress surface of the agent
//!
//! [`BridgeController`] owns the event store, the broker session, the
//! delivery pipeline and the downlink dispatcher, and exposes the operations
//! local collaborators use: publish an event, register or unregister a
//! command listener, and the start/stop lifecycle.

use crate::config::{BridgeConfig, DeliverySection};
use crate::delivery::{DeliveryPipeline, DrainState};
use crate::downlink::{Dispatcher, EventListener, ListenerHandle};
use crate::error::{BridgeError, BridgeResult};
use crate::identity::DeviceIdentity;
use crate::observability::{metrics, MetricsSnapshot};
use crate::protocol::Event;
use crate::store::{EventStore, SqliteEventStore};
use crate::transport::{BrokerSession, ConnectionState, InboundMessage, MqttSession};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the channel between the broker session and the dispatcher
const INBOUND_BUFFER: usize = 100;

/// Lifecycle phase of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgePhase {
    Created,
    /// A `start` call holds the lifecycle while the session connects
    Starting,
    Running,
    Stopped,
}

impl BridgePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgePhase::Created => "created",
            BridgePhase::Starting => "starting",
            BridgePhase::Running => "running",
            BridgePhase::Stopped => "stopped",
        }
    }
}

/// Point-in-time view of the bridge
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub device: String,
    pub phase: BridgePhase,
    pub connection: String,
    /// Queued events; `None` when the store cannot be read
    pub backlog: Option<usize>,
    pub drain: DrainState,
    pub listeners: usize,
    pub metrics: MetricsSnapshot,
}

struct Runtime {
    phase: BridgePhase,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// Composes store, session, pipeline and dispatcher
pub struct BridgeController<B: BrokerSession> {
    identity: DeviceIdentity,
    store: Arc<dyn EventStore>,
    session: Arc<B>,
    pipeline: Arc<DeliveryPipeline<B>>,
    dispatcher: Arc<Dispatcher>,
    runtime: Mutex<Runtime>,
}

impl BridgeController<MqttSession> {
    /// Build a bridge from configuration: resolve the device identity, open
    /// the store and prepare (but not start) the MQTT session
    pub fn from_config(config: &BridgeConfig) -> BridgeResult<Self> {
        let identity = DeviceIdentity::resolve(&config.device)?;
        let store = SqliteEventStore::open(&config.store.path)?;
        let session = MqttSession::new(identity.clone(), config.mqtt.clone())
            .map_err(BridgeError::connection_fault)?;

        info!(
            device = %identity,
            store = %config.store.path.display(),
            backlog = store.len().unwrap_or(0),
            "Bridge assembled"
        );
        Ok(Self::new(
            Arc::new(store),
            Arc::new(session),
            identity,
            config.delivery.clone(),
        ))
    }
}

impl<B: BrokerSession> BridgeController<B> {
    pub fn new(
        store: Arc<dyn EventStore>,
        session: Arc<B>,
        identity: DeviceIdentity,
        timing: DeliverySection,
    ) -> Self {
        let pipeline = Arc::new(DeliveryPipeline::new(
            store.clone(),
            session.clone(),
            identity.clone(),
            timing,
        ));
        metrics().set_bridge_state(BridgePhase::Created.as_str());

        Self {
            identity,
            store,
            session,
            pipeline,
            dispatcher: Arc::new(Dispatcher::new()),
            runtime: Mutex::new(Runtime {
                phase: BridgePhase::Created,
                tasks: Vec::new(),
            }),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn session(&self) -> &Arc<B> {
        &self.session
    }

    pub fn pipeline(&self) -> &Arc<DeliveryPipeline<B>> {
        &self.pipeline
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn phase(&self) -> BridgePhase {
        self.runtime().phase
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an event for delivery
    ///
    /// Returns once the event is durably stored, never waiting for the
    /// broker. Only a malformed event, a duplicate id or an unusable store
    /// fail the call.
    pub fn publish(&self, event: Event) -> BridgeResult<()> {
        if let Err(e) = event.validate() {
            metrics().event_rejected();
            warn!(event_id = %event.id, error = %e, "Rejected malformed event");
            return Err(e.into());
        }

        if let Err(e) = self.store.append(&event) {
            let err = BridgeError::from(e);
            if err.is_rejection() {
                metrics().event_rejected();
                warn!(event_id = %event.id, error = %err, "Rejected event");
            } else {
                metrics().storage_fault();
                error!(event_id = %event.id, error = %err, "Failed to queue event");
            }
            return Err(err);
        }

        metrics().event_enqueued();
        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            priority = event.priority,
            "Event queued"
        );

        if self.phase() == BridgePhase::Running {
            self.pipeline.request_drain();
        }
        Ok(())
    }

    /// Register a command listener; the caller keeps ownership of it
    pub fn register_listener(&self, listener: Arc<dyn EventListener>) -> ListenerHandle {
        self.dispatcher.register(listener)
    }

    pub fn unregister_listener(&self, handle: ListenerHandle) -> bool {
        self.dispatcher.unregister(handle)
    }

    /// Start the session, the downlink relay and the delivery of any backlog
    ///
    /// The broker does not have to be reachable: the session keeps
    /// reconnecting in the background and the backlog is drained once it
    /// connects.
    ///
    /// Only the first of several concurrent calls does the work; the others
    /// return immediately.
    pub async fn start(&self) -> BridgeResult<()> {
        {
            let mut runtime = self.runtime();
            match runtime.phase {
                BridgePhase::Created => runtime.phase = BridgePhase::Starting,
                BridgePhase::Starting | BridgePhase::Running => {
                    warn!(phase = runtime.phase.as_str(), "Bridge already started");
                    return Ok(());
                }
                BridgePhase::Stopped => {
                    return Err(BridgeError::InvalidState(
                        "bridge cannot be restarted after stop".to_string(),
                    ));
                }
            }
        }
        metrics().set_bridge_state(BridgePhase::Starting.as_str());

        let span = crate::lifecycle_span!(phase = "start", device = %self.identity);
        async {
            info!("Starting bridge");

            let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
            self.session.set_inbound_sender(inbound_tx);

            let relay = Self::spawn_downlink_relay(self.dispatcher.clone(), inbound_rx);
            let watcher = Self::spawn_connection_watcher(&self.session, self.pipeline.clone());

            if let Err(e) = self.session.connect().await {
                let fault = BridgeError::connection_fault(e);
                error!(error = %fault, "Failed to start broker session");
                relay.abort();
                watcher.abort();
                self.runtime().phase = BridgePhase::Created;
                metrics().set_bridge_state(BridgePhase::Created.as_str());
                return Err(fault);
            }

            {
                let mut runtime = self.runtime();
                runtime.phase = BridgePhase::Running;
                runtime.tasks.push(("downlink relay", relay));
                runtime.tasks.push(("connection watcher", watcher));
            }
            metrics().set_bridge_state(BridgePhase::Running.as_str());

            // Backlog left over from a previous run
            self.pipeline.request_drain();
            info!(state = %self.session.connection_state(), "Bridge started");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Stop the bridge
    ///
    /// Disconnects from the broker, cancels the drain and clears the listener
    /// registry. Events not yet acknowledged stay queued for the next run.
    pub async fn stop(&self) -> BridgeResult<()> {
        let tasks = {
            let mut runtime = self.runtime();
            if runtime.phase != BridgePhase::Running {
                debug!(phase = runtime.phase.as_str(), "Stop ignored, bridge not running");
                return Ok(());
            }
            runtime.phase = BridgePhase::Stopped;
            std::mem::take(&mut runtime.tasks)
        };

        let span = crate::lifecycle_span!(phase = "stop", device = %self.identity);
        async {
            info!("Stopping bridge");

            if let Err(e) = self.session.disconnect().await {
                let fault = BridgeError::connection_fault(e);
                warn!(error = %fault, "Broker disconnect failed");
            }

            self.pipeline.shutdown().await;
            self.dispatcher.clear();

            for (name, handle) in tasks {
                handle.abort();
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        error!(task = name, error = %e, "Bridge task ended abnormally");
                    }
                }
            }

            metrics().set_bridge_state(BridgePhase::Stopped.as_str());
            info!(
                backlog = self.store.len().unwrap_or(0),
                "Bridge stopped"
            );
        }
        .instrument(span)
        .await;
        Ok(())
    }

    /// Snapshot of connection, backlog, drain and listener state
    pub fn status(&self) -> BridgeStatus {
        let backlog = match self.store.len() {
            Ok(len) => Some(len),
            Err(e) => {
                warn!(error = %e, "Backlog length unavailable");
                None
            }
        };

        BridgeStatus {
            device: self.identity.to_string(),
            phase: self.phase(),
            connection: self.session.connection_state().as_str().to_string(),
            backlog,
            drain: self.pipeline.state(),
            listeners: self.dispatcher.len(),
            metrics: metrics().get_metrics(),
        }
    }

    fn spawn_downlink_relay(
        dispatcher: Arc<Dispatcher>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { dispatcher.relay(inbound_rx).await })
    }

    /// Drain whenever the session (re)enters `Connected`
    fn spawn_connection_watcher(
        session: &Arc<B>,
        pipeline: Arc<DeliveryPipeline<B>>,
    ) -> JoinHandle<()> {
        let mut state_rx = session.subscribe_state();
        tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = state_rx.borrow_and_update().clone();
                debug!(state = %state, "Session state changed");
                if matches!(state, ConnectionState::Connected) {
                    info!("Broker connected, draining backlog");
                    pipeline.request_drain();
                }
            }
        })
    }
}
