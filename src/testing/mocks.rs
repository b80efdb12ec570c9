//! Mock implementations for testing
//!
//! Provides a scriptable broker session, recording and faulty listeners, and
//! a store that is never available, so the bridge can be exercised without a
//! broker or a database file.

use crate::downlink::{EventListener, ListenerError};
use crate::protocol::{Event, QualityLevel};
use crate::store::{EventStore, StoreError, StoreResult};
use crate::transport::{BrokerSession, ConnectionState, InboundMessage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Errors reported by [`MockBroker`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MockBrokerError {
    #[error("not connected (state: {0})")]
    NotConnected(String),
    #[error("broker rejected publish: {0}")]
    Rejected(String),
    #[error("broker unreachable")]
    Unreachable,
    #[error("no downlink sender installed")]
    NoInboundSender,
}

/// One call to [`MockBroker::publish`]
#[derive(Debug, Clone)]
pub struct PublishAttempt {
    pub topic: String,
    pub payload: String,
    pub quality: QualityLevel,
    pub succeeded: bool,
    /// Tokio clock reading, so paused-clock tests can measure backoff
    pub at: Instant,
}

/// Scriptable in-process broker session
///
/// `connect` moves to `Connected` unless the broker is marked unreachable;
/// tests can also drive the state directly with [`set_state`](Self::set_state).
pub struct MockBroker {
    state_tx: watch::Sender<ConnectionState>,
    attempts: Mutex<Vec<PublishAttempt>>,
    scripted_failures: Mutex<VecDeque<String>>,
    publish_delay: Mutex<Option<Duration>>,
    hang: AtomicBool,
    unreachable: AtomicBool,
    refuse_connect: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    inbound: Mutex<Option<mpsc::Sender<InboundMessage>>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Disconnected broker that accepts connections
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state_tx,
            attempts: Mutex::new(Vec::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
            publish_delay: Mutex::new(None),
            hang: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            refuse_connect: AtomicBool::new(false),
            connect_delay: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            inbound: Mutex::new(None),
        }
    }

    /// Broker that is already connected
    pub fn connected() -> Self {
        let broker = Self::new();
        broker.set_state(ConnectionState::Connected);
        broker
    }

    /// Broker that cannot be reached; `connect` leaves it reconnecting
    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.unreachable.store(true, Ordering::SeqCst);
        broker
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make `connect` itself fail instead of retrying in the background
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Delay every `connect` call
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.connect_delay) = Some(delay);
    }

    /// Reject the next `count` publishes
    pub fn fail_next(&self, count: usize) {
        let mut failures = lock(&self.scripted_failures);
        for _ in 0..count {
            failures.push_back("PUBACK reason NotAuthorized".to_string());
        }
    }

    /// Delay every publish outcome
    pub fn set_publish_delay(&self, delay: Duration) {
        *lock(&self.publish_delay) = Some(delay);
    }

    /// Never resolve publishes, like a broker that stopped acknowledging
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Every publish call, successful or not
    pub fn attempts(&self) -> Vec<PublishAttempt> {
        lock(&self.attempts).clone()
    }

    /// Successful publishes only
    pub fn published(&self) -> Vec<PublishAttempt> {
        lock(&self.attempts)
            .iter()
            .filter(|attempt| attempt.succeeded)
            .cloned()
            .collect()
    }

    /// Highest number of publishes that were awaiting an outcome at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Deliver a downlink message as if it arrived from the broker
    pub async fn inject(&self, topic: &str, payload: &[u8]) -> Result<(), MockBrokerError> {
        let sender = lock(&self.inbound)
            .clone()
            .ok_or(MockBrokerError::NoInboundSender)?;
        sender
            .send(InboundMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            })
            .await
            .map_err(|_| MockBrokerError::NoInboundSender)
    }

    fn decide(&self) -> Result<(), MockBrokerError> {
        let state = self.state_tx.borrow().clone();
        if !matches!(state, ConnectionState::Connected) {
            return Err(MockBrokerError::NotConnected(state.as_str().to_string()));
        }
        if self.hang.load(Ordering::SeqCst) {
            return Err(MockBrokerError::Rejected("no acknowledgment".to_string()));
        }
        match lock(&self.scripted_failures).pop_front() {
            Some(reason) => Err(MockBrokerError::Rejected(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerSession for MockBroker {
    type Error = MockBrokerError;

    async fn connect(&self) -> Result<(), Self::Error> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(MockBrokerError::Unreachable);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Reconnecting(1));
        } else {
            self.set_state(ConnectionState::Connected);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        quality: QualityLevel,
    ) -> Result<(), Self::Error> {
        let outcome = self.decide();
        let hang = self.hang.load(Ordering::SeqCst);
        lock(&self.attempts).push(PublishAttempt {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
            quality,
            succeeded: outcome.is_ok(),
            at: Instant::now(),
        });

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if hang && matches!(outcome, Err(MockBrokerError::Rejected(_))) {
            std::future::pending::<()>().await;
        }
        let delay = *lock(&self.publish_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        *lock(&self.inbound) = Some(sender);
    }
}

/// Listener that keeps every event it receives
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
    delay: Option<Duration>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener that takes `delay` to accept each event
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            delay: Some(delay),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.events).len()
    }

    /// Poll until at least `count` events arrived or `timeout` passed
    pub async fn wait_for_events(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.count() >= count
    }
}

#[async_trait]
impl EventListener for RecordingListener {
    async fn on_event_received(&self, event: &Event) -> Result<(), ListenerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Error,
    Panic,
    Hang,
}

/// Listener whose every delivery faults
#[derive(Debug)]
pub struct FaultyListener {
    fault: Fault,
    attempts: AtomicUsize,
}

impl FaultyListener {
    fn with_fault(fault: Fault) -> Self {
        Self {
            fault,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Returns an error, like a listener whose host process died
    pub fn erroring() -> Self {
        Self::with_fault(Fault::Error)
    }

    /// Panics inside the delivery call
    pub fn panicking() -> Self {
        Self::with_fault(Fault::Panic)
    }

    /// Never returns, like a listener whose host stopped reading
    pub fn hanging() -> Self {
        Self::with_fault(Fault::Hang)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventListener for FaultyListener {
    async fn on_event_received(&self, _event: &Event) -> Result<(), ListenerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.fault {
            Fault::Error => Err(ListenerError::Unavailable("host process died".to_string())),
            Fault::Panic => panic!("listener crashed"),
            Fault::Hang => std::future::pending().await,
        }
    }
}

/// Store whose persistence is gone
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableStore;

impl EventStore for UnavailableStore {
    fn append(&self, _event: &Event) -> StoreResult<()> {
        Err(StoreError::Unavailable("disk detached".to_string()))
    }

    fn list_all(&self) -> StoreResult<Vec<Event>> {
        Err(StoreError::Unavailable("disk detached".to_string()))
    }

    fn remove(&self, _id: &str) -> StoreResult<()> {
        Err(StoreError::Unavailable("disk detached".to_string()))
    }

    fn len(&self) -> StoreResult<usize> {
        Err(StoreError::Unavailable("disk detached".to_string()))
    }
}
