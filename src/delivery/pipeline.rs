//! Single-worker drain loop
//!
//! [`DeliveryPipeline::request_drain`] starts the worker through a
//! compare-and-set on the `draining` flag. Requests that arrive while a worker
//! is running only raise the `pending` flag; the worker checks it before it
//! goes idle, so no request is lost between its last backlog read and its
//! exit.

use crate::config::DeliverySection;
use crate::error::BridgeError;
use crate::identity::DeviceIdentity;
use crate::observability::metrics;
use crate::protocol::{Event, QualityLevel};
use crate::store::{EventStore, StoreError, StoreResult};
use crate::transport::mqtt::TopicBuilder;
use crate::transport::BrokerSession;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Upper bound on waiting for the worker to notice a shutdown
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Drain worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainState {
    Idle,
    Draining,
}

/// Topic and quality level an event is published with
pub fn outbound_route(identity: &DeviceIdentity, event: &Event) -> (String, QualityLevel) {
    (
        TopicBuilder::build_uplink_topic(identity, &event.event_type),
        event.quality_level(),
    )
}

/// How one publish attempt ended
enum Attempt {
    Delivered,
    Failed,
    Cancelled,
}

/// How one pass over the backlog ended
enum Cycle {
    /// Every event of the snapshot was delivered
    Completed(usize),
    /// The backlog was empty
    Empty,
    /// A publish or the backlog read failed; back off before the next cycle
    Failed,
    Cancelled,
}

/// Delivers the backlog of an [`EventStore`] through a [`BrokerSession`]
pub struct DeliveryPipeline<B: BrokerSession> {
    store: Arc<dyn EventStore>,
    session: Arc<B>,
    identity: DeviceIdentity,
    timing: DeliverySection,
    draining: AtomicBool,
    pending: AtomicBool,
    cycles: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<B: BrokerSession> DeliveryPipeline<B> {
    pub fn new(
        store: Arc<dyn EventStore>,
        session: Arc<B>,
        identity: DeviceIdentity,
        timing: DeliverySection,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            session,
            identity,
            timing,
            draining: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            shutdown_tx,
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DrainState {
        if self.is_draining() {
            DrainState::Draining
        } else {
            DrainState::Idle
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Number of drain cycles run since construction
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Ask for the backlog to be drained
    ///
    /// Returns `true` when this call started the worker. While a worker is
    /// running the request is folded into it, and after
    /// [`shutdown`](Self::shutdown) requests are ignored.
    pub fn request_drain(self: &Arc<Self>) -> bool {
        if *self.shutdown_tx.borrow() {
            debug!("Drain requested after shutdown, ignoring");
            return false;
        }

        self.pending.store(true, Ordering::SeqCst);
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain already running, request folded into it");
            return false;
        }

        metrics().drain_started();
        let pipeline = Arc::clone(self);
        let span = crate::drain_span!(device = %self.identity);
        let handle = tokio::spawn(async move { pipeline.run_worker().await }.instrument(span));

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        true
    }

    /// Cancel the drain cooperatively
    ///
    /// An in-flight publish is abandoned; its event stays queued and is
    /// retried after the next start.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(WORKER_STOP_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!("Drain worker stopped"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => error!(error = %e, "Drain worker ended abnormally"),
                Err(_) => {
                    warn!("Drain worker did not stop in time, aborting it");
                    handle.abort();
                }
            }
        }
        self.draining.store(false, Ordering::SeqCst);
        info!("Delivery pipeline stopped");
    }

    async fn run_worker(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut idle_checked = false;
        info!("Drain started");

        loop {
            self.pending.store(false, Ordering::SeqCst);
            let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;

            match self
                .drain_cycle(&mut shutdown_rx)
                .instrument(crate::drain_span!(cycle = cycle))
                .await
            {
                Cycle::Completed(delivered) => {
                    debug!(cycle, delivered, "Drain cycle completed");
                    idle_checked = false;
                }
                Cycle::Empty if !idle_checked => {
                    idle_checked = true;
                    if !self.pause(&mut shutdown_rx, self.timing.idle_interval()).await {
                        break;
                    }
                }
                Cycle::Empty => {
                    idle_checked = false;
                    if self.try_go_idle() {
                        info!("Backlog empty, drain idle");
                        return;
                    }
                    debug!("Drain requested while going idle, continuing");
                }
                Cycle::Failed => {
                    idle_checked = false;
                    if !self.pause(&mut shutdown_rx, self.timing.retry_backoff()).await {
                        break;
                    }
                }
                Cycle::Cancelled => break,
            }
        }

        self.draining.store(false, Ordering::SeqCst);
        info!("Drain cancelled by shutdown");
    }

    /// Release the drain guard unless a request slipped in meanwhile
    ///
    /// Returns `true` when the worker should exit.
    fn try_go_idle(&self) -> bool {
        if self.pending.load(Ordering::SeqCst) {
            return false;
        }
        self.draining.store(false, Ordering::SeqCst);

        // A request that saw `draining == true` just before the store above
        // only left `pending` behind; take the guard back for it.
        !(self.pending.load(Ordering::SeqCst)
            && !*self.shutdown_tx.borrow()
            && self
                .draining
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok())
    }

    async fn drain_cycle(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Cycle {
        if *shutdown_rx.borrow() {
            return Cycle::Cancelled;
        }

        let backlog = match self.read_backlog().await {
            Ok(backlog) => backlog,
            Err(e) => {
                metrics().storage_fault();
                let fault = BridgeError::from(e);
                error!(error = %fault, "Failed to read backlog");
                return Cycle::Failed;
            }
        };

        if backlog.is_empty() {
            return Cycle::Empty;
        }

        debug!(backlog = backlog.len(), "Draining backlog");
        let mut delivered = 0;
        for event in &backlog {
            match self.deliver(event, shutdown_rx).await {
                Attempt::Delivered => delivered += 1,
                Attempt::Failed => return Cycle::Failed,
                Attempt::Cancelled => return Cycle::Cancelled,
            }
        }
        Cycle::Completed(delivered)
    }

    async fn deliver(&self, event: &Event, shutdown_rx: &mut watch::Receiver<bool>) -> Attempt {
        let (topic, quality) = outbound_route(&self.identity, event);
        let ack_timeout = self.timing.ack_timeout();
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|stop| *stop) => return Attempt::Cancelled,
            outcome = tokio::time::timeout(
                ack_timeout,
                self.session.publish(&topic, event.payload.clone().into_bytes(), quality),
            ) => outcome,
        };

        let fault = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(BridgeError::publish_fault(&event.id, e)),
            Err(_) => Some(BridgeError::publish_fault(
                &event.id,
                format!("no acknowledgment within {}s", ack_timeout.as_secs()),
            )),
        };

        if let Some(fault) = fault {
            metrics().publish_failed();
            warn!(
                event_id = %event.id,
                topic = %topic,
                qos = %quality,
                error = %fault,
                "Publish failed, pausing delivery"
            );
            return Attempt::Failed;
        }

        metrics().event_delivered(started.elapsed());
        debug!(event_id = %event.id, topic = %topic, qos = %quality, "Event delivered");

        if let Err(e) = self.remove_delivered(&event.id).await {
            // Stays queued and is published again on a later cycle
            metrics().storage_fault();
            let fault = BridgeError::from(e);
            error!(
                event_id = %event.id,
                error = %fault,
                "Failed to remove delivered event"
            );
        }
        Attempt::Delivered
    }

    /// SQLite calls block, so they run on the blocking pool
    async fn read_backlog(&self) -> StoreResult<Vec<Event>> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.list_all())
            .await
            .map_err(|e| StoreError::Unavailable(format!("backlog read task failed: {e}")))?
    }

    async fn remove_delivered(&self, id: &str) -> StoreResult<()> {
        let store = Arc::clone(&self.store);
        let id = id.to_string();
        tokio::task::spawn_blocking(move || store.remove(&id))
            .await
            .map_err(|e| StoreError::Unavailable(format!("removal task failed: {e}")))?
    }

    /// Sleep unless shutdown is requested first; returns `false` on shutdown
    async fn pause(&self, shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|stop| *stop) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteEventStore;
    use crate::testing::{MockBroker, UnavailableStore};
    use crate::transport::ConnectionState;
    use proptest::prelude::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("pump-fleet", "unit-1").unwrap()
    }

    fn fast_timing() -> DeliverySection {
        DeliverySection {
            idle_interval_ms: 10,
            retry_backoff_ms: 20,
            ack_timeout_secs: 1,
            ..DeliverySection::default()
        }
    }

    fn event(id: &str, event_type: &str, priority: i32, timestamp: i64) -> Event {
        Event::new("urn:local:scale", event_type, format!(r#"{{"id":"{id}"}}"#))
            .with_id(id)
            .with_priority(priority)
            .with_timestamp(timestamp)
    }

    fn pipeline_with(
        store: Arc<dyn EventStore>,
        broker: Arc<MockBroker>,
        timing: DeliverySection,
    ) -> Arc<DeliveryPipeline<MockBroker>> {
        Arc::new(DeliveryPipeline::new(store, broker, identity(), timing))
    }

    async fn wait_idle(pipeline: &DeliveryPipeline<MockBroker>) {
        for _ in 0..3000 {
            if !pipeline.is_draining() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("drain did not go idle");
    }

    #[test]
    fn test_outbound_route() {
        let (topic, quality) = outbound_route(&identity(), &event("e1", "weight", 0, 1));
        assert_eq!(topic, "pump-fleet/unit-1/weight");
        assert_eq!(quality, QualityLevel::BestEffort);

        let (topic, quality) = outbound_route(&identity(), &event("e2", "alarms/occlusion", 2, 1));
        assert_eq!(topic, "pump-fleet/unit-1/alarms/occlusion");
        assert_eq!(quality, QualityLevel::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_drains_backlog_in_timestamp_order() {
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        store.append(&event("late", "weight", 1, 300)).unwrap();
        store.append(&event("early", "weight", 0, 100)).unwrap();
        store.append(&event("middle", "temperature", 99, 200)).unwrap();

        let broker = Arc::new(MockBroker::connected());
        let pipeline = pipeline_with(store.clone(), broker.clone(), fast_timing());

        assert!(pipeline.request_drain());
        wait_idle(&pipeline).await;

        let published = broker.published();
        let ids: Vec<&str> = published.iter().map(|p| p.payload.as_str()).collect();
        assert_eq!(
            ids,
            vec![r#"{"id":"early"}"#, r#"{"id":"middle"}"#, r#"{"id":"late"}"#]
        );
        assert_eq!(published[0].quality, QualityLevel::BestEffort);
        assert_eq!(published[1].quality, QualityLevel::BestEffort);
        assert_eq!(published[1].topic, "pump-fleet/unit-1/temperature");
        assert_eq!(published[2].quality, QualityLevel::AtLeastOnce);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_failed_event_stays_queued_and_stops_cycle() {
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        store.append(&event("e1", "weight", 1, 1)).unwrap();
        store.append(&event("e2", "weight", 1, 2)).unwrap();

        let broker = Arc::new(MockBroker::connected());
        broker.fail_next(1);
        let timing = DeliverySection {
            retry_backoff_ms: 60_000,
            ..fast_timing()
        };
        let pipeline = pipeline_with(store.clone(), broker.clone(), timing);

        pipeline.request_drain();
        for _ in 0..100 {
            if broker.attempts().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Only the head was tried; e2 was not attempted after the failure
        assert_eq!(broker.attempts().len(), 1);
        let backlog: Vec<String> = store.list_all().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(backlog, vec!["e1", "e2"]);
        assert!(pipeline.is_draining());

        pipeline.shutdown().await;
        assert!(!pipeline.is_draining());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_backoff() {
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        store.append(&event("e1", "dose", 1, 1)).unwrap();
        store.append(&event("e2", "dose", 1, 2)).unwrap();

        let broker = Arc::new(MockBroker::connected());
        broker.fail_next(1);
        let pipeline = pipeline_with(store.clone(), broker.clone(), DeliverySection::default());

        pipeline.request_drain();
        wait_idle(&pipeline).await;

        let attempts = broker.attempts();
        let order: Vec<&str> = attempts.iter().map(|a| a.payload.as_str()).collect();
        assert_eq!(
            order,
            vec![r#"{"id":"e1"}"#, r#"{"id":"e1"}"#, r#"{"id":"e2"}"#]
        );
        assert!(!attempts[0].succeeded);
        assert!(attempts[1].at - attempts[0].at >= Duration::from_secs(5));
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_requests_run_single_worker() {
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        for i in 0..5 {
            store.append(&event(&format!("e{i}"), "weight", 1, i)).unwrap();
        }

        let broker = Arc::new(MockBroker::connected());
        broker.set_publish_delay(Duration::from_millis(10));
        let pipeline = pipeline_with(store.clone(), broker.clone(), fast_timing());

        let started: usize = (0..20)
            .map(|_| pipeline.request_drain())
            .filter(|started| *started)
            .count();
        assert_eq!(started, 1);

        wait_idle(&pipeline).await;
        assert_eq!(broker.max_in_flight(), 1);
        assert_eq!(broker.published().len(), 5);
    }

    #[tokio::test]
    async fn test_event_appended_during_drain_is_delivered() {
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        store.append(&event("e1", "weight", 0, 1)).unwrap();

        let broker = Arc::new(MockBroker::connected());
        broker.set_publish_delay(Duration::from_millis(20));
        let pipeline = pipeline_with(store.clone(), broker.clone(), fast_timing());

        pipeline.request_drain();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.append(&event("e2", "weight", 0, 2)).unwrap();
        assert!(!pipeline.request_drain());

        wait_idle(&pipeline).await;
        assert_eq!(broker.published().len(), 2);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_storage_fault_backs_off_without_publishing() {
        let broker = Arc::new(MockBroker::connected());
        let pipeline = pipeline_with(Arc::new(UnavailableStore), broker.clone(), fast_timing());

        pipeline.request_drain();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(pipeline.is_draining());
        assert!(pipeline.cycles() >= 2);
        assert!(broker.attempts().is_empty());

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_not_connected_keeps_events_queued() {
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        store.append(&event("e1", "weight", 0, 1)).unwrap();

        let broker = Arc::new(MockBroker::new());
        let pipeline = pipeline_with(store.clone(), broker.clone(), fast_timing());

        pipeline.request_drain();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.published().is_empty());
        assert_eq!(store.len().unwrap(), 1);

        broker.set_state(ConnectionState::Connected);
        wait_idle(&pipeline).await;
        assert_eq!(broker.published().len(), 1);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_ack_timeout_is_a_failure() {
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        store.append(&event("e1", "weight", 1, 1)).unwrap();

        let broker = Arc::new(MockBroker::connected());
        broker.set_hang(true);
        let timing = DeliverySection {
            ack_timeout_secs: 1,
            retry_backoff_ms: 60_000,
            ..fast_timing()
        };
        let pipeline = pipeline_with(store.clone(), broker.clone(), timing);

        tokio::time::pause();
        pipeline.request_drain();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(broker.attempts().len(), 1);
        assert!(!broker.attempts()[0].succeeded);
        assert_eq!(store.len().unwrap(), 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_abandons_in_flight_publish() {
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        store.append(&event("e1", "weight", 1, 1)).unwrap();

        let broker = Arc::new(MockBroker::connected());
        broker.set_hang(true);
        let pipeline = pipeline_with(store.clone(), broker.clone(), DeliverySection::default());

        pipeline.request_drain();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pipeline.shutdown().await;

        assert!(!pipeline.is_draining());
        assert_eq!(store.len().unwrap(), 1);
        assert!(!pipeline.request_drain());
    }

    /// Store whose backlog reads hold the calling thread
    struct SlowStore {
        inner: SqliteEventStore,
        read_delay: Duration,
    }

    impl EventStore for SlowStore {
        fn append(&self, event: &Event) -> StoreResult<()> {
            self.inner.append(event)
        }

        fn list_all(&self) -> StoreResult<Vec<Event>> {
            std::thread::sleep(self.read_delay);
            self.inner.list_all()
        }

        fn remove(&self, id: &str) -> StoreResult<()> {
            self.inner.remove(id)
        }

        fn len(&self) -> StoreResult<usize> {
            self.inner.len()
        }
    }

    #[tokio::test]
    async fn test_slow_store_does_not_block_runtime() {
        let store = Arc::new(SlowStore {
            inner: SqliteEventStore::open_in_memory().unwrap(),
            read_delay: Duration::from_millis(200),
        });
        store.append(&event("e1", "weight", 0, 1)).unwrap();

        let broker = Arc::new(MockBroker::connected());
        let pipeline = pipeline_with(store.clone(), broker.clone(), fast_timing());
        assert!(pipeline.request_drain());

        // Single-threaded runtime: this timer only fires on time if the
        // worker's backlog read left the thread free
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(started.elapsed() < Duration::from_millis(150));

        wait_idle(&pipeline).await;
        assert_eq!(broker.attempts().len(), 1);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_empty_backlog_goes_idle() {
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        let broker = Arc::new(MockBroker::connected());
        let pipeline = pipeline_with(store, broker.clone(), fast_timing());

        assert_eq!(pipeline.state(), DrainState::Idle);
        assert!(pipeline.request_drain());
        wait_idle(&pipeline).await;
        assert_eq!(pipeline.state(), DrainState::Idle);
        // One read, one re-check after the idle interval
        assert_eq!(pipeline.cycles(), 2);
        assert!(broker.attempts().is_empty());
    }

    proptest! {
        #[test]
        fn route_quality_follows_priority(priority in any::<i32>()) {
            let (_, quality) = outbound_route(&identity(), &event("e", "weight", priority, 0));
            let expected = if priority == 1 || priority == 2 {
                QualityLevel::AtLeastOnce
            } else {
                QualityLevel::BestEffort
            };
            prop_assert_eq!(quality, expected);
        }
    }
}
