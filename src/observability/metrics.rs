//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! operational statistics across the delivery pipeline, the broker session
//! and the downlink dispatcher.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Uplink delivery
    events_enqueued: AtomicU64,
    events_rejected: AtomicU64,
    events_delivered: AtomicU64,
    publish_failures: AtomicU64,
    storage_faults: AtomicU64,
    drains_started: AtomicU64,
    last_delivery: AtomicU64,

    // Broker session
    mqtt_connected: AtomicBool,
    connections_established: AtomicU64,
    connections_lost: AtomicU64,
    reconnect_attempts: AtomicU64,
    subscription_faults: AtomicU64,
    connection_start_time: AtomicU64,

    // Downlink
    commands_received: AtomicU64,
    listener_deliveries: AtomicU64,
    listener_faults: AtomicU64,
    commands_dropped: AtomicU64,

    // Publish round-trip times in milliseconds
    publish_latencies: Mutex<Vec<u64>>,

    // Lifecycle
    bridge_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            events_enqueued: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            storage_faults: AtomicU64::new(0),
            drains_started: AtomicU64::new(0),
            last_delivery: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            connections_established: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            subscription_faults: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            listener_deliveries: AtomicU64::new(0),
            listener_faults: AtomicU64::new(0),
            commands_dropped: AtomicU64::new(0),
            publish_latencies: Mutex::new(Vec::new()),
            bridge_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            state_transitions: AtomicU64::new(0),
        }
    }

    // Uplink delivery metrics
    pub fn event_enqueued(&self) {
        self.events_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_delivered(&self, latency: Duration) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
        self.last_delivery
            .store(current_timestamp(), Ordering::Relaxed);
        self.record_publish_latency(latency);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn storage_fault(&self) {
        self.storage_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drain_started(&self) {
        self.drains_started.fetch_add(1, Ordering::Relaxed);
    }

    fn record_publish_latency(&self, latency: Duration) {
        if let Ok(mut samples) = self.publish_latencies.lock() {
            samples.push(latency.as_millis() as u64);

            if samples.len() > MAX_LATENCY_SAMPLES {
                samples.remove(0);
            }
        }
    }

    // Broker session metrics
    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        if self.mqtt_connected.swap(false, Ordering::Relaxed) {
            self.connections_lost.fetch_add(1, Ordering::Relaxed);
        }
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_fault(&self) {
        self.subscription_faults.fetch_add(1, Ordering::Relaxed);
    }

    // Downlink metrics
    pub fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_delivery(&self) {
        self.listener_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_fault(&self) {
        self.listener_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Inbound command discarded because the dispatcher fell behind
    pub fn command_dropped(&self) {
        self.commands_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_bridge_state(&self, state: &str) {
        if let Ok(mut current_state) = self.bridge_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.events_enqueued,
            &self.events_rejected,
            &self.events_delivered,
            &self.publish_failures,
            &self.storage_faults,
            &self.drains_started,
            &self.last_delivery,
            &self.connections_established,
            &self.connections_lost,
            &self.reconnect_attempts,
            &self.subscription_faults,
            &self.connection_start_time,
            &self.commands_received,
            &self.listener_deliveries,
            &self.listener_faults,
            &self.commands_dropped,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);

        if let Ok(mut samples) = self.publish_latencies.lock() {
            samples.clear();
        }
        if let Ok(mut state) = self.bridge_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Calculate publish latency statistics (avg, p50, p95, p99)
    fn calculate_latency_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(samples) = self.publish_latencies.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if samples.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = samples.clone();
        drop(samples);
        sorted.sort_unstable();

        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    /// Calculate connection duration (pure function)
    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    fn current_bridge_state(&self) -> String {
        self.bridge_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_publish_latency_ms, p50, p95, p99) = self.calculate_latency_statistics();

        MetricsSnapshot {
            delivery: DeliveryMetrics {
                events_enqueued: self.events_enqueued.load(Ordering::Relaxed),
                events_rejected: self.events_rejected.load(Ordering::Relaxed),
                events_delivered: self.events_delivered.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                storage_faults: self.storage_faults.load(Ordering::Relaxed),
                drains_started: self.drains_started.load(Ordering::Relaxed),
                last_delivery: self.last_delivery.load(Ordering::Relaxed),
                avg_publish_latency_ms,
                publish_latency_p50_ms: p50,
                publish_latency_p95_ms: p95,
                publish_latency_p99_ms: p99,
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                subscription_faults: self.subscription_faults.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            downlink: DownlinkMetrics {
                commands_received: self.commands_received.load(Ordering::Relaxed),
                listener_deliveries: self.listener_deliveries.load(Ordering::Relaxed),
                listener_faults: self.listener_faults.load(Ordering::Relaxed),
                commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state: self.current_bridge_state(),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub delivery: DeliveryMetrics,
    pub mqtt: MqttMetrics,
    pub downlink: DownlinkMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryMetrics {
    pub events_enqueued: u64,
    pub events_rejected: u64,
    pub events_delivered: u64,
    pub publish_failures: u64,
    pub storage_faults: u64,
    pub drains_started: u64,
    pub last_delivery: u64,
    pub avg_publish_latency_ms: f64,
    pub publish_latency_p50_ms: f64,
    pub publish_latency_p95_ms: f64,
    pub publish_latency_p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connections_established: u64,
    pub connections_lost: u64,
    pub reconnect_attempts: u64,
    pub subscription_faults: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownlinkMetrics {
    pub commands_received: u64,
    pub listener_deliveries: u64,
    pub listener_faults: u64,
    pub commands_dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
