//! Pure health monitoring and reconnection logic for the MQTT session
//!
//! This module contains pure functions for reconnection decisions and
//! connection state transitions.

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{debug, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    ///
    /// The session never gives up on its own; only shutdown stops retries.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        let attempt = current_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectStarted => ConnectionState::Connecting,
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::ConnectionLost("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::ConnectionLost(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::Stopped => ConnectionState::Disconnected,
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// True when the link is down but the session is still trying
    pub fn is_recovering(state: &ConnectionState) -> bool {
        matches!(
            state,
            ConnectionState::ConnectionLost(_) | ConnectionState::Reconnecting(_)
        )
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempt = attempt, "Reconnection successful");
            }
            (ConnectionState::Connected, ConnectionState::ConnectionLost(reason)) => {
                warn!(reason = %reason, "MQTT connection lost");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(attempt = attempt, "Starting reconnection attempt");
            }
            (_, ConnectionState::Disconnected) => {
                info!("MQTT session stopped");
            }
            _ => {
                debug!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt after the delay
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// First connection attempt issued
    ConnectStarted,
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker initiated disconnect
    DisconnectedByBroker,
    /// Network or protocol error
    NetworkError(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Session stopped locally
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ReconnectConfig {
        ReconnectConfig {
            backoff_pattern: vec![25, 50, 100],
            sustained_delay: 250,
        }
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let config = fast_config();

        let decision = HealthMonitor::should_attempt_reconnection(0, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 25
            }
        );

        let decision = HealthMonitor::should_attempt_reconnection(2, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay_ms: 100
            }
        );

        // Sustained delay after pattern exhausted, never gives up
        let decision = HealthMonitor::should_attempt_reconnection(500, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 501,
                delay_ms: 250
            }
        );
    }

    #[test]
    fn test_shutdown_aborts_reconnection() {
        let decision = HealthMonitor::should_attempt_reconnection(0, &fast_config(), true);
        assert_eq!(decision, ReconnectionDecision::AbortShutdownRequested);
    }

    #[test]
    fn test_determine_next_state() {
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnectStarted),
            ConnectionState::Connecting
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::DisconnectedByBroker),
            ConnectionState::ConnectionLost("Broker disconnected".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::NetworkError(
                "timeout".to_string()
            )),
            ConnectionState::ConnectionLost("timeout".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(4)),
            ConnectionState::Reconnecting(4)
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::Stopped),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_can_publish() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Disconnected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Reconnecting(1)));
        assert!(!HealthMonitor::can_publish(
            &ConnectionState::ConnectionLost("io".to_string())
        ));
    }

    #[test]
    fn test_is_recovering() {
        assert!(HealthMonitor::is_recovering(&ConnectionState::Reconnecting(2)));
        assert!(HealthMonitor::is_recovering(
            &ConnectionState::ConnectionLost("io".to_string())
        ));
        assert!(!HealthMonitor::is_recovering(&ConnectionState::Connected));
        assert!(!HealthMonitor::is_recovering(&ConnectionState::Disconnected));
    }
}
