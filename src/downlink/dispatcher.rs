//! Listener registry and command fan-out

use super::{EventListener, ListenerHandle};
use crate::error::BridgeError;
use crate::observability::metrics;
use crate::protocol::Event;
use crate::transport::InboundMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, Instrument};

/// Time a listener gets to accept one command before it counts as faulted
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of delivering one event to the listener snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Listeners that accepted the event
    pub delivered: usize,
    /// Listeners that returned an error, panicked or did not answer in time
    pub faulted: usize,
}

struct Registration {
    handle: ListenerHandle,
    listener: Weak<dyn EventListener>,
}

/// Fan-out registry for downlink commands
///
/// Registration and fan-out may run concurrently. A fan-out works on a
/// snapshot of the registry, so a listener registered while it is in flight
/// may or may not see that event.
pub struct Dispatcher {
    listeners: RwLock<Vec<Registration>>,
    next_handle: AtomicU64,
    delivery_timeout: Duration,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    /// Override how long one listener may take to accept a command
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Register a listener
    ///
    /// Only a weak reference is kept: the caller owns the listener and must
    /// hold on to its `Arc`. Registering the same listener again returns the
    /// handle of the existing registration.
    pub fn register(&self, listener: Arc<dyn EventListener>) -> ListenerHandle {
        let weak = Arc::downgrade(&listener);
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = listeners
            .iter()
            .find(|registration| Weak::ptr_eq(&registration.listener, &weak))
        {
            debug!(handle = %existing.handle, "Listener already registered");
            return existing.handle;
        }

        let handle = ListenerHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        listeners.push(Registration {
            handle,
            listener: weak,
        });
        info!(handle = %handle, listeners = listeners.len(), "Registered listener");
        handle
    }

    /// Remove a registration; returns whether it existed
    pub fn unregister(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|registration| registration.handle != handle);
        let removed = listeners.len() < before;

        if removed {
            info!(handle = %handle, listeners = listeners.len(), "Unregistered listener");
        } else {
            debug!(handle = %handle, "Unregister of unknown listener ignored");
        }
        removed
    }

    /// Drop every registration
    pub fn clear(&self) {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let count = listeners.len();
        listeners.clear();
        info!(removed = count, "Cleared listener registry");
    }

    /// Number of registrations whose listener is still alive
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|registration| registration.listener.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Turn an inbound broker message into a command event and fan it out
    pub async fn handle_inbound(&self, message: InboundMessage) -> DispatchOutcome {
        metrics().command_received();
        let event = Event::command(&message.topic, &message.payload);
        let span = crate::dispatch_span!(topic = %message.topic, event_id = %event.id);
        self.dispatch(&event).instrument(span).await
    }

    /// Relay inbound messages until the sending side closes
    pub async fn relay(&self, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            self.handle_inbound(message).await;
        }
        debug!("Downlink relay stopped");
    }

    /// Deliver an event to every live listener in registration order
    ///
    /// Each delivery runs in its own task bounded by the delivery timeout, so
    /// a listener that panics or hangs is reported like one that returns an
    /// error. Faults are logged and never unregister the listener.
    pub async fn dispatch(&self, event: &Event) -> DispatchOutcome {
        let snapshot = self.snapshot();
        let mut outcome = DispatchOutcome::default();

        if snapshot.is_empty() {
            debug!(topic = %event.event_type, "No listeners registered, command dropped");
            return outcome;
        }

        for (handle, listener) in snapshot {
            let delivery_event = event.clone();
            let mut delivery = tokio::spawn(async move {
                listener.on_event_received(&delivery_event).await
            });

            let fault = match tokio::time::timeout(self.delivery_timeout, &mut delivery).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(e.to_string()),
                Ok(Err(join_error)) if join_error.is_panic() => {
                    Some("listener panicked during delivery".to_string())
                }
                Ok(Err(join_error)) => Some(join_error.to_string()),
                Err(_) => {
                    delivery.abort();
                    Some(format!(
                        "listener did not answer within {}ms",
                        self.delivery_timeout.as_millis()
                    ))
                }
            };

            match fault {
                None => {
                    outcome.delivered += 1;
                    metrics().listener_delivery();
                    debug!(handle = %handle, event_id = %event.id, "Delivered command");
                }
                Some(message) => {
                    outcome.faulted += 1;
                    metrics().listener_fault();
                    let fault = BridgeError::listener_fault(message);
                    error!(
                        handle = %handle,
                        event_id = %event.id,
                        error = %fault,
                        "Listener failed to take command"
                    );
                }
            }
        }

        outcome
    }

    /// Upgrade live registrations and prune the dead ones
    fn snapshot(&self) -> Vec<(ListenerHandle, Arc<dyn EventListener>)> {
        let (live, dead) = {
            let listeners = self
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let live: Vec<_> = listeners
                .iter()
                .filter_map(|registration| {
                    registration
                        .listener
                        .upgrade()
                        .map(|listener| (registration.handle, listener))
                })
                .collect();
            let dead = listeners.len() - live.len();
            (live, dead)
        };

        if dead > 0 {
            let mut listeners = self
                .listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            listeners.retain(|registration| registration.listener.strong_count() > 0);
            info!(pruned = dead, "Pruned listeners whose owner went away");
        }

        live
    }
}
