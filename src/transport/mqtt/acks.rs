//! Correlation of publish requests with broker acknowledgments
//!
//! rumqttc hands out no per-publish token, so correlation goes in two steps:
//! requests enter the event loop in submission order, and each outgoing
//! `Publish` event reveals the packet id assigned to the oldest queued
//! request. QoS 1 requests then wait for the PubAck carrying that id; QoS 0
//! requests complete as soon as they are written.

use rumqttc::v5::mqttbytes::QoS;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Final result of a single publish request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Written (QoS 0) or acknowledged by the broker (QoS 1)
    Delivered,
    /// Broker answered with a failure reason code
    Rejected(String),
    /// Connection went away before the outcome was known
    Abandoned(String),
}

struct Pending {
    qos: QoS,
    waiter: oneshot::Sender<PublishOutcome>,
}

#[derive(Default)]
struct Inner {
    queued: VecDeque<Pending>,
    inflight: HashMap<u16, oneshot::Sender<PublishOutcome>>,
}

impl Inner {
    /// Drop in-flight waiters whose caller stopped waiting for the ack
    ///
    /// Queued entries stay even when abandoned: they still pair up with
    /// publishes the event loop has yet to write.
    fn prune_abandoned(&mut self) {
        let before = self.inflight.len();
        self.inflight.retain(|_, waiter| !waiter.is_closed());
        let pruned = before - self.inflight.len();
        if pruned > 0 {
            debug!(count = pruned, "Pruned in-flight publishes nobody waits for");
        }
    }
}

#[derive(Default)]
pub struct AckTracker {
    inner: Mutex<Inner>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves only plain collections behind
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a request that is about to be handed to the client
    ///
    /// Callers must register and submit under the same client lock so that
    /// registration order matches submission order.
    pub fn register(&self, qos: QoS) -> oneshot::Receiver<PublishOutcome> {
        let (waiter, receiver) = oneshot::channel();
        self.lock().queued.push_back(Pending { qos, waiter });
        receiver
    }

    /// Withdraw the most recent registration after a failed submission
    pub fn cancel_last(&self) {
        self.lock().queued.pop_back();
    }

    /// The event loop wrote the oldest queued request with `packet_id`
    pub fn on_publish_sent(&self, packet_id: u16) {
        let mut inner = self.lock();
        let Some(pending) = inner.queued.pop_front() else {
            debug!(packet_id = packet_id, "Outgoing publish without a registered waiter");
            return;
        };

        if pending.qos == QoS::AtMostOnce || packet_id == 0 {
            let _ = pending.waiter.send(PublishOutcome::Delivered);
        } else if !pending.waiter.is_closed() {
            inner.inflight.insert(packet_id, pending.waiter);
        }
        inner.prune_abandoned();
    }

    /// The broker answered the publish with `packet_id`
    pub fn on_publish_acked(&self, packet_id: u16, accepted: bool, reason: &str) {
        let Some(waiter) = self.lock().inflight.remove(&packet_id) else {
            debug!(packet_id = packet_id, "PubAck for unknown packet id");
            return;
        };

        let outcome = if accepted {
            PublishOutcome::Delivered
        } else {
            warn!(packet_id = packet_id, reason = %reason, "Broker rejected publish");
            PublishOutcome::Rejected(reason.to_string())
        };
        let _ = waiter.send(outcome);
    }

    /// Resolve every outstanding request as abandoned
    pub fn fail_all(&self, reason: &str) {
        let mut inner = self.lock();
        let queued = std::mem::take(&mut inner.queued);
        let inflight = std::mem::take(&mut inner.inflight);
        drop(inner);

        let count = queued.len() + inflight.len();
        if count > 0 {
            debug!(count = count, reason = %reason, "Abandoning outstanding publishes");
        }

        for pending in queued {
            let _ = pending
                .waiter
                .send(PublishOutcome::Abandoned(reason.to_string()));
        }
        for (_, waiter) in inflight {
            let _ = waiter.send(PublishOutcome::Abandoned(reason.to_string()));
        }
    }

    /// Number of requests still waiting for an outcome
    pub fn outstanding(&self) -> usize {
        let mut inner = self.lock();
        inner.prune_abandoned();
        inner.queued.len() + inner.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_qos0_completes_when_sent() {
        let tracker = AckTracker::new();
        let rx = tracker.register(QoS::AtMostOnce);

        tracker.on_publish_sent(0);

        assert_eq!(rx.await.unwrap(), PublishOutcome::Delivered);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_qos1_waits_for_puback() {
        let tracker = AckTracker::new();
        let mut rx = tracker.register(QoS::AtLeastOnce);

        tracker.on_publish_sent(5);
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.outstanding(), 1);

        tracker.on_publish_acked(5, true, "Success");
        assert_eq!(rx.await.unwrap(), PublishOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_correlation_follows_submission_order() {
        let tracker = AckTracker::new();
        let first = tracker.register(QoS::AtLeastOnce);
        let second = tracker.register(QoS::AtMostOnce);
        let third = tracker.register(QoS::AtLeastOnce);

        tracker.on_publish_sent(1);
        tracker.on_publish_sent(0);
        tracker.on_publish_sent(2);

        // Acks may arrive out of order
        tracker.on_publish_acked(2, false, "NotAuthorized");
        tracker.on_publish_acked(1, true, "Success");

        assert_eq!(first.await.unwrap(), PublishOutcome::Delivered);
        assert_eq!(second.await.unwrap(), PublishOutcome::Delivered);
        assert_eq!(
            third.await.unwrap(),
            PublishOutcome::Rejected("NotAuthorized".to_string())
        );
    }

    #[tokio::test]
    async fn test_fail_all_abandons_everything() {
        let tracker = AckTracker::new();
        let queued = tracker.register(QoS::AtLeastOnce);
        let inflight = tracker.register(QoS::AtLeastOnce);
        tracker.on_publish_sent(9);

        tracker.fail_all("connection lost");

        assert_eq!(
            queued.await.unwrap(),
            PublishOutcome::Abandoned("connection lost".to_string())
        );
        assert_eq!(
            inflight.await.unwrap(),
            PublishOutcome::Abandoned("connection lost".to_string())
        );
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cancel_last_removes_failed_submission() {
        let tracker = AckTracker::new();
        let kept = tracker.register(QoS::AtLeastOnce);
        let _cancelled = tracker.register(QoS::AtLeastOnce);
        tracker.cancel_last();

        tracker.on_publish_sent(3);
        tracker.on_publish_acked(3, true, "Success");

        assert_eq!(kept.await.unwrap(), PublishOutcome::Delivered);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_waiters_do_not_pile_up() {
        let tracker = AckTracker::new();

        // Callers give up before the broker ever answers
        for packet_id in 1..=50u16 {
            let rx = tracker.register(QoS::AtLeastOnce);
            tracker.on_publish_sent(packet_id);
            drop(rx);
        }
        assert_eq!(tracker.outstanding(), 0);

        let live = tracker.register(QoS::AtLeastOnce);
        tracker.on_publish_sent(51);
        let abandoned = tracker.register(QoS::AtLeastOnce);
        drop(abandoned);
        tracker.on_publish_sent(52);
        assert_eq!(tracker.outstanding(), 1);

        // A late ack for a pruned id is ignored
        tracker.on_publish_acked(7, true, "Success");
        tracker.on_publish_acked(51, true, "Success");
        assert_eq!(live.await.unwrap(), PublishOutcome::Delivered);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_unknown_ids_are_ignored() {
        let tracker = AckTracker::new();
        tracker.on_publish_sent(4);
        tracker.on_publish_acked(4, true, "Success");
        assert_eq!(tracker.outstanding(), 0);
    }
}
