//! Store-and-forward delivery of queued events
//!
//! A single drain worker reads the backlog in timestamp order, publishes each
//! event through the broker session and removes it from the store once the
//! broker outcome is a success. A failure ends the cycle; the failed event is
//! retried first after a fixed backoff.

pub mod pipeline;

pub use pipeline::{outbound_route, DeliveryPipeline, DrainState};
