//! Downlink fan-out of broker commands to local listeners
//!
//! Commands received on `{device}/cmd/#` are turned into [`Event`]s and handed
//! to every registered [`EventListener`]. Listeners are capabilities owned by
//! their registering collaborator; the [`Dispatcher`] only keeps weak
//! references to them.

pub mod dispatcher;

pub use dispatcher::{DispatchOutcome, Dispatcher};

use crate::protocol::Event;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors a listener may report for one delivery
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListenerError {
    /// The listener's host is gone or not accepting events
    #[error("listener unavailable: {0}")]
    Unavailable(String),

    /// The listener refused this particular event
    #[error("listener rejected event: {0}")]
    Rejected(String),
}

/// A local consumer of downlink commands
#[async_trait]
pub trait EventListener: Send + Sync + 'static {
    async fn on_event_received(&self, event: &Event) -> Result<(), ListenerError>;
}

/// Opaque reference to one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ListenerHandle(u64);

impl ListenerHandle {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}
