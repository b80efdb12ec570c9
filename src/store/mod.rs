//! Durable ordered queue of not-yet-delivered events
//!
//! The store is the durability boundary of the bridge: once
//! [`EventStore::append`] returns, the event survives a process restart and
//! stays queued until the delivery pipeline removes it after a confirmed
//! publish.

pub mod sqlite;

pub use sqlite::SqliteEventStore;

use crate::protocol::Event;
use thiserror::Error;

/// Event store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// An event with the same id is already queued
    #[error("duplicate event id: {0}")]
    DuplicateId(String),

    /// The store cannot be used at all (poisoned lock, closed file, ...)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to prepare store location: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for faults of the persistence layer itself, as opposed to a
    /// rejected event
    pub fn is_storage_fault(&self) -> bool {
        !matches!(self, StoreError::DuplicateId(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable, keyed, timestamp-ordered event queue
///
/// Implementations must be safe to call from concurrent producers and the
/// delivery worker at the same time.
pub trait EventStore: Send + Sync {
    /// Persist a new event; returns only after the write is durable
    fn append(&self, event: &Event) -> StoreResult<()>;

    /// Snapshot of the whole backlog ordered by timestamp ascending
    fn list_all(&self) -> StoreResult<Vec<Event>>;

    /// Remove an event; unknown ids are a no-op
    fn remove(&self, id: &str) -> StoreResult<()>;

    /// Number of queued events
    fn len(&self) -> StoreResult<usize>;

    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}
