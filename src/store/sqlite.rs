//! SQLite-backed event store
//!
//! One table, `events`, keyed by event id. Writes go through a single
//! connection guarded by a mutex, which serializes concurrent producers.
//! `synchronous = FULL` makes every committed append durable before
//! [`EventStore::append`] returns.

use super::{EventStore, StoreError, StoreResult};
use crate::protocol::Event;
use rusqlite::{params, Connection, ErrorCode, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id           TEXT PRIMARY KEY NOT NULL,
    source       TEXT NOT NULL,
    type         TEXT NOT NULL,
    time         INTEGER NOT NULL,
    priority     INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    payload      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_time ON events (time);
";

pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Open (or create) a file-backed store
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\
             PRAGMA synchronous = FULL;\
             PRAGMA busy_timeout = 5000;",
        )?;
        let store = Self::with_connection(conn)?;
        info!(path = %path.display(), backlog = store.len()?, "Opened event store");
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<Event> {
        Ok(Event {
            id: row.get(0)?,
            source: row.get(1)?,
            event_type: row.get(2)?,
            timestamp: row.get(3)?,
            priority: row.get(4)?,
            content_type: row.get(5)?,
            payload: row.get(6)?,
        })
    }
}

impl EventStore for SqliteEventStore {
    fn append(&self, event: &Event) -> StoreResult<()> {
        let conn = self.lock()?;
        let result = conn.execute(
            "INSERT INTO events (id, source, type, time, priority, content_type, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.id,
                event.source,
                event.event_type,
                event.timestamp,
                event.priority,
                event.content_type,
                event.payload
            ],
        );

        match result {
            Ok(_) => {
                debug!(event_id = %event.id, event_type = %event.event_type, "Event queued");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateId(event.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_all(&self) -> StoreResult<Vec<Event>> {
        let conn = self.lock()?;
        // rowid breaks timestamp ties in insertion order
        let mut stmt = conn.prepare_cached(
            "SELECT id, source, type, time, priority, content_type, payload
             FROM events ORDER BY time ASC, rowid ASC",
        )?;
        let events = stmt
            .query_map([], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn remove(&self, id: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        if removed == 0 {
            debug!(event_id = %id, "Remove of unknown event ignored");
        }
        Ok(())
    }

    fn len(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn event(id: &str, timestamp: i64) -> Event {
        Event::new("urn:device:test", "weight", format!("{{\"id\":\"{id}\"}}"))
            .with_id(id)
            .with_timestamp(timestamp)
    }

    #[test]
    fn test_append_and_list() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        let e1 = event("e1", 100).with_priority(2);

        store.append(&e1).unwrap();

        let backlog = store.list_all().unwrap();
        assert_eq!(backlog, vec![e1]);
        assert_eq!(store.len().unwrap(), 1);
        assert!(!store.is_empty().unwrap());
    }

    #[test]
    fn test_list_orders_by_timestamp() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store.append(&event("late", 300)).unwrap();
        store.append(&event("early", 100)).unwrap();
        store.append(&event("middle", 200)).unwrap();

        let ids: Vec<String> = store.list_all().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_equal_timestamps_keep_insertion_order() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        for id in ["c", "a", "b"] {
            store.append(&event(id, 100)).unwrap();
        }

        let ids: Vec<String> = store.list_all().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store.append(&event("e1", 100)).unwrap();

        let result = store.append(&event("e1", 200));
        assert!(matches!(result, Err(StoreError::DuplicateId(ref id)) if id == "e1"));

        // First copy stays visible and untouched
        let backlog = store.list_all().unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].timestamp, 100);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store.append(&event("e1", 100)).unwrap();

        store.remove("e1").unwrap();
        store.remove("e1").unwrap();
        store.remove("never-existed").unwrap();

        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_snapshot_does_not_see_later_appends() {
        let store = SqliteEventStore::open_in_memory().unwrap();
        store.append(&event("e1", 100)).unwrap();

        let snapshot = store.list_all().unwrap();
        store.append(&event("e2", 200)).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.list_all().unwrap().len(), 2);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("events.db");

        {
            let store = SqliteEventStore::open(&path).unwrap();
            store.append(&event("e1", 100)).unwrap();
            store.append(&event("e2", 200)).unwrap();
            store.remove("e1").unwrap();
        }

        let reopened = SqliteEventStore::open(&path).unwrap();
        let ids: Vec<String> = reopened
            .list_all()
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["e2"]);
    }

    #[test]
    fn test_concurrent_appends() {
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for n in 0..25 {
                        store
                            .append(&event(&format!("w{worker}-{n}"), n))
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len().unwrap(), 200);
    }

    proptest! {
        #[test]
        fn store_never_holds_duplicate_ids(
            appends in proptest::collection::vec((0u8..12, 0i64..50), 0..40)
        ) {
            let store = SqliteEventStore::open_in_memory().unwrap();
            for (id, timestamp) in &appends {
                let _ = store.append(&event(&format!("e{id}"), *timestamp));
            }

            let backlog = store.list_all().unwrap();
            let unique: HashSet<&str> = backlog.iter().map(|e| e.id.as_str()).collect();
            prop_assert_eq!(unique.len(), backlog.len());

            let expected: HashSet<String> =
                appends.iter().map(|(id, _)| format!("e{id}")).collect();
            prop_assert_eq!(backlog.len(), expected.len());

            prop_assert!(backlog.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        }
    }
}
