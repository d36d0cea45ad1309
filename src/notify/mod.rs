//! Durable user notifications with best-effort live push.
//!
//! Notifications persist in the relational store; open connections are
//! tracked in a process-local registry keyed by user and pushed to on
//! write. Push failures prune the dead connection and never propagate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Contradiction,
    AssumptionInvalid,
    StaleDecision,
    DormantAlternative,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contradiction => "contradiction",
            Self::AssumptionInvalid => "assumption_invalid",
            Self::StaleDecision => "stale_decision",
            Self::DormantAlternative => "dormant_alternative",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contradiction" => Some(Self::Contradiction),
            "assumption_invalid" => Some(Self::AssumptionInvalid),
            "stale_decision" => Some(Self::StaleDecision),
            "dormant_alternative" => Some(Self::DormantAlternative),
            _ => None,
        }
    }
}

/// A persisted user notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub payload: Value,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// A live delivery channel (in production, a WebSocket connection).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification. An error marks the sink dead.
    async fn push(&self, notification: &Notification) -> Result<()>;
}

/// Process-local registry of open connections per user.
///
/// A single lock guards the map; mutation windows are tiny (insert,
/// remove, clone-out for push).
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Vec<Arc<dyn NotificationSink>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: &str, sink: Arc<dyn NotificationSink>) {
        let mut map = self.connections.lock().expect("registry lock poisoned");
        map.entry(user_id.to_string()).or_default().push(sink);
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.connections
            .lock()
            .expect("registry lock poisoned")
            .get(user_id)
            .map_or(0, Vec::len)
    }

    fn sinks_for(&self, user_id: &str) -> Vec<Arc<dyn NotificationSink>> {
        self.connections
            .lock()
            .expect("registry lock poisoned")
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    fn prune(&self, user_id: &str, dead: &[usize]) {
        if dead.is_empty() {
            return;
        }
        let mut map = self.connections.lock().expect("registry lock poisoned");
        if let Some(sinks) = map.get_mut(user_id) {
            for &idx in dead.iter().rev() {
                if idx < sinks.len() {
                    sinks.remove(idx);
                }
            }
            if sinks.is_empty() {
                map.remove(user_id);
            }
        }
    }
}

/// SQLite-backed notification store.
pub struct NotificationStore {
    conn: Arc<Mutex<Connection>>,
}

impl NotificationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::RelationalStorage(e.to_string()))?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::RelationalStorage(e.to_string()))?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL DEFAULT '',
                payload TEXT NOT NULL DEFAULT '{}',
                read INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| Error::RelationalStorage(e.to_string()))?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_notifications_user
             ON notifications(user_id, read)",
            [],
        )
        .map_err(|e| Error::RelationalStorage(e.to_string()))?;
        Ok(())
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {e}")))?;
        f(&conn).map_err(|e| Error::RelationalStorage(e.to_string()))
    }

    pub fn insert(&self, n: &Notification) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, user_id, kind, title, body, payload, read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    n.id,
                    n.user_id,
                    n.kind.as_str(),
                    n.title,
                    n.body,
                    n.payload.to_string(),
                    n.read as i64,
                    n.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn list(&self, user_id: &str, unread_only: bool, limit: u64) -> Result<Vec<Notification>> {
        self.with_conn(|conn| {
            let sql = if unread_only {
                "SELECT id, user_id, kind, title, body, payload, read, created_at
                 FROM notifications WHERE user_id = ?1 AND read = 0
                 ORDER BY created_at DESC LIMIT ?2"
            } else {
                "SELECT id, user_id, kind, title, body, payload, read, created_at
                 FROM notifications WHERE user_id = ?1
                 ORDER BY created_at DESC LIMIT ?2"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![user_id, limit], |row| {
                Ok(Notification {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    kind: NotificationKind::parse(&row.get::<_, String>(2)?)
                        .unwrap_or(NotificationKind::Contradiction),
                    title: row.get(3)?,
                    body: row.get(4)?,
                    payload: serde_json::from_str(&row.get::<_, String>(5)?)
                        .unwrap_or(Value::Null),
                    read: row.get::<_, i64>(6)? != 0,
                    created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(7)?)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?;
            rows.collect()
        })
    }

    pub fn unread_count(&self, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND read = 0",
                params![user_id],
                |r| r.get(0),
            )
        })
    }

    /// Mark one notification read. Scope mismatches report not-found.
    pub fn mark_read(&self, user_id: &str, id: &str) -> Result<()> {
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE notifications SET read = 1 WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
        })?;
        if updated == 0 {
            return Err(Error::NotFound(format!("notification {id}")));
        }
        Ok(())
    }

    pub fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE notifications SET read = 1 WHERE user_id = ?1 AND read = 0",
                params![user_id],
            )?;
            Ok(n as u64)
        })
    }

    pub fn get(&self, user_id: &str, id: &str) -> Result<Option<Notification>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, kind, title, body, payload, read, created_at
                 FROM notifications WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
                |row| {
                    Ok(Notification {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        kind: NotificationKind::parse(&row.get::<_, String>(2)?)
                            .unwrap_or(NotificationKind::Contradiction),
                        title: row.get(3)?,
                        body: row.get(4)?,
                        payload: serde_json::from_str(&row.get::<_, String>(5)?)
                            .unwrap_or(Value::Null),
                        read: row.get::<_, i64>(6)? != 0,
                        created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(7)?)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    })
                },
            )
            .optional()
        })
    }
}

/// Persists notifications and pushes them to live connections.
pub struct Notifier {
    store: Arc<NotificationStore>,
    registry: Arc<ConnectionRegistry>,
}

impl Notifier {
    pub fn new(store: Arc<NotificationStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<NotificationStore> {
        &self.store
    }

    /// Persist a notification and push it, best effort.
    pub async fn notify(
        &self,
        user_id: &str,
        kind: NotificationKind,
        title: impl Into<String>,
        body: impl Into<String>,
        payload: Value,
    ) -> Result<Notification> {
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind,
            title: title.into(),
            body: body.into(),
            payload,
            read: false,
            created_at: Utc::now(),
        };
        self.store.insert(&notification)?;

        let sinks = self.registry.sinks_for(user_id);
        let mut dead = Vec::new();
        for (idx, sink) in sinks.iter().enumerate() {
            if let Err(e) = sink.push(&notification).await {
                warn!(user_id, error = %e, "notification push failed, pruning connection");
                dead.push(idx);
            }
        }
        self.registry.prune(user_id, &dead);
        debug!(user_id, kind = kind.as_str(), "notification delivered");
        Ok(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct RecordingSink {
        received: AtomicUsize,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn new(fail: bool) -> Self {
            Self {
                received: AtomicUsize::new(0),
                fail: AtomicBool::new(fail),
            }
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn push(&self, _notification: &Notification) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Internal("connection closed".into()));
            }
            self.received.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn notifier() -> Notifier {
        Notifier::new(
            Arc::new(NotificationStore::in_memory().unwrap()),
            Arc::new(ConnectionRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_notify_persists_and_pushes() {
        let notifier = notifier();
        let sink = Arc::new(RecordingSink::new(false));
        notifier.registry().register("u1", sink.clone());

        notifier
            .notify(
                "u1",
                NotificationKind::Contradiction,
                "Conflicting decision",
                "Another decision contradicts yours",
                json!({"other_id": "abc"}),
            )
            .await
            .unwrap();

        assert_eq!(sink.received.load(Ordering::SeqCst), 1);
        let stored = notifier.store().list("u1", true, 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, NotificationKind::Contradiction);
    }

    #[tokio::test]
    async fn test_dead_sink_pruned() {
        let notifier = notifier();
        let dead = Arc::new(RecordingSink::new(true));
        notifier.registry().register("u1", dead);
        assert_eq!(notifier.registry().connection_count("u1"), 1);

        notifier
            .notify("u1", NotificationKind::StaleDecision, "t", "b", json!({}))
            .await
            .unwrap();
        assert_eq!(notifier.registry().connection_count("u1"), 0);
        // The notification still persisted.
        assert_eq!(notifier.store().unread_count("u1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_scoping() {
        let notifier = notifier();
        let n = notifier
            .notify("u1", NotificationKind::DormantAlternative, "t", "b", json!({}))
            .await
            .unwrap();

        // Another user cannot mark it read.
        assert!(matches!(
            notifier.store().mark_read("u2", &n.id),
            Err(Error::NotFound(_))
        ));
        notifier.store().mark_read("u1", &n.id).unwrap();
        assert_eq!(notifier.store().unread_count("u1").unwrap(), 0);

        notifier
            .notify("u1", NotificationKind::StaleDecision, "t2", "b2", json!({}))
            .await
            .unwrap();
        assert_eq!(notifier.store().mark_all_read("u1").unwrap(), 1);
    }
}
