//! Session CRUD.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::pubsub::{Broker, EventType};

use super::{Database, Session};

pub struct SessionStore {
    db: Database,
    broker: Arc<Broker<Session>>,
}

impl SessionStore {
    pub fn new(db: Database, broker: Arc<Broker<Session>>) -> Self {
        Self { db, broker }
    }

    pub fn create(&self, parent_id: Option<&str>, title: &str) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            parent_id: parent_id.map(str::to_string),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            summary_message_id: None,
        };

        self.db.conn().execute(
            "INSERT INTO sessions (id, parent_id, title, created_at, updated_at,
                                   prompt_tokens, completion_tokens, cost, summary_message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, 0, NULL)",
            params![
                session.id,
                session.parent_id,
                session.title,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
            ],
        )?;

        self.broker.publish(EventType::Created, session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Result<Session> {
        let session = self.db.conn().query_row(
            "SELECT id, parent_id, title, created_at, updated_at,
                    prompt_tokens, completion_tokens, cost, summary_message_id
             FROM sessions WHERE id = ?1",
            [id],
            map_session,
        )?;
        Ok(session)
    }

    pub fn list(&self) -> Result<Vec<Session>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, parent_id, title, created_at, updated_at,
                    prompt_tokens, completion_tokens, cost, summary_message_id
             FROM sessions ORDER BY updated_at DESC",
        )?;
        let sessions = stmt
            .query_map([], map_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    pub fn update_title(&self, id: &str, title: &str) -> Result<Session> {
        self.db.conn().execute(
            "UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, Utc::now().to_rfc3339(), id],
        )?;
        let session = self.get(id)?;
        self.broker.publish(EventType::Updated, session.clone());
        Ok(session)
    }

    pub fn set_summary_message(&self, id: &str, message_id: &str) -> Result<Session> {
        self.db.conn().execute(
            "UPDATE sessions SET summary_message_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![message_id, Utc::now().to_rfc3339(), id],
        )?;
        let session = self.get(id)?;
        self.broker.publish(EventType::Updated, session.clone());
        Ok(session)
    }

    /// Grow the cumulative token and cost counters. Counters never shrink.
    pub fn add_usage(
        &self,
        id: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost: f64,
    ) -> Result<Session> {
        if cost < 0.0 {
            bail!("cost increment must be non-negative");
        }
        self.db.conn().execute(
            "UPDATE sessions
             SET prompt_tokens = prompt_tokens + ?1,
                 completion_tokens = completion_tokens + ?2,
                 cost = cost + ?3,
                 updated_at = ?4
             WHERE id = ?5",
            params![
                prompt_tokens as i64,
                completion_tokens as i64,
                cost,
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        let session = self.get(id)?;
        self.broker.publish(EventType::Updated, session.clone());
        Ok(session)
    }

    /// A session goes away only after its messages and snapshots have.
    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM files WHERE session_id = ?1", [id])?;
        conn.execute("DELETE FROM messages WHERE session_id = ?1", [id])?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
        Ok(())
    }
}

fn map_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    let prompt_tokens: i64 = row.get(5)?;
    let completion_tokens: i64 = row.get(6)?;

    Ok(Session {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        title: row.get(2)?,
        created_at: parse_rfc3339(&created_at),
        updated_at: parse_rfc3339(&updated_at),
        prompt_tokens: prompt_tokens.max(0) as u64,
        completion_tokens: completion_tokens.max(0) as u64,
        cost: row.get(7)?,
        summary_message_id: row.get(8)?,
    })
}

pub(crate) fn parse_rfc3339(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn store() -> (SessionStore, Arc<Broker<Session>>) {
        let broker = Arc::new(Broker::new());
        (
            SessionStore::new(Database::in_memory().unwrap(), broker.clone()),
            broker,
        )
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let (store, broker) = store();
        let mut sub = broker.subscribe(CancellationToken::new());

        let session = store.create(None, "New session").unwrap();
        let loaded = store.get(&session.id).unwrap();
        assert_eq!(loaded.title, "New session");
        assert_eq!(loaded.prompt_tokens, 0);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Created);
        assert_eq!(event.payload.id, session.id);
    }

    #[tokio::test]
    async fn usage_counters_only_grow() {
        let (store, _broker) = store();
        let session = store.create(None, "s").unwrap();

        store.add_usage(&session.id, 100, 50, 0.01).unwrap();
        let after = store.add_usage(&session.id, 10, 5, 0.002).unwrap();
        assert_eq!(after.prompt_tokens, 110);
        assert_eq!(after.completion_tokens, 55);
        assert!((after.cost - 0.012).abs() < 1e-12);

        assert!(store.add_usage(&session.id, 0, 0, -1.0).is_err());
    }

    #[tokio::test]
    async fn delete_removes_children_first() {
        let (store, _broker) = store();
        let session = store.create(None, "s").unwrap();
        store
            .db
            .conn()
            .execute(
                "INSERT INTO messages (id, session_id, role, parts, created_at, updated_at)
                 VALUES ('m1', ?1, 'user', '[]', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                [&session.id],
            )
            .unwrap();

        store.delete(&session.id).unwrap();
        assert!(store.get(&session.id).is_err());
        let count: i64 = store
            .db
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
