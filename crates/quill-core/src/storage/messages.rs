//! Message CRUD.
//!
//! Parts live as one JSON column. The streaming path calls [`MessageStore::update`]
//! repeatedly with the whole current message; consumers treat the resulting
//! update events as idempotent replacements by id.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::message::{Message, Part, Role};
use crate::pubsub::{Broker, EventType};

use super::sessions::parse_rfc3339;
use super::Database;

pub struct MessageStore {
    db: Database,
    broker: Arc<Broker<Message>>,
}

impl MessageStore {
    pub fn new(db: Database, broker: Arc<Broker<Message>>) -> Self {
        Self { db, broker }
    }

    pub fn create(&self, session_id: &str, role: Role, parts: Vec<Part>) -> Result<Message> {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            parts,
            created_at: now,
            updated_at: now,
        };

        let parts_json = serde_json::to_string(&message.parts)?;
        {
            let conn = self.db.conn();
            conn.execute(
                "INSERT INTO messages (id, session_id, role, parts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id,
                    message.session_id,
                    message.role.as_str(),
                    parts_json,
                    message.created_at.to_rfc3339(),
                    message.updated_at.to_rfc3339(),
                ],
            )?;
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), session_id],
            )?;
        }

        self.broker.publish(EventType::Created, message.clone());
        Ok(message)
    }

    /// Replace the stored parts with the message's current state.
    pub fn update(&self, message: &Message) -> Result<Message> {
        let mut updated = message.clone();
        updated.updated_at = Utc::now();

        let parts_json = serde_json::to_string(&updated.parts)?;
        let affected = self.db.conn().execute(
            "UPDATE messages SET parts = ?1, updated_at = ?2 WHERE id = ?3",
            params![parts_json, updated.updated_at.to_rfc3339(), updated.id],
        )?;
        if affected == 0 {
            anyhow::bail!("no message {} to update", updated.id);
        }

        self.broker.publish(EventType::Updated, updated.clone());
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> Result<Message> {
        let message = self.db.conn().query_row(
            "SELECT id, session_id, role, parts, created_at, updated_at
             FROM messages WHERE id = ?1",
            [id],
            map_message,
        )?;
        Ok(message)
    }

    /// All messages for a session in `(created_at, id)` order.
    pub fn list_by_session(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, parts, created_at, updated_at
             FROM messages WHERE session_id = ?1
             ORDER BY created_at, id",
        )?;
        let messages = stmt
            .query_map([session_id], map_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub fn delete_by_session(&self, session_id: &str) -> Result<()> {
        self.db
            .conn()
            .execute("DELETE FROM messages WHERE session_id = ?1", [session_id])?;
        Ok(())
    }
}

fn map_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let parts_json: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: Role::parse(&role).unwrap_or(Role::User),
        parts: serde_json::from_str(&parts_json).unwrap_or_default(),
        created_at: parse_rfc3339(&created_at),
        updated_at: parse_rfc3339(&updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FinishReason, TokenUsage};
    use crate::storage::SessionStore;
    use tokio_util::sync::CancellationToken;

    fn stores() -> (SessionStore, MessageStore, Arc<Broker<Message>>) {
        let db = Database::in_memory().unwrap();
        let broker = Arc::new(Broker::new());
        (
            SessionStore::new(db.clone(), Arc::new(Broker::new())),
            MessageStore::new(db, broker.clone()),
            broker,
        )
    }

    #[tokio::test]
    async fn create_update_round_trip() {
        let (sessions, messages, broker) = stores();
        let session = sessions.create(None, "s").unwrap();
        let mut sub = broker.subscribe(CancellationToken::new());

        let mut message = messages
            .create(
                &session.id,
                Role::Assistant,
                vec![Part::Text { text: "he".into() }],
            )
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().event_type, EventType::Created);

        message.parts = vec![
            Part::Text {
                text: "hello".into(),
            },
            Part::Finish {
                reason: FinishReason::EndTurn,
                usage: TokenUsage::default(),
            },
        ];
        messages.update(&message).unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Updated);
        assert_eq!(event.payload.text(), "hello");

        let loaded = messages.get(&message.id).unwrap();
        assert_eq!(loaded.parts.len(), 2);
        assert_eq!(loaded.finish_reason(), Some(FinishReason::EndTurn));
    }

    #[tokio::test]
    async fn list_preserves_append_order() {
        let (sessions, messages, _broker) = stores();
        let session = sessions.create(None, "s").unwrap();

        for i in 0..5 {
            messages
                .create(
                    &session.id,
                    Role::User,
                    vec![Part::Text {
                        text: format!("m{i}"),
                    }],
                )
                .unwrap();
        }

        let listed = messages.list_by_session(&session.id).unwrap();
        let texts: Vec<String> = listed.iter().map(Message::text).collect();
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn update_unknown_message_errors() {
        let (sessions, messages, _broker) = stores();
        let session = sessions.create(None, "s").unwrap();
        let mut message = messages
            .create(&session.id, Role::User, vec![Part::Text { text: "x".into() }])
            .unwrap();
        message.id = "missing".into();
        assert!(messages.update(&message).is_err());
    }
}
