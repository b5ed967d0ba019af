//! Versioned file snapshots.
//!
//! Per `(session, path)` the first snapshot is `"initial"` (content at first
//! read or write); every later mutation appends the next numeric version.
//! Diff statistics shown to the user always compare against the initial
//! snapshot for the same path.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::pubsub::{Broker, EventType};

use super::sessions::parse_rfc3339;
use super::{Database, FileSnapshot, INITIAL_VERSION};

pub struct FileStore {
    db: Database,
    broker: Arc<Broker<FileSnapshot>>,
}

impl FileStore {
    pub fn new(db: Database, broker: Arc<Broker<FileSnapshot>>) -> Self {
        Self { db, broker }
    }

    /// Record a snapshot: `"initial"` when the path is new to the session,
    /// otherwise the next numeric version.
    pub fn create_version(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
    ) -> Result<FileSnapshot> {
        let version = {
            let conn = self.db.conn();
            let mut stmt = conn.prepare(
                "SELECT version FROM files WHERE session_id = ?1 AND path = ?2",
            )?;
            let versions: Vec<String> = stmt
                .query_map(params![session_id, path], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;

            if versions.is_empty() {
                INITIAL_VERSION.to_string()
            } else {
                let next = versions
                    .iter()
                    .filter_map(|v| v.parse::<u64>().ok())
                    .max()
                    .map_or(1, |max| max + 1);
                next.to_string()
            }
        };

        let snapshot = FileSnapshot {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            path: path.to_string(),
            content: content.to_string(),
            version,
            created_at: Utc::now(),
        };

        self.db.conn().execute(
            "INSERT INTO files (id, session_id, path, content, version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                snapshot.id,
                snapshot.session_id,
                snapshot.path,
                snapshot.content,
                snapshot.version,
                snapshot.created_at.to_rfc3339(),
            ],
        )?;

        self.broker.publish(EventType::Created, snapshot.clone());
        Ok(snapshot)
    }

    pub fn get_initial(&self, session_id: &str, path: &str) -> Result<Option<FileSnapshot>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, path, content, version, created_at
             FROM files WHERE session_id = ?1 AND path = ?2 AND version = ?3",
        )?;
        let mut rows = stmt.query_map(params![session_id, path, INITIAL_VERSION], map_snapshot)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_by_session(&self, session_id: &str) -> Result<Vec<FileSnapshot>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, path, content, version, created_at
             FROM files WHERE session_id = ?1 ORDER BY path, created_at",
        )?;
        let snapshots = stmt
            .query_map([session_id], map_snapshot)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(snapshots)
    }

    /// Newest snapshot per path. Numeric versions outrank `"initial"`.
    pub fn list_latest_by_session(&self, session_id: &str) -> Result<Vec<FileSnapshot>> {
        let mut latest: Vec<FileSnapshot> = Vec::new();
        for snapshot in self.list_by_session(session_id)? {
            match latest.iter_mut().find(|s| s.path == snapshot.path) {
                None => latest.push(snapshot),
                Some(existing) => {
                    let newer = match (existing.numeric_version(), snapshot.numeric_version()) {
                        (None, Some(_)) => true,
                        (Some(a), Some(b)) => b > a,
                        _ => false,
                    };
                    if newer {
                        *existing = snapshot;
                    }
                }
            }
        }
        Ok(latest)
    }

    pub fn delete_by_session(&self, session_id: &str) -> Result<()> {
        self.db
            .conn()
            .execute("DELETE FROM files WHERE session_id = ?1", [session_id])?;
        Ok(())
    }
}

fn map_snapshot(row: &rusqlite::Row) -> rusqlite::Result<FileSnapshot> {
    let created_at: String = row.get(5)?;
    Ok(FileSnapshot {
        id: row.get(0)?,
        session_id: row.get(1)?,
        path: row.get(2)?,
        content: row.get(3)?,
        version: row.get(4)?,
        created_at: parse_rfc3339(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SessionStore;

    fn stores() -> (SessionStore, FileStore) {
        let db = Database::in_memory().unwrap();
        (
            SessionStore::new(db.clone(), Arc::new(Broker::new())),
            FileStore::new(db, Arc::new(Broker::new())),
        )
    }

    #[test]
    fn version_sequence_has_no_gaps() {
        let (sessions, files) = stores();
        let session = sessions.create(None, "s").unwrap();

        let v0 = files.create_version(&session.id, "/wd/a.txt", "one").unwrap();
        assert_eq!(v0.version, INITIAL_VERSION);

        let v1 = files.create_version(&session.id, "/wd/a.txt", "two").unwrap();
        assert_eq!(v1.version, "1");

        let v2 = files.create_version(&session.id, "/wd/a.txt", "three").unwrap();
        assert_eq!(v2.version, "2");

        // Exactly one initial, strictly increasing numerics.
        let all = files.list_by_session(&session.id).unwrap();
        let initials = all.iter().filter(|s| s.is_initial()).count();
        assert_eq!(initials, 1);
        let mut numerics: Vec<u64> = all.iter().filter_map(|s| s.numeric_version()).collect();
        numerics.sort_unstable();
        assert_eq!(numerics, vec![1, 2]);
    }

    #[test]
    fn initial_per_path_is_independent() {
        let (sessions, files) = stores();
        let session = sessions.create(None, "s").unwrap();

        files.create_version(&session.id, "/wd/a.txt", "a").unwrap();
        let b0 = files.create_version(&session.id, "/wd/b.txt", "b").unwrap();
        assert_eq!(b0.version, INITIAL_VERSION);

        let initial = files.get_initial(&session.id, "/wd/a.txt").unwrap().unwrap();
        assert_eq!(initial.content, "a");
    }

    #[test]
    fn latest_per_path_prefers_numeric() {
        let (sessions, files) = stores();
        let session = sessions.create(None, "s").unwrap();

        files.create_version(&session.id, "/wd/a.txt", "a0").unwrap();
        files.create_version(&session.id, "/wd/a.txt", "a1").unwrap();
        files.create_version(&session.id, "/wd/b.txt", "b0").unwrap();

        let latest = files.list_latest_by_session(&session.id).unwrap();
        assert_eq!(latest.len(), 2);
        let a = latest.iter().find(|s| s.path == "/wd/a.txt").unwrap();
        assert_eq!(a.content, "a1");
        let b = latest.iter().find(|s| s.path == "/wd/b.txt").unwrap();
        assert_eq!(b.version, INITIAL_VERSION);
    }
}
