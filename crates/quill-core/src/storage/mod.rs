//! Persistence layer.
//!
//! SQLite-backed stores for sessions, messages and file snapshots. Every
//! mutating operation commits first, then publishes exactly one event on
//! the bus; consumers never read the database to learn about changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod database;
mod files;
mod messages;
mod sessions;

pub use database::Database;
pub use files::FileStore;
pub use messages::MessageStore;
pub use sessions::SessionStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub summary_message_id: Option<String>,
}

/// Version marker for the snapshot recorded at first read/write of a path.
pub const INITIAL_VERSION: &str = "initial";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub id: String,
    pub session_id: String,
    pub path: String,
    pub content: String,
    /// `"initial"` or a decimal integer, strictly increasing per path.
    pub version: String,
    pub created_at: DateTime<Utc>,
}

impl FileSnapshot {
    pub fn is_initial(&self) -> bool {
        self.version == INITIAL_VERSION
    }

    pub(crate) fn numeric_version(&self) -> Option<u64> {
        self.version.parse().ok()
    }
}
