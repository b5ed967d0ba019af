//! In-process log records.
//!
//! Ambient diagnostics go through `tracing` as usual. This module keeps the
//! bounded ring of structured records the status bar and log page consume:
//! every record is published on the bus, and records flagged `persist` stay
//! visible for `persist_time`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pubsub::{Broker, EventType};

/// Ring capacity; older records fall off the front.
const MAX_RECORDS: usize = 1_000;

/// How long a persisted record stays on the status bar by default.
pub const DEFAULT_PERSIST_TIME: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub attributes: Vec<(String, String)>,
    pub persist: bool,
    #[serde(with = "duration_millis")]
    pub persist_time: Duration,
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Bounded in-memory log store publishing each record on the bus.
pub struct LogStore {
    broker: Arc<Broker<LogRecord>>,
    ring: Mutex<VecDeque<LogRecord>>,
}

impl LogStore {
    pub fn new(broker: Arc<Broker<LogRecord>>) -> Self {
        Self {
            broker,
            ring: Mutex::new(VecDeque::with_capacity(MAX_RECORDS)),
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.record(LogLevel::Debug, message.into(), Vec::new(), false, DEFAULT_PERSIST_TIME);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.record(LogLevel::Info, message.into(), Vec::new(), false, DEFAULT_PERSIST_TIME);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.record(LogLevel::Warn, message.into(), Vec::new(), false, DEFAULT_PERSIST_TIME);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(LogLevel::Error, message.into(), Vec::new(), false, DEFAULT_PERSIST_TIME);
    }

    /// Warn that stays on the status bar for `persist_time`.
    pub fn warn_persist(&self, message: impl Into<String>, persist_time: Duration) {
        self.record(LogLevel::Warn, message.into(), Vec::new(), true, persist_time);
    }

    pub fn with_attributes(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        attributes: Vec<(String, String)>,
    ) {
        self.record(level, message.into(), attributes, false, DEFAULT_PERSIST_TIME);
    }

    fn record(
        &self,
        level: LogLevel,
        message: String,
        attributes: Vec<(String, String)>,
        persist: bool,
        persist_time: Duration,
    ) {
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }

        let record = LogRecord {
            time: Utc::now(),
            level,
            message,
            attributes,
            persist,
            persist_time,
        };

        {
            let mut ring = self.ring.lock().expect("log ring lock poisoned");
            if ring.len() == MAX_RECORDS {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }

        self.broker.publish(EventType::Created, record);
    }

    /// Snapshot of the retained records, oldest first.
    pub fn records(&self) -> Vec<LogRecord> {
        self.ring
            .lock()
            .expect("log ring lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}
