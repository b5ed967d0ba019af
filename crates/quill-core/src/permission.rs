//! Permission broker.
//!
//! Mutating tools call [`PermissionService::request`] from their own task
//! and block on a one-shot reply supplied out of band by the approver. The
//! pending entry is the only place the completion handle lives; observers
//! see requests and replies on the bus, never the handle itself.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::pubsub::{Broker, EventType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub action: String,
    pub path: String,
    pub description: String,
    /// Tool-specific detail shown to the approver, e.g. the diff.
    pub params: serde_json::Value,
}

/// What a tool submits; the broker assigns the id.
#[derive(Debug, Clone)]
pub struct CreatePermissionRequest {
    pub session_id: String,
    pub tool_name: String,
    pub action: String,
    pub path: String,
    pub description: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionReply {
    pub request_id: String,
    pub session_id: String,
    pub granted: bool,
}

struct Pending {
    session_id: String,
    request: PermissionRequest,
    tx: oneshot::Sender<bool>,
}

pub struct PermissionService {
    pending: Mutex<HashMap<String, Pending>>,
    /// `(session_id, tool_name, action, path)` tuples granted for a session.
    session_allow: Mutex<HashSet<(String, String, String, String)>>,
    skip_all: AtomicBool,
    requests: Arc<Broker<PermissionRequest>>,
    replies: Arc<Broker<PermissionReply>>,
}

impl PermissionService {
    pub fn new(
        requests: Arc<Broker<PermissionRequest>>,
        replies: Arc<Broker<PermissionReply>>,
    ) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            session_allow: Mutex::new(HashSet::new()),
            skip_all: AtomicBool::new(false),
            requests,
            replies,
        }
    }

    /// Bypass all prompts. Intended for non-interactive embedding and tests.
    pub fn set_skip_all(&self, skip: bool) {
        self.skip_all.store(skip, Ordering::Relaxed);
    }

    /// Block until the request is answered. Returns immediately when the
    /// tuple is already allowed for the session or prompts are skipped.
    pub async fn request(&self, req: CreatePermissionRequest) -> bool {
        let key = (
            req.session_id.clone(),
            req.tool_name.clone(),
            req.action.clone(),
            req.path.clone(),
        );
        if self
            .session_allow
            .lock()
            .expect("allow set lock poisoned")
            .contains(&key)
        {
            return true;
        }
        if self.skip_all.load(Ordering::Relaxed) {
            return true;
        }

        let request = PermissionRequest {
            id: Uuid::new_v4().to_string(),
            session_id: req.session_id.clone(),
            tool_name: req.tool_name,
            action: req.action,
            path: req.path,
            description: req.description,
            params: req.params,
        };

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(
                request.id.clone(),
                Pending {
                    session_id: req.session_id,
                    request: request.clone(),
                    tx,
                },
            );

        self.requests.publish(EventType::Created, request);

        // A dropped sender (session teardown) counts as a denial.
        rx.await.unwrap_or(false)
    }

    pub fn grant(&self, request_id: &str) {
        self.resolve(request_id, true, false);
    }

    /// Grant and remember the tuple so matching requests in this session
    /// resolve without prompting.
    pub fn grant_persistent(&self, request_id: &str) {
        self.resolve(request_id, true, true);
    }

    pub fn deny(&self, request_id: &str) {
        self.resolve(request_id, false, false);
    }

    /// Deny every pending request for a session. Called on cancellation.
    pub fn deny_session(&self, session_id: &str) {
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        for entry in drained {
            let _ = entry.tx.send(false);
            self.replies.publish(
                EventType::Created,
                PermissionReply {
                    request_id: entry.request.id,
                    session_id: entry.session_id,
                    granted: false,
                },
            );
        }
    }

    fn resolve(&self, request_id: &str, granted: bool, persist: bool) {
        let entry = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(request_id);

        let Some(entry) = entry else {
            tracing::debug!(request_id, "permission reply for unknown request");
            return;
        };

        if persist && granted {
            self.session_allow
                .lock()
                .expect("allow set lock poisoned")
                .insert((
                    entry.request.session_id.clone(),
                    entry.request.tool_name.clone(),
                    entry.request.action.clone(),
                    entry.request.path.clone(),
                ));
        }

        let _ = entry.tx.send(granted);
        self.replies.publish(
            EventType::Created,
            PermissionReply {
                request_id: entry.request.id.clone(),
                session_id: entry.session_id,
                granted,
            },
        );
    }
}
