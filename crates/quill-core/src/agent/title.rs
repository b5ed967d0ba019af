//! Session title side-job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::message::{Message, Part, Role};
use crate::provider::Provider;
use crate::storage::SessionStore;

const TITLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TITLE_LENGTH: usize = 50;

const TITLE_PROMPT: &str = "you will generate a short title based on the first message a user \
begins a conversation with
- ensure it is not more than 50 characters long
- the title should be a summary of the user's message
- do not use quotes or colons
- the entire text you return will be used as the title";

/// Generate and store a title for a fresh session on the cheap model.
/// Bounded, detached, and silent about provider failures. Cancelling the
/// session aborts the in-flight request via `cancel`.
pub fn spawn_title_task(
    provider: Arc<dyn Provider>,
    sessions: Arc<SessionStore>,
    session_id: String,
    user_text: String,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let history = vec![
            Message {
                id: Uuid::new_v4().to_string(),
                session_id: session_id.clone(),
                role: Role::System,
                parts: vec![Part::Text {
                    text: TITLE_PROMPT.into(),
                }],
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            Message {
                id: Uuid::new_v4().to_string(),
                session_id: session_id.clone(),
                role: Role::User,
                parts: vec![Part::Text { text: user_text }],
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        ];

        let result = tokio::time::timeout(
            TITLE_TIMEOUT,
            provider.send(cancel, &history, &[]),
        )
        .await;

        let title = match result {
            Ok(Ok(response)) => clean_title(&response.content),
            Ok(Err(e)) => {
                tracing::debug!("title generation failed: {e}");
                return;
            }
            Err(_) => {
                tracing::debug!("title generation timed out");
                return;
            }
        };

        if title.is_empty() {
            return;
        }
        if let Err(e) = sessions.update_title(&session_id, &title) {
            tracing::debug!("failed to store title: {e}");
        }
    });
}

fn clean_title(raw: &str) -> String {
    let mut title = raw.replace('\n', " ").trim().to_string();
    if title.len() > MAX_TITLE_LENGTH {
        let mut cut = MAX_TITLE_LENGTH;
        while !title.is_char_boundary(cut) {
            cut -= 1;
        }
        title.truncate(cut);
        title = title.trim_end().to_string();
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_are_single_line_and_bounded() {
        assert_eq!(clean_title("  Fix the bug\nin main  "), "Fix the bug in main");
        let long = "a".repeat(80);
        assert_eq!(clean_title(&long).len(), 50);
        assert_eq!(clean_title(""), "");
    }
}
