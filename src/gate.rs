//! Per-user daily-reveal gate.
//!
//! One card per user per civil day, enforced here rather than trusted to
//! the classifier. Sessions live in process memory for the lifetime of the
//! bot; there is no durable storage.

use chrono::NaiveDate;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserSession {
    /// Most recent civil day a card was delivered to this user.
    pub last_reveal_date: Option<NaiveDate>,
    /// True exactly while the gate waits for the user's reflective input.
    pub awaiting_thoughts: bool,
}

/// Outcome of a `/card` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealGate {
    /// A card was already delivered today; deflect without classifying.
    AlreadyRevealed,
    /// The user was prompted for their thoughts.
    Prompted,
}

pub struct SessionStore {
    sessions: Mutex<HashMap<i64, UserSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    /// Handle a `/card` request: either deflect (already revealed today) or
    /// arm the gate for the next text turn.
    pub async fn begin_reveal(&self, user_id: i64, today: NaiveDate) -> RevealGate {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(user_id).or_default();

        if session.last_reveal_date == Some(today) {
            return RevealGate::AlreadyRevealed;
        }

        session.awaiting_thoughts = true;
        RevealGate::Prompted
    }

    /// Clear the awaiting flag unconditionally, returning its prior value.
    /// Called on every text turn, whatever the classification outcome.
    pub async fn take_awaiting(&self, user_id: i64) -> bool {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(user_id).or_default();
        std::mem::take(&mut session.awaiting_thoughts)
    }

    /// Atomically record a card delivery for `today`. Returns false when a
    /// card was already delivered today, in which case the caller must
    /// render the result as chit-chat instead.
    pub async fn try_commit_reveal(&self, user_id: i64, today: NaiveDate) -> bool {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(user_id).or_default();

        if session.last_reveal_date == Some(today) {
            return false;
        }

        session.last_reveal_date = Some(today);
        true
    }
}

#[cfg(test)]
impl SessionStore {
    pub async fn snapshot(&self, user_id: i64) -> UserSession {
        let sessions = self.sessions.lock().await;
        sessions.get(&user_id).copied().unwrap_or_default()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
