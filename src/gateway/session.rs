//! Server-side sessions and authentication failure recording

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderValue;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use super::auth::AuthError;

/// Session attribute holding the last authentication failure message
pub const AUTH_MESSAGE_ATTRIBUTE: &str = "auth.message";

#[derive(Debug)]
struct Session {
    attributes: HashMap<String, String>,
    last_access: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            attributes: HashMap::new(),
            last_access: Instant::now(),
        }
    }
}

/// In-memory session storage keyed by session id
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute, creating the session when `id` is absent or unknown.
    /// Returns the id of the session written to.
    pub fn set_attribute(&self, id: Option<&str>, name: &str, value: String) -> String {
        let id = match id {
            Some(existing) if self.sessions.contains_key(existing) => existing.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let mut session = self.sessions.entry(id.clone()).or_insert_with(Session::new);
        session.last_access = Instant::now();
        session.attributes.insert(name.to_string(), value);
        id
    }

    /// Read an attribute
    #[must_use]
    pub fn attribute(&self, id: &str, name: &str) -> Option<String> {
        self.sessions.get(id)?.attributes.get(name).cloned()
    }

    /// Read and remove an attribute
    pub fn take_attribute(&self, id: &str, name: &str) -> Option<String> {
        let mut session = self.sessions.get_mut(id)?;
        session.last_access = Instant::now();
        session.attributes.remove(name)
    }

    /// Drop sessions idle for longer than `idle_timeout`. Returns how many.
    pub fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.last_access.elapsed() < idle_timeout);
        before.saturating_sub(self.sessions.len())
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session exists
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Keeps the last authentication failure in the caller's session so a
/// follow-up request can show it
#[derive(Debug, Clone)]
pub struct ExceptionRecorder {
    store: Arc<SessionStore>,
}

impl ExceptionRecorder {
    /// Create a recorder over `store`
    #[must_use]
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    /// Store `error`'s message for the session, overwriting any previous one.
    /// Returns the session id, new if the caller had none.
    pub fn record(&self, session_id: Option<&str>, error: &AuthError) -> String {
        let id = self
            .store
            .set_attribute(session_id, AUTH_MESSAGE_ATTRIBUTE, error.message.clone());
        debug!(session = %id, "Recorded authentication failure");
        id
    }

    /// Read and clear the recorded message
    pub fn take_message(&self, session_id: &str) -> Option<String> {
        self.store.take_attribute(session_id, AUTH_MESSAGE_ATTRIBUTE)
    }
}

/// `Set-Cookie` value binding the caller to `session_id`
#[must_use]
pub fn session_cookie_header(cookie_name: &str, session_id: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{cookie_name}={session_id}; Path=/; HttpOnly; SameSite=Lax"
    ))
    .ok()
}
