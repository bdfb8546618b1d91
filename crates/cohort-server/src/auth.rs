//! Admin session authentication with failed-attempt lockout.
//!
//! Credentials live in the server config; a successful login mints an
//! opaque session key the client sends back per request. Repeated
//! failures for one user trip a fixed-duration lockout, checked (and
//! lazily cleared) on the next attempt.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::distr::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

const SESSION_KEY_LENGTH: usize = 48;

/// Login failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Wrong user or password.
    #[error("invalid credentials")]
    Denied,
    /// Too many failures; try again after the cooldown.
    #[error("account locked")]
    Locked,
}

#[derive(Default)]
struct AuthState {
    /// Session key → user.
    sessions: HashMap<String, String>,
    /// Consecutive failures per user.
    attempts: HashMap<String, u32>,
    /// Lockout start per user.
    lockouts: HashMap<String, DateTime<Utc>>,
}

/// In-memory session authenticator.
pub struct SessionAuth {
    users: BTreeMap<String, String>,
    max_attempts: Option<u32>,
    lockout_duration: Duration,
    state: Mutex<AuthState>,
}

impl SessionAuth {
    /// Build an authenticator over the configured credential map.
    #[must_use]
    pub fn new(
        users: BTreeMap<String, String>,
        max_attempts: Option<u32>,
        lockout_duration: Duration,
    ) -> Self {
        Self {
            users,
            max_attempts,
            lockout_duration,
            state: Mutex::new(AuthState::default()),
        }
    }

    /// Attempt a login; on success returns a fresh session key.
    pub fn authenticate(&self, user: &str, password: &str) -> Result<String, AuthError> {
        self.authenticate_at(user, password, Utc::now())
    }

    /// [`SessionAuth::authenticate`] with an explicit clock, for tests.
    pub fn authenticate_at(
        &self,
        user: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let mut state = self.state.lock();

        if let Some(started) = state.lockouts.get(user) {
            if now - *started > self.lockout_duration {
                let _ = state.lockouts.remove(user);
            } else {
                return Err(AuthError::Locked);
            }
        }

        if self.users.get(user).is_some_and(|pw| pw == password) {
            let _ = state.attempts.remove(user);
            let key = generate_key();
            let _ = state.sessions.insert(key.clone(), user.to_string());
            info!(user, "admin logged in");
            return Ok(key);
        }

        if let Some(max) = self.max_attempts {
            let attempts = state.attempts.entry(user.to_string()).or_insert(0);
            *attempts += 1;
            if *attempts >= max {
                warn!(user, "locking out after repeated login failures");
                let _ = state.attempts.remove(user);
                let _ = state.lockouts.insert(user.to_string(), now);
                return Err(AuthError::Locked);
            }
        }
        Err(AuthError::Denied)
    }

    /// The user behind a session key, if it is valid.
    #[must_use]
    pub fn user_for(&self, key: &str) -> Option<String> {
        self.state.lock().sessions.get(key).cloned()
    }

    /// Invalidate a session key.
    pub fn revoke(&self, key: &str) {
        let _ = self.state.lock().sessions.remove(key);
    }
}

fn generate_key() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_KEY_LENGTH)
        .map(char::from)
        .collect()
}
