//! Participant-code registry.
//!
//! Central map from an opaque code to its study, kind, and redemption
//! state. Two kinds: single-use-style **invites** (optional expiry,
//! optional session limit, optional one-session-per-caller binding) and
//! durable **secret URLs** (no expiry or limit; lifetime tied to the
//! study's active run).
//!
//! Removal side effects are dispatched on the kind tag, not stored
//! callbacks: dropping an invite is local to the registry, dropping a
//! secret URL additionally clears the study's secret-URL slot (done by
//! the store, which owns both locks).
//!
//! Expiry is lazy: an expired invite is detected, removed, and reported
//! at the next redemption attempt — there is no background reaper.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cohort_core::constants::CODE_LENGTH;
use cohort_core::{CohortError, Result, SessionToken, StudyId};

use crate::study::Study;

// ─────────────────────────────────────────────────────────────────────────────
// Code state
// ─────────────────────────────────────────────────────────────────────────────

/// What kind of access a code grants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeKind {
    /// An invite: bounded by expiry and/or a session limit.
    Invite {
        /// Absolute expiry; checked lazily at redemption.
        expires_at: Option<DateTime<Utc>>,
        /// Bind each caller key to at most one session under this code.
        unique_session: bool,
        /// Redeemed-session cap; reaching it removes the code.
        session_limit: Option<u64>,
    },
    /// A persistent secret URL for the study's active run.
    SecretUrl,
}

/// Issuance constraints for an invite code.
#[derive(Clone, Debug, Default)]
pub struct CodeConstraints {
    /// Absolute expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Redeemed-session cap.
    pub session_limit: Option<u64>,
    /// One session per caller key.
    pub unique_session: bool,
}

/// One issued code and its redemption state.
#[derive(Clone, Debug)]
pub struct ParticipantCode {
    /// The opaque code string.
    pub code: String,
    /// Owning study.
    pub study: StudyId,
    /// Kind tag; removal behavior dispatches on this.
    pub kind: CodeKind,
    /// Sessions redeemed under this code that have closed.
    pub session_count: u64,
    /// Live sessions currently open under this code.
    pub sessions: BTreeSet<SessionToken>,
}

impl ParticipantCode {
    /// Whether the caller-key binding applies to this code.
    ///
    /// Secret URLs always bind (a refresh reattaches to the live
    /// session); invites bind only when issued with `unique_session`.
    #[must_use]
    fn binds_caller(&self) -> bool {
        match &self.kind {
            CodeKind::Invite { unique_session, .. } => *unique_session,
            CodeKind::SecretUrl => true,
        }
    }

    /// Whether redemption would overshoot the session limit, counting
    /// sessions that are still open.
    #[must_use]
    fn exhausted(&self) -> bool {
        match &self.kind {
            CodeKind::Invite {
                session_limit: Some(limit),
                ..
            } => self.session_count + self.sessions.len() as u64 >= *limit,
            _ => false,
        }
    }
}

/// Result of a successful redemption.
#[derive(Clone, Debug)]
pub struct RedeemOutcome {
    /// The session now bound to the caller.
    pub token: SessionToken,
    /// True when an existing live session was handed back instead of a
    /// new one being opened.
    pub reattached: bool,
}

/// Persisted form of one code in `server.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodeRecord {
    /// Owning study.
    pub study: StudyId,
    /// The code string.
    pub code: String,
    /// Present and true for secret URLs.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_secret_url: bool,
    /// Invite expiry, ISO-8601.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DateTime<Utc>>,
    /// Invite caller binding.
    #[serde(default)]
    pub unique_session: bool,
    /// Invite session cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_limit: Option<u64>,
    /// Redeemed (closed) sessions so far.
    #[serde(default)]
    pub session_count: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Server-wide registry of participant codes.
///
/// Interior state only; the store serializes access (lock order is
/// study → registry).
#[derive(Debug, Default)]
pub struct CodeRegistry {
    codes: HashMap<String, ParticipantCode>,
    /// Live session → code, for close notifications.
    by_session: HashMap<(StudyId, SessionToken), String>,
    /// Caller key → its live session, for reattachment.
    by_caller: HashMap<String, (StudyId, SessionToken)>,
}

impl CodeRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate an unguessable alphanumeric code.
    #[must_use]
    pub fn generate_code() -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(CODE_LENGTH)
            .map(char::from)
            .collect()
    }

    /// Issue an invite code for a study.
    ///
    /// `code` may be caller-supplied; `None` generates one. Fails
    /// `DuplicateName` when the code is already registered.
    pub fn issue_invite(
        &mut self,
        study: &StudyId,
        code: Option<String>,
        constraints: CodeConstraints,
    ) -> Result<String> {
        let kind = CodeKind::Invite {
            expires_at: constraints.expires_at,
            unique_session: constraints.unique_session,
            session_limit: constraints.session_limit,
        };
        self.insert(study, code, kind)
    }

    /// Issue a secret-URL code for a study.
    pub fn issue_secret_url(&mut self, study: &StudyId, code: Option<String>) -> Result<String> {
        self.insert(study, code, CodeKind::SecretUrl)
    }

    fn insert(&mut self, study: &StudyId, code: Option<String>, kind: CodeKind) -> Result<String> {
        let code = code.unwrap_or_else(Self::generate_code);
        if self.codes.contains_key(&code) {
            return Err(CohortError::DuplicateName { name: code });
        }
        info!(study = %study, code, ?kind, "issued participant code");
        let _ = self.codes.insert(
            code.clone(),
            ParticipantCode {
                code: code.clone(),
                study: study.clone(),
                kind,
                session_count: 0,
                sessions: BTreeSet::new(),
            },
        );
        Ok(code)
    }

    /// The study a code belongs to, without touching its state.
    pub fn study_of(&self, code: &str) -> Result<StudyId> {
        self.codes
            .get(code)
            .map(|c| c.study.clone())
            .ok_or_else(|| CohortError::not_found("code", code))
    }

    /// Redeem a code against its study's active run.
    ///
    /// Order matters: expiry is checked first (removing and failing
    /// `Expired`), then exhaustion, then the caller-key binding (a bound
    /// caller with a live session reattaches), and only then is a new
    /// session opened and tracked under the code.
    pub fn redeem(
        &mut self,
        study: &mut Study,
        code: &str,
        external: &BTreeMap<String, String>,
        caller_key: &str,
        now: DateTime<Utc>,
    ) -> Result<RedeemOutcome> {
        let entry = self
            .codes
            .get(code)
            .ok_or_else(|| CohortError::not_found("code", code))?;

        if let CodeKind::Invite {
            expires_at: Some(expiry),
            ..
        } = &entry.kind
        {
            if *expiry <= now {
                warn!(code, "removing expired invite code");
                let _ = self.remove_code(code);
                return Err(CohortError::Expired { code: code.into() });
            }
        }

        if entry.exhausted() {
            return Err(CohortError::not_found("code", code));
        }

        // A code left over from an earlier run may not match the current
        // run's access policy; treat it as if it did not exist.
        let access = study.active_run()?.access_type();
        let kind_allowed = match &entry.kind {
            CodeKind::Invite { .. } => access.allows_invites(),
            CodeKind::SecretUrl => access.allows_secret_url(),
        };
        if !kind_allowed {
            return Err(CohortError::not_found("code", code));
        }

        let binds = entry.binds_caller();
        if binds {
            if let Some((bound_study, token)) = self.by_caller.get(caller_key) {
                if *bound_study == entry.study
                    && self
                        .by_session
                        .contains_key(&(bound_study.clone(), token.clone()))
                {
                    return Ok(RedeemOutcome {
                        token: token.clone(),
                        reattached: true,
                    });
                }
            }
        }

        let token = study.active_run()?.open_session(external, now);
        let study_id = study.id().clone();
        if let Some(entry) = self.codes.get_mut(code) {
            let _ = entry.sessions.insert(token.clone());
        }
        let _ = self
            .by_session
            .insert((study_id.clone(), token.clone()), code.to_string());
        if binds {
            let _ = self
                .by_caller
                .insert(caller_key.to_string(), (study_id, token.clone()));
        }

        Ok(RedeemOutcome {
            token,
            reattached: false,
        })
    }

    /// Record a session close.
    ///
    /// Credits the owning code's redeemed count, drops the caller
    /// binding, and removes the code when its limit is reached. Returns
    /// whether the registry changed (so the store knows to persist).
    pub fn on_session_closed(&mut self, study: &StudyId, token: &SessionToken) -> bool {
        let Some(code) = self.by_session.remove(&(study.clone(), token.clone())) else {
            return false;
        };
        self.by_caller
            .retain(|_, bound| !(bound.0 == *study && bound.1 == *token));

        if let Some(entry) = self.codes.get_mut(&code) {
            let _ = entry.sessions.remove(token);
            entry.session_count += 1;
            let limit_reached = matches!(
                entry.kind,
                CodeKind::Invite {
                    session_limit: Some(limit),
                    ..
                } if entry.session_count >= limit
            );
            if limit_reached {
                info!(code, "invite code reached its session limit");
                let _ = self.remove_code(&code);
            }
        }
        true
    }

    /// Revoke every invite code of a study.
    ///
    /// Returns the live sessions that were bound to them; the store
    /// bulk-closes those and persists once afterwards.
    pub fn revoke_invites(&mut self, study: &StudyId) -> Vec<SessionToken> {
        let targets: Vec<String> = self
            .codes
            .values()
            .filter(|c| c.study == *study && matches!(c.kind, CodeKind::Invite { .. }))
            .map(|c| c.code.clone())
            .collect();

        let mut orphaned = Vec::new();
        for code in targets {
            if let Some(removed) = self.remove_code(&code) {
                orphaned.extend(removed.sessions);
            }
        }
        info!(study = %study, sessions = orphaned.len(), "revoked invite codes");
        orphaned
    }

    /// Remove a code and all its index entries.
    ///
    /// Kind-tagged cleanup: invites need nothing further; for secret
    /// URLs the caller clears the study's secret-URL slot (the registry
    /// does not reach into studies).
    pub fn remove_code(&mut self, code: &str) -> Option<ParticipantCode> {
        let removed = self.codes.remove(code)?;
        for token in &removed.sessions {
            let _ = self.by_session.remove(&(removed.study.clone(), token.clone()));
        }
        self.by_caller
            .retain(|_, bound| !(bound.0 == removed.study && removed.sessions.contains(&bound.1)));
        Some(removed)
    }

    /// Codes currently issued for a study.
    #[must_use]
    pub fn codes_for(&self, study: &StudyId) -> Vec<&ParticipantCode> {
        let mut codes: Vec<&ParticipantCode> =
            self.codes.values().filter(|c| c.study == *study).collect();
        codes.sort_by(|a, b| a.code.cmp(&b.code));
        codes
    }

    /// Remove every code of a study (study deletion cascade).
    pub fn remove_study(&mut self, study: &StudyId) {
        let targets: Vec<String> = self
            .codes
            .values()
            .filter(|c| c.study == *study)
            .map(|c| c.code.clone())
            .collect();
        for code in targets {
            let _ = self.remove_code(&code);
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Snapshots
    // ─────────────────────────────────────────────────────────────────

    /// Serialize all codes for `server.json`.
    ///
    /// Live session bindings are in-memory only, like a run's live
    /// session set.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CodeRecord> {
        let mut records: Vec<CodeRecord> = self
            .codes
            .values()
            .map(|c| match &c.kind {
                CodeKind::SecretUrl => CodeRecord {
                    study: c.study.clone(),
                    code: c.code.clone(),
                    is_secret_url: true,
                    timeout: None,
                    unique_session: false,
                    session_limit: None,
                    session_count: 0,
                },
                CodeKind::Invite {
                    expires_at,
                    unique_session,
                    session_limit,
                } => CodeRecord {
                    study: c.study.clone(),
                    code: c.code.clone(),
                    is_secret_url: false,
                    timeout: *expires_at,
                    unique_session: *unique_session,
                    session_limit: *session_limit,
                    session_count: c.session_count,
                },
            })
            .collect();
        records.sort_by(|a, b| a.code.cmp(&b.code));
        records
    }

    /// Rebuild the registry from persisted records.
    #[must_use]
    pub fn from_records(records: Vec<CodeRecord>) -> Self {
        let mut registry = Self::new();
        for record in records {
            let kind = if record.is_secret_url {
                CodeKind::SecretUrl
            } else {
                CodeKind::Invite {
                    expires_at: record.timeout,
                    unique_session: record.unique_session,
                    session_limit: record.session_limit,
                }
            };
            let _ = registry.codes.insert(
                record.code.clone(),
                ParticipantCode {
                    code: record.code,
                    study: record.study,
                    kind,
                    session_count: record.session_count,
                    sessions: BTreeSet::new(),
                },
            );
        }
        registry
    }
}
