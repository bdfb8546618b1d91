//! One timed deployment of a study.
//!
//! A run owns the live session set, allocates tokens, balances
//! session-argument values across sessions, and keeps the size/finish
//! bookkeeping. It never persists itself — the store snapshots it after
//! each mutation — and it never removes itself: [`CloseOutcome::finished`]
//! tells the owning study to retire it.
//!
//! Live sessions are intentionally absent from [`RunSnapshot`]: a
//! restart resumes with the counters and `num_sessions` only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cohort_core::constants::session_timeout;
use cohort_core::{CohortError, Result, SessionToken};

use crate::args::{ArgCounts, ArgSpec};
use crate::session::Session;

// ─────────────────────────────────────────────────────────────────────────────
// Access types
// ─────────────────────────────────────────────────────────────────────────────

/// Who may open sessions on a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessType {
    /// Any visitor, no code required.
    Anyone,
    /// Single-use invite codes only.
    InviteOnly,
    /// Invite codes or the study's secret URL.
    InviteAndUrl,
    /// The study's secret URL only.
    UrlOnly,
}

impl AccessType {
    /// Parse the admin-facing string form.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "anyone" => Ok(Self::Anyone),
            "invite-only" => Ok(Self::InviteOnly),
            "invite-and-url" => Ok(Self::InviteAndUrl),
            "url-only" => Ok(Self::UrlOnly),
            other => Err(CohortError::InvalidConfig {
                message: format!("unknown access type '{other}'"),
            }),
        }
    }

    /// Whether a session may open without any participant code.
    #[must_use]
    pub fn allows_anonymous(self) -> bool {
        matches!(self, Self::Anyone)
    }

    /// Whether invite codes may be issued for this run.
    #[must_use]
    pub fn allows_invites(self) -> bool {
        !matches!(self, Self::UrlOnly)
    }

    /// Whether a secret URL may be issued for this run.
    #[must_use]
    pub fn allows_secret_url(self) -> bool {
        !matches!(self, Self::InviteOnly)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Admin-supplied configuration for a new run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    /// Countable-session limit; `None` means unbounded.
    #[serde(default)]
    pub size: Option<u64>,
    /// Access policy.
    pub access_type: AccessType,
    /// Whether incomplete sessions with data are saved (and counted).
    #[serde(default)]
    pub save_incomplete_data: bool,
    /// Redirect for completed sessions.
    #[serde(default)]
    pub completion_url: Option<String>,
    /// Redirect for cancelled sessions.
    #[serde(default)]
    pub cancel_url: Option<String>,
    /// Shown to participants before a session opens.
    #[serde(default)]
    pub briefing_url: Option<String>,
    /// Wraps the completion redirect when present.
    #[serde(default)]
    pub debriefing_url: Option<String>,
    /// Session-argument template: key → expression (see [`ArgSpec`]).
    #[serde(default)]
    pub session_args: BTreeMap<String, String>,
}

/// What one session close produced, for the owner to fan out.
#[derive(Clone, Debug)]
pub struct CloseOutcome {
    /// The closed session's token.
    pub token: SessionToken,
    /// Whether it counted toward the size limit and balance counters.
    pub countable: bool,
    /// Whether this close brought the run to its size limit.
    pub finished: bool,
    /// Redirect for the participant, when the run configures one.
    pub url: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

/// One deployment of a study, bounded optionally by a session count.
#[derive(Clone, Debug)]
pub struct Run {
    id: u64,
    data_path: PathBuf,
    size: Option<u64>,
    num_sessions: u64,
    access_type: AccessType,
    save_incomplete_data: bool,
    completion_url: Option<String>,
    cancel_url: Option<String>,
    briefing_url: Option<String>,
    debriefing_url: Option<String>,
    session_args: BTreeMap<String, String>,
    arg_counts: ArgCounts,
    next_session_token: u64,
    sessions: BTreeMap<SessionToken, Session>,
}

impl Run {
    /// Create a fresh run. Configuration is validated by the study.
    #[must_use]
    pub fn new(id: u64, data_path: PathBuf, config: RunConfig) -> Self {
        Self {
            id,
            data_path,
            size: config.size,
            num_sessions: 0,
            access_type: config.access_type,
            save_incomplete_data: config.save_incomplete_data,
            completion_url: config.completion_url,
            cancel_url: config.cancel_url,
            briefing_url: config.briefing_url,
            debriefing_url: config.debriefing_url,
            session_args: config.session_args,
            arg_counts: ArgCounts::new(),
            next_session_token: 1,
            sessions: BTreeMap::new(),
        }
    }

    /// Run id, monotonic per study.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Access policy for this run.
    #[must_use]
    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    /// Briefing URL, surfaced by the join flow.
    #[must_use]
    pub fn briefing_url(&self) -> Option<&str> {
        self.briefing_url.as_deref()
    }

    /// Directory session data files land in.
    #[must_use]
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Countable sessions closed so far.
    #[must_use]
    pub fn num_sessions(&self) -> u64 {
        self.num_sessions
    }

    /// Remaining capacity, when a size limit is set.
    #[must_use]
    pub fn remaining_sessions(&self) -> Option<u64> {
        self.size.map(|s| s.saturating_sub(self.num_sessions))
    }

    /// Number of currently live sessions.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Open a new session.
    ///
    /// Allocates the next token, resolves the session-argument template
    /// against `external`, and bumps the usage counter of every resolved
    /// value immediately so concurrent opens see the updated balance.
    /// Persistence is the caller's job.
    pub fn open_session(
        &mut self,
        external: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> SessionToken {
        let token = SessionToken::from(self.next_session_token);
        self.next_session_token += 1;

        let mut resolved = BTreeMap::new();
        for (key, raw) in &self.session_args {
            let spec = ArgSpec::parse(raw);
            if let Some(value) = spec.resolve(external, self.arg_counts.get(key)) {
                *self
                    .arg_counts
                    .entry(key.clone())
                    .or_default()
                    .entry(value.clone())
                    .or_insert(0) += 1;
                let _ = resolved.insert(key.clone(), value);
            }
        }

        info!(run = self.id, token = %token, ?resolved, "opened session");
        let _ = self
            .sessions
            .insert(token.clone(), Session::new(token.clone(), now, resolved));
        token
    }

    /// Mutable access to a live session, for data submission.
    pub fn session_mut(&mut self, token: &SessionToken) -> Result<&mut Session> {
        self.sessions
            .get_mut(token)
            .ok_or_else(|| CohortError::not_found("session", token.as_str()))
    }

    /// Close a session, normally or as a forced incomplete.
    ///
    /// Removes it from the live set, persists its data per policy,
    /// credits `num_sessions` when countable or backs its argument
    /// contributions out when not, and reports whether the size limit
    /// was just reached.
    pub fn close_session(&mut self, token: &SessionToken, completed: bool) -> Result<CloseOutcome> {
        let mut session = self
            .sessions
            .remove(token)
            .ok_or_else(|| CohortError::not_found("session", token.as_str()))?;
        session.is_complete = completed;

        if session.should_save(self.save_incomplete_data) {
            info!(run = self.id, token = %token, "session closing, saving data");
            session.save_data(&self.data_path)?;
        } else {
            info!(run = self.id, token = %token, completed, "session closing without data");
        }

        let countable = session.is_countable(self.save_incomplete_data);
        if countable {
            self.num_sessions += 1;
        } else {
            self.back_out_args(&session);
        }

        let finished = self.size.is_some_and(|s| self.num_sessions >= s);
        if finished {
            info!(run = self.id, "run reached its size limit");
        }

        Ok(CloseOutcome {
            token: token.clone(),
            countable,
            finished,
            url: self.redirect_for(completed),
        })
    }

    /// Force-close every live session older than the fixed threshold.
    ///
    /// Invoked lazily at the start of the next `open_session` request,
    /// never from a background timer. Closes are incomplete and form a
    /// bulk batch; running the sweep twice in a row is a no-op.
    pub fn sweep_stale(&mut self, now: DateTime<Utc>) -> Result<Vec<CloseOutcome>> {
        let cutoff = session_timeout();
        let stale: Vec<SessionToken> = self
            .sessions
            .values()
            .filter(|s| now - s.started_at > cutoff)
            .map(|s| s.token.clone())
            .collect();

        let mut closed = Vec::with_capacity(stale.len());
        for token in stale {
            warn!(run = self.id, token = %token, "session timed out");
            closed.push(self.close_session(&token, false)?);
        }
        Ok(closed)
    }

    /// Force-close all live sessions as one bulk batch.
    ///
    /// Used on cancel and whenever the run retires while sessions are
    /// still live (a countable close can reach the size limit ahead of
    /// them). The owner finishes the run afterwards.
    pub fn cancel(&mut self) -> Result<Vec<CloseOutcome>> {
        let tokens: Vec<SessionToken> = self.sessions.keys().cloned().collect();
        let mut closed = Vec::with_capacity(tokens.len());
        for token in tokens {
            closed.push(self.close_session(&token, false)?);
        }
        if !closed.is_empty() {
            info!(run = self.id, count = closed.len(), "force-closed live sessions");
        }
        Ok(closed)
    }

    /// Remove the per-key counter contributions of a non-countable session.
    fn back_out_args(&mut self, session: &Session) {
        for (key, value) in &session.resolved_args {
            if let Some(counts) = self.arg_counts.get_mut(key) {
                if let Some(count) = counts.get_mut(value) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    /// Redirect for a closing session, per the run's URL configuration.
    ///
    /// Completed sessions get the completion URL; when a debriefing URL
    /// is set it wraps the completion URL as a percent-encoded `next`
    /// parameter. Cancelled sessions get the cancel URL.
    fn redirect_for(&self, completed: bool) -> Option<String> {
        if !completed {
            return self.cancel_url.clone();
        }
        match (&self.debriefing_url, &self.completion_url) {
            (Some(debrief), Some(completion)) => Some(format!(
                "{debrief}?next={}",
                utf8_percent_encode(completion, NON_ALPHANUMERIC)
            )),
            (Some(debrief), None) => Some(debrief.clone()),
            (None, completion) => completion.clone(),
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Snapshots
    // ─────────────────────────────────────────────────────────────────

    /// Durable snapshot of everything but the live session set.
    #[must_use]
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            id: self.id,
            data_path: self.data_path.to_string_lossy().into_owned(),
            size: self.size,
            num_sessions: self.num_sessions,
            access_type: self.access_type,
            save_incomplete_data: self.save_incomplete_data,
            completion_url: self.completion_url.clone(),
            cancel_url: self.cancel_url.clone(),
            briefing_url: self.briefing_url.clone(),
            debriefing_url: self.debriefing_url.clone(),
            session_args: self.session_args.clone(),
            arg_counts: self.arg_counts.clone(),
        }
    }

    /// Rebuild a run from its snapshot.
    ///
    /// Sessions that were open at snapshot time are lost; the token
    /// counter restarts at 1 (the snapshot format has no counter field).
    #[must_use]
    pub fn from_snapshot(snapshot: RunSnapshot) -> Self {
        Self {
            id: snapshot.id,
            data_path: PathBuf::from(snapshot.data_path),
            size: snapshot.size,
            num_sessions: snapshot.num_sessions,
            access_type: snapshot.access_type,
            save_incomplete_data: snapshot.save_incomplete_data,
            completion_url: snapshot.completion_url,
            cancel_url: snapshot.cancel_url,
            briefing_url: snapshot.briefing_url,
            debriefing_url: snapshot.debriefing_url,
            session_args: snapshot.session_args,
            arg_counts: snapshot.arg_counts,
            next_session_token: 1,
            sessions: BTreeMap::new(),
        }
    }
}

/// Serialized form of a [`Run`] in the per-study `meta.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Run id.
    pub id: u64,
    /// Data directory path.
    pub data_path: String,
    /// Countable-session limit.
    #[serde(default)]
    pub size: Option<u64>,
    /// Countable sessions closed so far.
    pub num_sessions: u64,
    /// Access policy.
    pub access_type: AccessType,
    /// Whether incomplete sessions with data are saved.
    pub save_incomplete_data: bool,
    /// Completion redirect.
    #[serde(default)]
    pub completion_url: Option<String>,
    /// Cancel redirect.
    #[serde(default)]
    pub cancel_url: Option<String>,
    /// Briefing page.
    #[serde(default)]
    pub briefing_url: Option<String>,
    /// Debriefing page.
    #[serde(default)]
    pub debriefing_url: Option<String>,
    /// Session-argument template.
    #[serde(default)]
    pub session_args: BTreeMap<String, String>,
    /// Per-key, per-value usage counters.
    #[serde(default)]
    pub arg_counts: ArgCounts,
}
