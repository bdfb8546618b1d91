//! The top-level store: study directory, code registry, durable glue.
//!
//! This is the single authoritative state surface of the process. The
//! study directory is a `RwLock`ed map of `Arc<Mutex<Study>>`, so
//! mutations are serialized per study without serializing unrelated
//! studies; the code registry sits behind its own mutex. Lock order is
//! study → registry throughout — the close path notifies the registry
//! only after study work is done, and the redeem path resolves a code's
//! study with a short registry peek before taking locks in order.
//!
//! Every mutating operation writes the affected snapshot (`meta.json`
//! per study, `server.json` for codes) before returning, so a caller
//! only ever sees success once the last known good state is durable.
//! Bulk closes (cancel, revoke, timeout sweeps) write once per batch.
//!
//! Durable layout:
//!
//! ```text
//! <root>/server.json                — participant-code records
//! <root>/studies/<study>/meta.json  — per-study metadata
//! <root>/studies/<study>/runs/<run> — run data files, one per key
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use cohort_core::constants::{SERVER_META_FILE, STUDY_META_FILE};
use cohort_core::{CohortError, Result, SessionToken, StudyId};

use crate::codes::{CodeConstraints, CodeRecord, CodeRegistry};
use crate::run::RunConfig;
use crate::study::{Study, StudyMeta, StudyUpdate};

/// Result of redeeming a participant code.
#[derive(Clone, Debug)]
pub struct JoinOutcome {
    /// The study the code opened.
    pub study: StudyId,
    /// The session now bound to the caller.
    pub token: SessionToken,
    /// True when an existing live session was handed back.
    pub reattached: bool,
    /// Briefing page to show before the experiment, when configured.
    pub briefing_url: Option<String>,
}

/// Admin-facing summary of one study.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudySummary {
    /// Study id.
    pub id: StudyId,
    /// Admin identities.
    pub admins: Vec<String>,
    /// Whether a run is active.
    pub active: bool,
    /// Active run id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,
    /// Remaining capacity of the active run, when it has a size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_sessions: Option<u64>,
    /// Live sessions of the active run.
    pub live_sessions: usize,
    /// Whether a secret URL is currently issued.
    pub has_secret_url: bool,
}

/// The process-wide study store.
pub struct StudyStore {
    root: PathBuf,
    studies: RwLock<HashMap<StudyId, Arc<Mutex<Study>>>>,
    codes: Mutex<CodeRegistry>,
}

impl StudyStore {
    /// Open (or initialize) a store rooted at `root`.
    ///
    /// Loads every `studies/<id>/meta.json` and `server.json`, drops
    /// code records whose study no longer exists, and re-binds secret
    /// URLs to their active runs. Sessions open at snapshot time are
    /// gone; runs resume with their counters only.
    pub fn open(root: &Path) -> Result<Self> {
        let studies_dir = root.join("studies");
        std::fs::create_dir_all(&studies_dir)?;

        let mut studies = HashMap::new();
        for entry in std::fs::read_dir(&studies_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = StudyId::from(entry.file_name().to_string_lossy().into_owned());
            let dir = entry.path();
            let meta_path = dir.join(STUDY_META_FILE);
            match std::fs::read_to_string(&meta_path) {
                Ok(raw) => {
                    let meta: StudyMeta = serde_json::from_str(&raw)?;
                    info!(study = %id, active = meta.run.is_some(), "loaded study");
                    let _ = studies.insert(
                        id.clone(),
                        Arc::new(Mutex::new(Study::from_meta(id, dir, meta))),
                    );
                }
                Err(e) => warn!(study = %id, error = %e, "skipping study without metadata"),
            }
        }

        let server_path = root.join(SERVER_META_FILE);
        let mut registry = match std::fs::read_to_string(&server_path) {
            Ok(raw) => {
                let records: Vec<CodeRecord> = serde_json::from_str(&raw)?;
                CodeRegistry::from_records(records)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CodeRegistry::new(),
            Err(e) => return Err(e.into()),
        };

        // Drop records for deleted studies and re-bind secret URLs.
        let mut dropped = Vec::new();
        for record in registry.snapshot() {
            match studies.get(&record.study) {
                None => {
                    warn!(code = record.code, study = %record.study, "dropping code for unknown study");
                    dropped.push(record.code);
                }
                Some(handle) if record.is_secret_url => {
                    let mut study = handle.lock();
                    if study.set_secret_url(record.code.clone()).is_err() {
                        warn!(code = record.code, study = %record.study, "dropping secret URL of inactive run");
                        dropped.push(record.code);
                    }
                }
                Some(_) => {}
            }
        }
        for code in &dropped {
            let _ = registry.remove_code(code);
        }

        let store = Self {
            root: root.to_path_buf(),
            studies: RwLock::new(studies),
            codes: Mutex::new(registry),
        };
        if !dropped.is_empty() {
            store.persist_codes(&store.codes.lock())?;
        }
        Ok(store)
    }

    /// Data root this store persists under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ─────────────────────────────────────────────────────────────────
    // Study directory
    // ─────────────────────────────────────────────────────────────────

    fn study(&self, id: &StudyId) -> Result<Arc<Mutex<Study>>> {
        self.studies
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CohortError::not_found("study", id.as_str()))
    }

    /// Register a new study.
    pub fn create_study(&self, id: &StudyId, admins: Vec<String>) -> Result<()> {
        let mut studies = self.studies.write();
        if studies.contains_key(id) {
            return Err(CohortError::DuplicateName {
                name: id.to_string(),
            });
        }
        let dir = self.root.join("studies").join(id.as_str());
        std::fs::create_dir_all(&dir)?;
        let study = Study::new(id.clone(), dir, admins);
        self.persist_study(&study)?;
        info!(study = %id, "created study");
        let _ = studies.insert(id.clone(), Arc::new(Mutex::new(study)));
        Ok(())
    }

    /// Delete a study: cancel its run, drop its codes, remove its files.
    pub fn delete_study(&self, id: &StudyId) -> Result<()> {
        let handle = {
            let mut studies = self.studies.write();
            studies
                .remove(id)
                .ok_or_else(|| CohortError::not_found("study", id.as_str()))?
        };
        let dir = {
            let mut study = handle.lock();
            if study.is_active() {
                // Bulk close; no snapshot writes for a study being removed
                let _ = study.cancel_run()?;
            }
            study.dir().to_path_buf()
        };
        {
            let mut codes = self.codes.lock();
            codes.remove_study(id);
            self.persist_codes(&codes)?;
        }
        std::fs::remove_dir_all(&dir)?;
        info!(study = %id, "deleted study");
        Ok(())
    }

    /// Registered study ids, sorted.
    #[must_use]
    pub fn list_studies(&self) -> Vec<StudyId> {
        let mut ids: Vec<StudyId> = self.studies.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Admin-facing summary of one study.
    pub fn study_summary(&self, id: &StudyId) -> Result<StudySummary> {
        let handle = self.study(id)?;
        let study = handle.lock();
        Ok(StudySummary {
            id: id.clone(),
            admins: study.admins().iter().cloned().collect(),
            active: study.is_active(),
            run_id: study.run().map(crate::run::Run::id),
            remaining_sessions: study.run().and_then(crate::run::Run::remaining_sessions),
            live_sessions: study.run().map_or(0, crate::run::Run::live_sessions),
            has_secret_url: study.secret_url().is_some(),
        })
    }

    /// Whether `user` may edit the study.
    pub fn is_admin(&self, id: &StudyId, user: &str) -> Result<bool> {
        let handle = self.study(id)?;
        let editable = handle.lock().editable_by(user);
        Ok(editable)
    }

    // ─────────────────────────────────────────────────────────────────
    // Run lifecycle
    // ─────────────────────────────────────────────────────────────────

    /// Start a run on a study.
    pub fn start_run(&self, id: &StudyId, config: RunConfig) -> Result<u64> {
        let handle = self.study(id)?;
        let mut study = handle.lock();
        let run_id = study.start_run(config)?;
        self.persist_study(&study)?;
        Ok(run_id)
    }

    /// Cancel the active run: bulk-close everything, persist once.
    pub fn cancel_run(&self, id: &StudyId) -> Result<()> {
        let handle = self.study(id)?;
        let mut study = handle.lock();
        let update = study.cancel_run()?;
        self.persist_study(&study)?;
        self.notify_closed(id, &update)?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Session commands
    // ─────────────────────────────────────────────────────────────────

    /// Open an anonymous session (`access_type = anyone` only).
    pub fn open_session(
        &self,
        id: &StudyId,
        external: &BTreeMap<String, String>,
    ) -> Result<SessionToken> {
        self.open_session_at(id, external, Utc::now())
    }

    /// [`StudyStore::open_session`] with an explicit clock, for tests.
    pub fn open_session_at(
        &self,
        id: &StudyId,
        external: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<SessionToken> {
        let handle = self.study(id)?;
        let mut study = handle.lock();
        let swept = study.sweep_stale(now)?;

        let result = (|| -> Result<SessionToken> {
            let run = study.active_run()?;
            if !run.access_type().allows_anonymous() {
                return Err(CohortError::NotActive {
                    study: id.to_string(),
                });
            }
            Ok(run.open_session(external, now))
        })();

        if result.is_ok() || !swept.closed.is_empty() {
            self.persist_study(&study)?;
        }
        self.notify_closed(id, &swept)?;
        result
    }

    /// Close a session, returning the participant redirect if any.
    pub fn close_session(
        &self,
        id: &StudyId,
        token: &SessionToken,
        completed: bool,
    ) -> Result<Option<String>> {
        let handle = self.study(id)?;
        let mut study = handle.lock();
        let update = study.close_session(token, completed)?;
        self.persist_study(&study)?;
        let url = update.closed.first().and_then(|o| o.url.clone());
        self.notify_closed(id, &update)?;
        Ok(url)
    }

    /// Buffer a key/value pair on a live session.
    ///
    /// Nothing is written to disk here; data files land at close.
    pub fn save_data(
        &self,
        id: &StudyId,
        token: &SessionToken,
        key: &str,
        value: &str,
        save_format: &str,
    ) -> Result<()> {
        let handle = self.study(id)?;
        let mut study = handle.lock();
        study
            .active_run()?
            .session_mut(token)?
            .accept_data(key, value, save_format);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Participant codes
    // ─────────────────────────────────────────────────────────────────

    /// Issue an invite code for a study's active run.
    pub fn issue_invite(
        &self,
        id: &StudyId,
        code: Option<String>,
        constraints: CodeConstraints,
    ) -> Result<String> {
        let handle = self.study(id)?;
        let mut study = handle.lock();
        let access = study.active_run()?.access_type();
        if !access.allows_invites() {
            return Err(CohortError::InvalidConfig {
                message: format!("run access type {access:?} does not allow invites"),
            });
        }
        let mut codes = self.codes.lock();
        let code = codes.issue_invite(id, code, constraints)?;
        self.persist_codes(&codes)?;
        Ok(code)
    }

    /// Issue (or replace) the secret URL of a study's active run.
    pub fn issue_secret_url(&self, id: &StudyId, code: Option<String>) -> Result<String> {
        let handle = self.study(id)?;
        let mut study = handle.lock();
        let previous = study.secret_url().map(String::from);

        let mut codes = self.codes.lock();
        let code = codes.issue_secret_url(id, code)?;
        if let Err(e) = study.set_secret_url(code.clone()) {
            let _ = codes.remove_code(&code);
            return Err(e);
        }
        if let Some(old) = previous {
            let _ = codes.remove_code(&old);
        }
        self.persist_codes(&codes)?;
        Ok(code)
    }

    /// Drop a study's secret URL. Live sessions opened through it stay up.
    pub fn revoke_secret_url(&self, id: &StudyId) -> Result<()> {
        let handle = self.study(id)?;
        let mut study = handle.lock();
        if let Some(code) = study.take_secret_url() {
            let mut codes = self.codes.lock();
            let _ = codes.remove_code(&code);
            self.persist_codes(&codes)?;
        }
        Ok(())
    }

    /// Revoke every invite code of a study and bulk-close their
    /// sessions, with exactly one snapshot write per surface.
    pub fn revoke_invites(&self, id: &StudyId) -> Result<()> {
        let handle = self.study(id)?;
        let mut study = handle.lock();

        let orphaned = {
            let mut codes = self.codes.lock();
            let orphaned = codes.revoke_invites(id);
            self.persist_codes(&codes)?;
            orphaned
        };

        let mut removed_secret = None;
        for token in orphaned {
            match study.close_session(&token, false) {
                Ok(update) => {
                    if update.removed_secret.is_some() {
                        removed_secret = update.removed_secret;
                    }
                }
                // The run may retire mid-batch, dropping its remaining
                // sessions with it
                Err(CohortError::NotActive { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        self.persist_study(&study)?;

        if let Some(code) = removed_secret {
            let mut codes = self.codes.lock();
            let _ = codes.remove_code(&code);
            self.persist_codes(&codes)?;
        }
        Ok(())
    }

    /// Redeem a participant code.
    pub fn redeem_code(
        &self,
        code: &str,
        external: &BTreeMap<String, String>,
        caller_key: &str,
    ) -> Result<JoinOutcome> {
        self.redeem_code_at(code, external, caller_key, Utc::now())
    }

    /// [`StudyStore::redeem_code`] with an explicit clock, for tests.
    pub fn redeem_code_at(
        &self,
        code: &str,
        external: &BTreeMap<String, String>,
        caller_key: &str,
        now: DateTime<Utc>,
    ) -> Result<JoinOutcome> {
        // Short peek to find the study, then lock in study → registry order
        let study_id = self.codes.lock().study_of(code)?;
        let handle = self.study(&study_id)?;
        let mut study = handle.lock();

        let swept = study.sweep_stale(now)?;
        if !swept.closed.is_empty() {
            self.persist_study(&study)?;
        }

        let mut codes = self.codes.lock();
        let mut codes_changed = Self::apply_closed(&mut codes, &study_id, &swept);

        let result = codes.redeem(&mut study, code, external, caller_key, now);
        match &result {
            Ok(outcome) if !outcome.reattached => self.persist_study(&study)?,
            Err(CohortError::Expired { .. }) => codes_changed = true,
            _ => {}
        }
        if codes_changed {
            self.persist_codes(&codes)?;
        }

        let outcome = result?;
        Ok(JoinOutcome {
            briefing_url: study
                .run()
                .and_then(|r| r.briefing_url().map(String::from)),
            study: study_id,
            token: outcome.token,
            reattached: outcome.reattached,
        })
    }

    // ─────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────

    /// Fan a batch of closed sessions out to the code registry,
    /// persisting `server.json` once if anything changed.
    fn notify_closed(&self, id: &StudyId, update: &StudyUpdate) -> Result<()> {
        if update.closed.is_empty() && update.removed_secret.is_none() {
            return Ok(());
        }
        let mut codes = self.codes.lock();
        if Self::apply_closed(&mut codes, id, update) {
            self.persist_codes(&codes)?;
        }
        Ok(())
    }

    fn apply_closed(codes: &mut CodeRegistry, id: &StudyId, update: &StudyUpdate) -> bool {
        let mut changed = false;
        for outcome in &update.closed {
            changed |= codes.on_session_closed(id, &outcome.token);
        }
        if let Some(secret) = &update.removed_secret {
            changed |= codes.remove_code(secret).is_some();
        }
        changed
    }

    /// Write a study's `meta.json`.
    fn persist_study(&self, study: &Study) -> Result<()> {
        write_json(&study.dir().join(STUDY_META_FILE), &study.meta())
    }

    /// Write `server.json`.
    fn persist_codes(&self, codes: &CodeRegistry) -> Result<()> {
        write_json(&self.root.join(SERVER_META_FILE), &codes.snapshot())
    }

    /// Path of a run's data directory, for archiving.
    pub fn run_data_dir(&self, id: &StudyId, run_id: u64) -> Result<PathBuf> {
        let handle = self.study(id)?;
        let dir = handle.lock().dir().join("runs").join(run_id.to_string());
        if !dir.is_dir() {
            return Err(CohortError::not_found("run", run_id.to_string()));
        }
        Ok(dir)
    }
}

/// Serialize `value` to `path` atomically (write-temp-then-rename).
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::run::AccessType;

    fn config(access_type: AccessType) -> RunConfig {
        RunConfig {
            size: None,
            access_type,
            save_incomplete_data: false,
            completion_url: None,
            cancel_url: None,
            briefing_url: None,
            debriefing_url: None,
            session_args: BTreeMap::new(),
        }
    }

    fn no_params() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn create_is_unique_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        let store = StudyStore::open(dir.path()).unwrap();
        let id = StudyId::from("stroop");

        store.create_study(&id, vec!["ada".into()]).unwrap();
        assert_matches!(
            store.create_study(&id, vec![]),
            Err(CohortError::DuplicateName { .. })
        );
        assert!(dir.path().join("studies/stroop/meta.json").is_file());
    }

    #[test]
    fn anonymous_open_requires_anyone_access() {
        let dir = tempfile::tempdir().unwrap();
        let store = StudyStore::open(dir.path()).unwrap();
        let id = StudyId::from("stroop");
        store.create_study(&id, vec![]).unwrap();
        let _ = store.start_run(&id, config(AccessType::InviteOnly)).unwrap();

        assert_matches!(
            store.open_session(&id, &no_params()),
            Err(CohortError::NotActive { .. })
        );
    }

    #[test]
    fn restart_restores_runs_and_codes_but_not_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let id = StudyId::from("stroop");
        let invite;
        {
            let store = StudyStore::open(dir.path()).unwrap();
            store.create_study(&id, vec!["ada".into()]).unwrap();
            let _ = store.start_run(&id, config(AccessType::InviteAndUrl)).unwrap();
            invite = store
                .issue_invite(&id, None, CodeConstraints::default())
                .unwrap();
            let _ = store.issue_secret_url(&id, Some("s3cret".into())).unwrap();
            let _ = store.redeem_code(&invite, &no_params(), "caller").unwrap();
        }

        let store = StudyStore::open(dir.path()).unwrap();
        let summary = store.study_summary(&id).unwrap();
        assert!(summary.active);
        assert!(summary.has_secret_url);
        assert_eq!(summary.live_sessions, 0, "live sessions are not restored");

        // Both codes survived the restart
        let joined = store.redeem_code(&invite, &no_params(), "caller-2").unwrap();
        assert_eq!(joined.token.as_str(), "1", "token counter restarts");
        let joined = store.redeem_code("s3cret", &no_params(), "caller-3").unwrap();
        assert!(!joined.reattached);
    }

    #[test]
    fn delete_study_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let store = StudyStore::open(dir.path()).unwrap();
        let id = StudyId::from("stroop");
        store.create_study(&id, vec![]).unwrap();
        let _ = store.start_run(&id, config(AccessType::InviteOnly)).unwrap();
        let code = store
            .issue_invite(&id, None, CodeConstraints::default())
            .unwrap();

        store.delete_study(&id).unwrap();

        assert_matches!(
            store.study_summary(&id),
            Err(CohortError::NotFound { kind: "study", .. })
        );
        assert_matches!(
            store.redeem_code(&code, &no_params(), "caller"),
            Err(CohortError::NotFound { kind: "code", .. })
        );
        assert!(!dir.path().join("studies/stroop").exists());
    }

    #[test]
    fn stale_sessions_are_swept_on_the_next_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = StudyStore::open(dir.path()).unwrap();
        let id = StudyId::from("stroop");
        store.create_study(&id, vec![]).unwrap();
        let _ = store.start_run(&id, config(AccessType::Anyone)).unwrap();

        let past = Utc::now() - chrono::Duration::hours(3);
        let stale = store.open_session_at(&id, &no_params(), past).unwrap();
        let fresh = store.open_session(&id, &no_params()).unwrap();
        assert_ne!(stale, fresh);

        // The stale session is gone; data submission for it misses
        assert_matches!(
            store.save_data(&id, &stale, "k", "v", "CSV"),
            Err(CohortError::NotFound { kind: "session", .. })
        );
        assert!(store.save_data(&id, &fresh, "k", "v", "CSV").is_ok());
    }

    #[test]
    fn close_writes_data_files_and_returns_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let store = StudyStore::open(dir.path()).unwrap();
        let id = StudyId::from("stroop");
        store.create_study(&id, vec![]).unwrap();
        let mut cfg = config(AccessType::Anyone);
        cfg.completion_url = Some("https://pool.example/done".into());
        let run_id = store.start_run(&id, cfg).unwrap();

        let token = store.open_session(&id, &no_params()).unwrap();
        store.save_data(&id, &token, "trials", "1,2,3", "CSV").unwrap();
        let url = store.close_session(&id, &token, true).unwrap();

        assert_eq!(url.as_deref(), Some("https://pool.example/done"));
        let data = store.run_data_dir(&id, run_id).unwrap().join("trials");
        assert_eq!(std::fs::read_to_string(data).unwrap(), "1,2,3");
    }
}
