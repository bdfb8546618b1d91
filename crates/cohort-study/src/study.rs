//! A named experiment and its run state machine.
//!
//! `Inactive --start_run--> Active --(cancel | size reached)--> Inactive`.
//! While active the study exposes its single run; while inactive every
//! session operation fails `NotActive`. The secret-URL code's lifetime
//! is tied to the active run: finishing the run removes it (the store
//! propagates the removal to the code registry).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use cohort_core::{CohortError, Result, StudyId};

use crate::run::{CloseOutcome, Run, RunConfig, RunSnapshot};

/// Persisted per-study metadata (`meta.json`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StudyMeta {
    /// Admin identities allowed to edit this study.
    pub admins: Vec<String>,
    /// Next run id to allocate; monotonic per study.
    pub next_run_id: u64,
    /// The active run, when there is one.
    #[serde(default)]
    pub run: Option<RunSnapshot>,
}

/// What a study-level mutation produced, for the store to fan out to
/// the code registry and the snapshot writer.
#[derive(Debug, Default)]
pub struct StudyUpdate {
    /// Sessions closed by the operation, in close order.
    pub closed: Vec<CloseOutcome>,
    /// Id of the run that finished, if one did.
    pub finished_run: Option<u64>,
    /// Secret-URL code to drop from the registry, if the run finished
    /// while one was issued.
    pub removed_secret: Option<String>,
}

/// A named experiment definition owning at most one active run.
#[derive(Debug)]
pub struct Study {
    id: StudyId,
    dir: PathBuf,
    admins: BTreeSet<String>,
    secret_url: Option<String>,
    next_run_id: u64,
    run: Option<Run>,
}

impl Study {
    /// Register a new study rooted at `dir`.
    #[must_use]
    pub fn new(id: StudyId, dir: PathBuf, admins: Vec<String>) -> Self {
        Self {
            id,
            dir,
            admins: admins.into_iter().collect(),
            secret_url: None,
            next_run_id: 1,
            run: None,
        }
    }

    /// Rebuild a study from its persisted metadata.
    ///
    /// The secret-URL slot is re-bound by the store from `server.json`.
    #[must_use]
    pub fn from_meta(id: StudyId, dir: PathBuf, meta: StudyMeta) -> Self {
        Self {
            id,
            dir,
            admins: meta.admins.into_iter().collect(),
            secret_url: None,
            next_run_id: meta.next_run_id,
            run: meta.run.map(Run::from_snapshot),
        }
    }

    /// Durable metadata snapshot.
    #[must_use]
    pub fn meta(&self) -> StudyMeta {
        StudyMeta {
            admins: self.admins.iter().cloned().collect(),
            next_run_id: self.next_run_id,
            run: self.run.as_ref().map(Run::snapshot),
        }
    }

    /// Study id.
    #[must_use]
    pub fn id(&self) -> &StudyId {
        &self.id
    }

    /// Study directory (metadata and run data live under it).
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether a run is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.run.is_some()
    }

    /// The active run, if any.
    #[must_use]
    pub fn run(&self) -> Option<&Run> {
        self.run.as_ref()
    }

    /// The active run, or `NotActive`.
    pub fn active_run(&mut self) -> Result<&mut Run> {
        let id = self.id.to_string();
        self.run
            .as_mut()
            .ok_or(CohortError::NotActive { study: id })
    }

    /// Whether `user` may edit this study.
    #[must_use]
    pub fn editable_by(&self, user: &str) -> bool {
        self.admins.contains(user)
    }

    /// Grant `user` admin rights. Returns false when already present.
    pub fn add_admin(&mut self, user: &str) -> bool {
        self.admins.insert(user.to_string())
    }

    /// Admin identities, sorted.
    #[must_use]
    pub fn admins(&self) -> &BTreeSet<String> {
        &self.admins
    }

    /// Currently issued secret-URL code.
    #[must_use]
    pub fn secret_url(&self) -> Option<&str> {
        self.secret_url.as_deref()
    }

    /// Bind a secret-URL code to the active run.
    pub fn set_secret_url(&mut self, code: String) -> Result<()> {
        let access = self.active_run()?.access_type();
        if !access.allows_secret_url() {
            return Err(CohortError::InvalidConfig {
                message: format!("run access type {access:?} does not allow a secret URL"),
            });
        }
        self.secret_url = Some(code);
        Ok(())
    }

    /// Drop the secret-URL code, returning it for registry cleanup.
    pub fn take_secret_url(&mut self) -> Option<String> {
        self.secret_url.take()
    }

    /// Activate a run.
    ///
    /// Fails `AlreadyActive` when one is running and `InvalidConfig`
    /// for a zero size. Creates the run's data directory.
    pub fn start_run(&mut self, config: RunConfig) -> Result<u64> {
        if self.run.is_some() {
            return Err(CohortError::AlreadyActive {
                study: self.id.to_string(),
            });
        }
        if config.size == Some(0) {
            return Err(CohortError::InvalidConfig {
                message: "run size must be at least 1".into(),
            });
        }

        let run_id = self.next_run_id;
        self.next_run_id += 1;
        let data_path = self.dir.join("runs").join(run_id.to_string());
        std::fs::create_dir_all(&data_path)?;

        info!(study = %self.id, run = run_id, "starting run");
        self.run = Some(Run::new(run_id, data_path, config));
        Ok(run_id)
    }

    /// Close one session, retiring the run if it reached its size.
    pub fn close_session(
        &mut self,
        token: &cohort_core::SessionToken,
        completed: bool,
    ) -> Result<StudyUpdate> {
        let outcome = self.active_run()?.close_session(token, completed)?;
        let mut update = StudyUpdate {
            closed: vec![outcome],
            ..StudyUpdate::default()
        };
        if update.closed[0].finished {
            self.finish_run(&mut update)?;
        }
        Ok(update)
    }

    /// Expire stale sessions of the active run (no-op when inactive).
    ///
    /// A sweep can retire the run: timed-out sessions closed with data
    /// under `save_incomplete_data` still count toward the size.
    pub fn sweep_stale(&mut self, now: chrono::DateTime<chrono::Utc>) -> Result<StudyUpdate> {
        let mut update = StudyUpdate::default();
        if let Some(run) = self.run.as_mut() {
            update.closed = run.sweep_stale(now)?;
            if update.closed.iter().any(|c| c.finished) {
                self.finish_run(&mut update)?;
            }
        }
        Ok(update)
    }

    /// Cancel the active run: bulk-close all sessions, then retire it.
    pub fn cancel_run(&mut self) -> Result<StudyUpdate> {
        if self.run.is_none() {
            return Err(CohortError::NotActive {
                study: self.id.to_string(),
            });
        }
        let mut update = StudyUpdate::default();
        self.finish_run(&mut update)?;
        Ok(update)
    }

    /// Retire the active run and its secret URL.
    ///
    /// Sessions still live when the run retires are force-closed as
    /// incomplete first and appended to the close batch, so the store
    /// unbinds them from the code registry like any other close.
    fn finish_run(&mut self, update: &mut StudyUpdate) -> Result<()> {
        if let Some(run) = self.run.as_mut() {
            update.closed.extend(run.cancel()?);
        }
        if let Some(run) = self.run.take() {
            info!(study = %self.id, run = run.id(), "run finished");
            update.finished_run = Some(run.id());
            update.removed_secret = self.secret_url.take();
        }
        Ok(())
    }
}
