//! One participant's data-collection instance within a run.
//!
//! A session buffers submitted key/value pairs in memory; nothing
//! touches disk until close, when the run decides (from its
//! save-incomplete policy and the session's completion state) whether
//! [`Session::save_data`] runs. Close is terminal: the run removes the
//! session from its live set and the token is never reused.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cohort_core::{Result, SessionToken};

/// Live state of one participant session.
#[derive(Clone, Debug)]
pub struct Session {
    /// Token allocated by the owning run.
    pub token: SessionToken,
    /// Open time, for the staleness sweep.
    pub started_at: DateTime<Utc>,
    /// Set by close; drives save policy and the redirect override.
    pub is_complete: bool,
    /// Latched on the first non-trivial [`Session::accept_data`] call.
    pub has_data: bool,
    /// Session-argument values resolved from the run's template at open.
    pub resolved_args: BTreeMap<String, String>,
    data: BTreeMap<String, String>,
}

impl Session {
    /// Open a session with its resolved argument snapshot.
    #[must_use]
    pub fn new(
        token: SessionToken,
        started_at: DateTime<Utc>,
        resolved_args: BTreeMap<String, String>,
    ) -> Self {
        Self {
            token,
            started_at,
            is_complete: false,
            has_data: false,
            resolved_args,
            data: BTreeMap::new(),
        }
    }

    /// Buffer a key/value pair.
    ///
    /// Empty and placeholder-only values (whitespace, `undefined`) mean
    /// "no data supplied" and are dropped without latching `has_data`.
    pub fn accept_data(&mut self, key: &str, value: &str, save_format: &str) {
        if is_placeholder(value) {
            debug!(token = %self.token, key, "ignoring empty data value");
            return;
        }
        debug!(token = %self.token, key, save_format, "buffered session data");
        let _ = self.data.insert(key.to_string(), value.to_string());
        self.has_data = true;
    }

    /// Write each buffered key to its own file under `data_dir`.
    ///
    /// Keys containing `..`, `/`, or `~` are skipped with a warning (a
    /// path-traversal guard); the save continues past them. The write
    /// is best-effort per key only in that sense — a real I/O failure
    /// still aborts.
    pub fn save_data(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)?;
        for (key, value) in &self.data {
            if key.contains("..") || key.contains('/') || key.contains('~') {
                warn!(token = %self.token, key, "skipping unsafe data key");
                continue;
            }
            std::fs::write(data_dir.join(key), value)?;
            info!(token = %self.token, key, "wrote session data file");
        }
        Ok(())
    }

    /// Whether this session's data should be persisted at close.
    #[must_use]
    pub fn should_save(&self, save_incomplete_data: bool) -> bool {
        (self.is_complete || save_incomplete_data) && self.has_data
    }

    /// Whether this session counts toward the run's size limit and
    /// argument-balance counters.
    ///
    /// An incomplete session with data does not count unless the run
    /// saves incomplete data.
    #[must_use]
    pub fn is_countable(&self, save_incomplete_data: bool) -> bool {
        self.is_complete || (save_incomplete_data && self.has_data)
    }

    /// Buffered data, keyed by submitted name.
    #[must_use]
    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }
}

/// True for values that carry no actual data.
fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed == "undefined"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(SessionToken::from(1), Utc::now(), BTreeMap::new())
    }

    #[test]
    fn placeholder_values_do_not_latch_has_data() {
        let mut s = session();
        s.accept_data("trials", "", "CSV");
        s.accept_data("trials", "   ", "CSV");
        s.accept_data("trials", "undefined", "CSV");
        assert!(!s.has_data);
        assert!(s.data().is_empty());

        s.accept_data("trials", "1,2,3", "CSV");
        assert!(s.has_data);
        assert_eq!(s.data().get("trials").unwrap(), "1,2,3");
    }

    #[test]
    fn save_skips_traversal_keys_but_writes_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session();
        s.accept_data("ok", "1", "CSV");
        s.accept_data("../bad", "2", "CSV");
        s.accept_data("a/b", "3", "CSV");
        s.accept_data("~x", "4", "CSV");

        s.save_data(dir.path()).unwrap();

        let written: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(written, vec!["ok".to_string()]);
        assert_eq!(std::fs::read_to_string(dir.path().join("ok")).unwrap(), "1");
    }

    #[test]
    fn save_policy_combines_completion_and_data() {
        let mut s = session();
        s.is_complete = true;
        assert!(!s.should_save(false), "complete but no data");

        s.accept_data("k", "v", "CSV");
        assert!(s.should_save(false));

        s.is_complete = false;
        assert!(!s.should_save(false));
        assert!(s.should_save(true));
    }

    #[test]
    fn countable_policy() {
        let mut s = session();
        s.is_complete = true;
        assert!(s.is_countable(false));

        s.is_complete = false;
        s.accept_data("k", "v", "CSV");
        assert!(!s.is_countable(false), "incomplete data does not count");
        assert!(s.is_countable(true));
    }
}
