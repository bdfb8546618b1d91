//! Shared constants.

use chrono::Duration;

/// Age after which a live session is force-closed as incomplete.
///
/// Enforced lazily: the sweep runs at the start of the next
/// `open_session` for the run, not on a background timer.
#[must_use]
pub fn session_timeout() -> Duration {
    Duration::hours(2)
}

/// Length of generated participant codes, in alphanumeric characters.
pub const CODE_LENGTH: usize = 32;

/// File name of the per-study metadata snapshot.
pub const STUDY_META_FILE: &str = "meta.json";

/// File name of the server-wide participant-code snapshot.
pub const SERVER_META_FILE: &str = "server.json";
