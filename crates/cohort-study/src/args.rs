//! Session-argument templates and balanced value resolution.
//!
//! A run carries a template map of key → expression. At session open,
//! each expression resolves to a concrete value recorded on the session:
//!
//! - `URL(name)` — taken from the caller-supplied request parameters;
//!   when `name` is absent the key is omitted from the session.
//! - `uniform(v1, v2, …)` — the candidate with the lowest usage count so
//!   far, chosen uniformly at random among ties. Because later picks
//!   favor under-represented values, condition balance is
//!   self-correcting over time.
//! - anything else — the literal text, as-is.

use std::collections::BTreeMap;

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

/// Per-key, per-value usage counters, persisted with the run so a
/// restart resumes with identical balancing state.
pub type ArgCounts = BTreeMap<String, BTreeMap<String, u64>>;

/// A parsed session-argument expression.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgSpec {
    /// `URL(name)` — pull `name` from the request parameters.
    UrlParam(String),
    /// `uniform(a, b, …)` — balanced choice over the candidates.
    Uniform(Vec<String>),
    /// A literal value.
    Literal(String),
}

impl ArgSpec {
    /// Parse a template expression.
    ///
    /// Unrecognized or malformed `URL(…)`/`uniform(…)` forms fall back
    /// to [`ArgSpec::Literal`]; an empty candidate list does too.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if let Some(inner) = enclosed(raw, "URL(") {
            let name = inner.trim();
            if !name.is_empty() {
                return Self::UrlParam(name.to_string());
            }
        }
        if let Some(inner) = enclosed(raw, "uniform(") {
            let candidates: Vec<String> = inner
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
            if !candidates.is_empty() {
                return Self::Uniform(candidates);
            }
        }
        Self::Literal(raw.to_string())
    }

    /// Resolve this expression to a value, if any.
    ///
    /// `external` holds the caller-supplied request parameters; `used`
    /// the usage counts for this key so far.
    #[must_use]
    pub fn resolve(
        &self,
        external: &BTreeMap<String, String>,
        used: Option<&BTreeMap<String, u64>>,
    ) -> Option<String> {
        match self {
            Self::UrlParam(name) => external.get(name).cloned(),
            Self::Uniform(candidates) => Some(pick_least_used(candidates, used)),
            Self::Literal(value) => Some(value.clone()),
        }
    }
}

/// Strip `prefix` and a trailing `)` from `raw`, returning the inside.
fn enclosed<'a>(raw: &'a str, prefix: &str) -> Option<&'a str> {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(')'))
}

/// Pick the least-used candidate, random among ties.
fn pick_least_used(candidates: &[String], used: Option<&BTreeMap<String, u64>>) -> String {
    let count_of = |c: &String| used.and_then(|m| m.get(c)).copied().unwrap_or(0);
    let min = candidates.iter().map(count_of).min().unwrap_or(0);
    let tied: Vec<&String> = candidates.iter().filter(|c| count_of(c) == min).collect();
    let mut rng = rand::rng();
    // `tied` is never empty: the minimum was taken over the same list.
    (*tied.choose(&mut rng).unwrap_or(&&candidates[0])).clone()
}
