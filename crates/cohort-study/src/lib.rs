//! # cohort-study
//!
//! The study/run/session/participant-code lifecycle manager.
//!
//! A [`store::StudyStore`] is the single authoritative in-memory state
//! surface: a directory of studies, each owning at most one active
//! [`run::Run`], which owns the live [`session::Session`] set. Access
//! codes live in a server-wide [`codes::CodeRegistry`].
//!
//! Ownership is a tree (store → study → run → session); components hold
//! ids, not back-references, and cross-entity effects (a finished run
//! dropping its secret URL, a closed session crediting its code) are
//! fanned out by the store. Mutations are serialized per study; every
//! mutating operation writes the affected JSON snapshot before the
//! caller sees success.
//!
//! ## Crate Position
//!
//! Domain crate. Depends on `cohort-core`; `cohort-server` sits on top.

#![deny(unsafe_code)]

pub mod args;
pub mod codes;
pub mod run;
pub mod session;
pub mod store;
pub mod study;

pub use codes::{CodeConstraints, CodeKind, RedeemOutcome};
pub use run::{AccessType, Run, RunConfig, RunSnapshot};
pub use session::Session;
pub use store::StudyStore;
pub use study::{Study, StudyMeta};
