//! # cohort-core
//!
//! Foundation types, errors, branded IDs, and utilities for the cohort
//! study server.
//!
//! This crate provides the shared vocabulary the other cohort crates
//! depend on:
//!
//! - **Branded IDs**: [`ids::StudyId`], [`ids::SessionToken`] as newtypes
//! - **Errors**: [`errors::CohortError`] hierarchy via `thiserror`
//! - **Constants**: [`constants::session_timeout`] and friends
//! - **Logging**: [`logging::init`] for `tracing-subscriber` setup
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `cohort-study` and `cohort-server`.

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod ids;
pub mod logging;

pub use errors::{CohortError, Result};
pub use ids::{StudyId, SessionToken};
