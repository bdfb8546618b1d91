//! # cohort-server
//!
//! HTTP boundary for the cohort study server: the participant command
//! endpoint and join flow, the admin API with session-key auth, static
//! asset serving, and run-data archives. All lifecycle semantics live
//! in `cohort-study`; this crate only translates wire requests into
//! store calls and core errors into status codes.

#![deny(unsafe_code)]

pub mod archive;
pub mod auth;
pub mod config;
pub mod routes;

pub use config::ServerConfig;
pub use routes::{router, ApiError, AppState};
