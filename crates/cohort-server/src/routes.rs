//! HTTP surface: participant commands, the join flow, and the admin API.
//!
//! The participant-facing command endpoint mirrors the experiment
//! runner's wire protocol: form-encoded fields with a `command`
//! discriminator and a flat JSON object back. The admin API is JSON and
//! guarded by [`crate::auth::SessionAuth`] keys in the `x-session-key`
//! header.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::error;

use cohort_core::{CohortError, SessionToken, StudyId};
use cohort_study::codes::CodeConstraints;
use cohort_study::run::{AccessType, RunConfig};
use cohort_study::store::StudyStore;

use crate::auth::{AuthError, SessionAuth};
use crate::config::ServerConfig;

// ─────────────────────────────────────────────────────────────────────────────
// State and errors
// ─────────────────────────────────────────────────────────────────────────────

/// Shared server state.
pub struct AppState {
    /// The authoritative study store.
    pub store: StudyStore,
    /// Admin session authenticator.
    pub auth: SessionAuth,
    /// Static-asset directory, when configured.
    pub assets_dir: Option<std::path::PathBuf>,
}

impl AppState {
    /// Assemble state from a loaded configuration.
    pub fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        Ok(Self {
            store: StudyStore::open(&config.data_root)?,
            auth: SessionAuth::new(
                config.users.clone(),
                config.lockout_attempts,
                Duration::minutes(config.lockout_minutes),
            ),
            assets_dir: config.assets_dir.clone(),
        })
    }
}

/// Boundary error: maps core failures and auth failures to statuses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A core lifecycle failure.
    #[error(transparent)]
    Core(#[from] CohortError),
    /// Missing or invalid session key.
    #[error("authentication required")]
    Unauthorized,
    /// Authenticated but not an admin of the study.
    #[error("not an admin of this study")]
    Forbidden,
    /// Login refused during a lockout window.
    #[error("account locked, try again later")]
    Locked,
    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Core(core) => match core {
                CohortError::NotFound { .. } => StatusCode::NOT_FOUND,
                CohortError::Expired { .. } => StatusCode::GONE,
                CohortError::NotActive { .. } => StatusCode::FORBIDDEN,
                CohortError::AlreadyActive { .. } | CohortError::DuplicateName { .. } => {
                    StatusCode::CONFLICT
                }
                CohortError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
                CohortError::Io(_) | CohortError::Json(_) => {
                    error!(error = %core, "internal failure");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Locked => StatusCode::TOO_MANY_REQUESTS,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn require_param<'a>(params: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str, ApiError> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ApiError::BadRequest(format!("missing required field '{key}'")))
}

/// Resolve the `x-session-key` header to an authenticated user.
fn require_user(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-session-key")
        .and_then(|v| v.to_str().ok())
        .and_then(|key| state.auth.user_for(key))
        .ok_or(ApiError::Unauthorized)
}

/// Authenticated user who is also an admin of `study`.
fn require_study_admin(
    state: &AppState,
    headers: &HeaderMap,
    study: &StudyId,
) -> Result<String, ApiError> {
    let user = require_user(state, headers)?;
    if !state.store.is_admin(study, &user)? {
        return Err(ApiError::Forbidden);
    }
    Ok(user)
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Build the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    let assets_dir = state.assets_dir.clone();
    let mut router = Router::new()
        .route("/study/{study}/server", post(study_command))
        .route("/join/{code}", get(join))
        .route("/admin/login", post(login))
        .route("/admin/logout", post(logout))
        .route("/admin/studies", get(list_studies).post(create_study))
        .route(
            "/admin/studies/{study}",
            get(study_summary).delete(delete_study),
        )
        .route(
            "/admin/studies/{study}/run",
            post(start_run).delete(cancel_run),
        )
        .route(
            "/admin/studies/{study}/invites",
            post(issue_invite).delete(revoke_invites),
        )
        .route(
            "/admin/studies/{study}/secret-url",
            post(issue_secret_url).delete(revoke_secret_url),
        )
        .route(
            "/admin/studies/{study}/runs/{run}/archive",
            get(download_archive),
        )
        .with_state(state);
    if let Some(dir) = assets_dir {
        router = router.nest_service("/assets", ServeDir::new(dir));
    }
    router.layer(TraceLayer::new_for_http())
}

// ─────────────────────────────────────────────────────────────────────────────
// Participant endpoints
// ─────────────────────────────────────────────────────────────────────────────

/// The experiment runner's command endpoint.
///
/// `open_session` treats every extra form field as an external session
/// parameter (the `URL(…)` argument source).
async fn study_command(
    State(state): State<Arc<AppState>>,
    Path(study): Path<String>,
    Form(params): Form<BTreeMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let id = StudyId::from(study);
    let command = require_param(&params, "command")?;

    match command {
        "open_session" => {
            let token = state.store.open_session(&id, &params)?;
            Ok(Json(json!({ "token": token })))
        }
        "close_session" => {
            let token = SessionToken::from(require_param(&params, "token")?);
            let completed = params.get("isCompleted").is_some_and(|v| v == "true");
            let url = state.store.close_session(&id, &token, completed)?;
            match url {
                Some(url) => Ok(Json(json!({ "url": url }))),
                None => Ok(Json(json!({}))),
            }
        }
        "save_data" => {
            let token = SessionToken::from(require_param(&params, "token")?);
            let key = require_param(&params, "key")?;
            let value = require_param(&params, "value")?;
            let save_format = params.get("saveFormat").map_or("", String::as_str);
            state.store.save_data(&id, &token, key, value, save_format)?;
            Ok(Json(json!({})))
        }
        other => Err(ApiError::BadRequest(format!("unknown command '{other}'"))),
    }
}

/// Redeem a participant code.
///
/// `key` identifies the caller (one live session per key); the other
/// query parameters feed the session-argument template.
async fn join(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let caller_key = require_param(&params, "key")?.to_string();
    let outcome = state.store.redeem_code(&code, &params, &caller_key)?;

    let mut body = json!({
        "study": outcome.study,
        "token": outcome.token,
        "reattached": outcome.reattached,
    });
    if let Some(url) = outcome.briefing_url {
        body["briefingUrl"] = json!(url);
    }
    Ok(Json(body))
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin: sessions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LoginRequest {
    user: String,
    password: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    match state.auth.authenticate(&request.user, &request.password) {
        Ok(key) => Ok(Json(json!({ "key": key }))),
        Err(AuthError::Denied) => Err(ApiError::Unauthorized),
        Err(AuthError::Locked) => Err(ApiError::Locked),
    }
}

async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> StatusCode {
    if let Some(key) = headers.get("x-session-key").and_then(|v| v.to_str().ok()) {
        state.auth.revoke(key);
    }
    StatusCode::NO_CONTENT
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin: studies and runs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateStudyRequest {
    id: String,
    #[serde(default)]
    admins: Vec<String>,
}

async fn create_study(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateStudyRequest>,
) -> Result<StatusCode, ApiError> {
    let user = require_user(&state, &headers)?;
    let mut admins = request.admins;
    if !admins.contains(&user) {
        admins.push(user);
    }
    state
        .store
        .create_study(&StudyId::from(request.id), admins)?;
    Ok(StatusCode::CREATED)
}

async fn list_studies(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = require_user(&state, &headers)?;
    let mut studies = Vec::new();
    for id in state.store.list_studies() {
        if state.store.is_admin(&id, &user).unwrap_or(false) {
            studies.push(state.store.study_summary(&id)?);
        }
    }
    Ok(Json(json!({ "studies": studies })))
}

async fn study_summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(study): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = StudyId::from(study);
    let _ = require_study_admin(&state, &headers, &id)?;
    let summary = state.store.study_summary(&id)?;
    Ok(Json(serde_json::to_value(summary).map_err(CohortError::from)?))
}

async fn delete_study(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(study): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = StudyId::from(study);
    let _ = require_study_admin(&state, &headers, &id)?;
    state.store.delete_study(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRunRequest {
    #[serde(default)]
    size: Option<u64>,
    access_type: String,
    #[serde(default)]
    save_incomplete_data: bool,
    #[serde(default)]
    completion_url: Option<String>,
    #[serde(default)]
    cancel_url: Option<String>,
    #[serde(default)]
    briefing_url: Option<String>,
    #[serde(default)]
    debriefing_url: Option<String>,
    #[serde(default)]
    session_args: BTreeMap<String, String>,
}

async fn start_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(study): Path<String>,
    Json(request): Json<StartRunRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = StudyId::from(study);
    let _ = require_study_admin(&state, &headers, &id)?;

    let config = RunConfig {
        size: request.size,
        access_type: AccessType::parse(&request.access_type)?,
        save_incomplete_data: request.save_incomplete_data,
        completion_url: request.completion_url,
        cancel_url: request.cancel_url,
        briefing_url: request.briefing_url,
        debriefing_url: request.debriefing_url,
        session_args: request.session_args,
    };
    let run_id = state.store.start_run(&id, config)?;
    Ok(Json(json!({ "runId": run_id })))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(study): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = StudyId::from(study);
    let _ = require_study_admin(&state, &headers, &id)?;
    state.store.cancel_run(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin: participant codes and archives
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InviteRequest {
    /// Caller-supplied code; omitted means generate one.
    #[serde(default)]
    code: Option<String>,
    /// Expiry relative to now, in minutes.
    #[serde(default)]
    timeout_minutes: Option<i64>,
    #[serde(default)]
    session_limit: Option<u64>,
    #[serde(default)]
    unique_session: bool,
}

async fn issue_invite(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(study): Path<String>,
    Json(request): Json<InviteRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = StudyId::from(study);
    let _ = require_study_admin(&state, &headers, &id)?;

    let constraints = CodeConstraints {
        expires_at: request.timeout_minutes.map(|m| Utc::now() + Duration::minutes(m)),
        session_limit: request.session_limit,
        unique_session: request.unique_session,
    };
    let code = state.store.issue_invite(&id, request.code, constraints)?;
    Ok(Json(json!({ "code": code })))
}

async fn revoke_invites(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(study): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = StudyId::from(study);
    let _ = require_study_admin(&state, &headers, &id)?;
    state.store.revoke_invites(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Default)]
struct SecretUrlRequest {
    #[serde(default)]
    code: Option<String>,
}

async fn issue_secret_url(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(study): Path<String>,
    Json(request): Json<SecretUrlRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = StudyId::from(study);
    let _ = require_study_admin(&state, &headers, &id)?;
    let code = state.store.issue_secret_url(&id, request.code)?;
    Ok(Json(json!({ "code": code })))
}

async fn revoke_secret_url(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(study): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = StudyId::from(study);
    let _ = require_study_admin(&state, &headers, &id)?;
    state.store.revoke_secret_url(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stream a run's data directory as a gzip tarball.
async fn download_archive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((study, run)): Path<(String, u64)>,
) -> Result<Response, ApiError> {
    let id = StudyId::from(study);
    let _ = require_study_admin(&state, &headers, &id)?;

    let data_dir = state.store.run_data_dir(&id, run)?;
    let prefix = format!("{}-run-{run}", id.as_str());
    let bytes = tokio::task::spawn_blocking(move || crate::archive::archive_dir(&data_dir, &prefix))
        .await
        .map_err(|e| CohortError::Io(std::io::Error::other(e)))??;

    let filename = format!("{}-run-{run}.tar.gz", id.as_str());
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}
