use axum::{
    extract::{Path, State},
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    Json,
};
use axum_extra::headers::{authorization::Bearer, Authorization, Cookie};
use axum_extra::TypedHeader;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{enforce_rate_limit, to_iso};
use crate::{
    auth::{
        build_clear_session_cookie, build_session_cookie, client_ip, password, CurrentSession,
        IssuedSession, SESSION_COOKIE_NAME,
    },
    error::{AppError, AppResult},
    models::{Organisation, SessionKind},
    rate_limit::RateLimitPolicy,
    repo::{AssetRepository, OrganisationRepository},
    state::AppState,
};

#[derive(Deserialize)]
pub struct AdminLoginRequest {
    pub password: String,
}

#[derive(Deserialize)]
pub struct FieldAccessRequest {
    pub asset_token: String,
    pub access_code: String,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub org_id: Uuid,
    pub org_slug: String,
    pub kind: &'static str,
    pub expires_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl SessionResponse {
    pub(crate) fn issued(org: &Organisation, kind: SessionKind, issued: &IssuedSession) -> Self {
        Self {
            org_id: org.id,
            org_slug: org.slug.clone(),
            kind: kind.as_str(),
            expires_at: to_iso(issued.expires_at()),
            token: Some(issued.raw_token.clone()),
        }
    }
}

/// Sets the session cookie for a freshly issued session.
pub(crate) fn session_cookie_headers(
    state: &AppState,
    issued: &IssuedSession,
) -> AppResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        build_session_cookie(
            &state.config,
            &issued.raw_token,
            issued.expires_at(),
            Utc::now().naive_utc(),
        )?,
    );
    Ok(headers)
}

/// Unknown organisations and wrong passwords are indistinguishable.
pub async fn admin_login(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    request_headers: HeaderMap,
    Json(payload): Json<AdminLoginRequest>,
) -> AppResult<(HeaderMap, Json<SessionResponse>)> {
    let ip = client_ip(&request_headers);
    enforce_rate_limit(&state, RateLimitPolicy::admin_login(), &ip)?;

    let org = state
        .repo
        .find_organisation_by_slug(&slug.to_ascii_lowercase())?
        .ok_or_else(AppError::invalid_credentials)?;

    let valid = password::verify_secret(&payload.password, &org.admin_secret_hash)
        .map_err(|_| AppError::invalid_credentials())?;
    if !valid {
        warn!(org_id = %org.id, client_ip = %ip, "admin login rejected");
        return Err(AppError::invalid_credentials());
    }

    let issued = state.sessions.issue(org.id, SessionKind::Admin)?;
    info!(org_id = %org.id, "admin session issued");

    let headers = session_cookie_headers(&state, &issued)?;
    Ok((
        headers,
        Json(SessionResponse::issued(&org, SessionKind::Admin, &issued)),
    ))
}

/// Redeems an organisation's shared access code, reached through one of its
/// asset tokens, for a field session.
pub async fn field_access(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Json(payload): Json<FieldAccessRequest>,
) -> AppResult<(HeaderMap, Json<SessionResponse>)> {
    let ip = client_ip(&request_headers);
    enforce_rate_limit(&state, RateLimitPolicy::field_access(), &ip)?;

    let token = payload.asset_token.trim();
    if token.is_empty() {
        return Err(AppError::invalid_credentials());
    }
    let asset = state
        .repo
        .find_asset_by_public_token(token)?
        .ok_or_else(AppError::invalid_credentials)?;
    let org = state
        .repo
        .find_organisation(asset.org_id)?
        .ok_or_else(AppError::invalid_credentials)?;

    let valid = password::verify_secret(&payload.access_code, &org.access_code_hash)
        .map_err(|_| AppError::invalid_credentials())?;
    if !valid {
        warn!(org_id = %org.id, client_ip = %ip, "access code rejected");
        return Err(AppError::invalid_credentials());
    }

    let issued = state.sessions.issue(org.id, SessionKind::Field)?;
    info!(org_id = %org.id, asset_id = %asset.id, "field session issued");

    let headers = session_cookie_headers(&state, &issued)?;
    Ok((
        headers,
        Json(SessionResponse::issued(&org, SessionKind::Field, &issued)),
    ))
}

/// Revokes whatever token was presented, valid or not, and clears the cookie.
pub async fn logout(
    State(state): State<AppState>,
    jar: Option<TypedHeader<Cookie>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> AppResult<(HeaderMap, StatusCode)> {
    let cookie_token = jar
        .as_ref()
        .and_then(|TypedHeader(cookies)| cookies.get(SESSION_COOKIE_NAME))
        .map(str::to_string);
    let bearer_token = bearer.map(|TypedHeader(Authorization(bearer))| bearer.token().to_string());

    for token in cookie_token.into_iter().chain(bearer_token) {
        state.sessions.revoke(&token)?;
    }

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, build_clear_session_cookie(&state.config)?);
    Ok((headers, StatusCode::NO_CONTENT))
}

pub async fn current_session(
    State(state): State<AppState>,
    current: CurrentSession,
) -> AppResult<Json<SessionResponse>> {
    let org = state
        .repo
        .find_organisation(current.org_id())?
        .ok_or_else(AppError::unauthorized)?;
    let kind = current.kind().ok_or_else(AppError::unauthorized)?;

    Ok(Json(SessionResponse {
        org_id: org.id,
        org_slug: org.slug,
        kind: kind.as_str(),
        expires_at: to_iso(current.session.expires_at),
        token: None,
    }))
}
