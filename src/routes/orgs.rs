use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use serde::Deserialize;

use super::auth::{session_cookie_headers, SessionResponse};
use super::enforce_rate_limit;
use crate::{
    auth::client_ip,
    error::AppResult,
    models::SessionKind,
    orgs::{create_organisation, OrganisationInput},
    rate_limit::RateLimitPolicy,
    state::AppState,
};

#[derive(Deserialize)]
pub struct CreateOrgRequest {
    pub name: String,
    pub slug: String,
    pub admin_password: String,
    pub access_code: String,
}

/// Self-service signup. The creator is logged in as admin straight away.
pub async fn create_org(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    Json(payload): Json<CreateOrgRequest>,
) -> AppResult<(StatusCode, HeaderMap, Json<SessionResponse>)> {
    let ip = client_ip(&request_headers);
    enforce_rate_limit(&state, RateLimitPolicy::org_create(), &ip)?;

    let org = create_organisation(
        state.repo.as_ref(),
        &state.config,
        OrganisationInput {
            name: payload.name,
            slug: payload.slug,
            admin_password: payload.admin_password,
            access_code: payload.access_code,
        },
    )?;

    let issued = state.sessions.issue(org.id, SessionKind::Admin)?;
    let headers = session_cookie_headers(&state, &issued)?;

    Ok((
        StatusCode::CREATED,
        headers,
        Json(SessionResponse::issued(&org, SessionKind::Admin, &issued)),
    ))
}
