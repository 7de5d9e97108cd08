pub mod password;
pub mod session;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, HeaderValue},
};
use axum_extra::headers::{authorization::Bearer, Authorization, Cookie};
use axum_extra::TypedHeader;
use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    error::AppError,
    models::{Session, SessionKind},
    state::AppState,
};

pub use session::{IssuedSession, SessionManager};

pub const SESSION_COOKIE_NAME: &str = "session";

/// A validated session presented by cookie or bearer token.
#[derive(Debug, Clone)]
pub struct CurrentSession {
    pub session: Session,
    pub raw_token: String,
}

impl CurrentSession {
    pub fn org_id(&self) -> Uuid {
        self.session.org_id
    }

    pub fn kind(&self) -> Option<SessionKind> {
        self.session.kind()
    }

    pub fn require_admin_for(&self, org_id: Uuid) -> Result<(), AppError> {
        if self.session.org_id != org_id {
            // Sessions of another tenant look the same as no session.
            return Err(AppError::unauthorized());
        }
        if !self.session.is_admin_for(org_id) {
            return Err(AppError::forbidden("admin session required"));
        }
        Ok(())
    }
}

/// Reads the raw token from the `session` cookie, falling back to an
/// `Authorization: Bearer` header.
pub async fn presented_token(parts: &mut Parts, state: &AppState) -> Option<String> {
    if let Ok(TypedHeader(cookies)) =
        TypedHeader::<Cookie>::from_request_parts(parts, state).await
    {
        if let Some(value) = cookies.get(SESSION_COOKIE_NAME) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
        .await
        .ok()
        .map(|TypedHeader(Authorization(bearer))| bearer.token().to_string())
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentSession {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let raw_token = presented_token(parts, state)
            .await
            .ok_or_else(AppError::unauthorized)?;

        let session = state
            .sessions
            .validate(&raw_token)?
            .ok_or_else(AppError::unauthorized)?;

        Ok(CurrentSession { session, raw_token })
    }
}

/// Caller identity used for rate limiting.
pub fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

pub fn build_session_cookie(
    config: &AppConfig,
    token: &str,
    expires_at: NaiveDateTime,
    now: NaiveDateTime,
) -> Result<HeaderValue, AppError> {
    let max_age = (expires_at - now).num_seconds().max(0);

    let mut parts = vec![format!("{}={}", SESSION_COOKIE_NAME, token)];
    parts.push("Path=/".into());
    parts.push("HttpOnly".into());
    parts.push("SameSite=Lax".into());
    parts.push(format!("Max-Age={}", max_age));
    parts.push(format!("Expires={}", expires_at.and_utc().to_rfc2822()));
    push_cookie_scope(config, &mut parts);

    HeaderValue::from_str(&parts.join("; ")).map_err(AppError::internal)
}

pub fn build_clear_session_cookie(config: &AppConfig) -> Result<HeaderValue, AppError> {
    let mut parts = vec![format!("{}=", SESSION_COOKIE_NAME)];
    parts.push("Path=/".into());
    parts.push("HttpOnly".into());
    parts.push("SameSite=Lax".into());
    parts.push("Max-Age=0".into());
    parts.push("Expires=Thu, 01 Jan 1970 00:00:00 GMT".into());
    push_cookie_scope(config, &mut parts);

    HeaderValue::from_str(&parts.join("; ")).map_err(AppError::internal)
}

fn push_cookie_scope(config: &AppConfig, parts: &mut Vec<String>) {
    if config.session_cookie_secure {
        parts.push("Secure".into());
    }
    if let Some(domain) = &config.session_cookie_domain {
        parts.push(format!("Domain={}", domain));
    }
}
