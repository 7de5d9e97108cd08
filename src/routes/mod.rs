use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
    Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{
    error::{AppError, AppResult},
    rate_limit::RateLimitPolicy,
    state::AppState,
};

pub mod assets;
pub mod auth;
pub mod documents;
pub mod health;
pub mod maintenance;
pub mod orgs;
pub mod public;

const MAX_JSON_BODY_BYTES: usize = 64 * 1024;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .filter_map(|value| match value.parse::<HeaderValue>() {
                Ok(header) => Some(header),
                Err(_) => {
                    tracing::warn!(origin = value, "ignoring invalid CORS allowed origin");
                    None
                }
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let admin_routes = Router::new()
        .route("/login", post(auth::admin_login))
        .route(
            "/assets",
            get(assets::list_assets).post(assets::create_asset),
        )
        .route(
            "/assets/:asset_id",
            get(assets::get_asset)
                .patch(assets::update_asset)
                .delete(assets::delete_asset),
        )
        .route(
            "/assets/:asset_id/documents/init-upload",
            post(documents::init_upload),
        )
        .route(
            "/assets/:asset_id/documents/finalize-upload",
            post(documents::finalize_upload),
        )
        .route(
            "/documents/:document_id",
            patch(documents::update_document).delete(documents::delete_document),
        )
        .route(
            "/documents/:document_id/init-replace",
            post(documents::init_replace),
        )
        .route(
            "/documents/:document_id/finalize-replace",
            post(documents::finalize_replace),
        );

    Router::new()
        .nest("/api/o/:slug/admin", admin_routes)
        .route("/api/orgs", post(orgs::create_org))
        .route("/api/access", post(auth::field_access))
        .route("/api/logout", post(auth::logout))
        .route("/api/session", get(auth::current_session))
        .route("/api/a/:token", get(public::view_asset))
        .route("/d/:document_id", get(public::download_document))
        .route("/api/cleanup", post(maintenance::cleanup))
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_JSON_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}

/// Records one attempt for the caller and rejects with 429 once the
/// policy's window is full.
pub(crate) fn enforce_rate_limit(
    state: &AppState,
    policy: RateLimitPolicy,
    client_ip: &str,
) -> AppResult<()> {
    let decision = state.rate_limiter.check_policy(policy, client_ip)?;
    if decision.allowed {
        return Ok(());
    }
    tracing::warn!(action = policy.action, client_ip, "rate limit exceeded");
    Err(AppError::too_many_requests(decision.retry_after.unwrap_or(1)))
}

pub(crate) fn to_iso(dt: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}
