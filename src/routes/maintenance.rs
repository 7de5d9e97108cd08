use axum::{extract::State, Json};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use chrono::Duration as ChronoDuration;
use subtle::ConstantTimeEq;

use crate::{
    error::{AppError, AppResult},
    reaper::SweepReport,
    state::AppState,
};

/// Cron entry point for the orphan sweep. Without a configured secret the
/// endpoint is closed.
pub async fn cleanup(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> AppResult<Json<SweepReport>> {
    let expected = state
        .config
        .cron_secret
        .as_deref()
        .filter(|secret| !secret.is_empty())
        .ok_or_else(AppError::unauthorized)?;
    let presented = bearer
        .as_ref()
        .map(|TypedHeader(Authorization(bearer))| bearer.token())
        .ok_or_else(AppError::unauthorized)?;
    if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        return Err(AppError::unauthorized());
    }

    let max_age = ChronoDuration::minutes(state.config.orphan_max_age_minutes);
    let report = state.reaper.sweep(max_age).await?;
    Ok(Json(report))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
