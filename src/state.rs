use std::sync::Arc;

use crate::{
    auth::SessionManager,
    config::AppConfig,
    error::{AppError, AppResult},
    models::Organisation,
    rate_limit::RateLimiter,
    reaper::Reaper,
    repo::{OrganisationRepository, Repository},
    storage::ObjectStorage,
    uploads::{UploadCoordinator, UploadLimits},
};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub sessions: SessionManager,
    pub rate_limiter: RateLimiter,
    pub uploads: UploadCoordinator,
    pub reaper: Reaper,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn Repository>,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        let sessions = SessionManager::new(
            repo.clone(),
            config.admin_session_ttl_days,
            config.field_session_ttl_days,
        );
        let rate_limiter = RateLimiter::new(repo.clone());
        let uploads = UploadCoordinator::new(
            repo.clone(),
            storage.clone(),
            UploadLimits::from_config(&config),
        );
        let reaper = Reaper::new(repo.clone(), storage.clone());

        Self {
            repo,
            config: Arc::new(config),
            storage,
            sessions,
            rate_limiter,
            uploads,
            reaper,
        }
    }

    /// Unknown slugs are reported as not found.
    pub fn organisation_by_slug(&self, slug: &str) -> AppResult<Organisation> {
        self.repo
            .find_organisation_by_slug(&slug.to_ascii_lowercase())?
            .ok_or_else(AppError::not_found)
    }
}
