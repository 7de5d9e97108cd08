use thiserror::Error;
use uuid::Uuid;

use crate::auth::password;
use crate::config::AppConfig;
use crate::models::{NewOrganisation, Organisation};
use crate::repo::{OrganisationRepository, Repository, StoreError};

const MAX_NAME_CHARS: usize = 200;
const MIN_ADMIN_PASSWORD_CHARS: usize = 8;

const RESERVED_SLUGS: &[&str] = &[
    "api",
    "admin",
    "a",
    "access",
    "d",
    "o",
    "_next",
    "favicon.ico",
    "robots.txt",
];

#[derive(Debug, Error)]
pub enum OrgError {
    #[error("{0}")]
    Validation(String),
    #[error("slug is already taken")]
    SlugTaken,
    #[error("failed to hash secret: {0}")]
    Hash(anyhow::Error),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for OrgError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::UniqueViolation(_) => OrgError::SlugTaken,
            other => OrgError::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrganisationInput {
    pub name: String,
    pub slug: String,
    pub admin_password: String,
    pub access_code: String,
}

/// 3 to 50 characters of `[a-z0-9-]`, not starting or ending with a hyphen.
pub fn is_valid_slug_format(slug: &str) -> bool {
    let bytes = slug.as_bytes();
    if !(3..=50).contains(&bytes.len()) {
        return false;
    }
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let inner_ok = |b: u8| edge_ok(b) || b == b'-';
    edge_ok(bytes[0])
        && edge_ok(bytes[bytes.len() - 1])
        && bytes[1..bytes.len() - 1].iter().all(|&b| inner_ok(b))
}

pub fn validate_slug(slug: &str) -> Result<(), OrgError> {
    if !is_valid_slug_format(slug) {
        return Err(OrgError::Validation(
            "slug must be 3-50 lowercase letters, numbers or hyphens and cannot start or end with a hyphen"
                .into(),
        ));
    }
    if RESERVED_SLUGS.contains(&slug) {
        return Err(OrgError::Validation("this slug is reserved".into()));
    }
    Ok(())
}

/// Validates the input, hashes both secrets and stores the organisation with
/// the configured default quotas.
pub fn create_organisation(
    repo: &dyn Repository,
    config: &AppConfig,
    input: OrganisationInput,
) -> Result<Organisation, OrgError> {
    let name: String = input.name.trim().chars().take(MAX_NAME_CHARS).collect();
    let slug = input.slug.trim().to_lowercase();

    if name.is_empty() {
        return Err(OrgError::Validation("name is required".into()));
    }
    if input.admin_password.chars().count() < MIN_ADMIN_PASSWORD_CHARS {
        return Err(OrgError::Validation(format!(
            "admin password must be at least {MIN_ADMIN_PASSWORD_CHARS} characters"
        )));
    }
    if input.access_code.is_empty() {
        return Err(OrgError::Validation("access code is required".into()));
    }
    validate_slug(&slug)?;

    if repo.find_organisation_by_slug(&slug)?.is_some() {
        return Err(OrgError::SlugTaken);
    }

    let admin_secret_hash = password::hash_secret(&input.admin_password).map_err(OrgError::Hash)?;
    let access_code_hash = password::hash_secret(&input.access_code).map_err(OrgError::Hash)?;

    let org = repo.insert_organisation(NewOrganisation {
        id: Uuid::new_v4(),
        name,
        slug,
        admin_secret_hash,
        access_code_hash,
        max_documents_per_asset: config.default_max_documents_per_asset,
        max_total_documents: config.default_max_total_documents,
    })?;

    tracing::info!(org_id = %org.id, slug = %org.slug, "organisation created");
    Ok(org)
}

/// Replaces either or both secrets. Existing sessions stay valid until they
/// expire or are revoked.
pub fn rotate_secrets(
    repo: &dyn Repository,
    slug: &str,
    admin_password: Option<&str>,
    access_code: Option<&str>,
) -> Result<Organisation, OrgError> {
    if admin_password.is_none() && access_code.is_none() {
        return Err(OrgError::Validation("nothing to rotate".into()));
    }
    if let Some(secret) = admin_password {
        if secret.chars().count() < MIN_ADMIN_PASSWORD_CHARS {
            return Err(OrgError::Validation(format!(
                "admin password must be at least {MIN_ADMIN_PASSWORD_CHARS} characters"
            )));
        }
    }
    if access_code == Some("") {
        return Err(OrgError::Validation("access code must not be empty".into()));
    }

    let org = repo
        .find_organisation_by_slug(&slug.to_lowercase())?
        .ok_or_else(|| OrgError::Validation(format!("unknown organisation {slug}")))?;

    let admin_secret_hash = admin_password
        .map(password::hash_secret)
        .transpose()
        .map_err(OrgError::Hash)?;
    let access_code_hash = access_code
        .map(password::hash_secret)
        .transpose()
        .map_err(OrgError::Hash)?;

    let now = chrono::Utc::now().naive_utc();
    repo.update_organisation_secrets(org.id, admin_secret_hash, access_code_hash, now)?;
    tracing::info!(org_id = %org.id, "organisation secrets rotated");

    repo.find_organisation(org.id)?
        .ok_or_else(|| OrgError::Validation(format!("unknown organisation {slug}")))
}
