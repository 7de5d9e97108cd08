//! Durable state behind object-safe traits.
//!
//! Every multi-writer state change is expressed as a conditional update so the
//! store, not the process, decides which of two racing callers wins.

use chrono::NaiveDateTime;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Asset, AssetChanges, Document, DocumentMetadataChanges, DocumentTransition, NewAsset,
    NewDocument, NewOrganisation, NewSession, Organisation, ReleasedKeys, Session,
};

pub mod memory;
pub mod pg;

pub use memory::MemoryRepository;
pub use pg::PgRepository;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(String),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a sliding-window admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    Allowed,
    /// Carries the oldest attempt still inside the window.
    Denied { oldest: NaiveDateTime },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanCandidate {
    pub document_id: Uuid,
    pub storage_key: String,
}

pub trait OrganisationRepository: Send + Sync {
    fn insert_organisation(&self, new: NewOrganisation) -> StoreResult<Organisation>;
    fn find_organisation(&self, id: Uuid) -> StoreResult<Option<Organisation>>;
    fn find_organisation_by_slug(&self, slug: &str) -> StoreResult<Option<Organisation>>;
    fn update_organisation_secrets(
        &self,
        id: Uuid,
        admin_secret_hash: Option<String>,
        access_code_hash: Option<String>,
        now: NaiveDateTime,
    ) -> StoreResult<bool>;
}

pub trait SessionRepository: Send + Sync {
    fn insert_session(&self, new: NewSession) -> StoreResult<Session>;
    fn find_session_by_hash(&self, token_hash: &str) -> StoreResult<Option<Session>>;
    fn delete_session_by_hash(&self, token_hash: &str) -> StoreResult<usize>;
    fn delete_expired_sessions(&self, org_id: Uuid, now: NaiveDateTime) -> StoreResult<usize>;
    fn touch_session(&self, session_id: Uuid, now: NaiveDateTime) -> StoreResult<()>;
}

pub trait AssetRepository: Send + Sync {
    fn insert_asset(&self, new: NewAsset) -> StoreResult<Asset>;
    fn find_asset(&self, org_id: Uuid, asset_id: Uuid) -> StoreResult<Option<Asset>>;
    fn find_asset_by_id(&self, asset_id: Uuid) -> StoreResult<Option<Asset>>;
    fn find_asset_by_public_token(&self, token: &str) -> StoreResult<Option<Asset>>;
    fn list_assets(&self, org_id: Uuid) -> StoreResult<Vec<Asset>>;
    fn update_asset(
        &self,
        org_id: Uuid,
        asset_id: Uuid,
        changes: AssetChanges,
    ) -> StoreResult<Option<Asset>>;
    /// Removes the asset and its documents in one transaction, returning the
    /// blob keys those documents referenced. `None` when nothing matched.
    fn delete_asset(&self, org_id: Uuid, asset_id: Uuid) -> StoreResult<Option<Vec<String>>>;
}

pub trait DocumentRepository: Send + Sync {
    fn count_documents_for_asset(&self, asset_id: Uuid) -> StoreResult<i64>;
    fn count_documents_for_org(&self, org_id: Uuid) -> StoreResult<i64>;
    fn insert_document(&self, new: NewDocument) -> StoreResult<Document>;
    fn find_document(&self, org_id: Uuid, document_id: Uuid) -> StoreResult<Option<Document>>;
    fn find_document_by_id(&self, document_id: Uuid) -> StoreResult<Option<Document>>;
    fn list_documents_for_asset(&self, asset_id: Uuid) -> StoreResult<Vec<Document>>;
    fn list_ready_documents_for_asset(&self, asset_id: Uuid) -> StoreResult<Vec<Document>>;
    /// Applies the transition if and only if the row still matches its
    /// expected state. Returns whether a row was updated.
    fn transition_document(&self, transition: &DocumentTransition) -> StoreResult<bool>;
    fn update_ready_document_metadata(
        &self,
        org_id: Uuid,
        document_id: Uuid,
        changes: DocumentMetadataChanges,
    ) -> StoreResult<Option<Document>>;
    fn delete_document(&self, org_id: Uuid, document_id: Uuid)
        -> StoreResult<Option<ReleasedKeys>>;
    fn find_orphaned_documents(&self, cutoff: NaiveDateTime)
        -> StoreResult<Vec<OrphanCandidate>>;
    /// Deletes the row only if it is still pending and older than `cutoff`.
    fn delete_orphaned_document(
        &self,
        document_id: Uuid,
        cutoff: NaiveDateTime,
    ) -> StoreResult<Option<ReleasedKeys>>;
}

pub trait RateLimitRepository: Send + Sync {
    /// Counts attempts for `key` newer than `window_start`; records one at
    /// `now` when fewer than `max_attempts` exist. Count and insert are atomic
    /// with respect to other callers using the same key.
    fn record_attempt_if_allowed(
        &self,
        key: &str,
        window_start: NaiveDateTime,
        max_attempts: i64,
        now: NaiveDateTime,
    ) -> StoreResult<AttemptDecision>;
    fn purge_attempts_before(&self, cutoff: NaiveDateTime) -> StoreResult<usize>;
}

pub trait Repository:
    OrganisationRepository
    + SessionRepository
    + AssetRepository
    + DocumentRepository
    + RateLimitRepository
    + 'static
{
}

impl<T> Repository for T where
    T: OrganisationRepository
        + SessionRepository
        + AssetRepository
        + DocumentRepository
        + RateLimitRepository
        + 'static
{
}
