//! Three-phase upload and replace protocol.
//!
//! The coordinator never moves bytes. It hands out signed write URLs, then
//! commits the outcome with a compare-and-swap on the document row once the
//! object is visible in storage. A row's status is the single source of truth;
//! blob cleanup after a committed change is best effort.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::{
    Asset, Document, DocumentChanges, DocumentMetadataChanges, DocumentTransition, NewDocument,
    Organisation, ReleasedKeys, UploadStatus,
};
use crate::repo::{AssetRepository, DocumentRepository, Repository, StoreError};
use crate::storage::{ObjectHead, ObjectStorage};
use crate::tasks;

pub const ACCEPTED_CONTENT_TYPE: &str = "application/pdf";

const MAX_FILENAME_CHARS: usize = 255;
const MAX_TITLE_CHARS: usize = 200;
const MAX_DOC_TYPE_CHARS: usize = 100;
const MAX_NOTES_CHARS: usize = 2000;
const MAX_SAFE_FILENAME_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error("resource not found")]
    NotFound,
    #[error("document limit reached for this {0}")]
    QuotaExceeded(&'static str),
    #[error("document already finalized")]
    AlreadyFinalized,
    #[error("document is not in a replaceable state")]
    NotReplaceable,
    #[error("document is not being replaced")]
    NotReplacing,
    #[error("storage key mismatch")]
    StorageKeyMismatch,
    #[error("file not found in storage, upload may still be in progress")]
    NotYetVisible,
    #[error("storage temporarily unavailable: {0}")]
    StorageUnavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_bytes: i64,
    pub upload_url_ttl: Duration,
    pub download_url_ttl: Duration,
}

impl UploadLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_bytes: config.upload_max_bytes,
            upload_url_ttl: Duration::from_secs(config.upload_url_expiry_seconds),
            download_url_ttl: Duration::from_secs(config.download_url_expiry_seconds),
        }
    }
}

/// Metadata a client declares before it transfers a new document.
#[derive(Debug, Clone, Deserialize)]
pub struct DeclaredUpload {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub doc_type: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Metadata of the file that will replace a document's current content.
#[derive(Debug, Clone, Deserialize)]
pub struct DeclaredReplacement {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct InitiatedUpload {
    pub document: Document,
    pub upload_url: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone)]
pub struct InitiatedReplace {
    pub document_id: Uuid,
    pub new_storage_key: String,
    pub old_storage_key: String,
    pub upload_url: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone)]
pub struct ReplacementCommit {
    pub new_storage_key: String,
    pub old_storage_key: String,
    pub filename: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct ResolvedDownload {
    pub document: Document,
    pub url: String,
    pub expires_in: u64,
}

#[derive(Clone)]
pub struct UploadCoordinator {
    repo: Arc<dyn Repository>,
    storage: Arc<dyn ObjectStorage>,
    limits: UploadLimits,
}

impl UploadCoordinator {
    pub fn new(
        repo: Arc<dyn Repository>,
        storage: Arc<dyn ObjectStorage>,
        limits: UploadLimits,
    ) -> Self {
        Self {
            repo,
            storage,
            limits,
        }
    }

    pub fn limits(&self) -> UploadLimits {
        self.limits
    }

    /// Creates an `uploading` row and returns a signed PUT URL for its key.
    /// Quotas are counted here only, so concurrent initiations may overshoot.
    pub async fn init_upload(
        &self,
        org: &Organisation,
        asset_id: Uuid,
        declared: DeclaredUpload,
    ) -> UploadResult<InitiatedUpload> {
        let asset = self
            .repo
            .find_asset(org.id, asset_id)?
            .ok_or(UploadError::NotFound)?;

        if self.repo.count_documents_for_asset(asset.id)? >= i64::from(org.max_documents_per_asset)
        {
            return Err(UploadError::QuotaExceeded("asset"));
        }
        if self.repo.count_documents_for_org(org.id)? >= i64::from(org.max_total_documents) {
            return Err(UploadError::QuotaExceeded("organisation"));
        }

        let declared = validate_declared_upload(declared, self.limits.max_bytes)?;

        let now = Utc::now().naive_utc();
        let document_id = Uuid::new_v4();
        let storage_key = mint_storage_key(org.id, asset.id, document_id, now, &declared.filename);

        let document = self.repo.insert_document(NewDocument {
            id: document_id,
            org_id: org.id,
            asset_id: asset.id,
            title: declared.title,
            filename: declared.filename,
            content_type: declared.content_type,
            size_bytes: declared.size_bytes,
            storage_key,
            doc_type: declared.doc_type,
            notes: declared.notes,
            upload_status: UploadStatus::Uploading.as_str().to_string(),
            status_changed_at: now,
        })?;

        let upload_url = match self
            .storage
            .presign_put_object(
                &document.storage_key,
                &document.content_type,
                document.size_bytes,
                self.limits.upload_url_ttl,
            )
            .await
        {
            Ok(url) => url,
            Err(err) => {
                if let Err(undo_err) = self.repo.delete_document(org.id, document.id) {
                    warn!(
                        document_id = %document.id,
                        error = %undo_err,
                        "failed to remove document after presign failure"
                    );
                }
                return Err(UploadError::Storage(err.to_string()));
            }
        };

        info!(
            document_id = %document.id,
            asset_id = %asset.id,
            storage_key = %document.storage_key,
            "upload initiated"
        );

        Ok(InitiatedUpload {
            document,
            upload_url,
            expires_in: self.limits.upload_url_ttl.as_secs(),
        })
    }

    /// Commits `uploading` -> `ready` once the object is visible. Only the
    /// first finalize of a document can succeed.
    pub async fn finalize_upload(
        &self,
        org_id: Uuid,
        document_id: Uuid,
        storage_key: &str,
    ) -> UploadResult<Document> {
        let mut document = self
            .repo
            .find_document(org_id, document_id)?
            .ok_or(UploadError::NotFound)?;

        if !document.has_status(UploadStatus::Uploading) {
            return Err(UploadError::AlreadyFinalized);
        }
        if document.storage_key != storage_key {
            return Err(UploadError::StorageKeyMismatch);
        }

        self.ensure_visible(storage_key, document.size_bytes).await?;

        let now = Utc::now().naive_utc();
        let mut changes = DocumentChanges::to_status(UploadStatus::Ready, now);
        changes.uploaded_at = Some(now);
        let applied = self.repo.transition_document(&DocumentTransition {
            document_id,
            org_id,
            from: UploadStatus::Uploading,
            expected_storage_key: storage_key.to_string(),
            changes,
        })?;
        if !applied {
            return Err(UploadError::AlreadyFinalized);
        }

        info!(document_id = %document_id, "upload finalized");

        document.upload_status = UploadStatus::Ready.as_str().to_string();
        document.uploaded_at = Some(now);
        document.status_changed_at = now;
        Ok(document)
    }

    /// Moves a `ready` document to `replacing` and signs a write URL for a
    /// freshly minted key. Of two concurrent calls exactly one wins.
    pub async fn init_replace(
        &self,
        org_id: Uuid,
        document_id: Uuid,
        declared: DeclaredReplacement,
    ) -> UploadResult<InitiatedReplace> {
        let declared = validate_declared_replacement(declared, self.limits.max_bytes)?;

        let document = self
            .repo
            .find_document(org_id, document_id)?
            .ok_or(UploadError::NotFound)?;
        if !document.has_status(UploadStatus::Ready) {
            return Err(UploadError::NotReplaceable);
        }

        let now = Utc::now().naive_utc();
        let mut new_storage_key =
            mint_storage_key(org_id, document.asset_id, document.id, now, &declared.filename);
        while new_storage_key == document.storage_key {
            new_storage_key =
                mint_storage_key(org_id, document.asset_id, document.id, now, &declared.filename);
        }

        let mut changes = DocumentChanges::to_status(UploadStatus::Replacing, now);
        changes.pending_storage_key = Some(Some(new_storage_key.clone()));
        let applied = self.repo.transition_document(&DocumentTransition {
            document_id,
            org_id,
            from: UploadStatus::Ready,
            expected_storage_key: document.storage_key.clone(),
            changes,
        })?;
        if !applied {
            return Err(UploadError::NotReplaceable);
        }

        let upload_url = match self
            .storage
            .presign_put_object(
                &new_storage_key,
                &declared.content_type,
                declared.size_bytes,
                self.limits.upload_url_ttl,
            )
            .await
        {
            Ok(url) => url,
            Err(err) => {
                self.abandon_replace(org_id, &document, Utc::now().naive_utc());
                return Err(UploadError::Storage(err.to_string()));
            }
        };

        info!(
            document_id = %document_id,
            new_storage_key = %new_storage_key,
            "replace initiated"
        );

        Ok(InitiatedReplace {
            document_id,
            new_storage_key,
            old_storage_key: document.storage_key,
            upload_url,
            expires_in: self.limits.upload_url_ttl.as_secs(),
        })
    }

    fn abandon_replace(&self, org_id: Uuid, document: &Document, now: NaiveDateTime) {
        let mut changes = DocumentChanges::to_status(UploadStatus::Ready, now);
        changes.pending_storage_key = Some(None);
        let undo = self.repo.transition_document(&DocumentTransition {
            document_id: document.id,
            org_id,
            from: UploadStatus::Replacing,
            expected_storage_key: document.storage_key.clone(),
            changes,
        });
        match undo {
            Ok(true) => {}
            Ok(false) => warn!(document_id = %document.id, "replace already moved on, not reverting"),
            Err(err) => warn!(
                document_id = %document.id,
                error = %err,
                "failed to revert document after presign failure"
            ),
        }
    }

    /// Commits `replacing` -> `ready`, swapping in the new object. The old
    /// object is deleted afterwards on a best-effort basis.
    pub async fn finalize_replace(
        &self,
        org_id: Uuid,
        document_id: Uuid,
        commit: ReplacementCommit,
    ) -> UploadResult<Document> {
        let mut document = self
            .repo
            .find_document(org_id, document_id)?
            .ok_or(UploadError::NotFound)?;

        if !document.has_status(UploadStatus::Replacing) {
            return Err(UploadError::NotReplacing);
        }
        if document.storage_key != commit.old_storage_key
            || document.pending_storage_key.as_deref() != Some(commit.new_storage_key.as_str())
        {
            return Err(UploadError::StorageKeyMismatch);
        }

        let filename = validate_filename(&commit.filename)?;
        validate_size(commit.size_bytes, self.limits.max_bytes)?;

        self.ensure_visible(&commit.new_storage_key, commit.size_bytes)
            .await?;

        let now = Utc::now().naive_utc();
        let mut changes = DocumentChanges::to_status(UploadStatus::Ready, now);
        changes.uploaded_at = Some(now);
        changes.storage_key = Some(commit.new_storage_key.clone());
        changes.pending_storage_key = Some(None);
        changes.filename = Some(filename.clone());
        changes.size_bytes = Some(commit.size_bytes);
        let applied = self.repo.transition_document(&DocumentTransition {
            document_id,
            org_id,
            from: UploadStatus::Replacing,
            expected_storage_key: commit.old_storage_key.clone(),
            changes,
        })?;
        if !applied {
            return Err(UploadError::NotReplacing);
        }

        info!(
            document_id = %document_id,
            storage_key = %commit.new_storage_key,
            "replace finalized"
        );

        // The live row must never lose its own object.
        if commit.old_storage_key != commit.new_storage_key {
            tasks::spawn_delete_objects(self.storage.clone(), vec![commit.old_storage_key]);
        }

        document.upload_status = UploadStatus::Ready.as_str().to_string();
        document.storage_key = commit.new_storage_key;
        document.pending_storage_key = None;
        document.filename = filename;
        document.size_bytes = commit.size_bytes;
        document.uploaded_at = Some(now);
        document.status_changed_at = now;
        Ok(document)
    }

    /// Removes the row in any state, then deletes its blobs in the background.
    pub fn delete(&self, org_id: Uuid, document_id: Uuid) -> UploadResult<ReleasedKeys> {
        let released = self
            .repo
            .delete_document(org_id, document_id)?
            .ok_or(UploadError::NotFound)?;

        info!(document_id = %document_id, storage_key = %released.storage_key, "document deleted");

        tasks::spawn_delete_objects(self.storage.clone(), released.clone().into_keys());
        Ok(released)
    }

    pub fn update_metadata(
        &self,
        org_id: Uuid,
        document_id: Uuid,
        changes: DocumentMetadataChanges,
    ) -> UploadResult<Document> {
        let changes = normalize_metadata_changes(changes)?;
        self.repo
            .update_ready_document_metadata(org_id, document_id, changes)?
            .ok_or(UploadError::NotFound)
    }

    /// Signs a read URL for a `ready` document. `authorize` sees the owning
    /// asset and must approve before any URL is produced.
    pub async fn resolve_ready<F>(
        &self,
        document_id: Uuid,
        authorize: F,
    ) -> UploadResult<ResolvedDownload>
    where
        F: FnOnce(&Asset) -> bool,
    {
        let document = self
            .repo
            .find_document_by_id(document_id)?
            .filter(|document| document.has_status(UploadStatus::Ready))
            .ok_or(UploadError::NotFound)?;
        let asset = self
            .repo
            .find_asset_by_id(document.asset_id)?
            .ok_or(UploadError::NotFound)?;
        if asset.org_id != document.org_id || !authorize(&asset) {
            return Err(UploadError::NotFound);
        }

        let url = self
            .storage
            .presign_get_object(
                &document.storage_key,
                inline_content_disposition(&document.filename),
                self.limits.download_url_ttl,
            )
            .await
            .map_err(|err| UploadError::Storage(err.to_string()))?;

        Ok(ResolvedDownload {
            document,
            url,
            expires_in: self.limits.download_url_ttl.as_secs(),
        })
    }

    /// The object must exist and, when the store reports a size, match the
    /// declared one.
    async fn ensure_visible(&self, storage_key: &str, declared_size: i64) -> UploadResult<()> {
        match self.storage.head_object(storage_key).await {
            Ok(Some(ObjectHead {
                size_bytes: Some(actual),
            })) if actual != declared_size => {
                warn!(storage_key, declared_size, actual, "uploaded object size mismatch");
                Err(UploadError::Validation(format!(
                    "uploaded object is {actual} bytes, expected {declared_size}"
                )))
            }
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(UploadError::NotYetVisible),
            Err(err) => {
                warn!(storage_key, error = %err, "storage check failed");
                Err(UploadError::StorageUnavailable(err.to_string()))
            }
        }
    }
}

struct ValidUpload {
    filename: String,
    content_type: String,
    size_bytes: i64,
    title: String,
    doc_type: Option<String>,
    notes: Option<String>,
}

fn validate_declared_upload(declared: DeclaredUpload, max_bytes: i64) -> UploadResult<ValidUpload> {
    let filename = validate_filename(&declared.filename)?;
    validate_content_type(&declared.content_type)?;
    validate_size(declared.size_bytes, max_bytes)?;

    let title = match declared.title.as_deref().map(str::trim) {
        Some(title) if !title.is_empty() => {
            ensure_max_chars("title", title, MAX_TITLE_CHARS)?;
            title.to_string()
        }
        _ => default_title(&filename),
    };

    Ok(ValidUpload {
        title,
        content_type: declared.content_type,
        size_bytes: declared.size_bytes,
        doc_type: optional_text("doc_type", declared.doc_type, MAX_DOC_TYPE_CHARS)?,
        notes: optional_text("notes", declared.notes, MAX_NOTES_CHARS)?,
        filename,
    })
}

fn validate_declared_replacement(
    declared: DeclaredReplacement,
    max_bytes: i64,
) -> UploadResult<DeclaredReplacement> {
    let filename = validate_filename(&declared.filename)?;
    validate_content_type(&declared.content_type)?;
    validate_size(declared.size_bytes, max_bytes)?;
    Ok(DeclaredReplacement {
        filename,
        ..declared
    })
}

fn validate_filename(filename: &str) -> UploadResult<String> {
    let filename = filename.trim();
    if filename.is_empty() {
        return Err(UploadError::Validation("filename must not be empty".into()));
    }
    ensure_max_chars("filename", filename, MAX_FILENAME_CHARS)?;
    Ok(filename.to_string())
}

fn validate_content_type(content_type: &str) -> UploadResult<()> {
    if content_type != ACCEPTED_CONTENT_TYPE {
        return Err(UploadError::Validation(format!(
            "content_type must be {ACCEPTED_CONTENT_TYPE}"
        )));
    }
    Ok(())
}

fn validate_size(size_bytes: i64, max_bytes: i64) -> UploadResult<()> {
    if size_bytes <= 0 || size_bytes > max_bytes {
        return Err(UploadError::Validation(format!(
            "size_bytes must be between 1 and {max_bytes}"
        )));
    }
    Ok(())
}

fn ensure_max_chars(field: &str, value: &str, max: usize) -> UploadResult<()> {
    if value.chars().count() > max {
        return Err(UploadError::Validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(())
}

fn optional_text(field: &str, value: Option<String>, max: usize) -> UploadResult<Option<String>> {
    match value.as_deref().map(str::trim) {
        Some(trimmed) if !trimmed.is_empty() => {
            ensure_max_chars(field, trimmed, max)?;
            Ok(Some(trimmed.to_string()))
        }
        _ => Ok(None),
    }
}

fn normalize_metadata_changes(
    changes: DocumentMetadataChanges,
) -> UploadResult<DocumentMetadataChanges> {
    if changes.is_empty() {
        return Err(UploadError::Validation("no changes provided".into()));
    }

    let title = match changes.title {
        Some(title) => {
            let trimmed = title.trim();
            if trimmed.is_empty() {
                return Err(UploadError::Validation("title must not be empty".into()));
            }
            ensure_max_chars("title", trimmed, MAX_TITLE_CHARS)?;
            Some(trimmed.to_string())
        }
        None => None,
    };
    let doc_type = match changes.doc_type {
        Some(value) => Some(optional_text("doc_type", value, MAX_DOC_TYPE_CHARS)?),
        None => None,
    };
    let notes = match changes.notes {
        Some(value) => Some(optional_text("notes", value, MAX_NOTES_CHARS)?),
        None => None,
    };

    Ok(DocumentMetadataChanges {
        title,
        doc_type,
        notes,
    })
}

fn default_title(filename: &str) -> String {
    let stem = filename
        .len()
        .checked_sub(4)
        .filter(|&split| split > 0 && filename.is_char_boundary(split))
        .filter(|&split| filename[split..].eq_ignore_ascii_case(".pdf"))
        .map_or(filename, |split| &filename[..split]);
    stem.chars().take(MAX_TITLE_CHARS).collect()
}

/// Maps a client filename onto `[A-Za-z0-9._-]` so it cannot inject path
/// separators into a storage key.
pub fn sanitize_filename(filename: &str) -> String {
    let mut safe = String::with_capacity(filename.len());
    for ch in filename.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            ch
        } else {
            '_'
        };
        if mapped == '_' && safe.ends_with('_') {
            continue;
        }
        safe.push(mapped);
    }
    safe.truncate(MAX_SAFE_FILENAME_CHARS);
    safe
}

pub fn storage_key_for(
    org_id: Uuid,
    asset_id: Uuid,
    document_id: Uuid,
    now: NaiveDateTime,
    nonce: &str,
    filename: &str,
) -> String {
    format!(
        "org/{org_id}/asset/{asset_id}/doc/{document_id}/{}-{nonce}-{}",
        now.and_utc().timestamp_millis(),
        sanitize_filename(filename)
    )
}

/// Keys minted in the same millisecond for the same filename still differ.
fn mint_storage_key(
    org_id: Uuid,
    asset_id: Uuid,
    document_id: Uuid,
    now: NaiveDateTime,
    filename: &str,
) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    storage_key_for(org_id, asset_id, document_id, now, &nonce[..8], filename)
}

pub fn inline_content_disposition(filename: &str) -> Option<String> {
    if filename.is_empty() {
        return None;
    }

    let sanitized: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' | '\r' | '\n' => '_',
            _ => ch,
        })
        .collect();

    let encoded =
        percent_encoding::utf8_percent_encode(&sanitized, percent_encoding::NON_ALPHANUMERIC);
    Some(format!(
        "inline; filename=\"{}\"; filename*=UTF-8''{}",
        sanitized, encoded
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewAsset, NewOrganisation};
    use crate::repo::{MemoryRepository, OrganisationRepository};
    use crate::storage::MemoryStorage;

    struct Harness {
        repo: Arc<MemoryRepository>,
        storage: Arc<MemoryStorage>,
        coordinator: UploadCoordinator,
        org: Organisation,
        asset: Asset,
    }

    fn harness_with_quotas(per_asset: i32, total: i32) -> Harness {
        let repo = Arc::new(MemoryRepository::new());
        let storage = Arc::new(MemoryStorage::new());
        let coordinator = UploadCoordinator::new(
            repo.clone(),
            storage.clone(),
            UploadLimits {
                max_bytes: 1024 * 1024,
                upload_url_ttl: Duration::from_secs(300),
                download_url_ttl: Duration::from_secs(120),
            },
        );
        let org = repo
            .insert_organisation(NewOrganisation {
                id: Uuid::new_v4(),
                name: "Harbour Works".into(),
                slug: "harbour-works".into(),
                admin_secret_hash: "unused".into(),
                access_code_hash: "unused".into(),
                max_documents_per_asset: per_asset,
                max_total_documents: total,
            })
            .unwrap();
        let asset = repo
            .insert_asset(NewAsset {
                id: Uuid::new_v4(),
                org_id: org.id,
                public_token: "pump-7".into(),
                name: "Pump 7".into(),
                location: None,
                notes: None,
                is_public: true,
            })
            .unwrap();
        Harness {
            repo,
            storage,
            coordinator,
            org,
            asset,
        }
    }

    fn harness() -> Harness {
        harness_with_quotas(10, 200)
    }

    fn manual(filename: &str) -> DeclaredUpload {
        DeclaredUpload {
            filename: filename.into(),
            content_type: ACCEPTED_CONTENT_TYPE.into(),
            size_bytes: 2048,
            title: None,
            doc_type: Some("manual".into()),
            notes: None,
        }
    }

    async fn ready_document(h: &Harness) -> Document {
        let init = h
            .coordinator
            .init_upload(&h.org, h.asset.id, manual("manual.pdf"))
            .await
            .unwrap();
        h.storage
            .put(&init.document.storage_key, 2048, Some(ACCEPTED_CONTENT_TYPE))
            .await;
        h.coordinator
            .finalize_upload(h.org.id, init.document.id, &init.document.storage_key)
            .await
            .unwrap()
    }

    #[test]
    fn sanitize_filename_constrains_characters() {
        assert_eq!(sanitize_filename("Pump manual (v2).pdf"), "Pump_manual_v2_.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("Überprüfung.pdf"), "_berpr_fung.pdf");
        assert_eq!(sanitize_filename(&"a".repeat(150)).len(), 100);
    }

    #[test]
    fn storage_key_embeds_identifiers() {
        let (org, asset, doc) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let now = chrono::DateTime::from_timestamp_millis(1_700_000_000_123)
            .unwrap()
            .naive_utc();
        assert_eq!(
            storage_key_for(org, asset, doc, now, "3f9a0c1e", "a b.pdf"),
            format!("org/{org}/asset/{asset}/doc/{doc}/1700000000123-3f9a0c1e-a_b.pdf")
        );
    }

    #[test]
    fn minted_keys_differ_within_the_same_millisecond() {
        let (org, asset, doc) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now().naive_utc();
        let first = mint_storage_key(org, asset, doc, now, "manual.pdf");
        let second = mint_storage_key(org, asset, doc, now, "manual.pdf");
        assert_ne!(first, second);
        assert!(first.ends_with("-manual.pdf"));
    }

    #[test]
    fn default_title_strips_pdf_extension() {
        assert_eq!(default_title("Service Log.PDF"), "Service Log");
        assert_eq!(default_title("notes.txt"), "notes.txt");
        assert_eq!(default_title(".pdf"), ".pdf");
    }

    #[test]
    fn content_disposition_escapes_quotes() {
        let header = inline_content_disposition("my \"file\".pdf").unwrap();
        assert!(header.starts_with("inline; filename=\"my _file_.pdf\""));
        assert!(header.ends_with("filename*=UTF-8''my%20%5Ffile%5F%2Epdf"));
        assert!(inline_content_disposition("").is_none());
    }

    #[tokio::test]
    async fn upload_round_trip_resolves_the_initiated_key() {
        let h = harness();
        let init = h
            .coordinator
            .init_upload(&h.org, h.asset.id, manual("Pump Manual.pdf"))
            .await
            .unwrap();
        assert!(init.document.has_status(UploadStatus::Uploading));
        assert_eq!(init.document.title, "Pump Manual");
        assert!(init.upload_url.contains(&init.document.storage_key));

        let hidden = h.coordinator.resolve_ready(init.document.id, |_| true).await;
        assert!(matches!(hidden, Err(UploadError::NotFound)));

        h.storage
            .put(&init.document.storage_key, 2048, Some(ACCEPTED_CONTENT_TYPE))
            .await;
        let ready = h
            .coordinator
            .finalize_upload(h.org.id, init.document.id, &init.document.storage_key)
            .await
            .unwrap();
        assert!(ready.has_status(UploadStatus::Ready));
        assert!(ready.uploaded_at.is_some());

        let resolved = h
            .coordinator
            .resolve_ready(init.document.id, |asset| asset.is_public)
            .await
            .unwrap();
        assert!(resolved.url.contains(&init.document.storage_key));
        assert_eq!(resolved.expires_in, 120);
    }

    #[tokio::test]
    async fn finalize_succeeds_at_most_once() {
        let h = harness();
        let init = h
            .coordinator
            .init_upload(&h.org, h.asset.id, manual("once.pdf"))
            .await
            .unwrap();
        h.storage.put(&init.document.storage_key, 2048, None).await;

        let key = init.document.storage_key.clone();
        let (first, second) = tokio::join!(
            h.coordinator.finalize_upload(h.org.id, init.document.id, &key),
            h.coordinator.finalize_upload(h.org.id, init.document.id, &key),
        );
        let successes = [first.is_ok(), second.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count();
        assert_eq!(successes, 1);

        let again = h
            .coordinator
            .finalize_upload(h.org.id, init.document.id, &key)
            .await;
        assert!(matches!(again, Err(UploadError::AlreadyFinalized)));
    }

    #[tokio::test]
    async fn finalize_before_object_is_visible_is_retryable() {
        let h = harness();
        let init = h
            .coordinator
            .init_upload(&h.org, h.asset.id, manual("late.pdf"))
            .await
            .unwrap();
        let key = init.document.storage_key.clone();

        let early = h
            .coordinator
            .finalize_upload(h.org.id, init.document.id, &key)
            .await;
        assert!(matches!(early, Err(UploadError::NotYetVisible)));

        h.storage.set_unavailable(true);
        let outage = h
            .coordinator
            .finalize_upload(h.org.id, init.document.id, &key)
            .await;
        assert!(matches!(outage, Err(UploadError::StorageUnavailable(_))));
        h.storage.set_unavailable(false);

        h.storage.put(&key, 2048, None).await;
        assert!(h
            .coordinator
            .finalize_upload(h.org.id, init.document.id, &key)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn finalize_rejects_foreign_key_and_tenant() {
        let h = harness();
        let init = h
            .coordinator
            .init_upload(&h.org, h.asset.id, manual("doc.pdf"))
            .await
            .unwrap();
        h.storage.put(&init.document.storage_key, 2048, None).await;

        let mismatch = h
            .coordinator
            .finalize_upload(h.org.id, init.document.id, "org/other/key.pdf")
            .await;
        assert!(matches!(mismatch, Err(UploadError::StorageKeyMismatch)));

        let foreign = h
            .coordinator
            .finalize_upload(Uuid::new_v4(), init.document.id, &init.document.storage_key)
            .await;
        assert!(matches!(foreign, Err(UploadError::NotFound)));
    }

    #[tokio::test]
    async fn quota_is_enforced_before_touching_storage() {
        let h = harness_with_quotas(2, 200);
        for name in ["one.pdf", "two.pdf"] {
            h.coordinator
                .init_upload(&h.org, h.asset.id, manual(name))
                .await
                .unwrap();
        }

        // An outage would surface as a storage error if signing were reached.
        h.storage.set_unavailable(true);
        let third = h
            .coordinator
            .init_upload(&h.org, h.asset.id, manual("three.pdf"))
            .await;
        assert!(matches!(third, Err(UploadError::QuotaExceeded("asset"))));
        assert_eq!(h.repo.document_count(), 2);
    }

    #[tokio::test]
    async fn organisation_quota_spans_assets() {
        let h = harness_with_quotas(10, 1);
        h.coordinator
            .init_upload(&h.org, h.asset.id, manual("one.pdf"))
            .await
            .unwrap();
        let second = h
            .coordinator
            .init_upload(&h.org, h.asset.id, manual("two.pdf"))
            .await;
        assert!(matches!(second, Err(UploadError::QuotaExceeded("organisation"))));
    }

    #[tokio::test]
    async fn init_upload_validates_declared_metadata() {
        let h = harness();
        let mut wrong_type = manual("image.png");
        wrong_type.content_type = "image/png".into();
        let too_big = DeclaredUpload {
            size_bytes: 2 * 1024 * 1024,
            ..manual("big.pdf")
        };
        let empty = DeclaredUpload {
            size_bytes: 0,
            ..manual("empty.pdf")
        };

        for declared in [wrong_type, too_big, empty, manual("  ")] {
            let result = h.coordinator.init_upload(&h.org, h.asset.id, declared).await;
            assert!(matches!(result, Err(UploadError::Validation(_))));
        }
        assert_eq!(h.repo.document_count(), 0);
    }

    #[tokio::test]
    async fn presign_failure_removes_the_new_row() {
        let h = harness();
        h.storage.set_unavailable(true);
        let result = h
            .coordinator
            .init_upload(&h.org, h.asset.id, manual("doc.pdf"))
            .await;
        assert!(matches!(result, Err(UploadError::Storage(_))));
        assert_eq!(h.repo.document_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_replaces_have_one_winner() {
        let h = harness();
        let doc = ready_document(&h).await;
        let declared = || DeclaredReplacement {
            filename: "v2.pdf".into(),
            content_type: ACCEPTED_CONTENT_TYPE.into(),
            size_bytes: 4096,
        };

        let (first, second) = tokio::join!(
            h.coordinator.init_replace(h.org.id, doc.id, declared()),
            h.coordinator.init_replace(h.org.id, doc.id, declared()),
        );
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(UploadError::NotReplaceable))));

        let stored = h.repo.find_document(h.org.id, doc.id).unwrap().unwrap();
        assert!(stored.has_status(UploadStatus::Replacing));
    }

    #[tokio::test]
    async fn replace_swaps_key_and_deletes_old_object() {
        let h = harness();
        let doc = ready_document(&h).await;

        let replace = h
            .coordinator
            .init_replace(
                h.org.id,
                doc.id,
                DeclaredReplacement {
                    filename: "manual v2.pdf".into(),
                    content_type: ACCEPTED_CONTENT_TYPE.into(),
                    size_bytes: 4096,
                },
            )
            .await
            .unwrap();
        assert_eq!(replace.old_storage_key, doc.storage_key);
        assert_ne!(replace.new_storage_key, doc.storage_key);

        // Readers keep seeing nothing while the document is replacing.
        let hidden = h.coordinator.resolve_ready(doc.id, |_| true).await;
        assert!(matches!(hidden, Err(UploadError::NotFound)));

        let commit = ReplacementCommit {
            new_storage_key: replace.new_storage_key.clone(),
            old_storage_key: replace.old_storage_key.clone(),
            filename: "manual v2.pdf".into(),
            size_bytes: 4096,
        };
        let early = h
            .coordinator
            .finalize_replace(h.org.id, doc.id, commit.clone())
            .await;
        assert!(matches!(early, Err(UploadError::NotYetVisible)));

        h.storage.put(&replace.new_storage_key, 4096, None).await;
        let updated = h
            .coordinator
            .finalize_replace(h.org.id, doc.id, commit.clone())
            .await
            .unwrap();
        assert_eq!(updated.storage_key, replace.new_storage_key);
        assert_eq!(updated.filename, "manual v2.pdf");
        assert_eq!(updated.size_bytes, 4096);

        let repeated = h.coordinator.finalize_replace(h.org.id, doc.id, commit).await;
        assert!(matches!(repeated, Err(UploadError::NotReplacing)));

        for _ in 0..50 {
            if !h.storage.contains(&doc.storage_key).await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!h.storage.contains(&doc.storage_key).await);
        assert!(h.storage.contains(&replace.new_storage_key).await);
    }

    #[tokio::test]
    async fn replace_with_the_same_filename_keeps_the_live_object() {
        let h = harness();
        let doc = ready_document(&h).await;

        let replace = h
            .coordinator
            .init_replace(
                h.org.id,
                doc.id,
                DeclaredReplacement {
                    filename: "manual.pdf".into(),
                    content_type: ACCEPTED_CONTENT_TYPE.into(),
                    size_bytes: 2048,
                },
            )
            .await
            .unwrap();
        assert_ne!(replace.new_storage_key, doc.storage_key);

        h.storage.put(&replace.new_storage_key, 2048, None).await;
        let updated = h
            .coordinator
            .finalize_replace(
                h.org.id,
                doc.id,
                ReplacementCommit {
                    new_storage_key: replace.new_storage_key.clone(),
                    old_storage_key: replace.old_storage_key.clone(),
                    filename: "manual.pdf".into(),
                    size_bytes: 2048,
                },
            )
            .await
            .unwrap();

        for _ in 0..50 {
            if !h.storage.contains(&doc.storage_key).await {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(h.storage.contains(&updated.storage_key).await);
        assert!(h.coordinator.resolve_ready(doc.id, |_| true).await.is_ok());
    }

    #[tokio::test]
    async fn finalize_rejects_objects_of_the_wrong_size() {
        let h = harness();
        let init = h
            .coordinator
            .init_upload(&h.org, h.asset.id, manual("short.pdf"))
            .await
            .unwrap();
        let key = init.document.storage_key.clone();

        h.storage.put(&key, 17, None).await;
        let short = h
            .coordinator
            .finalize_upload(h.org.id, init.document.id, &key)
            .await;
        assert!(matches!(short, Err(UploadError::Validation(_))));
        let stored = h.repo.find_document(h.org.id, init.document.id).unwrap().unwrap();
        assert!(stored.has_status(UploadStatus::Uploading));

        h.storage.put(&key, 2048, None).await;
        let doc = h
            .coordinator
            .finalize_upload(h.org.id, init.document.id, &key)
            .await
            .unwrap();

        let replace = h
            .coordinator
            .init_replace(
                h.org.id,
                doc.id,
                DeclaredReplacement {
                    filename: "v2.pdf".into(),
                    content_type: ACCEPTED_CONTENT_TYPE.into(),
                    size_bytes: 4096,
                },
            )
            .await
            .unwrap();
        h.storage.put(&replace.new_storage_key, 4000, None).await;
        let mismatch = h
            .coordinator
            .finalize_replace(
                h.org.id,
                doc.id,
                ReplacementCommit {
                    new_storage_key: replace.new_storage_key,
                    old_storage_key: replace.old_storage_key,
                    filename: "v2.pdf".into(),
                    size_bytes: 4096,
                },
            )
            .await;
        assert!(matches!(mismatch, Err(UploadError::Validation(_))));
        let stored = h.repo.find_document(h.org.id, doc.id).unwrap().unwrap();
        assert!(stored.has_status(UploadStatus::Replacing));
    }

    #[tokio::test]
    async fn finalize_replace_requires_the_minted_key() {
        let h = harness();
        let doc = ready_document(&h).await;
        let replace = h
            .coordinator
            .init_replace(
                h.org.id,
                doc.id,
                DeclaredReplacement {
                    filename: "v2.pdf".into(),
                    content_type: ACCEPTED_CONTENT_TYPE.into(),
                    size_bytes: 10,
                },
            )
            .await
            .unwrap();

        let forged = "org/x/asset/y/doc/z/1-forged.pdf".to_string();
        h.storage.put(&forged, 10, None).await;
        let result = h
            .coordinator
            .finalize_replace(
                h.org.id,
                doc.id,
                ReplacementCommit {
                    new_storage_key: forged,
                    old_storage_key: replace.old_storage_key.clone(),
                    filename: "v2.pdf".into(),
                    size_bytes: 10,
                },
            )
            .await;
        assert!(matches!(result, Err(UploadError::StorageKeyMismatch)));

        let stale_old = h
            .coordinator
            .finalize_replace(
                h.org.id,
                doc.id,
                ReplacementCommit {
                    new_storage_key: replace.new_storage_key,
                    old_storage_key: "stale".into(),
                    filename: "v2.pdf".into(),
                    size_bytes: 10,
                },
            )
            .await;
        assert!(matches!(stale_old, Err(UploadError::StorageKeyMismatch)));
    }

    #[tokio::test]
    async fn replace_presign_failure_restores_ready() {
        let h = harness();
        let doc = ready_document(&h).await;
        h.storage.set_unavailable(true);

        let result = h
            .coordinator
            .init_replace(
                h.org.id,
                doc.id,
                DeclaredReplacement {
                    filename: "v2.pdf".into(),
                    content_type: ACCEPTED_CONTENT_TYPE.into(),
                    size_bytes: 10,
                },
            )
            .await;
        assert!(matches!(result, Err(UploadError::Storage(_))));

        let stored = h.repo.find_document(h.org.id, doc.id).unwrap().unwrap();
        assert!(stored.has_status(UploadStatus::Ready));
        assert_eq!(stored.pending_storage_key, None);
    }

    #[tokio::test]
    async fn delete_works_in_any_state_and_is_scoped() {
        let h = harness();
        let init = h
            .coordinator
            .init_upload(&h.org, h.asset.id, manual("stuck.pdf"))
            .await
            .unwrap();

        assert!(matches!(
            h.coordinator.delete(Uuid::new_v4(), init.document.id),
            Err(UploadError::NotFound)
        ));

        let released = h.coordinator.delete(h.org.id, init.document.id).unwrap();
        assert_eq!(released.storage_key, init.document.storage_key);
        assert!(matches!(
            h.coordinator.delete(h.org.id, init.document.id),
            Err(UploadError::NotFound)
        ));
    }

    #[tokio::test]
    async fn metadata_updates_apply_to_ready_documents_only() {
        let h = harness();
        let pending = h
            .coordinator
            .init_upload(&h.org, h.asset.id, manual("pending.pdf"))
            .await
            .unwrap();
        let change = || DocumentMetadataChanges {
            title: Some("  Wiring diagram ".into()),
            doc_type: Some(Some("".into())),
            notes: None,
        };
        assert!(matches!(
            h.coordinator
                .update_metadata(h.org.id, pending.document.id, change()),
            Err(UploadError::NotFound)
        ));

        let doc = ready_document(&h).await;
        let updated = h
            .coordinator
            .update_metadata(h.org.id, doc.id, change())
            .unwrap();
        assert_eq!(updated.title, "Wiring diagram");
        assert_eq!(updated.doc_type, None);

        assert!(matches!(
            h.coordinator
                .update_metadata(h.org.id, doc.id, DocumentMetadataChanges::default()),
            Err(UploadError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn private_documents_require_authorization() {
        let h = harness();
        let doc = ready_document(&h).await;
        let denied = h.coordinator.resolve_ready(doc.id, |_| false).await;
        assert!(matches!(denied, Err(UploadError::NotFound)));
    }
}
