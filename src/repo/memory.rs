use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDateTime, Utc};
use uuid::Uuid;

use super::{
    AssetRepository, AttemptDecision, DocumentRepository, OrganisationRepository,
    OrphanCandidate, RateLimitRepository, SessionRepository, StoreError, StoreResult,
};
use crate::models::{
    Asset, AssetChanges, Document, DocumentMetadataChanges, DocumentTransition, NewAsset,
    NewDocument, NewOrganisation, NewSession, Organisation, ReleasedKeys, Session, UploadStatus,
};

#[derive(Default)]
struct Tables {
    organisations: HashMap<Uuid, Organisation>,
    sessions: HashMap<Uuid, Session>,
    assets: HashMap<Uuid, Asset>,
    documents: HashMap<Uuid, Document>,
    attempts: Vec<(String, NaiveDateTime)>,
}

/// In-process repository with the same conditional-update semantics as the
/// Postgres one. Each call holds the table lock for its own duration only,
/// which makes every method atomic. Used by tests and local tooling.
#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session_count(&self) -> usize {
        self.tables().sessions.len()
    }

    pub fn attempt_count(&self) -> usize {
        self.tables().attempts.len()
    }

    pub fn document_count(&self) -> usize {
        self.tables().documents.len()
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn released(doc: Document) -> ReleasedKeys {
    ReleasedKeys {
        storage_key: doc.storage_key,
        pending_storage_key: doc.pending_storage_key,
    }
}

fn is_pending_before(doc: &Document, cutoff: NaiveDateTime) -> bool {
    doc.status()
        .map(|status| UploadStatus::PENDING.contains(&status))
        .unwrap_or(false)
        && doc.status_changed_at < cutoff
}

impl OrganisationRepository for MemoryRepository {
    fn insert_organisation(&self, new: NewOrganisation) -> StoreResult<Organisation> {
        let mut tables = self.tables();
        if tables.organisations.values().any(|org| org.slug == new.slug) {
            return Err(StoreError::UniqueViolation(format!(
                "organisation slug {} already exists",
                new.slug
            )));
        }
        let created = now();
        let org = Organisation {
            id: new.id,
            name: new.name,
            slug: new.slug,
            admin_secret_hash: new.admin_secret_hash,
            access_code_hash: new.access_code_hash,
            max_documents_per_asset: new.max_documents_per_asset,
            max_total_documents: new.max_total_documents,
            created_at: created,
            updated_at: created,
        };
        tables.organisations.insert(org.id, org.clone());
        Ok(org)
    }

    fn find_organisation(&self, id: Uuid) -> StoreResult<Option<Organisation>> {
        Ok(self.tables().organisations.get(&id).cloned())
    }

    fn find_organisation_by_slug(&self, slug: &str) -> StoreResult<Option<Organisation>> {
        Ok(self
            .tables()
            .organisations
            .values()
            .find(|org| org.slug == slug)
            .cloned())
    }

    fn update_organisation_secrets(
        &self,
        id: Uuid,
        admin_secret_hash: Option<String>,
        access_code_hash: Option<String>,
        now: NaiveDateTime,
    ) -> StoreResult<bool> {
        let mut tables = self.tables();
        let Some(org) = tables.organisations.get_mut(&id) else {
            return Ok(false);
        };
        if let Some(hash) = admin_secret_hash {
            org.admin_secret_hash = hash;
        }
        if let Some(hash) = access_code_hash {
            org.access_code_hash = hash;
        }
        org.updated_at = now;
        Ok(true)
    }
}

impl SessionRepository for MemoryRepository {
    fn insert_session(&self, new: NewSession) -> StoreResult<Session> {
        let mut tables = self.tables();
        if tables
            .sessions
            .values()
            .any(|session| session.token_hash == new.token_hash)
        {
            return Err(StoreError::UniqueViolation(
                "session token digest already exists".to_string(),
            ));
        }
        let session = Session {
            id: new.id,
            org_id: new.org_id,
            session_kind: new.session_kind,
            token_hash: new.token_hash,
            expires_at: new.expires_at,
            last_seen_at: new.last_seen_at,
            created_at: now(),
        };
        tables.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    fn find_session_by_hash(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        Ok(self
            .tables()
            .sessions
            .values()
            .find(|session| session.token_hash == token_hash)
            .cloned())
    }

    fn delete_session_by_hash(&self, token_hash: &str) -> StoreResult<usize> {
        let mut tables = self.tables();
        let before = tables.sessions.len();
        tables
            .sessions
            .retain(|_, session| session.token_hash != token_hash);
        Ok(before - tables.sessions.len())
    }

    fn delete_expired_sessions(&self, org_id: Uuid, now: NaiveDateTime) -> StoreResult<usize> {
        let mut tables = self.tables();
        let before = tables.sessions.len();
        tables
            .sessions
            .retain(|_, session| !(session.org_id == org_id && session.expires_at <= now));
        Ok(before - tables.sessions.len())
    }

    fn touch_session(&self, session_id: Uuid, now: NaiveDateTime) -> StoreResult<()> {
        if let Some(session) = self.tables().sessions.get_mut(&session_id) {
            session.last_seen_at = now;
        }
        Ok(())
    }
}

impl AssetRepository for MemoryRepository {
    fn insert_asset(&self, new: NewAsset) -> StoreResult<Asset> {
        let mut tables = self.tables();
        if tables
            .assets
            .values()
            .any(|asset| asset.public_token == new.public_token)
        {
            return Err(StoreError::UniqueViolation(
                "asset public token already exists".to_string(),
            ));
        }
        let created = now();
        let asset = Asset {
            id: new.id,
            org_id: new.org_id,
            public_token: new.public_token,
            name: new.name,
            location: new.location,
            notes: new.notes,
            is_public: new.is_public,
            created_at: created,
            updated_at: created,
        };
        tables.assets.insert(asset.id, asset.clone());
        Ok(asset)
    }

    fn find_asset(&self, org_id: Uuid, asset_id: Uuid) -> StoreResult<Option<Asset>> {
        Ok(self
            .tables()
            .assets
            .get(&asset_id)
            .filter(|asset| asset.org_id == org_id)
            .cloned())
    }

    fn find_asset_by_id(&self, asset_id: Uuid) -> StoreResult<Option<Asset>> {
        Ok(self.tables().assets.get(&asset_id).cloned())
    }

    fn find_asset_by_public_token(&self, token: &str) -> StoreResult<Option<Asset>> {
        Ok(self
            .tables()
            .assets
            .values()
            .find(|asset| asset.public_token == token)
            .cloned())
    }

    fn list_assets(&self, org_id: Uuid) -> StoreResult<Vec<Asset>> {
        let mut assets: Vec<Asset> = self
            .tables()
            .assets
            .values()
            .filter(|asset| asset.org_id == org_id)
            .cloned()
            .collect();
        assets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(assets)
    }

    fn update_asset(
        &self,
        org_id: Uuid,
        asset_id: Uuid,
        changes: AssetChanges,
    ) -> StoreResult<Option<Asset>> {
        let mut tables = self.tables();
        let Some(asset) = tables
            .assets
            .get_mut(&asset_id)
            .filter(|asset| asset.org_id == org_id)
        else {
            return Ok(None);
        };
        if let Some(name) = changes.name {
            asset.name = name;
        }
        if let Some(location) = changes.location {
            asset.location = location;
        }
        if let Some(notes) = changes.notes {
            asset.notes = notes;
        }
        if let Some(is_public) = changes.is_public {
            asset.is_public = is_public;
        }
        if let Some(updated_at) = changes.updated_at {
            asset.updated_at = updated_at;
        }
        Ok(Some(asset.clone()))
    }

    fn delete_asset(&self, org_id: Uuid, asset_id: Uuid) -> StoreResult<Option<Vec<String>>> {
        let mut tables = self.tables();
        let owned = tables
            .assets
            .get(&asset_id)
            .map(|asset| asset.org_id == org_id)
            .unwrap_or(false);
        if !owned {
            return Ok(None);
        }
        tables.assets.remove(&asset_id);

        let doomed: Vec<Uuid> = tables
            .documents
            .values()
            .filter(|doc| doc.asset_id == asset_id)
            .map(|doc| doc.id)
            .collect();
        let keys = doomed
            .into_iter()
            .filter_map(|id| tables.documents.remove(&id))
            .flat_map(|doc| released(doc).into_keys())
            .collect();
        Ok(Some(keys))
    }
}

impl DocumentRepository for MemoryRepository {
    fn count_documents_for_asset(&self, asset_id: Uuid) -> StoreResult<i64> {
        Ok(self
            .tables()
            .documents
            .values()
            .filter(|doc| doc.asset_id == asset_id)
            .count() as i64)
    }

    fn count_documents_for_org(&self, org_id: Uuid) -> StoreResult<i64> {
        Ok(self
            .tables()
            .documents
            .values()
            .filter(|doc| doc.org_id == org_id)
            .count() as i64)
    }

    fn insert_document(&self, new: NewDocument) -> StoreResult<Document> {
        let doc = Document {
            id: new.id,
            org_id: new.org_id,
            asset_id: new.asset_id,
            title: new.title,
            filename: new.filename,
            content_type: new.content_type,
            size_bytes: new.size_bytes,
            storage_key: new.storage_key,
            pending_storage_key: None,
            doc_type: new.doc_type,
            notes: new.notes,
            upload_status: new.upload_status,
            uploaded_at: None,
            status_changed_at: new.status_changed_at,
            created_at: now(),
        };
        self.tables().documents.insert(doc.id, doc.clone());
        Ok(doc)
    }

    fn find_document(&self, org_id: Uuid, document_id: Uuid) -> StoreResult<Option<Document>> {
        Ok(self
            .tables()
            .documents
            .get(&document_id)
            .filter(|doc| doc.org_id == org_id)
            .cloned())
    }

    fn find_document_by_id(&self, document_id: Uuid) -> StoreResult<Option<Document>> {
        Ok(self.tables().documents.get(&document_id).cloned())
    }

    fn list_documents_for_asset(&self, asset_id: Uuid) -> StoreResult<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .tables()
            .documents
            .values()
            .filter(|doc| doc.asset_id == asset_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(docs)
    }

    fn list_ready_documents_for_asset(&self, asset_id: Uuid) -> StoreResult<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .tables()
            .documents
            .values()
            .filter(|doc| doc.asset_id == asset_id && doc.has_status(UploadStatus::Ready))
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(docs)
    }

    fn transition_document(&self, transition: &DocumentTransition) -> StoreResult<bool> {
        let mut tables = self.tables();
        let Some(doc) = tables.documents.get_mut(&transition.document_id) else {
            return Ok(false);
        };
        if doc.org_id != transition.org_id
            || !doc.has_status(transition.from)
            || doc.storage_key != transition.expected_storage_key
        {
            return Ok(false);
        }

        let changes = transition.changes.clone();
        doc.upload_status = changes.upload_status;
        doc.status_changed_at = changes.status_changed_at;
        if let Some(uploaded_at) = changes.uploaded_at {
            doc.uploaded_at = Some(uploaded_at);
        }
        if let Some(storage_key) = changes.storage_key {
            doc.storage_key = storage_key;
        }
        if let Some(pending) = changes.pending_storage_key {
            doc.pending_storage_key = pending;
        }
        if let Some(filename) = changes.filename {
            doc.filename = filename;
        }
        if let Some(size_bytes) = changes.size_bytes {
            doc.size_bytes = size_bytes;
        }
        Ok(true)
    }

    fn update_ready_document_metadata(
        &self,
        org_id: Uuid,
        document_id: Uuid,
        changes: DocumentMetadataChanges,
    ) -> StoreResult<Option<Document>> {
        let mut tables = self.tables();
        let Some(doc) = tables
            .documents
            .get_mut(&document_id)
            .filter(|doc| doc.org_id == org_id && doc.has_status(UploadStatus::Ready))
        else {
            return Ok(None);
        };
        if let Some(title) = changes.title {
            doc.title = title;
        }
        if let Some(doc_type) = changes.doc_type {
            doc.doc_type = doc_type;
        }
        if let Some(notes) = changes.notes {
            doc.notes = notes;
        }
        Ok(Some(doc.clone()))
    }

    fn delete_document(
        &self,
        org_id: Uuid,
        document_id: Uuid,
    ) -> StoreResult<Option<ReleasedKeys>> {
        let mut tables = self.tables();
        let owned = tables
            .documents
            .get(&document_id)
            .map(|doc| doc.org_id == org_id)
            .unwrap_or(false);
        if !owned {
            return Ok(None);
        }
        Ok(tables.documents.remove(&document_id).map(released))
    }

    fn find_orphaned_documents(
        &self,
        cutoff: NaiveDateTime,
    ) -> StoreResult<Vec<OrphanCandidate>> {
        let mut orphans: Vec<(NaiveDateTime, OrphanCandidate)> = self
            .tables()
            .documents
            .values()
            .filter(|doc| is_pending_before(doc, cutoff))
            .map(|doc| {
                (
                    doc.status_changed_at,
                    OrphanCandidate {
                        document_id: doc.id,
                        storage_key: doc.storage_key.clone(),
                    },
                )
            })
            .collect();
        orphans.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(orphans.into_iter().map(|(_, candidate)| candidate).collect())
    }

    fn delete_orphaned_document(
        &self,
        document_id: Uuid,
        cutoff: NaiveDateTime,
    ) -> StoreResult<Option<ReleasedKeys>> {
        let mut tables = self.tables();
        let eligible = tables
            .documents
            .get(&document_id)
            .map(|doc| is_pending_before(doc, cutoff))
            .unwrap_or(false);
        if !eligible {
            return Ok(None);
        }
        Ok(tables.documents.remove(&document_id).map(released))
    }
}

impl RateLimitRepository for MemoryRepository {
    fn record_attempt_if_allowed(
        &self,
        key: &str,
        window_start: NaiveDateTime,
        max_attempts: i64,
        now: NaiveDateTime,
    ) -> StoreResult<AttemptDecision> {
        let mut tables = self.tables();
        let in_window: Vec<NaiveDateTime> = tables
            .attempts
            .iter()
            .filter(|(attempt_key, at)| attempt_key == key && *at > window_start)
            .map(|(_, at)| *at)
            .collect();

        if in_window.len() as i64 >= max_attempts {
            let oldest = in_window.into_iter().min().unwrap_or(now);
            return Ok(AttemptDecision::Denied { oldest });
        }

        tables.attempts.push((key.to_string(), now));
        Ok(AttemptDecision::Allowed)
    }

    fn purge_attempts_before(&self, cutoff: NaiveDateTime) -> StoreResult<usize> {
        let mut tables = self.tables();
        let before = tables.attempts.len();
        tables.attempts.retain(|(_, at)| *at >= cutoff);
        Ok(before - tables.attempts.len())
    }
}
