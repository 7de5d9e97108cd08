use std::fmt;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = organisations)]
pub struct Organisation {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub admin_secret_hash: String,
    pub access_code_hash: String,
    pub max_documents_per_asset: i32,
    pub max_total_documents: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = organisations)]
pub struct NewOrganisation {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub admin_secret_hash: String,
    pub access_code_hash: String,
    pub max_documents_per_asset: i32,
    pub max_total_documents: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Admin,
    Field,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Admin => "admin",
            SessionKind::Field => "field",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(SessionKind::Admin),
            "field" => Some(SessionKind::Field),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = sessions)]
#[diesel(belongs_to(Organisation, foreign_key = org_id))]
pub struct Session {
    pub id: Uuid,
    pub org_id: Uuid,
    pub session_kind: String,
    pub token_hash: String,
    pub expires_at: NaiveDateTime,
    pub last_seen_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

impl Session {
    pub fn kind(&self) -> Option<SessionKind> {
        SessionKind::parse(&self.session_kind)
    }

    pub fn is_admin_for(&self, org_id: Uuid) -> bool {
        self.org_id == org_id && self.kind() == Some(SessionKind::Admin)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = sessions)]
pub struct NewSession {
    pub id: Uuid,
    pub org_id: Uuid,
    pub session_kind: String,
    pub token_hash: String,
    pub expires_at: NaiveDateTime,
    pub last_seen_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = assets)]
#[diesel(belongs_to(Organisation, foreign_key = org_id))]
pub struct Asset {
    pub id: Uuid,
    pub org_id: Uuid,
    pub public_token: String,
    pub name: String,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub is_public: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = assets)]
pub struct NewAsset {
    pub id: Uuid,
    pub org_id: Uuid,
    pub public_token: String,
    pub name: String,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub is_public: bool,
}

#[derive(Debug, Clone, Default, AsChangeset)]
#[diesel(table_name = assets)]
pub struct AssetChanges {
    pub name: Option<String>,
    pub location: Option<Option<String>>,
    pub notes: Option<Option<String>>,
    pub is_public: Option<bool>,
    pub updated_at: Option<NaiveDateTime>,
}

/// Where a document sits in the upload protocol. A missing row stands for
/// "deleted" or "never existed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadStatus {
    Uploading,
    Ready,
    Replacing,
}

impl UploadStatus {
    pub const PENDING: [UploadStatus; 2] = [UploadStatus::Uploading, UploadStatus::Replacing];

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Uploading => "uploading",
            UploadStatus::Ready => "ready",
            UploadStatus::Replacing => "replacing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "uploading" => Some(UploadStatus::Uploading),
            "ready" => Some(UploadStatus::Ready),
            "replacing" => Some(UploadStatus::Replacing),
            _ => None,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = documents)]
#[diesel(belongs_to(Asset))]
pub struct Document {
    pub id: Uuid,
    pub org_id: Uuid,
    pub asset_id: Uuid,
    pub title: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub storage_key: String,
    pub pending_storage_key: Option<String>,
    pub doc_type: Option<String>,
    pub notes: Option<String>,
    pub upload_status: String,
    pub uploaded_at: Option<NaiveDateTime>,
    pub status_changed_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

impl Document {
    pub fn status(&self) -> Option<UploadStatus> {
        UploadStatus::parse(&self.upload_status)
    }

    pub fn has_status(&self, status: UploadStatus) -> bool {
        self.status() == Some(status)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub org_id: Uuid,
    pub asset_id: Uuid,
    pub title: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub storage_key: String,
    pub doc_type: Option<String>,
    pub notes: Option<String>,
    pub upload_status: String,
    pub status_changed_at: NaiveDateTime,
}

/// Column updates applied by a state transition. `None` leaves a column
/// untouched; `pending_storage_key: Some(None)` clears it.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = documents)]
pub struct DocumentChanges {
    pub upload_status: String,
    pub status_changed_at: NaiveDateTime,
    pub uploaded_at: Option<NaiveDateTime>,
    pub storage_key: Option<String>,
    pub pending_storage_key: Option<Option<String>>,
    pub filename: Option<String>,
    pub size_bytes: Option<i64>,
}

impl DocumentChanges {
    pub fn to_status(status: UploadStatus, now: NaiveDateTime) -> Self {
        Self {
            upload_status: status.as_str().to_string(),
            status_changed_at: now,
            uploaded_at: None,
            storage_key: None,
            pending_storage_key: None,
            filename: None,
            size_bytes: None,
        }
    }
}

/// A compare-and-swap on a single document row: the changes apply only if the
/// row still belongs to `org_id`, is in state `from` and still points at
/// `expected_storage_key`.
#[derive(Debug, Clone)]
pub struct DocumentTransition {
    pub document_id: Uuid,
    pub org_id: Uuid,
    pub from: UploadStatus,
    pub expected_storage_key: String,
    pub changes: DocumentChanges,
}

#[derive(Debug, Clone, Default, AsChangeset)]
#[diesel(table_name = documents)]
pub struct DocumentMetadataChanges {
    pub title: Option<String>,
    pub doc_type: Option<Option<String>>,
    pub notes: Option<Option<String>>,
}

impl DocumentMetadataChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.doc_type.is_none() && self.notes.is_none()
    }
}

/// Blob keys released when a document row is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedKeys {
    pub storage_key: String,
    pub pending_storage_key: Option<String>,
}

impl ReleasedKeys {
    pub fn into_keys(self) -> Vec<String> {
        let mut keys = vec![self.storage_key];
        keys.extend(self.pending_storage_key);
        keys
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = rate_limit_attempts)]
pub struct NewRateLimitAttempt<'a> {
    pub key: &'a str,
    pub created_at: NaiveDateTime,
}
