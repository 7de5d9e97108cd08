use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::to_iso;
use crate::models::{Document, DocumentMetadataChanges};
use crate::repo::DocumentRepository;
use crate::state::AppState;
use crate::uploads::{DeclaredReplacement, DeclaredUpload, ReplacementCommit};
use crate::utils::json::{classify_nullable, NullableValue};
use crate::{
    auth::CurrentSession,
    error::{AppError, AppResult},
};

#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub title: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub doc_type: Option<String>,
    pub notes: Option<String>,
    pub status: String,
    pub uploaded_at: Option<String>,
    pub created_at: String,
}

#[derive(Serialize)]
pub struct InitUploadResponse {
    pub document_id: Uuid,
    pub storage_key: String,
    pub upload_url: String,
    pub expires_in: u64,
}

#[derive(Deserialize)]
pub struct FinalizeUploadRequest {
    pub document_id: Uuid,
    pub storage_key: String,
}

#[derive(Serialize)]
pub struct FinalizeUploadResponse {
    pub document_id: Uuid,
    pub title: String,
    pub status: String,
}

#[derive(Serialize)]
pub struct InitReplaceResponse {
    pub document_id: Uuid,
    pub new_storage_key: String,
    pub old_storage_key: String,
    pub upload_url: String,
    pub expires_in: u64,
}

#[derive(Deserialize)]
pub struct FinalizeReplaceRequest {
    pub new_storage_key: String,
    pub old_storage_key: String,
    pub filename: String,
    pub size_bytes: i64,
}

#[derive(Serialize)]
pub struct DocumentEnvelope {
    pub document: DocumentResponse,
}

pub async fn init_upload(
    State(state): State<AppState>,
    Path((slug, asset_id)): Path<(String, Uuid)>,
    session: CurrentSession,
    Json(payload): Json<DeclaredUpload>,
) -> AppResult<Json<InitUploadResponse>> {
    let org = state.organisation_by_slug(&slug)?;
    session.require_admin_for(org.id)?;

    let initiated = state.uploads.init_upload(&org, asset_id, payload).await?;

    Ok(Json(InitUploadResponse {
        document_id: initiated.document.id,
        storage_key: initiated.document.storage_key,
        upload_url: initiated.upload_url,
        expires_in: initiated.expires_in,
    }))
}

pub async fn finalize_upload(
    State(state): State<AppState>,
    Path((slug, asset_id)): Path<(String, Uuid)>,
    session: CurrentSession,
    Json(payload): Json<FinalizeUploadRequest>,
) -> AppResult<(StatusCode, Json<FinalizeUploadResponse>)> {
    let org = state.organisation_by_slug(&slug)?;
    session.require_admin_for(org.id)?;

    // The document must hang off the asset named in the path.
    state
        .repo
        .find_document(org.id, payload.document_id)?
        .filter(|document| document.asset_id == asset_id)
        .ok_or_else(AppError::not_found)?;

    let document = state
        .uploads
        .finalize_upload(org.id, payload.document_id, &payload.storage_key)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(FinalizeUploadResponse {
            document_id: document.id,
            title: document.title,
            status: document.upload_status,
        }),
    ))
}

pub async fn init_replace(
    State(state): State<AppState>,
    Path((slug, document_id)): Path<(String, Uuid)>,
    session: CurrentSession,
    Json(payload): Json<DeclaredReplacement>,
) -> AppResult<Json<InitReplaceResponse>> {
    let org = state.organisation_by_slug(&slug)?;
    session.require_admin_for(org.id)?;

    let initiated = state
        .uploads
        .init_replace(org.id, document_id, payload)
        .await?;

    Ok(Json(InitReplaceResponse {
        document_id: initiated.document_id,
        new_storage_key: initiated.new_storage_key,
        old_storage_key: initiated.old_storage_key,
        upload_url: initiated.upload_url,
        expires_in: initiated.expires_in,
    }))
}

pub async fn finalize_replace(
    State(state): State<AppState>,
    Path((slug, document_id)): Path<(String, Uuid)>,
    session: CurrentSession,
    Json(payload): Json<FinalizeReplaceRequest>,
) -> AppResult<Json<DocumentEnvelope>> {
    let org = state.organisation_by_slug(&slug)?;
    session.require_admin_for(org.id)?;

    let document = state
        .uploads
        .finalize_replace(
            org.id,
            document_id,
            ReplacementCommit {
                new_storage_key: payload.new_storage_key,
                old_storage_key: payload.old_storage_key,
                filename: payload.filename,
                size_bytes: payload.size_bytes,
            },
        )
        .await?;

    Ok(Json(DocumentEnvelope {
        document: to_document_response(document),
    }))
}

/// Metadata edits on a `ready` document. `doc_type` and `notes` accept an
/// explicit `null` to clear them; `title` cannot be cleared.
pub async fn update_document(
    State(state): State<AppState>,
    Path((slug, document_id)): Path<(String, Uuid)>,
    session: CurrentSession,
    Json(body): Json<Value>,
) -> AppResult<Json<DocumentEnvelope>> {
    let org = state.organisation_by_slug(&slug)?;
    session.require_admin_for(org.id)?;

    let title = match classify_nullable(body.get("title")).map_err(AppError::bad_request)? {
        NullableValue::Omitted => None,
        NullableValue::Null => return Err(AppError::bad_request("title cannot be null")),
        NullableValue::String(value) => Some(value),
    };
    let changes = DocumentMetadataChanges {
        title,
        doc_type: nullable_to_change(
            classify_nullable(body.get("doc_type")).map_err(AppError::bad_request)?,
        ),
        notes: nullable_to_change(
            classify_nullable(body.get("notes")).map_err(AppError::bad_request)?,
        ),
    };

    let document = state
        .uploads
        .update_metadata(org.id, document_id, changes)?;
    Ok(Json(DocumentEnvelope {
        document: to_document_response(document),
    }))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path((slug, document_id)): Path<(String, Uuid)>,
    session: CurrentSession,
) -> AppResult<StatusCode> {
    let org = state.organisation_by_slug(&slug)?;
    session.require_admin_for(org.id)?;

    state.uploads.delete(org.id, document_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) fn to_document_response(document: Document) -> DocumentResponse {
    DocumentResponse {
        id: document.id,
        asset_id: document.asset_id,
        title: document.title,
        filename: document.filename,
        content_type: document.content_type,
        size_bytes: document.size_bytes,
        doc_type: document.doc_type,
        notes: document.notes,
        status: document.upload_status,
        uploaded_at: document.uploaded_at.map(to_iso),
        created_at: to_iso(document.created_at),
    }
}

fn nullable_to_change(value: NullableValue) -> Option<Option<String>> {
    match value {
        NullableValue::Omitted => None,
        NullableValue::Null => Some(None),
        NullableValue::String(value) => Some(Some(value)),
    }
}
