use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::Redirect,
};
use serde::Serialize;
use uuid::Uuid;

use super::documents::{to_document_response, DocumentResponse};
use crate::repo::{AssetRepository, DocumentRepository, OrganisationRepository};
use crate::state::AppState;
use crate::{
    auth::CurrentSession,
    error::{AppError, AppResult},
};

#[derive(Serialize)]
pub struct PublicAssetResponse {
    pub org_name: String,
    pub name: String,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub is_public: bool,
    pub documents: Vec<DocumentResponse>,
}

/// What a QR scan shows. Private assets need a session of the owning
/// organisation; without one the caller is told to redeem the access code.
pub async fn view_asset(
    State(state): State<AppState>,
    Path(token): Path<String>,
    session: Option<CurrentSession>,
) -> AppResult<Json<PublicAssetResponse>> {
    let asset = state
        .repo
        .find_asset_by_public_token(&token)?
        .ok_or_else(AppError::not_found)?;

    let same_org = session
        .as_ref()
        .map(|current| current.org_id() == asset.org_id)
        .unwrap_or(false);
    if !asset.is_public && !same_org {
        return Err(
            AppError::new(StatusCode::UNAUTHORIZED, "access code required")
                .with_code("access_code_required"),
        );
    }

    let org = state
        .repo
        .find_organisation(asset.org_id)?
        .ok_or_else(AppError::not_found)?;
    let documents = state
        .repo
        .list_ready_documents_for_asset(asset.id)?
        .into_iter()
        .map(to_document_response)
        .collect();

    Ok(Json(PublicAssetResponse {
        org_name: org.name,
        name: asset.name,
        location: asset.location,
        notes: asset.notes,
        is_public: asset.is_public,
        documents,
    }))
}

/// Redirects to a short-lived signed read URL. Anything the caller may not
/// see is reported as not found.
pub async fn download_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    session: Option<CurrentSession>,
) -> AppResult<Redirect> {
    let session_org = session.as_ref().map(CurrentSession::org_id);

    let resolved = state
        .uploads
        .resolve_ready(document_id, |asset| {
            asset.is_public || session_org == Some(asset.org_id)
        })
        .await?;

    tracing::debug!(document_id = %resolved.document.id, "serving signed download");
    Ok(Redirect::temporary(&resolved.url))
}
