use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::documents::{to_document_response, DocumentResponse};
use super::to_iso;
use crate::models::{Asset, AssetChanges, NewAsset};
use crate::repo::{AssetRepository, DocumentRepository, StoreError};
use crate::state::AppState;
use crate::tasks;
use crate::utils::json::{classify_nullable, NullableValue};
use crate::{
    auth::CurrentSession,
    error::{AppError, AppResult},
};

const MAX_NAME_CHARS: usize = 200;
const MAX_LOCATION_CHARS: usize = 200;
const MAX_NOTES_CHARS: usize = 2000;
const PUBLIC_TOKEN_BYTES: usize = 16;
const PUBLIC_TOKEN_ATTEMPTS: usize = 3;

#[derive(Deserialize)]
pub struct CreateAssetRequest {
    pub name: String,
    pub location: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Serialize)]
pub struct AssetInfo {
    pub id: Uuid,
    pub public_token: String,
    pub name: String,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub is_public: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct AssetListResponse {
    pub assets: Vec<AssetInfo>,
}

#[derive(Serialize)]
pub struct AssetResponse {
    pub asset: AssetInfo,
}

#[derive(Serialize)]
pub struct AssetDetailResponse {
    pub asset: AssetInfo,
    pub documents: Vec<DocumentResponse>,
}

pub async fn list_assets(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    session: CurrentSession,
) -> AppResult<Json<AssetListResponse>> {
    let org = state.organisation_by_slug(&slug)?;
    session.require_admin_for(org.id)?;

    let assets = state
        .repo
        .list_assets(org.id)?
        .into_iter()
        .map(asset_to_info)
        .collect();
    Ok(Json(AssetListResponse { assets }))
}

pub async fn create_asset(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    session: CurrentSession,
    Json(payload): Json<CreateAssetRequest>,
) -> AppResult<(StatusCode, Json<AssetResponse>)> {
    let org = state.organisation_by_slug(&slug)?;
    session.require_admin_for(org.id)?;

    let name = required_text("name", &payload.name, MAX_NAME_CHARS)?;
    let location = optional_text("location", payload.location.as_deref(), MAX_LOCATION_CHARS)?;
    let notes = optional_text("notes", payload.notes.as_deref(), MAX_NOTES_CHARS)?;

    let mut attempt = 0;
    let asset = loop {
        attempt += 1;
        let new_asset = NewAsset {
            id: Uuid::new_v4(),
            org_id: org.id,
            public_token: generate_public_token(),
            name: name.clone(),
            location: location.clone(),
            notes: notes.clone(),
            is_public: payload.is_public,
        };
        match state.repo.insert_asset(new_asset) {
            Ok(asset) => break asset,
            Err(StoreError::UniqueViolation(_)) if attempt < PUBLIC_TOKEN_ATTEMPTS => {
                tracing::warn!(org_id = %org.id, attempt, "public token collision, retrying");
            }
            Err(err) => return Err(err.into()),
        }
    };

    tracing::info!(org_id = %org.id, asset_id = %asset.id, "asset created");
    Ok((
        StatusCode::CREATED,
        Json(AssetResponse {
            asset: asset_to_info(asset),
        }),
    ))
}

pub async fn get_asset(
    State(state): State<AppState>,
    Path((slug, asset_id)): Path<(String, Uuid)>,
    session: CurrentSession,
) -> AppResult<Json<AssetDetailResponse>> {
    let org = state.organisation_by_slug(&slug)?;
    session.require_admin_for(org.id)?;

    let asset = state
        .repo
        .find_asset(org.id, asset_id)?
        .ok_or_else(AppError::not_found)?;
    let documents = state
        .repo
        .list_documents_for_asset(asset.id)?
        .into_iter()
        .map(to_document_response)
        .collect();

    Ok(Json(AssetDetailResponse {
        asset: asset_to_info(asset),
        documents,
    }))
}

/// Accepts `name`, `location`, `notes` and `is_public`. An explicit `null`
/// clears `location` or `notes`; an omitted field is left as is.
pub async fn update_asset(
    State(state): State<AppState>,
    Path((slug, asset_id)): Path<(String, Uuid)>,
    session: CurrentSession,
    Json(body): Json<Value>,
) -> AppResult<Json<AssetResponse>> {
    let org = state.organisation_by_slug(&slug)?;
    session.require_admin_for(org.id)?;

    let mut changes = AssetChanges {
        updated_at: Some(Utc::now().naive_utc()),
        ..AssetChanges::default()
    };

    match classify_nullable(body.get("name")).map_err(AppError::bad_request)? {
        NullableValue::Omitted => {}
        NullableValue::Null => return Err(AppError::bad_request("name cannot be null")),
        NullableValue::String(value) => {
            changes.name = Some(required_text("name", &value, MAX_NAME_CHARS)?);
        }
    }
    changes.location = nullable_change(
        "location",
        classify_nullable(body.get("location")).map_err(AppError::bad_request)?,
        MAX_LOCATION_CHARS,
    )?;
    changes.notes = nullable_change(
        "notes",
        classify_nullable(body.get("notes")).map_err(AppError::bad_request)?,
        MAX_NOTES_CHARS,
    )?;
    changes.is_public = match body.get("is_public") {
        None => None,
        Some(Value::Bool(flag)) => Some(*flag),
        Some(other) => {
            return Err(AppError::bad_request(format!(
                "is_public must be a boolean, got {other}"
            )))
        }
    };

    let asset = state
        .repo
        .update_asset(org.id, asset_id, changes)?
        .ok_or_else(AppError::not_found)?;
    Ok(Json(AssetResponse {
        asset: asset_to_info(asset),
    }))
}

pub async fn delete_asset(
    State(state): State<AppState>,
    Path((slug, asset_id)): Path<(String, Uuid)>,
    session: CurrentSession,
) -> AppResult<StatusCode> {
    let org = state.organisation_by_slug(&slug)?;
    session.require_admin_for(org.id)?;

    let keys = state
        .repo
        .delete_asset(org.id, asset_id)?
        .ok_or_else(AppError::not_found)?;
    tracing::info!(
        org_id = %org.id,
        asset_id = %asset_id,
        released = keys.len(),
        "asset deleted"
    );
    tasks::spawn_delete_objects(state.storage.clone(), keys);

    Ok(StatusCode::NO_CONTENT)
}

pub(crate) fn asset_to_info(asset: Asset) -> AssetInfo {
    AssetInfo {
        id: asset.id,
        public_token: asset.public_token,
        name: asset.name,
        location: asset.location,
        notes: asset.notes,
        is_public: asset.is_public,
        created_at: to_iso(asset.created_at),
        updated_at: to_iso(asset.updated_at),
    }
}

fn generate_public_token() -> String {
    let mut bytes = [0u8; PUBLIC_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn required_text(field: &str, value: &str, max: usize) -> AppResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::bad_request(format!("{field} must not be empty")));
    }
    if trimmed.chars().count() > max {
        return Err(AppError::bad_request(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn optional_text(field: &str, value: Option<&str>, max: usize) -> AppResult<Option<String>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(trimmed) if trimmed.chars().count() > max => Err(AppError::bad_request(format!(
            "{field} must be at most {max} characters"
        ))),
        Some(trimmed) => Ok(Some(trimmed.to_string())),
    }
}

fn nullable_change(
    field: &str,
    value: NullableValue,
    max: usize,
) -> AppResult<Option<Option<String>>> {
    match value {
        NullableValue::Omitted => Ok(None),
        NullableValue::Null => Ok(Some(None)),
        NullableValue::String(value) => Ok(Some(optional_text(field, Some(&value), max)?)),
    }
}
