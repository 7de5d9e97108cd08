mod common;

use anyhow::Result;
use axum::http::{header, StatusCode};
use common::{body_json, TestApp};
use serde_json::json;
use uuid::Uuid;

fn asset_id(asset: &serde_json::Value) -> String {
    asset["id"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn upload_lifecycle_over_http() -> Result<()> {
    let app = TestApp::new();
    let token = app.create_org("harbour").await?;
    let asset = app.create_asset("harbour", &token, true).await?;
    let asset_id = asset_id(&asset);
    let base = format!("/api/o/harbour/admin/assets/{asset_id}/documents");

    let response = app
        .post_json(
            &format!("{base}/init-upload"),
            &json!({
                "filename": "Service Manual.pdf",
                "content_type": "application/pdf",
                "size_bytes": 4096,
                "doc_type": "manual",
            }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let initiated = body_json(response).await?;
    let document_id = initiated["document_id"].as_str().unwrap_or_default().to_string();
    let storage_key = initiated["storage_key"].as_str().unwrap_or_default().to_string();
    assert!(storage_key.starts_with("org/"));
    assert!(storage_key.ends_with("-Service_Manual.pdf"));
    assert!(initiated["upload_url"].as_str().unwrap_or_default().contains(&storage_key));
    assert_eq!(initiated["expires_in"], 300);

    let finalize = json!({ "document_id": document_id, "storage_key": storage_key });

    // Object not written yet.
    let response = app
        .post_json(&format!("{base}/finalize-upload"), &finalize, Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await?["code"], "not_yet_visible");

    // Invisible to readers while uploading.
    let response = app.get(&format!("/d/{document_id}"), None).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.storage()
        .put(&storage_key, 4096, Some("application/pdf"))
        .await;

    let response = app
        .post_json(&format!("{base}/finalize-upload"), &finalize, Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await?;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["title"], "Service Manual");

    let response = app
        .post_json(&format!("{base}/finalize-upload"), &finalize, Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await?["code"], "already_finalized");

    let response = app.get(&format!("/d/{document_id}"), None).await?;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    assert!(location.contains(&storage_key));
    Ok(())
}

#[tokio::test]
async fn finalize_with_wrong_key_is_a_conflict() -> Result<()> {
    let app = TestApp::new();
    let token = app.create_org("harbour").await?;
    let asset_id = asset_id(&app.create_asset("harbour", &token, false).await?);
    let base = format!("/api/o/harbour/admin/assets/{asset_id}/documents");

    let response = app
        .post_json(
            &format!("{base}/init-upload"),
            &json!({
                "filename": "a.pdf",
                "content_type": "application/pdf",
                "size_bytes": 10,
            }),
            Some(&token),
        )
        .await?;
    let initiated = body_json(response).await?;
    app.storage().put("somewhere/else.pdf", 10, None).await;

    let response = app
        .post_json(
            &format!("{base}/finalize-upload"),
            &json!({
                "document_id": initiated["document_id"],
                "storage_key": "somewhere/else.pdf",
            }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await?["code"], "storage_key_mismatch");
    Ok(())
}

#[tokio::test]
async fn init_upload_rejects_invalid_declarations() -> Result<()> {
    let app = TestApp::new();
    let token = app.create_org("harbour").await?;
    let asset_id = asset_id(&app.create_asset("harbour", &token, false).await?);
    let path = format!("/api/o/harbour/admin/assets/{asset_id}/documents/init-upload");

    for payload in [
        json!({ "filename": "a.png", "content_type": "image/png", "size_bytes": 10 }),
        json!({ "filename": "a.pdf", "content_type": "application/pdf", "size_bytes": 0 }),
        json!({ "filename": "", "content_type": "application/pdf", "size_bytes": 10 }),
        json!({
            "filename": "a.pdf",
            "content_type": "application/pdf",
            "size_bytes": 200 * 1024 * 1024,
        }),
    ] {
        let response = app.post_json(&path, &payload, Some(&token)).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{payload}");
    }
    assert_eq!(app.repo().document_count(), 0);

    let response = app
        .post_json(
            &format!(
                "/api/o/harbour/admin/assets/{}/documents/init-upload",
                Uuid::new_v4()
            ),
            &json!({ "filename": "a.pdf", "content_type": "application/pdf", "size_bytes": 10 }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn per_asset_quota_is_enforced() -> Result<()> {
    let app = TestApp::with_config(|config| config.default_max_documents_per_asset = 2);
    let token = app.create_org("harbour").await?;
    let asset_id = asset_id(&app.create_asset("harbour", &token, false).await?);

    app.upload_ready_document("harbour", &token, &asset_id, "one.pdf")
        .await?;
    app.upload_ready_document("harbour", &token, &asset_id, "two.pdf")
        .await?;

    let response = app
        .post_json(
            &format!("/api/o/harbour/admin/assets/{asset_id}/documents/init-upload"),
            &json!({ "filename": "three.pdf", "content_type": "application/pdf", "size_bytes": 10 }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await?["code"], "quota_exceeded");
    Ok(())
}

#[tokio::test]
async fn replace_swaps_content_and_removes_old_object() -> Result<()> {
    let app = TestApp::new();
    let token = app.create_org("harbour").await?;
    let asset_id = asset_id(&app.create_asset("harbour", &token, true).await?);
    let (document_id, old_key) = app
        .upload_ready_document("harbour", &token, &asset_id, "v1.pdf")
        .await?;
    let base = format!("/api/o/harbour/admin/documents/{document_id}");
    let replacement = json!({
        "filename": "v2.pdf",
        "content_type": "application/pdf",
        "size_bytes": 8192,
    });

    let response = app
        .post_json(&format!("{base}/init-replace"), &replacement, Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let initiated = body_json(response).await?;
    assert_eq!(initiated["old_storage_key"], old_key.as_str());
    let new_key = initiated["new_storage_key"].as_str().unwrap_or_default().to_string();
    assert_ne!(new_key, old_key);

    // A second replace loses the race.
    let response = app
        .post_json(&format!("{base}/init-replace"), &replacement, Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await?["code"], "not_replaceable");

    // Readers are not served while the document is being replaced.
    let response = app.get(&format!("/d/{document_id}"), None).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.storage()
        .put(&new_key, 8192, Some("application/pdf"))
        .await;
    let response = app
        .post_json(
            &format!("{base}/finalize-replace"),
            &json!({
                "new_storage_key": new_key,
                "old_storage_key": old_key,
                "filename": "v2.pdf",
                "size_bytes": 8192,
            }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["document"]["filename"], "v2.pdf");
    assert_eq!(body["document"]["size_bytes"], 8192);
    assert_eq!(body["document"]["status"], "ready");

    assert!(app.wait_for_delete(&old_key).await);
    assert!(app.storage().contains(&new_key).await);

    let response = app.get(&format!("/d/{document_id}"), None).await?;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    Ok(())
}

#[tokio::test]
async fn finalize_replace_requires_the_replacing_state() -> Result<()> {
    let app = TestApp::new();
    let token = app.create_org("harbour").await?;
    let asset_id = asset_id(&app.create_asset("harbour", &token, false).await?);
    let (document_id, old_key) = app
        .upload_ready_document("harbour", &token, &asset_id, "v1.pdf")
        .await?;

    let response = app
        .post_json(
            &format!("/api/o/harbour/admin/documents/{document_id}/finalize-replace"),
            &json!({
                "new_storage_key": "org/x/new.pdf",
                "old_storage_key": old_key,
                "filename": "v2.pdf",
                "size_bytes": 10,
            }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await?["code"], "not_replacing");
    Ok(())
}

#[tokio::test]
async fn metadata_updates_and_deletes() -> Result<()> {
    let app = TestApp::new();
    let token = app.create_org("harbour").await?;
    let asset_id = asset_id(&app.create_asset("harbour", &token, false).await?);
    let (document_id, storage_key) = app
        .upload_ready_document("harbour", &token, &asset_id, "manual.pdf")
        .await?;
    let path = format!("/api/o/harbour/admin/documents/{document_id}");

    let response = app
        .patch_json(
            &path,
            &json!({ "title": "  Pump manual ", "notes": "Keep dry" }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["document"]["title"], "Pump manual");
    assert_eq!(body["document"]["notes"], "Keep dry");

    let response = app
        .patch_json(&path, &json!({ "notes": null }), Some(&token))
        .await?;
    assert_eq!(body_json(response).await?["document"]["notes"], serde_json::Value::Null);

    let response = app.patch_json(&path, &json!({}), Some(&token)).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .patch_json(&path, &json!({ "title": null }), Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.delete(&path, Some(&token)).await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(app.wait_for_delete(&storage_key).await);

    let response = app.delete(&path, Some(&token)).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn document_routes_require_an_admin_session() -> Result<()> {
    let app = TestApp::new();
    let token = app.create_org("harbour").await?;
    let asset_id = asset_id(&app.create_asset("harbour", &token, false).await?);

    let response = app
        .post_json(
            &format!("/api/o/harbour/admin/assets/{asset_id}/documents/init-upload"),
            &json!({ "filename": "a.pdf", "content_type": "application/pdf", "size_bytes": 10 }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .post_json(
            &format!("/api/o/harbour/admin/assets/{asset_id}/documents/init-upload"),
            &json!({ "filename": "a.pdf", "content_type": "application/pdf", "size_bytes": 10 }),
            Some("not-a-real-token"),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.repo().document_count(), 0);
    Ok(())
}
