#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use qrdocs::config::AppConfig;
use qrdocs::repo::MemoryRepository;
use qrdocs::routes;
use qrdocs::state::AppState;
use qrdocs::storage::MemoryStorage;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

pub const ADMIN_PASSWORD: &str = "correct-horse";
pub const ACCESS_CODE: &str = "field-1234";

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// How a request presents its session token.
#[derive(Clone, Copy)]
pub enum Auth<'a> {
    None,
    Bearer(&'a str),
    Cookie(&'a str),
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    repo: Arc<MemoryRepository>,
    storage: Arc<MemoryStorage>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        let mut config = AppConfig::for_local("postgres://localhost/qrdocs_test");
        configure(&mut config);

        let repo = Arc::new(MemoryRepository::new());
        let storage = Arc::new(MemoryStorage::new());
        let state = AppState::new(repo.clone(), config, storage.clone());
        let router = routes::create_router(state.clone());

        Self {
            state,
            router,
            repo,
            storage,
        }
    }

    pub fn repo(&self) -> Arc<MemoryRepository> {
        self.repo.clone()
    }

    pub fn storage(&self) -> Arc<MemoryStorage> {
        self.storage.clone()
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Option<&Value>,
        auth: Auth<'_>,
        client_ip: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(method).uri(path);
        match auth {
            Auth::None => {}
            Auth::Bearer(token) => {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
            }
            Auth::Cookie(token) => {
                builder = builder.header(header::COOKIE, format!("session={token}"));
            }
        }
        if let Some(ip) = client_ip {
            builder = builder.header("x-forwarded-for", ip);
        }
        let body = match payload {
            Some(payload) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(payload)?)
            }
            None => Body::empty(),
        };
        let request = builder.body(body)?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn post_json(
        &self,
        path: &str,
        payload: &Value,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.request(Method::POST, path, Some(payload), bearer(token), None)
            .await
    }

    pub async fn patch_json(
        &self,
        path: &str,
        payload: &Value,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.request(Method::PATCH, path, Some(payload), bearer(token), None)
            .await
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        self.request(Method::GET, path, None, bearer(token), None)
            .await
    }

    pub async fn delete(
        &self,
        path: &str,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.request(Method::DELETE, path, None, bearer(token), None)
            .await
    }

    /// Signs up an organisation and returns the admin token it was issued.
    pub async fn create_org(&self, slug: &str) -> Result<String> {
        let payload = json!({
            "name": format!("Org {slug}"),
            "slug": slug,
            "admin_password": ADMIN_PASSWORD,
            "access_code": ACCESS_CODE,
        });
        // A distinct address per signup keeps the signup limit out of the way.
        let ip = format!("198.51.100.{}", Uuid::new_v4().as_u128() % 250);
        let response = self
            .request(Method::POST, "/api/orgs", Some(&payload), Auth::None, Some(&ip))
            .await?;
        ensure!(
            response.status() == StatusCode::CREATED,
            "org creation failed with status {}",
            response.status()
        );
        token_from(response).await
    }

    pub async fn login(&self, slug: &str, password: &str) -> Result<hyper::Response<Body>> {
        self.post_json(
            &format!("/api/o/{slug}/admin/login"),
            &json!({ "password": password }),
            None,
        )
        .await
    }

    pub async fn create_asset(&self, slug: &str, token: &str, is_public: bool) -> Result<Value> {
        let response = self
            .post_json(
                &format!("/api/o/{slug}/admin/assets"),
                &json!({
                    "name": "Boiler 3",
                    "location": "Plant room",
                    "is_public": is_public,
                }),
                Some(token),
            )
            .await?;
        ensure!(
            response.status() == StatusCode::CREATED,
            "asset creation failed with status {}",
            response.status()
        );
        Ok(body_json(response).await?["asset"].clone())
    }

    /// Runs init-upload, stores the object and finalizes it.
    pub async fn upload_ready_document(
        &self,
        slug: &str,
        token: &str,
        asset_id: &str,
        filename: &str,
    ) -> Result<(Uuid, String)> {
        let response = self
            .post_json(
                &format!("/api/o/{slug}/admin/assets/{asset_id}/documents/init-upload"),
                &json!({
                    "filename": filename,
                    "content_type": "application/pdf",
                    "size_bytes": 2048,
                }),
                Some(token),
            )
            .await?;
        ensure!(
            response.status() == StatusCode::OK,
            "init-upload failed with status {}",
            response.status()
        );
        let initiated = body_json(response).await?;
        let document_id: Uuid = serde_json::from_value(initiated["document_id"].clone())?;
        let storage_key = initiated["storage_key"]
            .as_str()
            .ok_or_else(|| anyhow!("storage_key missing"))?
            .to_string();

        self.storage
            .put(&storage_key, 2048, Some("application/pdf"))
            .await;

        let response = self
            .post_json(
                &format!("/api/o/{slug}/admin/assets/{asset_id}/documents/finalize-upload"),
                &json!({ "document_id": document_id, "storage_key": storage_key }),
                Some(token),
            )
            .await?;
        ensure!(
            response.status() == StatusCode::CREATED,
            "finalize-upload failed with status {}",
            response.status()
        );
        Ok((document_id, storage_key))
    }

    /// Lets spawned best-effort tasks run until `key` is gone.
    pub async fn wait_for_delete(&self, key: &str) -> bool {
        for _ in 0..50 {
            if !self.storage.contains(key).await {
                return true;
            }
            tokio::task::yield_now().await;
        }
        false
    }
}

fn bearer(token: Option<&str>) -> Auth<'_> {
    token.map(Auth::Bearer).unwrap_or(Auth::None)
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn body_json(response: hyper::Response<Body>) -> Result<Value> {
    let body = body_to_vec(response.into_body()).await?;
    serde_json::from_slice(&body).context("response body is not JSON")
}

pub async fn token_from(response: hyper::Response<Body>) -> Result<String> {
    let body = body_json(response).await?;
    body["token"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("token missing from response"))
}
