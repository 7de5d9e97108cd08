use std::env;

use anyhow::{Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub cors_allowed_origin: Option<String>,
    pub session_cookie_secure: bool,
    pub session_cookie_domain: Option<String>,
    pub admin_session_ttl_days: i64,
    pub field_session_ttl_days: i64,
    pub aws_endpoint_url: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: String,
    pub s3_bucket: String,
    pub upload_max_bytes: i64,
    pub upload_url_expiry_seconds: u64,
    pub download_url_expiry_seconds: u64,
    pub orphan_max_age_minutes: i64,
    pub orphan_sweep_interval_seconds: Option<u64>,
    pub cron_secret: Option<String>,
    pub default_max_documents_per_asset: i32,
    pub default_max_total_documents: i32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("SERVER_PORT must be a valid u16")?;
        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN").ok();
        let session_cookie_secure = env::var("SESSION_COOKIE_SECURE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let session_cookie_domain = env::var("SESSION_COOKIE_DOMAIN").ok();
        let admin_session_ttl_days = env::var("ADMIN_SESSION_TTL_DAYS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("ADMIN_SESSION_TTL_DAYS must be an integer")?;
        let field_session_ttl_days = env::var("FIELD_SESSION_TTL_DAYS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("FIELD_SESSION_TTL_DAYS must be an integer")?;
        let aws_endpoint_url = env::var("AWS_ENDPOINT_URL").ok();
        let aws_access_key_id = env::var("AWS_ACCESS_KEY_ID").ok();
        let aws_secret_access_key = env::var("AWS_SECRET_ACCESS_KEY").ok();
        let aws_region = env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let s3_bucket = env::var("S3_BUCKET").context("S3_BUCKET must be set")?;
        let upload_max_bytes = env::var("UPLOAD_MAX_BYTES")
            .unwrap_or_else(|_| (100 * 1024 * 1024).to_string())
            .parse()
            .context("UPLOAD_MAX_BYTES must be an integer")?;
        let upload_url_expiry_seconds = env::var("UPLOAD_URL_EXPIRY_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .context("UPLOAD_URL_EXPIRY_SECONDS must be an integer")?;
        let download_url_expiry_seconds = env::var("DOWNLOAD_URL_EXPIRY_SECONDS")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .context("DOWNLOAD_URL_EXPIRY_SECONDS must be an integer")?;
        let orphan_max_age_minutes = env::var("ORPHAN_MAX_AGE_MINUTES")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .context("ORPHAN_MAX_AGE_MINUTES must be an integer")?;
        let orphan_sweep_interval_seconds = match env::var("ORPHAN_SWEEP_INTERVAL_SECONDS") {
            Ok(value) => Some(
                value
                    .parse()
                    .context("ORPHAN_SWEEP_INTERVAL_SECONDS must be an integer")?,
            ),
            Err(_) => None,
        };
        let cron_secret = env::var("CRON_SECRET").ok().filter(|v| !v.is_empty());
        let default_max_documents_per_asset = env::var("DEFAULT_MAX_DOCUMENTS_PER_ASSET")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("DEFAULT_MAX_DOCUMENTS_PER_ASSET must be an integer")?;
        let default_max_total_documents = env::var("DEFAULT_MAX_TOTAL_DOCUMENTS")
            .unwrap_or_else(|_| "200".to_string())
            .parse()
            .context("DEFAULT_MAX_TOTAL_DOCUMENTS must be an integer")?;

        Ok(Self {
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            cors_allowed_origin,
            session_cookie_secure,
            session_cookie_domain,
            admin_session_ttl_days,
            field_session_ttl_days,
            aws_endpoint_url,
            aws_access_key_id,
            aws_secret_access_key,
            aws_region,
            s3_bucket,
            upload_max_bytes,
            upload_url_expiry_seconds,
            download_url_expiry_seconds,
            orphan_max_age_minutes,
            orphan_sweep_interval_seconds,
            cron_secret,
            default_max_documents_per_asset,
            default_max_total_documents,
        })
    }

    /// Settings suitable for tests and local tooling that never touch
    /// Postgres or S3 directly.
    pub fn for_local(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            database_max_pool_size: DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            cors_allowed_origin: None,
            session_cookie_secure: false,
            session_cookie_domain: None,
            admin_session_ttl_days: 30,
            field_session_ttl_days: 30,
            aws_endpoint_url: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_region: "us-east-1".to_string(),
            s3_bucket: "local-bucket".to_string(),
            upload_max_bytes: 100 * 1024 * 1024,
            upload_url_expiry_seconds: 300,
            download_url_expiry_seconds: 120,
            orphan_max_age_minutes: 60,
            orphan_sweep_interval_seconds: None,
            cron_secret: None,
            default_max_documents_per_asset: 10,
            default_max_total_documents: 200,
        }
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            let _ = parsed.set_password(Some("*****"));
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
