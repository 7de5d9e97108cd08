use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use tokio::sync::Mutex;

use crate::config::AppConfig;

/// What a HEAD request reveals about an object that exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHead {
    pub size_bytes: Option<i64>,
}

/// Signed-URL gateway to the blob store. The service never moves document
/// bytes itself; clients read and write through the URLs issued here.
#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    async fn presign_put_object(
        &self,
        key: &str,
        content_type: &str,
        size_bytes: i64,
        expires_in: Duration,
    ) -> Result<String>;

    async fn presign_get_object(
        &self,
        key: &str,
        content_disposition: Option<String>,
        expires_in: Duration,
    ) -> Result<String>;

    /// `Ok(None)` when the object does not exist; `Err` only for transport or
    /// service failures.
    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>>;

    async fn delete_object(&self, key: &str) -> Result<()>;
}

pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Builds a path-style client for the configured bucket, honouring a custom
    /// endpoint (MinIO, LocalStack) and static credentials when both keys are set.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let region = Region::new(config.aws_region.clone());
        let region_provider = RegionProviderChain::first_try(Some(region))
            .or_default_provider()
            .or_else("us-east-1");

        #[allow(deprecated)]
        let mut loader = aws_config::from_env().region(region_provider);

        if let Some(endpoint) = &config.aws_endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        if let (Some(access_key), Some(secret_key)) = (
            config.aws_access_key_id.clone(),
            config.aws_secret_access_key.clone(),
        ) {
            let credentials = Credentials::new(access_key, secret_key, None, None, "static");
            loader = loader.credentials_provider(credentials);
        }

        let base_config = loader.load().await;
        let s3_config = S3ConfigBuilder::from(&base_config)
            .force_path_style(true)
            .build();

        Ok(Self::new(
            S3Client::from_conf(s3_config),
            config.s3_bucket.clone(),
        ))
    }
}

fn presigning_config(expires_in: Duration) -> Result<PresigningConfig> {
    PresigningConfig::builder()
        .expires_in(expires_in)
        .build()
        .context("failed to build S3 presigning config")
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn presign_put_object(
        &self,
        key: &str,
        content_type: &str,
        size_bytes: i64,
        expires_in: Duration,
    ) -> Result<String> {
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(size_bytes)
            .presigned(presigning_config(expires_in)?)
            .await
            .context("failed to generate presigned upload URL")?;

        Ok(presigned.uri().to_string())
    }

    async fn presign_get_object(
        &self,
        key: &str,
        content_disposition: Option<String>,
        expires_in: Duration,
    ) -> Result<String> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(disposition) = content_disposition {
            request = request.response_content_disposition(disposition);
        }

        let presigned = request
            .presigned(presigning_config(expires_in)?)
            .await
            .context("failed to generate presigned download URL")?;

        Ok(presigned.uri().to_string())
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectHead {
                size_bytes: output.content_length(),
            })),
            Err(SdkError::ServiceError(err)) if err.err().is_not_found() => Ok(None),
            Err(err) => Err(anyhow::Error::new(err).context("failed to inspect object in S3")),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("failed to delete object from S3")?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
}

/// In-memory blob store. `put` stands in for the client-side transfer through
/// a signed URL; `set_unavailable` makes every call fail like a network outage.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, key: &str, size_bytes: i64, content_type: Option<&str>) {
        let stored = StoredObject {
            key: key.to_string(),
            size_bytes,
            content_type: content_type.map(str::to_string),
        };
        self.objects.lock().await.insert(stored.key.clone(), stored);
    }

    pub async fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.lock().await.contains_key(key)
    }

    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("storage endpoint unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn presign_put_object(
        &self,
        key: &str,
        content_type: &str,
        size_bytes: i64,
        expires_in: Duration,
    ) -> Result<String> {
        self.check_available()?;
        Ok(format!(
            "memory://put/{key}?content_type={content_type}&size={size_bytes}&expires_in={}",
            expires_in.as_secs()
        ))
    }

    async fn presign_get_object(
        &self,
        key: &str,
        _content_disposition: Option<String>,
        expires_in: Duration,
    ) -> Result<String> {
        self.check_available()?;
        Ok(format!(
            "memory://get/{key}?expires_in={}",
            expires_in.as_secs()
        ))
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>> {
        self.check_available()?;
        Ok(self.objects.lock().await.get(key).map(|obj| ObjectHead {
            size_bytes: Some(obj.size_bytes),
        }))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.objects.lock().await.remove(key);
        Ok(())
    }
}
