//! Off-cluster artifact export.
//!
//! The reconciler uploads the captured crash log once per materialization and
//! the collector job streams checkpoint archives through the same interface.
//! Upload failures are always soft; the no-op store is the default when no
//! bucket is configured.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{Error, Result};

/// Object key under which a crash log is uploaded.
pub fn log_object_key(namespace: &str, pod: &str, at: DateTime<Utc>) -> String {
    format!(
        "{namespace}/{pod}/{}/crash.log",
        at.format("%Y/%m/%d/%H%M%S")
    )
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Uploads `data` under `key`, returning a locator or an empty string when
    /// the store is not configured.
    async fn upload(&self, key: &str, data: &[u8]) -> Result<String>;

    /// Uploads a file from local disk under `key`.
    async fn upload_file(&self, key: &str, path: &Path) -> Result<String>;
}

/// Store used when no bucket is configured; uploads succeed with an empty
/// locator so callers skip the annotation.
pub struct NoOpStore;

#[async_trait]
impl BlobStore for NoOpStore {
    async fn upload(&self, _key: &str, _data: &[u8]) -> Result<String> {
        Ok(String::new())
    }

    async fn upload_file(&self, _key: &str, _path: &Path) -> Result<String> {
        Ok(String::new())
    }
}

/// Uploads to an S3-compatible HTTP endpoint with a plain `PUT
/// {endpoint}/{bucket}/{key}`. Credential handling is delegated to the
/// endpoint (cluster-local gateway, anonymous-write bucket policy, or a
/// presigning proxy); the locator keeps the `s3://` form.
pub struct S3CompatibleStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    region: String,
}

impl S3CompatibleStore {
    pub fn new(endpoint: &str, bucket: &str, region: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            region: region.to_string(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn locator(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    async fn put(&self, key: &str, body: reqwest::Body) -> Result<String> {
        let url = self.object_url(key);
        debug!(%url, region = %self.region, "uploading artifact");
        let resp = self.client.put(&url).body(body).send().await?;
        if !resp.status().is_success() {
            return Err(Error::UploadRejected(resp.status()));
        }
        Ok(self.locator(key))
    }
}

#[async_trait]
impl BlobStore for S3CompatibleStore {
    async fn upload(&self, key: &str, data: &[u8]) -> Result<String> {
        self.put(key, reqwest::Body::from(data.to_vec())).await
    }

    async fn upload_file(&self, key: &str, path: &Path) -> Result<String> {
        let file = tokio::fs::File::open(path).await?;
        self.put(key, reqwest::Body::from(file)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn log_key_layout() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        assert_eq!(
            log_object_key("prod", "api-abc", at),
            "prod/api-abc/2025/03/14/092653/crash.log"
        );
    }

    #[test]
    fn locator_format() {
        let store = S3CompatibleStore::new("https://s3.example.com/", "forensics", "us-east-1")
            .unwrap();
        assert_eq!(store.locator("a/b/crash.log"), "s3://forensics/a/b/crash.log");
        assert_eq!(
            store.object_url("a/b/crash.log"),
            "https://s3.example.com/forensics/a/b/crash.log"
        );
    }

    #[tokio::test]
    async fn noop_store_returns_empty_locator() {
        let url = NoOpStore.upload("k", b"data").await.unwrap();
        assert_eq!(url, "");
    }
}
