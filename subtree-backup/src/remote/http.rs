//! Plain HTTP object endpoint (`GET`/`HEAD`/`PUT`/`DELETE` on `{base}/{key}`).

use super::{ByteReader, ObjectStore, PutOptions};
use crate::transfer::progress_stream::ProgressStream;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::io::ReaderStream;

/// Read size for the streamed request body.
const STREAM_FRAME: usize = 256 * 1024;

pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStore {
    pub fn new(base_url: String, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("subtree-backup/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackupError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.as_deref() {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

fn request_failed(op: &str, key: &str, err: reqwest::Error) -> BackupError {
    BackupError::Transport(format!("{} {} failed: {}", op, key, err))
}

fn bad_status(op: &str, key: &str, status: StatusCode) -> BackupError {
    BackupError::Transport(format!("{} {} failed with status {}", op, key, status))
}

#[async_trait]
impl ObjectStore for HttpStore {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn fetch(&self, key: &str) -> Result<Option<Bytes>> {
        let resp = self
            .authorize(self.client.get(self.url(key)))
            .send()
            .await
            .map_err(|e| request_failed("GET", key, e))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body = resp.bytes().await.map_err(|e| request_failed("GET", key, e))?;
                Ok(Some(body))
            }
            s => Err(bad_status("GET", key, s)),
        }
    }

    async fn count(&self, key: &str) -> Result<usize> {
        let resp = self
            .authorize(self.client.head(self.url(key)))
            .send()
            .await
            .map_err(|e| request_failed("HEAD", key, e))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(0),
            s if s.is_success() => Ok(1),
            s => Err(bad_status("HEAD", key, s)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self
            .authorize(self.client.delete(self.url(key)))
            .send()
            .await
            .map_err(|e| request_failed("DELETE", key, e))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            s if s.is_success() => Ok(()),
            s => Err(bad_status("DELETE", key, s)),
        }
    }

    async fn put_stream(&self, key: &str, body: ByteReader, options: &PutOptions) -> Result<u64> {
        let sent = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&sent);
        let stream = ProgressStream::new(
            ReaderStream::with_capacity(body, STREAM_FRAME),
            Arc::new(move |bytes: u64| counter.store(bytes, Ordering::Relaxed)),
        );

        let resp = self
            .authorize(self.client.put(self.url(key)))
            .header("x-amz-storage-class", &options.storage_class)
            .header("content-type", "application/octet-stream")
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| request_failed("PUT", key, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BackupError::Transport(format!(
                "PUT {} failed with status {}: {}",
                key, status, text
            )));
        }

        Ok(sent.load(Ordering::Relaxed))
    }
}
