use std::{io, path::Path, sync::Arc};

use futures_util::StreamExt;
use md5::Context;
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use url::Url;

use super::paths::partial_path;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
}

impl TransferError {
    /// Network hiccups, server errors and throttling are worth retrying;
    /// client errors and local I/O are not.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Request(err) => {
                if err.is_timeout() || err.is_connect() {
                    return true;
                }
                match err.status() {
                    Some(status) => {
                        status.is_server_error()
                            || status == StatusCode::TOO_MANY_REQUESTS
                            || status == StatusCode::REQUEST_TIMEOUT
                    }
                    None => err.is_request() || err.is_body(),
                }
            }
            TransferError::IntegrityMismatch { .. } => true,
            TransferError::Io(_) | TransferError::Url(_) | TransferError::ConcurrencyClosed => {
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            upload_concurrency: 5,
        }
    }
}

/// Moves payload bytes to and from pre-signed links.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

impl TransferClient {
    pub fn new() -> Self {
        Self::with_config(TransferConfig::default())
    }

    pub fn with_config(config: TransferConfig) -> Self {
        Self {
            http: Client::new(),
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    /// Streams `href` into `target`. Bytes land in a `.partial` sibling and
    /// are renamed into place only after the digest matches `expected_md5`.
    pub async fn download_to_path_checked(
        &self,
        href: &Url,
        target: &Path,
        expected_md5: Option<&str>,
    ) -> Result<(), TransferError> {
        let _permit = self
            .download_limit
            .acquire()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let response = self.http.get(href.clone()).send().await?.error_for_status()?;

        let partial = partial_path(target);
        let digest = write_partial(&partial, response).await?;
        if let Some(expected) = expected_md5.map(str::to_ascii_lowercase)
            && expected != digest
        {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(TransferError::IntegrityMismatch {
                expected_md5: expected,
                actual_md5: digest,
            });
        }
        tokio::fs::rename(&partial, target).await?;
        Ok(())
    }

    pub async fn upload_bytes(
        &self,
        href: &Url,
        method: &str,
        bytes: &[u8],
    ) -> Result<(), TransferError> {
        let _permit = self
            .upload_limit
            .acquire()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let request = match method.to_ascii_uppercase().as_str() {
            "POST" => self.http.post(href.clone()),
            _ => self.http.put(href.clone()),
        };
        request
            .body(bytes.to_vec())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the response body to `partial` and returns its md5 as lowercase hex.
async fn write_partial(partial: &Path, response: Response) -> Result<String, TransferError> {
    if let Some(parent) = partial.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(partial).await?;
    let mut digest = Context::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.sync_all().await?;
    Ok(format!("{:x}", digest.compute()))
}
