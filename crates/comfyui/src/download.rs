//! Atomic output downloads.
//!
//! The response body is streamed into a temporary file in the
//! destination directory, fsynced, then renamed into place, so an
//! interrupted download never leaves a partial file at the destination.
//! Attempts are retried with backoff; a 404 is treated as transient here
//! because the artifact may not be materialized on disk yet.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use gridgen_core::retry::{retry, RetryPolicy};

use crate::api::{
    build_view_params, ensure_success, transport_error, ComfyApi, ImageRef, RETRY_BASE_DELAY,
    RETRY_MAX_DELAY_PER_ATTEMPT, VIEW_RETRY_DEADLINE, VIEW_RETRY_MAX_ATTEMPTS,
};
use crate::error::{ClientError, ErrorKind};

/// A download failure: either a classified protocol error or a local
/// filesystem error while persisting the body.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Client(error) => error.is_transient(),
            Self::Io { .. } => false,
        }
    }
}

impl ComfyApi {
    /// Download one output to `dest`, atomically, with retry.
    pub async fn download_to_path(
        &self,
        image: &ImageRef,
        dest: &Path,
    ) -> Result<(), DownloadError> {
        let params = build_view_params(image).map_err(DownloadError::Client)?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| DownloadError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let policy = RetryPolicy {
            max_attempts: Some(VIEW_RETRY_MAX_ATTEMPTS),
            deadline: Some(VIEW_RETRY_DEADLINE),
            base_delay: RETRY_BASE_DELAY,
            max_delay_per_attempt: RETRY_MAX_DELAY_PER_ATTEMPT,
        };

        retry(&policy, DownloadError::is_transient, || {
            // Each attempt owns its inputs so the future does not
            // borrow through the retry closure.
            let api = self.clone();
            let params = params.clone();
            let dest = dest.to_path_buf();
            async move { api.download_once(&params, &dest).await }
        })
        .await
        .map_err(|error| match error {
            gridgen_core::retry::RetryError::InvalidPolicy(reason) => {
                DownloadError::Client(ClientError::new(ErrorKind::InvalidConfiguration, reason))
            }
            gridgen_core::retry::RetryError::Operation(error) => error,
        })
    }

    /// One download attempt: stream to a temp file, fsync, rename.
    async fn download_once(
        &self,
        params: &[(&'static str, String)],
        dest: &Path,
    ) -> Result<(), DownloadError> {
        let url = self.base.http_endpoint("view");
        let response = self
            .client
            .get(url.clone())
            .query(params)
            .send()
            .await
            .map_err(|e| transport_error("GET", url.as_str(), &e))?;
        let response = ensure_success(response, true).await?;

        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(
            ".{}.tmp-{}",
            dest.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "download".to_string()),
            &uuid::Uuid::new_v4().simple().to_string()[..8],
        ));

        let result = self
            .stream_body_to_file(response, &url, &temp_path, dest)
            .await;
        if result.is_err() {
            // Best effort: never leave temp files behind on failure.
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
        result
    }

    async fn stream_body_to_file(
        &self,
        response: reqwest::Response,
        url: &url::Url,
        temp_path: &Path,
        dest: &Path,
    ) -> Result<(), DownloadError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| DownloadError::Io { path, source }
        };

        let mut file = tokio::fs::File::create(temp_path)
            .await
            .map_err(io_err(temp_path))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                // A body interrupted mid-stream is retryable like a
                // connection failure.
                DownloadError::Client(
                    ClientError::new(ErrorKind::TransientHttp, "http request failed")
                        .with_context("method", "GET")
                        .with_context("url", url.as_str())
                        .with_context("detail", e.to_string()),
                )
            })?;
            file.write_all(&chunk).await.map_err(io_err(temp_path))?;
        }

        file.flush().await.map_err(io_err(temp_path))?;
        file.sync_all().await.map_err(io_err(temp_path))?;
        drop(file);

        tokio::fs::rename(temp_path, dest)
            .await
            .map_err(io_err(dest))?;
        Ok(())
    }
}
