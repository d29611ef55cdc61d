//! Downloads media over HTTP.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode, Url};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::utils::http::DownloadTimeouts;

use super::{FetchError, FetchSource};

/// Receives `(received_bytes, total_bytes)` after every downloaded chunk.
///
/// The total is only known if the server sent a `Content-Length`.
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Streams the body of a `GET` request into the destination.
#[derive(Clone)]
pub struct HttpSource {
    client: Client,
    url: Url,
    timeouts: DownloadTimeouts,
    progress: Option<ProgressFn>,
}

impl HttpSource {
    pub fn new(client: Client, url: Url, timeouts: DownloadTimeouts) -> Self {
        Self {
            client,
            url,
            timeouts,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    async fn download(&self, destination: &mut File) -> Result<(), FetchError> {
        tracing::debug!("Fetching media from `{}`", self.url);

        let request = self.client.get(self.url.clone()).send();
        let mut response = match tokio::time::timeout(self.timeouts.head, request).await {
            Ok(response) => response?,
            Err(_) => return Err(FetchError::Timeout(self.timeouts.head)),
        };

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%status, "Unexpected status code from `{}`", self.url);
            return Err(match status {
                StatusCode::NOT_FOUND => FetchError::SourceUnavailable(status.to_string()),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    FetchError::SourceUnavailable(format!("permission denied: {status}"))
                }
                _ => FetchError::TransferFailure(status.to_string()),
            });
        }

        let total = response.content_length();
        let mut received = 0;
        while let Some(chunk) = response.chunk().await? {
            destination.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(progress) = &self.progress {
                progress(received, total);
            }
        }

        tracing::trace!(bytes = received, "download finished");
        Ok(())
    }
}

impl FetchSource for HttpSource {
    fn fetch<'a>(&'a self, destination: &'a mut File) -> BoxFuture<'a, Result<(), FetchError>> {
        let timeout = self.timeouts.max_download;
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.download(destination)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(timeout)),
            }
        })
    }
}

impl fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSource")
            .field("url", &self.url.as_str())
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}
