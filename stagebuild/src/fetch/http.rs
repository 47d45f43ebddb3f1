//! Fetcher for `http`, `https` and `file` locators.

use super::ArtifactFetcher;
use crate::config::FetchConfig;
use crate::errors::FetchError;
use async_trait::async_trait;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Streams remote assets to disk with a size ceiling.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    #[cfg(feature = "http")]
    client: reqwest::Client,
    max_size: u64,
}

impl HttpFetcher {
    /// Creates a fetcher from the fetch configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        #[cfg(feature = "http")]
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .build()
            .map_err(|e| FetchError::new("http", format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            #[cfg(feature = "http")]
            client,
            max_size: config.max_size,
        })
    }

    async fn download_file(&self, locator: &str, target: &Path) -> Result<u64, FetchError> {
        let fail = |reason: String| FetchError::new(locator, reason);
        let source = locator.trim_start_matches("file://");

        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| fail(format!("unreachable: {e}")))?;
        if meta.len() > self.max_size {
            return Err(fail(format!("asset is {} bytes, limit is {}", meta.len(), self.max_size)));
        }
        tokio::fs::copy(source, target)
            .await
            .map_err(|e| fail(format!("copy failed: {e}")))
    }

    #[cfg(feature = "http")]
    async fn download_http(&self, locator: &str, target: &Path) -> Result<u64, FetchError> {
        let fail = |reason: String| FetchError::new(locator, reason);

        let mut response = self
            .client
            .get(locator)
            .send()
            .await
            .map_err(|e| fail(format!("unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(fail(format!("HTTP {}", response.status())));
        }

        let expected = response.content_length();
        if let Some(len) = expected {
            if len > self.max_size {
                return Err(fail(format!("asset is {len} bytes, limit is {}", self.max_size)));
            }
        }

        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| fail(format!("cannot create staging file: {e}")))?;
        let mut written: u64 = 0;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| fail(format!("transfer interrupted: {e}")))?
        {
            written += chunk.len() as u64;
            if written > self.max_size {
                return Err(fail(format!("asset exceeds limit of {} bytes", self.max_size)));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| fail(format!("write failed: {e}")))?;
        }
        file.flush().await.map_err(|e| fail(format!("write failed: {e}")))?;
        file.sync_all().await.map_err(|e| fail(format!("write failed: {e}")))?;

        if let Some(len) = expected {
            if written != len {
                return Err(fail(format!("incomplete transfer: {written} of {len} bytes")));
            }
        }
        Ok(written)
    }

    #[cfg(not(feature = "http"))]
    async fn download_http(&self, locator: &str, _target: &Path) -> Result<u64, FetchError> {
        Err(FetchError::new(locator, "built without http support"))
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn download(&self, locator: &str, target: &Path) -> Result<u64, FetchError> {
        debug!(locator = %locator, "Fetching");
        if locator.starts_with("file://") {
            return self.download_file(locator, target).await;
        }
        if locator.starts_with("http://") || locator.starts_with("https://") {
            return self.download_http(locator, target).await;
        }
        Err(FetchError::new(locator, "unsupported locator scheme"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_locator() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("model.bin");
        std::fs::write(&source, b"0123456789").unwrap();

        let fetcher = HttpFetcher::new(&FetchConfig::default()).unwrap();
        let target = tmp.path().join("out.part");
        let written = fetcher
            .download(&format!("file://{}", source.display()), &target)
            .await
            .unwrap();

        assert_eq!(written, 10);
        assert_eq!(std::fs::read(&target).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_missing_file_is_unreachable() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new(&FetchConfig::default()).unwrap();
        let err = fetcher
            .download("file:///definitely/not/here", &tmp.path().join("out.part"))
            .await
            .unwrap_err();
        assert!(err.reason.starts_with("unreachable"));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = HttpFetcher::new(&FetchConfig::default()).unwrap();
        let err = fetcher
            .download("s3://bucket/model", &tmp.path().join("out.part"))
            .await
            .unwrap_err();
        assert!(err.reason.contains("unsupported"));
    }

    #[cfg(feature = "http")]
    #[tokio::test]
    async fn test_refused_connection() {
        let tmp = tempfile::tempdir().unwrap();
        let config = FetchConfig {
            timeout_seconds: 2.0,
            ..FetchConfig::default()
        };
        let fetcher = HttpFetcher::new(&config).unwrap();
        let err = fetcher
            .download("http://127.0.0.1:9/model.tar.gz", &tmp.path().join("out.part"))
            .await
            .unwrap_err();
        assert!(err.reason.starts_with("unreachable") || err.reason.starts_with("transfer"));
    }
}
