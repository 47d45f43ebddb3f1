//! External artifact retrieval.
//!
//! A fetch downloads into a staging file outside the stage root. Only after
//! the transfer finished and the digest matched is the file renamed to its
//! destination, so a failed fetch leaves nothing addressable in the stage.

mod http;

pub use http::HttpFetcher;

use crate::core::FetchedAsset;
use crate::errors::FetchError;
use crate::utils::fs::rooted;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// Downloads external assets.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Writes the content behind `locator` to `target`, returning the
    /// number of bytes written.
    ///
    /// Implementations may leave a partial `target` behind on failure; the
    /// caller removes it.
    async fn download(&self, locator: &str, target: &Path) -> Result<u64, FetchError>;
}

/// One fetch step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// External locator.
    pub locator: String,
    /// Absolute destination inside the stage.
    pub destination: PathBuf,
    /// Expected SHA-256, hex encoded.
    pub sha256: Option<String>,
}

impl FetchRequest {
    /// Creates a request without a digest.
    #[must_use]
    pub fn new(locator: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            locator: locator.into(),
            destination: destination.into(),
            sha256: None,
        }
    }

    /// Sets the expected digest.
    #[must_use]
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }
}

/// Fetches `request` into the stage rooted at `rootfs`, staging the
/// download in `staging_dir`.
///
/// # Errors
///
/// Returns a [`FetchError`] if the download fails, exceeds `max_size`, or
/// the digest does not match. No file exists at the destination afterwards.
pub async fn fetch_into(
    fetcher: &dyn ArtifactFetcher,
    request: &FetchRequest,
    rootfs: &Path,
    staging_dir: &Path,
    max_size: u64,
) -> Result<FetchedAsset, FetchError> {
    let fail = |reason: String| FetchError::new(&request.locator, reason);

    let destination = rooted(rootfs, &request.destination).map_err(|e| fail(e.to_string()))?;
    tokio::fs::create_dir_all(staging_dir)
        .await
        .map_err(|e| fail(format!("cannot create staging directory: {e}")))?;
    let staged = staging_dir.join(format!("{}.part", crate::utils::generate_uuid()));

    let result = stage_download(fetcher, request, &staged, max_size).await;
    let (size, sha256) = match result {
        Ok(done) => done,
        Err(e) => {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }
    };

    if let Some(parent) = destination.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(fail(format!("cannot create {}: {e}", parent.display())));
        }
    }
    if let Err(e) = tokio::fs::rename(&staged, &destination).await {
        let _ = tokio::fs::remove_file(&staged).await;
        return Err(fail(format!("cannot move download into place: {e}")));
    }

    info!(locator = %request.locator, size, "Fetched {}", request.destination.display());
    Ok(FetchedAsset {
        locator: request.locator.clone(),
        path: request.destination.clone(),
        size,
        sha256,
    })
}

async fn stage_download(
    fetcher: &dyn ArtifactFetcher,
    request: &FetchRequest,
    staged: &Path,
    max_size: u64,
) -> Result<(u64, String), FetchError> {
    let fail = |reason: String| FetchError::new(&request.locator, reason);

    debug!(locator = %request.locator, staged = %staged.display(), "Downloading");
    let written = fetcher.download(&request.locator, staged).await?;
    let size = tokio::fs::metadata(staged)
        .await
        .map_err(|e| fail(format!("download produced no file: {e}")))?
        .len();

    if size != written {
        return Err(fail(format!("incomplete transfer: {size} of {written} bytes on disk")));
    }
    if size > max_size {
        return Err(fail(format!("asset is {size} bytes, limit is {max_size}")));
    }

    let sha256 = file_sha256(staged).await.map_err(|e| fail(e.to_string()))?;
    if let Some(expected) = &request.sha256 {
        if !expected.eq_ignore_ascii_case(&sha256) {
            return Err(fail(format!("sha256 mismatch: expected {expected}, got {sha256}")));
        }
    }
    Ok((size, sha256))
}

/// Computes the hex SHA-256 of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StaticFetcher, UnreachableFetcher};

    const MODEL: &[u8] = b"model weights";

    fn model_digest() -> String {
        hex::encode(Sha256::digest(MODEL))
    }

    #[tokio::test]
    async fn test_fetch_into_places_file() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path().join("rootfs");
        let fetcher = StaticFetcher::new().with_asset("https://assets.example/model.tar.gz", MODEL);
        let request = FetchRequest::new("https://assets.example/model.tar.gz", "/build/model.tar.gz")
            .with_sha256(model_digest());

        let asset = fetch_into(&fetcher, &request, &rootfs, &tmp.path().join("staging"), 1024)
            .await
            .unwrap();

        assert_eq!(asset.size, MODEL.len() as u64);
        assert_eq!(asset.sha256, model_digest());
        assert_eq!(std::fs::read(rootfs.join("build/model.tar.gz")).unwrap(), MODEL);
        assert_eq!(std::fs::read_dir(tmp.path().join("staging")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_leaves_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path().join("rootfs");
        let request = FetchRequest::new("https://assets.example/model.tar.gz", "/build/model.tar.gz");

        let err = fetch_into(&UnreachableFetcher, &request, &rootfs, &tmp.path().join("staging"), 1024)
            .await
            .unwrap_err();

        assert!(err.reason.contains("unreachable"));
        assert!(!rootfs.join("build/model.tar.gz").exists());
        assert_eq!(std::fs::read_dir(tmp.path().join("staging")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_digest_mismatch_leaves_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path().join("rootfs");
        let fetcher = StaticFetcher::new().with_asset("file:///model", MODEL);
        let request = FetchRequest::new("file:///model", "/build/model").with_sha256("0".repeat(64));

        let err = fetch_into(&fetcher, &request, &rootfs, &tmp.path().join("staging"), 1024)
            .await
            .unwrap_err();

        assert!(err.reason.contains("sha256 mismatch"));
        assert!(!rootfs.join("build/model").exists());
    }

    #[tokio::test]
    async fn test_size_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::new().with_asset("file:///model", MODEL);
        let request = FetchRequest::new("file:///model", "/build/model");

        let err = fetch_into(&fetcher, &request, &tmp.path().join("rootfs"), &tmp.path().join("staging"), 4)
            .await
            .unwrap_err();
        assert!(err.reason.contains("limit"));
    }
}
