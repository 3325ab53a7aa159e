//! Hash-addressed blob cache with mandatory re-verification.
//!
//! Blobs live at `<dir>/<hex-sha256>.tgz`. Bytes are verified against the
//! expected hash before they are ever written, and re-hashed on every
//! subsequent read; the cache never trusts the disk alone.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::target::ContentHash;
use crate::util::fs::{ensure_exists, safe_write_all};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unable to download {url}: {source}")]
    Download { url: String, source: reqwest::Error },

    #[error("sha256 mismatch for {origin}: expected = {expected}, actual = {actual}")]
    Integrity {
        origin: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("unable to read cached blob {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to write cached blob {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Local store of verified, content-addressed blobs.
pub struct BlobCache {
    dir: PathBuf,
    http: reqwest::Client,
}

impl BlobCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Path the blob for `hash` lives at once cached.
    pub fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join(format!("{hash}.tgz"))
    }

    /// Fetch `url` into the cache, verified against `expected`.
    ///
    /// A cached blob is re-hashed before it is served; a fresh download is
    /// hashed before anything is written, so unverified bytes never reach
    /// the cache. Any failure is fatal and unretried.
    pub async fn fetch(&self, url: &str, expected: &ContentHash) -> Result<PathBuf, CacheError> {
        let path = self.blob_path(expected);
        if path.exists() {
            debug!("blob {expected} already cached, re-verifying");
            self.read_verified(expected)?;
            return Ok(path);
        }

        info!("blob {expected} not cached locally, downloading from {url}");
        let map = |source| CacheError::Download {
            url: url.to_owned(),
            source,
        };
        let body = self
            .http
            .get(url)
            .send()
            .await
            .map_err(map)?
            .error_for_status()
            .map_err(map)?
            .bytes()
            .await
            .map_err(map)?;

        let actual = ContentHash::of(&body);
        if actual != *expected {
            return Err(CacheError::Integrity {
                origin: url.to_owned(),
                expected: expected.clone(),
                actual,
            });
        }

        ensure_exists(&self.dir).map_err(|source| CacheError::Write {
            path: self.dir.clone(),
            source,
        })?;
        safe_write_all(&path, &body).map_err(|source| CacheError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Read a cached blob, re-hashing it before the bytes are returned.
    pub fn read_verified(&self, expected: &ContentHash) -> Result<Vec<u8>, CacheError> {
        let path = self.blob_path(expected);
        let buf = fs::read(&path).map_err(|source| CacheError::Read {
            path: path.clone(),
            source,
        })?;

        let actual = ContentHash::of(&buf);
        if actual != *expected {
            // The blob changed on disk since it was verified.
            return Err(CacheError::Integrity {
                origin: path.display().to_string(),
                expected: expected.clone(),
                actual,
            });
        }
        Ok(buf)
    }
}
