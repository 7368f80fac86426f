//! File blobs: upload, read, and short-lived signed download URLs.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::errors::UploadError;

type HmacSha256 = Hmac<Sha256>;

/// Everything but RFC 3986 unreserved characters is escaped in a segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Metadata of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlob {
    pub path: String,
    pub size: u64,
    pub content_type: String,
}

/// A time-limited download URL for one blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedUrl {
    pub path: String,
    /// Unix seconds after which the URL is rejected.
    pub expires: i64,
    pub signature: String,
}

impl SignedUrl {
    /// Relative URL served by the reference backend.
    /// Each path segment is percent-encoded, so file names may carry
    /// spaces, `#`, `?` or `&`.
    pub fn url(&self) -> String {
        let path = self
            .path
            .split('/')
            .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "/api/blobs/{}?expires={}&sig={}",
            path, self.expires, self.signature
        )
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires, 0)
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredBlob, UploadError>;

    async fn read(&self, path: &str) -> Result<Vec<u8>, UploadError>;

    async fn remove(&self, path: &str) -> Result<(), UploadError>;

    fn signed_url(&self, path: &str, ttl: Duration) -> Result<SignedUrl, UploadError>;

    /// Check a signed URL's expiry and signature against `now`.
    fn verify(
        &self,
        path: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<(), UploadError>;
}

fn keyed_mac(secret: &str, path: &str, expires: i64) -> Result<HmacSha256, UploadError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| UploadError::SigningKey)?;
    mac.update(format!("{path}\n{expires}").as_bytes());
    Ok(mac)
}

/// Hex HMAC-SHA256 of path and expiry under `secret`.
pub fn sign(secret: &str, path: &str, expires: i64) -> Result<String, UploadError> {
    let mac = keyed_mac(secret, path, expires)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Reject absolute paths, `..`, and anything that is not a plain relative
/// path.
pub fn check_blob_path(path: &str) -> Result<&Path, UploadError> {
    let candidate = Path::new(path);
    let plain = !path.is_empty()
        && !path.contains('\\')
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(candidate)
    } else {
        Err(UploadError::InvalidPath(path.to_string()))
    }
}

/// Blob store rooted at a local directory.
pub struct FsBlobStore {
    root: PathBuf,
    secret: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, secret: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            secret: secret.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, UploadError> {
        Ok(self.root.join(check_blob_path(path)?))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredBlob, UploadError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let size = bytes.len() as u64;
        tokio::fs::write(&target, bytes).await?;
        tracing::debug!(path, size, "blob stored");
        Ok(StoredBlob {
            path: path.to_string(),
            size,
            content_type: content_type.to_string(),
        })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, UploadError> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::read(target).await?)
    }

    async fn remove(&self, path: &str) -> Result<(), UploadError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn signed_url(&self, path: &str, ttl: Duration) -> Result<SignedUrl, UploadError> {
        check_blob_path(path)?;
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let expires = (Utc::now() + ttl).timestamp();
        Ok(SignedUrl {
            path: path.to_string(),
            expires,
            signature: sign(&self.secret, path, expires)?,
        })
    }

    fn verify(
        &self,
        path: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<(), UploadError> {
        check_blob_path(path)?;
        let provided = hex::decode(signature).map_err(|_| UploadError::BadSignature)?;
        keyed_mac(&self.secret, path, expires)?
            .verify_slice(&provided)
            .map_err(|_| UploadError::BadSignature)?;
        if now.timestamp() > expires {
            return Err(UploadError::Expired);
        }
        Ok(())
    }
}

/// Client-side checks run before any bytes leave the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPolicy {
    /// Exact types (`application/pdf`) or wildcards (`image/*`).
    pub allowed_types: Vec<String>,
    pub max_bytes: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_types: default_allowed_types(),
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

pub fn default_allowed_types() -> Vec<String> {
    ["application/pdf", "image/jpeg", "image/png", "image/webp"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl UploadPolicy {
    /// Validate a file and return the content type it will be stored with.
    /// Without a declared type, the type is guessed from the extension.
    pub fn check(
        &self,
        file_name: &str,
        declared_type: Option<&str>,
        size: u64,
    ) -> Result<String, UploadError> {
        if file_name.trim().is_empty()
            || file_name.contains('/')
            || file_name.contains('\\')
            || file_name == ".."
        {
            return Err(UploadError::InvalidFileName);
        }
        let content_type = match declared_type {
            Some(t) if !t.trim().is_empty() => t.trim().to_ascii_lowercase(),
            _ => mime_guess::from_path(file_name)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        };
        if !self.allows(&content_type) {
            return Err(UploadError::TypeNotAllowed { content_type });
        }
        if size > self.max_bytes {
            return Err(UploadError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }
        Ok(content_type)
    }

    pub fn allows(&self, content_type: &str) -> bool {
        self.allowed_types.iter().any(|allowed| {
            match allowed.strip_suffix("/*") {
                Some(family) => content_type
                    .split_once('/')
                    .is_some_and(|(f, _)| f == family),
                None => allowed == content_type,
            }
        })
    }
}
