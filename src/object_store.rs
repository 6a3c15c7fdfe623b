//! `ObjectStore` (spec.md §6) — screenshot artifact storage.
//!
//! The real backend is an external blob store (spec.md §1); this module
//! specifies the trait plus an in-process `DashMap`-backed implementation,
//! following the same concurrent-map shape as `store::InMemoryStateStore`.
//! Signed URLs are synthesized (HMAC-stamped path + expiry, no real
//! network-facing CDN) since there is no real object store behind them.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("signed url expired")]
    Expired,
    #[error("backend error: {0}")]
    Backend(String),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// `screenshot artifact` TTL (spec.md §3 "Screenshot artifact").
pub const SCREENSHOT_URL_TTL: std::time::Duration = std::time::Duration::from_secs(365 * 24 * 60 * 60);

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> ObjectStoreResult<()>;
    async fn get(&self, path: &str) -> ObjectStoreResult<Vec<u8>>;
    /// Returns a time-bounded URL a client can later resolve back to
    /// `path` via `resolve_signed_url`.
    async fn signed_url(&self, path: &str, ttl: std::time::Duration) -> ObjectStoreResult<String>;
}

struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

type HmacSha256 = Hmac<Sha256>;

pub struct InMemoryObjectStore {
    objects: DashMap<String, StoredObject>,
    signing_key: Vec<u8>,
    base_url: String,
}

impl InMemoryObjectStore {
    pub fn new(signing_key: impl Into<Vec<u8>>, base_url: impl Into<String>) -> Self {
        Self { objects: DashMap::new(), signing_key: signing_key.into(), base_url: base_url.into() }
    }

    fn sign(&self, path: &str, expires_at: DateTime<Utc>) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key).expect("hmac accepts any key length");
        mac.update(path.as_bytes());
        mac.update(expires_at.timestamp().to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Validate a signed URL's query string and return the object path if
    /// the signature matches and the URL has not expired. Not part of the
    /// `ObjectStore` trait — used by the HTTP layer's asset-serving route,
    /// if one is wired up.
    pub fn resolve_signed_url(&self, path: &str, expires_at_unix: i64, signature: &str) -> ObjectStoreResult<()> {
        let expires_at = DateTime::from_timestamp(expires_at_unix, 0).ok_or(ObjectStoreError::Expired)?;
        if Utc::now() > expires_at {
            return Err(ObjectStoreError::Expired);
        }
        if self.sign(path, expires_at) != signature {
            return Err(ObjectStoreError::NotFound(path.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> ObjectStoreResult<()> {
        self.objects.insert(path.to_string(), StoredObject { bytes, content_type: content_type.to_string() });
        Ok(())
    }

    async fn get(&self, path: &str) -> ObjectStoreResult<Vec<u8>> {
        self.objects
            .get(path)
            .map(|entry| entry.bytes.clone())
            .ok_or_else(|| ObjectStoreError::NotFound(path.to_string()))
    }

    async fn signed_url(&self, path: &str, ttl: std::time::Duration) -> ObjectStoreResult<String> {
        let expires_at = Utc::now() + ChronoDuration::from_std(ttl).map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        let signature = self.sign(path, expires_at);
        Ok(format!("{}/{path}?expires={}&sig={signature}", self.base_url, expires_at.timestamp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryObjectStore {
        InMemoryObjectStore::new(b"test-signing-key".to_vec(), "https://objects.example.test")
    }

    #[tokio::test]
    async fn put_then_get_round_trips_bytes() {
        let store = store();
        store.put("a/b.png", vec![1, 2, 3], "image/png").await.unwrap();
        assert_eq!(store.get("a/b.png").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let store = store();
        assert!(matches!(store.get("missing").await, Err(ObjectStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn signed_url_resolves_while_valid() {
        let store = store();
        store.put("shots/1.png", vec![9], "image/png").await.unwrap();
        let url = store.signed_url("shots/1.png", SCREENSHOT_URL_TTL).await.unwrap();
        let query = url.split('?').nth(1).unwrap();
        let expires: i64 = query.split('&').nth(0).unwrap().trim_start_matches("expires=").parse().unwrap();
        let sig = query.split('&').nth(1).unwrap().trim_start_matches("sig=");
        store.resolve_signed_url("shots/1.png", expires, sig).unwrap();
    }

    #[tokio::test]
    async fn signed_url_rejects_tampered_signature() {
        let store = store();
        let url = store.signed_url("shots/1.png", SCREENSHOT_URL_TTL).await.unwrap();
        let query = url.split('?').nth(1).unwrap();
        let expires: i64 = query.split('&').nth(0).unwrap().trim_start_matches("expires=").parse().unwrap();
        assert!(store.resolve_signed_url("shots/1.png", expires, "not-the-real-signature").is_err());
    }
}
