//! Process-wide, content-addressed cache of generated images.
//!
//! Keys are derived from the generation parameters, so concurrent misses for
//! the same key write identical bytes and the last writer wins.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mirage_core::history::{ImageGenProvider, ImageRatio};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

pub const IMAGE_ROUTE_PREFIX: &str = "/generated-images";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedImage {
    pub cache_key: String,
    pub bytes: Arc<Vec<u8>>,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

impl CachedImage {
    pub fn url(&self) -> String {
        image_url(&self.cache_key)
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.bytes.as_slice())
    }
}

pub struct ImageCache {
    entries: DashMap<String, CachedImage>,
    dir: Option<PathBuf>,
}

impl ImageCache {
    /// In-memory only.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            dir: None,
        }
    }

    /// Mirror cached images to `<dir>/<key>.png` and fall back to it on lookups.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            entries: DashMap::new(),
            dir: Some(dir.into()),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn get(&self, cache_key: &str) -> Option<CachedImage> {
        if let Some(hit) = self.entries.get(cache_key) {
            return Some(hit.clone());
        }
        let path = self.dir.as_ref()?.join(file_name(cache_key));
        let bytes = tokio::fs::read(&path).await.ok()?;
        let image = CachedImage {
            cache_key: cache_key.to_string(),
            bytes: Arc::new(bytes),
            mime_type: "image/png".into(),
            created_at: Utc::now(),
        };
        tracing::debug!(cache_key, path = %path.display(), "image loaded from disk");
        self.entries.insert(cache_key.to_string(), image.clone());
        Some(image)
    }

    pub async fn insert(
        &self,
        cache_key: &str,
        bytes: Vec<u8>,
        mime_type: &str,
        now: DateTime<Utc>,
    ) -> Result<CachedImage, StoreError> {
        if let Some(dir) = &self.dir {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(dir.join(file_name(cache_key)), &bytes).await?;
        }
        let image = CachedImage {
            cache_key: cache_key.to_string(),
            bytes: Arc::new(bytes),
            mime_type: mime_type.to_string(),
            created_at: now,
        };
        self.entries.insert(cache_key.to_string(), image.clone());
        Ok(image)
    }
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 hex of `provider:modelId:prompt:ratio`.
pub fn cache_key(provider: ImageGenProvider, model_id: &str, prompt: &str, ratio: ImageRatio) -> String {
    let material = format!("{}:{}:{}:{}", provider.as_str(), model_id, prompt, ratio.as_str());
    format!("{:x}", Sha256::digest(material.as_bytes()))
}

pub fn image_url(cache_key: &str) -> String {
    format!("{IMAGE_ROUTE_PREFIX}/{}", file_name(cache_key))
}

fn file_name(cache_key: &str) -> String {
    format!("{cache_key}.png")
}

/// Extract the cache key from a served file name, rejecting anything that is
/// not a bare hex digest.
pub fn key_from_file_name(name: &str) -> Option<&str> {
    let key = name.strip_suffix(".png")?;
    (key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit())).then_some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_stable_and_parameter_sensitive() {
        let a = cache_key(ImageGenProvider::Openai, "gpt-image-1", "a cat", ImageRatio::Square);
        let b = cache_key(ImageGenProvider::Openai, "gpt-image-1", "a cat", ImageRatio::Square);
        let c = cache_key(ImageGenProvider::Openai, "gpt-image-1", "a cat", ImageRatio::Wide);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn url_and_file_name_round_trip() {
        let key = cache_key(ImageGenProvider::Gemini, "imagen", "sunset", ImageRatio::Tall);
        let url = image_url(&key);
        assert!(url.starts_with("/generated-images/"));
        let name = url.rsplit('/').next().unwrap();
        assert_eq!(key_from_file_name(name), Some(key.as_str()));
        assert_eq!(key_from_file_name("../etc/passwd.png"), None);
        assert_eq!(key_from_file_name("abc.jpg"), None);
    }

    #[tokio::test]
    async fn memory_cache_hit() {
        let cache = ImageCache::new();
        assert!(cache.get("k").await.is_none());
        cache.insert("k", vec![1, 2, 3], "image/png", Utc::now()).await.unwrap();
        let hit = cache.get("k").await.unwrap();
        assert_eq!(*hit.bytes, vec![1, 2, 3]);
        assert_eq!(hit.to_base64(), "AQID");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn disk_backed_cache_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let key = cache_key(ImageGenProvider::Openai, "m", "p", ImageRatio::Square);
        let first = ImageCache::with_dir(dir.path());
        first.insert(&key, vec![9, 9], "image/png", Utc::now()).await.unwrap();
        assert!(dir.path().join(format!("{key}.png")).exists());

        let second = ImageCache::with_dir(dir.path());
        let hit = second.get(&key).await.unwrap();
        assert_eq!(*hit.bytes, vec![9, 9]);
    }
}
