use crate::domain::ports::ArtifactStore;
use crate::domain::types::SessionKey;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Filesystem artifact store. Files live flat under one root, one JSON blob
/// per (session, slot): `ETH_USDT_5m_price_scaler.json`,
/// `ETH_USDT_5m_model.json` and so on.
pub struct FsArtifactStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root)
                .with_context(|| format!("Failed to create artifact directory {:?}", root))?;
        }

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn artifact_path(&self, key: &SessionKey, slot: &str) -> PathBuf {
        self.root
            .join(format!("{}_{}.json", key.artifact_stem(), slot))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn load(&self, key: &SessionKey, slot: &str) -> Result<Option<Vec<u8>>> {
        let path = self.artifact_path(key, slot);
        if !path.exists() {
            return Ok(None);
        }

        let bytes =
            fs::read(&path).with_context(|| format!("Failed to read artifact {:?}", path))?;
        debug!("FsArtifactStore: Loaded {} bytes from {:?}", bytes.len(), path);
        Ok(Some(bytes))
    }

    async fn save(&self, key: &SessionKey, slot: &str, bytes: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.artifact_path(key, slot);

        // Atomic write: temp file then rename, so a crash mid-write never
        // leaves a truncated artifact behind.
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, bytes)
            .with_context(|| format!("Failed to write temp artifact {:?}", temp_path))?;
        fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to move artifact into place at {:?}", path))?;

        info!("FsArtifactStore: Saved {} bytes to {:?}", bytes.len(), path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key() -> SessionKey {
        SessionKey::new("ETH/USDT", "5m")
    }

    #[tokio::test]
    async fn test_missing_artifact_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();

        let loaded = store.load(&key(), "model").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load_returns_the_bytes() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();

        store.save(&key(), "model", b"payload").await.unwrap();

        assert!(dir.path().join("ETH_USDT_5m_model.json").exists());
        let loaded = store.load(&key(), "model").await.unwrap();
        assert_eq!(loaded.as_deref(), Some(b"payload".as_slice()));
    }

    #[tokio::test]
    async fn test_save_overwrites_the_previous_artifact() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();

        store.save(&key(), "price_scaler", b"old").await.unwrap();
        store.save(&key(), "price_scaler", b"new").await.unwrap();

        let loaded = store.load(&key(), "price_scaler").await.unwrap();
        assert_eq!(loaded.as_deref(), Some(b"new".as_slice()));
    }

    #[tokio::test]
    async fn test_slots_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();

        store.save(&key(), "model", b"m").await.unwrap();
        store.save(&key(), "price_scaler", b"p").await.unwrap();

        assert_eq!(
            store.load(&key(), "model").await.unwrap().as_deref(),
            Some(b"m".as_slice())
        );
        assert_eq!(
            store.load(&key(), "price_scaler").await.unwrap().as_deref(),
            Some(b"p".as_slice())
        );
    }

    #[tokio::test]
    async fn test_creates_missing_root_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("artifacts").join("models");

        let store = FsArtifactStore::new(&nested).unwrap();
        store.save(&key(), "model", b"x").await.unwrap();

        assert!(nested.join("ETH_USDT_5m_model.json").exists());
    }
}
