use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// The file is read once at startup. A missing file yields the defaults so
/// the daemon can run unconfigured on stock images.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: Arc<AppConfig>,
}

impl ConfigStore {
    /// Load configuration from `path`
    pub async fn load(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                info!("Loading configuration from {}", path.display());
                serde_json::from_str::<AppConfig>(&content).map_err(|e| {
                    AppError::Config(format!("Invalid configuration {}: {}", path.display(), e))
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {}, using defaults", path.display());
                AppConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self::with_config(path, config))
    }

    /// Wrap an already built configuration
    pub fn with_config(path: &Path, config: AppConfig) -> Self {
        Self {
            path: path.to_path_buf(),
            config: Arc::new(config),
        }
    }

    /// Get current configuration
    pub fn get(&self) -> Arc<AppConfig> {
        self.config.clone()
    }

    /// Apply command line overrides and validate the result
    pub fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.config).clone();
        f(&mut config);
        config.validate()?;
        self.config = Arc::new(config);
        Ok(())
    }

    /// Path the configuration was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::load(&dir.path().join("config.json"))
            .await
            .unwrap();
        assert_eq!(store.get().gadget.technology, "gadget");
    }

    #[tokio::test]
    async fn test_load_and_update() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{ "gadget": { "interface": "usb1" } }"#)
            .await
            .unwrap();

        let mut store = ConfigStore::load(&path).await.unwrap();
        assert_eq!(store.get().gadget.interface, "usb1");

        store.update(|c| c.web.http_port = 9000).unwrap();
        assert_eq!(store.get().web.http_port, 9000);

        let err = store.update(|c| c.gadget.step_timeout_ms = 0).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        // Rejected updates leave the previous configuration in place
        assert_eq!(store.get().gadget.step_timeout_ms, 5000);
    }

    #[tokio::test]
    async fn test_invalid_json_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = ConfigStore::load(&path).await.err().unwrap();
        assert!(matches!(err, AppError::Config(_)));
    }
}
