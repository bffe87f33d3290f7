use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::utils::WxError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub fetcher: FetcherConfig,
    pub extractor: ExtractorConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetcherConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
    /// 源码包策略: auto / always / never
    pub source_policy: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractorConfig {
    /// 每篇最多保留的图片数
    pub max_images: usize,
    /// 是否在文章骨架里内联图片
    pub include_images: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub cache_dir: String,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config_path = PathBuf::from("config/settings.toml");

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| WxError::ConfigError(format!("config/settings.toml: {}", e)))?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = PathBuf::from(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            fetcher: FetcherConfig {
                timeout_secs: 30,
                user_agent: "wxpaper/0.1.0".to_string(),
                source_policy: "auto".to_string(),
            },
            extractor: ExtractorConfig {
                max_images: 12,
                include_images: true,
            },
            storage: StorageConfig {
                cache_dir: ".wxpaper".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = AppConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.fetcher.source_policy, "auto");
        assert_eq!(parsed.storage.cache_dir, ".wxpaper");
    }
}
