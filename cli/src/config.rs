use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use larder_core::import::DEFAULT_BATCH_SIZE;
use larder_core::matcher::{MatchStrategy, MatcherConfig};

const SETTINGS_FILE: &str = "larder.toml";
const DB_ENV: &str = "LARDER_DB";

/// Tunables read from `larder.toml` in the data directory. Every key is optional.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub batch_size: usize,
    pub page_size: usize,
    pub strategy: MatchStrategy,
    pub category_fallback: bool,
    pub category_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let matcher = MatcherConfig::default();
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: matcher.page_size,
            strategy: matcher.strategy,
            category_fallback: matcher.category_fallback,
            category_limit: matcher.category_limit,
        }
    }
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: Self = toml::from_str(text).context("Invalid larder.toml")?;
        if settings.batch_size == 0 || settings.page_size == 0 {
            anyhow::bail!("batch_size and page_size must be at least 1");
        }
        Ok(settings)
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            page_size: self.page_size,
            strategy: self.strategy,
            category_fallback: self.category_fallback,
            category_limit: self.category_limit,
        }
    }
}

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub settings: Settings,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "larder").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = std::env::var_os(DB_ENV)
            .map_or_else(|| data_dir.join("larder.db"), PathBuf::from);
        let settings = load_settings(&data_dir.join(SETTINGS_FILE))?;

        Ok(Config {
            db_path,
            data_dir,
            settings,
        })
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let settings = Settings::from_toml(&text)?;
    tracing::debug!(path = %path.display(), ?settings, "loaded settings");
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_settings_use_defaults() {
        assert_eq!(Settings::from_toml("").unwrap(), Settings::default());
        assert_eq!(Settings::default().batch_size, 1000);
    }

    #[test]
    fn test_partial_settings() {
        let s = Settings::from_toml("batch_size = 250\nstrategy = \"ranked\"\n").unwrap();
        assert_eq!(s.batch_size, 250);
        assert_eq!(s.strategy, MatchStrategy::Ranked);
        assert!(s.category_fallback);
        assert_eq!(s.matcher_config().strategy, MatchStrategy::Ranked);
    }

    #[test]
    fn test_invalid_settings() {
        assert!(Settings::from_toml("batch_size = 0").is_err());
        assert!(Settings::from_toml("batchsize = 10").is_err());
        assert!(Settings::from_toml("strategy = \"best\"").is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings(&dir.path().join("larder.toml")).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn test_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("larder.toml");
        std::fs::write(&path, "category_fallback = false\ncategory_limit = 5\n").unwrap();
        let s = load_settings(&path).unwrap();
        assert!(!s.matcher_config().category_fallback);
        assert_eq!(s.category_limit, 5);
    }
}
