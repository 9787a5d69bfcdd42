//! Service configuration file support

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete tracking-service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Root directory holding one subdirectory per site
    pub data_dir: PathBuf,
    pub pipe: PipeConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub sites: Vec<SiteConfig>,
}

impl ServiceConfig {
    /// Load configuration from a file (YAML or TOML)
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        match extension {
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            "toml" => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            _ => Err(anyhow::anyhow!(
                "Unsupported config file format: {}. Use .yaml, .yml, or .toml",
                extension
            )),
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let content = match extension {
            "yaml" | "yml" => serde_yaml::to_string(self)?,
            "toml" => toml::to_string_pretty(self)?,
            _ => {
                return Err(anyhow::anyhow!(
                    "Unsupported config file format: {}. Use .yaml, .yml, or .toml",
                    extension
                ))
            }
        };

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Create a single-site starter configuration
    pub fn example() -> Self {
        Self {
            data_dir: PathBuf::from("./urltrack-data"),
            pipe: PipeConfig {
                path: PathBuf::from("./urltrack-data/pipe"),
                capacity: default_pipe_capacity(),
            },
            schedule: ScheduleConfig::default(),
            sites: vec![SiteConfig {
                id: 1,
                name: "www.example.com".to_string(),
                table_capacity: default_table_capacity(),
                max_retained: default_max_retained(),
                max_temp_bytes: Some(64 * 1024 * 1024),
                keep_after_flush: false,
                obsolete_fprints: None,
            }],
        }
    }

    pub fn site_by_name(&self, name: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.name == name)
    }
}

/// Ingestion pipe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Path of the shared-memory segment file
    pub path: PathBuf,
    /// Ring capacity in events
    #[serde(default = "default_pipe_capacity")]
    pub capacity: usize,
}

/// Periodic service cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_flush_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_merge_secs")]
    pub merge_interval_secs: u64,
    /// Records older than this many days are dropped at consolidation
    /// (0 = keep everything)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_secs(),
            merge_interval_secs: default_merge_secs(),
            retention_days: default_retention_days(),
        }
    }
}

/// Per-site configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Numeric id carried by pipe events
    pub id: u32,
    /// Site identifier; sanitized into the directory name
    pub name: String,
    #[serde(default = "default_table_capacity")]
    pub table_capacity: usize,
    #[serde(default = "default_max_retained")]
    pub max_retained: u64,
    /// Aggregate byte budget for pending temp files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_temp_bytes: Option<u64>,
    /// Keep records in memory after a flush instead of draining
    #[serde(default)]
    pub keep_after_flush: bool,
    /// Optional fingerprint-index file of obsoleted URLs (from the URL
    /// filter configuration)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obsolete_fprints: Option<PathBuf>,
}

fn default_pipe_capacity() -> usize {
    4096
}

fn default_flush_secs() -> u64 {
    300
}

fn default_merge_secs() -> u64 {
    3600
}

fn default_retention_days() -> u32 {
    0
}

fn default_table_capacity() -> usize {
    100_000
}

fn default_max_retained() -> u64 {
    1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_example_config() {
        let config = ServiceConfig::example();
        assert_eq!(config.sites.len(), 1);
        assert!(config.site_by_name("www.example.com").is_some());
        assert!(config.site_by_name("other").is_none());
    }

    #[test]
    fn test_save_and_load_yaml() {
        let config = ServiceConfig::example();

        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension("yaml");

        config.save(&path).unwrap();
        let loaded = ServiceConfig::load(&path).unwrap();

        assert_eq!(config.data_dir, loaded.data_dir);
        assert_eq!(config.sites[0].name, loaded.sites[0].name);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_save_and_load_toml() {
        let config = ServiceConfig::example();

        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension("toml");

        config.save(&path).unwrap();
        let loaded = ServiceConfig::load(&path).unwrap();

        assert_eq!(config.pipe.capacity, loaded.pipe.capacity);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_unsupported_format() {
        let config = ServiceConfig::example();
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension("json");

        assert!(config.save(&path).is_err());
    }

    #[test]
    fn test_defaults_fill_in() {
        let yaml = r#"
data_dir: /var/lib/urltrack
pipe:
  path: /var/lib/urltrack/pipe
sites:
  - id: 1
    name: example.com
"#;
        let config: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pipe.capacity, 4096);
        assert_eq!(config.schedule.flush_interval_secs, 300);
        assert_eq!(config.sites[0].table_capacity, 100_000);
        assert!(!config.sites[0].keep_after_flush);
    }
}
