use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Recommended upper bound for a single message payload
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 100 * 1024;

/// Application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_directory: String,
    /// Where received files are staged
    pub download_directory: String,
    pub log_directory: String,
    /// Capabilities advertised as soon as a connection is established
    pub initial_capabilities: Vec<String>,
    pub max_message_bytes: usize,
    pub blocking_timeout_ms: u64,
    pub copy_buffer_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let data_dir = format!("{}/.wearlink", home);

        Self {
            data_directory: data_dir.clone(),
            download_directory: format!("{}/downloads", data_dir),
            log_directory: "logs".to_string(),
            initial_capabilities: Vec::new(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            blocking_timeout_ms: 5_000,
            copy_buffer_bytes: 64 * 1024, // 64KB
        }
    }
}

impl AppConfig {
    /// Load configuration from file or create default
    pub fn load_or_default(config_path: Option<&str>) -> Self {
        if let Some(config) = config_path
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
        {
            return config;
        }
        Self::default()
    }

    /// Configuration rooted at `data_dir`, used by the demo and tests
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            data_directory: data_dir.to_string_lossy().to_string(),
            download_directory: data_dir.join("downloads").to_string_lossy().to_string(),
            ..Self::default()
        }
    }

    /// Save configuration to file
    pub fn save_to_file(&self, config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn data_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.data_directory)
    }

    pub fn download_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.download_directory)
    }

    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> Result<(), std::io::Error> {
        std::fs::create_dir_all(&self.data_directory)?;
        std::fs::create_dir_all(&self.download_directory)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.download_directory.is_empty() {
            return Err("Download directory must be set".into());
        }

        if self.max_message_bytes == 0 {
            return Err("Max message size must be greater than 0".into());
        }

        if self.copy_buffer_bytes == 0 {
            return Err("Copy buffer size must be greater than 0".into());
        }

        if self.blocking_timeout_ms == 0 {
            return Err("Blocking timeout must be greater than 0".into());
        }

        if self.initial_capabilities.iter().any(|c| c.is_empty()) {
            return Err("Capability names cannot be empty".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        config.validate().expect("Default config should be valid");
        assert_eq!(config.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
        assert!(config.download_directory.ends_with("downloads"));
    }

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).expect("Should serialize");
        let _deserialized: AppConfig = serde_json::from_str(&json).expect("Should deserialize");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"initial_capabilities": ["msg_capability"]}"#).expect("parse");
        assert_eq!(config.initial_capabilities, vec!["msg_capability".to_string()]);
        assert_eq!(config.blocking_timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_invalid_config() {
        let config = AppConfig {
            initial_capabilities: vec![String::new()],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
