//! Probe tool configuration management

use anyhow::{Context, Result, anyhow};
use common::LogFormat;
use driver::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    /// Device, command, stream and recovery tuning
    pub session: SessionConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            session: SessionConfig::default(),
        }
    }
}

impl ProbeConfig {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/glasses-usb/probe.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ProbeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("glasses-usb").join("probe.toml")
        } else {
            PathBuf::from(".config/glasses-usb/probe.toml")
        }
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        self.session
            .validate()
            .context("Invalid session configuration")?;
        Ok(())
    }
}

/// Expand a leading `~` in a user-supplied path
pub fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, tempdir};

    #[test]
    fn test_default_config() {
        let config = ProbeConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Full);
        assert_eq!(config.session.device.vendor_id, 0x35CA);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("probe.toml");

        let mut config = ProbeConfig::default();
        config.log_level = "debug".to_string();
        config.session.keepalive.period_ms = 900;
        config.save(&path).unwrap();

        let loaded = ProbeConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.log_level, "debug");
        assert_eq!(loaded.session.keepalive.period_ms, 900);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log_format = "compact"

[session.stream]
read_timeout_ms = 50
"#
        )
        .unwrap();

        let config = ProbeConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Compact);
        assert_eq!(config.session.stream.read_timeout_ms, 50);
        assert_eq!(config.session.stream.endpoint, 0x82);
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"log_level = "loud""#).unwrap();
        assert!(ProbeConfig::load(Some(file.path().to_path_buf())).is_err());
    }

    #[test]
    fn test_invalid_session_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[session.keepalive]
period_ms = 2000
device_timeout_ms = 1500
"#
        )
        .unwrap();
        let err = ProbeConfig::load(Some(file.path().to_path_buf())).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid session configuration"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        assert!(ProbeConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_expand_path() {
        let plain = expand_path(Path::new("/etc/glasses-usb/probe.toml"));
        assert_eq!(plain, PathBuf::from("/etc/glasses-usb/probe.toml"));

        let expanded = expand_path(Path::new("~/probe.toml"));
        assert!(!expanded.to_string_lossy().starts_with('~') || dirs::home_dir().is_none());
    }
}
