//! Configuration management for volmix
//!
//! Settings live in a TOML file with an `[alsamixer]` section. Every key has a
//! default, so an empty file (or no file at all) selects the `Master` control
//! of the default card with a cubic volume curve.

mod settings;

pub use settings::{MixerSettings, VolumeScale};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Standard configuration paths
pub const CONFIG_DIR: &str = "/etc/volmix";
pub const CONFIG_FILE: &str = "volmix.toml";

/// Main volmix configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolmixConfig {
    #[serde(default)]
    pub alsamixer: MixerSettings,
}

impl VolmixConfig {
    /// Load and validate configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.alsamixer.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<Self, ConfigError> {
        // Try user config first, then system config
        if let Some(user_config) = user_config_path()
            && user_config.exists()
        {
            return Self::load(&user_config);
        }

        let system_config = Path::new(CONFIG_DIR).join(CONFIG_FILE);
        if system_config.exists() {
            return Self::load(&system_config);
        }

        // Return default config if no file exists
        tracing::info!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.alsamixer.validate()?;
        let contents = toml::to_string_pretty(self)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        tracing::info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// `$XDG_CONFIG_HOME/volmix/volmix.toml`, falling back to `~/.config`
pub fn user_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("volmix").join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = VolmixConfig::default();
        assert_eq!(config.alsamixer.control, "Master");
        assert_eq!(config.alsamixer.device, "default");
        assert_eq!(config.alsamixer.volume_scale, VolumeScale::Cubic);
    }

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let config_content = r#"
[alsamixer]
card = 1
control = "PCM"
min_volume = 10
max_volume = 90
volume_scale = "log"
"#;
        write!(temp_file, "{}", config_content).unwrap();

        let config = VolmixConfig::load(temp_file.path()).unwrap();
        assert_eq!(config.alsamixer.card, Some(1));
        assert_eq!(config.alsamixer.control, "PCM");
        assert_eq!(config.alsamixer.min_volume, 10);
        assert_eq!(config.alsamixer.max_volume, 90);
        assert_eq!(config.alsamixer.volume_scale, VolumeScale::Logarithmic);
    }

    #[test]
    fn test_load_empty_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let config = VolmixConfig::load(temp_file.path()).unwrap();
        assert_eq!(config, VolmixConfig::default());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = VolmixConfig::load(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_rejects_inverted_range() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "[alsamixer]\nmin_volume = 80\nmax_volume = 20\n").unwrap();

        let result = VolmixConfig::load(temp_file.path());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_rejects_unknown_scale() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "[alsamixer]\nvolume_scale = \"quadratic\"\n").unwrap();

        let result = VolmixConfig::load(temp_file.path());
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_save_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let mut config = VolmixConfig::default();
        config.alsamixer.card = Some(2);
        config.alsamixer.volume_scale = VolumeScale::Linear;

        config.save(&path).unwrap();

        let loaded = VolmixConfig::load(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::NotFound(PathBuf::from("/etc/volmix/volmix.toml"));
        assert!(format!("{}", err).contains("not found"));

        let err = ConfigError::Invalid("test error".to_string());
        assert!(format!("{}", err).contains("Invalid"));
    }

    #[test]
    fn test_constants() {
        assert_eq!(CONFIG_DIR, "/etc/volmix");
        assert_eq!(CONFIG_FILE, "volmix.toml");
    }
}
