use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use secarc_core::DEFAULT_ITERATIONS;

/// Defaults for the `secarc` command (loaded from an optional TOML file)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecarcConfig {
    pub encrypt: EncryptConfig,
    pub passwd: PasswdConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptConfig {
    /// PBKDF2 iterations for new containers (default: 300000)
    pub iterations: u32,
    /// Replace an existing output file without --force
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswdConfig {
    /// PBKDF2 iterations after a password change (0 = keep the stored count)
    pub iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level or EnvFilter directive (default: warn)
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

impl Default for EncryptConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            overwrite: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".into(),
            format: LogFormat::Text,
        }
    }
}

impl PasswdConfig {
    pub fn iterations_override(&self) -> Option<u32> {
        (self.iterations != 0).then_some(self.iterations)
    }
}

/// Load the config file, or defaults when no path is given.
///
/// Returns whether a file was actually read; a named file that does not
/// exist falls back to defaults so the caller can warn once logging is up.
pub fn load_config(path: Option<&Path>) -> Result<(SecarcConfig, bool)> {
    let Some(path) = path else {
        return Ok((SecarcConfig::default(), false));
    };
    if !path.exists() {
        return Ok((SecarcConfig::default(), false));
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok((config, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[encrypt]
iterations = 500000
overwrite = true

[passwd]
iterations = 400000

[log]
level = "debug"
format = "json"
"#;
        let config: SecarcConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.encrypt.iterations, 500_000);
        assert!(config.encrypt.overwrite);
        assert_eq!(config.passwd.iterations_override(), Some(400_000));
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_defaults() {
        let config: SecarcConfig = toml::from_str("").unwrap();

        assert_eq!(config.encrypt.iterations, DEFAULT_ITERATIONS);
        assert!(!config.encrypt.overwrite);
        assert_eq!(config.passwd.iterations_override(), None);
        assert_eq!(config.log.level, "warn");
        assert_eq!(config.log.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[encrypt]
overwrite = true
"#;
        let config: SecarcConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert!(config.encrypt.overwrite);
        // Defaults
        assert_eq!(config.encrypt.iterations, DEFAULT_ITERATIONS);
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn test_reject_unknown_log_format() {
        let result: Result<SecarcConfig, _> = toml::from_str("[log]\nformat = \"xml\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = SecarcConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: SecarcConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (config, found) = load_config(Some(&dir.path().join("nope.toml"))).unwrap();
        assert!(!found);
        assert_eq!(config, SecarcConfig::default());

        let (_, found) = load_config(None).unwrap();
        assert!(!found);
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secarc.toml");
        std::fs::write(&path, "[passwd]\niterations = 0\n[encrypt]\niterations = 20000\n").unwrap();

        let (config, found) = load_config(Some(&path)).unwrap();
        assert!(found);
        assert_eq!(config.encrypt.iterations, 20_000);
        assert_eq!(config.passwd.iterations_override(), None);
    }

    #[test]
    fn test_load_config_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secarc.toml");
        std::fs::write(&path, "[encrypt\n").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("parsing config"));
    }
}
