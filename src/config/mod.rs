//! Engine configuration.
//!
//! Resolution order, highest priority first:
//! 1. Environment (`LMNINJA_HOST`, `LMNINJA_PORT`, `LMNINJA_CLASSIFIER_DIR`, `LMNINJA_OLLAMA_URL`)
//! 2. TOML file (`--config`, or `config.toml` in the platform config dir)
//! 3. Built-in defaults
//!
//! A missing config file is not an error; a malformed one is.

pub mod schema;

pub use schema::{
    ClassifierConfig, Config, GatewayConfig, GenerationConfig, RemoteConfig, WorkerConfig,
};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Default config file location, e.g. `~/.config/lmninja-engine/config.toml` on Linux.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("ai", "lmninja", "lmninja-engine")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Expand `~` and `$VARS` in a user-supplied path.
pub fn expand_path(raw: &str) -> PathBuf {
    let expanded = shellexpand::full(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| shellexpand::tilde(raw).into_owned());
    PathBuf::from(expanded)
}

impl Config {
    /// Load from an explicit path, or from the default location when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match default_config_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply environment overrides. `lookup` is injected so tests never touch
    /// the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key).and_then(|v| {
                let v = v.trim();
                (!v.is_empty()).then(|| v.to_owned())
            })
        };

        if let Some(host) = non_empty("LMNINJA_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = non_empty("LMNINJA_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.gateway.port = p,
                Err(_) => tracing::warn!("Ignoring invalid LMNINJA_PORT value: {port}"),
            }
        }
        if let Some(dir) = non_empty("LMNINJA_CLASSIFIER_DIR") {
            self.classifier.model_dir = dir;
        }
        if let Some(url) = non_empty("LMNINJA_OLLAMA_URL") {
            self.remote.url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            anyhow::bail!("gateway.port must be non-zero");
        }
        if self.gateway.request_timeout_secs == 0 {
            anyhow::bail!("gateway.request_timeout_secs must be at least 1");
        }
        if self.workers.max_concurrent == 0 {
            anyhow::bail!("workers.max_concurrent must be at least 1");
        }
        if self.classifier.max_sequence_length < 2 {
            anyhow::bail!(
                "classifier.max_sequence_length must leave room for the leading and trailing special tokens"
            );
        }
        if self.remote.url.trim().is_empty() {
            anyhow::bail!("remote.url cannot be empty");
        }
        Ok(())
    }

    /// Classifier directory with `~` expanded.
    pub fn classifier_dir(&self) -> PathBuf {
        expand_path(&self.classifier.model_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_match_sidecar_contract() {
        let config = Config::default();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 1337);
        assert_eq!(config.classifier.max_sequence_length, 512);
        assert!(config
            .generation
            .stop_sequences
            .iter()
            .any(|s| s == "<|eot_id|>"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[gateway]\nport = 9000\n\n[workers]\nmax_concurrent = 2").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.workers.max_concurrent, 2);
        assert_eq!(config.remote.url, "http://127.0.0.1:11434");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[gateway\nport = ").unwrap();
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let env: HashMap<&str, &str> = [
            ("LMNINJA_PORT", "4242"),
            ("LMNINJA_OLLAMA_URL", "http://10.0.0.5:11434"),
            ("LMNINJA_HOST", "   "),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| (*v).to_string()));
        assert_eq!(config.gateway.port, 4242);
        assert_eq!(config.remote.url, "http://10.0.0.5:11434");
        // Blank values are ignored.
        assert_eq!(config.gateway.host, "127.0.0.1");
    }

    #[test]
    fn invalid_port_override_is_ignored() {
        let mut config = Config::default();
        config.apply_env_overrides(|k| (k == "LMNINJA_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.gateway.port, 1337);
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.workers.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_request_timeout() {
        let mut config = Config::default();
        config.gateway.request_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("request_timeout_secs"));

        config.gateway.request_timeout_secs = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn classifier_dir_expands_tilde() {
        let config = Config::default();
        let dir = config.classifier_dir();
        assert!(!dir.to_string_lossy().starts_with('~'));
        assert!(dir.ends_with(".lmninja/models/compliance-classifier"));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = Config::default();
        let rendered = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
