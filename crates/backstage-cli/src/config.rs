//! CLI configuration file.
//!
//! Configuration is stored in TOML format at:
//! - Linux/macOS: `~/.config/backstage/config.toml`
//! - Windows: `%APPDATA%\backstage\config.toml`
//!
//! `--config <path>` replaces the default location. Command-line flags win
//! over anything the file says.

use anyhow::{Context, Result, bail};
use backstage_core::{RuntimeConfig, RuntimeConfigBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// CLI configuration.
///
/// # Examples
///
/// ```toml
/// [runtime]
/// sync_timeout_ms = 100
/// async_timeout_ms = 5000
/// max_heap_mb = 64
/// global_modules = ["path", "util"]
///
/// [env]
/// GREETING = "hello"
///
/// [config]
/// region = "eu"
///
/// [modules]
/// "./shared/format" = "module.exports = (s) => s.toUpperCase();"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Engine limits and the host module allow-list
    #[serde(default)]
    pub runtime: RuntimeSection,

    /// Environment visible as `Backstage.env`
    #[serde(default)]
    pub env: Map<String, Value>,

    /// Value of `Backstage.config`
    #[serde(default)]
    pub config: Map<String, Value>,

    /// Virtual module sources keyed by module key
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

/// `[runtime]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Synchronous budget in milliseconds
    pub sync_timeout_ms: Option<u64>,

    /// Completion deadline in milliseconds
    pub async_timeout_ms: Option<u64>,

    /// V8 heap ceiling in MiB
    pub max_heap_mb: Option<u64>,

    /// Isolates allowed to run at once
    pub max_concurrent: Option<usize>,

    /// Host modules sandboxed code may require
    #[serde(default)]
    pub global_modules: Vec<String>,
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `KEY=VALUE` pairs; values that parse as JSON are kept typed
    pub env: Vec<String>,
    /// Extra allow-listed host modules
    pub allow: Vec<String>,
    /// Synchronous budget in milliseconds
    pub sync_timeout_ms: Option<u64>,
    /// Completion deadline in milliseconds
    pub async_timeout_ms: Option<u64>,
}

impl CliConfig {
    /// Loads the file at `path`, or the default file if `path` is `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let Some(path) = default_config_path() else {
                    debug!("no config directory on this platform, using defaults");
                    return Ok(Self::default());
                };
                if !path.exists() {
                    debug!(path = %path.display(), "config file not found, using defaults");
                    return Ok(Self::default());
                }
                path
            }
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Parses TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is zero.
    pub fn validate(&self) -> Result<()> {
        if self.runtime.sync_timeout_ms == Some(0) {
            bail!("runtime.sync_timeout_ms must be greater than 0");
        }
        if self.runtime.async_timeout_ms == Some(0) {
            bail!("runtime.async_timeout_ms must be greater than 0");
        }
        if self.runtime.max_heap_mb == Some(0) {
            bail!("runtime.max_heap_mb must be greater than 0");
        }
        Ok(())
    }

    /// Engine configuration from the file alone.
    #[must_use]
    pub fn builder(&self) -> RuntimeConfigBuilder {
        let runtime = &self.runtime;
        let mut builder = RuntimeConfig::builder()
            .env(self.env.clone())
            .config(Value::Object(self.config.clone()))
            .global_modules(runtime.global_modules.iter().cloned());

        if let Some(ms) = runtime.sync_timeout_ms {
            builder = builder.sync_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = runtime.async_timeout_ms {
            builder = builder.async_timeout(Duration::from_millis(ms));
        }
        if let Some(mb) = runtime.max_heap_mb {
            let bytes = usize::try_from(mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX);
            builder = builder.max_heap_bytes(bytes);
        }
        if let Some(max) = runtime.max_concurrent {
            builder = builder.max_concurrent(max);
        }
        for (key, source) in &self.modules {
            builder = builder.virtual_module(key.clone(), source.clone());
        }
        builder
    }

    /// Engine configuration with command-line values applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if an `--env` value is not `KEY=VALUE`.
    pub fn runtime_config(&self, overrides: &Overrides) -> Result<RuntimeConfig> {
        let mut builder = self.builder().global_modules(overrides.allow.iter().cloned());
        for pair in &overrides.env {
            let (key, value) = parse_env_pair(pair)?;
            builder = builder.env_var(key, value);
        }
        if let Some(ms) = overrides.sync_timeout_ms {
            builder = builder.sync_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = overrides.async_timeout_ms {
            builder = builder.async_timeout(Duration::from_millis(ms));
        }
        Ok(builder.build())
    }
}

/// Default configuration file path, if the platform has a config directory.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("backstage").join("config.toml"))
}

/// Parses a `KEY=VALUE` pair.
///
/// The value is read as JSON when it parses, so `N=5` yields a number and
/// `N=hello` a string.
///
/// # Errors
///
/// Returns an error if there is no `=` or the key is empty.
///
/// # Examples
///
/// ```
/// use backstage_cli::config::parse_env_pair;
/// use serde_json::json;
///
/// assert_eq!(parse_env_pair("N=5").unwrap(), ("N".to_string(), json!(5)));
/// assert_eq!(parse_env_pair("S=hello").unwrap(), ("S".to_string(), json!("hello")));
/// assert!(parse_env_pair("missing").is_err());
/// ```
pub fn parse_env_pair(pair: &str) -> Result<(String, Value)> {
    let Some((key, raw)) = pair.split_once('=') else {
        bail!("invalid environment variable format: '{pair}' (expected KEY=VALUE)");
    };
    if key.is_empty() {
        bail!("invalid environment variable format: '{pair}' (empty key)");
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_file() {
        let config = CliConfig::parse(
            r#"
            [runtime]
            sync_timeout_ms = 250
            async_timeout_ms = 1000
            max_heap_mb = 32
            global_modules = ["path"]

            [env]
            GREETING = "hi"
            COUNT = 3

            [config]
            region = "eu"

            [modules]
            "./lib/one" = "module.exports = 1;"
            "#,
        )
        .unwrap();

        let runtime = config.runtime_config(&Overrides::default()).unwrap();
        assert_eq!(runtime.sync_timeout(), Duration::from_millis(250));
        assert_eq!(runtime.async_timeout(), Duration::from_millis(1000));
        assert_eq!(runtime.max_heap_bytes(), 32 * 1024 * 1024);
        assert_eq!(runtime.global_modules(), ["path"]);
        assert_eq!(runtime.env().get("COUNT"), Some(&json!(3)));
        assert_eq!(runtime.config(), &json!({"region": "eu"}));
        assert!(runtime.virtual_modules().contains_key("./lib/one"));
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = CliConfig::parse("").unwrap();
        assert_eq!(config, CliConfig::default());
    }

    #[test]
    fn test_flags_override_file() {
        let config = CliConfig::parse(
            r#"
            [runtime]
            async_timeout_ms = 1000
            [env]
            RESULT = 1
            "#,
        )
        .unwrap();
        let overrides = Overrides {
            env: vec!["RESULT=5".to_string(), "NAME=x".to_string()],
            allow: vec!["util".to_string()],
            sync_timeout_ms: None,
            async_timeout_ms: Some(200),
        };

        let runtime = config.runtime_config(&overrides).unwrap();
        assert_eq!(runtime.env().get("RESULT"), Some(&json!(5)));
        assert_eq!(runtime.env().get("NAME"), Some(&json!("x")));
        assert_eq!(runtime.global_modules(), ["util"]);
        assert_eq!(runtime.async_timeout(), Duration::from_millis(200));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = CliConfig::parse("[runtime]\nsync_timeout_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("sync_timeout_ms"));
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = CliConfig::load(Some(&dir.path().join("nope.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[env]\nA = \"b\"\n").unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.env.get("A"), Some(&json!("b")));
    }

    #[test]
    fn test_env_pair_keeps_equals_in_value() {
        let (key, value) = parse_env_pair("URL=a=b").unwrap();
        assert_eq!(key, "URL");
        assert_eq!(value, json!("a=b"));
    }
}
