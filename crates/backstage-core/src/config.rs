//! Engine configuration.
//!
//! A [`RuntimeConfig`] is fixed for the lifetime of an engine instance. Its
//! environment, configuration value, allow-list and virtual modules are
//! read-only inputs shared by every invocation on that instance.
//!
//! # Examples
//!
//! ```
//! use backstage_core::RuntimeConfig;
//! use std::time::Duration;
//!
//! let config = RuntimeConfig::builder()
//!     .sync_timeout(Duration::from_millis(50))
//!     .allow_module("path")
//!     .env_var("REGION", "eu")
//!     .build();
//!
//! assert_eq!(config.sync_timeout(), Duration::from_millis(50));
//! assert_eq!(config.async_timeout(), Duration::from_millis(5000));
//! assert_eq!(config.global_modules(), ["path"]);
//! ```

use crate::ipc::InvocationPayload;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default synchronous budget.
const DEFAULT_SYNC_TIMEOUT_MS: u64 = 100;
/// Default completion deadline.
const DEFAULT_ASYNC_TIMEOUT_MS: u64 = 5000;
/// Default V8 heap ceiling.
const DEFAULT_MAX_HEAP_BYTES: usize = 64 * 1024 * 1024;
/// Default number of isolates allowed to run at once.
const DEFAULT_MAX_CONCURRENT: usize = 16;
/// Default number of compiled units kept per engine.
const DEFAULT_UNIT_CACHE_CAPACITY: usize = 128;

/// Per-engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    sync_timeout_ms: u64,
    async_timeout_ms: u64,
    max_heap_bytes: usize,
    max_concurrent: usize,
    unit_cache_capacity: usize,
    env: Map<String, Value>,
    config: Value,
    global_modules: Vec<String>,
    virtual_modules: BTreeMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            async_timeout_ms: DEFAULT_ASYNC_TIMEOUT_MS,
            max_heap_bytes: DEFAULT_MAX_HEAP_BYTES,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            unit_cache_capacity: DEFAULT_UNIT_CACHE_CAPACITY,
            env: Map::new(),
            config: Value::Object(Map::new()),
            global_modules: Vec::new(),
            virtual_modules: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Creates a builder starting from the defaults.
    #[must_use]
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Derives the configuration a worker uses for one payload.
    ///
    /// Timeouts missing from the payload, or set to 0, keep their defaults.
    ///
    /// # Examples
    ///
    /// ```
    /// use backstage_core::RuntimeConfig;
    /// use backstage_core::ipc::InvocationPayload;
    /// use serde_json::json;
    /// use std::time::Duration;
    ///
    /// let payload: InvocationPayload = serde_json::from_value(json!({
    ///     "namespace": "acme",
    ///     "functionName": "hello",
    ///     "syncTimeout": 250,
    ///     "globalModules": ["util"],
    ///     "preCode": {"code": "function main() {}"}
    /// }))?;
    ///
    /// let config = RuntimeConfig::from_payload(&payload);
    /// assert_eq!(config.sync_timeout(), Duration::from_millis(250));
    /// assert_eq!(config.async_timeout(), Duration::from_millis(5000));
    /// assert_eq!(config.global_modules(), ["util"]);
    /// # Ok::<(), serde_json::Error>(())
    /// ```
    #[must_use]
    pub fn from_payload(payload: &InvocationPayload) -> Self {
        let mut builder = Self::builder()
            .env(payload.env.clone())
            .config(payload.config.clone())
            .global_modules(payload.global_modules.iter().cloned());
        if let Some(ms) = payload.sync_timeout.filter(|&ms| ms > 0) {
            builder = builder.sync_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = payload.async_timeout.filter(|&ms| ms > 0) {
            builder = builder.async_timeout(Duration::from_millis(ms));
        }
        for (key, source) in &payload.modules {
            builder = builder.virtual_module(key.clone(), source.clone());
        }
        builder.build()
    }

    /// Synchronous execution budget.
    #[must_use]
    pub const fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// Whole-invocation completion deadline.
    #[must_use]
    pub const fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout_ms)
    }

    /// V8 heap ceiling in bytes.
    #[must_use]
    pub const fn max_heap_bytes(&self) -> usize {
        self.max_heap_bytes
    }

    /// Maximum number of isolates running at once on this engine.
    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Capacity of the compiled-unit cache.
    #[must_use]
    pub const fn unit_cache_capacity(&self) -> usize {
        self.unit_cache_capacity
    }

    /// Environment visible as `Backstage.env`.
    #[must_use]
    pub const fn env(&self) -> &Map<String, Value> {
        &self.env
    }

    /// Configuration visible as `Backstage.config`.
    #[must_use]
    pub const fn config(&self) -> &Value {
        &self.config
    }

    /// Host modules sandboxed code may require by exact name.
    #[must_use]
    pub fn global_modules(&self) -> &[String] {
        &self.global_modules
    }

    /// Virtual module sources keyed by module key.
    #[must_use]
    pub const fn virtual_modules(&self) -> &BTreeMap<String, String> {
        &self.virtual_modules
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Sets the synchronous budget.
    #[must_use]
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the completion deadline.
    #[must_use]
    pub fn async_timeout(mut self, timeout: Duration) -> Self {
        self.config.async_timeout_ms = duration_ms(timeout);
        self
    }

    /// Sets the V8 heap ceiling.
    #[must_use]
    pub const fn max_heap_bytes(mut self, bytes: usize) -> Self {
        self.config.max_heap_bytes = bytes;
        self
    }

    /// Sets the number of isolates allowed to run at once (at least one).
    #[must_use]
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max.max(1);
        self
    }

    /// Sets the compiled-unit cache capacity (at least one).
    #[must_use]
    pub fn unit_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.unit_cache_capacity = capacity.max(1);
        self
    }

    /// Replaces the environment.
    #[must_use]
    pub fn env(mut self, env: Map<String, Value>) -> Self {
        self.config.env = env;
        self
    }

    /// Adds one environment variable.
    #[must_use]
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Sets the configuration value.
    #[must_use]
    pub fn config(mut self, config: Value) -> Self {
        self.config.config = config;
        self
    }

    /// Allows one host module.
    #[must_use]
    pub fn allow_module(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.config.global_modules.contains(&name) {
            self.config.global_modules.push(name);
        }
        self
    }

    /// Allows several host modules.
    #[must_use]
    pub fn global_modules<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names.into_iter().fold(self, Self::allow_module)
    }

    /// Registers a virtual module under `key`.
    #[must_use]
    pub fn virtual_module(mut self, key: impl Into<String>, source: impl Into<String>) -> Self {
        self.config.virtual_modules.insert(key.into(), source.into());
        self
    }

    /// Finishes the configuration.
    #[must_use]
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.sync_timeout(), Duration::from_millis(100));
        assert_eq!(config.async_timeout(), Duration::from_millis(5000));
        assert_eq!(config.max_heap_bytes(), 64 * 1024 * 1024);
        assert!(config.global_modules().is_empty());
        assert_eq!(config.config(), &json!({}));
    }

    #[test]
    fn test_allow_module_deduplicates() {
        let config = RuntimeConfig::builder()
            .allow_module("path")
            .global_modules(["path", "util"])
            .build();
        assert_eq!(config.global_modules(), ["path", "util"]);
    }

    #[test]
    fn test_limits_never_drop_to_zero() {
        let config = RuntimeConfig::builder()
            .max_concurrent(0)
            .unit_cache_capacity(0)
            .build();
        assert_eq!(config.max_concurrent(), 1);
        assert_eq!(config.unit_cache_capacity(), 1);
    }

    #[test]
    fn test_from_payload_zero_timeouts_keep_defaults() {
        let payload: InvocationPayload = serde_json::from_value(json!({
            "namespace": "ns",
            "functionName": "fn",
            "syncTimeout": 0,
            "asyncTimeout": 0,
            "config": null,
            "preCode": {"code": "function main() {}"}
        }))
        .unwrap();

        let config = RuntimeConfig::from_payload(&payload);
        assert_eq!(config.sync_timeout(), Duration::from_millis(DEFAULT_SYNC_TIMEOUT_MS));
        assert_eq!(config.async_timeout(), Duration::from_millis(DEFAULT_ASYNC_TIMEOUT_MS));
        assert_eq!(config.config(), &json!({}));
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let config: RuntimeConfig =
            serde_json::from_value(json!({"async_timeout_ms": 20})).unwrap();
        assert_eq!(config.async_timeout(), Duration::from_millis(20));
        assert_eq!(config.sync_timeout(), Duration::from_millis(100));
    }
}
