//! The sandbox engine.
//!
//! [`SandboxEngine`] compiles function source into [`CompiledUnit`]s and runs
//! them, one fresh V8 isolate per execution, under two deadlines:
//!
//! - the synchronous budget, enforced by a watchdog that terminates the
//!   isolate if the initial run of the code does not return in time
//! - the completion deadline, a [`CompletionTimer`] that ends the whole
//!   invocation with a 408 `Function timeout` if nothing settles it first
//!
//! Every way an invocation can end goes through one once-only
//! [`CompletionCallback`], which also disarms the timer.
//!
//! # Examples
//!
//! ```no_run
//! use backstage_core::{RequestEnvelope, RuntimeConfig};
//! use backstage_sandbox::{ExecuteOptions, SandboxEngine};
//!
//! # async fn example() -> backstage_core::Result<()> {
//! let config = RuntimeConfig::builder().env_var("RESULT", 21).build();
//! let engine = SandboxEngine::new(config)?;
//!
//! let unit = engine
//!     .compile("double.js", "function main() { return Backstage.env.RESULT * 2; }")
//!     .await?;
//! let outcome = engine
//!     .execute(&unit, RequestEnvelope::default(), ExecuteOptions::default())
//!     .await?;
//! assert_eq!(outcome.body, 42);
//! # Ok(())
//! # }
//! ```

use crate::cache::UnitCache;
use crate::compiler::CompiledUnit;
use crate::context::{BackstageOptions, ExecutionContext};
use crate::isolate::{self, InvocationTask, IsolateSlot};
use crate::pending::PendingResources;
use crate::resolver::ModuleResolver;
use crate::response::{CompletionCallback, ResponseSink};
use crate::timer::CompletionTimer;
use backstage_core::log::{LogSink, PrefixLog, TracingLogSink};
use backstage_core::stats::RuntimeStats;
use backstage_core::{Error, RequestEnvelope, ResponseOutcome, Result, RuntimeConfig, SyntaxReport};
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;

/// Per-execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Console prefix; the unit's file name when unset
    pub prefix: Option<String>,
    /// Environment merged over the engine's, winning on conflicts
    pub env: Option<Map<String, Value>>,
    /// Console sink; [`TracingLogSink`] when unset
    pub log_sink: Option<Arc<dyn LogSink>>,
    /// Extra fields for the `Backstage` namespace, such as `span`
    pub extra: Map<String, Value>,
}

impl ExecuteOptions {
    /// Sets the console prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Sets the extra environment.
    #[must_use]
    pub fn with_env(mut self, env: Map<String, Value>) -> Self {
        self.env = Some(env);
        self
    }

    /// Sets the console sink.
    #[must_use]
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Adds an extra `Backstage` field.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Compiles and runs sandboxed functions.
///
/// The engine holds only read-only inputs (configuration, module table,
/// allow-list) plus counters and the compiled-unit cache. Every execution
/// builds its own [`ExecutionContext`], so concurrent executions never share
/// bindings or pending timers.
///
/// # Thread Safety
///
/// `SandboxEngine` is `Send + Sync`; share it behind an `Arc`. At most
/// `max_concurrent` isolates run at once.
pub struct SandboxEngine {
    config: RuntimeConfig,
    resolver: Arc<ModuleResolver>,
    cache: UnitCache,
    semaphore: Arc<Semaphore>,

    // Statistics tracking (thread-safe atomics)
    total_executions: AtomicU32,
    successes: AtomicU32,
    failures: AtomicU32,
    timeouts: AtomicU32,
    compilation_failures: AtomicU32,
    cache_hits: AtomicU32,
    cache_misses: AtomicU32,
    total_execution_time_us: AtomicU64,
    // Updated after the outcome is delivered, from the isolate's reaper task
    released_timers: Arc<AtomicU32>,
}

impl std::fmt::Debug for SandboxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEngine")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("cache", &self.cache)
            .field(
                "total_executions",
                &self.total_executions.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl SandboxEngine {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the allow-list names a host module
    /// the engine cannot provide.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let resolver = ModuleResolver::new(
            config.virtual_modules().clone(),
            config.global_modules().iter().cloned(),
        )?;
        let cache = UnitCache::new(config.unit_cache_capacity());
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent()));

        tracing::debug!(
            sync_timeout_ms = config.sync_timeout().as_millis(),
            async_timeout_ms = config.async_timeout().as_millis(),
            modules = config.virtual_modules().len(),
            "sandbox engine created"
        );

        Ok(Self {
            config,
            resolver: Arc::new(resolver),
            cache,
            semaphore,
            total_executions: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            timeouts: AtomicU32::new(0),
            compilation_failures: AtomicU32::new(0),
            cache_hits: AtomicU32::new(0),
            cache_misses: AtomicU32::new(0),
            total_execution_time_us: AtomicU64::new(0),
            released_timers: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Module resolver shared by every execution.
    #[must_use]
    pub fn resolver(&self) -> &ModuleResolver {
        &self.resolver
    }

    /// Compiled-unit cache.
    #[must_use]
    pub const fn unit_cache(&self) -> &UnitCache {
        &self.cache
    }

    /// Clears the compiled-unit cache.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Compiles `source` into a unit that calls `main(request, response)`.
    ///
    /// Identical `(filename, source)` pairs are served from the cache.
    /// Parsing never runs the source; it happens on an isolate thread under
    /// the synchronous budget.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compile`] if the source does not parse as the body of
    /// the wrapper function.
    pub async fn compile(&self, filename: &str, source: &str) -> Result<CompiledUnit> {
        let key = UnitCache::cache_key_for_source(filename, source);
        if let Some(unit) = self.cache.get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(filename, "using cached compiled unit");
            return Ok(unit);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let unit = CompiledUnit::new(filename, source, true, self.config.sync_timeout());
        let max_heap_bytes = self.config.max_heap_bytes();

        let parsed = {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| Error::internal("engine is shutting down"))?;
            let candidate = unit.clone();
            spawn_isolate(move |_| isolate::parse_check(&candidate, max_heap_bytes))?
                .await
                .unwrap_or_else(|_| Err(Error::internal("parser thread exited without a result")))?
        };

        if let Err(message) = parsed {
            self.compilation_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(filename, %message, "compilation failed");
            return Err(Error::Compile {
                filename: filename.to_string(),
                message,
            });
        }

        tracing::debug!(filename, elapsed = ?started.elapsed(), "unit compiled");
        self.cache.insert(key, unit.clone());
        Ok(unit)
    }

    /// Runs the top level of `source` once, without calling `main`.
    ///
    /// Returns `None` if it ran cleanly. Otherwise returns the error's string
    /// form and its stack, keeping only frames in `filename`.
    ///
    /// # Errors
    ///
    /// Returns an error only for host-side failures.
    pub async fn check_syntax(&self, filename: &str, source: &str) -> Result<Option<SyntaxReport>> {
        let unit = CompiledUnit::new(filename, source, false, self.config.sync_timeout());
        let context = self.build_context(
            BackstageOptions::default(),
            Some(filename),
            None,
            None,
            PendingResources::new(),
        );
        let max_heap_bytes = self.config.max_heap_bytes();

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::internal("engine is shutting down"))?;
        let report = spawn_isolate(move |runtime| {
            let _guard = runtime.enter();
            isolate::run_check(&unit, context, max_heap_bytes)
        })?
        .await
        .unwrap_or_else(|_| Err(Error::internal("isolate thread exited without a result")))??;

        if let Some(report) = &report {
            tracing::debug!(filename, error = %report.error, "syntax check failed");
        }
        Ok(report)
    }

    /// Assembles the bindings for one execution.
    ///
    /// `extra_env` is merged over the engine's environment. The console
    /// writes to `log_sink` (or [`TracingLogSink`]), prefixed with `prefix`
    /// when one is given. Timers created by the code are registered in
    /// `pending`.
    #[must_use]
    pub fn build_context(
        &self,
        options: BackstageOptions,
        prefix: Option<&str>,
        extra_env: Option<&Map<String, Value>>,
        log_sink: Option<Arc<dyn LogSink>>,
        pending: PendingResources,
    ) -> ExecutionContext {
        let mut env = self.config.env().clone();
        if let Some(extra) = extra_env {
            env.extend(extra.iter().map(|(key, value)| (key.clone(), value.clone())));
        }

        let mut namespace = options.extra;
        namespace.insert("env".to_string(), Value::Object(env));
        namespace.insert("config".to_string(), self.config.config().clone());
        namespace.insert(
            "request".to_string(),
            options
                .request
                .and_then(|request| serde_json::to_value(request).ok())
                .unwrap_or(Value::Null),
        );

        let sink = log_sink.unwrap_or_else(|| Arc::new(TracingLogSink));
        let console: Arc<dyn LogSink> = match prefix {
            Some(prefix) => Arc::new(PrefixLog::new(prefix, sink)),
            None => sink,
        };

        ExecutionContext {
            namespace,
            response: options.response,
            console,
            pending,
            resolver: Arc::clone(&self.resolver),
        }
    }

    /// Runs `unit` against `request` and resolves its single outcome.
    ///
    /// # Errors
    ///
    /// - [`Error::UserCode`] if the code throws or rejects
    /// - [`Error::ScriptTimeout`] if the synchronous budget runs out
    /// - [`Error::Timeout`] if nothing settles the invocation in time
    /// - [`Error::Internal`] for host-side failures
    pub async fn execute(
        &self,
        unit: &CompiledUnit,
        request: impl Into<RequestEnvelope>,
        options: ExecuteOptions,
    ) -> Result<ResponseOutcome> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::internal("engine is shutting down"))?;

        let started = Instant::now();
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(filename = unit.filename(), "invocation started");

        let async_timeout = self.config.async_timeout();
        let (sender, receiver) = oneshot::channel();
        let finished = CancellationToken::new();
        let timer = Arc::new(Mutex::new(CompletionTimer::new(async_timeout)));
        let isolate_slot: IsolateSlot = Arc::default();

        let callback = {
            let timer = Arc::clone(&timer);
            let finished = finished.clone();
            Arc::new(CompletionCallback::new(move |result| {
                timer.lock().unwrap_or_else(PoisonError::into_inner).clear();
                finished.cancel();
                let _ = sender.send(result);
            }))
        };

        {
            let callback = Arc::clone(&callback);
            let isolate_slot = Arc::clone(&isolate_slot);
            let timeout_ms = millis(async_timeout);
            timer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .add(move || {
                    if callback.complete(Err(Error::Timeout { timeout_ms })) {
                        tracing::debug!(timeout_ms, "completion deadline reached");
                        isolate::terminate(&isolate_slot);
                    }
                });
        }

        let prefix = options
            .prefix
            .unwrap_or_else(|| unit.filename().to_string());
        let context = self.build_context(
            BackstageOptions {
                request: Some(request.into()),
                response: Some(ResponseSink::new(Arc::clone(&callback))),
                extra: options.extra,
            },
            Some(&prefix),
            options.env.as_ref(),
            options.log_sink,
            PendingResources::new(),
        );

        let task = InvocationTask {
            unit: unit.clone(),
            context,
            max_heap_bytes: self.config.max_heap_bytes(),
            isolate: isolate_slot,
            finished,
            callback: Arc::clone(&callback),
        };
        match spawn_isolate(move |runtime| runtime.block_on(isolate::run_invocation(task))) {
            Ok(thread) => {
                let callback = Arc::clone(&callback);
                let released_timers = Arc::clone(&self.released_timers);
                tokio::spawn(async move {
                    let _permit = permit;
                    match thread.await {
                        Ok(Ok(released)) if released > 0 => {
                            tracing::debug!(released, "released pending timers");
                            released_timers.fetch_add(
                                u32::try_from(released).unwrap_or(u32::MAX),
                                Ordering::Relaxed,
                            );
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => {
                            callback.complete(Err(err));
                        }
                        Err(_) => {
                            callback.complete(Err(Error::internal(
                                "isolate thread exited without a result",
                            )));
                        }
                    }
                });
            }
            Err(err) => {
                callback.complete(Err(err));
            }
        }

        let result = receiver.await.unwrap_or_else(|_| {
            Err(Error::internal("invocation ended without an outcome"))
        });

        let elapsed = started.elapsed();
        self.total_execution_time_us.fetch_add(
            u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        match &result {
            Ok(outcome) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    filename = unit.filename(),
                    status = outcome.status,
                    ?elapsed,
                    "invocation succeeded"
                );
            }
            Err(err) if err.is_timeout() => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(filename = unit.filename(), ?elapsed, "invocation timed out");
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::info!(filename = unit.filename(), error = %err, ?elapsed, "invocation failed");
            }
        }
        result
    }

    /// Reads a function from disk, checks it, compiles it and runs it.
    ///
    /// The path as given is the file name used in stack traces.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Syntax`] without compiling if the syntax check fails,
    /// [`Error::Io`] if the file cannot be read, and otherwise whatever
    /// [`SandboxEngine::compile`] or [`SandboxEngine::execute`] return.
    pub async fn run_from_source(
        &self,
        path: impl AsRef<Path>,
        request: impl Into<RequestEnvelope>,
        options: ExecuteOptions,
    ) -> Result<ResponseOutcome> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path).await?;
        let filename = path.to_string_lossy();

        if let Some(report) = self.check_syntax(&filename, &source).await? {
            return Err(Error::Syntax(report));
        }
        let unit = self.compile(&filename, &source).await?;
        self.execute(&unit, request, options).await
    }

    /// Collects current statistics.
    ///
    /// Reads atomic counters only; safe to call at any time.
    #[must_use]
    pub fn collect_stats(&self) -> RuntimeStats {
        RuntimeStats::new(
            self.total_executions.load(Ordering::Relaxed),
            self.successes.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
            self.total_execution_time_us.load(Ordering::Relaxed),
        )
        .with_compilation(
            self.compilation_failures.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
        .with_released_timers(self.released_timers.load(Ordering::Relaxed))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Runs `work` on a fresh OS thread that owns a current-thread tokio runtime.
///
/// V8 isolates are `!Send`, so each one lives and dies on its own thread.
fn spawn_isolate<T, F>(work: F) -> Result<oneshot::Receiver<Result<T>>>
where
    F: FnOnce(&tokio::runtime::Runtime) -> T + Send + 'static,
    T: Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    std::thread::Builder::new()
        .name("backstage-isolate".to_string())
        .spawn(move || {
            let result = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(Error::from)
                .and_then(|runtime| {
                    std::panic::catch_unwind(AssertUnwindSafe(|| work(&runtime)))
                        .map_err(|_| Error::internal("isolate thread panicked"))
                });
            if sender.send(result).is_err() {
                tracing::warn!("isolate result receiver dropped");
            }
        })?;
    Ok(receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backstage_core::log::MemoryLog;
    use serde_json::json;

    fn engine() -> SandboxEngine {
        let config = RuntimeConfig::builder()
            .env_var("A", 1)
            .env_var("B", "base")
            .config(json!({"region": "eu"}))
            .build();
        SandboxEngine::new(config).unwrap()
    }

    #[test]
    fn test_new_rejects_unknown_host_module() {
        let config = RuntimeConfig::builder().allow_module("crypto").build();
        let err = SandboxEngine::new(config).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_build_context_merges_extra_env() {
        let engine = engine();
        let mut extra = Map::new();
        extra.insert("B".to_string(), json!("override"));
        extra.insert("C".to_string(), json!(true));

        let context = engine.build_context(
            BackstageOptions::default(),
            None,
            Some(&extra),
            None,
            PendingResources::new(),
        );
        let env = context.env().unwrap();
        assert_eq!(env["A"], json!(1));
        assert_eq!(env["B"], json!("override"));
        assert_eq!(env["C"], json!(true));
        assert_eq!(context.namespace()["config"], json!({"region": "eu"}));
    }

    #[test]
    fn test_build_context_keeps_engine_env_untouched() {
        let engine = engine();
        let mut extra = Map::new();
        extra.insert("A".to_string(), json!(99));
        let _ = engine.build_context(
            BackstageOptions::default(),
            None,
            Some(&extra),
            None,
            PendingResources::new(),
        );
        assert_eq!(engine.config().env()["A"], json!(1));
    }

    #[test]
    fn test_build_context_extra_fields_cannot_shadow_core_fields() {
        let engine = engine();
        let mut extra = Map::new();
        extra.insert("span".to_string(), json!({"traceId": "t-1"}));
        extra.insert("env".to_string(), json!("spoofed"));
        let options = BackstageOptions::default().with_extra(extra);

        let context = engine.build_context(options, None, None, None, PendingResources::new());
        assert_eq!(context.namespace()["span"]["traceId"], json!("t-1"));
        assert!(context.env().is_some());
        assert!(!context.has_response());
    }

    #[test]
    fn test_build_context_prefixes_console() {
        let engine = engine();
        let log = Arc::new(MemoryLog::new(1024));
        let context = engine.build_context(
            BackstageOptions::default(),
            Some("fn.js"),
            None,
            Some(Arc::clone(&log) as Arc<dyn LogSink>),
            PendingResources::new(),
        );
        context.console().log("hello");
        assert_eq!(log.contents(), "info: [fn.js] hello\n");
    }

    #[test]
    fn test_descriptor_lists_bindings_and_errors() {
        let engine = engine();
        let context = engine.build_context(
            BackstageOptions::default(),
            None,
            None,
            None,
            PendingResources::new(),
        );
        let descriptor = context.descriptor();
        assert_eq!(descriptor["bindings"][0], json!("Backstage"));
        assert_eq!(descriptor["errors"].as_array().unwrap().len(), 5);
        assert_eq!(descriptor["hasResponse"], json!(false));
    }

    #[tokio::test]
    async fn test_compile_failure_is_internal_and_counted() {
        let engine = engine();
        let err = engine.compile("bad.js", "var a = [};").await.unwrap_err();
        assert!(err.is_internal());
        assert_eq!(engine.collect_stats().compilation_failures, 1);
    }

    #[tokio::test]
    async fn test_compile_rejects_wrapper_breakout_without_running_it() {
        let config = RuntimeConfig::builder()
            .sync_timeout(Duration::from_millis(50))
            .build();
        let engine = SandboxEngine::new(config).unwrap();

        let started = Instant::now();
        let err = engine
            .compile("escape.js", "}); while (true) {} (function () {")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Compile { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(engine.unit_cache().is_empty());
    }

    #[tokio::test]
    async fn test_compile_does_not_run_top_level_code() {
        let config = RuntimeConfig::builder()
            .sync_timeout(Duration::from_millis(50))
            .build();
        let engine = SandboxEngine::new(config).unwrap();

        let started = Instant::now();
        engine
            .compile("loop.js", "while (true) {}\nfunction main() {}")
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_compile_uses_cache() {
        let engine = engine();
        let first = engine
            .compile("ok.js", "function main() { return 1; }")
            .await
            .unwrap();
        let second = engine
            .compile("ok.js", "function main() { return 1; }")
            .await
            .unwrap();
        assert!(std::ptr::eq(first.text(), second.text()));

        let stats = engine.collect_stats();
        assert_eq!((stats.cache_hits, stats.cache_misses), (1, 1));
    }
}
