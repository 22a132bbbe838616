//! V8 isolate host: ops, bootstrap and the per-isolate run loops.
//!
//! Every execution gets a brand new `JsRuntime`. The bootstrap script
//! (`js/harness.js`) captures the ops it needs, removes `Deno`, the engine's
//! bootstrap objects and the code generation entry points from the global
//! object, builds the context bindings from a JSON descriptor and then
//! evaluates the compiled unit.
//!
//! `JsRuntime` is `!Send`; everything here runs on the dedicated thread the
//! engine spawns per execution.

// op2 expansions and the heap-limit callback need unsafe.
#![allow(unsafe_code)]

use crate::compiler::{CONTEXT_BINDINGS, CompiledUnit, filter_stack_trace, syntax_report};
use crate::context::{ContextParts, ExecutionContext};
use crate::pending::PendingResources;
use crate::resolver::{ModuleResolver, ResolvedModule};
use crate::response::{CompletionCallback, ResponseCall, ResponseSink};
use backstage_core::log::{LogLevel, LogSink};
use backstage_core::{Error, ErrorKind, Result, SyntaxReport, TaggedError};
use deno_core::{JsRuntime, OpState, PollEventLoopOptions, RuntimeOptions, op2, v8};
use serde::Deserialize;
use serde_json::{Value, json};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const HARNESS: &str = include_str!("js/harness.js");

/// Slot through which the completion deadline reaches the running isolate.
pub(crate) type IsolateSlot = Arc<Mutex<Option<v8::IsolateHandle>>>;

/// Terminates the isolate in `slot`, if one is running.
pub(crate) fn terminate(slot: &IsolateSlot) {
    if let Some(handle) = slot.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
        handle.terminate_execution();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Invoke,
    Check,
}

impl Mode {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Invoke => "invoke",
            Self::Check => "check",
        }
    }
}

// ---------------------------------------------------------------------------
// Op state

struct Console(Arc<dyn LogSink>);

struct UnitName(String);

/// First failure seen during a syntax check.
#[derive(Default)]
struct CheckSlot(Option<FailureReport>);

/// An error thrown or rejected inside the sandbox, as reported by the
/// harness.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FailureReport {
    name: String,
    message: String,
    display: String,
    stack: String,
    status_code: Option<u16>,
}

impl FailureReport {
    fn unreadable(err: &serde_json::Error) -> Self {
        let message = format!("unreadable error report: {err}");
        Self {
            name: "Error".to_string(),
            display: format!("Error: {message}"),
            message,
            ..Self::default()
        }
    }

    fn into_user_error(self, stack: Option<String>) -> Error {
        Error::UserCode {
            name: Some(self.name),
            message: self.message,
            status_code: self.status_code,
            stack: stack.filter(|stack| !stack.is_empty()),
        }
    }
}

// ---------------------------------------------------------------------------
// Ops

#[op2(fast)]
fn op_backstage_log(state: &mut OpState, #[string] level: &str, #[string] message: &str) {
    let level = level.parse().unwrap_or(LogLevel::Log);
    if let Some(console) = state.try_borrow::<Console>() {
        console.0.write(level, message);
    }
}

#[op2(fast)]
fn op_backstage_respond(state: &mut OpState, #[string] call: &str) {
    let call = match serde_json::from_str::<ResponseCall>(call) {
        Ok(call) => call,
        Err(err) => {
            tracing::warn!(error = %err, "ignoring malformed response call");
            return;
        }
    };
    match state.try_borrow_mut::<ResponseSink>() {
        Some(sink) => sink.apply(call),
        None => tracing::debug!("response call without a bound response"),
    }
}

#[op2(fast)]
fn op_backstage_fail(state: &mut OpState, #[string] report: &str) {
    let report = serde_json::from_str::<FailureReport>(report)
        .unwrap_or_else(|err| FailureReport::unreadable(&err));

    if let Some(slot) = state.try_borrow_mut::<CheckSlot>() {
        slot.0.get_or_insert(report);
        return;
    }

    let stack = state
        .try_borrow::<UnitName>()
        .map(|unit| filter_stack_trace(&report.stack, &unit.0));
    let Some(sink) = state.try_borrow_mut::<ResponseSink>() else {
        tracing::debug!(message = %report.message, "failure without a bound response");
        return;
    };

    match report.status_code.and_then(ErrorKind::from_status_code) {
        Some(kind) => {
            sink.respond_tagged(TaggedError::new(kind, report.message));
        }
        None => {
            sink.fail(report.into_user_error(stack));
        }
    }
}

#[op2]
#[string]
fn op_backstage_resolve(
    state: &mut OpState,
    #[string] name: &str,
    #[string] base: &str,
    relative: bool,
) -> String {
    let Some(resolver) = state.try_borrow::<Arc<ModuleResolver>>() else {
        return json!({ "error": format!("Cannot find module '{name}'") }).to_string();
    };
    let resolved = if relative {
        resolver.resolve_relative(base).resolve(name)
    } else {
        resolver.resolve(name)
    };
    let reply: Value = match resolved {
        Ok(ResolvedModule::Virtual { key, source }) => {
            json!({ "kind": "virtual", "key": key, "source": source })
        }
        Ok(ResolvedModule::Host { name }) => json!({ "kind": "host", "name": name }),
        Err(err) => json!({ "error": err.to_string() }),
    };
    reply.to_string()
}

#[op2(fast)]
fn op_backstage_timer_create(state: &mut OpState, delay: u32, repeat: bool) -> u32 {
    state
        .try_borrow_mut::<PendingResources>()
        .map_or(0, |pending| {
            pending.register(Duration::from_millis(u64::from(delay)), repeat)
        })
}

#[op2]
async fn op_backstage_timer_wait(state: Rc<RefCell<OpState>>, id: u32) -> bool {
    let wait = {
        let state = state.borrow();
        state
            .try_borrow::<PendingResources>()
            .and_then(|pending| pending.wait_handle(id))
    };
    let Some(wait) = wait else {
        return false;
    };
    if !wait.wait().await {
        return false;
    }
    if let Some(pending) = state.borrow_mut().try_borrow_mut::<PendingResources>() {
        pending.fired(id);
    }
    true
}

#[op2(fast)]
fn op_backstage_timer_clear(state: &mut OpState, id: u32) {
    if let Some(pending) = state.try_borrow_mut::<PendingResources>() {
        pending.clear(id);
    }
}

deno_core::extension!(
    backstage_ext,
    ops = [
        op_backstage_log,
        op_backstage_respond,
        op_backstage_fail,
        op_backstage_resolve,
        op_backstage_timer_create,
        op_backstage_timer_wait,
        op_backstage_timer_clear,
    ],
);

// ---------------------------------------------------------------------------
// Isolate lifecycle

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates execution near the heap ceiling and grants 1 MiB of headroom so
/// the termination can unwind instead of aborting the process.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points into the `Box<HeapLimitState>` owned by the
    // `Sandbox` that registered this callback. The box is declared after the
    // runtime, so it is dropped only once the isolate is gone.
    let state = unsafe { &*data.cast::<HeapLimitState>() };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// One fresh runtime plus the heap guard bound to it.
struct Sandbox {
    runtime: JsRuntime,
    heap: Box<HeapLimitState>,
}

impl Sandbox {
    fn new(max_heap_bytes: usize) -> Self {
        let create_params = v8::CreateParams::default().heap_limits(0, max_heap_bytes);
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![backstage_ext::init()],
            create_params: Some(create_params),
            ..Default::default()
        });

        let heap = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            std::ptr::from_ref(heap.as_ref())
                .cast_mut()
                .cast::<std::ffi::c_void>(),
        );

        Self { runtime, heap }
    }

    fn handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    /// Runs `script` to completion under the synchronous budget.
    fn run_sync(&mut self, name: &'static str, script: String, budget: Duration) -> SyncRun {
        let watchdog = Watchdog::arm(self.handle(), budget);
        let executed = self
            .runtime
            .execute_script(name, script)
            .map(drop)
            .map_err(|err| err.to_string());
        let fired = watchdog.disarm();

        match executed {
            Err(_) if fired => SyncRun::TimedOut,
            executed => {
                if fired {
                    // The script returned before the termination landed.
                    self.runtime.v8_isolate().cancel_terminate_execution();
                }
                SyncRun::Finished(executed)
            }
        }
    }

    fn heap_exceeded(&self) -> bool {
        self.heap.triggered.load(Ordering::SeqCst)
    }

    fn install(&mut self, parts: ContextParts, filename: &str, mode: Mode) {
        let state = self.runtime.op_state();
        let mut state = state.borrow_mut();
        state.put(Console(parts.console));
        state.put(parts.resolver);
        state.put(parts.pending);
        state.put(UnitName(filename.to_string()));
        if let Some(response) = parts.response {
            state.put(response);
        }
        if mode == Mode::Check {
            state.put(CheckSlot::default());
        }
    }

    fn take_check_report(&mut self) -> Option<FailureReport> {
        let state = self.runtime.op_state();
        let mut state = state.borrow_mut();
        state.try_borrow_mut::<CheckSlot>().and_then(|slot| slot.0.take())
    }

    fn release_pending(&mut self) -> usize {
        let state = self.runtime.op_state();
        let mut state = state.borrow_mut();
        state
            .try_borrow_mut::<PendingResources>()
            .map_or(0, PendingResources::release_all)
    }
}

/// How a synchronous run ended.
enum SyncRun {
    Finished(std::result::Result<(), String>),
    TimedOut,
}

/// Terminates the isolate if the synchronous budget runs out.
struct Watchdog {
    cancel: mpsc::Sender<()>,
    thread: JoinHandle<()>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    fn arm(handle: v8::IsolateHandle, budget: Duration) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let (cancel, cancelled) = mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            if let Err(mpsc::RecvTimeoutError::Timeout) = cancelled.recv_timeout(budget) {
                flag.store(true, Ordering::SeqCst);
                handle.terminate_execution();
            }
        });
        Self {
            cancel,
            thread,
            fired,
        }
    }

    /// Stops the watchdog and reports whether it fired.
    fn disarm(self) -> bool {
        let _ = self.cancel.send(());
        if self.thread.join().is_err() {
            tracing::warn!("watchdog thread panicked");
        }
        self.fired.load(Ordering::SeqCst)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn heap_error() -> Error {
    Error::UserCode {
        name: Some("RangeError".to_string()),
        message: "JavaScript heap out of memory".to_string(),
        status_code: None,
        stack: None,
    }
}

/// Turns an error that escaped to the event loop into a user error.
///
/// The engine reports these as `Uncaught (in promise) Name: message`
/// followed by the raw stack.
fn uncaught_error(text: &str, filename: &str) -> Error {
    let first = text.lines().next().unwrap_or_default();
    let first = first
        .strip_prefix("Uncaught (in promise) ")
        .or_else(|| first.strip_prefix("Uncaught "))
        .unwrap_or(first);
    let (name, message) = match first.split_once(": ") {
        Some((name, message))
            if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
        {
            (Some(name.to_string()), message.to_string())
        }
        _ => (None, first.to_string()),
    };
    let stack = filter_stack_trace(text, filename);
    Error::UserCode {
        name,
        message,
        status_code: None,
        stack: (!stack.is_empty()).then_some(stack),
    }
}

fn bootstrap_script(descriptor: &Value, unit: &CompiledUnit, mode: Mode) -> Result<String> {
    let descriptor = serde_json::to_string(descriptor)?;
    let text = serde_json::to_string(unit.text())?;
    let body = serde_json::to_string(unit.body())?;
    Ok(format!(
        "({HARNESS})(Deno.core, globalThis.eval, {descriptor}, {text}, {body}, \"{}\");",
        mode.as_str()
    ))
}

/// Everything one invocation's isolate thread needs.
pub(crate) struct InvocationTask {
    pub unit: CompiledUnit,
    pub context: ExecutionContext,
    pub max_heap_bytes: usize,
    pub isolate: IsolateSlot,
    pub finished: CancellationToken,
    pub callback: Arc<CompletionCallback>,
}

/// Runs one invocation to its end and returns how many pending timers had
/// to be released.
///
/// The outcome itself is delivered through the task's completion callback.
/// If the code settles nothing, the isolate is torn down and the caller's
/// completion deadline decides the outcome.
pub(crate) async fn run_invocation(task: InvocationTask) -> usize {
    let InvocationTask {
        unit,
        context,
        max_heap_bytes,
        isolate,
        finished,
        callback,
    } = task;

    let parts = context.into_parts();
    let script = match bootstrap_script(&parts.descriptor, &unit, Mode::Invoke) {
        Ok(script) => script,
        Err(err) => {
            callback.complete(Err(err));
            return 0;
        }
    };

    let mut sandbox = Sandbox::new(max_heap_bytes);
    sandbox.install(parts, unit.filename(), Mode::Invoke);
    *isolate.lock().unwrap_or_else(PoisonError::into_inner) = Some(sandbox.handle());

    if !finished.is_cancelled() {
        let executed = sandbox.run_sync("[backstage:invoke]", script, unit.sync_timeout());

        match executed {
            SyncRun::TimedOut => {
                tracing::debug!(filename = unit.filename(), "synchronous budget exceeded");
                callback.complete(Err(Error::ScriptTimeout {
                    timeout_ms: millis(unit.sync_timeout()),
                }));
            }
            SyncRun::Finished(_) if sandbox.heap_exceeded() => {
                callback.complete(Err(heap_error()));
            }
            SyncRun::Finished(Err(message)) => {
                callback.complete(Err(uncaught_error(&message, unit.filename())));
            }
            SyncRun::Finished(Ok(())) if callback.is_completed() => {}
            SyncRun::Finished(Ok(())) => {
                tokio::select! {
                    result = sandbox.runtime.run_event_loop(PollEventLoopOptions::default()) => {
                        if let Err(err) = result {
                            let error = if sandbox.heap_exceeded() {
                                heap_error()
                            } else {
                                uncaught_error(&err.to_string(), unit.filename())
                            };
                            callback.complete(Err(error));
                        }
                    }
                    () = finished.cancelled() => {}
                }
            }
        }
    }

    *isolate.lock().unwrap_or_else(PoisonError::into_inner) = None;
    sandbox.release_pending()
}

/// Evaluates `unit` once without calling `main` and reports the first error.
///
/// # Errors
///
/// Returns an error if the bootstrap script cannot be assembled.
pub(crate) fn run_check(
    unit: &CompiledUnit,
    context: ExecutionContext,
    max_heap_bytes: usize,
) -> Result<Option<SyntaxReport>> {
    let parts = context.into_parts();
    let script = bootstrap_script(&parts.descriptor, unit, Mode::Check)?;

    let mut sandbox = Sandbox::new(max_heap_bytes);
    sandbox.install(parts, unit.filename(), Mode::Check);

    let executed = sandbox.run_sync("[backstage:check]", script, unit.sync_timeout());
    let released = sandbox.release_pending();
    if released > 0 {
        tracing::debug!(released, "released timers created during syntax check");
    }

    let SyncRun::Finished(executed) = executed else {
        let timeout = Error::ScriptTimeout {
            timeout_ms: millis(unit.sync_timeout()),
        };
        return Ok(Some(SyntaxReport {
            error: format!("Error: {timeout}"),
            stack: String::new(),
        }));
    };
    if sandbox.heap_exceeded() {
        return Ok(Some(SyntaxReport {
            error: format!("RangeError: {}", heap_error()),
            stack: String::new(),
        }));
    }
    if let Some(report) = sandbox.take_check_report() {
        return Ok(Some(syntax_report(
            report.display,
            Some(&report.stack),
            unit.filename(),
        )));
    }
    Ok(executed.err().map(|error| syntax_report(error, None, unit.filename())))
}

/// Parses the unit's body with the `Function` constructor, which compiles
/// without running anything.
///
/// The body is parsed alone, so source that tries to close the wrapper
/// fails to parse. Parsing still runs under the synchronous budget.
///
/// # Errors
///
/// Returns the engine's message when the body does not parse.
pub(crate) fn parse_check(
    unit: &CompiledUnit,
    max_heap_bytes: usize,
) -> std::result::Result<(), String> {
    let params = serde_json::to_string(CONTEXT_BINDINGS).map_err(|err| err.to_string())?;
    let body = serde_json::to_string(unit.body()).map_err(|err| err.to_string())?;
    let script = format!("new Function(...{params}, {body});");

    let mut sandbox = Sandbox::new(max_heap_bytes);
    match sandbox.run_sync("[backstage:parse]", script, unit.sync_timeout()) {
        SyncRun::Finished(result) => result,
        SyncRun::TimedOut => Err(format!(
            "parsing exceeded the {} ms synchronous budget",
            millis(unit.sync_timeout())
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_report_defaults() {
        let report: FailureReport = serde_json::from_str(r#"{"message":"boom"}"#).unwrap();
        assert_eq!(report.message, "boom");
        assert_eq!(report.status_code, None);
        assert!(report.stack.is_empty());
    }

    #[test]
    fn test_failure_report_into_user_error_drops_empty_stack() {
        let report: FailureReport =
            serde_json::from_str(r#"{"name":"TypeError","message":"x","statusCode":418}"#)
                .unwrap();
        match report.into_user_error(Some(String::new())) {
            Error::UserCode {
                name,
                status_code,
                stack,
                ..
            } => {
                assert_eq!(name.as_deref(), Some("TypeError"));
                assert_eq!(status_code, Some(418));
                assert!(stack.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    const HEAP: usize = 16 * 1024 * 1024;

    fn unit(source: &str) -> CompiledUnit {
        CompiledUnit::new("a.js", source, true, Duration::from_millis(100))
    }

    #[test]
    fn test_bootstrap_script_embeds_unit_as_string_literals() {
        let unit = unit("x");
        let script = bootstrap_script(&json!({"bindings": []}), &unit, Mode::Check).unwrap();
        assert!(script.starts_with("((function backstageHarness"));
        assert!(script.contains(&serde_json::to_string(unit.text()).unwrap()));
        assert!(script.contains(&serde_json::to_string(unit.body()).unwrap()));
        assert!(script.ends_with(", \"check\");"));
    }

    #[test]
    fn test_parse_check_reports_syntax_error() {
        let err = parse_check(&unit("var a = [};"), HEAP).unwrap_err();
        assert!(err.contains("SyntaxError"), "{err}");
        assert!(parse_check(&unit("function main() { return 1; }"), HEAP).is_ok());
    }

    #[test]
    fn test_parse_check_never_runs_top_level_code() {
        let started = std::time::Instant::now();
        let err = parse_check(&unit("}); while (true) {} (function () {"), HEAP).unwrap_err();
        assert!(err.contains("SyntaxError"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));

        // Valid source with an endless top-level loop parses without running.
        assert!(parse_check(&unit("while (true) {}\nfunction main() {}"), HEAP).is_ok());
    }

    #[test]
    fn test_expired_budget_does_not_leak_into_next_script() {
        for _ in 0..50 {
            let mut sandbox = Sandbox::new(HEAP);
            // A zero budget fires around the time the trivial script returns.
            if let SyncRun::TimedOut = sandbox.run_sync("[first]", "1".to_string(), Duration::ZERO) {
                continue;
            }
            let next = sandbox.run_sync(
                "[next]",
                "let n = 0; for (let i = 0; i < 100000; i++) n += i;".to_string(),
                Duration::from_secs(5),
            );
            assert!(matches!(next, SyncRun::Finished(Ok(()))));
        }
    }

    #[test]
    fn test_uncaught_error_strips_engine_prefix() {
        let err = uncaught_error(
            "Uncaught (in promise) TypeError: nope\n    at fn.js:3:9\n    at ext:core/01_core.js:1:1",
            "fn.js",
        );
        match err {
            Error::UserCode {
                name,
                message,
                stack,
                ..
            } => {
                assert_eq!(name.as_deref(), Some("TypeError"));
                assert_eq!(message, "nope");
                assert_eq!(stack.as_deref(), Some("at fn.js:2"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_uncaught_error_without_name() {
        let err = uncaught_error("Uncaught 42", "fn.js");
        assert_eq!(err.to_string(), "42");
    }
}
