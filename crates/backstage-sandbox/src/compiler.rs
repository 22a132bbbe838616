//! Source wrapping and stack-trace filtering.
//!
//! User source is wrapped in a strict-mode function expression whose
//! parameters are every context binding name, so the bindings shadow any
//! host global of the same name. The invoking form appends a footer that
//! calls `main(request, response)` and reports the entry point's arity, which
//! is how the harness tells the callback style from the return-value style.
//!
//! The wrapper header occupies exactly one line; stack frames are shifted
//! back by [`WRAPPER_HEADER_LINES`] so reported lines match the user's file.

use backstage_core::SyntaxReport;
use regex::Regex;
use std::fmt::Write as _;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

/// Names bound in every execution context, in parameter order.
pub const CONTEXT_BINDINGS: &[&str] = &[
    "Backstage",
    "Buffer",
    "console",
    "exports",
    "module",
    "setTimeout",
    "clearTimeout",
    "setInterval",
    "clearInterval",
    "require",
    "relativeRequire",
    "NotModified",
    "BadRequest",
    "NotFound",
    "UnprocessableEntity",
    "InternalServerError",
];

/// Lines the wrapper adds before the first line of user code.
pub const WRAPPER_HEADER_LINES: u32 = 1;

const INVOKE_FOOTER: &str =
    "return { arity: main.length, value: main.call(null, Backstage.request, Backstage.response) };";

/// Function body for `source`: the strict-mode directive, the source and,
/// with `invoke` set, the footer that calls `main`.
///
/// The body is parsed on its own before the wrapped text is evaluated, so
/// source that closes the wrapper early is a syntax error rather than code
/// running outside it.
#[must_use]
pub fn wrap_body(source: &str, invoke: bool) -> String {
    let mut body = String::with_capacity(source.len() + INVOKE_FOOTER.len() + 16);
    body.push_str("\"use strict\";\n");
    body.push_str(source);
    body.push('\n');
    if invoke {
        body.push_str(INVOKE_FOOTER);
        body.push('\n');
    }
    body
}

/// Wraps `source` for evaluation under `filename`.
///
/// With `invoke` set, the wrapped function ends by calling `main`; without
/// it, the wrapper only runs the top-level statements (used by the syntax
/// check).
///
/// # Examples
///
/// ```
/// use backstage_sandbox::compiler::wrap_source;
///
/// let wrapped = wrap_source("fn.js", "function main() {}", true);
/// assert!(wrapped.starts_with("(function (Backstage, Buffer, console"));
/// assert!(wrapped.contains("main.call(null, Backstage.request, Backstage.response)"));
/// assert!(wrapped.ends_with("//# sourceURL=fn.js"));
/// ```
#[must_use]
pub fn wrap_source(filename: &str, source: &str, invoke: bool) -> String {
    enclose(filename, &wrap_body(source, invoke))
}

fn enclose(filename: &str, body: &str) -> String {
    let mut wrapped = String::with_capacity(body.len() + 512);
    let _ = write!(wrapped, "(function ({}) {{", CONTEXT_BINDINGS.join(", "));
    wrapped.push_str(body);
    let _ = write!(wrapped, "}})\n//# sourceURL={}", sanitize_source_url(filename));
    wrapped
}

/// Source URLs end at the first line break.
fn sanitize_source_url(filename: &str) -> String {
    filename.replace(['\n', '\r'], " ")
}

/// Wrapped source bound to a file name and a synchronous budget.
///
/// Units are immutable and cheap to clone; one unit can back any number of
/// executions, each with its own context.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    filename: Arc<str>,
    body: Arc<str>,
    text: Arc<str>,
    sync_timeout: Duration,
}

impl CompiledUnit {
    /// Wraps `source` into a unit; see [`wrap_source`] for `invoke`.
    #[must_use]
    pub fn new(filename: &str, source: &str, invoke: bool, sync_timeout: Duration) -> Self {
        let body = wrap_body(source, invoke);
        let text = enclose(filename, &body);
        Self {
            filename: Arc::from(filename),
            body: Arc::from(body),
            text: Arc::from(text),
            sync_timeout,
        }
    }

    /// File name used in stack traces.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Body of the wrapper function.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Wrapped source text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Synchronous budget for running this unit.
    #[must_use]
    pub const fn sync_timeout(&self) -> Duration {
        self.sync_timeout
    }
}

static FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at (?:(?P<func>.+?) \()?(?P<file>[^()]+?):(?P<line>\d+)(?::\d+)?\)?\s*$")
        .unwrap_or_else(|err| unreachable!("frame pattern is valid: {err}"))
});

/// Keeps only the frames of `stack` that belong to `filename`.
///
/// Each kept frame is rendered as `at <function> (<file>:<line>)`, or
/// `at <file>:<line>` for anonymous frames, with the wrapper's header line
/// subtracted. Frames are joined with `\n`.
///
/// # Examples
///
/// ```
/// use backstage_sandbox::compiler::filter_stack_trace;
///
/// let stack = "Error: Runtime Error\n    at calculateBar (test.js:4:11)\n    at test.js:6:5\n    at run ([backstage:invoke]:1:1)";
/// assert_eq!(filter_stack_trace(stack, "test.js"), "at calculateBar (test.js:3)\nat test.js:5");
/// ```
#[must_use]
pub fn filter_stack_trace(stack: &str, filename: &str) -> String {
    stack
        .lines()
        .filter_map(|line| FRAME.captures(line))
        .filter(|caps| &caps["file"] == filename)
        .filter_map(|caps| {
            let line: u32 = caps["line"].parse().ok()?;
            let line = line.saturating_sub(WRAPPER_HEADER_LINES).max(1);
            Some(match caps.name("func") {
                Some(func) => format!("at {} ({filename}:{line})", func.as_str()),
                None => format!("at {filename}:{line}"),
            })
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Builds a syntax report from a raw error string and stack.
#[must_use]
pub fn syntax_report(error: String, stack: Option<&str>, filename: &str) -> SyntaxReport {
    SyntaxReport {
        error,
        stack: stack
            .map(|stack| filter_stack_trace(stack, filename))
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_single_line() {
        let wrapped = wrap_source("a.js", "line1", false);
        let mut lines = wrapped.lines();
        assert!(lines.next().unwrap().ends_with("\"use strict\";"));
        assert_eq!(lines.next(), Some("line1"));
    }

    #[test]
    fn test_check_wrapper_has_no_footer() {
        let wrapped = wrap_source("a.js", "function main() {}", false);
        assert!(!wrapped.contains("main.call"));
    }

    #[test]
    fn test_every_binding_is_a_parameter() {
        let wrapped = wrap_source("a.js", "", true);
        let header = wrapped.lines().next().unwrap();
        for name in CONTEXT_BINDINGS {
            assert!(header.contains(name), "missing {name}");
        }
    }

    #[test]
    fn test_source_url_cannot_break_out() {
        let wrapped = wrap_source("a.js\nalert(1)", "", false);
        assert!(wrapped.ends_with("//# sourceURL=a.js alert(1)"));
    }

    #[test]
    fn test_filter_drops_foreign_frames() {
        let stack = "SyntaxError: Unexpected token '}'\n    at backstageHarness ([backstage:check]:40:12)\n    at [backstage:check]:1:1";
        assert_eq!(filter_stack_trace(stack, "test.js"), "");
    }

    #[test]
    fn test_filter_formats_runtime_error_stack() {
        let stack = concat!(
            "Error: Runtime Error\n",
            "    at calculateBar (test.js:4:23)\n",
            "    at test.js:6:14\n",
            "    at runEntry ([backstage:invoke]:200:5)\n",
            "    at test.js:9:3",
        );
        assert_eq!(
            filter_stack_trace(stack, "test.js"),
            "at calculateBar (test.js:3)\nat test.js:5\nat test.js:8"
        );
    }

    #[test]
    fn test_syntax_report_without_stack() {
        let report = syntax_report("SyntaxError: x".into(), None, "a.js");
        assert_eq!(report.stack, "");
    }

    #[test]
    fn test_body_is_the_wrapper_contents() {
        let unit = CompiledUnit::new("a.js", "function main() {}", true, Duration::from_millis(100));
        assert!(unit.text().contains(unit.body()));
        assert_eq!(unit.text(), wrap_source("a.js", "function main() {}", true));
        assert!(unit.body().starts_with("\"use strict\";\nfunction main() {}\n"));
        assert!(unit.body().contains(INVOKE_FOOTER));
    }

    #[test]
    fn test_unit_clone_shares_text() {
        let unit = CompiledUnit::new("a.js", "text", false, Duration::from_millis(100));
        let clone = unit.clone();
        assert!(std::ptr::eq(unit.text(), clone.text()));
    }
}
