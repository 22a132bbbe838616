//! Output formatters for CLI commands.
//!
//! Every command prints one serializable report. JSON mode pretty-prints it,
//! text mode prints compact JSON on one line for scripts, and pretty mode
//! renders a colored tree with a status line on top.

use anyhow::Result;
use backstage_core::cli::OutputFormat;
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;

/// Format data according to the specified output format.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
///
/// # Examples
///
/// ```
/// use backstage_cli::formatters::format_output;
/// use backstage_core::ResponseOutcome;
/// use backstage_core::cli::OutputFormat;
/// use serde_json::json;
///
/// let outcome = ResponseOutcome::ok(json!({"a": 1}));
/// let output = format_output(&outcome, OutputFormat::Text)?;
/// assert_eq!(output, r#"{"status":200,"body":{"a":1},"headers":{}}"#);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn format_output<T: Serialize>(data: &T, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => json::format(data),
        OutputFormat::Text => text::format(data),
        OutputFormat::Pretty => pretty::format(data),
    }
}

/// JSON output formatting.
pub mod json {
    use super::{Result, Serialize};

    /// Format data as JSON with 2-space indentation.
    pub fn format<T: Serialize>(data: &T) -> Result<String> {
        Ok(serde_json::to_string_pretty(data)?)
    }

    /// Format data as compact JSON.
    pub fn format_compact<T: Serialize>(data: &T) -> Result<String> {
        Ok(serde_json::to_string(data)?)
    }
}

/// Plain text output formatting.
pub mod text {
    use super::{Result, Serialize, json};

    /// One line of compact JSON, suitable for piping.
    pub fn format<T: Serialize>(data: &T) -> Result<String> {
        json::format_compact(data)
    }
}

/// Pretty (human-readable) output formatting.
pub mod pretty {
    use super::{Colorize, Result, Serialize, Value};
    use std::fmt::Write;

    /// Format data as a colored tree.
    ///
    /// Reports carrying a numeric `status` get a status line first.
    pub fn format<T: Serialize>(data: &T) -> Result<String> {
        let value = serde_json::to_value(data)?;
        let mut out = String::new();
        if let Some(status) = value
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|status| u16::try_from(status).ok())
        {
            out.push_str(&status_line(status));
            out.push('\n');
        }
        write_value(&mut out, &value, 0);
        Ok(out)
    }

    /// `HTTP <status>` colored by status class.
    #[must_use]
    pub fn status_line(status: u16) -> String {
        let line = format!("HTTP {status}");
        match status {
            200..=299 => line.green().bold().to_string(),
            300..=399 => line.cyan().bold().to_string(),
            400..=499 => line.yellow().bold().to_string(),
            _ => line.red().bold().to_string(),
        }
    }

    fn write_value(out: &mut String, value: &Value, indent: usize) {
        let pad = "  ".repeat(indent + 1);
        match value {
            Value::Null => out.push_str(&"null".dimmed().to_string()),
            Value::Bool(b) => out.push_str(&b.to_string().yellow().to_string()),
            Value::Number(n) => out.push_str(&n.to_string().cyan().to_string()),
            Value::String(s) if s.contains('\n') => {
                // Multi-line strings (stacks, captured logs) print as blocks.
                for line in s.lines() {
                    let _ = write!(out, "\n{pad}{}", line.green());
                }
            }
            Value::String(s) => {
                let _ = write!(out, "\"{}\"", s.green());
            }
            Value::Array(items) if items.is_empty() => out.push_str("[]"),
            Value::Object(map) if map.is_empty() => out.push_str("{}"),
            Value::Array(items) => {
                out.push('[');
                for item in items {
                    let _ = write!(out, "\n{pad}");
                    write_value(out, item, indent + 1);
                }
                let _ = write!(out, "\n{}]", "  ".repeat(indent));
            }
            Value::Object(map) => {
                out.push('{');
                for (key, item) in map {
                    let _ = write!(out, "\n{pad}{}: ", key.blue().bold());
                    write_value(out, item, indent + 1);
                }
                let _ = write!(out, "\n{}}}", "  ".repeat(indent));
            }
        }
    }
}
