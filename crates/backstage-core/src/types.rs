//! Request and response boundary types.
//!
//! An invocation receives a [`RequestEnvelope`] and ends with exactly one
//! [`ResponseOutcome`] (or an error).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Header whose comma-separated value names further headers to drop from
/// the envelope. The header itself is kept.
pub const OMIT_LIST_HEADER: &str = "omit-list";

/// Status used when the code never sets one.
pub const DEFAULT_STATUS: u16 = 200;

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Raw request data as supplied by a caller or a worker payload.
///
/// Missing fields default the same way the worker does: `method` to null and
/// `headers`, `query`, `body` to empty objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInput {
    /// HTTP method, if known
    #[serde(default)]
    pub method: Option<String>,
    /// Raw request headers
    #[serde(default, deserialize_with = "crate::ipc::null_as_default")]
    pub headers: Map<String, Value>,
    /// Parsed query string
    #[serde(default = "empty_object")]
    pub query: Value,
    /// Parsed request body
    #[serde(default = "empty_object")]
    pub body: Value,
}

impl Default for RequestInput {
    fn default() -> Self {
        Self {
            method: None,
            headers: Map::new(),
            query: empty_object(),
            body: empty_object(),
        }
    }
}

/// Normalized request handed to sandboxed code as `Backstage.request`.
///
/// # Examples
///
/// ```
/// use backstage_core::{RequestEnvelope, RequestInput};
/// use serde_json::json;
///
/// let input: RequestInput = serde_json::from_value(json!({
///     "method": "GET",
///     "headers": {
///         "host": "example.com",
///         "accept": "*/*",
///         "authorization": "secret",
///         "omit-list": "authorization, host"
///     }
/// }))
/// .unwrap();
///
/// let envelope = RequestEnvelope::new(input);
/// let mut names: Vec<_> = envelope.headers.keys().cloned().collect();
/// names.sort();
/// assert_eq!(names, ["accept", "omit-list"]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// HTTP method, if known
    pub method: Option<String>,
    /// Headers after omit-list filtering
    pub headers: Map<String, Value>,
    /// Parsed query string
    pub query: Value,
    /// Parsed request body
    pub body: Value,
}

impl RequestEnvelope {
    /// Builds an envelope, filtering headers through the omit list.
    #[must_use]
    pub fn new(input: RequestInput) -> Self {
        Self {
            method: input.method,
            headers: filter_headers(input.headers),
            query: input.query,
            body: input.body,
        }
    }
}

impl From<RequestInput> for RequestEnvelope {
    fn from(input: RequestInput) -> Self {
        Self::new(input)
    }
}

impl Default for RequestEnvelope {
    fn default() -> Self {
        Self::new(RequestInput::default())
    }
}

/// Header names are compared case-insensitively.
fn filter_headers(headers: Map<String, Value>) -> Map<String, Value> {
    let omitted: HashSet<String> = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(OMIT_LIST_HEADER))
        .and_then(|(_, value)| value.as_str())
        .map(|list| {
            list.split(',')
                .map(|name| name.trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if omitted.is_empty() {
        return headers;
    }

    headers
        .into_iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            lower == OMIT_LIST_HEADER || !omitted.contains(&lower)
        })
        .collect()
}

/// The single response an invocation produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseOutcome {
    /// Status code
    #[serde(default = "default_status")]
    pub status: u16,
    /// Response body; `null` when the code sent nothing
    #[serde(default)]
    pub body: Value,
    /// Headers set by the code
    #[serde(default)]
    pub headers: Map<String, Value>,
}

const fn default_status() -> u16 {
    DEFAULT_STATUS
}

impl ResponseOutcome {
    /// Creates an outcome with no headers.
    ///
    /// # Examples
    ///
    /// ```
    /// use backstage_core::ResponseOutcome;
    /// use serde_json::json;
    ///
    /// let outcome = ResponseOutcome::new(404, json!({"error": "x"}));
    /// assert_eq!(outcome.status, 404);
    /// assert!(outcome.headers.is_empty());
    /// ```
    #[must_use]
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            headers: Map::new(),
        }
    }

    /// Creates a 200 outcome.
    #[must_use]
    pub fn ok(body: Value) -> Self {
        Self::new(DEFAULT_STATUS, body)
    }
}

/// Result of a failed syntax check.
///
/// `stack` only contains frames from the submitted file, one per line, each
/// in the form `at <function> (<file>:<line>)` or `at <file>:<line>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxReport {
    /// String form of the thrown error, such as `SyntaxError: Unexpected token '}'`
    pub error: String,
    /// Filtered stack trace
    pub stack: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_omit_list_drops_named_headers_and_keeps_itself() {
        let input = RequestInput {
            headers: headers(json!({
                "host": "h",
                "accept": "a",
                "authorization": "secret",
                "omit-list": "authorization,host"
            })),
            ..RequestInput::default()
        };
        let envelope = RequestEnvelope::new(input);

        assert_eq!(envelope.headers.len(), 2);
        assert!(envelope.headers.contains_key("accept"));
        assert!(envelope.headers.contains_key("omit-list"));
    }

    #[test]
    fn test_omit_list_trims_and_ignores_case() {
        let input = RequestInput {
            headers: headers(json!({
                "X-Secret": "1",
                "Accept": "a",
                "Omit-List": " x-secret ,  "
            })),
            ..RequestInput::default()
        };
        let envelope = RequestEnvelope::new(input);

        assert!(!envelope.headers.contains_key("X-Secret"));
        assert!(envelope.headers.contains_key("Accept"));
        assert!(envelope.headers.contains_key("Omit-List"));
    }

    #[test]
    fn test_without_omit_list_headers_pass_through() {
        let input = RequestInput {
            headers: headers(json!({"host": "h", "accept": "a"})),
            ..RequestInput::default()
        };
        assert_eq!(RequestEnvelope::new(input).headers.len(), 2);
    }

    #[test]
    fn test_request_input_defaults() {
        let input: RequestInput = serde_json::from_value(json!({})).unwrap();
        assert_eq!(input.method, None);
        assert_eq!(input.query, json!({}));
        assert_eq!(input.body, json!({}));
        assert!(input.headers.is_empty());
    }

    #[test]
    fn test_response_outcome_defaults_on_deserialize() {
        let outcome: ResponseOutcome = serde_json::from_value(json!({"body": 1})).unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body, json!(1));
    }
}
