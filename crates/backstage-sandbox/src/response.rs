//! Response assembly and the once-only completion path.
//!
//! Every way an invocation can end (an explicit `send`, a returned value, a
//! thrown error, the completion deadline) funnels into one
//! [`CompletionCallback`]. The callback runs at most once; later calls are
//! ignored, which settles races between those paths.

use backstage_core::{DEFAULT_STATUS, Error, ErrorKind, ResponseOutcome, Result, TaggedError};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

type Callback = Box<dyn FnOnce(Result<ResponseOutcome>) + Send>;

/// Completion callback guarded to fire at most once.
///
/// # Examples
///
/// ```
/// use backstage_sandbox::response::CompletionCallback;
/// use backstage_core::{Error, ResponseOutcome};
/// use serde_json::json;
/// use std::sync::{Arc, Mutex};
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&seen);
/// let callback = CompletionCallback::new(move |result| sink.lock().unwrap().push(result.is_ok()));
///
/// assert!(callback.complete(Ok(ResponseOutcome::ok(json!(1)))));
/// assert!(!callback.complete(Err(Error::user("late"))));
/// assert_eq!(*seen.lock().unwrap(), [true]);
/// ```
pub struct CompletionCallback {
    callback: Mutex<Option<Callback>>,
}

impl fmt::Debug for CompletionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionCallback")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl CompletionCallback {
    /// Wraps `callback`.
    pub fn new(callback: impl FnOnce(Result<ResponseOutcome>) + Send + 'static) -> Self {
        Self {
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    /// Delivers `result` if nothing was delivered yet.
    ///
    /// Returns `true` if this call delivered it.
    pub fn complete(&self, result: Result<ResponseOutcome>) -> bool {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match callback {
            Some(callback) => {
                callback(result);
                true
            }
            None => {
                tracing::trace!("completion already delivered, dropping late result");
                false
            }
        }
    }

    /// Returns `true` once a result has been delivered.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Pending response of one invocation.
///
/// `set` and `status` only mutate pending state; `send` and the convenience
/// terminals finalize it through the completion callback.
///
/// # Examples
///
/// ```
/// use backstage_sandbox::response::{CompletionCallback, ResponseSink};
/// use serde_json::json;
/// use std::sync::{Arc, Mutex};
///
/// let out = Arc::new(Mutex::new(None));
/// let slot = Arc::clone(&out);
/// let callback = Arc::new(CompletionCallback::new(move |r| *slot.lock().unwrap() = Some(r)));
///
/// let mut response = ResponseSink::new(callback);
/// response.set("x-id", "7").status(201);
/// response.send(json!({"ok": true}));
///
/// let outcome = out.lock().unwrap().take().unwrap().unwrap();
/// assert_eq!(outcome.status, 201);
/// assert_eq!(outcome.headers["x-id"], json!("7"));
/// ```
#[derive(Debug)]
pub struct ResponseSink {
    status: Option<u16>,
    headers: Map<String, Value>,
    callback: Arc<CompletionCallback>,
}

impl ResponseSink {
    /// Creates a sink that finalizes through `callback`.
    #[must_use]
    pub fn new(callback: Arc<CompletionCallback>) -> Self {
        Self {
            status: None,
            headers: Map::new(),
            callback,
        }
    }

    /// Sets a header.
    pub fn set(&mut self, header: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.headers.insert(header.into(), value.into());
        self
    }

    /// Sets the status. Zero means "unset" and falls back to 200 on send.
    pub fn status(&mut self, code: u16) -> &mut Self {
        self.status = Some(code);
        self
    }

    /// Finalizes the response with `body`.
    ///
    /// Returns `false` if the invocation had already completed.
    pub fn send(&mut self, body: impl Into<Value>) -> bool {
        let outcome = ResponseOutcome {
            status: self.current_status(),
            body: body.into(),
            headers: self.headers.clone(),
        };
        self.callback.complete(Ok(outcome))
    }

    /// 304 with a null body.
    pub fn not_modified(&mut self) -> bool {
        self.respond_with(ErrorKind::NotModified, Value::Null)
    }

    /// 400 with `{error: message}`.
    pub fn bad_request_error(&mut self, message: impl Into<Value>) -> bool {
        self.respond_with(ErrorKind::BadRequest, message)
    }

    /// 404 with `{error: message}`.
    ///
    /// # Examples
    ///
    /// ```
    /// use backstage_sandbox::response::{CompletionCallback, ResponseSink};
    /// use serde_json::json;
    /// use std::sync::{Arc, Mutex};
    ///
    /// let out = Arc::new(Mutex::new(None));
    /// let slot = Arc::clone(&out);
    /// let mut response =
    ///     ResponseSink::new(Arc::new(CompletionCallback::new(move |r| *slot.lock().unwrap() = Some(r))));
    /// response.not_found_error("x");
    ///
    /// let outcome = out.lock().unwrap().take().unwrap().unwrap();
    /// assert_eq!((outcome.status, outcome.body), (404, json!({"error": "x"})));
    /// ```
    pub fn not_found_error(&mut self, message: impl Into<Value>) -> bool {
        self.respond_with(ErrorKind::NotFound, message)
    }

    /// 422 with `{error: message}`.
    pub fn validation_error(&mut self, message: impl Into<Value>) -> bool {
        self.respond_with(ErrorKind::UnprocessableEntity, message)
    }

    /// 500 with `{error: message}`.
    pub fn internal_server_error(&mut self, message: impl Into<Value>) -> bool {
        self.respond_with(ErrorKind::InternalServerError, message)
    }

    /// Answers with the response a tagged error maps to, keeping headers.
    pub fn respond_tagged(&mut self, error: TaggedError) -> bool {
        let outcome = error.into_outcome(self.headers.clone());
        self.callback.complete(Ok(outcome))
    }

    /// Ends the invocation with an error.
    pub fn fail(&mut self, error: Error) -> bool {
        self.callback.complete(Err(error))
    }

    /// Returns `true` once the invocation has completed by any path.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.callback.is_completed()
    }

    /// Headers set so far.
    #[must_use]
    pub const fn headers(&self) -> &Map<String, Value> {
        &self.headers
    }

    /// Status that `send` would use now.
    #[must_use]
    pub fn current_status(&self) -> u16 {
        match self.status {
            Some(code) if code != 0 => code,
            _ => DEFAULT_STATUS,
        }
    }

    /// Applies one call made by sandboxed code on `Backstage.response`.
    pub fn apply(&mut self, call: ResponseCall) {
        match call {
            ResponseCall::Set { name, value } => {
                self.set(name, value);
            }
            ResponseCall::Status { code } => {
                self.status(code);
            }
            ResponseCall::Send { body } => {
                self.send(body);
            }
            ResponseCall::NotModified => {
                self.not_modified();
            }
            ResponseCall::BadRequest { message } => {
                self.bad_request_error(message);
            }
            ResponseCall::NotFound { message } => {
                self.not_found_error(message);
            }
            ResponseCall::UnprocessableEntity { message } => {
                self.validation_error(message);
            }
            ResponseCall::InternalServerError { message } => {
                self.internal_server_error(message);
            }
        }
    }

    fn respond_with(&mut self, kind: ErrorKind, message: impl Into<Value>) -> bool {
        let outcome = ResponseOutcome {
            status: kind.status_code(),
            body: kind.body(message),
            headers: self.headers.clone(),
        };
        self.callback.complete(Ok(outcome))
    }
}

/// A call on the sandbox-side response object, as sent over the host
/// boundary.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ResponseCall {
    /// `response.set(name, value)`
    Set {
        /// Header name
        name: String,
        /// Header value
        #[serde(default)]
        value: Value,
    },
    /// `response.status(code)`
    Status {
        /// Status code
        code: u16,
    },
    /// `response.send(body)`
    Send {
        /// Body
        #[serde(default)]
        body: Value,
    },
    /// `response.notModified()`
    NotModified,
    /// `response.badRequestError(message)`
    BadRequest {
        /// Error message
        #[serde(default)]
        message: Value,
    },
    /// `response.notFoundError(message)`
    NotFound {
        /// Error message
        #[serde(default)]
        message: Value,
    },
    /// `response.validationError(message)`
    UnprocessableEntity {
        /// Error message
        #[serde(default)]
        message: Value,
    },
    /// `response.internalServerError(message)`
    InternalServerError {
        /// Error message
        #[serde(default)]
        message: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Slot = Arc<Mutex<Vec<Result<ResponseOutcome>>>>;

    fn sink() -> (ResponseSink, Slot) {
        let results: Slot = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::clone(&results);
        let callback = CompletionCallback::new(move |r| slot.lock().unwrap().push(r));
        (ResponseSink::new(Arc::new(callback)), results)
    }

    fn only_outcome(results: &Slot) -> ResponseOutcome {
        let mut results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        results.pop().unwrap().unwrap()
    }

    #[test]
    fn test_send_defaults_to_200() {
        let (mut response, results) = sink();
        response.send(json!({"a": 1}));
        let outcome = only_outcome(&results);
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body, json!({"a": 1}));
    }

    #[test]
    fn test_zero_status_falls_back_to_200() {
        let (mut response, results) = sink();
        response.status(0).send(Value::Null);
        assert_eq!(only_outcome(&results).status, 200);
    }

    #[test]
    fn test_second_send_is_ignored() {
        let (mut response, results) = sink();
        assert!(response.send(1));
        assert!(!response.send(2));
        assert!(!response.fail(Error::user("late")));
        assert_eq!(only_outcome(&results).body, json!(1));
    }

    #[test]
    fn test_convenience_terminals() {
        let cases: [(fn(&mut ResponseSink) -> bool, u16, Value); 5] = [
            (|r| r.not_modified(), 304, Value::Null),
            (|r| r.bad_request_error("x"), 400, json!({"error": "x"})),
            (|r| r.not_found_error("x"), 404, json!({"error": "x"})),
            (|r| r.validation_error("x"), 422, json!({"error": "x"})),
            (|r| r.internal_server_error("x"), 500, json!({"error": "x"})),
        ];
        for (terminal, status, body) in cases {
            let (mut response, results) = sink();
            response.set("x-kept", true);
            assert!(terminal(&mut response));
            let outcome = only_outcome(&results);
            assert_eq!(outcome.status, status);
            assert_eq!(outcome.body, body);
            assert_eq!(outcome.headers["x-kept"], json!(true));
        }
    }

    #[test]
    fn test_apply_decodes_wire_calls() {
        let (mut response, results) = sink();
        for call in [
            json!({"op": "set", "name": "x-a", "value": "1"}),
            json!({"op": "status", "code": 202}),
            json!({"op": "send", "body": [1, 2]}),
        ] {
            response.apply(serde_json::from_value(call).unwrap());
        }
        let outcome = only_outcome(&results);
        assert_eq!(outcome.status, 202);
        assert_eq!(outcome.body, json!([1, 2]));
        assert_eq!(outcome.headers["x-a"], json!("1"));
    }

    #[test]
    fn test_callback_fires_once_under_contention() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let callback = Arc::new(CompletionCallback::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let callback = Arc::clone(&callback);
                std::thread::spawn(move || callback.complete(Ok(ResponseOutcome::ok(json!(i)))))
            })
            .collect();
        let delivered = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|delivered| *delivered)
            .count();

        assert_eq!(delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
