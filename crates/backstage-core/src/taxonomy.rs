//! Status-carrying error kinds that sandboxed code can throw.
//!
//! The same five kinds are injected into the sandbox as constructors
//! (`NotModified`, `BadRequest`, ...) and mirrored by the response helpers
//! (`notModified`, `badRequestError`, ...). When the engine sees an error
//! tagged with one of these status codes it turns it into a response instead
//! of a failure.

use crate::types::ResponseOutcome;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;

/// Tagged error kind with a fixed status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// 304, answered with a null body
    NotModified,
    /// 400
    BadRequest,
    /// 404
    NotFound,
    /// 422
    UnprocessableEntity,
    /// 500
    InternalServerError,
}

impl ErrorKind {
    /// Every kind, in status order.
    pub const ALL: [Self; 5] = [
        Self::NotModified,
        Self::BadRequest,
        Self::NotFound,
        Self::UnprocessableEntity,
        Self::InternalServerError,
    ];

    /// Status code for this kind.
    ///
    /// # Examples
    ///
    /// ```
    /// use backstage_core::ErrorKind;
    ///
    /// assert_eq!(ErrorKind::UnprocessableEntity.status_code(), 422);
    /// ```
    #[must_use]
    pub const fn status_code(self) -> u16 {
        match self {
            Self::NotModified => 304,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::UnprocessableEntity => 422,
            Self::InternalServerError => 500,
        }
    }

    /// Kind for a status code, if the code belongs to the taxonomy.
    ///
    /// # Examples
    ///
    /// ```
    /// use backstage_core::ErrorKind;
    ///
    /// assert_eq!(ErrorKind::from_status_code(404), Some(ErrorKind::NotFound));
    /// assert_eq!(ErrorKind::from_status_code(418), None);
    /// ```
    #[must_use]
    pub const fn from_status_code(code: u16) -> Option<Self> {
        match code {
            304 => Some(Self::NotModified),
            400 => Some(Self::BadRequest),
            404 => Some(Self::NotFound),
            422 => Some(Self::UnprocessableEntity),
            500 => Some(Self::InternalServerError),
            _ => None,
        }
    }

    /// Constructor name exposed to sandboxed code.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NotModified => "NotModified",
            Self::BadRequest => "BadRequest",
            Self::NotFound => "NotFound",
            Self::UnprocessableEntity => "UnprocessableEntity",
            Self::InternalServerError => "InternalServerError",
        }
    }

    /// Response body for this kind: `null` for 304, `{error: message}` otherwise.
    #[must_use]
    pub fn body(self, message: impl Into<Value>) -> Value {
        match self {
            Self::NotModified => Value::Null,
            _ => json!({ "error": message.into() }),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An error of a known kind, ready to become a response.
///
/// # Examples
///
/// ```
/// use backstage_core::{ErrorKind, TaggedError};
/// use serde_json::{Map, json};
///
/// let outcome = TaggedError::new(ErrorKind::NotFound, "x").into_outcome(Map::new());
/// assert_eq!(outcome.status, 404);
/// assert_eq!(outcome.body, json!({"error": "x"}));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedError {
    /// Kind of the error
    pub kind: ErrorKind,
    /// Message thrown with it
    pub message: String,
}

impl TaggedError {
    /// Creates a tagged error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Status code of the kind.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    /// Converts into the response it maps to, keeping headers already set.
    #[must_use]
    pub fn into_outcome(self, headers: Map<String, Value>) -> ResponseOutcome {
        ResponseOutcome {
            status: self.kind.status_code(),
            body: self.kind.body(self.message),
            headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip_through_lookup() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_status_code(kind.status_code()), Some(kind));
        }
    }

    #[test]
    fn test_not_modified_has_null_body() {
        let outcome = TaggedError::new(ErrorKind::NotModified, "ignored").into_outcome(Map::new());
        assert_eq!(outcome.status, 304);
        assert_eq!(outcome.body, Value::Null);
    }

    #[test]
    fn test_unprocessable_entity_keeps_headers() {
        let mut headers = Map::new();
        headers.insert("x-test".into(), json!("1"));
        let outcome =
            TaggedError::new(ErrorKind::UnprocessableEntity, "testing").into_outcome(headers);
        assert_eq!(outcome.status, 422);
        assert_eq!(outcome.body, json!({"error": "testing"}));
        assert_eq!(outcome.headers["x-test"], json!("1"));
    }
}
