use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

/// HTTP method type, re-exported for use with error inspection.
pub use reqwest::Method;
/// HTTP status code type, re-exported for use with error inspection.
pub use reqwest::StatusCode;
use reqwest::header;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Transport-level failure of the realtime socket. Recovered internally by the reconnect loop
    Connection,
    /// Inbound frame that does not match the `{ type, data }` envelope
    Protocol,
    /// Unauthorized response that could not be resolved by one credential renewal
    Auth,
    /// No response was received (connect failure, timeout)
    Network,
    /// Error related to non-successful HTTP call
    Status,
    /// The realtime socket gave up after the configured number of reconnect attempts
    ReconnectExhausted,
    /// Error related to invalid input or state within console-transport
    Validation,
    /// Durable token storage could not be read or written
    Storage,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    /// The HTTP status carried by a [`Kind::Status`] error.
    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        self.downcast_ref::<Status>().map(|s| s.status_code)
    }

    /// Whether this failure is kept away from the user.
    ///
    /// Only `404 Not Found` is silent.
    #[must_use]
    pub fn is_silent(&self) -> bool {
        self.status_code() == Some(StatusCode::NOT_FOUND)
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Auth {
            reason: reason.into(),
        }
        .into()
    }

    pub fn status<S: Into<String>>(
        status_code: StatusCode,
        method: Method,
        path: String,
        message: S,
    ) -> Self {
        Status {
            status_code,
            method,
            path,
            message: message.into(),
        }
        .into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Status {
    pub status_code: StatusCode,
    pub method: Method,
    pub path: String,
    pub message: String,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error({}) making {} call to {} with {}",
            self.status_code, self.method, self.path, self.message
        )
    }
}

impl StdError for Status {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

/// Credentials are gone: either renewal failed or the retried call was still unauthorized.
/// Callers are expected to route the user to the login boundary.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Auth {
    pub reason: String,
}

impl fmt::Display for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authentication failed: {}", self.reason)
    }
}

impl StdError for Auth {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct ReconnectExhausted {
    pub attempts: u32,
}

impl fmt::Display for ReconnectExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gave up reconnecting after {} attempts, call connect() to retry",
            self.attempts
        )
    }
}

impl StdError for ReconnectExhausted {}

impl From<ReconnectExhausted> for Error {
    fn from(err: ReconnectExhausted) -> Self {
        Error::with_source(Kind::ReconnectExhausted, err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        // Anything that failed before a status line arrived never reached the server logic
        let kind = if e.is_connect() || e.is_timeout() || e.is_request() {
            Kind::Network
        } else {
            Kind::Internal
        };
        Error::with_source(kind, e)
    }
}

impl From<header::InvalidHeaderValue> for Error {
    fn from(e: header::InvalidHeaderValue) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_source(Kind::Storage, e)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<Status> for Error {
    fn from(err: Status) -> Self {
        Error::with_source(Kind::Status, err)
    }
}

impl From<Auth> for Error {
    fn from(err: Auth) -> Self {
        Error::with_source(Kind::Auth, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_should_succeed() {
        let status = Status {
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            method: Method::GET,
            path: "/users".to_owned(),
            message: "boom".to_owned(),
        };

        assert_eq!(
            status.to_string(),
            "error(500 Internal Server Error) making GET call to /users with boom"
        );
    }

    #[test]
    fn not_found_is_silent() {
        let err = Error::status(StatusCode::NOT_FOUND, Method::GET, "/x".to_owned(), "");
        assert_eq!(err.kind(), Kind::Status);
        assert!(err.is_silent());

        let err = Error::status(
            StatusCode::INTERNAL_SERVER_ERROR,
            Method::GET,
            "/x".to_owned(),
            "",
        );
        assert!(!err.is_silent());
        assert_eq!(err.status_code(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn auth_into_error_should_succeed() {
        let error = Error::auth("refresh token rejected");

        assert_eq!(error.kind(), Kind::Auth);
        assert!(error.to_string().contains("refresh token rejected"));
        assert!(error.downcast_ref::<Auth>().is_some());
    }

    #[test]
    fn reconnect_exhausted_display() {
        let error: Error = ReconnectExhausted { attempts: 3 }.into();
        assert_eq!(error.kind(), Kind::ReconnectExhausted);
        assert!(error.to_string().contains("after 3 attempts"));
    }
}
