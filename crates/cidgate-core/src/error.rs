//! Gateway error model.
//!
//! [`GatewayError`] is the single error type crossing the backend seam. Every
//! variant belongs to one [`ErrorKind`], and the kind alone decides the HTTP
//! status written to the client. Errors raised by foreign code arrive boxed in
//! [`GatewayError::Backend`] and are classified by walking their `source()`
//! chain against an ordered list of not-found predicates.
//!
//! # Usage
//!
//! ```
//! use cidgate_core::error::{ErrorKind, GatewayError};
//!
//! let err = GatewayError::NoSuchLink {
//!     name: "missing.txt".to_owned(),
//!     cid: "bafkqaaa".to_owned(),
//! };
//! assert_eq!(err.kind(), ErrorKind::NotFound);
//! assert_eq!(err.status_code(), http::StatusCode::NOT_FOUND);
//! ```

use std::error::Error as StdError;
use std::fmt::Display;
use std::time::Duration;

use http::StatusCode;

use crate::codec::KindError;

/// A boxed error from code outside this crate.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Gateway error type.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A path segment does not name a link in its parent node.
    #[error("no link named {name:?} under {cid}")]
    NoSuchLink {
        /// The segment that could not be followed.
        name: String,
        /// The CID of the node that was searched.
        cid: String,
    },

    /// A block or record is not available.
    #[error("{0} not found")]
    NotFound(String),

    /// A mutable name has no record pointing anywhere.
    #[error("could not resolve name {0:?}")]
    ResolveFailed(String),

    /// A chain of mutable names did not settle within the recursion limit.
    #[error("could not resolve name {0:?}: recursion limit exceeded")]
    ResolveRecursion(String),

    /// The backend gave up waiting.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The backend chose an explicit HTTP status.
    #[error("{message}")]
    Status {
        /// Status to return to the client.
        status: StatusCode,
        /// Human-readable message.
        message: String,
    },

    /// Wraps another error with a client retry hint.
    #[error("{source}")]
    RetryAfter {
        /// The underlying error.
        source: Box<GatewayError>,
        /// How long the client should wait before retrying.
        retry_after: Duration,
    },

    /// The request path is malformed.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A string that should be a CID is not one.
    #[error("invalid cid {input:?}: {reason}")]
    InvalidCid {
        /// The offending input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The request is malformed in some other way.
    #[error("{0}")]
    BadRequest(String),

    /// The request asks for something this gateway does not implement.
    #[error("{0}")]
    Unimplemented(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),

    /// Attaches the content path that failed.
    #[error("failed to resolve {path}: {source}")]
    WithPath {
        /// The content path being served.
        path: String,
        /// The underlying error.
        source: Box<GatewayError>,
    },

    /// An error produced by foreign code.
    #[error("{0}")]
    Backend(#[source] BoxError),
}

/// Coarse classification that determines the response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 404 Not Found.
    NotFound,
    /// 504 Gateway Timeout.
    DeadlineExceeded,
    /// Backend-chosen status code.
    Status(StatusCode),
    /// 400 Bad Request.
    BadRequest,
    /// 501 Not Implemented.
    Unimplemented,
    /// 500 Internal Server Error.
    Internal,
}

impl ErrorKind {
    /// HTTP status code for this kind.
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::Status(code) => code,
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl GatewayError {
    /// Box a foreign error.
    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }

    /// Shorthand for [`GatewayError::Status`].
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Attach a retry hint.
    #[must_use]
    pub fn with_retry_after(self, retry_after: Duration) -> Self {
        Self::RetryAfter {
            source: Box::new(self),
            retry_after,
        }
    }

    /// Attach the failing content path. Errors already carrying a path are
    /// returned unchanged.
    #[must_use]
    pub fn with_path(self, path: impl Display) -> Self {
        match self {
            Self::WithPath { .. } => self,
            other => Self::WithPath {
                path: path.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSuchLink { .. } | Self::NotFound(_) | Self::ResolveFailed(_) => {
                ErrorKind::NotFound
            }
            Self::ResolveRecursion(_) | Self::Internal(_) => ErrorKind::Internal,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::Status { status, .. } => ErrorKind::Status(*status),
            Self::RetryAfter { source, .. } | Self::WithPath { source, .. } => source.kind(),
            Self::InvalidPath { .. } | Self::InvalidCid { .. } | Self::BadRequest(_) => {
                ErrorKind::BadRequest
            }
            Self::Unimplemented(_) => ErrorKind::Unimplemented,
            Self::Backend(err) => classify_foreign(err.as_ref()),
        }
    }

    /// The retry hint, if one was attached anywhere above the root cause.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RetryAfter { retry_after, .. } => Some(*retry_after),
            Self::WithPath { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// The HTTP status for this error.
    ///
    /// A positive retry hint forces `429 Too Many Requests` unless the error
    /// already maps to 429 or 503.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        let status = self.kind().status();
        match self.retry_after() {
            Some(hint)
                if !hint.is_zero()
                    && status != StatusCode::TOO_MANY_REQUESTS
                    && status != StatusCode::SERVICE_UNAVAILABLE =>
            {
                StatusCode::TOO_MANY_REQUESTS
            }
            _ => status,
        }
    }

    /// Whether the error means "this content does not exist".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<cid::Error> for GatewayError {
    fn from(err: cid::Error) -> Self {
        Self::InvalidCid {
            input: String::new(),
            reason: err.to_string(),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::backend(err)
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::DeadlineExceeded
    }
}

/// A predicate recognising one family of foreign errors.
type Predicate = fn(&(dyn StdError + 'static)) -> Option<ErrorKind>;

/// Checked in order against every error in a `source()` chain.
const PREDICATES: &[Predicate] = &[
    gateway_error_kind,
    io_error_kind,
    codec_kind_error,
    elapsed_kind,
];

fn gateway_error_kind(err: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    err.downcast_ref::<GatewayError>().map(GatewayError::kind)
}

fn io_error_kind(err: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    match err.downcast_ref::<std::io::Error>()?.kind() {
        std::io::ErrorKind::NotFound => Some(ErrorKind::NotFound),
        std::io::ErrorKind::TimedOut => Some(ErrorKind::DeadlineExceeded),
        _ => None,
    }
}

fn codec_kind_error(err: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    err.downcast_ref::<KindError>().map(|_| ErrorKind::NotFound)
}

fn elapsed_kind(err: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    err.downcast_ref::<tokio::time::error::Elapsed>()
        .map(|_| ErrorKind::DeadlineExceeded)
}

/// Walk the `source()` chain of a foreign error until a predicate matches.
fn classify_foreign(err: &(dyn StdError + 'static)) -> ErrorKind {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(kind) = PREDICATES.iter().find_map(|p| p(e)) {
            return kind;
        }
        current = e.source();
    }
    ErrorKind::Internal
}
