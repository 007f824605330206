//! Error types and result definitions for cdcflow.
//!
//! [`FlowError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail and the callsite that produced it. Errors from several workers can be
//! aggregated into one value, which is what [`crate::pipeline::Pipeline::wait`] returns.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Result type used across the crate.
pub type FlowResult<T> = Result<T, FlowError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the crate.
#[derive(Debug, Clone)]
pub struct FlowError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Failures of several workers collected while waiting on them.
    Many {
        errors: Vec<FlowError>,
        location: &'static Location<'static>,
    },
}

/// Classification of errors, used to decide whether an operation is retried.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Source errors
    SourceConnectionFailed,
    SourceQueryFailed,
    /// The source kept failing after every reconnection attempt.
    SourceFatal,
    SourceSequenceRegression,

    // State store errors
    StateStoreConnectionFailed,
    StateStoreQueryFailed,

    // Configuration errors
    ConfigError,
    ValidationError,
    WorkflowNotFound,
    TransformerNotFound,

    // Transformation errors
    TransformFailed,
    TransformTimedOut,
    TransformPanicked,
    IdempotencyKeyUnavailable,

    // Delivery errors
    EndpointUnavailable,
    EndpointRetryableStatus,
    EndpointRejected,
    DeliveryTimedOut,

    // Dead letter errors
    DeadLetterNotFound,

    // Data and serialization errors
    InvalidData,
    UnsupportedSchemaVersion,
    DeserializationError,
    ConversionError,
    IoError,

    // State and worker errors
    InvalidState,
    CaptureWorkerPanic,
    WorkflowWorkerPanic,
    RelayWorkerPanic,

    Unknown,

    // Used by failpoints to force a specific retry behavior.
    #[cfg(feature = "failpoints")]
    WithNoRetry,
    #[cfg(feature = "failpoints")]
    WithManualRetry,
    #[cfg(feature = "failpoints")]
    WithTimedRetry,
}

impl FlowError {
    /// Returns the [`ErrorKind`], or the kind of the first inner error when aggregated.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => errors.iter().flat_map(|err| err.kinds()).collect(),
        }
    }

    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { .. } => "multiple errors",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Short single line rendering without location or backtrace.
    ///
    /// Used for values that are persisted, such as dead letter reasons and outbox errors.
    pub fn summary(&self) -> String {
        match self.detail() {
            Some(detail) => format!("[{:?}] {}: {}", self.kind(), self.description(), detail),
            None => format!("[{:?}] {}", self.kind(), self.description()),
        }
    }

    /// Attaches the originating error. Has no effect on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        FlowError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for FlowError {
    fn eq(&self, other: &FlowError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Hash for FlowError {
    /// Hashes the kind and static description only, so repeated occurrences of the same
    /// failure group together regardless of detail or callsite.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_block(f, "Detail", payload.detail.as_deref())?;

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_block(f, "Backtrace", Some(&backtrace))?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, title: &str, body: Option<&str>) -> fmt::Result {
    let Some(body) = body else {
        return Ok(());
    };

    if body.trim().is_empty() {
        return write!(f, "\n  {title}: <empty>");
    }

    write!(f, "\n  {title}:")?;
    for line in body.lines() {
        write!(f, "\n    {line}")?;
    }

    Ok(())
}

impl error::Error for FlowError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for FlowError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> FlowError {
        FlowError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for FlowError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> FlowError {
        FlowError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned as is.
impl<E> From<Vec<E>> for FlowError
where
    E: Into<FlowError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> FlowError {
        let location = Location::caller();
        let mut errors: Vec<FlowError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        FlowError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for FlowError {
    #[track_caller]
    fn from(err: std::io::Error) -> FlowError {
        let detail = err.to_string();
        FlowError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for FlowError {
    #[track_caller]
    fn from(err: serde_json::Error) -> FlowError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        FlowError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<std::num::TryFromIntError> for FlowError {
    #[track_caller]
    fn from(err: std::num::TryFromIntError) -> FlowError {
        let detail = err.to_string();
        FlowError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("Integer conversion failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<uuid::Error> for FlowError {
    #[track_caller]
    fn from(err: uuid::Error) -> FlowError {
        let detail = err.to_string();
        FlowError::from_components(
            ErrorKind::ConversionError,
            Cow::Borrowed("UUID parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps [`sqlx::Error`] to state store kinds.
///
/// Sources reading through sqlx remap the kind with [`FlowError::into_source_error`].
impl From<sqlx::Error> for FlowError {
    #[track_caller]
    fn from(err: sqlx::Error) -> FlowError {
        let kind = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut => ErrorKind::StateStoreConnectionFailed,
            _ => ErrorKind::StateStoreQueryFailed,
        };

        let detail = err.to_string();
        FlowError::from_components(
            kind,
            Cow::Borrowed("Database operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<sqlx::migrate::MigrateError> for FlowError {
    #[track_caller]
    fn from(err: sqlx::migrate::MigrateError) -> FlowError {
        let detail = err.to_string();
        FlowError::from_components(
            ErrorKind::StateStoreQueryFailed,
            Cow::Borrowed("Database migration failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps transport level [`reqwest::Error`]s. Status codes never reach this conversion.
impl From<reqwest::Error> for FlowError {
    #[track_caller]
    fn from(err: reqwest::Error) -> FlowError {
        let (kind, description) = if err.is_timeout() {
            (ErrorKind::DeliveryTimedOut, "Endpoint did not answer in time")
        } else if err.is_builder() {
            (ErrorKind::ConfigError, "Invalid endpoint request")
        } else {
            (ErrorKind::EndpointUnavailable, "Endpoint could not be reached")
        };

        let detail = err.to_string();
        FlowError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Deadlines only wrap endpoint calls and transformer invocations; callers needing the
/// transformer kind build [`ErrorKind::TransformTimedOut`] themselves.
impl From<tokio::time::error::Elapsed> for FlowError {
    #[track_caller]
    fn from(err: tokio::time::error::Elapsed) -> FlowError {
        FlowError::from_components(
            ErrorKind::DeliveryTimedOut,
            Cow::Borrowed("Deadline elapsed"),
            None,
            Some(Arc::new(err)),
        )
    }
}

impl From<cdcflow_config::shared::ValidationError> for FlowError {
    #[track_caller]
    fn from(err: cdcflow_config::shared::ValidationError) -> FlowError {
        let detail = err.to_string();
        FlowError::from_components(
            ErrorKind::ValidationError,
            Cow::Borrowed("Invalid configuration"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl FlowError {
    /// Reclassifies state store kinds produced by the sqlx conversion as source kinds.
    pub fn into_source_error(self) -> FlowError {
        let kind = match self.kind() {
            ErrorKind::StateStoreConnectionFailed => ErrorKind::SourceConnectionFailed,
            ErrorKind::StateStoreQueryFailed => ErrorKind::SourceQueryFailed,
            _ => return self,
        };

        match self.repr {
            ErrorRepr::Single(mut payload) => {
                payload.kind = kind;
                FlowError {
                    repr: ErrorRepr::Single(payload),
                }
            }
            repr @ ErrorRepr::Many { .. } => FlowError { repr },
        }
    }
}
