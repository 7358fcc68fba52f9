//! The single error surface of the crate.
//!
//! Every fallible operation, sync or async, reports the same `Error` type:
//! a kind, a message, and an optional numeric code carried over from the
//! underlying store. Sync entry points return it; async entry points resolve
//! their future with it. I/O failures keep the originating `io::Error` as the
//! source so callers can still match on `ErrorKind::Io` while logging the
//! full chain.

use std::io;

use thiserror::Error;

/// A specialized result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of every failure the engine surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The database handle has been closed.
    NotOpen,
    /// A key argument was empty or missing.
    KeyRequired,
    /// A key of an unsupported shape was supplied.
    InvalidKeyType,
    /// A value argument was rejected.
    InvalidValue,
    /// A malformed argument outside the key/value taxonomy.
    InvalidArgument,
    /// A transaction conflict; the operation may be retried.
    Busy,
    /// The handle closed while the operation was pending.
    ClosedDuringOperation,
    /// The transaction id is not live on this handle.
    UnknownTxn,
    /// The transaction already writes to a different log.
    LogAlreadyBoundToTxn,
    /// The log name cannot be used as a directory name.
    InvalidLogName,
    /// A log file failed structural validation.
    InvalidLogFile,
    /// A log file carries a format version this build does not read.
    UnsupportedVersion,
    /// The requested property is not exposed by this store.
    PropertyUnavailable,
    /// Statistics were requested but not enabled at open.
    StatsNotEnabled,
    /// An operating system I/O failure.
    Io,
}

impl ErrorKind {
    /// The stable name reported to callers, matching the error taxonomy of
    /// the public surface.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotOpen => "NOT_OPEN",
            ErrorKind::KeyRequired => "KEY_REQUIRED",
            ErrorKind::InvalidKeyType => "INVALID_KEY_TYPE",
            ErrorKind::InvalidValue => "INVALID_VALUE",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::Busy => "BUSY",
            ErrorKind::ClosedDuringOperation => "CLOSED_DURING_OPERATION",
            ErrorKind::UnknownTxn => "UNKNOWN_TXN",
            ErrorKind::LogAlreadyBoundToTxn => "LOG_ALREADY_BOUND_TO_TXN",
            ErrorKind::InvalidLogName => "INVALID_LOG_NAME",
            ErrorKind::InvalidLogFile => "INVALID_LOG_FILE",
            ErrorKind::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ErrorKind::PropertyUnavailable => "PROPERTY_UNAVAILABLE",
            ErrorKind::StatsNotEnabled => "STATS_NOT_ENABLED",
            ErrorKind::Io => "IO",
        }
    }
}

/// An engine error: kind, human-readable message, optional store code.
#[derive(Debug, Error)]
#[error("{}: {message}", kind.as_str())]
pub struct Error {
    kind: ErrorKind,
    message: String,
    code: Option<i32>,
    #[source]
    source: Option<io::Error>,
}

impl Error {
    /// Creates an error of `kind` with an explicit message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            source: None,
        }
    }

    /// Attaches a numeric code from the underlying store.
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// True when the operation may be retried as-is after refreshing reads.
    pub fn is_busy(&self) -> bool {
        self.kind == ErrorKind::Busy
    }

    pub(crate) fn not_open() -> Self {
        Self::new(ErrorKind::NotOpen, "database is not open")
    }

    pub(crate) fn key_required() -> Self {
        Self::new(ErrorKind::KeyRequired, "a non-empty key is required")
    }

    pub(crate) fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub(crate) fn closed_during_operation() -> Self {
        Self::new(
            ErrorKind::ClosedDuringOperation,
            "database closed while the operation was pending",
        )
    }

    pub(crate) fn unknown_txn(id: u64) -> Self {
        Self::new(ErrorKind::UnknownTxn, format!("unknown transaction id {id}"))
    }

    pub(crate) fn log_already_bound(name: &str) -> Self {
        Self::new(
            ErrorKind::LogAlreadyBoundToTxn,
            format!("transaction is already bound to log {name:?}"),
        )
    }

    pub(crate) fn invalid_log_name(name: &str) -> Self {
        Self::new(ErrorKind::InvalidLogName, format!("invalid log name {name:?}"))
    }

    pub(crate) fn invalid_log_file(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidLogFile, message)
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: err.to_string(),
            code: err.raw_os_error(),
            source: Some(err),
        }
    }
}
