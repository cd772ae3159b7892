use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Primary result codes reported by the storage engine.
///
/// Codes are passed through from the engine unmodified; `Display` renders the
/// conventional `SQLITE_*` spelling so messages read the same as the engine's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Error,
    Internal,
    Perm,
    Abort,
    Busy,
    Locked,
    NoMem,
    ReadOnly,
    Interrupt,
    IoErr,
    Corrupt,
    NotFound,
    Full,
    CantOpen,
    Protocol,
    Schema,
    TooBig,
    Constraint,
    Mismatch,
    Misuse,
    NoLfs,
    Auth,
    Range,
    NotADb,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "SQLITE_ERROR",
            Self::Internal => "SQLITE_INTERNAL",
            Self::Perm => "SQLITE_PERM",
            Self::Abort => "SQLITE_ABORT",
            Self::Busy => "SQLITE_BUSY",
            Self::Locked => "SQLITE_LOCKED",
            Self::NoMem => "SQLITE_NOMEM",
            Self::ReadOnly => "SQLITE_READONLY",
            Self::Interrupt => "SQLITE_INTERRUPT",
            Self::IoErr => "SQLITE_IOERR",
            Self::Corrupt => "SQLITE_CORRUPT",
            Self::NotFound => "SQLITE_NOTFOUND",
            Self::Full => "SQLITE_FULL",
            Self::CantOpen => "SQLITE_CANTOPEN",
            Self::Protocol => "SQLITE_PROTOCOL",
            Self::Schema => "SQLITE_SCHEMA",
            Self::TooBig => "SQLITE_TOOBIG",
            Self::Constraint => "SQLITE_CONSTRAINT",
            Self::Mismatch => "SQLITE_MISMATCH",
            Self::Misuse => "SQLITE_MISUSE",
            Self::NoLfs => "SQLITE_NOLFS",
            Self::Auth => "SQLITE_AUTH",
            Self::Range => "SQLITE_RANGE",
            Self::NotADb => "SQLITE_NOTADB",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<rusqlite::ErrorCode> for ErrorCode {
    fn from(code: rusqlite::ErrorCode) -> Self {
        use rusqlite::ErrorCode as Rc;
        match code {
            Rc::InternalMalfunction => Self::Internal,
            Rc::PermissionDenied => Self::Perm,
            Rc::OperationAborted => Self::Abort,
            Rc::DatabaseBusy => Self::Busy,
            Rc::DatabaseLocked => Self::Locked,
            Rc::OutOfMemory => Self::NoMem,
            Rc::ReadOnly => Self::ReadOnly,
            Rc::OperationInterrupted => Self::Interrupt,
            Rc::SystemIoFailure => Self::IoErr,
            Rc::DatabaseCorrupt => Self::Corrupt,
            Rc::NotFound => Self::NotFound,
            Rc::DiskFull => Self::Full,
            Rc::CannotOpen => Self::CantOpen,
            Rc::FileLockingProtocolFailed => Self::Protocol,
            Rc::SchemaChanged => Self::Schema,
            Rc::TooBig => Self::TooBig,
            Rc::ConstraintViolation => Self::Constraint,
            Rc::TypeMismatch => Self::Mismatch,
            Rc::ApiMisuse => Self::Misuse,
            Rc::NoLargeFileSupport => Self::NoLfs,
            Rc::AuthorizationForStatementDenied => Self::Auth,
            Rc::ParameterOutOfRange => Self::Range,
            Rc::NotADatabase => Self::NotADb,
            _ => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SqlSchedulerError {
    /// Lifecycle or ordering contract violated by the caller; never reaches the engine.
    #[error("SQLITE_MISUSE: {0}")]
    Misuse(String),

    /// Failure reported by the storage engine, code and message untouched.
    #[error("{code}: {message}")]
    Engine { code: ErrorCode, message: String },

    /// The in-flight engine call was aborted by `Connection::interrupt`.
    #[error("SQLITE_INTERRUPT: interrupted")]
    Interrupted,

    /// An error annotated with the call that produced it (verbose mode).
    #[error("{source}\n--> in {context}")]
    Traced {
        context: String,
        source: Box<SqlSchedulerError>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Parameter conversion error: {0}")]
    ParameterError(String),
}

impl SqlSchedulerError {
    pub(crate) fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse(message.into())
    }

    pub(crate) fn engine(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Engine {
            code,
            message: message.into(),
        }
    }

    /// Engine result code carried by this error, looking through verbose annotations.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Misuse(_) => Some(ErrorCode::Misuse),
            Self::Engine { code, .. } => Some(*code),
            Self::Interrupted => Some(ErrorCode::Interrupt),
            Self::Traced { source, .. } => source.code(),
            Self::ConfigError(_) | Self::ConnectionError(_) | Self::ParameterError(_) => None,
        }
    }

    #[must_use]
    pub fn is_misuse(&self) -> bool {
        self.code() == Some(ErrorCode::Misuse)
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.code() == Some(ErrorCode::Interrupt)
    }

    /// Worker loss means the engine handle is gone for good.
    pub(crate) fn is_fatal(&self) -> bool {
        match self {
            Self::ConnectionError(_) => true,
            Self::Traced { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for SqlSchedulerError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(failure, message) => {
                let code = ErrorCode::from(failure.code);
                if code == ErrorCode::Interrupt {
                    return Self::Interrupted;
                }
                let message = message.unwrap_or_else(|| failure.to_string());
                Self::engine(code, message)
            }
            rusqlite::Error::InvalidParameterName(name) => {
                Self::engine(ErrorCode::Range, format!("unknown parameter name {name}"))
            }
            rusqlite::Error::InvalidParameterCount(given, expected) => Self::engine(
                ErrorCode::Range,
                format!("wrong number of parameters: {given} supplied, {expected} expected"),
            ),
            other => Self::engine(ErrorCode::Error, other.to_string()),
        }
    }
}
