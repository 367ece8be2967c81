/// termsql Error Module
///
/// This module defines the error types shared by every layer of the client:
/// profile persistence, driver loading, the live connection and the
/// background task runner.
use std::fmt;
use thiserror::Error;

/// Failure reported by a database driver.
///
/// The driver's own message is kept verbatim so it can be shown to the
/// operator, together with the vendor error code when the driver has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub message: String,
    pub vendor_code: Option<i32>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        DriverError {
            message: message.into(),
            vendor_code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, vendor_code: i32) -> Self {
        DriverError {
            message: message.into(),
            vendor_code: Some(vendor_code),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_code {
            Some(code) => write!(f, "{} (vendor code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<rusqlite::Error> for DriverError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, message) => {
                let message = message.unwrap_or_else(|| code.to_string());
                DriverError::with_code(message, code.extended_code)
            }
            other => DriverError::new(other.to_string()),
        }
    }
}

/// Errors raised while resolving driver libraries or instantiating drivers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverLoadError {
    /// A driver library path could not be turned into a loadable reference
    #[error("malformed driver path {entry:?}: {reason}")]
    MalformedPath { entry: String, reason: String },

    /// No constructor is known under the requested driver name
    #[error("unknown driver {0:?}")]
    UnknownDriver(String),

    /// The constructor exists but refused to build a driver
    #[error("failed to instantiate driver {name:?}: {reason}")]
    Instantiation { name: String, reason: String },
}

/// Error type for the termsql client.
///
/// - Profile persistence (`Load`, `Save`, `Delete`)
/// - Driver resolution (`DriverLoad`)
/// - Driver failures on connect, execute and close (`Connection`)
/// - Invariant violations such as connecting twice (`State`)
/// - Ambient concerns: configuration, I/O, crashed background tasks
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to load profiles: {0}")]
    Load(String),

    #[error("Failed to save profile: {0}")]
    Save(String),

    #[error("Failed to delete profile: {0}")]
    Delete(String),

    #[error("Driver load error: {0}")]
    DriverLoad(#[from] DriverLoadError),

    #[error("Connection error: {0}")]
    Connection(#[from] DriverError),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A background task panicked before producing an outcome
    #[error("Task error: {0}")]
    Task(String),

    /// Cooperative cancellation; reported to the operator as a notice
    #[error("Interrupted")]
    Interrupted,
}

impl ClientError {
    /// Vendor error code of the underlying driver failure, if any.
    pub fn vendor_code(&self) -> Option<i32> {
        match self {
            ClientError::Connection(err) => err.vendor_code,
            _ => None,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, ClientError::Interrupted)
    }
}

/// Type alias for Result to use ClientError as the error type.
pub type Result<T> = std::result::Result<T, ClientError>;
