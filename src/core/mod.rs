/// Core Module for termsql
///
/// The database-facing half of the client: drivers, the single live
/// connection, statement execution, and the error type shared by all of it.

pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{ClientError, DriverError, DriverLoadError, Result};
