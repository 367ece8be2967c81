/// Database Module
///
/// ## Architecture
///
/// - **Values** (`value.rs`): driver-neutral cell values, rows and statement results
/// - **Driver capability** (`driver.rs`): the traits every driver implements
/// - **Registry** (`registry.rs`): the set of drivers able to open connections
/// - **Loader** (`loader.rs`): resolves driver libraries and registers named drivers
/// - **SQLite** (`sqlite.rs`): the built-in, auto-registered driver
/// - **Connection Management** (`connection.rs`): the single live connection slot
/// - **Query Execution** (`query.rs`): runs statements and shapes their results
pub mod connection;
pub mod driver;
pub mod loader;
pub mod query;
pub mod registry;
pub mod sqlite;
pub mod value;

pub use connection::*;
pub use driver::*;
pub use loader::*;
pub use query::*;
pub use registry::*;
pub use value::*;
