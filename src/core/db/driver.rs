/// Driver Capability Module
///
/// A driver turns a connection locator plus credentials into a live session.
/// Everything above this layer talks to databases only through these traits,
/// so the wire protocol stays entirely the driver's business.
use crate::core::DriverError;
use crate::core::db::Value;

/// Credentials handed to a driver when opening a session.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        Credentials {
            user: user.into(),
            password,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Tells the driver whether to keep fetching rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    More,
    Stop,
}

/// Receives the rows of a row-producing statement as the driver fetches them.
pub trait RowSink {
    /// Called once, before any row, with the declared column labels.
    fn columns(&mut self, labels: Vec<String>);

    /// Called per fetched row. Returning `Fetch::Stop` makes the driver close
    /// the cursor instead of fetching further.
    fn row(&mut self, values: Vec<Value>) -> Fetch;
}

/// What a statement produced once the driver is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// Rows were streamed into the sink and the cursor is closed.
    RowSet,
    /// No row set; affected row count, `-1` when unknown.
    Updated(i64),
}

/// A live database session opened by a driver.
pub trait DriverConnection: Send {
    /// Runs one statement. Row-producing statements stream into `sink`; the
    /// driver must release the cursor before returning, whether it was
    /// exhausted or stopped early.
    fn execute(&mut self, sql: &str, sink: &mut dyn RowSink)
        -> Result<Execution, DriverError>;

    /// Closes the session, releasing driver-side resources.
    fn close(self: Box<Self>) -> Result<(), DriverError>;
}

/// The driver capability itself.
pub trait Driver: Send + Sync {
    /// Name the driver is registered and looked up under.
    fn name(&self) -> &str;

    /// Whether this driver understands `locator`.
    fn accepts(&self, locator: &str) -> bool;

    fn connect(
        &self,
        locator: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn DriverConnection>, DriverError>;
}
