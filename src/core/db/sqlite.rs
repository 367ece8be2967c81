/// Built-in SQLite driver backed by rusqlite.
///
/// Accepted locators:
/// - `sqlite:<path>` / `jdbc:sqlite:<path>` for a database file
/// - `sqlite::memory:` for a private in-memory database
///
/// Entries of the ambient driver library are loaded into every new
/// session as SQLite extensions.
use crate::core::db::loader::active_library;
use crate::core::db::{Credentials, Driver, DriverConnection, Execution, Fetch, RowSink, Value};
use crate::core::DriverError;
use rusqlite::{Batch, Connection};
use std::path::Path;
use tracing::debug;

const PREFIXES: [&str; 2] = ["jdbc:sqlite:", "sqlite:"];
const MEMORY: &str = ":memory:";

#[derive(Debug, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        SqliteDriver
    }

    fn target(locator: &str) -> Option<&str> {
        PREFIXES
            .iter()
            .find_map(|prefix| locator.strip_prefix(prefix))
            .filter(|rest| !rest.trim().is_empty())
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn accepts(&self, locator: &str) -> bool {
        Self::target(locator).is_some()
    }

    fn connect(
        &self,
        locator: &str,
        _credentials: &Credentials,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        let target = Self::target(locator)
            .ok_or_else(|| DriverError::new(format!("Not a SQLite locator: {}", locator)))?;

        let conn = if target == MEMORY {
            Connection::open_in_memory()?
        } else {
            Connection::open(target)?
        };

        for extension in active_library().entries() {
            load_extension(&conn, extension)?;
        }

        debug!("Opened SQLite database {}", target);
        Ok(Box::new(SqliteConnection { conn }))
    }
}

fn load_extension(conn: &Connection, path: &Path) -> Result<(), DriverError> {
    debug!("Loading SQLite extension {}", path.display());
    // SAFETY: extension loading is switched on only for the duration of this
    // call, for a library the operator listed in their own configuration.
    unsafe {
        conn.load_extension_enable()?;
        let loaded = conn.load_extension(path, None);
        conn.load_extension_disable()?;
        loaded?;
    }
    Ok(())
}

pub struct SqliteConnection {
    conn: Connection,
}

impl DriverConnection for SqliteConnection {
    fn execute(&mut self, sql: &str, sink: &mut dyn RowSink) -> Result<Execution, DriverError> {
        let mut batch = Batch::new(&self.conn, sql);
        let mut stmt = batch
            .next()?
            .ok_or_else(|| DriverError::new("No statement to execute"))?;
        // One statement per call; trailing whitespace and comments are fine.
        if !matches!(batch.next(), Ok(None)) {
            return Err(DriverError::new(
                "Multiple statements in one execution are not supported",
            ));
        }

        if stmt.column_count() == 0 {
            let changed = stmt.execute([])?;
            return Ok(Execution::Updated(changed as i64));
        }

        let labels: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = labels.len();
        sink.columns(labels);

        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(Value::from(row.get_ref(i)?));
            }
            if sink.row(values) == Fetch::Stop {
                break;
            }
        }
        // Dropping `rows` resets the statement, releasing the cursor.
        Ok(Execution::RowSet)
    }

    fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.conn.close().map_err(|(_, err)| DriverError::from(err))
    }
}
