/// Query Execution Module
///
/// Runs statements on a driver connection and shapes what comes back into
/// [`StatementResult`] values: a bounded row set or an update count.
use crate::core::db::{DriverConnection, Execution, Fetch, Row, RowSink, StatementResult, Value};
use crate::core::{ClientError, Result};
use std::fmt;
use tracing::{debug, info, warn};

/// Collects at most `limit` rows and notes whether more were available.
struct Materializer {
    limit: usize,
    columns: Vec<String>,
    rows: Vec<Row>,
    truncated: bool,
}

impl Materializer {
    fn new(limit: usize) -> Self {
        Materializer {
            limit,
            columns: Vec::new(),
            rows: Vec::new(),
            truncated: false,
        }
    }

    fn finish(self) -> StatementResult {
        StatementResult::Rows {
            columns: self.columns,
            rows: self.rows,
            truncated: self.truncated,
        }
    }
}

impl RowSink for Materializer {
    fn columns(&mut self, labels: Vec<String>) {
        self.columns = labels;
    }

    fn row(&mut self, values: Vec<Value>) -> Fetch {
        if self.rows.len() >= self.limit {
            self.truncated = true;
            return Fetch::Stop;
        }
        let cells = self.columns.iter().cloned().zip(values).collect();
        self.rows.push(Row::new(cells));
        Fetch::More
    }
}

/// Executes one statement, keeping at most `row_limit` rows.
///
/// # Errors
///
/// Returns `ClientError::State` for blank input and `ClientError::Connection`
/// when the driver rejects the statement.
pub fn execute(conn: &mut dyn DriverConnection, sql: &str, row_limit: usize) -> Result<StatementResult> {
    let sql = sql.trim();
    if sql.is_empty() {
        return Err(ClientError::State("nothing to execute".to_string()));
    }

    debug!("Executing: {}", sql);
    let mut sink = Materializer::new(row_limit);
    let result = match conn.execute(sql, &mut sink)? {
        Execution::RowSet => sink.finish(),
        Execution::Updated(count) => StatementResult::UpdateCount(count),
    };
    if result.is_truncated() {
        debug!("Result truncated at {} rows", row_limit);
    }
    Ok(result)
}

/// Why a batch stopped before its last statement.
///
/// `completed` holds the results of the statements that ran before the stop.
#[derive(Debug)]
pub struct BatchAbort {
    pub completed: Vec<StatementResult>,
    pub cause: ClientError,
}

impl BatchAbort {
    pub fn is_cancelled(&self) -> bool {
        self.cause.is_interrupted()
    }
}

impl fmt::Display for BatchAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch stopped after {} statement(s): {}",
            self.completed.len(),
            self.cause
        )
    }
}

impl std::error::Error for BatchAbort {}

impl From<BatchAbort> for ClientError {
    fn from(abort: BatchAbort) -> Self {
        abort.cause
    }
}

/// Executes `statements` strictly in order.
///
/// `cancelled` is consulted before each statement; once it reports true no
/// further statement starts. The first failing statement also stops the
/// batch. Statements that already ran are not rolled back.
pub fn execute_batch<S, C>(
    conn: &mut dyn DriverConnection,
    statements: &[S],
    row_limit: usize,
    cancelled: C,
) -> std::result::Result<Vec<StatementResult>, BatchAbort>
where
    S: AsRef<str>,
    C: Fn() -> bool,
{
    let mut completed = Vec::with_capacity(statements.len());
    for (index, statement) in statements.iter().enumerate() {
        if cancelled() {
            info!("Batch cancelled before statement {}", index + 1);
            return Err(BatchAbort {
                completed,
                cause: ClientError::Interrupted,
            });
        }
        match execute(conn, statement.as_ref(), row_limit) {
            Ok(result) => completed.push(result),
            Err(cause) => {
                warn!("Batch failed at statement {}: {}", index + 1, cause);
                return Err(BatchAbort { completed, cause });
            }
        }
    }
    Ok(completed)
}

/// Represents different SQL statement types for introspection
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    /// CREATE, DROP and ALTER
    Ddl,
    /// BEGIN/COMMIT/ROLLBACK transaction commands
    Transaction,
    Other,
}

impl StatementType {
    /// Classifies a statement by its leading keyword.
    pub fn from_sql(sql: &str) -> Self {
        let keyword = sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_uppercase();
        match keyword.as_str() {
            "SELECT" | "WITH" | "VALUES" => StatementType::Select,
            "INSERT" | "REPLACE" => StatementType::Insert,
            "UPDATE" => StatementType::Update,
            "DELETE" => StatementType::Delete,
            "CREATE" | "DROP" | "ALTER" => StatementType::Ddl,
            "BEGIN" | "COMMIT" | "ROLLBACK" | "END" => StatementType::Transaction,
            _ => StatementType::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Response, ScriptedDriver};
    use crate::core::db::{Credentials, Driver};
    use std::cell::Cell;

    fn scripted(driver: &ScriptedDriver) -> Box<dyn DriverConnection> {
        driver
            .connect("scripted:test", &Credentials::default())
            .unwrap()
    }

    fn numbers(count: i64) -> Response {
        Response::rows(
            &["n", "label"],
            (0..count)
                .map(|i| vec![Value::Integer(i), Value::Text(format!("row {}", i))])
                .collect(),
        )
    }

    #[test]
    fn test_rows_keep_column_order_and_labels() {
        let driver = ScriptedDriver::new().respond("select", numbers(2));
        let mut conn = scripted(&driver);

        let result = execute(conn.as_mut(), "select", 10).unwrap();
        match result {
            StatementResult::Rows { columns, rows, truncated } => {
                assert_eq!(columns, vec!["n", "label"]);
                assert_eq!(rows.len(), 2);
                assert!(!truncated);
                assert_eq!(rows[1].columns().collect::<Vec<_>>(), vec!["n", "label"]);
                assert_eq!(rows[1].get("label"), Some(&Value::Text("row 1".into())));
            }
            other => panic!("Expected rows, got {:?}", other),
        }
    }

    #[test]
    fn test_truncation_closes_cursor() {
        let driver = ScriptedDriver::new().respond("select", numbers(5));
        let mut conn = scripted(&driver);

        let result = execute(conn.as_mut(), "select", 3).unwrap();
        assert_eq!(result.row_count(), Some(3));
        assert!(result.is_truncated());
        assert_eq!(driver.open_cursors(), 0);
    }

    #[test]
    fn test_exact_limit_is_not_truncated() {
        let driver = ScriptedDriver::new().respond("select", numbers(3));
        let mut conn = scripted(&driver);

        let result = execute(conn.as_mut(), "select", 3).unwrap();
        assert_eq!(result.row_count(), Some(3));
        assert!(!result.is_truncated());
    }

    #[test]
    fn test_zero_limit() {
        let driver = ScriptedDriver::new().respond("select", numbers(1));
        let mut conn = scripted(&driver);

        let result = execute(conn.as_mut(), "select", 0).unwrap();
        assert_eq!(result.row_count(), Some(0));
        assert!(result.is_truncated());
    }

    #[test]
    fn test_update_count_and_unknown_count() {
        let driver = ScriptedDriver::new()
            .respond("update t", Response::Updated(4))
            .respond("create t", Response::Updated(-1));
        let mut conn = scripted(&driver);

        assert_eq!(
            execute(conn.as_mut(), "update t", 10).unwrap(),
            StatementResult::UpdateCount(4)
        );
        assert_eq!(
            execute(conn.as_mut(), "  create t  ", 10).unwrap(),
            StatementResult::UpdateCount(-1)
        );
    }

    #[test]
    fn test_blank_statement_is_rejected() {
        let driver = ScriptedDriver::new();
        let mut conn = scripted(&driver);
        assert!(matches!(
            execute(conn.as_mut(), "   ", 10).unwrap_err(),
            ClientError::State(_)
        ));
        assert!(driver.executed().is_empty());
    }

    #[test]
    fn test_batch_stops_at_first_failure() {
        let driver = ScriptedDriver::new()
            .respond("one", Response::Updated(1))
            .respond("two", Response::fail("constraint violated", 19))
            .respond("three", Response::Updated(1));
        let mut conn = scripted(&driver);

        let abort = execute_batch(conn.as_mut(), &["one", "two", "three"], 10, || false).unwrap_err();
        assert_eq!(abort.completed, vec![StatementResult::UpdateCount(1)]);
        assert_eq!(abort.cause.vendor_code(), Some(19));
        assert!(!abort.is_cancelled());
        assert_eq!(driver.executed(), vec!["one", "two"]);
    }

    #[test]
    fn test_batch_cancellation_between_statements() {
        let driver = ScriptedDriver::new();
        let mut conn = scripted(&driver);
        let checks = Cell::new(0);

        let abort = execute_batch(conn.as_mut(), &["first", "second", "third"], 10, || {
            checks.set(checks.get() + 1);
            checks.get() > 1
        })
        .unwrap_err();

        assert!(abort.is_cancelled());
        assert_eq!(abort.completed.len(), 1);
        assert_eq!(driver.executed(), vec!["first"]);
    }

    #[test]
    fn test_batch_results_in_order() {
        let driver = ScriptedDriver::new()
            .respond("a", Response::Updated(1))
            .respond("b", numbers(1))
            .respond("c", Response::Updated(2));
        let mut conn = scripted(&driver);

        let results = execute_batch(conn.as_mut(), &["a", "b", "c"], 10, || false).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], StatementResult::UpdateCount(1));
        assert_eq!(results[1].row_count(), Some(1));
        assert_eq!(results[2], StatementResult::UpdateCount(2));
    }

    #[test]
    fn test_statement_type_classification() {
        assert_eq!(StatementType::from_sql("SELECT * FROM users"), StatementType::Select);
        assert_eq!(StatementType::from_sql("  with x as (select 1) select * from x"), StatementType::Select);
        assert_eq!(StatementType::from_sql("INSERT INTO users VALUES (1, 'test')"), StatementType::Insert);
        assert_eq!(StatementType::from_sql("UPDATE users SET name = 'new'"), StatementType::Update);
        assert_eq!(StatementType::from_sql("DELETE FROM users WHERE id = 1"), StatementType::Delete);
        assert_eq!(StatementType::from_sql("CREATE TABLE test (id INTEGER)"), StatementType::Ddl);
        assert_eq!(StatementType::from_sql("BEGIN"), StatementType::Transaction);
        assert_eq!(StatementType::from_sql("PRAGMA foreign_keys = ON"), StatementType::Other);
        assert_eq!(StatementType::from_sql(""), StatementType::Other);
    }
}
