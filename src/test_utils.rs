/// # Test Utilities Module
///
/// A scripted, in-memory driver for exercising the connection and execution
/// layers without a database:
/// - canned responses per statement text (rows, update counts, failures)
/// - a record of executed statements, connects and closes
/// - cursor accounting, to check cursors are released after early stops
/// - gates that park a statement until the test releases it
/// - statements that make the driver panic
use crate::core::db::{Credentials, Driver, DriverConnection, Execution, Fetch, RowSink, Value};
use crate::core::DriverError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

pub const SCRIPTED_PREFIX: &str = "scripted:";

/// Canned answer to one statement.
#[derive(Debug, Clone)]
pub enum Response {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Updated(i64),
    Fail(DriverError),
    /// The driver panics mid-statement.
    Panic(String),
}

impl Response {
    pub fn rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Response::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    pub fn fail(message: &str, vendor_code: i32) -> Self {
        Response::Fail(DriverError::with_code(message, vendor_code))
    }
}

/// Test-side ends of a statement gate.
pub struct Gate {
    /// Receives once the gated statement has started.
    pub started: Receiver<()>,
    /// Send (or drop) to let the gated statement finish.
    pub release: Sender<()>,
}

struct GateSlot {
    started: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

#[derive(Default)]
struct Script {
    responses: HashMap<String, Response>,
    gates: HashMap<String, GateSlot>,
    connect_error: Option<DriverError>,
    executed: Mutex<Vec<String>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    open_cursors: AtomicUsize,
}

/// Driver accepting `scripted:` locators.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    script: Arc<Script>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn script_mut(&mut self) -> &mut Script {
        Arc::get_mut(&mut self.script).expect("configure the driver before connecting")
    }

    /// Answers `sql` with `response`. Unscripted statements report `Updated(0)`.
    pub fn respond(mut self, sql: &str, response: Response) -> Self {
        self.script_mut()
            .responses
            .insert(sql.to_string(), response);
        self
    }

    /// Makes every connect attempt fail.
    pub fn refuse_connections(mut self, error: DriverError) -> Self {
        self.script_mut().connect_error = Some(error);
        self
    }

    /// Parks `sql` until the returned gate releases it.
    pub fn gate(mut self, sql: &str) -> (Self, Gate) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        self.script_mut().gates.insert(
            sql.to_string(),
            GateSlot {
                started: Mutex::new(started_tx),
                release: Mutex::new(release_rx),
            },
        );
        (
            self,
            Gate {
                started: started_rx,
                release: release_tx,
            },
        )
    }

    pub fn executed(&self) -> Vec<String> {
        self.script
            .executed
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn connects(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.script.closes.load(Ordering::SeqCst)
    }

    pub fn open_cursors(&self) -> usize {
        self.script.open_cursors.load(Ordering::SeqCst)
    }
}

impl Driver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn accepts(&self, locator: &str) -> bool {
        locator.starts_with(SCRIPTED_PREFIX)
    }

    fn connect(
        &self,
        _locator: &str,
        _credentials: &Credentials,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        if let Some(err) = &self.script.connect_error {
            return Err(err.clone());
        }
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            script: self.script.clone(),
        }))
    }
}

struct ScriptedConnection {
    script: Arc<Script>,
}

/// Counts as an open cursor until dropped.
struct Cursor<'a>(&'a AtomicUsize);

impl<'a> Cursor<'a> {
    fn open(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Cursor(counter)
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DriverConnection for ScriptedConnection {
    fn execute(&mut self, sql: &str, sink: &mut dyn RowSink) -> Result<Execution, DriverError> {
        if let Ok(mut executed) = self.script.executed.lock() {
            executed.push(sql.to_string());
        }

        if let Some(gate) = self.script.gates.get(sql) {
            if let Ok(started) = gate.started.lock() {
                let _ = started.send(());
            }
            if let Ok(release) = gate.release.lock() {
                let _ = release.recv();
            }
        }

        match self.script.responses.get(sql) {
            Some(Response::Rows { columns, rows }) => {
                let _cursor = Cursor::open(&self.script.open_cursors);
                sink.columns(columns.clone());
                for row in rows {
                    if sink.row(row.clone()) == Fetch::Stop {
                        break;
                    }
                }
                Ok(Execution::RowSet)
            }
            Some(Response::Updated(count)) => Ok(Execution::Updated(*count)),
            Some(Response::Fail(err)) => Err(err.clone()),
            Some(Response::Panic(message)) => panic!("{}", message),
            None => Ok(Execution::Updated(0)),
        }
    }

    fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
